use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::{CellId, SimilarityMetric};
use crate::error::KiraError;
use crate::similarity::{
    CancelToken, PreparedCell, SimilarPair, SimilarityOptions, SubsetMatrix, scan_pairs,
};

pub const MAX_ROWS_PER_BAND: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LshOptions {
    pub band_count: usize,
    pub row_count: usize,
    pub seed: u64,
}

impl Default for LshOptions {
    fn default() -> Self {
        Self {
            band_count: 16,
            row_count: 32,
            seed: 42,
        }
    }
}

impl LshOptions {
    pub fn validate(&self) -> Result<(), KiraError> {
        if self.band_count == 0 {
            return Err(KiraError::InvalidOption(
                "lsh band count must be at least 1".to_string(),
            ));
        }
        if self.row_count == 0 || self.row_count > MAX_ROWS_PER_BAND {
            return Err(KiraError::InvalidOption(format!(
                "lsh row count must be between 1 and {MAX_ROWS_PER_BAND}, got {}",
                self.row_count
            )));
        }
        Ok(())
    }

    pub fn validate_for(&self, metric: SimilarityMetric) -> Result<(), KiraError> {
        self.validate()?;
        if metric == SimilarityMetric::Jaccard {
            return Err(KiraError::InvalidOption(
                "lsh estimates cosine or pearson similarity, not jaccard".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bit_count(&self) -> usize {
        self.band_count * self.row_count
    }
}

#[derive(Debug, Clone)]
pub struct Hyperplanes {
    vectors: Vec<Vec<f64>>,
    sums: Vec<f64>,
}

impl Hyperplanes {
    pub fn generate(options: &LshOptions, gene_mask: &[bool]) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
        let vectors = (0..options.bit_count())
            .map(|_| {
                let mut vector = gene_mask
                    .iter()
                    .map(|kept| {
                        if *kept {
                            StandardNormal.sample(&mut rng)
                        } else {
                            0.0
                        }
                    })
                    .collect::<Vec<f64>>();
                let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
                if norm > 0.0 {
                    for x in &mut vector {
                        *x /= norm;
                    }
                }
                vector
            })
            .collect::<Vec<_>>();
        let sums = vectors.iter().map(|vector| vector.iter().sum()).collect();
        Self { vectors, sums }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Signatures {
    options: LshOptions,
    signatures: Vec<Option<Vec<u64>>>,
}

impl Signatures {
    pub fn compute(
        subset: &SubsetMatrix,
        metric: SimilarityMetric,
        options: &LshOptions,
    ) -> Result<Self, KiraError> {
        options.validate_for(metric)?;
        let planes = Hyperplanes::generate(options, subset.gene_mask());
        let gene_count = subset.gene_count() as f64;
        let signatures = subset
            .prepared()
            .par_iter()
            .map(|cell| signature(cell, metric, gene_count, &planes, options))
            .collect();
        Ok(Self {
            options: *options,
            signatures,
        })
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn signature(&self, i: usize) -> Option<&[u64]> {
        self.signatures.get(i)?.as_deref()
    }

    pub fn similarity(&self, i: usize, j: usize) -> f64 {
        let (Some(a), Some(b)) = (self.signature(i), self.signature(j)) else {
            return 0.0;
        };
        let differing: u32 = a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum();
        (PI * differing as f64 / self.options.bit_count() as f64).cos()
    }

    fn band_index(&self) -> Vec<HashMap<u64, Vec<usize>>> {
        let mut bands = vec![HashMap::<u64, Vec<usize>>::new(); self.options.band_count];
        for (cell, signature) in self.signatures.iter().enumerate() {
            let Some(signature) = signature else {
                continue;
            };
            for (band, key) in signature.iter().enumerate() {
                bands[band].entry(*key).or_default().push(cell);
            }
        }
        bands
    }
}

fn signature(
    cell: &PreparedCell,
    metric: SimilarityMetric,
    gene_count: f64,
    planes: &Hyperplanes,
    options: &LshOptions,
) -> Option<Vec<u64>> {
    // (x - mean) / sigma, expanded so only non-zero counts are visited.
    let (scale, offset) = match metric {
        SimilarityMetric::Pearson => {
            let variance = gene_count * cell.sum_sq - cell.sum * cell.sum;
            if variance <= 0.0 {
                return None;
            }
            let mean = cell.sum / gene_count;
            let sigma_inverse = 1.0 / (variance / (gene_count * gene_count)).sqrt();
            (sigma_inverse, -mean * sigma_inverse)
        }
        _ => {
            if cell.sum_sq <= 0.0 {
                return None;
            }
            (1.0, 0.0)
        }
    };

    let mut words = vec![0u64; options.band_count];
    for (bit, (vector, sum)) in planes.vectors.iter().zip(&planes.sums).enumerate() {
        let dot: f64 = cell
            .vector
            .entries()
            .iter()
            .map(|(gene, count)| *count as f64 * vector[*gene as usize])
            .sum();
        if scale * dot + offset * sum > 0.0 {
            words[bit / options.row_count] |= 1u64 << (bit % options.row_count);
        }
    }
    Some(words)
}

#[derive(Debug, Clone)]
pub struct LshScan {
    pub pairs: Vec<SimilarPair>,
    pub candidates_scored: usize,
}

pub fn find_lsh_pairs(
    subset: &SubsetMatrix,
    options: &SimilarityOptions,
    lsh: &LshOptions,
    cancel: &CancelToken,
) -> Result<LshScan, KiraError> {
    options.validate()?;
    let signatures = Signatures::compute(subset, options.metric, lsh)?;
    let bands = signatures.band_index();
    let scored = AtomicUsize::new(0);

    let candidates = |i: usize| {
        let mut partners = Vec::new();
        if let Some(signature) = signatures.signature(i) {
            for (band, key) in signature.iter().enumerate() {
                if let Some(bucket) = bands[band].get(key) {
                    let start = bucket.partition_point(|cell| *cell <= i);
                    partners.extend_from_slice(&bucket[start..]);
                }
            }
        }
        partners.sort_unstable();
        partners.dedup();
        scored.fetch_add(partners.len(), Ordering::Relaxed);
        partners
    };
    let pairs = scan_pairs(
        subset.cell_ids(),
        options,
        cancel,
        candidates,
        |i, j| signatures.similarity(i, j),
    )?;
    Ok(LshScan {
        pairs,
        candidates_scored: scored.into_inner(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LshComparison {
    pub cell_a: CellId,
    pub cell_b: CellId,
    pub exact: f64,
    pub approximate: f64,
}

pub fn compare_with_exact(
    subset: &SubsetMatrix,
    metric: SimilarityMetric,
    lsh: &LshOptions,
) -> Result<Vec<LshComparison>, KiraError> {
    let signatures = Signatures::compute(subset, metric, lsh)?;
    let n = subset.len();
    let cell_ids = subset.cell_ids();
    let rows = (0..n.saturating_sub(1))
        .into_par_iter()
        .map(|i| {
            (i + 1..n)
                .map(|j| LshComparison {
                    cell_a: cell_ids[i],
                    cell_b: cell_ids[j],
                    exact: subset.similarity(metric, i, j),
                    approximate: signatures.similarity(i, j),
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    Ok(rows.into_iter().flatten().collect())
}

use std::cmp::Ordering as RankOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::{ALL_CELLS, ALL_GENES, CellId, GeneId, SimilarityMetric};
use crate::error::KiraError;
use crate::matrix::{ExpressionMatrix, SparseVector};

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityOptions {
    pub metric: SimilarityMetric,
    pub gene_set: String,
    pub cell_set: String,
    pub threshold: Option<f64>,
    pub max_pairs_per_cell: Option<usize>,
    pub threads: Option<usize>,
}

impl Default for SimilarityOptions {
    fn default() -> Self {
        Self {
            metric: SimilarityMetric::Cosine,
            gene_set: ALL_GENES.to_string(),
            cell_set: ALL_CELLS.to_string(),
            threshold: None,
            max_pairs_per_cell: None,
            threads: None,
        }
    }
}

impl SimilarityOptions {
    pub fn validate(&self) -> Result<(), KiraError> {
        if let Some(threshold) = self.threshold {
            if !threshold.is_finite() || threshold > 1.0 {
                return Err(KiraError::InvalidOption(format!(
                    "threshold must be a number not above 1.0, got {threshold}"
                )));
            }
        }
        if self.max_pairs_per_cell == Some(0) {
            return Err(KiraError::InvalidOption(
                "max pairs per cell must be at least 1".to_string(),
            ));
        }
        if self.threads == Some(0) {
            return Err(KiraError::InvalidOption(
                "threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarPair {
    pub cell_a: CellId,
    pub cell_b: CellId,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub(crate) struct PreparedCell {
    pub(crate) vector: SparseVector,
    pub(crate) sum: f64,
    pub(crate) sum_sq: f64,
}

impl PreparedCell {
    fn new(vector: SparseVector) -> Self {
        let sum: f64 = vector.entries().iter().map(|(_, x)| *x as f64).sum();
        let sum_sq: f64 = vector
            .entries()
            .iter()
            .map(|(_, x)| (*x as f64).powi(2))
            .sum();
        Self {
            vector,
            sum,
            sum_sq,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubsetMatrix {
    cell_ids: Vec<CellId>,
    cells: Vec<PreparedCell>,
    gene_mask: Vec<bool>,
    gene_count: usize,
}

impl SubsetMatrix {
    pub fn new(
        matrix: &ExpressionMatrix,
        genes: &[GeneId],
        cells: &[CellId],
    ) -> Result<Self, KiraError> {
        if genes.is_empty() {
            return Err(KiraError::EmptyInput("gene set is empty".to_string()));
        }
        if cells.is_empty() {
            return Err(KiraError::EmptyInput("cell set is empty".to_string()));
        }

        let mut gene_mask = vec![false; matrix.gene_count()];
        for gene in genes {
            let slot = gene_mask.get_mut(*gene as usize).ok_or_else(|| {
                KiraError::DataIntegrity(format!("gene set references unknown gene {gene}"))
            })?;
            *slot = true;
        }
        let gene_count = gene_mask.iter().filter(|kept| **kept).count();

        let mut cell_ids = cells.to_vec();
        cell_ids.sort_unstable();
        cell_ids.dedup();

        let cells = cell_ids
            .iter()
            .map(|cell| {
                let vector = matrix.vector(*cell).ok_or_else(|| {
                    KiraError::DataIntegrity(format!("cell set references unknown cell {cell}"))
                })?;
                Ok(PreparedCell::new(vector.restrict(&gene_mask)))
            })
            .collect::<Result<Vec<_>, KiraError>>()?;

        Ok(Self {
            cell_ids,
            cells,
            gene_mask,
            gene_count,
        })
    }

    pub fn cell_ids(&self) -> &[CellId] {
        &self.cell_ids
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn gene_count(&self) -> usize {
        self.gene_count
    }

    pub fn pair_count(&self) -> usize {
        let n = self.cells.len();
        n * n.saturating_sub(1) / 2
    }

    pub(crate) fn gene_mask(&self) -> &[bool] {
        &self.gene_mask
    }

    pub(crate) fn prepared(&self) -> &[PreparedCell] {
        &self.cells
    }

    pub(crate) fn similarity(&self, metric: SimilarityMetric, i: usize, j: usize) -> f64 {
        score_prepared(metric, &self.cells[i], &self.cells[j], self.gene_count)
    }
}

pub fn cell_similarity(
    matrix: &ExpressionMatrix,
    metric: SimilarityMetric,
    a: CellId,
    b: CellId,
) -> Option<f64> {
    let a = PreparedCell::new(matrix.vector(a)?.clone());
    let b = PreparedCell::new(matrix.vector(b)?.clone());
    Some(score_prepared(metric, &a, &b, matrix.gene_count()))
}

fn score_prepared(
    metric: SimilarityMetric,
    a: &PreparedCell,
    b: &PreparedCell,
    gene_count: usize,
) -> f64 {
    let (dot, shared) = sparse_dot(a.vector.entries(), b.vector.entries());
    let score = match metric {
        SimilarityMetric::Cosine => {
            let denominator = (a.sum_sq * b.sum_sq).sqrt();
            if denominator > 0.0 {
                dot / denominator
            } else {
                0.0
            }
        }
        SimilarityMetric::Pearson => {
            let n = gene_count as f64;
            let var_a = n * a.sum_sq - a.sum * a.sum;
            let var_b = n * b.sum_sq - b.sum * b.sum;
            if var_a > 0.0 && var_b > 0.0 {
                (n * dot - a.sum * b.sum) / (var_a * var_b).sqrt()
            } else {
                0.0
            }
        }
        SimilarityMetric::Jaccard => {
            let union = a.vector.len() + b.vector.len() - shared;
            if union > 0 {
                shared as f64 / union as f64
            } else {
                0.0
            }
        }
    };
    if score.is_finite() {
        score.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

pub fn sparse_dot(a: &[(GeneId, f32)], b: &[(GeneId, f32)]) -> (f64, usize) {
    let (mut i, mut j) = (0, 0);
    let mut dot = 0.0;
    let mut shared = 0;
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            RankOrdering::Less => i += 1,
            RankOrdering::Greater => j += 1,
            RankOrdering::Equal => {
                dot += a[i].1 as f64 * b[j].1 as f64;
                shared += 1;
                i += 1;
                j += 1;
            }
        }
    }
    (dot, shared)
}

pub fn find_all_pairs(
    subset: &SubsetMatrix,
    options: &SimilarityOptions,
    cancel: &CancelToken,
) -> Result<Vec<SimilarPair>, KiraError> {
    let n = subset.len();
    scan_pairs(
        subset.cell_ids(),
        options,
        cancel,
        |i| i + 1..n,
        |i, j| subset.similarity(options.metric, i, j),
    )
}

// `candidates(i)` yields ascending subset positions above `i`; `score` is
// called once per candidate pair.
pub(crate) fn scan_pairs<C, I, S>(
    cell_ids: &[CellId],
    options: &SimilarityOptions,
    cancel: &CancelToken,
    candidates: C,
    score: S,
) -> Result<Vec<SimilarPair>, KiraError>
where
    C: Fn(usize) -> I + Sync,
    I: IntoIterator<Item = usize>,
    S: Fn(usize, usize) -> f64 + Sync,
{
    options.validate()?;
    let scan = || {
        let pairs = match options.max_pairs_per_cell {
            Some(k) => scan_capped(cell_ids, options, cancel, &candidates, &score, k),
            None => scan_rows(cell_ids, options, cancel, &candidates, &score),
        }?;
        if cancel.is_cancelled() {
            return Err(KiraError::Cancelled);
        }
        Ok(pairs)
    };
    match options.threads {
        Some(threads) => rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|err| KiraError::InvalidOption(err.to_string()))?
            .install(scan),
        None => scan(),
    }
}

fn stored_score(raw: f64, threshold: Option<f64>) -> Option<f32> {
    let score = raw as f32;
    match threshold {
        Some(threshold) if f64::from(score) <= threshold => None,
        _ => Some(score),
    }
}

struct Progress {
    done: AtomicUsize,
    total: usize,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            done: AtomicUsize::new(0),
            total,
        }
    }

    fn row_finished(&self) {
        let finished = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if finished % PROGRESS_EVERY == 0 {
            tracing::debug!(rows = finished, total = self.total, "similarity scan progress");
        }
    }
}

fn scan_rows<C, I, S>(
    cell_ids: &[CellId],
    options: &SimilarityOptions,
    cancel: &CancelToken,
    candidates: &C,
    score: &S,
) -> Result<Vec<SimilarPair>, KiraError>
where
    C: Fn(usize) -> I + Sync,
    I: IntoIterator<Item = usize>,
    S: Fn(usize, usize) -> f64 + Sync,
{
    let n = cell_ids.len();
    let progress = Progress::new(n);
    let rows = (0..n.saturating_sub(1))
        .into_par_iter()
        .map(|i| {
            if cancel.is_cancelled() {
                return Err(KiraError::Cancelled);
            }
            let row = candidates(i)
                .into_iter()
                .filter_map(|j| {
                    stored_score(score(i, j), options.threshold).map(|value| SimilarPair {
                        cell_a: cell_ids[i],
                        cell_b: cell_ids[j],
                        score: value,
                    })
                })
                .collect::<Vec<_>>();
            progress.row_finished();
            Ok(row)
        })
        .collect::<Result<Vec<_>, KiraError>>()?;
    Ok(rows.into_iter().flatten().collect())
}

fn scan_capped<C, I, S>(
    cell_ids: &[CellId],
    options: &SimilarityOptions,
    cancel: &CancelToken,
    candidates: &C,
    score: &S,
    k: usize,
) -> Result<Vec<SimilarPair>, KiraError>
where
    C: Fn(usize) -> I + Sync,
    I: IntoIterator<Item = usize>,
    S: Fn(usize, usize) -> f64 + Sync,
{
    let n = cell_ids.len();
    let rows = n.saturating_sub(1);
    let blocks = (rayon::current_num_threads() * 4).clamp(1, rows.max(1));
    let progress = Progress::new(n);
    let best = (0..blocks)
        .into_par_iter()
        .map(|block| {
            let mut best = BestPartners::new(n, k);
            for i in (block..rows).step_by(blocks) {
                if cancel.is_cancelled() {
                    return Err(KiraError::Cancelled);
                }
                for j in candidates(i) {
                    if let Some(value) = stored_score(score(i, j), options.threshold) {
                        best.offer(i, j, value);
                        best.offer(j, i, value);
                    }
                }
                progress.row_finished();
            }
            Ok(best)
        })
        .try_reduce(|| BestPartners::new(n, k), |a, b| Ok(a.merge(b)))?;
    Ok(best.into_pairs(cell_ids))
}

// A pair survives if it is among the best `k` of either cell.
struct BestPartners {
    k: usize,
    lists: Vec<Vec<(f32, usize)>>,
}

impl BestPartners {
    fn new(cell_count: usize, k: usize) -> Self {
        Self {
            k,
            lists: vec![Vec::new(); cell_count],
        }
    }

    fn offer(&mut self, cell: usize, partner: usize, score: f32) {
        let list = &mut self.lists[cell];
        let pos = list.partition_point(|&(kept, kept_partner)| match kept.total_cmp(&score) {
            RankOrdering::Greater => true,
            RankOrdering::Equal => kept_partner < partner,
            RankOrdering::Less => false,
        });
        if pos >= self.k {
            return;
        }
        list.insert(pos, (score, partner));
        list.truncate(self.k);
    }

    fn merge(mut self, other: Self) -> Self {
        for (cell, list) in other.lists.into_iter().enumerate() {
            for (score, partner) in list {
                self.offer(cell, partner, score);
            }
        }
        self
    }

    fn into_pairs(self, cell_ids: &[CellId]) -> Vec<SimilarPair> {
        let mut kept = self
            .lists
            .into_iter()
            .enumerate()
            .flat_map(|(cell, list)| {
                list.into_iter()
                    .map(move |(score, partner)| (cell.min(partner), cell.max(partner), score))
            })
            .collect::<Vec<_>>();
        kept.sort_by_key(|(a, b, _)| (*a, *b));
        kept.dedup_by_key(|(a, b, _)| (*a, *b));
        kept.into_iter()
            .map(|(a, b, score)| SimilarPair {
                cell_a: cell_ids[a],
                cell_b: cell_ids[b],
                score,
            })
            .collect()
    }
}

use std::fmt::Write as _;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::domain::{ALL_GENES, CellId, ObjectName, SimilarityMetric};
use crate::error::KiraError;
use crate::lsh::LshOptions;
use crate::matrix::ExpressionMatrix;
use crate::similarity::{SimilarPair, SimilarityOptions, cell_similarity};
use crate::store::{FORMAT_VERSION, now_timestamp, write_bytes_atomic};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarPairs {
    pub name: ObjectName,
    pub format_version: u32,
    pub created_at: String,
    pub metric: SimilarityMetric,
    pub gene_set: String,
    pub cell_set: String,
    pub threshold: Option<f64>,
    pub max_pairs_per_cell: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsh: Option<LshOptions>,
    pub cell_count: usize,
    pub pairs: Vec<SimilarPair>,
}

impl SimilarPairs {
    pub fn new(
        name: ObjectName,
        options: &SimilarityOptions,
        cell_count: usize,
        pairs: Vec<SimilarPair>,
    ) -> Self {
        Self {
            name,
            format_version: FORMAT_VERSION,
            created_at: now_timestamp(),
            metric: options.metric,
            gene_set: options.gene_set.clone(),
            cell_set: options.cell_set.clone(),
            threshold: options.threshold,
            max_pairs_per_cell: options.max_pairs_per_cell,
            lsh: None,
            cell_count,
            pairs,
        }
    }

    pub fn with_lsh(mut self, lsh: LshOptions) -> Self {
        self.lsh = Some(lsh);
        self
    }

    pub fn is_approximate(&self) -> bool {
        self.lsh.is_some()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn score(&self, a: CellId, b: CellId) -> Option<f32> {
        let key = if a < b { (a, b) } else { (b, a) };
        self.pairs
            .binary_search_by_key(&key, |pair| (pair.cell_a, pair.cell_b))
            .ok()
            .map(|pos| self.pairs[pos].score)
    }

    pub fn neighbors(&self, cell: CellId) -> Vec<(CellId, f32)> {
        let mut neighbors = self
            .pairs
            .iter()
            .filter_map(|pair| {
                if pair.cell_a == cell {
                    Some((pair.cell_b, pair.score))
                } else if pair.cell_b == cell {
                    Some((pair.cell_a, pair.score))
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();
        neighbors.sort_by(|x, y| y.1.total_cmp(&x.1).then(x.0.cmp(&y.0)));
        neighbors
    }

    pub fn to_csv(&self, matrix: &ExpressionMatrix) -> String {
        let with_exact = self.gene_set != ALL_GENES || self.is_approximate();
        let mut out = String::from("Cell0,Cell1,Similarity");
        if with_exact {
            out.push_str(",Exact AllGenes");
        }
        out.push('\n');
        for pair in &self.pairs {
            let a = matrix.cells().name(pair.cell_a).unwrap_or_default();
            let b = matrix.cells().name(pair.cell_b).unwrap_or_default();
            let _ = write!(out, "{},{},{}", csv_escape(a), csv_escape(b), pair.score);
            if with_exact {
                let exact = cell_similarity(matrix, self.metric, pair.cell_a, pair.cell_b)
                    .unwrap_or_default();
                let _ = write!(out, ",{}", exact as f32);
            }
            out.push('\n');
        }
        out
    }

    pub fn write_csv(&self, matrix: &ExpressionMatrix, path: &Utf8Path) -> Result<(), KiraError> {
        write_bytes_atomic(path, self.to_csv(matrix).as_bytes())
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SimilarPairs {
        SimilarPairs::new(
            "Exact".parse().unwrap(),
            &SimilarityOptions::default(),
            3,
            vec![
                SimilarPair { cell_a: 0, cell_b: 1, score: 0.5 },
                SimilarPair { cell_a: 0, cell_b: 2, score: 0.9 },
                SimilarPair { cell_a: 1, cell_b: 2, score: 0.1 },
            ],
        )
    }

    #[test]
    fn lookup_is_symmetric() {
        let pairs = sample();
        assert_eq!(pairs.score(2, 0), Some(0.9));
        assert_eq!(pairs.score(0, 2), Some(0.9));
        assert_eq!(pairs.score(1, 1), None);
    }

    #[test]
    fn neighbors_best_first() {
        let pairs = sample();
        assert_eq!(pairs.neighbors(0), vec![(2, 0.9), (1, 0.5)]);
        assert_eq!(pairs.neighbors(1), vec![(0, 0.5), (2, 0.1)]);
    }

    #[test]
    fn restricted_sets_export_exact_column() {
        let matrix = crate::similarity::tests::matrix("Gene,A,B\ng1,1,0\ng2,1,1\n");
        let options = SimilarityOptions {
            gene_set: "Second".to_string(),
            ..SimilarityOptions::default()
        };
        let pairs = SimilarPairs::new(
            "Subset".parse().unwrap(),
            &options,
            2,
            vec![SimilarPair { cell_a: 0, cell_b: 1, score: 1.0 }],
        );
        assert_eq!(
            pairs.to_csv(&matrix),
            format!("Cell0,Cell1,Similarity,Exact AllGenes\nA,B,1,{}\n", 0.5f64.sqrt() as f32)
        );

        let exact = SimilarPairs::new(
            "All".parse().unwrap(),
            &SimilarityOptions::default(),
            2,
            pairs.pairs.clone(),
        );
        assert_eq!(exact.to_csv(&matrix), "Cell0,Cell1,Similarity\nA,B,1\n");
        let estimated = exact.with_lsh(LshOptions::default());
        assert!(estimated.to_csv(&matrix).starts_with("Cell0,Cell1,Similarity,Exact AllGenes\n"));
    }

    #[test]
    fn escapes_csv_fields() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"x\""), "\"say \"\"x\"\"\"");
    }
}

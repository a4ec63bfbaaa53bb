use std::path::Path;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::{CellId, CellRef, GeneId, ObjectName};
use crate::error::KiraError;
use crate::lsh::{LshOptions, compare_with_exact, find_lsh_pairs};
use crate::matrix::{Cell, ExpressionMatrix};
use crate::pairs::SimilarPairs;
use crate::sets::{SetRegistry, SetSummary};
use crate::similarity::{CancelToken, SimilarityOptions, SubsetMatrix, find_all_pairs};
use crate::store::{Store, write_bytes_atomic};
use crate::table;

#[derive(Debug, Clone, Serialize)]
pub struct AddCellsResult {
    pub storage_dir: String,
    pub cell_count: usize,
    pub gene_count: usize,
    pub nonzero_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FindPairsResult {
    pub name: String,
    pub metric: String,
    pub gene_set: String,
    pub cell_set: String,
    pub cell_count: usize,
    pub pairs_scored: usize,
    pub pairs_stored: usize,
    pub path: String,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveResult {
    pub name: String,
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub name: String,
    pub path: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetResult {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Neighbor {
    pub id: CellId,
    pub name: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellResult {
    #[serde(flatten)]
    pub cell: Cell,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neighbors: Option<Vec<Neighbor>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub storage_dir: String,
    pub created_at: Option<String>,
    pub cell_count: usize,
    pub gene_count: usize,
    pub metadata_keys: Vec<String>,
    pub gene_sets: Vec<SetSummary>,
    pub cell_sets: Vec<SetSummary>,
    pub similar_pairs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug)]
pub struct App {
    store: Store,
    matrix: Option<ExpressionMatrix>,
    sets: SetRegistry,
}

impl App {
    pub fn open(dir: impl Into<Utf8PathBuf>) -> Result<Self, KiraError> {
        let store = Store::open(dir)?;
        let matrix = store.load_matrix()?;
        let sets = store.load_sets()?;
        if let Some(matrix) = &matrix {
            tracing::info!(
                dir = %store.root(),
                cells = matrix.cell_count(),
                genes = matrix.gene_count(),
                "attached expression matrix"
            );
        }
        Ok(Self {
            store,
            matrix,
            sets,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn matrix(&self) -> Option<&ExpressionMatrix> {
        self.matrix.as_ref()
    }

    pub fn cell_count(&self) -> usize {
        self.matrix.as_ref().map_or(0, ExpressionMatrix::cell_count)
    }

    pub fn gene_count(&self) -> usize {
        self.matrix.as_ref().map_or(0, ExpressionMatrix::gene_count)
    }

    pub fn add_cells(
        &mut self,
        counts_path: &Path,
        metadata_path: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<AddCellsResult, KiraError> {
        if let Some(matrix) = &self.matrix {
            return Err(KiraError::StoreNotEmpty(matrix.cell_count()));
        }
        let start = Instant::now();

        sink.event(ProgressEvent {
            message: format!("phase=Parse; reading {}", counts_path.display()),
            elapsed: None,
        });
        let counts = table::read_counts(counts_path)?;
        sink.event(ProgressEvent {
            message: format!("phase=Parse; reading {}", metadata_path.display()),
            elapsed: Some(start.elapsed()),
        });
        let metadata = table::read_metadata(metadata_path)?;

        sink.event(ProgressEvent {
            message: "phase=Verify; checking cell names".to_string(),
            elapsed: Some(start.elapsed()),
        });
        let matrix = ExpressionMatrix::from_tables(
            &counts,
            &counts_path.display().to_string(),
            &metadata,
            &metadata_path.display().to_string(),
        )?;

        sink.event(ProgressEvent {
            message: "phase=Store; writing matrix".to_string(),
            elapsed: Some(start.elapsed()),
        });
        self.store.write_matrix(&matrix)?;

        let nonzero_entries = matrix.vectors().iter().map(|vector| vector.len()).sum();
        tracing::info!(
            cells = matrix.cell_count(),
            genes = matrix.gene_count(),
            nonzero = nonzero_entries,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "ingested cells"
        );
        let result = AddCellsResult {
            storage_dir: self.store.root().to_string(),
            cell_count: matrix.cell_count(),
            gene_count: matrix.gene_count(),
            nonzero_entries,
        };
        self.matrix = Some(matrix);
        Ok(result)
    }

    pub fn find_similar_pairs0(
        &self,
        name: &str,
        options: &SimilarityOptions,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<FindPairsResult, KiraError> {
        let (name, subset) = self.prepare_scan(name, options)?;

        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Score; {} pairs over {} cells, metric {}",
                subset.pair_count(),
                subset.len(),
                options.metric
            ),
            elapsed: None,
        });
        tracing::info!(
            name = %name,
            cells = subset.len(),
            genes = subset.gene_count(),
            pairs = subset.pair_count(),
            "begin computing similarities for all cell pairs"
        );
        let pairs = find_all_pairs(&subset, options, cancel)?;
        let elapsed = start.elapsed();
        if subset.pair_count() > 0 {
            tracing::info!(
                elapsed_ms = elapsed.as_millis() as u64,
                per_pair_ns = elapsed.as_nanos() as u64 / subset.pair_count() as u64,
                "finished all-pairs scan"
            );
        }

        let stored = SimilarPairs::new(name, options, subset.len(), pairs);
        self.store_pairs(stored, options, subset.pair_count(), elapsed, sink)
    }

    pub fn find_similar_pairs_lsh(
        &self,
        name: &str,
        options: &SimilarityOptions,
        lsh: &LshOptions,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<FindPairsResult, KiraError> {
        lsh.validate_for(options.metric)?;
        let (name, subset) = self.prepare_scan(name, options)?;

        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Score; lsh signatures of {} bits over {} cells, metric {}",
                lsh.bit_count(),
                subset.len(),
                options.metric
            ),
            elapsed: None,
        });
        let scan = find_lsh_pairs(&subset, options, lsh, cancel)?;
        let elapsed = start.elapsed();
        tracing::info!(
            name = %name,
            candidates = scan.candidates_scored,
            pairs = subset.pair_count(),
            elapsed_ms = elapsed.as_millis() as u64,
            "finished lsh scan"
        );

        let stored = SimilarPairs::new(name, options, subset.len(), scan.pairs).with_lsh(*lsh);
        self.store_pairs(stored, options, scan.candidates_scored, elapsed, sink)
    }

    pub fn write_lsh_comparison_csv(
        &self,
        options: &SimilarityOptions,
        lsh: &LshOptions,
        path: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<ExportResult, KiraError> {
        options.validate()?;
        lsh.validate_for(options.metric)?;
        let matrix = self.require_matrix()?;
        let subset = self.subset(matrix, options)?;
        let rows = compare_with_exact(&subset, options.metric, lsh)?;

        sink.event(ProgressEvent {
            message: format!("phase=Store; writing {path}"),
            elapsed: None,
        });
        let mut out = String::from("Cell0,Cell1,Exact,LSH,Delta\n");
        for row in &rows {
            let a = matrix.cells().name(row.cell_a).unwrap_or_default();
            let b = matrix.cells().name(row.cell_b).unwrap_or_default();
            out.push_str(&format!(
                "{a},{b},{},{},{}\n",
                row.exact as f32,
                row.approximate as f32,
                (row.approximate - row.exact) as f32
            ));
        }
        write_bytes_atomic(path, out.as_bytes())?;
        Ok(ExportResult {
            name: format!("lsh-{}x{}", lsh.band_count, lsh.row_count),
            path: path.to_string(),
            rows: rows.len(),
        })
    }

    fn prepare_scan(
        &self,
        name: &str,
        options: &SimilarityOptions,
    ) -> Result<(ObjectName, SubsetMatrix), KiraError> {
        let name: ObjectName = name.parse()?;
        options.validate()?;
        if self.store.similar_pairs_exist(&name) {
            return Err(KiraError::SimilarPairsExists(name.to_string()));
        }
        let matrix = self.require_matrix()?;
        Ok((name, self.subset(matrix, options)?))
    }

    fn subset(
        &self,
        matrix: &ExpressionMatrix,
        options: &SimilarityOptions,
    ) -> Result<SubsetMatrix, KiraError> {
        let genes = self.sets.resolve_gene_set(&options.gene_set, matrix)?;
        let cells = self.sets.resolve_cell_set(&options.cell_set, matrix)?;
        SubsetMatrix::new(matrix, &genes, &cells)
    }

    fn store_pairs(
        &self,
        stored: SimilarPairs,
        options: &SimilarityOptions,
        pairs_scored: usize,
        elapsed: Duration,
        sink: &dyn ProgressSink,
    ) -> Result<FindPairsResult, KiraError> {
        sink.event(ProgressEvent {
            message: "phase=Store; writing similar pairs".to_string(),
            elapsed: Some(elapsed),
        });
        let path = self.store.write_similar_pairs(&stored)?;
        Ok(FindPairsResult {
            name: stored.name.to_string(),
            metric: options.metric.to_string(),
            gene_set: options.gene_set.clone(),
            cell_set: options.cell_set.clone(),
            cell_count: stored.cell_count,
            pairs_scored,
            pairs_stored: stored.len(),
            path: path.to_string(),
            elapsed_ms: elapsed.as_millis(),
        })
    }

    pub fn similar_pairs(&self, name: &str) -> Result<SimilarPairs, KiraError> {
        let name: ObjectName = name.parse()?;
        self.store.load_similar_pairs(&name)
    }

    pub fn list_similar_pairs(&self) -> Result<Vec<String>, KiraError> {
        self.store.list_similar_pairs()
    }

    pub fn remove_similar_pairs(
        &self,
        name: &str,
        sink: &dyn ProgressSink,
    ) -> Result<RemoveResult, KiraError> {
        let name: ObjectName = name.parse()?;
        sink.event(ProgressEvent {
            message: format!("phase=Store; removing similar pairs {name}"),
            elapsed: None,
        });
        self.store.remove_similar_pairs(&name)?;
        Ok(RemoveResult {
            name: name.to_string(),
            removed: true,
        })
    }

    pub fn write_similar_pairs_csv(
        &self,
        name: &str,
        path: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<ExportResult, KiraError> {
        let matrix = self.require_matrix()?;
        let pairs = self.similar_pairs(name)?;
        sink.event(ProgressEvent {
            message: format!("phase=Store; writing {path}"),
            elapsed: None,
        });
        pairs.write_csv(matrix, path)?;
        Ok(ExportResult {
            name: pairs.name.to_string(),
            path: path.to_string(),
            rows: pairs.len(),
        })
    }

    pub fn create_gene_set(
        &mut self,
        name: &str,
        pattern: &str,
        sink: &dyn ProgressSink,
    ) -> Result<SetResult, KiraError> {
        let name: ObjectName = name.parse()?;
        let matrix = self.matrix.as_ref().ok_or_else(no_cells)?;
        let mut sets = self.sets.clone();
        let size = sets.create_gene_set(&name, pattern, matrix)?;
        sink.event(ProgressEvent {
            message: format!("phase=Store; gene set {name} with {size} genes"),
            elapsed: None,
        });
        self.store.write_sets(&sets)?;
        self.sets = sets;
        Ok(SetResult {
            name: name.to_string(),
            size,
        })
    }

    pub fn create_cell_set(
        &mut self,
        name: &str,
        key: &str,
        pattern: &str,
        sink: &dyn ProgressSink,
    ) -> Result<SetResult, KiraError> {
        let name: ObjectName = name.parse()?;
        let matrix = self.matrix.as_ref().ok_or_else(no_cells)?;
        let mut sets = self.sets.clone();
        let size = sets.create_cell_set(&name, key, pattern, matrix)?;
        sink.event(ProgressEvent {
            message: format!("phase=Store; cell set {name} with {size} cells"),
            elapsed: None,
        });
        self.store.write_sets(&sets)?;
        self.sets = sets;
        Ok(SetResult {
            name: name.to_string(),
            size,
        })
    }

    pub fn cell(&self, cell: &CellRef) -> Result<Cell, KiraError> {
        let matrix = self.require_matrix()?;
        let found = match cell {
            CellRef::Id(id) => matrix.cell(*id),
            CellRef::Name(name) => matrix.cell_by_name(name),
        };
        found.ok_or_else(|| {
            KiraError::CellNotFound(match cell {
                CellRef::Id(id) => id.to_string(),
                CellRef::Name(name) => name.clone(),
            })
        })
    }

    pub fn neighbors(&self, name: &str, cell: &CellRef) -> Result<Vec<Neighbor>, KiraError> {
        let matrix = self.require_matrix()?;
        let cell = self.cell(cell)?;
        let pairs = self.similar_pairs(name)?;
        Ok(pairs
            .neighbors(cell.id)
            .into_iter()
            .map(|(id, score)| Neighbor {
                id,
                name: matrix.cells().name(id).unwrap_or_default().to_string(),
                score,
            })
            .collect())
    }

    pub fn gene_id(&self, name: &str) -> Option<GeneId> {
        self.matrix.as_ref()?.genes().id(name)
    }

    pub fn gene_name(&self, id: GeneId) -> Option<&str> {
        self.matrix.as_ref()?.genes().name(id)
    }

    pub fn info(&self) -> Result<InfoResult, KiraError> {
        let created_at = if self.store.is_initialized() {
            Some(self.store.read_manifest()?.created_at)
        } else {
            None
        };
        let (metadata_keys, gene_sets, cell_sets) = match &self.matrix {
            Some(matrix) => (
                matrix.metadata().keys.clone(),
                self.sets.gene_set_summaries(matrix),
                self.sets.cell_set_summaries(matrix),
            ),
            None => (Vec::new(), Vec::new(), Vec::new()),
        };
        Ok(InfoResult {
            storage_dir: self.store.root().to_string(),
            created_at,
            cell_count: self.cell_count(),
            gene_count: self.gene_count(),
            metadata_keys,
            gene_sets,
            cell_sets,
            similar_pairs: self.store.list_similar_pairs()?,
        })
    }

    fn require_matrix(&self) -> Result<&ExpressionMatrix, KiraError> {
        self.matrix.as_ref().ok_or_else(no_cells)
    }
}

fn no_cells() -> KiraError {
    KiraError::EmptyInput("no cells have been ingested".to_string())
}

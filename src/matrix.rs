use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{CellId, GeneId};
use crate::error::KiraError;
use crate::table::{CountsTable, MetadataTable};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dictionary {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl Dictionary {
    pub fn from_names(names: Vec<String>) -> Result<Self, KiraError> {
        let mut dictionary = Self::default();
        for name in names {
            if dictionary.insert_new(&name).is_none() {
                return Err(KiraError::IncompatibleStore(format!(
                    "duplicate dictionary entry {name}"
                )));
            }
        }
        Ok(dictionary)
    }

    pub fn insert_new(&mut self, name: &str) -> Option<u32> {
        if self.index.contains_key(name) {
            return None;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        Some(id)
    }

    pub fn id(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SparseVector {
    entries: Vec<(GeneId, f32)>,
}

impl SparseVector {
    pub fn from_entries(mut entries: Vec<(GeneId, f32)>) -> Self {
        entries.retain(|(_, count)| *count != 0.0);
        entries.sort_by_key(|(gene, _)| *gene);
        entries.dedup_by_key(|(gene, _)| *gene);
        Self { entries }
    }

    pub fn entries(&self) -> &[(GeneId, f32)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, gene: GeneId) -> f32 {
        self.entries
            .binary_search_by_key(&gene, |(id, _)| *id)
            .map(|pos| self.entries[pos].1)
            .unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.entries.iter().map(|(_, count)| *count as f64).sum()
    }

    pub fn restrict(&self, keep: &[bool]) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .copied()
                .filter(|(gene, _)| keep.get(*gene as usize).copied().unwrap_or(false))
                .collect(),
        }
    }

    fn is_well_formed(&self, gene_count: usize) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].0 < pair[1].0)
            && self
                .entries
                .iter()
                .all(|(gene, count)| (*gene as usize) < gene_count && count.is_finite() && *count > 0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataIndex {
    pub keys: Vec<String>,
    pub values: Vec<Vec<String>>,
}

impl MetadataIndex {
    pub fn key_position(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|candidate| candidate == key)
    }

    pub fn value(&self, cell: CellId, key: &str) -> Option<&str> {
        let column = self.key_position(key)?;
        self.values
            .get(cell as usize)
            .and_then(|row| row.get(column))
            .map(String::as_str)
    }

    pub fn row(&self, cell: CellId) -> Vec<(String, String)> {
        let Some(row) = self.values.get(cell as usize) else {
            return Vec::new();
        };
        self.keys.iter().cloned().zip(row.iter().cloned()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    pub id: CellId,
    pub name: String,
    pub metadata: Vec<(String, String)>,
    pub expressed_genes: usize,
    pub total_count: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionMatrix {
    genes: Dictionary,
    cells: Dictionary,
    metadata: MetadataIndex,
    vectors: Vec<SparseVector>,
}

impl ExpressionMatrix {
    pub fn from_parts(
        genes: Dictionary,
        cells: Dictionary,
        metadata: MetadataIndex,
        vectors: Vec<SparseVector>,
    ) -> Result<Self, KiraError> {
        if vectors.len() != cells.len() {
            return Err(KiraError::IncompatibleStore(format!(
                "matrix has {} rows for {} cells",
                vectors.len(),
                cells.len()
            )));
        }
        if metadata.values.len() != cells.len()
            || metadata
                .values
                .iter()
                .any(|row| row.len() != metadata.keys.len())
        {
            return Err(KiraError::IncompatibleStore(
                "metadata table does not match cell dictionary".to_string(),
            ));
        }
        if let Some(cell) = vectors
            .iter()
            .position(|vector| !vector.is_well_formed(genes.len()))
        {
            return Err(KiraError::IncompatibleStore(format!(
                "malformed expression vector for cell {cell}"
            )));
        }
        Ok(Self {
            genes,
            cells,
            metadata,
            vectors,
        })
    }

    pub fn from_tables(
        counts: &CountsTable,
        counts_file: &str,
        metadata: &MetadataTable,
        metadata_file: &str,
    ) -> Result<Self, KiraError> {
        let mut cells = Dictionary::default();
        for name in &counts.cell_names {
            if cells.insert_new(name).is_none() {
                return Err(KiraError::DataIntegrity(format!(
                    "duplicate cell name {name} in {counts_file} header"
                )));
            }
        }

        let mut rows: Vec<Option<Vec<String>>> = vec![None; cells.len()];
        for row in &metadata.rows {
            let Some(cell) = cells.id(&row.cell) else {
                return Err(KiraError::DataIntegrity(format!(
                    "cell {} in {metadata_file} line {} is missing from {counts_file}",
                    row.cell, row.line
                )));
            };
            let slot = &mut rows[cell as usize];
            if slot.is_some() {
                return Err(KiraError::DataIntegrity(format!(
                    "duplicate cell name {} in {metadata_file} line {}",
                    row.cell, row.line
                )));
            }
            *slot = Some(row.values.clone());
        }
        let values = rows
            .into_iter()
            .enumerate()
            .map(|(cell, row)| {
                row.ok_or_else(|| {
                    KiraError::DataIntegrity(format!(
                        "cell {} in {counts_file} has no row in {metadata_file}",
                        cells.name(cell as u32).unwrap_or_default()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut genes = Dictionary::default();
        let mut entries: Vec<Vec<(GeneId, f32)>> = vec![Vec::new(); cells.len()];
        for row in &counts.rows {
            let Some(gene) = genes.insert_new(&row.gene) else {
                return Err(KiraError::DataIntegrity(format!(
                    "duplicate gene {} in {counts_file} line {}",
                    row.gene, row.line
                )));
            };
            for (cell, count) in row.counts.iter().enumerate() {
                if *count != 0.0 {
                    entries[cell].push((gene, *count));
                }
            }
        }

        // Gene ids follow row order, so every vector is already sorted.
        let vectors = entries
            .into_iter()
            .map(|entries| SparseVector { entries })
            .collect();

        Ok(Self {
            genes,
            cells,
            metadata: MetadataIndex {
                keys: metadata.keys.clone(),
                values,
            },
            vectors,
        })
    }

    pub fn genes(&self) -> &Dictionary {
        &self.genes
    }

    pub fn cells(&self) -> &Dictionary {
        &self.cells
    }

    pub fn metadata(&self) -> &MetadataIndex {
        &self.metadata
    }

    pub fn vectors(&self) -> &[SparseVector] {
        &self.vectors
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn gene_count(&self) -> usize {
        self.genes.len()
    }

    pub fn vector(&self, cell: CellId) -> Option<&SparseVector> {
        self.vectors.get(cell as usize)
    }

    pub fn cell(&self, id: CellId) -> Option<Cell> {
        let name = self.cells.name(id)?;
        let vector = &self.vectors[id as usize];
        Some(Cell {
            id,
            name: name.to_string(),
            metadata: self.metadata.row(id),
            expressed_genes: vector.len(),
            total_count: vector.total(),
        })
    }

    pub fn cell_by_name(&self, name: &str) -> Option<Cell> {
        self.cells.id(name).and_then(|id| self.cell(id))
    }
}

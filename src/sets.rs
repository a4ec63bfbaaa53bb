use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{ALL_CELLS, ALL_GENES, CellId, GeneId, ObjectName};
use crate::error::KiraError;
use crate::matrix::ExpressionMatrix;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetRegistry {
    #[serde(default)]
    pub gene_sets: BTreeMap<String, Vec<GeneId>>,
    #[serde(default)]
    pub cell_sets: BTreeMap<String, Vec<CellId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetSummary {
    pub name: String,
    pub size: usize,
}

impl SetRegistry {
    pub fn resolve_gene_set(
        &self,
        name: &str,
        matrix: &ExpressionMatrix,
    ) -> Result<Vec<GeneId>, KiraError> {
        if name == ALL_GENES {
            return Ok((0..matrix.gene_count() as GeneId).collect());
        }
        self.gene_sets
            .get(name)
            .cloned()
            .ok_or_else(|| KiraError::GeneSetNotFound(name.to_string()))
    }

    pub fn resolve_cell_set(
        &self,
        name: &str,
        matrix: &ExpressionMatrix,
    ) -> Result<Vec<CellId>, KiraError> {
        if name == ALL_CELLS {
            return Ok((0..matrix.cell_count() as CellId).collect());
        }
        self.cell_sets
            .get(name)
            .cloned()
            .ok_or_else(|| KiraError::CellSetNotFound(name.to_string()))
    }

    pub fn create_gene_set(
        &mut self,
        name: &ObjectName,
        pattern: &str,
        matrix: &ExpressionMatrix,
    ) -> Result<usize, KiraError> {
        if name.as_str() == ALL_GENES || self.gene_sets.contains_key(name.as_str()) {
            return Err(KiraError::SetExists(name.to_string()));
        }
        let regex = full_match_regex(pattern)?;
        let genes = matrix
            .genes()
            .names()
            .iter()
            .enumerate()
            .filter(|(_, gene)| regex.is_match(gene))
            .map(|(id, _)| id as GeneId)
            .collect::<Vec<_>>();
        let size = genes.len();
        self.gene_sets.insert(name.to_string(), genes);
        Ok(size)
    }

    pub fn create_cell_set(
        &mut self,
        name: &ObjectName,
        key: &str,
        pattern: &str,
        matrix: &ExpressionMatrix,
    ) -> Result<usize, KiraError> {
        if name.as_str() == ALL_CELLS || self.cell_sets.contains_key(name.as_str()) {
            return Err(KiraError::SetExists(name.to_string()));
        }
        let column = matrix
            .metadata()
            .key_position(key)
            .ok_or_else(|| KiraError::UnknownMetadataKey(key.to_string()))?;
        let regex = full_match_regex(pattern)?;
        let cells = matrix
            .metadata()
            .values
            .iter()
            .enumerate()
            .filter(|(_, row)| row.get(column).is_some_and(|value| regex.is_match(value)))
            .map(|(id, _)| id as CellId)
            .collect::<Vec<_>>();
        let size = cells.len();
        self.cell_sets.insert(name.to_string(), cells);
        Ok(size)
    }

    pub fn gene_set_summaries(&self, matrix: &ExpressionMatrix) -> Vec<SetSummary> {
        summaries(ALL_GENES, matrix.gene_count(), &self.gene_sets)
    }

    pub fn cell_set_summaries(&self, matrix: &ExpressionMatrix) -> Vec<SetSummary> {
        summaries(ALL_CELLS, matrix.cell_count(), &self.cell_sets)
    }
}

fn summaries<T>(builtin: &str, builtin_size: usize, sets: &BTreeMap<String, Vec<T>>) -> Vec<SetSummary> {
    std::iter::once(SetSummary {
        name: builtin.to_string(),
        size: builtin_size,
    })
    .chain(sets.iter().map(|(name, members)| SetSummary {
        name: name.clone(),
        size: members.len(),
    }))
    .collect()
}

fn full_match_regex(pattern: &str) -> Result<Regex, KiraError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|err| KiraError::InvalidPattern(format!("{pattern}: {err}")))
}

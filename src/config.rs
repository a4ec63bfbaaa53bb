use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::SimilarityMetric;
use crate::error::KiraError;
use crate::lsh::LshOptions;
use crate::similarity::SimilarityOptions;

pub const CONFIG_FILE: &str = "kira-em.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub storage_dir: Option<String>,
    #[serde(default)]
    pub similarity: Option<SimilarityEntry>,
    #[serde(default)]
    pub lsh: Option<LshEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SimilarityEntry {
    #[serde(default)]
    pub metric: Option<SimilarityMetric>,
    #[serde(default)]
    pub gene_set: Option<String>,
    #[serde(default)]
    pub cell_set: Option<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub max_pairs_per_cell: Option<usize>,
    #[serde(default)]
    pub threads: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LshEntry {
    #[serde(default)]
    pub band_count: Option<usize>,
    #[serde(default)]
    pub row_count: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub storage_dir: Utf8PathBuf,
    pub similarity: SimilarityOptions,
    pub lsh: LshOptions,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(KiraError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let storage_dir = config
            .storage_dir
            .map(Utf8PathBuf::from)
            .unwrap_or_else(default_storage_dir);

        let defaults = SimilarityOptions::default();
        let similarity = match config.similarity {
            Some(entry) => SimilarityOptions {
                metric: entry.metric.unwrap_or(defaults.metric),
                gene_set: entry.gene_set.unwrap_or(defaults.gene_set),
                cell_set: entry.cell_set.unwrap_or(defaults.cell_set),
                threshold: entry.threshold,
                max_pairs_per_cell: entry.max_pairs_per_cell,
                threads: entry.threads,
            },
            None => defaults,
        };
        similarity
            .validate()
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        let lsh_defaults = LshOptions::default();
        let lsh = match config.lsh {
            Some(entry) => LshOptions {
                band_count: entry.band_count.unwrap_or(lsh_defaults.band_count),
                row_count: entry.row_count.unwrap_or(lsh_defaults.row_count),
                seed: entry.seed.unwrap_or(lsh_defaults.seed),
            },
            None => lsh_defaults,
        };
        lsh.validate()
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Ok(ResolvedConfig {
            schema_version,
            storage_dir,
            similarity,
            lsh,
        })
    }
}

pub fn default_storage_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("data")
}

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::ObjectName;
use crate::error::KiraError;
use crate::matrix::{Dictionary, ExpressionMatrix, MetadataIndex, SparseVector};
use crate::pairs::SimilarPairs;
use crate::sets::SetRegistry;

pub const FORMAT_VERSION: u32 = 1;

const LOCK_FILE: &str = ".lock";
const MANIFEST_FILE: &str = "manifest.json";
const GENES_FILE: &str = "genes.json";
const CELLS_FILE: &str = "cells.json";
const METADATA_FILE: &str = "metadata.json";
const MATRIX_FILE: &str = "matrix.json.gz";
const SETS_FILE: &str = "sets.json";
const PAIRS_DIR: &str = "similar-pairs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub created_at: String,
    pub cell_count: usize,
    pub gene_count: usize,
    pub tool: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MatrixFile {
    gene_count: usize,
    cells: Vec<SparseVector>,
}

#[derive(Debug)]
pub struct Store {
    root: Utf8PathBuf,
    _lock: File,
}

impl Store {
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, KiraError> {
        let root = root.into();
        fs::create_dir_all(root.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("create {root}: {err}")))?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(LOCK_FILE).as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("open lock in {root}: {err}")))?;
        if let Err(err) = lock.try_lock_exclusive() {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(KiraError::StoreLocked(root.to_string()));
            }
            return Err(KiraError::Filesystem(err.to_string()));
        }

        let store = Self { root, _lock: lock };
        if store.manifest_path().as_std_path().exists() {
            store.read_manifest()?;
        } else if store.has_foreign_entries()? {
            return Err(KiraError::IncompatibleStore(format!(
                "{} is not empty and has no {MANIFEST_FILE}",
                store.root
            )));
        }
        Ok(store)
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn genes_path(&self) -> Utf8PathBuf {
        self.root.join(GENES_FILE)
    }

    pub fn cells_path(&self) -> Utf8PathBuf {
        self.root.join(CELLS_FILE)
    }

    pub fn metadata_path(&self) -> Utf8PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn matrix_path(&self) -> Utf8PathBuf {
        self.root.join(MATRIX_FILE)
    }

    pub fn sets_path(&self) -> Utf8PathBuf {
        self.root.join(SETS_FILE)
    }

    pub fn pairs_dir(&self) -> Utf8PathBuf {
        self.root.join(PAIRS_DIR)
    }

    pub fn pairs_path(&self, name: &ObjectName) -> Utf8PathBuf {
        self.pairs_dir().join(format!("{name}.json.gz"))
    }

    pub fn is_initialized(&self) -> bool {
        self.manifest_path().as_std_path().exists()
    }

    pub fn read_manifest(&self) -> Result<Manifest, KiraError> {
        let manifest: Manifest = read_json(&self.manifest_path())?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(KiraError::IncompatibleStore(format!(
                "format version {} is not supported (expected {FORMAT_VERSION})",
                manifest.format_version
            )));
        }
        Ok(manifest)
    }

    pub fn write_matrix(&self, matrix: &ExpressionMatrix) -> Result<Manifest, KiraError> {
        write_json(&self.genes_path(), &matrix.genes().names())?;
        write_json(&self.cells_path(), &matrix.cells().names())?;
        write_json(&self.metadata_path(), matrix.metadata())?;
        let body = MatrixFile {
            gene_count: matrix.gene_count(),
            cells: matrix.vectors().to_vec(),
        };
        write_gzip_json(&self.matrix_path(), &body)?;

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            created_at: now_timestamp(),
            cell_count: matrix.cell_count(),
            gene_count: matrix.gene_count(),
            tool: format!("kira-em/{}", env!("CARGO_PKG_VERSION")),
        };
        write_json(&self.manifest_path(), &manifest)?;
        Ok(manifest)
    }

    pub fn load_matrix(&self) -> Result<Option<ExpressionMatrix>, KiraError> {
        if !self.is_initialized() {
            return Ok(None);
        }
        let manifest = self.read_manifest()?;
        let genes = Dictionary::from_names(read_json(&self.genes_path())?)?;
        let cells = Dictionary::from_names(read_json(&self.cells_path())?)?;
        let metadata: MetadataIndex = read_json(&self.metadata_path())?;
        let body: MatrixFile = read_gzip_json(&self.matrix_path())?;
        if body.gene_count != genes.len()
            || manifest.gene_count != genes.len()
            || manifest.cell_count != cells.len()
        {
            return Err(KiraError::IncompatibleStore(format!(
                "manifest counts do not match stored dictionaries in {}",
                self.root
            )));
        }
        ExpressionMatrix::from_parts(genes, cells, metadata, body.cells).map(Some)
    }

    pub fn load_sets(&self) -> Result<SetRegistry, KiraError> {
        let path = self.sets_path();
        if !path.as_std_path().exists() {
            return Ok(SetRegistry::default());
        }
        read_json(&path)
    }

    pub fn write_sets(&self, sets: &SetRegistry) -> Result<(), KiraError> {
        write_json(&self.sets_path(), sets)
    }

    pub fn similar_pairs_exist(&self, name: &ObjectName) -> bool {
        self.pairs_path(name).as_std_path().exists()
    }

    pub fn write_similar_pairs(&self, pairs: &SimilarPairs) -> Result<Utf8PathBuf, KiraError> {
        let path = self.pairs_path(&pairs.name);
        if path.as_std_path().exists() {
            return Err(KiraError::SimilarPairsExists(pairs.name.to_string()));
        }
        write_gzip_json(&path, pairs)?;
        Ok(path)
    }

    pub fn load_similar_pairs(&self, name: &ObjectName) -> Result<SimilarPairs, KiraError> {
        let path = self.pairs_path(name);
        if !path.as_std_path().exists() {
            return Err(KiraError::SimilarPairsNotFound(name.to_string()));
        }
        read_gzip_json(&path)
    }

    pub fn remove_similar_pairs(&self, name: &ObjectName) -> Result<(), KiraError> {
        let path = self.pairs_path(name);
        if !path.as_std_path().exists() {
            return Err(KiraError::SimilarPairsNotFound(name.to_string()));
        }
        fs::remove_file(path.as_std_path()).map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn list_similar_pairs(&self) -> Result<Vec<String>, KiraError> {
        let dir = self.pairs_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".json.gz")) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn has_foreign_entries(&self) -> Result<bool, KiraError> {
        let entries = fs::read_dir(self.root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            if entry.file_name() != LOCK_FILE {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".kira-em")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| KiraError::Filesystem(format!("write {path}: {err}")))?;
    temp.persist(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("rename to {path}: {err}")))?;
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Utf8Path, value: &T) -> Result<(), KiraError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, KiraError> {
    let content = fs::read(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_slice(&content)
        .map_err(|err| KiraError::IncompatibleStore(format!("{path}: {err}")))
}

/// Gzip with the default header (mtime zero), so equal input gives equal bytes.
fn write_gzip_json<T: Serialize + ?Sized>(path: &Utf8Path, value: &T) -> Result<(), KiraError> {
    let content =
        serde_json::to_vec(value).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&content)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &compressed)
}

fn read_gzip_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, KiraError> {
    let file = File::open(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("open {path}: {err}")))?;
    let mut content = Vec::new();
    GzDecoder::new(file)
        .read_to_end(&mut content)
        .map_err(|err| KiraError::IncompatibleStore(format!("{path}: {err}")))?;
    serde_json::from_slice(&content)
        .map_err(|err| KiraError::IncompatibleStore(format!("{path}: {err}")))
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

//! Package manifest access
//!
//! The index engine never parses manifests itself; it asks a
//! [`ManifestSource`] for the token occurrences of each package. The
//! on-disk source reads one JSON document per package from a manifest
//! directory; tests use the in-memory source.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::errors::IndexError;

/// One indexable occurrence from a manifest: a search token plus the action
/// it came from and the byte offsets of the action lines within the
/// manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEntry {
    pub token: String,
    pub action: String,
    pub subtype: String,
    pub value: String,
    pub offsets: Vec<u64>,
}

/// On-disk manifest document: the package FMRI and its extracted entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub fmri: String,
    pub entries: Vec<SearchEntry>,
}

/// Supplier of package manifests to the index engine.
pub trait ManifestSource {
    /// Every FMRI this source can provide entries for.
    fn fmris(&self) -> Result<Vec<String>, IndexError>;

    /// The token occurrences of one package.
    fn search_entries(&self, fmri: &str) -> Result<Vec<SearchEntry>, IndexError>;

    /// Where the package's manifest lives on disk, for sources that are
    /// file-backed.
    fn manifest_path(&self, _fmri: &str) -> Option<PathBuf> {
        None
    }
}

/// Reads `*.json` manifest documents from a directory tree. The FMRI -> path
/// map is built once up front so per-package lookups do not rescan the tree.
#[derive(Debug)]
pub struct JsonManifestSource {
    paths: BTreeMap<String, PathBuf>,
}

impl JsonManifestSource {
    pub fn open(dir: &Path) -> Result<Self, IndexError> {
        let mut paths = BTreeMap::new();
        for entry in WalkDir::new(dir) {
            let entry = entry.map_err(|e| {
                IndexError::parse(dir.to_string_lossy(), format!("manifest scan failed: {}", e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let doc = read_manifest_file(entry.path())?;
            if let Some(old) = paths.insert(doc.fmri.clone(), entry.path().to_path_buf()) {
                log::warn!(
                    "duplicate manifest for {}: {:?} shadows {:?}",
                    doc.fmri,
                    entry.path(),
                    old
                );
            }
        }
        log::debug!("found {} manifests under {:?}", paths.len(), dir);
        Ok(Self { paths })
    }
}

fn read_manifest_file(path: &Path) -> Result<ManifestFile, IndexError> {
    let file = File::open(path)?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| IndexError::parse(path.to_string_lossy(), e.to_string()))
}

impl ManifestSource for JsonManifestSource {
    fn fmris(&self) -> Result<Vec<String>, IndexError> {
        Ok(self.paths.keys().cloned().collect())
    }

    fn search_entries(&self, fmri: &str) -> Result<Vec<SearchEntry>, IndexError> {
        let path = self.paths.get(fmri).ok_or_else(|| {
            IndexError::parse(fmri, "no manifest for package")
        })?;
        Ok(read_manifest_file(path)?.entries)
    }

    fn manifest_path(&self, fmri: &str) -> Option<PathBuf> {
        self.paths.get(fmri).cloned()
    }
}

/// In-memory manifest source, mainly for tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    manifests: BTreeMap<String, Vec<SearchEntry>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fmri: &str, entries: Vec<SearchEntry>) {
        self.manifests.insert(fmri.to_string(), entries);
    }

    pub fn remove(&mut self, fmri: &str) {
        self.manifests.remove(fmri);
    }
}

impl ManifestSource for MemorySource {
    fn fmris(&self) -> Result<Vec<String>, IndexError> {
        Ok(self.manifests.keys().cloned().collect())
    }

    fn search_entries(&self, fmri: &str) -> Result<Vec<SearchEntry>, IndexError> {
        self.manifests
            .get(fmri)
            .cloned()
            .ok_or_else(|| IndexError::parse(fmri, "no manifest for package"))
    }
}

/// Convenience constructor for a single-token entry.
pub fn entry(token: &str, action: &str, subtype: &str, value: &str, offsets: &[u64]) -> SearchEntry {
    SearchEntry {
        token: token.to_string(),
        action: action.to_string(),
        subtype: subtype.to_string(),
        value: value.to_string(),
        offsets: offsets.to_vec(),
    }
}

//! The persisted cache index document.

use super::fingerprint::Fingerprint;
use super::nested::NestedMap;
use crate::errors::{MinitaskError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// On-disk layout of `meta-<method>.json`.
///
/// `data` and `path` are keyed by normalized file path. `expected` holds the
/// fingerprint each file had when its entries were written. `meta` is
/// store-level metadata not bound to any file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheIndex {
    /// Arbitrary JSON per file.
    #[serde(default)]
    pub data: BTreeMap<String, NestedMap>,
    /// Named result-file pointers per file.
    #[serde(default)]
    pub path: BTreeMap<String, NestedMap>,
    /// Stored fingerprint per file.
    #[serde(default)]
    pub expected: BTreeMap<String, Fingerprint>,
    /// Store-level metadata.
    #[serde(default)]
    pub meta: NestedMap,
}

impl CacheIndex {
    /// Loads the index at `path`. A missing file yields an empty index.
    ///
    /// A file that exists but does not parse is reported as
    /// [`MinitaskError::CorruptIndex`]; it is never repaired.
    pub fn load(path: &Path, cache_dir: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache index yet");
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };

        serde_json::from_str(&text).map_err(|err| MinitaskError::CorruptIndex {
            path: path.to_path_buf(),
            cache_dir: cache_dir.to_path_buf(),
            reason: err.to_string(),
        })
    }

    /// Writes the index to `path`, replacing the old file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.flush()?;
        tmp.persist(path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Removes a file's data and path entries, returning the path entries.
    pub fn forget(&mut self, key: &str) -> Option<NestedMap> {
        self.data.remove(key);
        self.path.remove(key)
    }

    /// Clears every record and returns all removed path entries.
    pub fn drain_records(&mut self) -> Vec<NestedMap> {
        self.data.clear();
        self.expected.clear();
        std::mem::take(&mut self.path).into_values().collect()
    }
}

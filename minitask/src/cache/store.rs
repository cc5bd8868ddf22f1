//! The cache store and per-file records.

use super::fingerprint::{Fingerprint, FingerprintMethod};
use super::index::CacheIndex;
use super::nested::strings_in;
use super::paths::{is_within, normalize};
use crate::errors::Result;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RESULT_NAME_LEN: usize = 12;

#[derive(Debug, Default)]
struct StoreState {
    index: CacheIndex,
    batch_depth: usize,
    fingerprint_memo: HashMap<PathBuf, Option<Fingerprint>>,
    reserved: HashSet<PathBuf>,
    dirty: bool,
}

/// A persistent store of per-file metadata and result pointers.
///
/// One store exists per (directory, fingerprint method); obtain it through a
/// [`CacheRegistry`](super::CacheRegistry) so every caller shares the same
/// in-memory copy. Entries for a file are only visible while the file's live
/// fingerprint matches the one recorded with them. On a mismatch the entries
/// are dropped and any result files they point to inside the cache directory
/// are deleted.
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    method: FingerprintMethod,
    index_path: PathBuf,
    state: Mutex<StoreState>,
}

impl CacheStore {
    /// Opens (creating if needed) the store in `dir`.
    pub fn open(dir: impl AsRef<Path>, method: FingerprintMethod) -> Result<Self> {
        let dir = normalize(dir.as_ref())?;
        std::fs::create_dir_all(&dir)?;
        let index_path = dir.join(method.index_file_name());
        let index = CacheIndex::load(&index_path, &dir)?;

        debug!(
            dir = %dir.display(),
            %method,
            files = index.expected.len(),
            "Opened cache store"
        );

        Ok(Self {
            dir,
            method,
            index_path,
            state: Mutex::new(StoreState {
                index,
                ..StoreState::default()
            }),
        })
    }

    /// The normalized cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The fingerprint method.
    #[must_use]
    pub const fn method(&self) -> FingerprintMethod {
        self.method
    }

    /// Location of the index file.
    #[must_use]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Returns the record for `file`.
    pub fn record(self: &Arc<Self>, file: impl AsRef<Path>) -> Result<CacheRecord> {
        let file = normalize(file.as_ref())?;
        Ok(CacheRecord {
            store: Arc::clone(self),
            key: file.to_string_lossy().into_owned(),
            file,
        })
    }

    /// Returns a fresh, unused path inside the cache directory.
    ///
    /// Nothing is created on disk. The name stays reserved in this store until
    /// it is recorded with [`CacheRecord::set_path`] or given back with
    /// [`discard_result`](Self::discard_result).
    #[must_use]
    pub fn new_result_path(&self) -> PathBuf {
        let mut state = self.state.lock();
        loop {
            let token: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(RESULT_NAME_LEN)
                .map(char::from)
                .collect();
            let candidate = self.dir.join(token);
            if !candidate.exists() && state.reserved.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// Gives back a result path that will not be recorded, deleting whatever
    /// was written there.
    pub fn discard_result(&self, path: &Path) {
        let Ok(path) = normalize(path) else {
            return;
        };
        self.state.lock().reserved.remove(&path);
        let removed = self.remove_owned(vec![path.to_string_lossy().into_owned()]);
        debug!(path = %path.display(), removed, "Discarded result path");
    }

    /// Store-level metadata at `key`.
    #[must_use]
    pub fn data(&self, key: &[&str]) -> Option<Value> {
        self.state.lock().index.meta.get(key).cloned()
    }

    /// Sets store-level metadata at `key`.
    pub fn set_data(&self, key: &[&str], value: Value) -> Result<()> {
        let mut state = self.state.lock();
        state.index.meta.set(key, value);
        state.dirty = true;
        self.commit(&mut state)
    }

    /// Drops every record and deletes every result file the store owns.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        let drained = state.index.drain_records();
        let removed: usize = drained
            .into_iter()
            .map(|paths| self.remove_owned(paths.string_leaves()))
            .sum();
        state.fingerprint_memo.clear();
        state.dirty = true;
        info!(dir = %self.dir.display(), removed, "Cleared cache store");
        self.commit(&mut state)
    }

    /// Enters batch mode: mutations are not flushed until the matching
    /// [`end_batch`](Self::end_batch). With [`FingerprintMethod::Stat`] each
    /// file is also stat'ed at most once per batch; content digests are always
    /// recomputed.
    ///
    /// Batches nest.
    pub fn begin_batch(&self) {
        self.state.lock().batch_depth += 1;
    }

    /// Leaves batch mode, flushing once when the outermost batch ends.
    pub fn end_batch(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.batch_depth = state.batch_depth.saturating_sub(1);
        if state.batch_depth == 0 {
            state.fingerprint_memo.clear();
        }
        self.commit(&mut state)
    }

    /// Begins a batch that ends when the returned guard is dropped.
    #[must_use = "the batch ends as soon as the guard is dropped"]
    pub fn batch(&self) -> BatchGuard<'_> {
        self.begin_batch();
        BatchGuard { store: self }
    }

    /// Writes pending changes to disk, unless a batch is open.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.commit(&mut state)
    }

    fn commit(&self, state: &mut StoreState) -> Result<()> {
        if state.batch_depth > 0 || !state.dirty {
            return Ok(());
        }
        state.index.save(&self.index_path)?;
        state.dirty = false;
        debug!(path = %self.index_path.display(), "Flushed cache index");
        Ok(())
    }

    /// Reconciles the stored fingerprint of `file` with the live one and
    /// returns the live fingerprint.
    fn validate(&self, state: &mut StoreState, key: &str, file: &Path) -> Result<Option<Fingerprint>> {
        let live = if state.batch_depth > 0 && self.method == FingerprintMethod::Stat {
            if let Some(memo) = state.fingerprint_memo.get(file) {
                memo.clone()
            } else {
                let live = Fingerprint::compute(self.method, file)?;
                state.fingerprint_memo.insert(file.to_path_buf(), live.clone());
                live
            }
        } else {
            Fingerprint::compute(self.method, file)?
        };

        let stored = state.index.expected.get(key).cloned();
        if live.is_some() && stored == live {
            return Ok(live);
        }

        let had_entries = state.index.data.contains_key(key) || state.index.path.contains_key(key);
        if let Some(paths) = state.index.forget(key) {
            let removed = self.remove_owned(paths.string_leaves());
            debug!(file = key, removed, "Removed stale result files");
        }
        if had_entries {
            info!(
                file = key,
                stored = ?stored.as_ref().map(ToString::to_string),
                live = ?live.as_ref().map(ToString::to_string),
                "Invalidated cache entries"
            );
        }

        match &live {
            Some(fingerprint) => {
                state.index.expected.insert(key.to_string(), fingerprint.clone());
            }
            None => {
                state.index.expected.remove(key);
            }
        }
        state.dirty = true;
        Ok(live)
    }

    fn read(&self, record: &CacheRecord, pick: impl FnOnce(&CacheIndex) -> Option<Value>) -> Result<Option<Value>> {
        let mut state = self.state.lock();
        self.validate(&mut state, &record.key, &record.file)?;
        let value = pick(&state.index);
        self.commit(&mut state)?;
        Ok(value)
    }

    fn write<T>(&self, record: &CacheRecord, put: impl FnOnce(&mut StoreState) -> T) -> Result<T> {
        let mut state = self.state.lock();
        if self.validate(&mut state, &record.key, &record.file)?.is_none() {
            self.commit(&mut state)?;
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("cannot record cache entries for missing file {}", record.file.display()),
            )
            .into());
        }
        let out = put(&mut *state);
        state.dirty = true;
        self.commit(&mut state)?;
        Ok(out)
    }

    /// Deletes every referenced file that lives inside the cache directory.
    /// Files anywhere else are left alone.
    fn remove_owned(&self, leaves: Vec<String>) -> usize {
        let mut removed = 0;
        for leaf in leaves {
            let Ok(target) = normalize(Path::new(&leaf)) else {
                continue;
            };
            if !is_within(&self.dir, &target) || target == self.index_path {
                debug!(path = %target.display(), "Leaving file outside the cache directory");
                continue;
            }
            match std::fs::remove_file(&target) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %target.display(), error = %err, "Failed to delete result file"),
            }
        }
        removed
    }
}

/// Ends a batch on drop.
#[derive(Debug)]
pub struct BatchGuard<'a> {
    store: &'a CacheStore,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.end_batch() {
            warn!(error = %err, "Failed to flush cache index after batch");
        }
    }
}

/// Cache entries for one tracked file.
///
/// Every read and write first revalidates the file's fingerprint.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    store: Arc<CacheStore>,
    file: PathBuf,
    key: String,
}

impl CacheRecord {
    /// The normalized path of the tracked file.
    #[must_use]
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// The store this record belongs to.
    #[must_use]
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// The live fingerprint of the tracked file, after revalidation.
    pub fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        let mut state = self.store.state.lock();
        let live = self.store.validate(&mut state, &self.key, &self.file)?;
        self.store.commit(&mut state)?;
        Ok(live)
    }

    /// Metadata stored at `key`.
    pub fn data(&self, key: &[&str]) -> Result<Option<Value>> {
        self.store
            .read(self, |index| index.data.get(&self.key)?.get(key).cloned())
    }

    /// Stores metadata at `key`. Fails if the tracked file does not exist.
    pub fn set_data(&self, key: &[&str], value: Value) -> Result<()> {
        self.store.write(self, |state| {
            state.index.data.entry(self.key.clone()).or_default().set(key, value);
        })
    }

    /// Result-file pointer stored at `key`.
    pub fn path(&self, key: &[&str]) -> Result<Option<PathBuf>> {
        let value = self
            .store
            .read(self, |index| index.path.get(&self.key)?.get(key).cloned())?;
        Ok(value.as_ref().and_then(Value::as_str).map(PathBuf::from))
    }

    /// Stores a result-file pointer at `key`. Fails if the tracked file does
    /// not exist.
    ///
    /// Owned result files that the entry pointed to before are deleted.
    pub fn set_path(&self, key: &[&str], target: &Path) -> Result<()> {
        let target = normalize(target)?;
        let target_str = target.to_string_lossy().into_owned();
        let value = Value::String(target_str.clone());
        let replaced = self.store.write(self, |state| {
            state.reserved.remove(&target);
            state.index.path.entry(self.key.clone()).or_default().set(key, value)
        })?;

        if let Some(replaced) = replaced {
            let stale: Vec<String> = strings_in(&replaced)
                .into_iter()
                .filter(|leaf| *leaf != target_str)
                .collect();
            if !stale.is_empty() {
                let removed = self.store.remove_owned(stale);
                debug!(file = %self.key, removed, "Removed replaced result files");
            }
        }
        Ok(())
    }
}

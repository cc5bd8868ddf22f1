//! Depth-first file enumeration with exclusion predicates.
//!
//! ```rust,ignore
//! let files = FileList::new()
//!     .base_path("/srv/site")
//!     .add("assets")
//!     .exclude(|path, _| path.extension().is_some_and(|ext| ext == "tmp"))
//!     .sort()
//!     .exec()?;
//! ```

use crate::cache::normalize;
use crate::errors::Result;
use std::collections::HashSet;
use std::fmt;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Decides whether an entry is left out. Excluded directories are not entered.
pub type ExcludeFn = Arc<dyn Fn(&Path, &Metadata) -> bool + Send + Sync>;

/// One enumerated file or directory.
#[derive(Debug, Clone)]
pub struct ListedFile {
    /// Normalized absolute path.
    pub path: PathBuf,
    /// Metadata captured during the walk (symlinks are not followed).
    pub metadata: Metadata,
}

/// Collects paths and walks them depth-first.
#[derive(Clone, Default)]
pub struct FileList {
    roots: Vec<PathBuf>,
    base: Option<PathBuf>,
    excludes: Vec<ExcludeFn>,
    sorted: bool,
}

impl FileList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a path to enumerate. Relative paths resolve against the base path
    /// (or the working directory) when the list executes.
    #[must_use]
    pub fn add(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if !self.roots.contains(&path) {
            self.roots.push(path);
        }
        self
    }

    /// Adds several paths.
    #[must_use]
    pub fn add_all<I, P>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        paths.into_iter().fold(self, |list, path| list.add(path))
    }

    /// Sets the directory relative paths resolve against.
    #[must_use]
    pub fn base_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base = Some(dir.into());
        self
    }

    /// Adds an exclusion predicate. An entry matching any predicate is
    /// skipped, and a matching directory is not descended into.
    #[must_use]
    pub fn exclude<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Path, &Metadata) -> bool + Send + Sync + 'static,
    {
        self.excludes.push(Arc::new(predicate));
        self
    }

    /// Orders the result by path.
    #[must_use]
    pub fn sort(mut self) -> Self {
        self.sorted = true;
        self
    }

    /// Walks every added path.
    ///
    /// Each path appears once even when added roots overlap. Paths that do
    /// not exist are logged and skipped.
    pub fn exec(&self) -> Result<Vec<ListedFile>> {
        let mut seen = HashSet::new();
        let mut files = Vec::new();

        for root in &self.roots {
            let root = match &self.base {
                Some(base) if root.is_relative() => normalize(&base.join(root))?,
                _ => normalize(root)?,
            };
            if let Err(err) = std::fs::symlink_metadata(&root) {
                if err.kind() == io::ErrorKind::NotFound {
                    warn!(path = %root.display(), "Skipping missing path");
                    continue;
                }
                return Err(err.into());
            }

            let walker = WalkDir::new(&root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| !self.is_excluded(entry));

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) if err.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                        warn!(error = %err, "Entry vanished during listing");
                        continue;
                    }
                    Err(err) => return Err(io::Error::from(err).into()),
                };
                if !seen.insert(entry.path().to_path_buf()) {
                    continue;
                }
                let metadata = entry.metadata().map_err(io::Error::from)?;
                files.push(ListedFile {
                    path: entry.into_path(),
                    metadata,
                });
            }
        }

        if self.sorted {
            files.sort_by(|a, b| a.path.cmp(&b.path));
        }
        debug!(roots = self.roots.len(), files = files.len(), "Listed files");
        Ok(files)
    }

    fn is_excluded(&self, entry: &walkdir::DirEntry) -> bool {
        if self.excludes.is_empty() {
            return false;
        }
        match entry.metadata() {
            Ok(metadata) => self
                .excludes
                .iter()
                .any(|predicate| predicate(entry.path(), &metadata)),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for FileList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileList")
            .field("roots", &self.roots)
            .field("base", &self.base)
            .field("excludes", &self.excludes.len())
            .field("sorted", &self.sorted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/nested")).unwrap();
        std::fs::create_dir_all(root.join("skip")).unwrap();
        std::fs::write(root.join("src/a.js"), "a").unwrap();
        std::fs::write(root.join("src/nested/b.js"), "b").unwrap();
        std::fs::write(root.join("src/c.tmp"), "c").unwrap();
        std::fs::write(root.join("skip/d.js"), "d").unwrap();
        dir
    }

    fn relative(files: &[ListedFile], root: &Path) -> Vec<String> {
        files
            .iter()
            .map(|f| {
                f.path
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect()
    }

    #[test]
    fn test_lists_depth_first_with_directories() {
        let dir = tree();
        let root = normalize(dir.path()).unwrap();

        let files = FileList::new().base_path(&root).add("src").exec().unwrap();

        assert_eq!(
            relative(&files, &root),
            vec!["src", "src/a.js", "src/c.tmp", "src/nested", "src/nested/b.js"]
        );
        assert!(files[0].metadata.is_dir());
    }

    #[test]
    fn test_exclusions_prune_directories() {
        let dir = tree();
        let root = normalize(dir.path()).unwrap();

        let files = FileList::new()
            .add(&root)
            .exclude(|path, meta| meta.is_dir() && path.ends_with("skip"))
            .exclude(|path, _| path.extension().is_some_and(|ext| ext == "tmp"))
            .sort()
            .exec()
            .unwrap();

        let names = relative(&files, &root);
        assert!(names.contains(&"src/nested/b.js".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("skip")));
        assert!(!names.iter().any(|n| n.ends_with(".tmp")));
    }

    #[test]
    fn test_overlapping_roots_are_listed_once() {
        let dir = tree();
        let root = normalize(dir.path()).unwrap();

        let files = FileList::new()
            .base_path(&root)
            .add_all(["src", "src/nested", "./src"])
            .exec()
            .unwrap();

        let names = relative(&files, &root);
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(names.len(), unique.len());
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_missing_paths_are_skipped() {
        let dir = tree();
        let root = normalize(dir.path()).unwrap();

        let files = FileList::new()
            .base_path(&root)
            .add("does-not-exist")
            .add("src/a.js")
            .exec()
            .unwrap();

        assert_eq!(relative(&files, &root), vec!["src/a.js"]);
        assert!(files[0].metadata.is_file());
    }
}

//! Path normalization for cache keys.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Makes `path` absolute and resolves `.` and `..` lexically.
///
/// Symlinks are not followed and the path need not exist, so a deleted file
/// keeps the same key it had while it existed.
pub fn normalize(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Returns true when `path` lies strictly inside `dir`. Both must be normalized.
#[must_use]
pub fn is_within(dir: &Path, path: &Path) -> bool {
    path != dir && path.starts_with(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_resolves_dots() {
        assert_eq!(
            normalize(Path::new("/a/./b/../c/")).unwrap(),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize(Path::new("/../x")).unwrap(), PathBuf::from("/x"));
    }

    #[test]
    fn test_normalize_makes_absolute() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(normalize(Path::new("rel/file")).unwrap(), cwd.join("rel/file"));
    }

    #[test]
    fn test_is_within() {
        let dir = Path::new("/cache");
        assert!(is_within(dir, Path::new("/cache/abc")));
        assert!(!is_within(dir, Path::new("/cache")));
        assert!(!is_within(dir, Path::new("/cachex/abc")));
        assert!(!is_within(dir, Path::new("/other/abc")));
    }
}

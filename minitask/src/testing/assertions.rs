//! Test assertions for pipeline outputs and cache files.

use std::path::Path;

/// Asserts that `actual` is valid UTF-8 equal to `expected`.
pub fn assert_utf8_eq(actual: &[u8], expected: &str) {
    let text = std::str::from_utf8(actual)
        .unwrap_or_else(|err| panic!("Expected UTF-8 output, got {actual:?}: {err}"));
    assert_eq!(text, expected, "Unexpected output");
}

/// Asserts that the file at `path` exists and holds exactly `expected`.
pub fn assert_file_contents(path: &Path, expected: &str) {
    let actual = std::fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("Expected readable file {}: {err}", path.display()));
    assert_eq!(
        actual,
        expected,
        "Unexpected contents in {}",
        path.display()
    );
}

/// Asserts that nothing exists at `path`.
pub fn assert_file_missing(path: &Path) {
    assert!(
        !path.exists(),
        "Expected {} to have been removed",
        path.display()
    );
}

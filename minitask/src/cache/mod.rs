//! Content-addressed result cache.
//!
//! This module provides:
//! - [`CacheStore`]: per-directory persistent index of file metadata and
//!   result pointers, invalidated when a tracked file's fingerprint changes
//! - [`CacheRecord`]: the entries of one tracked file
//! - [`CacheRegistry`]: one shared store per (directory, method)
//! - [`Fingerprint`] / [`FingerprintMethod`]: stat, MD5 and SHA-256 fingerprints
//! - [`NestedMap`]: key-path access over JSON objects

mod fingerprint;
mod index;
mod nested;
mod paths;
mod registry;
mod store;

pub use fingerprint::{Fingerprint, FingerprintMethod};
pub use index::CacheIndex;
pub use nested::NestedMap;
pub use paths::{is_within, normalize};
pub use registry::CacheRegistry;
pub use store::{BatchGuard, CacheRecord, CacheStore};

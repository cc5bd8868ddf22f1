//! File fingerprints used to detect changed inputs.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

/// How a tracked file is fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMethod {
    /// Size and modification time. Cheap, but blind to same-size edits made
    /// within the same millisecond.
    Stat,
    /// MD5 of the full contents.
    #[default]
    Md5,
    /// SHA-256 of the full contents.
    Sha256,
}

impl FingerprintMethod {
    /// Name used in the index file name and in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stat => "stat",
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }

    /// File name of the index for this method, e.g. `meta-md5.json`.
    #[must_use]
    pub fn index_file_name(self) -> String {
        format!("meta-{}.json", self.as_str())
    }
}

impl fmt::Display for FingerprintMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FingerprintMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stat" => Ok(Self::Stat),
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            other => Err(format!("unknown fingerprint method '{other}'")),
        }
    }
}

/// The fingerprint of one file at one moment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fingerprint {
    /// Size in bytes and modification time in milliseconds since the epoch.
    Stat {
        /// File size.
        size: u64,
        /// Modification time, millisecond precision.
        mtime: u64,
    },
    /// Lowercase hex digest of the contents.
    Digest(String),
}

impl Fingerprint {
    /// Computes the live fingerprint of `path`.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    pub fn compute(method: FingerprintMethod, path: &Path) -> io::Result<Option<Self>> {
        let result = match method {
            FingerprintMethod::Stat => stat(path),
            FingerprintMethod::Md5 => digest::<Md5>(path),
            FingerprintMethod::Sha256 => digest::<Sha256>(path),
        };
        match result {
            Ok(fingerprint) => Ok(Some(fingerprint)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stat { size, mtime } => write!(f, "{size}@{mtime}"),
            Self::Digest(hex) => f.write_str(hex),
        }
    }
}

fn stat(path: &Path) -> io::Result<Fingerprint> {
    let meta = std::fs::metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    Ok(Fingerprint::Stat {
        size: meta.len(),
        mtime,
    })
}

fn digest<D: Digest>(path: &Path) -> io::Result<Fingerprint> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(Fingerprint::Digest(hex::encode(hasher.finalize())))
}

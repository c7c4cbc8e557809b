use std::path::PathBuf;

use bytes::Bytes;
use thiserror::Error;
use tokio::task::JoinError;

/// Errors produced while managing the store or building derivations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bramble location {path:?} is too long to create a store path {length} bytes in length")]
    PathTooLong { path: PathBuf, length: usize },

    #[error("bramble path {0:?} must be absolute")]
    RelativeBramblePath(PathBuf),

    #[error("bramble path {0:?} is not valid utf-8")]
    NonUtf8Path(PathBuf),

    #[error("unable to determine a bramble path, set BRAMBLE_PATH")]
    NoBramblePath,

    #[error("calculated store path {0:?} doesn't exist, did the location change?")]
    StorePathMissing(PathBuf),

    #[error("invalid derivation {name}: {reason}")]
    InvalidDerivation { name: String, reason: String },

    #[error("dependency {0} has not been built")]
    DependencyNotBuilt(String),

    #[error("content for {key:?} doesn't match the expected hash: wanted {wanted}, got {got}")]
    HashMismatch {
        key: String,
        wanted: String,
        got: String,
    },

    #[error("building {name} failed: {reason}")]
    BuildFailed {
        name: String,
        reason: String,
        stdout: Bytes,
        stderr: Bytes,
    },

    #[error("derivation {filename} is not reproducible, outputs changed: {changed:?}")]
    Reproducibility {
        filename: String,
        /// (output name, previous hash, new hash)
        changed: Vec<(String, String, String)>,
    },

    #[error("replacement for {0:?} must be the same length as the value it replaces")]
    ReplacementLength(String),

    #[error("lockfile entry for {key:?} is already {existing}, refusing to record {new}")]
    LockfileConflict {
        key: String,
        existing: String,
        new: String,
    },

    #[error("unable to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("build cancelled")]
    Cancelled,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_derivation(name: &str, reason: impl Into<String>) -> Self {
        Error::InvalidDerivation {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::Io(std::io::Error::other(value))
    }
}

impl From<walkdir::Error> for Error {
    fn from(value: walkdir::Error) -> Self {
        Error::Io(value.into())
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            e => std::io::Error::other(e),
        }
    }
}

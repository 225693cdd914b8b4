use std::path::PathBuf;

use crate::Hash;

/// error type for bpm operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("repository not found at {0}")]
    NoRepo(PathBuf),

    #[error("repository already exists at {0}")]
    RepoExists(PathBuf),

    #[error("blob not found: {0}")]
    NotFound(Hash),

    #[error("asset not found: {0}")]
    AssetNotFound(i64),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(Hash),

    #[error("path not found in tree: {0}")]
    PathNotFound(String),

    #[error("blob too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("destination buffer too short: need {need}, have {have}")]
    ShortBuffer { need: usize, have: usize },

    #[error("invalid top-level directory name: {0}")]
    InvalidName(String),

    #[error("unknown source scheme: {0}")]
    UnknownScheme(String),

    #[error("invalid source url: {0}")]
    InvalidUrl(String),

    #[error("remote request failed: {0}")]
    RemoteTransient(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("invalid tree entry name: {0}")]
    InvalidEntryName(String),

    #[error("duplicate tree entry name: {0}")]
    DuplicateEntryName(String),

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),

    #[error("checkout target not empty: {0}")]
    TargetNotEmpty(PathBuf),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor deserialization error: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("persistence failure: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("predicate error: {0}")]
    Jq(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// attach a path to a raw io error
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

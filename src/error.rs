use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by a [`FaceOracle`](crate::oracle::FaceOracle).
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("cannot decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("face encoding failed for {path}: {message}")]
    Inference { path: PathBuf, message: String },
}

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid identity id {0:?}")]
    InvalidIdentity(String),
    #[error("unsupported image format: {path}")]
    UnsupportedFormat { path: PathBuf },
    #[error("cannot read probe image: {0}")]
    Decode(#[source] OracleError),
}

impl MatchError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = MatchError> = std::result::Result<T, E>;

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, UmbraError>;

#[derive(Debug, Error)]
pub enum UmbraError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("blob not found")]
    BlobNotFound,
    #[error("integrity violated: {0}")]
    IntegrityViolated(&'static str),
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("file size limit reached")]
    LimitsReached,
    #[error("out of memory")]
    OutOfMemory,
}

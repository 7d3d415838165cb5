//! trace errors

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open trace `{}`: {}", _0.display(), _1)]
    Io(PathBuf, #[source] std::io::Error),
    #[error("cannot read trace: {0}")]
    Read(#[source] csv::Error),
    #[error("malformed trace row {line}: {reason}")]
    Malformed { line: u64, reason: String },
}

impl Error {
    pub fn malformed(line: u64, reason: impl Into<String>) -> Self {
        Self::Malformed { line, reason: reason.into() }
    }
}

use thiserror::Error;

use crate::join::JoinType;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("could not write to hash-join temporary file: wrote only {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },
    #[error("could not read from hash-join temporary file: read only {read} of {expected} bytes")]
    ShortRead { expected: usize, read: usize },
    #[error("Corrupt spill record: {0}")]
    Corrupt(String),
    #[error("unrecognized join type: {0}")]
    UnsupportedJoinType(JoinType),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Evaluation error: {0}")]
    Eval(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl JoinError {
    /// Spill store truncation and backend failures abort the query.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            JoinError::IOError(_) | JoinError::ShortWrite { .. } | JoinError::ShortRead { .. }
        )
    }
}

use bitd_consensus::Hash256;
use bitd_storage::StoreError;

use crate::hash_to_hex;

#[derive(Debug)]
pub enum ChainError {
    /// Consensus failure attributable to a block; the header gets marked
    /// invalid and the step rolls back.
    Validation(Hash256),
    /// Storage does not hold data the step needs.
    MissingData(Hash256),
    /// Reverse replay reached data the pruner already dropped.
    CannotRollback,
    /// Pool acquisition timed out.
    Timeout,
    /// Cooperative shutdown.
    Cancelled,
    /// Invariant violated inside trusted storage.
    Corruption(&'static str),
    /// Two chains share no root.
    NoCommonAncestor,
    Store(StoreError),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Validation(hash) => {
                write!(f, "block {} failed validation", hash_to_hex(hash))
            }
            ChainError::MissingData(hash) => {
                write!(f, "missing data for block {}", hash_to_hex(hash))
            }
            ChainError::CannotRollback => write!(f, "cannot roll back past pruned data"),
            ChainError::Timeout => write!(f, "timed out acquiring a pooled resource"),
            ChainError::Cancelled => write!(f, "cancelled"),
            ChainError::Corruption(message) => write!(f, "storage corruption: {message}"),
            ChainError::NoCommonAncestor => write!(f, "chains share no common ancestor"),
            ChainError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

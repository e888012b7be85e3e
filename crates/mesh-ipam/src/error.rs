//! Error types for pool management

use thiserror::Error;
use uuid::Uuid;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pool manager errors
///
/// Ordinary allocation outcomes (no capacity, request out of range, no
/// matching block) are not errors; those surface as `Ok(None)` or `Ok(false)`
/// from the operations that produce them. Errors are reserved for storage
/// conditions and misuse of the tree.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Pool errors
    #[error("Pool not found: {0}")]
    PoolNotFound(Uuid),

    #[error("Invalid pool definition: {0}")]
    InvalidPool(String),

    #[error("Pool {0} has children and cannot be freed directly")]
    NotALeaf(Uuid),

    // Prefix arithmetic errors
    #[error("Invalid prefix length: {0}")]
    InvalidPrefix(String),

    // Transaction errors
    #[error("Deadlock detected while locking pool {0}")]
    Deadlock(Uuid),

    #[error("Transaction does not hold the lock on pool {0}")]
    LockDiscipline(Uuid),

    // Allocation request errors
    #[error("Unable to satisfy address allocation request for /{prefix_length} from pool {pool}")]
    RequestUnsatisfiable { pool: Uuid, prefix_length: u8 },

    // Audit errors
    #[error("Pool tree invariant violated: {0}")]
    CorruptTree(String),
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(e: ipnet::PrefixLenError) -> Self {
        Error::InvalidPrefix(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::InvalidPool(e.to_string())
    }
}

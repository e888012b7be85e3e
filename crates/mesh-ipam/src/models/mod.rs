//! Data models for pool management

mod pool;
mod request;

pub use pool::{AddressFamily, NewPool, PoolRecord, PoolStatus, PoolTreeStats};
pub use request::{AllocationRequest, DEFAULT_REQUEST_PREFIX_LENGTH};

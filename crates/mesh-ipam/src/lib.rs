//! Mesh IPAM
//!
//! Hierarchical IP address pool management for mesh node provisioning:
//! - Top-level pools carved into power-of-two subnets on demand
//! - Buddy splitting with left-packed first-fit allocation
//! - Reservation of specific blocks, with a side-effect-free check mode
//! - Hold-down quarantine for released subnets
//! - Allocation requests that survive re-registration
//!
//! Pool trees live behind the [`PoolStore`] trait. Every mutating operation
//! runs in one transaction with exclusive row locks, so concurrent callers
//! either serialize cleanly or one of them gets [`Error::Deadlock`] and
//! retries.

pub mod allocator;
pub mod error;
pub mod models;
pub mod netcalc;
pub mod service;
pub mod store;

// Re-export core types
pub use error::{Error, Result};
pub use models::{
    AddressFamily, AllocationRequest, NewPool, PoolRecord, PoolStatus, PoolTreeStats,
    DEFAULT_REQUEST_PREFIX_LENGTH,
};
pub use allocator::{
    allocate_subnet, check_subnet_available, free_pool, reclaim_held_down, reclaim_pools,
    reserve_subnet, verify_tree, RESERVED_PREFIX_LENGTH,
};
pub use service::{CreatePoolRequest, PoolManager, PoolManagerConfig};
pub use store::{MemoryPoolStore, MemoryTransaction, PoolStore};

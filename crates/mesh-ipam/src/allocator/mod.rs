//! Buddy-system tree operations
//!
//! The five tree operations over a [`PoolStore`](crate::store::PoolStore):
//! - splitting a block into its two buddy halves
//! - allocating a block of a requested size (left-packed first fit)
//! - reserving a specific block, with rollback of a failed descent
//! - coalescing freed buddies back up the tree
//! - freeing a leaf, immediately or into hold-down
//!
//! Every operation re-locks each row immediately before inspecting it and
//! runs inside the ambient transaction of its caller. Failures to find or
//! place a block are ordinary `None`/`false` outcomes, not errors.

mod audit;
mod buddy;

pub use audit::verify_tree;
pub use buddy::{
    allocate_subnet, check_subnet_available, free_pool, reclaim_held_down, reclaim_pools,
    reserve_subnet,
};

/// Prefix length refused by allocation and reservation, for any address family
pub const RESERVED_PREFIX_LENGTH: u8 = 31;

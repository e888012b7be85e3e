//! Pool Manager Service
//!
//! Core orchestration service for address pool management, providing:
//! - Top-level pool registration
//! - Buddy subnet allocation and reservation
//! - Release with hold-down and periodic reclamation
//! - Allocation request tracking
//!
//! Every mutating operation runs in a single store transaction. A
//! [`Error::Deadlock`](crate::Error::Deadlock) result means the transaction
//! was rolled back cleanly and the call can simply be retried.

use crate::allocator;
use crate::models::{
    AddressFamily, AllocationRequest, NewPool, PoolRecord, PoolStatus, PoolTreeStats,
};
use crate::netcalc;
use crate::store::{MemoryPoolStore, PoolStore};
use crate::{Error, Result};
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Configuration for PoolManager
#[derive(Debug, Clone)]
pub struct PoolManagerConfig {
    /// How long a released subnet stays held down before a sweep may free it
    pub hold_down_period: Duration,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            hold_down_period: Duration::hours(2),
        }
    }
}

/// Request to create a new top-level pool
#[derive(Debug, Clone)]
pub struct CreatePoolRequest {
    /// Network address of the pool's block
    pub network: IpAddr,
    /// Prefix length of the pool's block
    pub prefix_length: u8,
    /// Human-readable label
    pub description: Option<String>,
    /// Prefix length used by allocations that name none
    pub prefix_length_default: Option<u8>,
    /// Smallest prefix length requests may ask for (None disables the bound)
    pub prefix_length_minimum: Option<u8>,
    /// Largest prefix length requests may ask for (None disables the bound)
    pub prefix_length_maximum: Option<u8>,
}

impl CreatePoolRequest {
    /// Create a request with the stock /24../28 request bounds and no default.
    pub fn new(network: IpAddr, prefix_length: u8) -> Self {
        Self {
            network,
            prefix_length,
            description: None,
            prefix_length_default: None,
            prefix_length_minimum: Some(24),
            prefix_length_maximum: Some(28),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the prefix length used when an allocation names none.
    pub fn with_default_prefix_length(mut self, prefix_length: u8) -> Self {
        self.prefix_length_default = Some(prefix_length);
        self
    }

    /// Replace both request bounds. `None` disables that side entirely.
    pub fn with_bounds(mut self, minimum: Option<u8>, maximum: Option<u8>) -> Self {
        self.prefix_length_minimum = minimum;
        self.prefix_length_maximum = maximum;
        self
    }
}

/// Pool Manager - core orchestration service
pub struct PoolManager<S: PoolStore = MemoryPoolStore> {
    /// Configuration
    config: PoolManagerConfig,
    /// Pool row storage
    store: Arc<S>,
}

impl PoolManager<MemoryPoolStore> {
    /// Create a new PoolManager over in-memory storage
    pub fn new() -> Self {
        Self::with_config(PoolManagerConfig::default())
    }

    /// Create a new PoolManager with custom configuration
    pub fn with_config(config: PoolManagerConfig) -> Self {
        Self::with_store(Arc::new(MemoryPoolStore::new()), config)
    }
}

impl<S: PoolStore> PoolManager<S> {
    /// Create a PoolManager over an existing store
    pub fn with_store(store: Arc<S>, config: PoolManagerConfig) -> Self {
        Self { config, store }
    }

    /// Run `f` inside one transaction, committing on `Ok` and rolling back on `Err`.
    fn in_txn<T>(&self, f: impl FnOnce(&S::Txn) -> Result<T>) -> Result<T> {
        let txn = self.store.begin();
        match f(&txn) {
            Ok(value) => {
                self.store.commit(txn)?;
                Ok(value)
            }
            Err(e) => {
                self.store.rollback(txn);
                Err(e)
            }
        }
    }

    // ==================== Pool Operations ====================

    /// Register a new top-level pool.
    ///
    /// The network must be the zeroth address of its block. Prefix bounds are
    /// stored on the root and constrain every request entering the tree.
    pub fn create_pool(&self, request: CreatePoolRequest) -> Result<PoolRecord> {
        let family = AddressFamily::of(request.network);
        if request.prefix_length > family.width() {
            return Err(Error::InvalidPool(format!(
                "prefix length /{} exceeds {} address width",
                request.prefix_length, family
            )));
        }
        if !netcalc::is_aligned(request.network, request.prefix_length) {
            return Err(Error::InvalidPool(format!(
                "{}/{} has host bits set",
                request.network, request.prefix_length
            )));
        }
        if let (Some(minimum), Some(maximum)) =
            (request.prefix_length_minimum, request.prefix_length_maximum)
        {
            if minimum > maximum {
                return Err(Error::InvalidPool(format!(
                    "prefix length minimum /{minimum} is larger than maximum /{maximum}"
                )));
            }
        }
        if let Some(maximum) = request.prefix_length_maximum {
            if maximum > family.width() {
                return Err(Error::InvalidPool(format!(
                    "prefix length maximum /{maximum} exceeds {family} address width"
                )));
            }
        }

        let pool = self.in_txn(|txn| {
            self.store.create(
                txn,
                NewPool {
                    family,
                    network: request.network,
                    prefix_length: request.prefix_length,
                    status: PoolStatus::Free,
                    description: request.description,
                    parent: None,
                    top_level: None,
                    prefix_length_default: request.prefix_length_default,
                    prefix_length_minimum: request.prefix_length_minimum,
                    prefix_length_maximum: request.prefix_length_maximum,
                },
            )
        })?;

        tracing::info!(
            pool_id = %pool.id,
            network = %pool.ip_subnet(),
            family = %pool.family,
            "Created pool"
        );

        Ok(pool)
    }

    /// Allocate the first free subnet of the given prefix length.
    ///
    /// With `prefix_length` of `None` the pool's configured default applies.
    /// Returns `Ok(None)` when the pool cannot satisfy the request.
    pub fn allocate_subnet(
        &self,
        pool_id: Uuid,
        prefix_length: Option<u8>,
    ) -> Result<Option<PoolRecord>> {
        let allocated =
            self.in_txn(|txn| allocator::allocate_subnet(&*self.store, txn, pool_id, prefix_length))?;

        match &allocated {
            Some(pool) => {
                tracing::info!(
                    pool_id = %pool_id,
                    subnet = %pool.ip_subnet(),
                    "Allocated subnet"
                );
            }
            None => {
                tracing::debug!(
                    pool_id = %pool_id,
                    requested = ?prefix_length,
                    "No subnet available"
                );
            }
        }

        Ok(allocated)
    }

    /// Reserve a specific subnet inside the pool.
    ///
    /// Returns `Ok(None)` when the block is occupied, out of bounds, or not
    /// representable; the tree is left exactly as it was.
    pub fn reserve_subnet(
        &self,
        pool_id: Uuid,
        network: IpAddr,
        prefix_length: u8,
    ) -> Result<Option<PoolRecord>> {
        let reserved = self.in_txn(|txn| {
            allocator::reserve_subnet(&*self.store, txn, pool_id, network, prefix_length)
        })?;

        if let Some(pool) = &reserved {
            tracing::info!(
                pool_id = %pool_id,
                subnet = %pool.ip_subnet(),
                "Reserved subnet"
            );
        }

        Ok(reserved)
    }

    /// Report whether a reservation of the given subnet would succeed.
    ///
    /// Never modifies the tree, not even transiently.
    pub fn check_subnet_available(
        &self,
        pool_id: Uuid,
        network: IpAddr,
        prefix_length: u8,
    ) -> Result<bool> {
        self.in_txn(|txn| {
            allocator::check_subnet_available(&*self.store, txn, pool_id, network, prefix_length)
        })
    }

    /// Free an allocated leaf immediately and coalesce buddies upward.
    pub fn free_subnet(&self, pool_id: Uuid) -> Result<()> {
        self.in_txn(|txn| allocator::free_pool(&*self.store, txn, pool_id, false))?;
        tracing::info!(pool_id = %pool_id, "Freed subnet");
        Ok(())
    }

    /// Release an allocated leaf into hold-down.
    ///
    /// The block stays unavailable until [`reclaim_held_down`](Self::reclaim_held_down)
    /// frees it after the configured hold-down period.
    pub fn release_subnet(&self, pool_id: Uuid) -> Result<()> {
        self.in_txn(|txn| allocator::free_pool(&*self.store, txn, pool_id, true))?;
        tracing::info!(pool_id = %pool_id, "Released subnet into hold-down");
        Ok(())
    }

    /// Free every held-down leaf in the pool's tree whose hold-down period
    /// has expired. Returns the number of leaves freed.
    pub fn reclaim_held_down(&self, pool_id: Uuid) -> Result<usize> {
        let top_level = self.store.get(pool_id)?.top_level;
        let reclaimed = self.in_txn(|txn| {
            allocator::reclaim_held_down(&*self.store, txn, top_level, self.config.hold_down_period)
        })?;

        if reclaimed > 0 {
            tracing::info!(
                pool_id = %top_level,
                reclaimed,
                "Reclaimed held-down subnets"
            );
        }

        Ok(reclaimed)
    }

    // ==================== Allocation Requests ====================

    /// Satisfy an allocation request, stamping the leaf with its owner.
    ///
    /// A request with a subnet hint reserves that exact block; one without is
    /// served first-fit. The request records the allocated leaf on success.
    pub fn satisfy_request(
        &self,
        request: &mut AllocationRequest,
        owner: Uuid,
    ) -> Result<PoolRecord> {
        let pool_id = request.pool;
        let prefix_length = request.prefix_length;
        let hint = request.subnet_hint;

        let allocated = self.in_txn(|txn| {
            let store = &*self.store;
            let pool = match hint {
                Some(hint) => {
                    allocator::reserve_subnet(store, txn, pool_id, hint.network(), prefix_length)?
                }
                None => allocator::allocate_subnet(store, txn, pool_id, Some(prefix_length))?,
            };
            let Some(mut pool) = pool else {
                return Err(Error::RequestUnsatisfiable {
                    pool: pool_id,
                    prefix_length,
                });
            };
            pool.allocation_owner = Some(owner);
            pool.allocation_timestamp = Some(Utc::now());
            store.update(txn, &pool)?;
            Ok(pool)
        })?;

        request.allocation = Some(allocated.id);
        tracing::info!(
            request_id = %request.id,
            pool_id = %pool_id,
            subnet = %allocated.ip_subnet(),
            owner = %owner,
            "Satisfied allocation request"
        );

        Ok(allocated)
    }

    /// Check whether a request still holds a live allocation matching its terms.
    pub fn is_satisfied(&self, request: &AllocationRequest) -> Result<bool> {
        let Some(allocation) = request.allocation else {
            return Ok(false);
        };
        let pool = match self.store.get(allocation) {
            Ok(pool) => pool,
            Err(Error::PoolNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(pool.family == request.family
            && pool.prefix_length == request.prefix_length
            && request
                .subnet_hint
                .map_or(true, |hint| pool.network == hint.network())
            && pool.top_level == request.pool)
    }

    /// Adopt the allocation of `other` when its terms match `request` exactly.
    ///
    /// Returns `true` when the allocation was carried over. The two requests
    /// then share one leaf; free it through only one of them.
    pub fn satisfy_from(
        &self,
        request: &mut AllocationRequest,
        other: &AllocationRequest,
    ) -> Result<bool> {
        if !self.is_satisfied(other)? {
            return Ok(false);
        }
        if request.family != other.family
            || request.prefix_length != other.prefix_length
            || request.pool != other.pool
            || request.subnet_hint != other.subnet_hint
        {
            return Ok(false);
        }
        request.allocation = other.allocation;
        Ok(true)
    }

    /// Check whether two requests are satisfied by the same leaf.
    pub fn requests_exactly_match(
        &self,
        a: &AllocationRequest,
        b: &AllocationRequest,
    ) -> Result<bool> {
        Ok(self.is_satisfied(a)? && self.is_satisfied(b)? && a.allocation == b.allocation)
    }

    /// Free a request's allocation immediately and clear the link.
    pub fn free_request(&self, request: &mut AllocationRequest) -> Result<()> {
        if let Some(allocation) = request.allocation {
            self.free_subnet(allocation)?;
            request.allocation = None;
        }
        Ok(())
    }

    /// Derive the router identifier for a satisfied request.
    ///
    /// The router id is the first host address of the allocated block. Returns
    /// `Ok(None)` for unsatisfied requests and for host-route allocations.
    pub fn router_id(&self, request: &AllocationRequest) -> Result<Option<IpAddr>> {
        let Some(allocation) = request.allocation else {
            return Ok(None);
        };
        let pool = self.store.get(allocation)?;
        Ok(netcalc::nth_address(pool.ip_subnet(), 1))
    }

    // ==================== Lookups ====================

    /// Get a pool row by ID
    pub fn get_pool(&self, pool_id: Uuid) -> Result<PoolRecord> {
        self.store.get(pool_id)
    }

    /// Get the top-level root of the tree containing a pool
    pub fn top_level_of(&self, pool_id: Uuid) -> Result<PoolRecord> {
        let pool = self.store.get(pool_id)?;
        self.store.get(pool.top_level)
    }

    /// Report whether a pool has no children
    pub fn is_leaf(&self, pool_id: Uuid) -> Result<bool> {
        self.store.get(pool_id)?;
        Ok(self.store.children_snapshot(pool_id)?.is_empty())
    }

    /// List all top-level pools
    pub fn list_pools(&self) -> Result<Vec<PoolRecord>> {
        self.store.roots()
    }

    /// Snapshot every row of the tree containing a pool, in address order
    pub fn pool_tree(&self, pool_id: Uuid) -> Result<Vec<PoolRecord>> {
        let pool = self.store.get(pool_id)?;
        self.store.tree_of(pool.top_level)
    }

    /// Check the structural invariants of the tree containing a pool.
    ///
    /// Meant for tests and offline audits; run it while no transaction is
    /// mutating the tree.
    pub fn verify_tree(&self, pool_id: Uuid) -> Result<()> {
        let pool = self.store.get(pool_id)?;
        allocator::verify_tree(&*self.store, pool.top_level)
    }

    // ==================== Statistics ====================

    /// Compute address accounting for the tree containing a pool.
    pub fn tree_statistics(&self, pool_id: Uuid) -> Result<PoolTreeStats> {
        let root = self.top_level_of(pool_id)?;
        let rows = self.store.tree_of(root.id)?;
        let parents: HashSet<Uuid> = rows.iter().filter_map(|row| row.parent).collect();

        let total = netcalc::address_count(root.family, root.prefix_length);
        let mut allocated = 0u128;
        let mut held_down = 0u128;
        let mut allocated_subnets = 0usize;
        let mut held_down_subnets = 0usize;

        // Only leaves carry addresses; an occupied interior row merely
        // summarizes its two children.
        for row in &rows {
            if parents.contains(&row.id) {
                continue;
            }
            match row.status {
                PoolStatus::Full => {
                    allocated += netcalc::address_count(row.family, row.prefix_length);
                    allocated_subnets += 1;
                }
                PoolStatus::HeldDown => {
                    held_down += netcalc::address_count(row.family, row.prefix_length);
                    held_down_subnets += 1;
                }
                PoolStatus::Free | PoolStatus::Partial => {}
            }
        }

        let free = total.saturating_sub(allocated).saturating_sub(held_down);
        let utilization_percent = (allocated as f64 / total as f64) * 100.0;

        Ok(PoolTreeStats {
            pool_id: root.id,
            family: root.family,
            total_addresses: total,
            allocated_addresses: allocated,
            held_down_addresses: held_down,
            free_addresses: free,
            allocated_subnets,
            held_down_subnets,
            utilization_percent,
        })
    }
}

impl Default for PoolManager<MemoryPoolStore> {
    fn default() -> Self {
        Self::new()
    }
}

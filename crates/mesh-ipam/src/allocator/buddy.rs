//! Binary buddy operations over a pool tree
//!
//! Blocks are split lazily: a request walks down from the root, bisecting
//! Free leaves until a block of the requested size exists, and always
//! descends into the lowest-addressed eligible child first. Freed blocks
//! coalesce back up as soon as both buddies are Free, so a quiesced tree is
//! the smallest tree that represents its allocations.

use chrono::{Duration, Utc};
use ipnet::IpNet;
use std::net::IpAddr;
use uuid::Uuid;

use crate::allocator::RESERVED_PREFIX_LENGTH;
use crate::error::{Error, Result};
use crate::models::{NewPool, PoolRecord, PoolStatus};
use crate::netcalc;
use crate::store::PoolStore;

/// Reservation target, computed once per reserve call
#[derive(Debug, Clone, Copy)]
struct ReserveTarget {
    /// Network address exactly as requested
    network: IpAddr,
    prefix_length: u8,
    /// Masked form, used for containment checks
    masked: IpNet,
    /// Whether `network` is the true network address for `prefix_length`
    aligned: bool,
}

impl ReserveTarget {
    /// None when the prefix length is not representable in the family.
    fn new(network: IpAddr, prefix_length: u8) -> Option<Self> {
        let masked = IpNet::new(network, prefix_length).ok()?.trunc();
        Some(Self {
            network,
            prefix_length,
            masked,
            aligned: netcalc::is_aligned(network, prefix_length),
        })
    }
}

enum ReserveOutcome {
    NoMatch,
    Satisfiable,
    Reserved(PoolRecord),
}

impl ReserveOutcome {
    fn is_match(&self) -> bool {
        !matches!(self, ReserveOutcome::NoMatch)
    }
}

/// Request constraints read from a tree's top-level root
fn within_bounds(root: &PoolRecord, prefix_length: u8) -> bool {
    if let Some(minimum) = root.prefix_length_minimum {
        if prefix_length < minimum {
            return false;
        }
    }
    if let Some(maximum) = root.prefix_length_maximum {
        if prefix_length > maximum {
            return false;
        }
    }
    true
}

/// Bisect a Free leaf into its two buddy halves.
///
/// The lower half keeps the parent's network address. The parent becomes
/// Partial; callers have already established that it is a Free leaf.
fn split_buddy<S: PoolStore>(
    store: &S,
    txn: &S::Txn,
    pool: &mut PoolRecord,
) -> Result<(PoolRecord, PoolRecord)> {
    let (lower, upper) = netcalc::bisect(pool.ip_subnet())?;
    let lower = store.create(txn, NewPool::child_of(pool, lower))?;
    let upper = store.create(txn, NewPool::child_of(pool, upper))?;
    pool.status = PoolStatus::Partial;
    store.update(txn, pool)?;
    Ok((lower, upper))
}

/// Allocate a subnet of the requested size from this pool's tree.
///
/// Applies the constraints of the relevant top-level root (default prefix
/// length when the caller names none, minimum/maximum bounds), refuses the
/// reserved prefix length, then runs the buddy descent. Returns None when no
/// block can satisfy the request.
pub fn allocate_subnet<S: PoolStore>(
    store: &S,
    txn: &S::Txn,
    pool_id: Uuid,
    prefix_length: Option<u8>,
) -> Result<Option<PoolRecord>> {
    store.with_lock(txn, pool_id, |pool| {
        let constraints = if pool.is_top_level() {
            pool
        } else {
            // Constraint columns are immutable after creation, so an
            // unlocked read of the root is sound here.
            store.get(pool.top_level)?
        };
        let Some(prefix_length) = prefix_length.or(constraints.prefix_length_default) else {
            return Ok(None);
        };
        if !within_bounds(&constraints, prefix_length) {
            return Ok(None);
        }
        if prefix_length == RESERVED_PREFIX_LENGTH {
            return Ok(None);
        }
        if prefix_length > constraints.family.width() {
            return Ok(None);
        }
        allocate_buddy(store, txn, pool_id, prefix_length)
    })
}

/// The buddy descent: left-packed first fit.
fn allocate_buddy<S: PoolStore>(
    store: &S,
    txn: &S::Txn,
    pool_id: Uuid,
    prefix_length: u8,
) -> Result<Option<PoolRecord>> {
    store.with_lock(txn, pool_id, |mut pool| {
        if pool.prefix_length > prefix_length {
            // Descended past the requested size; this branch cannot host it.
            return Ok(None);
        }
        if pool.prefix_length == prefix_length {
            if pool.status != PoolStatus::Free {
                return Ok(None);
            }
            pool.status = PoolStatus::Full;
            store.update(txn, &pool)?;
            return Ok(Some(pool));
        }

        let children = store.children_of(txn, pool.id)?;
        if children.is_empty() {
            if pool.status != PoolStatus::Free {
                return Ok(None);
            }
            let (lower, _upper) = split_buddy(store, txn, &mut pool)?;
            return allocate_buddy(store, txn, lower.id, prefix_length);
        }

        let mut allocated = None;
        for child in children.iter().filter(|c| !c.status.is_occupied()) {
            if let Some(found) = allocate_buddy(store, txn, child.id, prefix_length)? {
                allocated = Some(found);
                break;
            }
        }
        let Some(found) = allocated else {
            return Ok(None);
        };

        // The descent may have filled a child; re-read before deciding
        // whether this node is now Full itself.
        let children = store.children_of(txn, pool.id)?;
        if children.iter().filter(|c| c.status == PoolStatus::Full).count() == 2 {
            pool.status = PoolStatus::Full;
            store.update(txn, &pool)?;
        }
        Ok(Some(found))
    })
}

/// Reserve the specific subnet `network/prefix_length` if it is unallocated.
///
/// Returns the Full leaf on success, None when the block is occupied, out of
/// bounds, outside the tree, or not representable by bisection.
pub fn reserve_subnet<S: PoolStore>(
    store: &S,
    txn: &S::Txn,
    pool_id: Uuid,
    network: IpAddr,
    prefix_length: u8,
) -> Result<Option<PoolRecord>> {
    let Some(target) = ReserveTarget::new(network, prefix_length) else {
        return Ok(None);
    };
    match reserve_buddy(store, txn, pool_id, &target, false)? {
        ReserveOutcome::Reserved(pool) => Ok(Some(pool)),
        _ => Ok(None),
    }
}

/// Decide whether `reserve_subnet` would succeed, without mutating any row.
///
/// Runs the same traversal under the same locks, but the split descent is
/// decided arithmetically instead of performed, so no row is created,
/// deleted, or status-changed.
pub fn check_subnet_available<S: PoolStore>(
    store: &S,
    txn: &S::Txn,
    pool_id: Uuid,
    network: IpAddr,
    prefix_length: u8,
) -> Result<bool> {
    let Some(target) = ReserveTarget::new(network, prefix_length) else {
        return Ok(false);
    };
    Ok(reserve_buddy(store, txn, pool_id, &target, true)?.is_match())
}

fn reserve_buddy<S: PoolStore>(
    store: &S,
    txn: &S::Txn,
    pool_id: Uuid,
    target: &ReserveTarget,
    check_only: bool,
) -> Result<ReserveOutcome> {
    store.with_lock(txn, pool_id, |mut pool| {
        if target.prefix_length == RESERVED_PREFIX_LENGTH {
            return Ok(ReserveOutcome::NoMatch);
        }
        // Bounds apply only where requests enter: at a top-level root.
        if pool.is_top_level() && !within_bounds(&pool, target.prefix_length) {
            return Ok(ReserveOutcome::NoMatch);
        }
        if !pool.contains(target.masked) {
            return Ok(ReserveOutcome::NoMatch);
        }
        if pool.network == target.network
            && pool.prefix_length == target.prefix_length
            && pool.status == PoolStatus::Free
        {
            if check_only {
                return Ok(ReserveOutcome::Satisfiable);
            }
            pool.status = PoolStatus::Full;
            store.update(txn, &pool)?;
            return Ok(ReserveOutcome::Reserved(pool));
        }

        let children = store.children_of(txn, pool.id)?;
        if children.is_empty() {
            if pool.status != PoolStatus::Free {
                return Ok(ReserveOutcome::NoMatch);
            }
            if check_only {
                // A Free leaf can be carved down to any aligned block it
                // contains; deciding that needs no rows.
                return Ok(if target.aligned {
                    ReserveOutcome::Satisfiable
                } else {
                    ReserveOutcome::NoMatch
                });
            }

            let (lower, upper) = split_buddy(store, txn, &mut pool)?;
            let mut outcome = ReserveOutcome::NoMatch;
            for child_id in [lower.id, upper.id] {
                outcome = reserve_buddy(store, txn, child_id, target, check_only)?;
                if outcome.is_match() {
                    break;
                }
            }
            if !outcome.is_match() {
                // Unwind the split this call made; deeper failed splits were
                // already unwound by the recursion.
                let children = store.children_of(txn, pool.id)?;
                let ids: Vec<Uuid> = children.iter().map(|c| c.id).collect();
                store.delete(txn, &ids)?;
                pool.status = PoolStatus::Free;
                store.update(txn, &pool)?;
            }
            return Ok(outcome);
        }

        let mut outcome = ReserveOutcome::NoMatch;
        for child in children.iter().filter(|c| !c.status.is_occupied()) {
            outcome = reserve_buddy(store, txn, child.id, target, check_only)?;
            if outcome.is_match() {
                break;
            }
        }
        if !outcome.is_match() {
            return Ok(ReserveOutcome::NoMatch);
        }
        if !check_only {
            let children = store.children_of(txn, pool.id)?;
            if children.iter().filter(|c| c.status == PoolStatus::Full).count() == 2 {
                pool.status = PoolStatus::Full;
                store.update(txn, &pool)?;
            }
        }
        Ok(outcome)
    })
}

/// Coalesce freed buddies upward, starting at `pool_id`.
///
/// A node whose children are both Free absorbs them: the pair is deleted and
/// the node becomes a Free leaf. Partially freed nodes become Partial. The
/// walk continues toward the root until a node's status needs no change.
pub fn reclaim_pools<S: PoolStore>(store: &S, txn: &S::Txn, pool_id: Uuid) -> Result<()> {
    store.with_lock(txn, pool_id, |mut pool| {
        if pool.status == PoolStatus::Free {
            // Leaf already freed; continue coalescing from the parent.
            return match pool.parent {
                Some(parent) => reclaim_pools(store, txn, parent),
                None => Ok(()),
            };
        }

        let children = store.children_of(txn, pool.id)?;
        let free = children
            .iter()
            .filter(|c| c.status == PoolStatus::Free)
            .count();
        let partial = children
            .iter()
            .filter(|c| c.status == PoolStatus::Partial)
            .count();

        if free == 2 {
            let ids: Vec<Uuid> = children.iter().map(|c| c.id).collect();
            store.delete(txn, &ids)?;
            pool.status = PoolStatus::Free;
            store.update(txn, &pool)?;
        } else if free == 1 || partial > 0 {
            pool.status = PoolStatus::Partial;
            store.update(txn, &pool)?;
        } else {
            // Nothing freed below this node; the path above is unaffected.
            return Ok(());
        }

        match pool.parent {
            Some(parent) => reclaim_pools(store, txn, parent),
            None => Ok(()),
        }
    })
}

/// Return a leaf to the pool.
///
/// With `hold_down` the leaf is parked as HeldDown and keeps its block out
/// of circulation until the hold-down sweep expires it; otherwise it becomes
/// Free immediately and buddies coalesce right away. Freeing a node with
/// children is an error. Whether the leaf was actually allocated is the
/// caller's concern; this operation does not re-validate it.
pub fn free_pool<S: PoolStore>(
    store: &S,
    txn: &S::Txn,
    pool_id: Uuid,
    hold_down: bool,
) -> Result<()> {
    store.with_lock(txn, pool_id, |mut pool| {
        let children = store.children_of(txn, pool.id)?;
        if !children.is_empty() {
            return Err(Error::NotALeaf(pool.id));
        }

        pool.allocation_owner = None;
        pool.allocation_timestamp = None;
        if hold_down {
            pool.status = PoolStatus::HeldDown;
            pool.held_from = Some(Utc::now());
            store.update(txn, &pool)?;
            Ok(())
        } else {
            pool.status = PoolStatus::Free;
            pool.held_from = None;
            store.update(txn, &pool)?;
            reclaim_pools(store, txn, pool.id)
        }
    })
}

/// Hard-free every HeldDown row of the tree whose hold-down period expired.
///
/// Returns the number of subnets returned to the pool. Candidates come from
/// an unlocked snapshot and are re-checked under their lock, so a row that
/// expired or vanished concurrently is simply skipped.
pub fn reclaim_held_down<S: PoolStore>(
    store: &S,
    txn: &S::Txn,
    top_level: Uuid,
    period: Duration,
) -> Result<usize> {
    let cutoff = Utc::now() - period;
    let mut reclaimed = 0;
    for row in store.tree_of(top_level)? {
        if row.status != PoolStatus::HeldDown {
            continue;
        }
        let fresh = match store.lock(txn, row.id) {
            Ok(fresh) => fresh,
            Err(Error::PoolNotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        if fresh.status == PoolStatus::HeldDown
            && fresh.held_from.map_or(true, |from| from <= cutoff)
        {
            free_pool(store, txn, fresh.id, false)?;
            reclaimed += 1;
        }
    }
    Ok(reclaimed)
}

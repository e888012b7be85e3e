//! Pool row storage
//!
//! The tree operations never touch rows directly; they go through a
//! [`PoolStore`], a transactional repository with exclusive row locks. The
//! locking discipline mirrors `SELECT ... FOR UPDATE`:
//!
//! - [`PoolStore::lock`] re-reads a row under its exclusive lock. Operations
//!   call it immediately before inspecting or mutating a node and trust no
//!   record obtained earlier in the transaction's life.
//! - Locks accumulate for the life of the transaction and release in one go
//!   at commit or rollback.
//! - Acquisition blocks. When blocking would close a wait cycle the store
//!   fails the acquisition with [`Deadlock`](crate::Error::Deadlock) instead;
//!   the transaction must then be rolled back. Nothing in this crate retries
//!   a deadlocked operation, that stays with the caller.

mod memory;

pub use memory::{MemoryPoolStore, MemoryTransaction};

use uuid::Uuid;

use crate::error::Result;
use crate::models::{NewPool, PoolRecord};

/// Transactional repository for pool rows
pub trait PoolStore: Send + Sync {
    /// Transaction handle; every mutation happens inside one
    type Txn;

    /// Open a transaction
    fn begin(&self) -> Self::Txn;

    /// Publish every change of the transaction and release its locks
    fn commit(&self, txn: Self::Txn) -> Result<()>;

    /// Undo every change of the transaction and release its locks
    fn rollback(&self, txn: Self::Txn);

    /// Create a row; the creating transaction holds the new row's lock
    fn create(&self, txn: &Self::Txn, pool: NewPool) -> Result<PoolRecord>;

    /// Delete a set of rows; the transaction must hold every affected lock
    fn delete(&self, txn: &Self::Txn, ids: &[Uuid]) -> Result<()>;

    /// Lock a row, blocking if needed, and return a fresh copy of it
    fn lock(&self, txn: &Self::Txn, id: Uuid) -> Result<PoolRecord>;

    /// Write back a row; the transaction must hold its lock
    fn update(&self, txn: &Self::Txn, record: &PoolRecord) -> Result<()>;

    /// Lock and return all children of a row, in address order
    ///
    /// Callers hold the parent's lock, so the child set cannot change
    /// underneath the enumeration.
    fn children_of(&self, txn: &Self::Txn, parent: Uuid) -> Result<Vec<PoolRecord>>;

    /// Read one row without locking
    fn get(&self, id: Uuid) -> Result<PoolRecord>;

    /// Read all children of a row without locking, in address order
    fn children_snapshot(&self, parent: Uuid) -> Result<Vec<PoolRecord>>;

    /// Read every row of one tree without locking, parents before children
    ///
    /// Advisory: concurrent transactions may commit while the scan runs.
    fn tree_of(&self, top_level: Uuid) -> Result<Vec<PoolRecord>>;

    /// Read all top-level pools without locking, in address order
    fn roots(&self) -> Result<Vec<PoolRecord>>;

    /// Run `f` on a freshly locked copy of the row
    ///
    /// The lock-then-reinspect discipline as a first-class seam: every
    /// mutating tree operation enters through this.
    fn with_lock<T, F>(&self, txn: &Self::Txn, id: Uuid, f: F) -> Result<T>
    where
        Self: Sized,
        F: FnOnce(PoolRecord) -> Result<T>,
    {
        f(self.lock(txn, id)?)
    }
}

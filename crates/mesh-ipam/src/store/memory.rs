//! In-memory pool store for development and testing
//!
//! Backs the repository contract with a concurrent row map plus an explicit
//! lock table. Row locks are exclusive, re-entrant within a transaction, and
//! held until the transaction finishes. A blocked acquisition that would
//! close a wait cycle fails with `Error::Deadlock` instead of waiting, the
//! same way a database aborts one victim of a lock cycle. Every change is
//! recorded in an undo log so rollback leaves no trace of the transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{AddressFamily, NewPool, PoolRecord};
use crate::netcalc;
use crate::store::PoolStore;

/// Transaction handle for [`MemoryPoolStore`]
///
/// Obtained from `begin`; must be finished with `commit` or `rollback` so
/// the locks it accumulated are released.
#[derive(Debug)]
pub struct MemoryTransaction {
    id: u64,
}

enum UndoOp {
    Created(Uuid),
    Updated(PoolRecord),
    Deleted(PoolRecord),
}

#[derive(Default)]
struct TxnState {
    held: Vec<Uuid>,
    undo: Vec<UndoOp>,
}

#[derive(Default)]
struct LockTable {
    /// row -> owning transaction
    owners: HashMap<Uuid, u64>,
    /// transaction -> row it is blocked on
    waiting: HashMap<u64, Uuid>,
    /// transaction -> locks held and undo log
    txns: HashMap<u64, TxnState>,
}

/// In-memory [`PoolStore`]
pub struct MemoryPoolStore {
    rows: DashMap<Uuid, PoolRecord>,
    table: Mutex<LockTable>,
    released: Condvar,
    next_txn: AtomicU64,
}

impl MemoryPoolStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            next_txn: AtomicU64::new(1),
        }
    }

    /// Block until `txn` owns the lock on `id`, or fail with `Deadlock`.
    fn acquire(&self, txn: u64, id: Uuid) -> Result<()> {
        let mut table = self.table.lock();
        loop {
            let owner = table.owners.get(&id).copied();
            match owner {
                None => {
                    table.owners.insert(id, txn);
                    table.txns.entry(txn).or_default().held.push(id);
                    return Ok(());
                }
                Some(current) if current == txn => return Ok(()),
                Some(current) => {
                    if Self::closes_cycle(&table, txn, current) {
                        return Err(Error::Deadlock(id));
                    }
                    table.waiting.insert(txn, id);
                    self.released.wait(&mut table);
                    table.waiting.remove(&txn);
                }
            }
        }
    }

    /// Walk the wait-for chain starting at `owner`. Each transaction waits on
    /// at most one row, so the chain is linear; reaching `txn` means waiting
    /// would close a cycle.
    fn closes_cycle(table: &LockTable, txn: u64, mut owner: u64) -> bool {
        loop {
            if owner == txn {
                return true;
            }
            let Some(wanted) = table.waiting.get(&owner) else {
                return false;
            };
            match table.owners.get(wanted) {
                Some(next) => owner = *next,
                None => return false,
            }
        }
    }

    fn owns_lock(&self, txn: u64, id: Uuid) -> bool {
        self.table.lock().owners.get(&id) == Some(&txn)
    }

    fn push_undo(&self, txn: u64, op: UndoOp) {
        self.table.lock().txns.entry(txn).or_default().undo.push(op);
    }

    /// Drop the transaction's bookkeeping and wake anyone blocked on its rows.
    fn release_all(&self, txn: u64) -> Option<TxnState> {
        let mut table = self.table.lock();
        let state = table.txns.remove(&txn);
        if let Some(state) = &state {
            for id in &state.held {
                if table.owners.get(id) == Some(&txn) {
                    table.owners.remove(id);
                }
            }
        }
        self.released.notify_all();
        state
    }

    fn rollback_inner(&self, txn: u64) {
        // Rewind while the row locks are still held, then release.
        let undo = {
            let mut table = self.table.lock();
            table
                .txns
                .get_mut(&txn)
                .map(|state| std::mem::take(&mut state.undo))
        };
        if let Some(undo) = undo {
            for op in undo.into_iter().rev() {
                match op {
                    UndoOp::Created(id) => {
                        self.rows.remove(&id);
                    }
                    UndoOp::Updated(old) | UndoOp::Deleted(old) => {
                        self.rows.insert(old.id, old);
                    }
                }
            }
        }
        self.release_all(txn);
    }

    fn sorted_records<F>(&self, keep: F) -> Vec<PoolRecord>
    where
        F: Fn(&PoolRecord) -> bool,
    {
        let mut records: Vec<PoolRecord> = self
            .rows
            .iter()
            .filter(|row| keep(row))
            .map(|row| row.clone())
            .collect();
        records.sort_unstable_by_key(|r| (netcalc::address_key(r.network), r.prefix_length));
        records
    }
}

impl Default for MemoryPoolStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolStore for MemoryPoolStore {
    type Txn = MemoryTransaction;

    fn begin(&self) -> MemoryTransaction {
        let id = self.next_txn.fetch_add(1, Ordering::Relaxed);
        self.table.lock().txns.insert(id, TxnState::default());
        MemoryTransaction { id }
    }

    fn commit(&self, txn: MemoryTransaction) -> Result<()> {
        self.release_all(txn.id);
        Ok(())
    }

    fn rollback(&self, txn: MemoryTransaction) {
        self.rollback_inner(txn.id);
    }

    fn create(&self, txn: &MemoryTransaction, pool: NewPool) -> Result<PoolRecord> {
        if pool.prefix_length > pool.family.width() {
            return Err(Error::InvalidPool(format!(
                "prefix length {} exceeds {} width",
                pool.prefix_length, pool.family
            )));
        }
        if AddressFamily::of(pool.network) != pool.family {
            return Err(Error::InvalidPool(format!(
                "network {} is not an {} address",
                pool.network, pool.family
            )));
        }

        let id = Uuid::new_v4();
        let record = PoolRecord {
            id,
            family: pool.family,
            network: pool.network,
            prefix_length: pool.prefix_length,
            status: pool.status,
            description: pool.description,
            parent: pool.parent,
            // A row without a parent is the root of its own tree.
            top_level: pool.top_level.unwrap_or(id),
            prefix_length_default: pool.prefix_length_default,
            prefix_length_minimum: pool.prefix_length_minimum,
            prefix_length_maximum: pool.prefix_length_maximum,
            allocation_owner: None,
            allocation_timestamp: None,
            held_from: None,
        };

        {
            let mut table = self.table.lock();
            table.owners.insert(id, txn.id);
            let state = table.txns.entry(txn.id).or_default();
            state.held.push(id);
            state.undo.push(UndoOp::Created(id));
        }
        self.rows.insert(id, record.clone());
        Ok(record)
    }

    fn delete(&self, txn: &MemoryTransaction, ids: &[Uuid]) -> Result<()> {
        for id in ids {
            if !self.owns_lock(txn.id, *id) {
                return Err(Error::LockDiscipline(*id));
            }
        }
        for id in ids {
            let Some((_, old)) = self.rows.remove(id) else {
                return Err(Error::PoolNotFound(*id));
            };
            self.push_undo(txn.id, UndoOp::Deleted(old));
        }
        Ok(())
    }

    fn lock(&self, txn: &MemoryTransaction, id: Uuid) -> Result<PoolRecord> {
        self.acquire(txn.id, id)?;
        self.rows
            .get(&id)
            .map(|row| row.clone())
            .ok_or(Error::PoolNotFound(id))
    }

    fn update(&self, txn: &MemoryTransaction, record: &PoolRecord) -> Result<()> {
        if !self.owns_lock(txn.id, record.id) {
            return Err(Error::LockDiscipline(record.id));
        }
        let old = self
            .rows
            .get(&record.id)
            .map(|row| row.clone())
            .ok_or(Error::PoolNotFound(record.id))?;
        self.push_undo(txn.id, UndoOp::Updated(old));
        self.rows.insert(record.id, record.clone());
        Ok(())
    }

    fn children_of(&self, txn: &MemoryTransaction, parent: Uuid) -> Result<Vec<PoolRecord>> {
        let mut ids: Vec<(u128, u8, Uuid)> = self
            .rows
            .iter()
            .filter(|row| row.parent == Some(parent))
            .map(|row| (netcalc::address_key(row.network), row.prefix_length, row.id))
            .collect();
        ids.sort_unstable();

        let mut children = Vec::with_capacity(ids.len());
        for (_, _, id) in ids {
            children.push(self.lock(txn, id)?);
        }
        Ok(children)
    }

    fn get(&self, id: Uuid) -> Result<PoolRecord> {
        self.rows
            .get(&id)
            .map(|row| row.clone())
            .ok_or(Error::PoolNotFound(id))
    }

    fn children_snapshot(&self, parent: Uuid) -> Result<Vec<PoolRecord>> {
        Ok(self.sorted_records(|row| row.parent == Some(parent)))
    }

    fn tree_of(&self, top_level: Uuid) -> Result<Vec<PoolRecord>> {
        Ok(self.sorted_records(|row| row.top_level == top_level))
    }

    fn roots(&self) -> Result<Vec<PoolRecord>> {
        Ok(self.sorted_records(|row| row.parent.is_none()))
    }
}

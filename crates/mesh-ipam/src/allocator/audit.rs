//! Structural verification of pool trees
//!
//! Walks a whole tree and checks every invariant a quiesced tree upholds:
//! binary structure with true buddy halves, the status algebra, field
//! consistency, and full coalescing. Intended for tests and operational
//! spot checks; the first violation found is returned as
//! [`Error::CorruptTree`].

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{PoolRecord, PoolStatus};
use crate::netcalc;
use crate::store::PoolStore;

/// Verify the structural invariants of one pool tree.
///
/// Reads an unlocked snapshot, so run it on a quiesced tree; a tree with
/// transactions in flight can legitimately fail mid-change checks.
pub fn verify_tree<S: PoolStore>(store: &S, top_level: Uuid) -> Result<()> {
    let rows = store.tree_of(top_level)?;
    if rows.is_empty() {
        return Err(Error::CorruptTree(format!(
            "tree {} has no rows",
            top_level
        )));
    }

    let by_id: HashMap<Uuid, &PoolRecord> = rows.iter().map(|row| (row.id, row)).collect();
    let mut children: HashMap<Uuid, Vec<&PoolRecord>> = HashMap::new();
    let mut root = None;

    for row in &rows {
        match row.parent {
            None => {
                if row.id != top_level {
                    return Err(Error::CorruptTree(format!(
                        "{} is parentless but not the root",
                        row
                    )));
                }
                root = Some(row);
            }
            Some(parent) => {
                if !by_id.contains_key(&parent) {
                    return Err(Error::CorruptTree(format!(
                        "{} points at a parent outside the tree",
                        row
                    )));
                }
                children.entry(parent).or_default().push(row);
            }
        }
    }

    let Some(root) = root else {
        return Err(Error::CorruptTree(format!(
            "tree {} has no root row",
            top_level
        )));
    };

    for row in &rows {
        if row.family != root.family {
            return Err(Error::CorruptTree(format!(
                "{} is not {} like the rest of the tree",
                row, root.family
            )));
        }
        if !row.is_top_level()
            && (row.prefix_length_default.is_some()
                || row.prefix_length_minimum.is_some()
                || row.prefix_length_maximum.is_some())
        {
            return Err(Error::CorruptTree(format!(
                "{} carries request constraints but is not a top-level pool",
                row
            )));
        }
        verify_status_fields(row)?;

        let mut node_children = children.get(&row.id).cloned().unwrap_or_default();
        node_children.sort_unstable_by_key(|c| netcalc::address_key(c.network));
        match node_children.len() {
            0 => {
                if row.status == PoolStatus::Partial {
                    return Err(Error::CorruptTree(format!("leaf {} is Partial", row)));
                }
            }
            2 => {
                verify_partition(row, &node_children)?;
                verify_status_algebra(row, &node_children)?;
            }
            n => {
                return Err(Error::CorruptTree(format!(
                    "{} has {} children instead of 0 or 2",
                    row, n
                )));
            }
        }
    }
    Ok(())
}

fn verify_status_fields(row: &PoolRecord) -> Result<()> {
    if row.allocation_owner.is_some() && row.status != PoolStatus::Full {
        return Err(Error::CorruptTree(format!(
            "{} carries an owner but is not Full",
            row
        )));
    }
    match (row.status == PoolStatus::HeldDown, row.held_from.is_some()) {
        (true, false) => Err(Error::CorruptTree(format!(
            "{} is held down without a hold-down start",
            row
        ))),
        (false, true) => Err(Error::CorruptTree(format!(
            "{} carries a hold-down start but is not held down",
            row
        ))),
        _ => Ok(()),
    }
}

fn verify_partition(parent: &PoolRecord, children: &[&PoolRecord]) -> Result<()> {
    let (lower, upper) = netcalc::bisect(parent.ip_subnet())?;
    if children[0].ip_subnet() != lower || children[1].ip_subnet() != upper {
        return Err(Error::CorruptTree(format!(
            "children of {} are {} and {}, not its buddy halves",
            parent,
            children[0],
            children[1]
        )));
    }
    for child in children {
        if child.top_level != parent.top_level {
            return Err(Error::CorruptTree(format!(
                "{} does not point at its tree's root",
                child
            )));
        }
    }
    Ok(())
}

fn verify_status_algebra(parent: &PoolRecord, children: &[&PoolRecord]) -> Result<()> {
    let full = children
        .iter()
        .filter(|c| c.status == PoolStatus::Full)
        .count();
    let free = children
        .iter()
        .filter(|c| c.status == PoolStatus::Free)
        .count();
    let occupied = children
        .iter()
        .filter(|c| c.status.is_occupied())
        .count();

    match parent.status {
        PoolStatus::Free | PoolStatus::HeldDown => Err(Error::CorruptTree(format!(
            "{} has children but is marked {:?}",
            parent, parent.status
        ))),
        // Hold-down demotes no ancestors, so a Full parent may sit over
        // held-down children; a Free or Partial child under it is corrupt.
        PoolStatus::Full if occupied != 2 => Err(Error::CorruptTree(format!(
            "{} is Full but a child still has available space",
            parent
        ))),
        PoolStatus::Partial if full == 2 => Err(Error::CorruptTree(format!(
            "{} is Partial but both children are Full",
            parent
        ))),
        _ => {
            if free == 2 {
                Err(Error::CorruptTree(format!(
                    "{} holds an uncoalesced pair of Free buddies",
                    parent
                )))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{allocate_subnet, free_pool, reserve_subnet};
    use crate::models::{AddressFamily, NewPool};
    use crate::store::MemoryPoolStore;
    use std::net::IpAddr;
    use std::str::FromStr;

    fn create_root(store: &MemoryPoolStore, network: &str, prefix_length: u8) -> PoolRecord {
        let txn = store.begin();
        let root = store
            .create(
                &txn,
                NewPool {
                    family: AddressFamily::Ipv4,
                    network: IpAddr::from_str(network).unwrap(),
                    prefix_length,
                    status: PoolStatus::Free,
                    description: None,
                    parent: None,
                    top_level: None,
                    prefix_length_default: None,
                    prefix_length_minimum: None,
                    prefix_length_maximum: None,
                },
            )
            .unwrap();
        store.commit(txn).unwrap();
        root
    }

    fn mutate(store: &MemoryPoolStore, id: Uuid, f: impl FnOnce(&mut PoolRecord)) {
        let txn = store.begin();
        let mut row = store.lock(&txn, id).unwrap();
        f(&mut row);
        store.update(&txn, &row).unwrap();
        store.commit(txn).unwrap();
    }

    #[test]
    fn test_trees_built_by_operations_verify() {
        let store = MemoryPoolStore::new();
        let root = create_root(&store, "10.0.0.0", 16);

        let txn = store.begin();
        allocate_subnet(&store, &txn, root.id, Some(24)).unwrap().unwrap();
        let reserved = reserve_subnet(
            &store,
            &txn,
            root.id,
            IpAddr::from_str("10.0.128.0").unwrap(),
            20,
        )
        .unwrap()
        .unwrap();
        store.commit(txn).unwrap();

        verify_tree(&store, root.id).unwrap();

        let txn = store.begin();
        free_pool(&store, &txn, reserved.id, false).unwrap();
        store.commit(txn).unwrap();

        verify_tree(&store, root.id).unwrap();
    }

    #[test]
    fn test_hold_down_under_full_parent_verifies() {
        let store = MemoryPoolStore::new();
        let root = create_root(&store, "10.0.0.0", 24);

        let txn = store.begin();
        let first = allocate_subnet(&store, &txn, root.id, Some(25)).unwrap().unwrap();
        allocate_subnet(&store, &txn, root.id, Some(25)).unwrap().unwrap();
        store.commit(txn).unwrap();
        assert_eq!(store.get(root.id).unwrap().status, PoolStatus::Full);

        // Releasing into hold-down leaves the Full ancestor in place; the
        // block below it is still unavailable.
        let txn = store.begin();
        free_pool(&store, &txn, first.id, true).unwrap();
        store.commit(txn).unwrap();

        assert_eq!(store.get(root.id).unwrap().status, PoolStatus::Full);
        verify_tree(&store, root.id).unwrap();
    }

    #[test]
    fn test_partial_leaf_is_flagged() {
        let store = MemoryPoolStore::new();
        let root = create_root(&store, "10.0.0.0", 16);

        mutate(&store, root.id, |row| row.status = PoolStatus::Partial);

        assert!(matches!(
            verify_tree(&store, root.id),
            Err(Error::CorruptTree(_))
        ));
    }

    #[test]
    fn test_wrong_full_propagation_is_flagged() {
        let store = MemoryPoolStore::new();
        let root = create_root(&store, "10.0.0.0", 16);

        let txn = store.begin();
        allocate_subnet(&store, &txn, root.id, Some(17)).unwrap().unwrap();
        store.commit(txn).unwrap();

        // One child Full, one Free: the parent must be Partial, not Full.
        mutate(&store, root.id, |row| row.status = PoolStatus::Full);

        assert!(matches!(
            verify_tree(&store, root.id),
            Err(Error::CorruptTree(_))
        ));
    }

    #[test]
    fn test_stray_owner_is_flagged() {
        let store = MemoryPoolStore::new();
        let root = create_root(&store, "10.0.0.0", 16);

        mutate(&store, root.id, |row| {
            row.allocation_owner = Some(Uuid::new_v4())
        });

        assert!(matches!(
            verify_tree(&store, root.id),
            Err(Error::CorruptTree(_))
        ));
    }

    #[test]
    fn test_missing_hold_down_start_is_flagged() {
        let store = MemoryPoolStore::new();
        let root = create_root(&store, "10.0.0.0", 16);

        mutate(&store, root.id, |row| row.status = PoolStatus::HeldDown);

        assert!(matches!(
            verify_tree(&store, root.id),
            Err(Error::CorruptTree(_))
        ));
    }
}

//! Persistent state store interface and a deterministic in-memory implementation.
//!
//! The engine only needs two things from the store: point reads at a given
//! root, and a batched update that yields a new root. Storage internals live
//! behind [`StateStore`].

use crate::error::StoreError;
use crate::types::StateRoot;
use alloy_primitives::keccak256;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// A content-addressed key/value store versioned by state root.
pub trait StateStore: Send + Sync {
    /// Reads the value at `address` as of `root`. `Ok(None)` means absent.
    fn read(&self, root: &StateRoot, address: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Applies `updates` and `deletes` on top of `root` and returns the new root.
    ///
    /// With `is_virtual` the new root is only computed, nothing is committed.
    fn batch_update(
        &self,
        root: &StateRoot,
        updates: &BTreeMap<String, Vec<u8>>,
        deletes: &[String],
        is_virtual: bool,
    ) -> Result<StateRoot, StoreError>;

    fn contains(&self, root: &StateRoot, address: &str) -> Result<bool, StoreError> {
        Ok(self.read(root, address)?.is_some())
    }
}

/// Record of a persisted update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub root: StateRoot,
    pub parent: StateRoot,
    pub additions: Vec<String>,
    pub deletions: Vec<String>,
}

type Snapshot = Arc<BTreeMap<String, Vec<u8>>>;

/// In-memory store keeping a full snapshot per persisted root.
///
/// Roots are keccak-256 commitments over the sorted key/value set, so the same
/// state always produces the same root regardless of how it was reached.
pub struct MemoryStore {
    snapshots: RwLock<HashMap<StateRoot, Snapshot>>,
    change_log: RwLock<HashMap<StateRoot, ChangeLogEntry>>,
    initial_root: StateRoot,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::with_state(std::iter::empty())
    }

    /// Creates a store whose initial root holds the given entries.
    pub fn with_state<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let state: BTreeMap<String, Vec<u8>> = entries.into_iter().collect();
        let root = compute_root(&state);
        let mut snapshots = HashMap::new();
        snapshots.insert(root, Arc::new(state));
        Self {
            snapshots: RwLock::new(snapshots),
            change_log: RwLock::new(HashMap::new()),
            initial_root: root,
        }
    }

    pub fn initial_root(&self) -> StateRoot {
        self.initial_root
    }

    pub fn has_root(&self, root: &StateRoot) -> bool {
        self.snapshots.read().contains_key(root)
    }

    /// Returns the change log written when `root` was persisted.
    pub fn change_log(&self, root: &StateRoot) -> Option<ChangeLogEntry> {
        self.change_log.read().get(root).cloned()
    }

    /// Returns every entry at `root`, in address order.
    pub fn entries(&self, root: &StateRoot) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let snapshot = self.snapshot(root)?;
        Ok(snapshot.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn snapshot(&self, root: &StateRoot) -> Result<Snapshot, StoreError> {
        self.snapshots
            .read()
            .get(root)
            .cloned()
            .ok_or(StoreError::UnknownRoot(*root))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStore {
    fn read(&self, root: &StateRoot, address: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.snapshot(root)?.get(address).cloned())
    }

    fn batch_update(
        &self,
        root: &StateRoot,
        updates: &BTreeMap<String, Vec<u8>>,
        deletes: &[String],
        is_virtual: bool,
    ) -> Result<StateRoot, StoreError> {
        let parent = self.snapshot(root)?;
        let mut next = (*parent).clone();
        for (address, value) in updates {
            next.insert(address.clone(), value.clone());
        }
        let mut deletions = Vec::new();
        for address in deletes {
            if next.remove(address).is_some() {
                deletions.push(address.clone());
            }
        }
        let new_root = compute_root(&next);

        if !is_virtual {
            let entry = ChangeLogEntry {
                root: new_root,
                parent: *root,
                additions: updates.keys().cloned().collect(),
                deletions,
            };
            self.snapshots.write().insert(new_root, Arc::new(next));
            self.change_log.write().insert(new_root, entry);
            debug!(parent = %root, root = %new_root, "persisted state update");
        }

        Ok(new_root)
    }
}

/// Commits to a full key/value set.
pub fn compute_root(state: &BTreeMap<String, Vec<u8>>) -> StateRoot {
    let mut buf = Vec::new();
    for (address, value) in state {
        buf.extend_from_slice(&(address.len() as u32).to_be_bytes());
        buf.extend_from_slice(address.as_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        buf.extend_from_slice(value);
    }
    keccak256(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_update_does_not_commit() {
        let store = MemoryStore::new();
        let root = store.initial_root();

        let mut updates = BTreeMap::new();
        updates.insert("aa".to_string(), b"1".to_vec());

        let preview = store.batch_update(&root, &updates, &[], true).unwrap();
        assert_ne!(preview, root);
        assert!(!store.has_root(&preview));
        assert!(store.change_log(&preview).is_none());

        let committed = store.batch_update(&root, &updates, &[], false).unwrap();
        assert_eq!(preview, committed);
        assert_eq!(store.read(&committed, "aa").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.read(&root, "aa").unwrap(), None);
    }

    #[test]
    fn test_roots_are_content_addressed() {
        let a = MemoryStore::with_state([("aa".to_string(), b"1".to_vec())]);
        let b = MemoryStore::new();

        let mut updates = BTreeMap::new();
        updates.insert("aa".to_string(), b"1".to_vec());
        let root = b.batch_update(&b.initial_root(), &updates, &[], false).unwrap();

        assert_eq!(a.initial_root(), root);
    }

    #[test]
    fn test_change_log_records_deletions_present_at_parent() {
        let store = MemoryStore::with_state([("aa".to_string(), b"1".to_vec())]);
        let root = store.initial_root();

        let deletes = vec!["aa".to_string(), "bb".to_string()];
        let new_root = store
            .batch_update(&root, &BTreeMap::new(), &deletes, false)
            .unwrap();

        let entry = store.change_log(&new_root).unwrap();
        assert_eq!(entry.parent, root);
        assert_eq!(entry.deletions, vec!["aa".to_string()]);
        assert_eq!(new_root, MemoryStore::new().initial_root());
    }

    #[test]
    fn test_unknown_root() {
        let store = MemoryStore::new();
        let bogus = StateRoot::repeat_byte(0x11);
        assert_eq!(
            store.read(&bogus, "aa"),
            Err(StoreError::UnknownRoot(bogus))
        );
    }
}

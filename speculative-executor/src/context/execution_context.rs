//! Per-transaction state view and the per-address futures backing it.

use crate::error::{ContextError, StoreError};
use crate::types::{ContextId, Event, StateRoot};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    /// Queued for the prefetch pipeline.
    AwaitingStore,
    /// Value as of the start of the context, from the store or the chain.
    ByStore(Option<Vec<u8>>),
    /// Written by the context itself; `None` is a deletion.
    ByContext(Option<Vec<u8>>),
    /// The store read failed.
    Failed(StoreError),
}

/// Outcome of a point read against the store.
pub(crate) type StoreRead = Result<Option<Vec<u8>>, StoreError>;

#[derive(Debug)]
struct FutureState {
    resolution: Resolution,
    frozen: bool,
}

/// One address's value inside a context.
///
/// A value set by the context always wins: a store resolution arriving
/// afterwards is dropped. Once frozen, nothing changes any more.
#[derive(Debug)]
pub(crate) struct ContextFuture {
    address: String,
    state: Mutex<FutureState>,
    resolved: Condvar,
}

impl ContextFuture {
    fn new(address: &str, resolution: Resolution) -> Self {
        Self {
            address: address.to_string(),
            state: Mutex::new(FutureState {
                resolution,
                frozen: false,
            }),
            resolved: Condvar::new(),
        }
    }

    pub(crate) fn awaiting_store(address: &str) -> Self {
        Self::new(address, Resolution::AwaitingStore)
    }

    pub(crate) fn with_value(address: &str, value: Option<Vec<u8>>) -> Self {
        Self::new(address, Resolution::ByStore(value))
    }

    /// Blocks while a store resolution is pending.
    pub(crate) fn result(&self) -> StoreRead {
        let mut state = self.state.lock();
        while state.resolution == Resolution::AwaitingStore {
            self.resolved.wait(&mut state);
        }
        match &state.resolution {
            Resolution::ByStore(value) | Resolution::ByContext(value) => Ok(value.clone()),
            Resolution::Failed(error) => Err(error.clone()),
            Resolution::AwaitingStore => Ok(None),
        }
    }

    /// `Some` if the context itself set or deleted the address.
    pub(crate) fn set_in_context(&self) -> Option<Option<Vec<u8>>> {
        match &self.state.lock().resolution {
            Resolution::ByContext(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn set_from_context(&self, value: Option<Vec<u8>>) {
        let mut state = self.state.lock();
        if state.frozen {
            warn!(address = %self.address, "tried to set address on a read-only context");
            return;
        }
        state.resolution = Resolution::ByContext(value);
        self.resolved.notify_all();
    }

    pub(crate) fn set_from_store(&self, read: StoreRead) {
        let mut state = self.state.lock();
        if state.frozen || state.resolution != Resolution::AwaitingStore {
            return;
        }
        state.resolution = match read {
            Ok(value) => Resolution::ByStore(value),
            Err(error) => Resolution::Failed(error),
        };
        self.resolved.notify_all();
    }

    /// Waits out a pending store resolution, then freezes. A failed read
    /// the context never overwrote is reported.
    pub(crate) fn freeze(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        while state.resolution == Resolution::AwaitingStore {
            self.resolved.wait(&mut state);
        }
        state.frozen = true;
        match &state.resolution {
            Resolution::Failed(error) => Err(error.clone()),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
struct ContextState {
    futures: HashMap<String, Arc<ContextFuture>>,
    read_only: bool,
    events: Vec<Event>,
    data: Vec<Vec<u8>>,
}

/// A transaction's isolated, speculative view of state.
///
/// Reads are allowed under the `read_list` namespaces and writes under the
/// `write_list` namespaces. Values not held here are looked up in the base
/// contexts and then in the store at `state_root` by the
/// [`ContextManager`](super::ContextManager).
pub struct ExecutionContext {
    id: ContextId,
    state_root: StateRoot,
    read_list: Vec<String>,
    write_list: Vec<String>,
    base_context_ids: Vec<ContextId>,
    state: Mutex<ContextState>,
}

impl ExecutionContext {
    pub(crate) fn new(
        id: ContextId,
        state_root: StateRoot,
        read_list: Vec<String>,
        write_list: Vec<String>,
        base_context_ids: Vec<ContextId>,
    ) -> Self {
        Self {
            id,
            state_root,
            read_list,
            write_list,
            base_context_ids,
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn state_root(&self) -> StateRoot {
        self.state_root
    }

    pub fn base_context_ids(&self) -> &[ContextId] {
        &self.base_context_ids
    }

    pub fn contains(&self, address: &str) -> bool {
        self.state.lock().futures.contains_key(address)
    }

    pub fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    pub fn validate_read(&self, address: &str) -> Result<(), ContextError> {
        if self.read_list.iter().any(|ns| address.starts_with(ns.as_str())) {
            Ok(())
        } else {
            Err(ContextError::unauthorized(address))
        }
    }

    pub fn validate_write(&self, address: &str) -> Result<(), ContextError> {
        if self.write_list.iter().any(|ns| address.starts_with(ns.as_str())) {
            Ok(())
        } else {
            Err(ContextError::unauthorized(address))
        }
    }

    fn future(&self, address: &str) -> Option<Arc<ContextFuture>> {
        self.state.lock().futures.get(address).cloned()
    }

    /// Values held by this context, `None` for anything it does not hold.
    /// Every address must be readable.
    pub fn get(&self, addresses: &[String]) -> Result<Vec<Option<Vec<u8>>>, ContextError> {
        for address in addresses {
            self.validate_read(address)?;
        }
        // The map lock is released before waiting on any future.
        let futures: Vec<_> = addresses.iter().map(|a| self.future(a)).collect();
        let mut values = Vec::with_capacity(futures.len());
        for future in futures {
            let value = match future {
                Some(future) => future.result()?,
                None => None,
            };
            values.push(value);
        }
        Ok(values)
    }

    /// The value this context provides to contexts built on it: only what it
    /// set or deleted itself. The inner `None` is a deletion.
    pub(crate) fn chain_value(&self, address: &str) -> Option<Option<Vec<u8>>> {
        self.future(address).and_then(|f| f.set_in_context())
    }

    pub(crate) fn create_initial(&self, address_values: Vec<(String, Option<Vec<u8>>)>) {
        let mut state = self.state.lock();
        for (address, value) in address_values {
            let future = ContextFuture::with_value(&address, value);
            state.futures.insert(address, Arc::new(future));
        }
    }

    pub(crate) fn create_prefetch(&self, addresses: &[String]) {
        let mut state = self.state.lock();
        for address in addresses {
            let future = ContextFuture::awaiting_store(address);
            state.futures.insert(address.clone(), Arc::new(future));
        }
    }

    /// Fills pending futures with values read from the store.
    pub(crate) fn set_from_store(&self, reads: Vec<(String, StoreRead)>) {
        for (address, read) in reads {
            if let Some(future) = self.future(&address) {
                future.set_from_store(read);
            }
        }
    }

    fn set_direct_inner(&self, writes: Vec<(String, Option<Vec<u8>>)>) -> Result<(), ContextError> {
        for (address, _) in &writes {
            self.validate_write(address)?;
        }
        let mut state = self.state.lock();
        if state.read_only {
            for (address, _) in &writes {
                warn!(context = %self.id, address = %address, "tried to set address on a read-only context");
            }
            return Ok(());
        }
        for (address, value) in writes {
            match state.futures.get(&address) {
                Some(future) => future.set_from_context(value),
                None => {
                    let future = ContextFuture::new(&address, Resolution::ByContext(value));
                    state.futures.insert(address, Arc::new(future));
                }
            }
        }
        Ok(())
    }

    pub fn set_direct(&self, values: BTreeMap<String, Vec<u8>>) -> Result<(), ContextError> {
        self.set_direct_inner(values.into_iter().map(|(a, v)| (a, Some(v))).collect())
    }

    pub fn delete_direct(&self, addresses: &[String]) -> Result<(), ContextError> {
        self.set_direct_inner(addresses.iter().map(|a| (a.clone(), None)).collect())
    }

    /// Freezes every future. Pending store reads are waited out first so the
    /// snapshot a squash sees is complete.
    ///
    /// Fails if one of those reads failed, since the snapshot would then be
    /// missing a value the transaction was entitled to see.
    pub fn make_read_only(&self) -> Result<(), ContextError> {
        let futures: Vec<Arc<ContextFuture>> = {
            let mut state = self.state.lock();
            state.read_only = true;
            state.futures.values().cloned().collect()
        };
        let mut failure = None;
        for future in futures {
            if let Err(error) = future.freeze() {
                failure.get_or_insert(error);
            }
        }
        match failure {
            Some(error) => Err(ContextError::Store(error)),
            None => Ok(()),
        }
    }

    /// Addresses this context set, with their values.
    pub fn get_all_if_set(&self) -> BTreeMap<String, Vec<u8>> {
        let state = self.state.lock();
        state
            .futures
            .iter()
            .filter_map(|(address, future)| match future.set_in_context() {
                Some(Some(value)) => Some((address.clone(), value)),
                _ => None,
            })
            .collect()
    }

    /// Addresses this context deleted, sorted.
    pub fn get_all_if_deleted(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut deleted: Vec<String> = state
            .futures
            .iter()
            .filter(|(_, future)| future.set_in_context() == Some(None))
            .map(|(address, _)| address.clone())
            .collect();
        deleted.sort();
        deleted
    }

    pub fn add_execution_event(&self, event: Event) {
        self.state.lock().events.push(event);
    }

    pub fn add_execution_data(&self, data: Vec<u8>) {
        self.state.lock().data.push(data);
    }

    pub fn execution_events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn execution_data(&self) -> Vec<Vec<u8>> {
        self.state.lock().data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn context(reads: &[&str], writes: &[&str]) -> ExecutionContext {
        ExecutionContext::new(
            ContextId(1),
            StateRoot::ZERO,
            reads.iter().map(|s| s.to_string()).collect(),
            writes.iter().map(|s| s.to_string()).collect(),
            Vec::new(),
        )
    }

    #[test]
    fn test_context_set_wins_over_store() {
        let future = ContextFuture::awaiting_store("aa");
        future.set_from_context(Some(b"ctx".to_vec()));
        future.set_from_store(Ok(Some(b"store".to_vec())));

        assert_eq!(future.result(), Ok(Some(b"ctx".to_vec())));
        assert_eq!(future.set_in_context(), Some(Some(b"ctx".to_vec())));
    }

    #[test]
    fn test_result_waits_for_store() {
        let future = Arc::new(ContextFuture::awaiting_store("aa"));
        let reader = {
            let future = Arc::clone(&future);
            thread::spawn(move || future.result())
        };
        thread::sleep(Duration::from_millis(20));
        future.set_from_store(Ok(Some(b"1".to_vec())));

        assert_eq!(reader.join().unwrap(), Ok(Some(b"1".to_vec())));
        assert_eq!(future.set_in_context(), None);
    }

    #[test]
    fn test_frozen_future_ignores_sets() {
        let future = ContextFuture::with_value("aa", Some(b"1".to_vec()));
        future.freeze().unwrap();
        future.set_from_context(Some(b"2".to_vec()));

        assert_eq!(future.result(), Ok(Some(b"1".to_vec())));
        assert_eq!(future.set_in_context(), None);
    }

    #[test]
    fn test_failed_store_read_is_reported() {
        let error = StoreError::Backend("gone".to_string());
        let future = ContextFuture::awaiting_store("aa");
        future.set_from_store(Err(error.clone()));

        assert_eq!(future.result(), Err(error.clone()));
        assert_eq!(future.freeze(), Err(error));

        // A value the context set itself wins over a failed read.
        let overwritten = ContextFuture::awaiting_store("aa");
        overwritten.set_from_store(Err(StoreError::Backend("gone".to_string())));
        overwritten.set_from_context(Some(b"1".to_vec()));
        assert_eq!(overwritten.freeze(), Ok(()));
        assert_eq!(overwritten.result(), Ok(Some(b"1".to_vec())));
    }

    #[test]
    fn test_only_own_writes_are_passed_down_the_chain() {
        let ctx = context(&["aa"], &["aa"]);
        ctx.create_initial(vec![("aa01".to_string(), Some(b"read".to_vec()))]);
        ctx.create_prefetch(&["aa02".to_string()]);
        ctx.set_from_store(vec![("aa02".to_string(), Ok(Some(b"store".to_vec())))]);
        ctx.delete_direct(&["aa03".to_string()]).unwrap();

        assert_eq!(ctx.chain_value("aa01"), None);
        assert_eq!(ctx.chain_value("aa02"), None);
        assert_eq!(ctx.chain_value("aa03"), Some(None));
        assert_eq!(
            ctx.get(&["aa01".to_string(), "aa02".to_string()]).unwrap(),
            vec![Some(b"read".to_vec()), Some(b"store".to_vec())]
        );
    }

    #[test]
    fn test_authorization() {
        let ctx = context(&["aa"], &["aabb"]);

        assert!(ctx.get(&["aacc".to_string()]).is_ok());
        assert_eq!(
            ctx.get(&["bb".to_string()]),
            Err(ContextError::Authorization {
                address: "bb".to_string()
            })
        );

        let mut writes = BTreeMap::new();
        writes.insert("aacc".to_string(), b"1".to_vec());
        assert_eq!(
            ctx.set_direct(writes),
            Err(ContextError::Authorization {
                address: "aacc".to_string()
            })
        );
        assert!(ctx.get_all_if_set().is_empty());
    }

    #[test]
    fn test_set_delete_and_read_only() {
        let ctx = context(&["aa"], &["aa"]);
        let mut writes = BTreeMap::new();
        writes.insert("aa01".to_string(), b"1".to_vec());
        writes.insert("aa02".to_string(), b"2".to_vec());
        ctx.set_direct(writes).unwrap();
        ctx.delete_direct(&["aa02".to_string(), "aa03".to_string()]).unwrap();

        assert_eq!(
            ctx.get_all_if_set().into_iter().collect::<Vec<_>>(),
            vec![("aa01".to_string(), b"1".to_vec())]
        );
        assert_eq!(ctx.get_all_if_deleted(), vec!["aa02", "aa03"]);
        assert_eq!(
            ctx.get(&["aa01".to_string(), "aa02".to_string(), "aa04".to_string()])
                .unwrap(),
            vec![Some(b"1".to_vec()), None, None]
        );

        ctx.make_read_only().unwrap();
        let mut late = BTreeMap::new();
        late.insert("aa05".to_string(), b"5".to_vec());
        ctx.set_direct(late).unwrap();
        assert!(!ctx.contains("aa05"));
        assert!(ctx.is_read_only());
    }
}

//! Creation, chaining and squashing of speculative execution contexts.
//!
//! A context is created on top of a state root and a list of base contexts.
//! Inputs already written somewhere in the base chain are copied in at
//! creation time; the rest are read from the store in the background by the
//! prefetch [`pipeline`]. The squash handler later folds a set of context
//! chains into one store update.

mod execution_context;
mod pipeline;

pub use execution_context::ExecutionContext;

use crate::error::ContextError;
use crate::scheduler::SquashHandler;
use crate::store::StateStore;
use crate::types::{ContextId, Event, StateChange, StateRoot};
use dashmap::DashMap;
use parking_lot::Mutex;
use pipeline::{Contexts, Pipeline, PrefetchRequest};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Context manager settings.
#[derive(Debug, Clone)]
pub struct ContextManagerConfig {
    /// Length in hex characters of a full state address.
    pub address_length: usize,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self { address_length: 70 }
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl ContextManagerConfig {
    /// A full address: exactly `address_length` lowercase hex characters.
    pub fn is_valid_address(&self, address: &str) -> bool {
        address.len() == self.address_length && is_lower_hex(address)
    }

    /// A namespace: whole bytes of lowercase hex, up to a full address.
    pub fn is_valid_namespace(&self, namespace: &str) -> bool {
        namespace.len() % 2 == 0 && namespace.len() <= self.address_length && is_lower_hex(namespace)
    }
}

/// Everything a context produced, for reporting an execution result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResults {
    pub sets: BTreeMap<String, Vec<u8>>,
    pub deletes: Vec<String>,
    pub events: Vec<Event>,
    pub data: Vec<Vec<u8>>,
}

impl ExecutionResults {
    /// Sets followed by deletes, each in address order.
    pub fn state_changes(&self) -> Vec<StateChange> {
        let sets = self.sets.iter().map(|(address, value)| StateChange::Set {
            address: address.clone(),
            value: value.clone(),
        });
        let deletes = self.deletes.iter().map(|address| StateChange::Delete {
            address: address.clone(),
        });
        sets.chain(deletes).collect()
    }
}

/// Visits a context chain newest context first.
///
/// Ids grow with creation and a context is only ever created after every
/// context that wrote something it depends on, so for any address the first
/// visited writer is the most recent one. Depth in the chain says nothing
/// about recency.
struct ChainWalk {
    to_visit: BinaryHeap<ContextId>,
    seen: HashSet<ContextId>,
}

impl ChainWalk {
    fn new(context_ids: &[ContextId]) -> Self {
        let mut walk = Self {
            to_visit: BinaryHeap::new(),
            seen: HashSet::new(),
        };
        walk.extend(context_ids);
        walk
    }

    fn extend(&mut self, context_ids: &[ContextId]) {
        for context_id in context_ids {
            if self.seen.insert(*context_id) {
                self.to_visit.push(*context_id);
            }
        }
    }
}

impl Iterator for ChainWalk {
    type Item = ContextId;

    fn next(&mut self) -> Option<ContextId> {
        self.to_visit.pop()
    }
}

/// State shared by the manager, its pipeline and squash handlers.
struct Shared {
    store: Arc<dyn StateStore>,
    contexts: Arc<Contexts>,
    /// Squashes against the same root run one at a time.
    squash_locks: DashMap<StateRoot, Arc<Mutex<()>>>,
}

impl Shared {
    fn context(&self, context_id: ContextId) -> Result<Arc<ExecutionContext>, ContextError> {
        self.contexts
            .get(&context_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ContextError::NotFound(context_id))
    }

    fn delete_contexts(&self, context_ids: &[ContextId]) {
        for context_id in context_ids {
            self.contexts.remove(context_id);
        }
    }

    /// Searches the chain below `base_context_ids` for the newest write of
    /// each address. Returns the values found and the addresses no context
    /// in the chain wrote.
    #[allow(clippy::type_complexity)]
    fn find_in_chain(
        &self,
        base_context_ids: &[ContextId],
        addresses: Vec<String>,
    ) -> Result<(Vec<(String, Option<Vec<u8>>)>, Vec<String>), ContextError> {
        let mut chain = ChainWalk::new(base_context_ids);
        let mut reads = addresses;
        let mut found = Vec::new();

        while !reads.is_empty() {
            let Some(context_id) = chain.next() else {
                break;
            };
            let context = self.context(context_id)?;

            let mut not_found = Vec::with_capacity(reads.len());
            for address in reads {
                match context.chain_value(&address) {
                    Some(value) => found.push((address, value)),
                    None => not_found.push(address),
                }
            }
            reads = not_found;
            chain.extend(context.base_context_ids());
        }
        Ok((found, reads))
    }

    #[instrument(level = "debug", skip(self, context_ids), fields(contexts = context_ids.len()))]
    fn squash(
        &self,
        state_root: StateRoot,
        context_ids: &[ContextId],
        persist: bool,
        clean_up: bool,
    ) -> Result<StateRoot, ContextError> {
        let lock = Arc::clone(self.squash_locks.entry(state_root).or_default().value());
        let result = {
            let _guard = lock.lock();
            self.squash_locked(state_root, context_ids, persist, clean_up)
        };
        drop(lock);
        self.squash_locks
            .remove_if(&state_root, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn squash_locked(
        &self,
        state_root: StateRoot,
        context_ids: &[ContextId],
        persist: bool,
        clean_up: bool,
    ) -> Result<StateRoot, ContextError> {
        let mut chain = ChainWalk::new(context_ids);
        let mut visited = Vec::new();

        let mut updates = BTreeMap::new();
        let mut deletes = BTreeSet::new();
        while let Some(context_id) = chain.next() {
            let context = self.context(context_id)?;
            visited.push(context_id);
            context.make_read_only()?;

            // Earlier-visited contexts are newer; their values stand.
            for (address, value) in context.get_all_if_set() {
                if !updates.contains_key(&address) && !deletes.contains(&address) {
                    updates.insert(address, value);
                }
            }
            for address in context.get_all_if_deleted() {
                if !updates.contains_key(&address) {
                    deletes.insert(address);
                }
            }
            chain.extend(context.base_context_ids());
        }

        let mut present_deletes = Vec::new();
        for address in deletes {
            if self.store.contains(&state_root, &address)? {
                present_deletes.push(address);
            }
        }

        let new_root = if updates.is_empty() && present_deletes.is_empty() {
            state_root
        } else {
            self.store
                .batch_update(&state_root, &updates, &present_deletes, !persist)?
        };

        if clean_up {
            self.delete_contexts(&visited);
        }
        debug!(
            root = %new_root,
            updates = updates.len(),
            deletes = present_deletes.len(),
            persist,
            "squashed contexts"
        );
        Ok(new_root)
    }
}

/// Owns every live context and the prefetch pipeline.
pub struct ContextManager {
    shared: Arc<Shared>,
    pipeline: Pipeline,
    next_id: AtomicU64,
    config: ContextManagerConfig,
}

impl ContextManager {
    pub fn new(store: Arc<dyn StateStore>, config: ContextManagerConfig) -> Self {
        let contexts = Arc::new(DashMap::new());
        let pipeline = Pipeline::spawn(Arc::clone(&store), Arc::clone(&contexts));
        Self {
            shared: Arc::new(Shared {
                store,
                contexts,
                squash_locks: DashMap::new(),
            }),
            pipeline,
            next_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &ContextManagerConfig {
        &self.config
    }

    /// Number of live contexts.
    pub fn context_count(&self) -> usize {
        self.shared.contexts.len()
    }

    pub fn context_exists(&self, context_id: ContextId) -> bool {
        self.shared.contexts.contains_key(&context_id)
    }

    /// Creates a context reading `inputs` and writing `outputs` on top of
    /// `base_context_ids` and `state_root`.
    #[instrument(level = "trace", skip_all, fields(bases = base_context_ids.len()))]
    pub fn create_context(
        &self,
        state_root: StateRoot,
        base_context_ids: &[ContextId],
        inputs: &[String],
        outputs: &[String],
    ) -> Result<ContextId, ContextError> {
        for namespace in inputs.iter().chain(outputs) {
            if !self.config.is_valid_namespace(namespace) {
                return Err(ContextError::InvalidAddress(namespace.clone()));
            }
        }
        for base in base_context_ids {
            if !self.shared.contexts.contains_key(base) {
                return Err(ContextError::NotFound(*base));
            }
        }

        let mut to_find: Vec<String> = Vec::new();
        for input in inputs {
            if input.len() == self.config.address_length && !to_find.contains(input) {
                to_find.push(input.clone());
            }
        }
        let (found, reads) = self.shared.find_in_chain(base_context_ids, to_find)?;

        let context_id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let context = ExecutionContext::new(
            context_id,
            state_root,
            inputs.to_vec(),
            outputs.to_vec(),
            base_context_ids.to_vec(),
        );
        context.create_initial(found);
        if !reads.is_empty() {
            context.create_prefetch(&reads);
        }
        self.shared.contexts.insert(context_id, Arc::new(context));

        if !reads.is_empty() {
            self.pipeline.prefetch(PrefetchRequest {
                context_id,
                state_root,
                addresses: reads,
            });
        }
        Ok(context_id)
    }

    /// Values for `addresses` as seen by the context, in the order given.
    pub fn get(
        &self,
        context_id: ContextId,
        addresses: &[String],
    ) -> Result<Vec<(String, Option<Vec<u8>>)>, ContextError> {
        let context = self.shared.context(context_id)?;
        for address in addresses {
            if !self.config.is_valid_address(address) {
                return Err(ContextError::unauthorized(address));
            }
        }

        let (held, not_held): (Vec<String>, Vec<String>) = addresses
            .iter()
            .cloned()
            .partition(|address| context.contains(address));

        let mut values: HashMap<String, Option<Vec<u8>>> = HashMap::new();
        let held_values = context.get(&held)?;
        values.extend(held.into_iter().zip(held_values));

        if !not_held.is_empty() {
            for address in &not_held {
                context.validate_read(address)?;
            }
            let (found, reads) = self.shared.find_in_chain(&[context_id], not_held)?;
            values.extend(found);
            for address in reads {
                let value = self.shared.store.read(&context.state_root(), &address)?;
                values.insert(address, value);
            }
        }

        Ok(addresses
            .iter()
            .map(|address| (address.clone(), values.get(address).cloned().flatten()))
            .collect())
    }

    pub fn set(
        &self,
        context_id: ContextId,
        values: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), ContextError> {
        let context = self.shared.context(context_id)?;
        for address in values.keys() {
            if !self.config.is_valid_address(address) {
                return Err(ContextError::unauthorized(address));
            }
        }
        context.set_direct(values)
    }

    pub fn delete(&self, context_id: ContextId, addresses: &[String]) -> Result<(), ContextError> {
        let context = self.shared.context(context_id)?;
        for address in addresses {
            if !self.config.is_valid_address(address) {
                return Err(ContextError::unauthorized(address));
            }
        }
        context.delete_direct(addresses)
    }

    pub fn add_execution_data(&self, context_id: ContextId, data: Vec<u8>) -> Result<(), ContextError> {
        match self.shared.context(context_id) {
            Ok(context) => {
                context.add_execution_data(data);
                Ok(())
            }
            Err(e) => {
                warn!(context = %context_id, "context not in context manager");
                Err(e)
            }
        }
    }

    pub fn add_execution_event(&self, context_id: ContextId, event: Event) -> Result<(), ContextError> {
        match self.shared.context(context_id) {
            Ok(context) => {
                context.add_execution_event(event);
                Ok(())
            }
            Err(e) => {
                warn!(context = %context_id, "context not in context manager");
                Err(e)
            }
        }
    }

    pub fn get_execution_results(&self, context_id: ContextId) -> Result<ExecutionResults, ContextError> {
        let context = self.shared.context(context_id)?;
        Ok(ExecutionResults {
            sets: context.get_all_if_set(),
            deletes: context.get_all_if_deleted(),
            events: context.execution_events(),
            data: context.execution_data(),
        })
    }

    /// Removes contexts. Unknown ids are ignored.
    pub fn delete_contexts(&self, context_ids: &[ContextId]) {
        self.shared.delete_contexts(context_ids);
    }

    /// Handle for a scheduler: squashes context chains and deletes contexts
    /// whose results were thrown away.
    pub fn get_squash_handler(&self) -> SquashHandler {
        let squash = Arc::clone(&self.shared);
        let discard = Arc::clone(&self.shared);
        SquashHandler::new(
            move |state_root, context_ids: &[ContextId], persist, clean_up| {
                squash.squash(state_root, context_ids, persist, clean_up)
            },
            move |context_ids: &[ContextId]| discard.delete_contexts(context_ids),
        )
    }

    /// Shuts the prefetch pipeline down after it drains.
    pub fn stop(&self) {
        self.pipeline.stop();
    }
}

impl Drop for ContextManager {
    fn drop(&mut self) {
        self.pipeline.stop();
        self.pipeline.join();
    }
}

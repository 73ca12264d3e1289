//! Dependency-aware scheduler that lets non-conflicting transactions overlap.
//!
//! Predecessors are fixed when a batch is added: a transaction waits on the
//! writers of everything it reads and on the readers and writers of
//! everything it writes, as recorded in the [`PredecessorTree`] at that
//! moment. A transaction is ready as soon as all of its predecessors have
//! results, regardless of where it sits in the schedule.
//!
//! When a transaction turns out invalid its whole batch is invalid, so every
//! transaction in a later batch that built on the batch (directly or through
//! another replayed transaction) is replayed.

use super::{Notifier, Scheduler, SchedulerConfig, SquashHandler};
use crate::error::SchedulerError;
use crate::predecessor_tree::PredecessorTree;
use crate::types::{
    Batch, BatchExecutionResult, ContextId, StateRoot, Transaction, TxnExecutionResult, TxnIndex,
    TxnInfo, TxnOutcome,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::Range;
use tracing::{debug, error, info, instrument, trace};

struct ScheduledTxn {
    txn: Transaction,
    batch: usize,
    /// Sorted indices of the transactions that must have results first.
    predecessors: Vec<TxnIndex>,
}

struct BatchSlot {
    id: String,
    txns: Range<TxnIndex>,
    required: bool,
    preserve: bool,
    state_hash: Option<StateRoot>,
    /// Unscheduled batches keep their slot so indices stay stable.
    removed: bool,
    /// Set once a state root has been squashed for this batch.
    result: Option<BatchExecutionResult>,
}

struct ParallelState {
    tree: PredecessorTree<TxnIndex>,
    txns: Vec<ScheduledTxn>,
    txn_by_id: HashMap<String, TxnIndex>,
    batches: Vec<BatchSlot>,
    batch_by_id: HashMap<String, usize>,
    available: BTreeSet<TxnIndex>,
    scheduled: BTreeSet<TxnIndex>,
    /// In flight while one of their predecessors was invalidated; the result
    /// they report is discarded and they go back to `available`.
    outstanding: HashSet<TxnIndex>,
    results: HashMap<TxnIndex, TxnExecutionResult>,
    dispatched: Vec<TxnInfo>,
    /// Contexts no result refers to any more, deleted once the lock is
    /// released.
    discarded: Vec<ContextId>,
    /// Contexts of valid transactions in invalid batches were released.
    released_invalid_batches: bool,
    is_final: bool,
    cancelled: bool,
}

pub struct ParallelScheduler {
    state: Mutex<ParallelState>,
    squash: SquashHandler,
    first_state_hash: StateRoot,
    always_persist: bool,
    notifier: Notifier,
}

impl ParallelState {
    fn is_removed(&self, idx: TxnIndex) -> bool {
        self.batches[self.txns[idx].batch].removed
    }

    fn is_invalid(&self, idx: TxnIndex) -> bool {
        self.results.get(&idx).is_some_and(|r| !r.is_valid)
    }

    /// No member of the transaction's batch has an invalid result (yet).
    fn in_valid_batch(&self, idx: TxnIndex) -> bool {
        let batch = &self.batches[self.txns[idx].batch];
        !batch.txns.clone().any(|member| self.is_invalid(member))
    }

    fn batch_has_all_results(&self, batch: usize) -> bool {
        self.batches[batch]
            .txns
            .clone()
            .all(|member| self.results.contains_key(&member))
    }

    /// `None` while validity is still unknown.
    fn batch_validity(&self, batch: usize) -> Option<bool> {
        let mut complete = true;
        for member in self.batches[batch].txns.clone() {
            match self.results.get(&member) {
                Some(result) if !result.is_valid => return Some(false),
                Some(_) => {}
                None => complete = false,
            }
        }
        complete.then_some(true)
    }

    fn least_batch_without_results(&self) -> Option<usize> {
        (0..self.batches.len())
            .find(|&batch| !self.batches[batch].removed && !self.batch_has_all_results(batch))
    }

    /// Predecessors in invalid or unscheduled batches are looked through:
    /// their own predecessors have to be finished instead.
    fn has_unfinished_predecessors(&self, idx: TxnIndex) -> bool {
        let mut stack = self.txns[idx].predecessors.clone();
        let mut visited = HashSet::new();
        while let Some(pred) = stack.pop() {
            if !visited.insert(pred) {
                continue;
            }
            if self.is_removed(pred) {
                stack.extend_from_slice(&self.txns[pred].predecessors);
                continue;
            }
            if !self.results.contains_key(&pred) {
                return true;
            }
            if !self.in_valid_batch(pred) {
                stack.extend_from_slice(&self.txns[pred].predecessors);
            }
        }
        false
    }

    /// Explicit dependencies in other batches, by index.
    fn dependency_batches(&self, idx: TxnIndex) -> impl Iterator<Item = usize> + '_ {
        let own_batch = self.txns[idx].batch;
        self.txns[idx]
            .txn
            .dependencies
            .iter()
            .filter_map(move |dep| self.txn_by_id.get(dep))
            .map(move |&dep| self.txns[dep].batch)
            .filter(move |&batch| batch != own_batch)
    }

    fn dependency_not_processed(&self, idx: TxnIndex) -> bool {
        self.dependency_batches(idx)
            .any(|batch| !self.batch_has_all_results(batch))
    }

    fn failed_by_dependency(&self, idx: TxnIndex) -> bool {
        self.dependency_batches(idx)
            .any(|batch| self.batch_validity(batch) == Some(false))
    }

    fn sorted_in_reverse(ids: &[TxnIndex]) -> Vec<TxnIndex> {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted
    }

    /// Whether `prior`'s writes are not yet reachable through a context
    /// already in `chain`.
    fn predecessor_not_in_chain(&self, prior: TxnIndex, chain: &[TxnIndex]) -> bool {
        !chain.iter().any(|&member| {
            (self.txns[member].predecessors.contains(&prior) || chain.contains(&prior))
                && self.in_valid_batch(member)
        })
    }

    /// Contexts the transaction runs on top of, newest first.
    fn base_contexts(&self, idx: TxnIndex) -> Vec<ContextId> {
        let mut contexts = Vec::new();
        let mut in_chain = Vec::new();
        let mut expanded = HashSet::new();
        let mut queue: VecDeque<TxnIndex> =
            Self::sorted_in_reverse(&self.txns[idx].predecessors).into();

        while let Some(prior) = queue.pop_front() {
            if !self.is_removed(prior) && self.in_valid_batch(prior) {
                let Some(context_id) = self.results.get(&prior).and_then(|r| r.context_id) else {
                    continue;
                };
                if self.predecessor_not_in_chain(prior, &in_chain) {
                    in_chain.push(prior);
                    contexts.push(context_id);
                }
            } else if expanded.insert(prior) {
                queue.extend(Self::sorted_in_reverse(&self.txns[prior].predecessors));
            }
        }
        contexts
    }

    /// Sends every transaction in a later batch that built on `failed`'s
    /// batch back for another run. Returns whether anything changed.
    fn replay_successors(&mut self, failed: TxnIndex) -> bool {
        let failed_batch = self.txns[failed].batch;
        let mut tainted: HashSet<TxnIndex> = self.batches[failed_batch].txns.clone().collect();
        let mut changed = false;

        loop {
            let replay: Vec<TxnIndex> = self
                .scheduled
                .iter()
                .copied()
                .filter(|&s| {
                    self.txns[s].batch != failed_batch
                        && !tainted.contains(&s)
                        && self.txns[s].predecessors.iter().any(|p| tainted.contains(p))
                })
                .collect();
            if replay.is_empty() {
                break;
            }
            for successor in replay {
                tainted.insert(successor);
                if let Some(result) = self.results.remove(&successor) {
                    self.discarded.extend(result.context_id);
                    self.scheduled.remove(&successor);
                    self.available.insert(successor);
                    trace!(txn = %self.txns[successor].txn.id, "replaying transaction");
                } else {
                    self.outstanding.insert(successor);
                }
                changed = true;
            }
        }
        changed
    }

    /// Contexts of every valid batch up to and including `batch`, newest
    /// transaction first. `None` if a needed result is missing.
    fn contexts_for_squash(&self, batch: usize) -> Option<Vec<ContextId>> {
        let mut contexts = Vec::new();
        for slot in self.batches[..=batch].iter().rev().filter(|slot| !slot.removed) {
            let mut batch_contexts = Vec::new();
            let mut valid = true;
            for idx in slot.txns.clone().rev() {
                let result = self.results.get(&idx)?;
                if !result.is_valid {
                    valid = false;
                    break;
                }
                batch_contexts.extend(result.context_id);
            }
            if valid {
                contexts.extend(batch_contexts);
            }
        }
        Some(contexts)
    }

    fn is_last_valid_batch(&self, batch: usize) -> Option<bool> {
        if !self.batch_validity(batch)? {
            return Some(false);
        }
        for later in (batch + 1)..self.batches.len() {
            if self.batches[later].removed {
                continue;
            }
            if self.batch_validity(later)? {
                return Some(false);
            }
        }
        Some(true)
    }

    /// Contexts of valid transactions in batches that ended up invalid.
    ///
    /// A replay can still turn an invalid batch valid, so this is only
    /// meaningful once every transaction has its final result.
    fn contexts_of_invalid_batches(&self) -> Vec<ContextId> {
        (0..self.batches.len())
            .filter(|&batch| {
                !self.batches[batch].removed && self.batch_validity(batch) == Some(false)
            })
            .flat_map(|batch| self.batches[batch].txns.clone())
            .filter_map(|idx| self.results.get(&idx))
            .filter(|result| result.is_valid)
            .filter_map(|result| result.context_id)
            .collect()
    }

    fn fail_without_dispatch(&mut self, idx: TxnIndex) {
        self.available.remove(&idx);
        let result = TxnExecutionResult::failed(&self.txns[idx].txn.id);
        self.results.insert(idx, result);
    }
}

impl ParallelScheduler {
    pub fn new(squash: SquashHandler, first_state_hash: StateRoot, config: SchedulerConfig) -> Self {
        Self {
            state: Mutex::new(ParallelState {
                tree: PredecessorTree::new(),
                txns: Vec::new(),
                txn_by_id: HashMap::new(),
                batches: Vec::new(),
                batch_by_id: HashMap::new(),
                available: BTreeSet::new(),
                scheduled: BTreeSet::new(),
                outstanding: HashSet::new(),
                results: HashMap::new(),
                dispatched: Vec::new(),
                discarded: Vec::new(),
                released_invalid_batches: false,
                is_final: false,
                cancelled: false,
            }),
            squash,
            first_state_hash,
            always_persist: config.always_persist,
            notifier: Notifier::new(config.liveness_interval),
        }
    }

    /// Predecessor indices computed for a scheduled transaction.
    pub fn predecessors(&self, txn_id: &str) -> Option<Vec<TxnIndex>> {
        let state = self.state.lock();
        let idx = *state.txn_by_id.get(txn_id)?;
        Some(state.txns[idx].predecessors.clone())
    }

    /// Number of undispatched transactions whose predecessors are finished.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state
            .available
            .iter()
            .filter(|&&idx| !state.has_unfinished_predecessors(idx))
            .count()
    }

    fn is_complete(state: &ParallelState) -> bool {
        state.is_final && state.results.len() == state.txn_by_id.len()
    }
}

impl Scheduler for ParallelScheduler {
    #[instrument(level = "debug", skip_all, fields(batch_id = %batch.id))]
    fn add_batch(
        &self,
        batch: Batch,
        state_hash: Option<StateRoot>,
        required: bool,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if state.is_final {
            return Err(SchedulerError::Finalized { batch_id: batch.id });
        }

        // The first non-required batch is kept so a schedule never ends up
        // empty after unscheduling.
        let preserve = required
            || !state
                .batches
                .iter()
                .any(|slot| !slot.removed && !slot.required);

        let Batch { id, transactions } = batch;
        let batch_index = state.batches.len();
        let start = state.txns.len();

        for txn in transactions {
            let idx = state.txns.len();

            let mut predecessors = HashSet::new();
            for address in &txn.inputs {
                predecessors.extend(state.tree.find_read_predecessors(address));
            }
            for address in &txn.outputs {
                predecessors.extend(state.tree.find_write_predecessors(address));
            }
            let mut predecessors: Vec<TxnIndex> = predecessors.into_iter().collect();
            predecessors.sort_unstable();

            // Inputs first: a writer at the same address replaces the reader.
            for address in &txn.inputs {
                state.tree.add_reader(address, idx);
            }
            for address in &txn.outputs {
                state.tree.set_writer(address, idx);
            }

            state.txn_by_id.insert(txn.id.clone(), idx);
            state.available.insert(idx);
            state.txns.push(ScheduledTxn {
                txn,
                batch: batch_index,
                predecessors,
            });
        }

        let end = state.txns.len();
        debug!(txns = end - start, "added batch");
        state.batch_by_id.insert(id.clone(), batch_index);
        state.batches.push(BatchSlot {
            id,
            txns: start..end,
            required,
            preserve,
            state_hash,
            removed: false,
            result: None,
        });
        drop(state);

        self.notifier.notify_all();
        Ok(())
    }

    fn next_transaction(&self) -> Result<Option<TxnInfo>, SchedulerError> {
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(SchedulerError::Cancelled);
        }

        let least = state.least_batch_without_results();
        let candidates: Vec<TxnIndex> = state.available.iter().copied().collect();
        let mut changed = false;
        let mut next = None;

        for idx in candidates {
            if state.has_unfinished_predecessors(idx) || state.dependency_not_processed(idx) {
                continue;
            }
            if state.failed_by_dependency(idx) {
                state.fail_without_dispatch(idx);
                state.replay_successors(idx);
                changed = true;
                continue;
            }
            if !state.in_valid_batch(idx) && least == Some(state.txns[idx].batch) {
                state.fail_without_dispatch(idx);
                changed = true;
                continue;
            }
            next = Some(idx);
            break;
        }

        let info = next.map(|idx| {
            let info = TxnInfo {
                txn: state.txns[idx].txn.clone(),
                state_root: self.first_state_hash,
                base_context_ids: state.base_contexts(idx),
            };
            state.available.remove(&idx);
            state.scheduled.insert(idx);
            state.dispatched.push(info.clone());
            info
        });
        let discarded = std::mem::take(&mut state.discarded);
        drop(state);

        self.squash.discard(&discarded);
        if changed {
            self.notifier.notify_all();
        }
        Ok(info)
    }

    fn set_transaction_execution_result(
        &self,
        txn_id: &str,
        outcome: TxnOutcome,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        let Some(&idx) = state.txn_by_id.get(txn_id) else {
            return Err(SchedulerError::UnknownTransaction(txn_id.to_string()));
        };
        if state.results.contains_key(&idx) {
            return Err(SchedulerError::DuplicateResult(txn_id.to_string()));
        }
        if !state.scheduled.contains(&idx) {
            return Err(SchedulerError::NotScheduled(txn_id.to_string()));
        }

        if !outcome.is_valid {
            state.replay_successors(idx);
        }

        if state.outstanding.remove(&idx) {
            state.scheduled.remove(&idx);
            state.available.insert(idx);
            state.discarded.extend(outcome.context_id);
            debug!(txn = txn_id, "discarding result of invalidated run");
        } else {
            let result = TxnExecutionResult::from_outcome(txn_id, outcome, self.first_state_hash);
            state.results.insert(idx, result);
        }
        let discarded = std::mem::take(&mut state.discarded);
        drop(state);

        self.squash.discard(&discarded);
        self.notifier.notify_all();
        Ok(())
    }

    fn finalize(&self) {
        self.state.lock().is_final = true;
        self.notifier.notify_all();
    }

    fn complete(&self, block: bool) -> Result<bool, SchedulerError> {
        loop {
            let seen = self.notifier.generation();
            {
                let mut state = self.state.lock();
                if Self::is_complete(&state) {
                    if !state.released_invalid_batches {
                        state.released_invalid_batches = true;
                        let discarded = state.contexts_of_invalid_batches();
                        drop(state);
                        self.squash.discard(&discarded);
                    }
                    return Ok(true);
                }
                if !block {
                    return Ok(false);
                }
                if state.cancelled {
                    return Err(SchedulerError::Cancelled);
                }
            }
            self.notifier.wait_past(seen);
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        if !state.cancelled {
            if !state.is_final {
                let mut finished: Vec<(&TxnIndex, &TxnExecutionResult)> = state.results.iter().collect();
                finished.sort_unstable_by_key(|(idx, _)| **idx);
                let contexts: Vec<ContextId> =
                    finished.iter().filter_map(|(_, r)| r.context_id).collect();
                if let Err(e) = self.squash.squash(self.first_state_hash, &contexts, false, true) {
                    error!(error = %e, "failed to clean up contexts on cancel");
                }
            }
            info!("parallel scheduler cancelled");
            state.cancelled = true;
        }
        drop(state);

        self.notifier.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn get_batch_execution_result(
        &self,
        batch_id: &str,
    ) -> Result<Option<BatchExecutionResult>, SchedulerError> {
        let mut state = self.state.lock();
        let Some(&batch) = state.batch_by_id.get(batch_id) else {
            return Ok(None);
        };
        if let Some(result) = state.batches[batch].result {
            return Ok(Some(result));
        }
        match state.batch_validity(batch) {
            None => return Ok(None),
            Some(false) => return Ok(Some(BatchExecutionResult::invalid())),
            Some(true) => {}
        }

        let state_root = if let Some(expected) = state.batches[batch].state_hash {
            let Some(contexts) = state.contexts_for_squash(batch) else {
                return Ok(None);
            };
            let root = self.squash.squash(self.first_state_hash, &contexts, false, false)?;
            let persist = root == expected;
            self.squash.squash(self.first_state_hash, &contexts, persist, true)?;
            Some(root)
        } else if state.is_final {
            let Some(is_last_valid) = state.is_last_valid_batch(batch) else {
                return Ok(None);
            };
            if !is_last_valid {
                return Ok(Some(BatchExecutionResult {
                    is_valid: true,
                    state_root: None,
                }));
            }
            let Some(contexts) = state.contexts_for_squash(batch) else {
                return Ok(None);
            };
            Some(self.squash.squash(
                self.first_state_hash,
                &contexts,
                self.always_persist,
                true,
            )?)
        } else {
            return Ok(Some(BatchExecutionResult {
                is_valid: true,
                state_root: None,
            }));
        };

        let result = BatchExecutionResult {
            is_valid: true,
            state_root,
        };
        state.batches[batch].result = Some(result);
        Ok(Some(result))
    }

    fn get_transaction_execution_results(
        &self,
        batch_id: &str,
    ) -> Option<Vec<TxnExecutionResult>> {
        let state = self.state.lock();
        let batch = *state.batch_by_id.get(batch_id)?;
        Some(
            state.batches[batch]
                .txns
                .clone()
                .filter_map(|idx| state.results.get(&idx).cloned())
                .collect(),
        )
    }

    fn unschedule_incomplete_batches(&self) {
        let mut state = self.state.lock();

        let incomplete: BTreeSet<usize> = state
            .available
            .iter()
            .chain(state.outstanding.iter())
            .map(|&idx| state.txns[idx].batch)
            .filter(|&batch| !state.batches[batch].preserve)
            .collect();

        for &batch in &incomplete {
            let slot = &mut state.batches[batch];
            slot.removed = true;
            let id = slot.id.clone();
            let members = slot.txns.clone();
            state.batch_by_id.remove(&id);
            for idx in members {
                let txn_id = state.txns[idx].txn.id.clone();
                state.txn_by_id.remove(&txn_id);
                state.results.remove(&idx);
                state.available.remove(&idx);
                state.outstanding.remove(&idx);
                state.scheduled.remove(&idx);
            }
        }
        drop(state);

        if !incomplete.is_empty() {
            debug!(count = incomplete.len(), "removed incomplete batches from the schedule");
        }
        self.notifier.notify_all();
    }

    fn is_transaction_in_schedule(&self, txn_id: &str) -> bool {
        self.state.lock().txn_by_id.contains_key(txn_id)
    }

    fn count(&self) -> usize {
        self.state.lock().dispatched.len()
    }

    fn get_transaction(&self, index: usize) -> Option<TxnInfo> {
        self.state.lock().dispatched.get(index).cloned()
    }

    fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

impl Drop for ParallelScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_support::{config, root_for, txn, RecordingSquash};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn scheduler() -> (ParallelScheduler, Arc<RecordingSquash>) {
        let squash = Arc::new(RecordingSquash::default());
        let scheduler = ParallelScheduler::new(squash.handler(), StateRoot::ZERO, config());
        (scheduler, squash)
    }

    fn next_id(scheduler: &ParallelScheduler) -> Option<String> {
        scheduler.next_transaction().unwrap().map(|info| info.txn.id)
    }

    fn report(scheduler: &ParallelScheduler, id: &str, context: u64) {
        scheduler
            .set_transaction_execution_result(id, TxnOutcome::valid(ContextId(context)))
            .unwrap();
    }

    #[test]
    fn test_independent_transactions_run_together() {
        let (scheduler, _) = scheduler();
        scheduler
            .add_batch(Batch::new("b1", vec![txn("t1", &["aa"], &["aa"])]), None, false)
            .unwrap();
        scheduler
            .add_batch(Batch::new("b2", vec![txn("t2", &["bb"], &["bb"])]), None, false)
            .unwrap();
        scheduler
            .add_batch(Batch::new("b3", vec![txn("t3", &[], &[])]), None, false)
            .unwrap();

        assert_eq!(scheduler.available(), 3);
        assert_eq!(next_id(&scheduler).as_deref(), Some("t1"));
        assert_eq!(next_id(&scheduler).as_deref(), Some("t2"));
        assert_eq!(next_id(&scheduler).as_deref(), Some("t3"));
        assert_eq!(next_id(&scheduler), None);
        assert_eq!(scheduler.count(), 3);
    }

    #[test]
    fn test_conflicts_wait_for_predecessors() {
        let (scheduler, _) = scheduler();
        scheduler
            .add_batch(Batch::new("b1", vec![txn("t1", &["aa"], &["aa"])]), None, false)
            .unwrap();
        scheduler
            .add_batch(Batch::new("b2", vec![txn("t2", &["aa"], &[])]), None, false)
            .unwrap();
        scheduler
            .add_batch(Batch::new("b3", vec![txn("t3", &[], &["a"])]), None, false)
            .unwrap();

        assert_eq!(scheduler.predecessors("t1").unwrap(), Vec::<TxnIndex>::new());
        assert_eq!(scheduler.predecessors("t2").unwrap(), vec![0]);
        assert_eq!(scheduler.predecessors("t3").unwrap(), vec![0, 1]);

        assert_eq!(next_id(&scheduler).as_deref(), Some("t1"));
        assert_eq!(next_id(&scheduler), None);

        report(&scheduler, "t1", 1);
        let t2 = scheduler.next_transaction().unwrap().unwrap();
        assert_eq!(t2.txn.id, "t2");
        assert_eq!(t2.base_context_ids, vec![ContextId(1)]);
        assert_eq!(next_id(&scheduler), None);

        report(&scheduler, "t2", 2);
        // t1's context is reachable through t2's.
        let t3 = scheduler.next_transaction().unwrap().unwrap();
        assert_eq!(t3.base_context_ids, vec![ContextId(2)]);
    }

    #[test]
    fn test_invalid_batch_replays_successors() {
        let (scheduler, squash) = scheduler();
        scheduler
            .add_batch(
                Batch::new("b1", vec![txn("t0", &[], &["bb"]), txn("t1", &[], &["aa"])]),
                None,
                false,
            )
            .unwrap();
        scheduler
            .add_batch(Batch::new("b2", vec![txn("t2", &["aa"], &["cc"])]), None, false)
            .unwrap();
        scheduler
            .add_batch(Batch::new("b3", vec![txn("t3", &["cc"], &[])]), None, false)
            .unwrap();
        scheduler.finalize();

        assert_eq!(next_id(&scheduler).as_deref(), Some("t0"));
        assert_eq!(next_id(&scheduler).as_deref(), Some("t1"));
        report(&scheduler, "t1", 1);
        let t2 = scheduler.next_transaction().unwrap().unwrap();
        assert_eq!(t2.base_context_ids, vec![ContextId(1)]);
        report(&scheduler, "t2", 2);
        let t3 = scheduler.next_transaction().unwrap().unwrap();
        assert_eq!(t3.base_context_ids, vec![ContextId(2)]);

        // t3 is still running when b1 fails.
        scheduler
            .set_transaction_execution_result("t0", TxnOutcome::invalid("bad"))
            .unwrap();
        assert!(!scheduler.is_transaction_in_schedule("nope"));
        // t2's finished run is thrown away with its context.
        assert_eq!(squash.discarded(), vec![ContextId(2)]);

        let t2 = scheduler.next_transaction().unwrap().unwrap();
        assert_eq!(t2.txn.id, "t2");
        assert!(t2.base_context_ids.is_empty());

        // The stale run of t3 is discarded, not recorded.
        report(&scheduler, "t3", 3);
        assert_eq!(squash.discarded(), vec![ContextId(2), ContextId(3)]);
        assert_eq!(next_id(&scheduler), None);
        report(&scheduler, "t2", 22);
        let t3 = scheduler.next_transaction().unwrap().unwrap();
        assert_eq!(t3.txn.id, "t3");
        assert_eq!(t3.base_context_ids, vec![ContextId(22)]);
        report(&scheduler, "t3", 33);

        assert!(scheduler.complete(false).unwrap());
        // t1 was valid but its batch is not.
        assert_eq!(
            squash.discarded(),
            vec![ContextId(1), ContextId(2), ContextId(3)]
        );
        assert!(scheduler.complete(false).unwrap());
        assert_eq!(squash.discarded().len(), 3);
        assert_eq!(
            scheduler.get_batch_execution_result("b1").unwrap(),
            Some(BatchExecutionResult::invalid())
        );
        // Dispatch log: t0 t1 t2 t3 t2 t3.
        assert_eq!(scheduler.count(), 6);
        let results = scheduler.get_transaction_execution_results("b3").unwrap();
        assert_eq!(results[0].context_id, Some(ContextId(33)));
    }

    #[test]
    fn test_fail_fast_within_invalid_batch() {
        let (scheduler, _) = scheduler();
        scheduler
            .add_batch(
                Batch::new("b1", vec![txn("t0", &[], &["aa"]), txn("t1", &["aa"], &[])]),
                None,
                false,
            )
            .unwrap();
        scheduler.finalize();

        assert_eq!(next_id(&scheduler).as_deref(), Some("t0"));
        scheduler
            .set_transaction_execution_result("t0", TxnOutcome::invalid("bad"))
            .unwrap();

        assert_eq!(next_id(&scheduler), None);
        let results = scheduler.get_transaction_execution_results("b1").unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_valid));
        assert!(scheduler.complete(false).unwrap());
    }

    #[test]
    fn test_failed_dependency() {
        let (scheduler, _) = scheduler();
        scheduler
            .add_batch(Batch::new("b1", vec![txn("t1", &[], &[])]), None, false)
            .unwrap();
        scheduler
            .add_batch(
                Batch::new(
                    "b2",
                    vec![txn("t2", &[], &[]).with_dependencies(vec!["t1".to_string()])],
                ),
                None,
                false,
            )
            .unwrap();
        scheduler.finalize();

        // t2 waits for t1's batch even without an address conflict.
        assert_eq!(next_id(&scheduler).as_deref(), Some("t1"));
        assert_eq!(next_id(&scheduler), None);

        scheduler
            .set_transaction_execution_result("t1", TxnOutcome::invalid("bad"))
            .unwrap();
        assert_eq!(next_id(&scheduler), None);
        assert_eq!(
            scheduler.get_batch_execution_result("b2").unwrap(),
            Some(BatchExecutionResult::invalid())
        );
        assert!(scheduler.complete(true).unwrap());
    }

    #[test]
    fn test_result_errors() {
        let (scheduler, _) = scheduler();
        scheduler
            .add_batch(Batch::new("b1", vec![txn("t1", &[], &[])]), None, false)
            .unwrap();

        assert_eq!(
            scheduler.set_transaction_execution_result("nope", TxnOutcome::valid(ContextId(1))),
            Err(SchedulerError::UnknownTransaction("nope".to_string()))
        );
        assert_eq!(
            scheduler.set_transaction_execution_result("t1", TxnOutcome::valid(ContextId(1))),
            Err(SchedulerError::NotScheduled("t1".to_string()))
        );
        next_id(&scheduler);
        report(&scheduler, "t1", 1);
        assert_eq!(
            scheduler.set_transaction_execution_result("t1", TxnOutcome::valid(ContextId(1))),
            Err(SchedulerError::DuplicateResult("t1".to_string()))
        );
    }

    #[test]
    fn test_explicit_state_hash_is_cached() {
        let (scheduler, squash) = scheduler();
        let expected = root_for(&[ContextId(2), ContextId(1)]);
        scheduler
            .add_batch(Batch::new("b1", vec![txn("t1", &[], &["aa"])]), None, false)
            .unwrap();
        scheduler
            .add_batch(Batch::new("b2", vec![txn("t2", &["aa"], &[])]), Some(expected), false)
            .unwrap();

        next_id(&scheduler);
        assert_eq!(scheduler.get_batch_execution_result("b2").unwrap(), None);
        report(&scheduler, "t1", 1);
        next_id(&scheduler);
        report(&scheduler, "t2", 2);

        let result = BatchExecutionResult {
            is_valid: true,
            state_root: Some(expected),
        };
        assert_eq!(scheduler.get_batch_execution_result("b2").unwrap(), Some(result));
        assert_eq!(scheduler.get_batch_execution_result("b2").unwrap(), Some(result));
        let contexts = vec![ContextId(2), ContextId(1)];
        assert_eq!(
            squash.calls(),
            vec![
                (StateRoot::ZERO, contexts.clone(), false, false),
                (StateRoot::ZERO, contexts, true, true),
            ]
        );
    }

    #[test]
    fn test_implicit_state_root_for_last_valid_batch() {
        let (scheduler, squash) = scheduler();
        scheduler
            .add_batch(Batch::new("b1", vec![txn("t1", &[], &["aa"])]), None, false)
            .unwrap();
        scheduler
            .add_batch(Batch::new("b2", vec![txn("t2", &[], &["bb"])]), None, false)
            .unwrap();
        next_id(&scheduler);
        next_id(&scheduler);
        report(&scheduler, "t1", 1);
        scheduler
            .set_transaction_execution_result("t2", TxnOutcome::invalid("bad"))
            .unwrap();

        // Not final yet: no implicit root.
        assert_eq!(
            scheduler.get_batch_execution_result("b1").unwrap(),
            Some(BatchExecutionResult {
                is_valid: true,
                state_root: None
            })
        );

        scheduler.finalize();
        assert!(scheduler.complete(true).unwrap());
        assert_eq!(
            scheduler.get_batch_execution_result("b1").unwrap(),
            Some(BatchExecutionResult {
                is_valid: true,
                state_root: Some(root_for(&[ContextId(1)]))
            })
        );
        assert_eq!(
            squash.calls(),
            vec![(StateRoot::ZERO, vec![ContextId(1)], false, true)]
        );
    }

    #[test]
    fn test_unschedule_incomplete_batches() {
        let (scheduler, _) = scheduler();
        scheduler
            .add_batch(Batch::new("b1", vec![txn("t1", &[], &["aa"])]), None, false)
            .unwrap();
        scheduler
            .add_batch(Batch::new("b2", vec![txn("t2", &["aa"], &[])]), None, false)
            .unwrap();
        scheduler
            .add_batch(Batch::new("b3", vec![txn("t3", &[], &["aa"])]), None, true)
            .unwrap();

        next_id(&scheduler);
        scheduler.unschedule_incomplete_batches();
        assert!(scheduler.is_transaction_in_schedule("t1"));
        assert!(!scheduler.is_transaction_in_schedule("t2"));
        assert!(scheduler.is_transaction_in_schedule("t3"));

        report(&scheduler, "t1", 1);
        // t2 is gone, so t3 only waits on t1.
        let t3 = scheduler.next_transaction().unwrap().unwrap();
        assert_eq!(t3.txn.id, "t3");
        assert_eq!(t3.base_context_ids, vec![ContextId(1)]);

        scheduler.finalize();
        report(&scheduler, "t3", 3);
        assert!(scheduler.complete(false).unwrap());
    }

    #[test]
    fn test_cancel_unblocks_iterator() {
        let (scheduler, squash) = scheduler();
        let scheduler = Arc::new(scheduler);
        scheduler
            .add_batch(
                Batch::new("b1", vec![txn("t1", &[], &["aa"]), txn("t2", &["aa"], &[])]),
                None,
                false,
            )
            .unwrap();

        let blocked = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                let mut iter = scheduler.iter();
                let first = iter.next().unwrap().unwrap();
                scheduler
                    .set_transaction_execution_result(&first.txn.id, TxnOutcome::valid(ContextId(1)))
                    .unwrap();
                iter.next().unwrap().unwrap();
                let started = Instant::now();
                let outcome = iter.next();
                (outcome, iter.next(), started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        scheduler.cancel();

        let (outcome, after, waited) = blocked.join().unwrap();
        assert_eq!(outcome, Some(Err(SchedulerError::Cancelled)));
        assert_eq!(after, None);
        assert!(waited < Duration::from_secs(2));
        assert_eq!(
            squash.calls(),
            vec![(StateRoot::ZERO, vec![ContextId(1)], false, true)]
        );
        assert_eq!(scheduler.complete(true), Err(SchedulerError::Cancelled));
    }
}

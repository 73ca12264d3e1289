//! Reference scheduler: one transaction at a time, in declaration order.

use super::{Notifier, Scheduler, SchedulerConfig, SquashHandler};
use crate::error::SchedulerError;
use crate::types::{
    Batch, BatchExecutionResult, ContextId, StateRoot, Transaction, TxnExecutionResult, TxnInfo,
    TxnOutcome,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error, info, instrument};

struct AnnotatedBatch {
    batch: Batch,
    required: bool,
    preserve: bool,
}

struct SerialState {
    txn_queue: VecDeque<Transaction>,
    scheduled: Vec<TxnInfo>,
    batch_statuses: HashMap<String, BatchExecutionResult>,
    txn_to_batch: HashMap<String, String>,
    batch_by_id: HashMap<String, AnnotatedBatch>,
    txn_results: HashMap<String, TxnExecutionResult>,
    in_progress: Option<String>,
    is_final: bool,
    cancelled: bool,
    previous_context_id: Option<ContextId>,
    /// Last context of the most recent valid batch; the rollback point.
    previous_valid_batch_c_id: Option<ContextId>,
    /// Contexts built by the batch in progress, dropped if it turns invalid.
    batch_context_ids: Vec<ContextId>,
    /// Ids of the last transaction of each batch, in schedule order.
    last_in_batch: Vec<String>,
    previous_state_hash: StateRoot,
    required_state_hashes: HashMap<String, StateRoot>,
    already_calculated: bool,
}

/// Dispatches strictly in order; a transaction is only ready once the one
/// before it has a result.
pub struct SerialScheduler {
    state: Mutex<SerialState>,
    squash: SquashHandler,
    always_persist: bool,
    notifier: Notifier,
}

impl SerialScheduler {
    pub fn new(squash: SquashHandler, first_state_hash: StateRoot, config: SchedulerConfig) -> Self {
        Self {
            state: Mutex::new(SerialState {
                txn_queue: VecDeque::new(),
                scheduled: Vec::new(),
                batch_statuses: HashMap::new(),
                txn_to_batch: HashMap::new(),
                batch_by_id: HashMap::new(),
                txn_results: HashMap::new(),
                in_progress: None,
                is_final: false,
                cancelled: false,
                previous_context_id: None,
                previous_valid_batch_c_id: None,
                batch_context_ids: Vec::new(),
                last_in_batch: Vec::new(),
                previous_state_hash: first_state_hash,
                required_state_hashes: HashMap::new(),
                already_calculated: false,
            }),
            squash,
            always_persist: config.always_persist,
            notifier: Notifier::new(config.liveness_interval),
        }
    }

    /// Squashes the last valid batch's chain onto the base root.
    ///
    /// Without an expected root (or with `always_persist`) the chain is
    /// cleaned up right away. With one, the chain is persisted only if the
    /// preview matches.
    fn compute_merkle_root(
        &self,
        state: &SerialState,
        required: Option<StateRoot>,
    ) -> Result<Option<StateRoot>, SchedulerError> {
        let Some(context_id) = state.previous_valid_batch_c_id else {
            return Ok(None);
        };
        let publishing_or_genesis = self.always_persist || required.is_none();
        let root = self.squash.squash(
            state.previous_state_hash,
            &[context_id],
            self.always_persist,
            publishing_or_genesis,
        )?;
        if self.always_persist {
            return Ok(Some(root));
        }
        if Some(root) == required {
            self.squash.squash(state.previous_state_hash, &[context_id], true, true)?;
        }
        Ok(Some(root))
    }

    fn calculate_state_root_if_required(
        &self,
        state: &mut SerialState,
        batch_id: &str,
    ) -> Result<Option<StateRoot>, SchedulerError> {
        let Some(required) = state.required_state_hashes.get(batch_id).copied() else {
            return Ok(None);
        };
        let root = self.compute_merkle_root(state, Some(required))?;
        state.already_calculated = true;
        Ok(root)
    }

    fn calculate_state_root_if_not_already_done(
        &self,
        state: &mut SerialState,
    ) -> Result<(), SchedulerError> {
        if state.already_calculated {
            return Ok(());
        }
        let Some(last_txn) = state.last_in_batch.last() else {
            return Ok(());
        };
        let required = state
            .txn_to_batch
            .get(last_txn)
            .and_then(|batch_id| state.required_state_hashes.get(batch_id))
            .copied();

        let root = self.compute_merkle_root(state, required)?;
        state.already_calculated = true;

        let SerialState {
            last_in_batch,
            txn_to_batch,
            batch_statuses,
            ..
        } = state;
        for txn_id in last_in_batch.iter().rev() {
            let Some(status) = txn_to_batch
                .get(txn_id)
                .and_then(|batch_id| batch_statuses.get_mut(batch_id))
            else {
                continue;
            };
            if status.is_valid {
                status.state_root = root;
                break;
            }
        }
        Ok(())
    }

    fn is_complete(state: &SerialState) -> bool {
        state.is_final && state.txn_results.len() == state.txn_to_batch.len()
    }
}

impl SerialState {
    /// Marks the transaction's batch with a result and fails every member
    /// that has none yet.
    fn set_batch_result(&mut self, txn_id: &str, result: BatchExecutionResult) {
        // An in-progress transaction of an unscheduled batch is gone already.
        let Some(batch_id) = self.txn_to_batch.get(txn_id).cloned() else {
            return;
        };
        self.batch_statuses.insert(batch_id.clone(), result);
        if let Some(annotated) = self.batch_by_id.get(&batch_id) {
            for txn in &annotated.batch.transactions {
                self.txn_results
                    .entry(txn.id.clone())
                    .or_insert_with(|| TxnExecutionResult::failed(&txn.id));
            }
        }
    }

    fn in_invalid_batch(&self, txn_id: &str) -> bool {
        self.txn_to_batch
            .get(txn_id)
            .and_then(|batch_id| self.batch_statuses.get(batch_id))
            .is_some_and(|status| !status.is_valid)
    }

    /// Goes back to the last valid batch's context and returns the contexts
    /// the abandoned batch built.
    fn roll_back(&mut self) -> Vec<ContextId> {
        self.previous_context_id = self.previous_valid_batch_c_id;
        std::mem::take(&mut self.batch_context_ids)
    }

    fn fail_without_dispatch(&mut self, txn: &Transaction) -> Vec<ContextId> {
        self.set_batch_result(&txn.id, BatchExecutionResult::invalid());
        if self.last_in_batch.contains(&txn.id) {
            self.roll_back()
        } else {
            Vec::new()
        }
    }
}

impl Scheduler for SerialScheduler {
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
        let preserve = required || !state.batch_by_id.values().any(|b| !b.required);

        if let Some(state_hash) = state_hash {
            state.required_state_hashes.insert(batch.id.clone(), state_hash);
        }
        match batch.transactions.last() {
            Some(last) => state.last_in_batch.push(last.id.clone()),
            None => {
                state.batch_statuses.insert(
                    batch.id.clone(),
                    BatchExecutionResult {
                        is_valid: true,
                        state_root: None,
                    },
                );
            }
        }
        for txn in &batch.transactions {
            state.txn_to_batch.insert(txn.id.clone(), batch.id.clone());
            state.txn_queue.push_back(txn.clone());
        }
        debug!(txns = batch.transactions.len(), "added batch");
        state.batch_by_id.insert(
            batch.id.clone(),
            AnnotatedBatch {
                batch,
                required,
                preserve,
            },
        );
        drop(state);

        self.notifier.notify_all();
        Ok(())
    }

    fn next_transaction(&self) -> Result<Option<TxnInfo>, SchedulerError> {
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(SchedulerError::Cancelled);
        }
        if state.in_progress.is_some() {
            return Ok(None);
        }

        let mut failed_any = false;
        let mut discarded = Vec::new();
        let mut next = None;
        while let Some(txn) = state.txn_queue.pop_front() {
            let failed_by_dependency = txn.dependencies.iter().any(|dep| {
                state.txn_to_batch.contains_key(dep) && state.in_invalid_batch(dep)
            });
            if failed_by_dependency || state.in_invalid_batch(&txn.id) {
                discarded.extend(state.fail_without_dispatch(&txn));
                failed_any = true;
                continue;
            }
            next = Some(txn);
            break;
        }

        let info = next.map(|txn| {
            state.in_progress = Some(txn.id.clone());
            let info = TxnInfo {
                txn,
                state_root: state.previous_state_hash,
                base_context_ids: state.previous_context_id.into_iter().collect(),
            };
            state.scheduled.push(info.clone());
            info
        });
        drop(state);

        self.squash.discard(&discarded);
        if failed_any {
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
        let Some(batch_id) = state.txn_to_batch.get(txn_id).cloned() else {
            return Err(SchedulerError::UnknownTransaction(txn_id.to_string()));
        };
        if state.txn_results.contains_key(txn_id) {
            return Err(SchedulerError::DuplicateResult(txn_id.to_string()));
        }
        if state.in_progress.as_deref() != Some(txn_id) {
            return Err(SchedulerError::NotScheduled(txn_id.to_string()));
        }
        state.in_progress = None;

        let is_valid = outcome.is_valid;
        let context_id = outcome.context_id;
        let result = TxnExecutionResult::from_outcome(txn_id, outcome, state.previous_state_hash);
        state.txn_results.insert(txn_id.to_string(), result);

        if is_valid {
            state.previous_context_id = context_id;
            state.batch_context_ids.extend(context_id);
        } else {
            // Fail the rest of the batch ahead of time.
            state
                .batch_statuses
                .insert(batch_id.clone(), BatchExecutionResult::invalid());
        }

        let mut outcome = Ok(());
        let mut discarded = Vec::new();
        if state.last_in_batch.iter().any(|id| id == txn_id) {
            if state.batch_statuses.contains_key(&batch_id) {
                discarded = state.roll_back();
            } else {
                state.previous_valid_batch_c_id = state.previous_context_id;
                state.batch_context_ids.clear();
                match self.calculate_state_root_if_required(&mut state, &batch_id) {
                    Ok(state_root) => {
                        state.batch_statuses.insert(
                            batch_id,
                            BatchExecutionResult {
                                is_valid: true,
                                state_root,
                            },
                        );
                    }
                    Err(e) => outcome = Err(e),
                }
            }
        }
        drop(state);

        if !discarded.is_empty() {
            debug!(contexts = discarded.len(), "discarding contexts of invalid batch");
        }
        self.squash.discard(&discarded);
        self.notifier.notify_all();
        outcome
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
                if !state.is_final {
                    return Ok(false);
                }
                if Self::is_complete(&state) {
                    self.calculate_state_root_if_not_already_done(&mut state)?;
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
        if !state.cancelled && !state.is_final {
            if let Some(context_id) = state.previous_context_id {
                if let Err(e) = self.squash.squash(state.previous_state_hash, &[context_id], false, true) {
                    error!(error = %e, "failed to clean up contexts on cancel");
                }
            }
        }
        if !state.cancelled {
            info!("serial scheduler cancelled");
        }
        state.cancelled = true;
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
        Ok(self.state.lock().batch_statuses.get(batch_id).copied())
    }

    fn get_transaction_execution_results(
        &self,
        batch_id: &str,
    ) -> Option<Vec<TxnExecutionResult>> {
        let state = self.state.lock();
        state.batch_statuses.get(batch_id)?;
        let annotated = state.batch_by_id.get(batch_id)?;
        Some(
            annotated
                .batch
                .transactions
                .iter()
                .filter_map(|txn| state.txn_results.get(&txn.id).cloned())
                .collect(),
        )
    }

    fn unschedule_incomplete_batches(&self) {
        let mut state = self.state.lock();

        let mut in_progress_batch = None;
        if let Some(txn_id) = state.in_progress.clone() {
            let batch_id = state.txn_to_batch.get(&txn_id).cloned();
            let preserve = batch_id
                .as_ref()
                .and_then(|id| state.batch_by_id.get(id))
                .is_some_and(|b| b.preserve);
            if preserve {
                in_progress_batch = batch_id;
            } else {
                state.in_progress = None;
            }
        }

        let incomplete: Vec<String> = state
            .batch_by_id
            .iter()
            .filter(|(id, annotated)| {
                !(state.batch_statuses.contains_key(*id)
                    || annotated.preserve
                    || in_progress_batch.as_ref() == Some(*id))
            })
            .map(|(id, _)| id.clone())
            .collect();

        for batch_id in &incomplete {
            let Some(annotated) = state.batch_by_id.remove(batch_id) else {
                continue;
            };
            for txn in &annotated.batch.transactions {
                state.txn_results.remove(&txn.id);
                state.txn_to_batch.remove(&txn.id);
            }
            state
                .txn_queue
                .retain(|queued| !annotated.batch.transactions.iter().any(|t| t.id == queued.id));
            if let Some(last) = annotated.batch.transactions.last() {
                state.last_in_batch.retain(|id| *id != last.id);
            }
        }
        drop(state);

        if !incomplete.is_empty() {
            debug!(count = incomplete.len(), "removed incomplete batches from the schedule");
        }
        self.notifier.notify_all();
    }

    fn is_transaction_in_schedule(&self, txn_id: &str) -> bool {
        self.state.lock().txn_to_batch.contains_key(txn_id)
    }

    fn count(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    fn get_transaction(&self, index: usize) -> Option<TxnInfo> {
        self.state.lock().scheduled.get(index).cloned()
    }

    fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

impl Drop for SerialScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

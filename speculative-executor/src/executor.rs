//! Drives a scheduler to completion with a pool of worker threads.
//!
//! The calling thread runs the dispatch loop over the scheduler's blocking
//! iterator and hands each ready transaction to a worker over a channel. A
//! worker opens a context for the transaction, runs the handler registered
//! for its family and reports the outcome back to the scheduler.

use crate::context::ContextManager;
use crate::error::{ApplyError, ContextError, SchedulerError, StoreError};
use crate::scheduler::{Scheduler, SchedulerIterator};
use crate::types::{ContextId, Event, Transaction, TxnInfo, TxnOutcome};
use crossbeam::channel::unbounded;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Applies transactions of one family against a context.
pub trait TransactionHandler: Send + Sync {
    /// Family this handler is registered under.
    fn family_name(&self) -> &str;

    /// Applies `txn`. An error marks the transaction invalid, except for a
    /// failing state store, which aborts the whole run.
    fn apply(&self, txn: &Transaction, context: &TransactionContext<'_>) -> Result<(), ApplyError>;
}

/// A handler's view of the context its transaction runs in.
pub struct TransactionContext<'a> {
    manager: &'a ContextManager,
    context_id: ContextId,
}

impl<'a> TransactionContext<'a> {
    pub fn new(manager: &'a ContextManager, context_id: ContextId) -> Self {
        Self {
            manager,
            context_id,
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Values at `addresses`, in the order given. Absent entries are `None`.
    pub fn get_state(
        &self,
        addresses: &[String],
    ) -> Result<Vec<(String, Option<Vec<u8>>)>, ApplyError> {
        Ok(self.manager.get(self.context_id, addresses)?)
    }

    pub fn set_state(&self, entries: BTreeMap<String, Vec<u8>>) -> Result<(), ApplyError> {
        Ok(self.manager.set(self.context_id, entries)?)
    }

    pub fn delete_state(&self, addresses: &[String]) -> Result<(), ApplyError> {
        Ok(self.manager.delete(self.context_id, addresses)?)
    }

    pub fn add_event(&self, event: Event) -> Result<(), ApplyError> {
        Ok(self.manager.add_execution_event(self.context_id, event)?)
    }

    pub fn add_receipt_data(&self, data: Vec<u8>) -> Result<(), ApplyError> {
        Ok(self.manager.add_execution_data(self.context_id, data)?)
    }
}

/// Configuration for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    pub num_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { num_workers: 4 }
    }
}

/// Counters for one run of [`TransactionExecutor::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Transactions handed to workers, re-dispatches included.
    pub dispatched: usize,
    /// Outcomes reported valid.
    pub valid: usize,
    /// Outcomes reported invalid.
    pub invalid: usize,
    pub duration: Duration,
}

/// Runs scheduled transactions through registered handlers.
pub struct TransactionExecutor {
    context_manager: Arc<ContextManager>,
    handlers: HashMap<String, Arc<dyn TransactionHandler>>,
    config: ExecutorConfig,
}

impl TransactionExecutor {
    pub fn new(context_manager: Arc<ContextManager>, config: ExecutorConfig) -> Self {
        Self {
            context_manager,
            handlers: HashMap::new(),
            config,
        }
    }

    /// Registers `handler` for its family, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn TransactionHandler>) {
        self.handlers
            .insert(handler.family_name().to_string(), handler);
    }

    pub fn context_manager(&self) -> &Arc<ContextManager> {
        &self.context_manager
    }

    /// Dispatches every transaction `scheduler` releases until it is
    /// complete.
    ///
    /// Returns once the scheduler reports completion, which for a serial
    /// scheduler requires it to be finalized. A failure while reporting a
    /// result, or a failing state store, cancels the scheduler and is
    /// returned.
    pub fn execute(&self, scheduler: &dyn Scheduler) -> Result<ExecutionStats, SchedulerError> {
        let start = Instant::now();
        let valid = AtomicUsize::new(0);
        let invalid = AtomicUsize::new(0);
        let failure: Mutex<Option<SchedulerError>> = Mutex::new(None);
        let (work_tx, work_rx) = unbounded::<TxnInfo>();

        let dispatched = thread::scope(|s| {
            for worker_id in 0..self.config.num_workers.max(1) {
                let work_rx = work_rx.clone();
                let (valid, invalid, failure) = (&valid, &invalid, &failure);
                s.spawn(move || {
                    for info in work_rx.iter() {
                        let txn_id = info.txn.id.clone();
                        let outcome = match self.run(&info) {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                error!(worker_id, txn = %txn_id, error = %e, "state store failed, cancelling schedule");
                                failure.lock().get_or_insert(SchedulerError::Store(e));
                                scheduler.cancel();
                                continue;
                            }
                        };
                        let counter = if outcome.is_valid { valid } else { invalid };
                        match scheduler.set_transaction_execution_result(&txn_id, outcome) {
                            Ok(()) => {
                                counter.fetch_add(1, Ordering::Relaxed);
                            }
                            // Unscheduled while in flight.
                            Err(SchedulerError::UnknownTransaction(_)) => {
                                debug!(worker_id, txn = %txn_id, "dropping result for unscheduled transaction");
                            }
                            Err(e) => {
                                error!(worker_id, txn = %txn_id, error = %e, "failed to record transaction result");
                                failure.lock().get_or_insert(e);
                                scheduler.cancel();
                            }
                        }
                    }
                });
            }
            drop(work_rx);

            let mut dispatched = 0;
            let mut result = Ok(());
            for item in SchedulerIterator::new(scheduler) {
                match item {
                    Ok(info) => {
                        dispatched += 1;
                        if work_tx.send(info).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            drop(work_tx);
            result.map(|()| dispatched)
        });

        if let Some(e) = failure.into_inner() {
            return Err(e);
        }
        let dispatched = dispatched?;
        let stats = ExecutionStats {
            dispatched,
            valid: valid.into_inner(),
            invalid: invalid.into_inner(),
            duration: start.elapsed(),
        };
        info!(
            dispatched = stats.dispatched,
            valid = stats.valid,
            invalid = stats.invalid,
            elapsed_ms = stats.duration.as_millis() as u64,
            "schedule executed"
        );
        Ok(stats)
    }

    /// Executes one transaction in a fresh context.
    fn run(&self, info: &TxnInfo) -> Result<TxnOutcome, StoreError> {
        let txn = &info.txn;
        let Some(handler) = self.handlers.get(&txn.family) else {
            warn!(txn = %txn.id, family = %txn.family, "no handler registered for family");
            return Ok(TxnOutcome::invalid(format!(
                "unknown transaction family {}",
                txn.family
            )));
        };

        let context_id = match self.context_manager.create_context(
            info.state_root,
            &info.base_context_ids,
            &txn.inputs,
            &txn.outputs,
        ) {
            Ok(id) => id,
            Err(e) => {
                warn!(txn = %txn.id, error = %e, "failed to create context");
                return Ok(TxnOutcome::invalid(e.to_string()));
            }
        };

        let context = TransactionContext::new(&self.context_manager, context_id);
        let applied = handler
            .apply(txn, &context)
            .and_then(|()| {
                self.context_manager
                    .get_execution_results(context_id)
                    .map_err(ApplyError::from)
            });
        match applied {
            Ok(results) => Ok(TxnOutcome {
                is_valid: true,
                context_id: Some(context_id),
                state_changes: results.state_changes(),
                events: results.events,
                data: results.data,
                error_message: None,
            }),
            Err(ApplyError::Context(ContextError::Store(e))) => {
                self.context_manager.delete_contexts(&[context_id]);
                Err(e)
            }
            Err(e) => {
                debug!(txn = %txn.id, error = %e, "transaction rejected");
                self.context_manager.delete_contexts(&[context_id]);
                Ok(TxnOutcome::invalid(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Writes the payload to every output address after reading every input.
    /// An empty payload is rejected.
    pub struct CopyHandler;

    impl TransactionHandler for CopyHandler {
        fn family_name(&self) -> &str {
            "copy"
        }

        fn apply(&self, txn: &Transaction, context: &TransactionContext<'_>) -> Result<(), ApplyError> {
            context.get_state(&txn.inputs)?;
            if txn.payload.is_empty() {
                return Err(ApplyError::InvalidTransaction("empty payload".to_string()));
            }
            let entries = txn
                .outputs
                .iter()
                .map(|address| (address.clone(), txn.payload.clone()))
                .collect();
            context.set_state(entries)?;
            context.add_receipt_data(txn.payload.clone())
        }
    }

    pub fn address(n: u8) -> String {
        format!("{n:02x}").repeat(35)
    }

    pub fn copy_txn(id: &str, reads: &[u8], writes: &[u8], payload: &[u8]) -> Transaction {
        Transaction::new(
            id,
            reads.iter().map(|n| address(*n)).collect(),
            writes.iter().map(|n| address(*n)).collect(),
        )
        .with_family("copy")
        .with_payload(payload.to_vec())
    }
}

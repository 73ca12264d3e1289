//! Scheduling contract shared by the serial and parallel schedulers.
//!
//! A scheduler owns one block's worth of batches. Producers add batches and
//! then finalize; a dispatch loop pulls ready transactions through
//! [`SchedulerIterator`]; workers report outcomes with
//! [`Scheduler::set_transaction_execution_result`]. Every dispatched
//! [`TxnInfo`] is appended to a log, so any iterator can replay what was
//! dispatched before it started.

mod parallel;
mod serial;

pub use parallel::ParallelScheduler;
pub use serial::SerialScheduler;

use crate::error::{ContextError, SchedulerError};
use crate::types::{
    Batch, BatchExecutionResult, ContextId, StateRoot, TxnExecutionResult, TxnInfo, TxnOutcome,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

type SquashFn =
    dyn Fn(StateRoot, &[ContextId], bool, bool) -> Result<StateRoot, ContextError> + Send + Sync;
type DiscardFn = dyn Fn(&[ContextId]) + Send + Sync;

/// A scheduler's handle on the contexts its transactions ran in.
#[derive(Clone)]
pub struct SquashHandler {
    squash: Arc<SquashFn>,
    discard: Arc<DiscardFn>,
}

impl SquashHandler {
    pub fn new<S, D>(squash: S, discard: D) -> Self
    where
        S: Fn(StateRoot, &[ContextId], bool, bool) -> Result<StateRoot, ContextError>
            + Send
            + Sync
            + 'static,
        D: Fn(&[ContextId]) + Send + Sync + 'static,
    {
        Self {
            squash: Arc::new(squash),
            discard: Arc::new(discard),
        }
    }

    /// Merges the writes of `context_ids` (and everything they are based on)
    /// into `state_root`. With `clean_up` every visited context is deleted.
    pub fn squash(
        &self,
        state_root: StateRoot,
        context_ids: &[ContextId],
        persist: bool,
        clean_up: bool,
    ) -> Result<StateRoot, ContextError> {
        (self.squash)(state_root, context_ids, persist, clean_up)
    }

    /// Deletes contexts whose results will never be squashed.
    pub fn discard(&self, context_ids: &[ContextId]) {
        if !context_ids.is_empty() {
            (self.discard)(context_ids);
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Persist the implicit state root computed for the last valid batch.
    pub always_persist: bool,
    /// Upper bound on how long a blocked wait goes without re-checking state.
    pub liveness_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            always_persist: false,
            liveness_interval: Duration::from_millis(100),
        }
    }
}

/// Wakes threads waiting for scheduler progress.
///
/// Every state change bumps a generation counter. A waiter reads the
/// generation before inspecting scheduler state and then waits for it to move,
/// so a change that lands between the check and the wait is never missed.
pub struct Notifier {
    generation: Mutex<u64>,
    condvar: Condvar,
    liveness_interval: Duration,
}

impl Notifier {
    pub fn new(liveness_interval: Duration) -> Self {
        Self {
            generation: Mutex::new(0),
            condvar: Condvar::new(),
            liveness_interval,
        }
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub fn notify_all(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.condvar.notify_all();
    }

    /// Blocks until the generation differs from `seen` or the liveness
    /// interval elapses. Returns `false` on timeout.
    pub fn wait_past(&self, seen: u64) -> bool {
        let deadline = Instant::now() + self.liveness_interval;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.condvar.wait_until(&mut generation, deadline).timed_out() {
                return *generation != seen;
            }
        }
        true
    }
}

/// Operations common to every scheduler. Implementations are thread-safe.
pub trait Scheduler: Send + Sync {
    /// Appends a batch. `state_hash` is the root the batch is expected to
    /// produce; `required` batches survive
    /// [`unschedule_incomplete_batches`](Scheduler::unschedule_incomplete_batches).
    fn add_batch(
        &self,
        batch: Batch,
        state_hash: Option<StateRoot>,
        required: bool,
    ) -> Result<(), SchedulerError>;

    /// Returns the next ready transaction without blocking.
    fn next_transaction(&self) -> Result<Option<TxnInfo>, SchedulerError>;

    /// Records the terminal outcome of a dispatched transaction.
    fn set_transaction_execution_result(
        &self,
        txn_id: &str,
        outcome: TxnOutcome,
    ) -> Result<(), SchedulerError>;

    /// Stops accepting batches. Already added batches keep draining.
    fn finalize(&self);

    /// Whether every added transaction has a result. With `block` the call
    /// waits for that, returning [`SchedulerError::Cancelled`] if the
    /// scheduler is cancelled meanwhile. Always `false` before `finalize`.
    fn complete(&self, block: bool) -> Result<bool, SchedulerError>;

    /// Abandons the schedule and wakes every waiter.
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;

    /// `None` until the batch's result is known.
    fn get_batch_execution_result(
        &self,
        batch_id: &str,
    ) -> Result<Option<BatchExecutionResult>, SchedulerError>;

    fn get_transaction_execution_results(&self, batch_id: &str)
        -> Option<Vec<TxnExecutionResult>>;

    /// Drops every batch that is neither preserved nor fully processed.
    fn unschedule_incomplete_batches(&self);

    fn is_transaction_in_schedule(&self, txn_id: &str) -> bool;

    /// Number of entries in the dispatch log.
    fn count(&self) -> usize;

    /// Entry `index` of the dispatch log.
    fn get_transaction(&self, index: usize) -> Option<TxnInfo>;

    fn notifier(&self) -> &Notifier;

    /// Blocking iterator over dispatched transactions.
    fn iter(&self) -> SchedulerIterator<'_>
    where
        Self: Sized,
    {
        SchedulerIterator::new(self)
    }
}

/// Walks the dispatch log from the start, pulling new transactions from the
/// scheduler as they become ready.
///
/// Ends once the scheduler is complete and the whole log has been yielded.
/// Cancellation yields one `Err(SchedulerError::Cancelled)` and then ends.
pub struct SchedulerIterator<'a> {
    scheduler: &'a dyn Scheduler,
    next_index: usize,
    done: bool,
}

impl<'a> SchedulerIterator<'a> {
    pub fn new(scheduler: &'a dyn Scheduler) -> Self {
        Self {
            scheduler,
            next_index: 0,
            done: false,
        }
    }

    fn fail(&mut self, error: SchedulerError) -> Option<Result<TxnInfo, SchedulerError>> {
        self.done = true;
        Some(Err(error))
    }
}

impl Iterator for SchedulerIterator<'_> {
    type Item = Result<TxnInfo, SchedulerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let seen = self.scheduler.notifier().generation();

            if self.scheduler.is_cancelled() {
                return self.fail(SchedulerError::Cancelled);
            }

            // Catch up on anything already in the log.
            if self.next_index < self.scheduler.count() {
                if let Some(info) = self.scheduler.get_transaction(self.next_index) {
                    self.next_index += 1;
                    return Some(Ok(info));
                }
            }

            match self.scheduler.complete(false) {
                Ok(true) if self.scheduler.count() == self.next_index => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(error) => return self.fail(error),
            }

            match self.scheduler.next_transaction() {
                // Appended to the log; picked up by the catch-up above.
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(error) => return self.fail(error),
            }

            self.scheduler.notifier().wait_past(seen);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_notifier_wakes_waiter() {
        let notifier = Arc::new(Notifier::new(Duration::from_secs(5)));
        let seen = notifier.generation();

        let waiter = {
            let notifier = Arc::clone(&notifier);
            thread::spawn(move || notifier.wait_past(seen))
        };
        thread::sleep(Duration::from_millis(20));
        notifier.notify_all();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_notifier_times_out() {
        let notifier = Notifier::new(Duration::from_millis(5));
        let seen = notifier.generation();
        assert!(!notifier.wait_past(seen));
    }

    #[test]
    fn test_notifier_does_not_miss_earlier_change() {
        let notifier = Notifier::new(Duration::from_secs(5));
        let seen = notifier.generation();
        notifier.notify_all();
        let start = Instant::now();
        assert!(notifier.wait_past(seen));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}

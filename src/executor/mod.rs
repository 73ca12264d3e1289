//! Scheduling strategies.
//!
//! This module provides the [`Executor`] trait and the serial and parallel
//! strategies. Both run a [`Workload`] through the same engine and differ
//! only in the scheduler they hand it to.

mod parallel;
mod serial;

pub use parallel::ParallelExecutor;
pub use serial::SerialExecutor;

use crate::{IntkeyHandler, Workload};
use speculative_executor::{
    ContextManager, ContextManagerConfig, ExecutionStats, ExecutorConfig, Scheduler,
    SchedulerConfig, SchedulerError, SquashHandler, StateRoot, TransactionExecutor,
};
use std::sync::Arc;
use thiserror::Error;

/// Failures while running a workload.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    /// A batch had no result after the scheduler completed.
    #[error("no result for batch {0}")]
    MissingResult(String),
}

/// Result of executing a workload.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Number of batches whose transactions were all valid.
    pub valid_batches: usize,
    /// Number of batches rejected as a whole.
    pub invalid_batches: usize,
    /// Root after the last valid batch, or the initial root if none was valid.
    pub state_root: StateRoot,
    pub stats: ExecutionStats,
}

/// A strategy for executing workloads.
pub trait Executor {
    /// Runs every batch of `workload` against a fresh store.
    fn execute(&self, workload: &Workload) -> Result<ExecutionResult, HarnessError>;

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Runs `workload` through the scheduler built by `make_scheduler`.
pub(crate) fn run_workload<S, F>(
    workload: &Workload,
    num_workers: usize,
    make_scheduler: F,
) -> Result<ExecutionResult, HarnessError>
where
    S: Scheduler,
    F: FnOnce(SquashHandler, StateRoot, SchedulerConfig) -> S,
{
    let store = Arc::new(workload.create_store());
    let initial_root = store.initial_root();
    let manager = Arc::new(ContextManager::new(
        store.clone(),
        ContextManagerConfig::default(),
    ));
    let config = SchedulerConfig {
        always_persist: true,
        ..SchedulerConfig::default()
    };
    let scheduler = make_scheduler(manager.get_squash_handler(), initial_root, config);

    let mut executor = TransactionExecutor::new(manager, ExecutorConfig { num_workers });
    executor.register(Arc::new(IntkeyHandler));

    for batch in &workload.batches {
        scheduler.add_batch(batch.clone(), None, false)?;
    }
    scheduler.finalize();
    let stats = executor.execute(&scheduler)?;

    collect_results(&scheduler, workload, initial_root, stats)
}

fn collect_results(
    scheduler: &dyn Scheduler,
    workload: &Workload,
    initial_root: StateRoot,
    stats: ExecutionStats,
) -> Result<ExecutionResult, HarnessError> {
    let mut valid_batches = 0;
    let mut invalid_batches = 0;
    let mut state_root = initial_root;
    for batch in &workload.batches {
        let result = scheduler
            .get_batch_execution_result(&batch.id)?
            .ok_or_else(|| HarnessError::MissingResult(batch.id.clone()))?;
        if result.is_valid {
            valid_batches += 1;
            if let Some(root) = result.state_root {
                state_root = root;
            }
        } else {
            invalid_batches += 1;
        }
    }

    Ok(ExecutionResult {
        valid_batches,
        invalid_batches,
        state_root,
        stats,
    })
}

//! Parallel scheduling strategy.

use super::{run_workload, ExecutionResult, Executor, HarnessError};
use crate::Workload;
use speculative_executor::ParallelScheduler;

/// Runs transactions on a worker pool as soon as the transactions they
/// conflict with have results.
#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    /// Number of worker threads.
    pub num_workers: usize,
}

impl ParallelExecutor {
    pub fn new(num_workers: usize) -> Self {
        Self { num_workers }
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Executor for ParallelExecutor {
    fn execute(&self, workload: &Workload) -> Result<ExecutionResult, HarnessError> {
        run_workload(workload, self.num_workers, ParallelScheduler::new)
    }

    fn name(&self) -> &'static str {
        "parallel"
    }
}

//! Serial scheduling strategy.

use super::{run_workload, ExecutionResult, Executor, HarnessError};
use crate::Workload;
use speculative_executor::SerialScheduler;

/// Runs one transaction at a time in batch order.
///
/// This is the reference strategy: every other strategy must reach the same
/// state root on the same workload.
///
/// # Example
///
/// ```
/// use exec_harness::{Executor, SerialExecutor, Workload, WorkloadConfig};
///
/// let workload = Workload::generate(WorkloadConfig::default()).unwrap();
/// let result = SerialExecutor::new().execute(&workload).unwrap();
///
/// println!("Valid: {}, Invalid: {}", result.valid_batches, result.invalid_batches);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SerialExecutor;

impl SerialExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, workload: &Workload) -> Result<ExecutionResult, HarnessError> {
        // The scheduler never releases more than one transaction at a time.
        run_workload(workload, 1, SerialScheduler::new)
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}

//! Speculative, dependency-aware transaction execution.
//!
//! Transactions in a block are grouped into atomic batches. A scheduler
//! decides which transactions may run, each running transaction gets an
//! isolated context chained on top of the contexts of the transactions it
//! depends on, and a squash folds the contexts of the valid batches into one
//! update of the state store. Running the same batches through the serial and
//! the parallel scheduler yields the same state root.
//!
//! # Core Components
//!
//! - **PredecessorTree**: radix index over hierarchical addresses answering
//!   which in-flight transactions a new read or write conflicts with
//! - **SerialScheduler / ParallelScheduler**: two implementations of the
//!   [`Scheduler`] contract; the parallel one releases a transaction as soon
//!   as its predecessors have results
//! - **ContextManager**: creates and chains execution contexts, prefetches
//!   their inputs in the background and provides the squash handler
//! - **TransactionExecutor**: worker pool driving a scheduler through
//!   registered [`TransactionHandler`]s
//!
//! # Example
//!
//! ```rust,ignore
//! use speculative_executor::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let manager = Arc::new(ContextManager::new(store.clone(), ContextManagerConfig::default()));
//! let scheduler = ParallelScheduler::new(
//!     manager.get_squash_handler(),
//!     store.initial_root(),
//!     SchedulerConfig::default(),
//! );
//!
//! let mut executor = TransactionExecutor::new(manager, ExecutorConfig::default());
//! executor.register(Arc::new(MyHandler));
//!
//! scheduler.add_batch(batch, None, false)?;
//! scheduler.finalize();
//! let stats = executor.execute(&scheduler)?;
//! let root = scheduler.get_batch_execution_result(&batch_id)?.and_then(|r| r.state_root);
//! ```

pub mod context;
pub mod error;
pub mod executor;
pub mod predecessor_tree;
pub mod scheduler;
pub mod store;
pub mod types;


pub use context::{ContextManager, ContextManagerConfig, ExecutionContext, ExecutionResults};
pub use error::{ApplyError, ContextError, SchedulerError, StoreError};
pub use executor::{
    ExecutionStats, ExecutorConfig, TransactionContext, TransactionExecutor, TransactionHandler,
};
pub use predecessor_tree::PredecessorTree;
pub use scheduler::{
    Notifier, ParallelScheduler, Scheduler, SchedulerConfig, SchedulerIterator, SerialScheduler,
    SquashHandler,
};
pub use store::{compute_root, ChangeLogEntry, MemoryStore, StateStore};
pub use types::{
    Batch, BatchExecutionResult, ContextId, Event, StateChange, StateRoot, Transaction,
    TxnExecutionResult, TxnIndex, TxnInfo, TxnOutcome,
};

//! Error types for the execution engine.

use crate::types::{ContextId, StateRoot};
use thiserror::Error;

/// Failures reported by a [`StateStore`](crate::store::StateStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("state root {0} is not known to the store")]
    UnknownRoot(StateRoot),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failures from the context manager and the squash handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// Read or write outside the transaction's declared namespaces.
    #[error("not authorized to read/write to {address}")]
    Authorization { address: String },
    /// Unknown context id, either directly or somewhere in a base chain.
    #[error("context {0} is not in the context manager")]
    NotFound(ContextId),
    /// Malformed input/output namespace given at context creation.
    #[error("address or namespace {0} is not valid")]
    InvalidAddress(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ContextError {
    pub(crate) fn unauthorized(address: &str) -> Self {
        ContextError::Authorization {
            address: address.to_string(),
        }
    }
}

/// Failures from a scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("scheduler is finalized, cannot add batch {batch_id}")]
    Finalized { batch_id: String },
    #[error("transaction {0} is not in any batch")]
    UnknownTransaction(String),
    #[error("transaction {0} has not been scheduled")]
    NotScheduled(String),
    #[error("transaction {0} already has a result")]
    DuplicateResult(String),
    #[error("scheduler was cancelled")]
    Cancelled,
    #[error("squash failed: {0}")]
    Squash(#[from] ContextError),
    /// The state store failed while a transaction was running.
    #[error("state store failed: {0}")]
    Store(#[from] StoreError),
}

/// Failures from a [`TransactionHandler`](crate::executor::TransactionHandler).
///
/// Any of these marks the transaction invalid; none aborts the block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// The payload was rejected by the transaction family.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Context(#[from] ContextError),
}

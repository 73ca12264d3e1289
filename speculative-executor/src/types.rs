//! Core types shared by the schedulers, the context manager and the executor.

use alloy_primitives::B256;
use std::fmt;

/// Root hash of a state trie.
pub type StateRoot = B256;

/// Position of a transaction in the schedule (0-based, in the order batches
/// and their transactions were added).
pub type TxnIndex = usize;

/// Identifier of a speculative execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{:016x}", self.0)
    }
}

/// A transaction as seen by the scheduling core.
///
/// The payload is opaque here; only the declared inputs, outputs and explicit
/// dependencies matter for scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Unique transaction id (the header signature).
    pub id: String,
    /// Name of the transaction family that interprets the payload.
    pub family: String,
    /// Addresses or namespaces the transaction may read.
    pub inputs: Vec<String>,
    /// Addresses or namespaces the transaction may write.
    pub outputs: Vec<String>,
    /// Ids of transactions that must be committed in a valid batch first.
    pub dependencies: Vec<String>,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(id: impl Into<String>, inputs: Vec<String>, outputs: Vec<String>) -> Self {
        Self {
            id: id.into(),
            family: String::new(),
            inputs,
            outputs,
            dependencies: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = family.into();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// An atomic group of transactions: either all are valid or the batch is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: String,
    pub transactions: Vec<Transaction>,
}

impl Batch {
    pub fn new(id: impl Into<String>, transactions: Vec<Transaction>) -> Self {
        Self {
            id: id.into(),
            transactions,
        }
    }
}

/// Unit of dispatch handed from a scheduler to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnInfo {
    pub txn: Transaction,
    /// State root the transaction's context is based on.
    pub state_root: StateRoot,
    /// Contexts whose writes must be visible to this transaction.
    pub base_context_ids: Vec<ContextId>,
}

/// A change to a single address made by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Set { address: String, value: Vec<u8> },
    Delete { address: String },
}

impl StateChange {
    pub fn address(&self) -> &str {
        match self {
            StateChange::Set { address, .. } | StateChange::Delete { address } => address,
        }
    }
}

/// Side-effect record emitted by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    pub event_type: String,
    pub attributes: Vec<(String, String)>,
    pub data: Vec<u8>,
}

/// What the executor reports for one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxnOutcome {
    pub is_valid: bool,
    pub context_id: Option<ContextId>,
    pub state_changes: Vec<StateChange>,
    pub events: Vec<Event>,
    pub data: Vec<Vec<u8>>,
    pub error_message: Option<String>,
}

impl TxnOutcome {
    pub fn valid(context_id: ContextId) -> Self {
        Self {
            is_valid: true,
            context_id: Some(context_id),
            ..Default::default()
        }
    }

    pub fn invalid(error_message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error_message: Some(error_message.into()),
            ..Default::default()
        }
    }
}

/// Terminal result recorded by a scheduler for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnExecutionResult {
    pub id: String,
    pub is_valid: bool,
    /// Set only for valid transactions.
    pub context_id: Option<ContextId>,
    /// Root the transaction ran against; set only for valid transactions.
    pub state_root: Option<StateRoot>,
    pub state_changes: Vec<StateChange>,
    pub events: Vec<Event>,
    pub data: Vec<Vec<u8>>,
    pub error_message: String,
}

impl TxnExecutionResult {
    pub(crate) fn from_outcome(id: &str, outcome: TxnOutcome, state_root: StateRoot) -> Self {
        let is_valid = outcome.is_valid;
        Self {
            id: id.to_string(),
            is_valid,
            context_id: if is_valid { outcome.context_id } else { None },
            state_root: is_valid.then_some(state_root),
            state_changes: outcome.state_changes,
            events: outcome.events,
            data: outcome.data,
            error_message: outcome.error_message.unwrap_or_default(),
        }
    }

    /// Result for a transaction that was failed without being dispatched.
    pub(crate) fn failed(id: &str) -> Self {
        Self {
            id: id.to_string(),
            is_valid: false,
            context_id: None,
            state_root: None,
            state_changes: Vec::new(),
            events: Vec::new(),
            data: Vec::new(),
            error_message: String::new(),
        }
    }
}

/// Result for a whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchExecutionResult {
    pub is_valid: bool,
    /// Present when a state root was requested for (or implied by) this batch.
    pub state_root: Option<StateRoot>,
}

impl BatchExecutionResult {
    pub fn invalid() -> Self {
        Self {
            is_valid: false,
            state_root: None,
        }
    }
}

//! Benchmarking harness for the speculative execution engine.
//!
//! This crate drives [`speculative_executor`] end to end with an integer-key
//! transaction family, comparing serial and parallel scheduling on the same
//! workloads.
//!
//! # Architecture
//!
//! The framework is organized around three main concepts:
//!
//! - **Workload**: pre-generated batches of integer-key transactions and the
//!   initial state they run against
//! - **Executor**: a scheduling strategy (serial or parallel) that runs a
//!   workload and reports the resulting state root
//! - **IntkeyHandler**: the transaction family applied inside each context
//!
//! # Quick Start
//!
//! ```
//! use exec_harness::{Executor, ParallelExecutor, SerialExecutor, Workload, WorkloadConfig};
//!
//! let config = WorkloadConfig {
//!     num_keys: 50,
//!     num_batches: 10,
//!     txns_per_batch: 4,
//!     conflict_factor: 0.5,
//!     invalid_rate: 0.0,
//!     seed: 42,
//! };
//! let workload = Workload::generate(config).unwrap();
//!
//! let serial = SerialExecutor::new().execute(&workload).unwrap();
//! let parallel = ParallelExecutor::new(4).execute(&workload).unwrap();
//! assert_eq!(serial.state_root, parallel.state_root);
//! ```

pub mod executor;

pub use executor::{ExecutionResult, Executor, HarnessError, ParallelExecutor, SerialExecutor};

use alloy_primitives::{hex, keccak256};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use speculative_executor::{
    ApplyError, Batch, Event, MemoryStore, Transaction, TransactionContext, TransactionHandler,
};
use std::collections::BTreeMap;
use tracing::trace;

// ============================================================================
// Integer-key Transaction Family
// ============================================================================

/// Family name the handler registers under.
pub const INTKEY_FAMILY: &str = "intkey";

/// Namespace every intkey address lives under.
pub const INTKEY_PREFIX: &str = "1cf126";

const MAX_NAME_LEN: usize = 20;

/// Operation carried by an intkey payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "inc")]
    Increment,
    #[serde(rename = "dec")]
    Decrement,
}

/// JSON payload of an intkey transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntkeyPayload {
    #[serde(rename = "Verb")]
    pub verb: Verb,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: u32,
}

impl IntkeyPayload {
    pub fn new(verb: Verb, name: impl Into<String>, value: u32) -> Self {
        Self {
            verb,
            name: name.into(),
            value,
        }
    }

    /// Parses and validates a payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, ApplyError> {
        let payload: IntkeyPayload = serde_json::from_slice(bytes)
            .map_err(|e| ApplyError::InvalidTransaction(format!("malformed payload: {e}")))?;
        if payload.name.len() > MAX_NAME_LEN {
            return Err(ApplyError::InvalidTransaction(format!(
                "name must be at most {MAX_NAME_LEN} characters"
            )));
        }
        Ok(payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Builds a transaction touching only this payload's key.
    pub fn into_transaction(self, id: impl Into<String>) -> Result<Transaction, serde_json::Error> {
        let address = intkey_address(&self.name);
        Ok(Transaction::new(id, vec![address.clone()], vec![address])
            .with_family(INTKEY_FAMILY)
            .with_payload(self.encode()?))
    }
}

/// State address of an intkey name: the family prefix followed by 64 hex
/// characters of the name's hash.
pub fn intkey_address(name: &str) -> String {
    let digest = hex::encode(keccak256(name.as_bytes()));
    format!("{INTKEY_PREFIX}{}", &digest[..64])
}

fn decode_value(bytes: &[u8]) -> Result<u32, ApplyError> {
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| ApplyError::Internal(format!("stored value has {} bytes", bytes.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Applies `set`, `inc` and `dec` to named u32 counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntkeyHandler;

impl IntkeyHandler {
    fn get(context: &TransactionContext<'_>, name: &str) -> Result<Option<u32>, ApplyError> {
        let address = intkey_address(name);
        match context.get_state(&[address])?.pop() {
            Some((_, Some(bytes))) => decode_value(&bytes).map(Some),
            _ => Ok(None),
        }
    }

    fn set(context: &TransactionContext<'_>, name: &str, value: u32) -> Result<(), ApplyError> {
        let mut entries = BTreeMap::new();
        entries.insert(intkey_address(name), value.to_be_bytes().to_vec());
        context.set_state(entries)
    }
}

impl TransactionHandler for IntkeyHandler {
    fn family_name(&self) -> &str {
        INTKEY_FAMILY
    }

    fn apply(&self, txn: &Transaction, context: &TransactionContext<'_>) -> Result<(), ApplyError> {
        let payload = IntkeyPayload::decode(&txn.payload)?;
        let current = Self::get(context, &payload.name)?;
        trace!(txn = %txn.id, verb = ?payload.verb, name = %payload.name, value = payload.value, "applying intkey");

        let updated = match (payload.verb, current) {
            (Verb::Set, Some(_)) => {
                return Err(ApplyError::InvalidTransaction(format!(
                    "{} already set",
                    payload.name
                )))
            }
            (Verb::Set, None) => payload.value,
            (Verb::Increment, Some(value)) => value.checked_add(payload.value).ok_or_else(|| {
                ApplyError::InvalidTransaction("value is too large to inc".to_string())
            })?,
            (Verb::Decrement, Some(value)) => value.checked_sub(payload.value).ok_or_else(|| {
                ApplyError::InvalidTransaction("value is too large to dec".to_string())
            })?,
            (Verb::Increment | Verb::Decrement, None) => {
                return Err(ApplyError::InvalidTransaction(format!(
                    "{} requires a set value",
                    if payload.verb == Verb::Increment { "inc" } else { "dec" }
                )))
            }
        };

        Self::set(context, &payload.name, updated)?;
        context.add_event(Event {
            event_type: "intkey/update".to_string(),
            attributes: vec![("name".to_string(), payload.name.clone())],
            data: updated.to_be_bytes().to_vec(),
        })
    }
}

// ============================================================================
// Workload Configuration & Generation
// ============================================================================

/// Configuration for workload generation.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Number of counters present in the initial state.
    pub num_keys: usize,
    /// Number of batches in the block.
    pub num_batches: usize,
    /// Transactions per batch.
    pub txns_per_batch: usize,
    /// Conflict factor: 0.0 = keys drawn from the whole set, 1.0 = all
    /// transactions touch the same two keys.
    pub conflict_factor: f64,
    /// Probability that a transaction is one the handler rejects.
    pub invalid_rate: f64,
    /// Random seed for reproducibility.
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_keys: 1000,
            num_batches: 25,
            txns_per_batch: 4,
            conflict_factor: 0.0,
            invalid_rate: 0.0,
            seed: 42,
        }
    }
}

/// Starting value of every counter.
const INITIAL_VALUE: u32 = 1_000_000;

/// A block of intkey batches and the state it runs against.
#[derive(Debug, Clone)]
pub struct Workload {
    /// Counter names present in the initial state.
    pub keys: Vec<String>,
    pub batches: Vec<Batch>,
    /// The configuration used to generate this workload.
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates a new workload from the given configuration.
    pub fn generate(config: WorkloadConfig) -> Result<Self, serde_json::Error> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let num_keys = config.num_keys.max(2);
        let keys: Vec<String> = (0..num_keys).map(|i| format!("key{i}")).collect();

        // Calculate "hot" key range for conflict simulation.
        let hot_key_count = if config.conflict_factor > 0.0 {
            (2.0 + (1.0 - config.conflict_factor) * (num_keys as f64 - 2.0)).max(2.0) as usize
        } else {
            num_keys
        };

        let batches = (0..config.num_batches)
            .map(|b| {
                let transactions = (0..config.txns_per_batch)
                    .map(|t| {
                        let use_hot = rng.gen::<f64>() < config.conflict_factor;
                        let range = if use_hot { hot_key_count } else { num_keys };
                        let name = keys[rng.gen_range(0..range)].clone();

                        let payload = if rng.gen::<f64>() < config.invalid_rate {
                            // Every key starts set, so this is always rejected.
                            IntkeyPayload::new(Verb::Set, name, 1)
                        } else if rng.gen_bool(0.5) {
                            IntkeyPayload::new(Verb::Increment, name, rng.gen_range(1..100))
                        } else {
                            IntkeyPayload::new(Verb::Decrement, name, rng.gen_range(1..100))
                        };
                        payload.into_transaction(Self::id(config.seed, "txn", b, t))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Batch::new(Self::id(config.seed, "batch", b, 0), transactions))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            keys,
            batches,
            config,
        })
    }

    fn id(seed: u64, kind: &str, batch: usize, txn: usize) -> String {
        let digest = keccak256(format!("{seed}/{kind}/{batch}/{txn}").as_bytes());
        hex::encode(&digest[..16])
    }

    /// Total number of transactions across all batches.
    pub fn num_transactions(&self) -> usize {
        self.batches.iter().map(|b| b.transactions.len()).sum()
    }

    /// Creates a store holding every counter at its initial value.
    pub fn create_store(&self) -> MemoryStore {
        MemoryStore::with_state(
            self.keys
                .iter()
                .map(|name| (intkey_address(name), INITIAL_VALUE.to_be_bytes().to_vec())),
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intkey_address() {
        let address = intkey_address("foo");
        assert_eq!(address.len(), 70);
        assert!(address.starts_with(INTKEY_PREFIX));
        assert_ne!(address, intkey_address("bar"));
    }

    #[test]
    fn test_payload_decoding() {
        let payload = IntkeyPayload::decode(br#"{"Verb":"inc","Name":"a","Value":3}"#).unwrap();
        assert_eq!(payload, IntkeyPayload::new(Verb::Increment, "a", 3));
        assert_eq!(IntkeyPayload::decode(&payload.encode().unwrap()).unwrap(), payload);

        assert!(matches!(
            IntkeyPayload::decode(br#"{"Verb":"mul","Name":"a","Value":3}"#),
            Err(ApplyError::InvalidTransaction(_))
        ));
        let long_name = IntkeyPayload::new(Verb::Set, "x".repeat(21), 1).encode().unwrap();
        assert!(matches!(
            IntkeyPayload::decode(&long_name),
            Err(ApplyError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_transaction_carries_encoded_payload() {
        let payload = IntkeyPayload::new(Verb::Decrement, "b", 9);
        let encoded = payload.encode().unwrap();
        let fields: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(fields, serde_json::json!({"Verb": "dec", "Name": "b", "Value": 9}));

        let txn = payload.into_transaction("t").unwrap();
        assert_eq!(txn.payload, encoded);
        assert_eq!(txn.inputs, vec![intkey_address("b")]);
    }

    #[test]
    fn test_workload_generation() {
        let config = WorkloadConfig {
            num_keys: 10,
            num_batches: 5,
            txns_per_batch: 3,
            conflict_factor: 0.0,
            invalid_rate: 0.0,
            seed: 123,
        };

        let workload = Workload::generate(config.clone()).unwrap();
        assert_eq!(workload.keys.len(), 10);
        assert_eq!(workload.num_transactions(), 15);

        // Same seed, same workload.
        let again = Workload::generate(config).unwrap();
        assert_eq!(workload.batches, again.batches);

        for txn in workload.batches.iter().flat_map(|b| &b.transactions) {
            assert_eq!(txn.family, INTKEY_FAMILY);
            assert_eq!(txn.inputs, txn.outputs);
            assert!(IntkeyPayload::decode(&txn.payload).is_ok());
        }
    }

    #[test]
    fn test_full_conflict_uses_two_keys() {
        let workload = Workload::generate(WorkloadConfig {
            num_keys: 100,
            num_batches: 10,
            txns_per_batch: 5,
            conflict_factor: 1.0,
            invalid_rate: 0.0,
            seed: 7,
        })
        .unwrap();
        let hot: std::collections::BTreeSet<&String> = workload
            .batches
            .iter()
            .flat_map(|b| &b.transactions)
            .map(|t| &t.outputs[0])
            .collect();
        assert!(hot.len() <= 2);
    }
}

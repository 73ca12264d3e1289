//! Background prefetch of context inputs.
//!
//! Two threads connected by channels: the reader stage performs point reads
//! against the store, the writer stage hands the values to the contexts that
//! asked for them. A shutdown message sent to the reader is forwarded to the
//! writer once everything before it has been read, so no fetched value is
//! dropped on the floor. Once the reader stops accepting requests they are
//! served inline by the caller instead.

use super::execution_context::{ExecutionContext, StoreRead};
use crate::store::StateStore;
use crate::types::{ContextId, StateRoot};
use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, trace, warn};

pub(crate) type Contexts = DashMap<ContextId, Arc<ExecutionContext>>;

/// Addresses of one context still to be read from the store.
#[derive(Debug)]
pub(crate) struct PrefetchRequest {
    pub context_id: ContextId,
    pub state_root: StateRoot,
    pub addresses: Vec<String>,
}

enum ReaderMessage {
    Fetch(PrefetchRequest),
    Shutdown,
}

enum WriterMessage {
    Resolved {
        context_id: ContextId,
        reads: Vec<(String, StoreRead)>,
    },
    Shutdown,
}

pub(crate) struct Pipeline {
    store: Arc<dyn StateStore>,
    contexts: Arc<Contexts>,
    reader_tx: Sender<ReaderMessage>,
    /// Cleared by the reader before its final drain. Held across every send
    /// so no request lands in the channel after that drain.
    accepting: Arc<Mutex<bool>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub(crate) fn spawn(store: Arc<dyn StateStore>, contexts: Arc<Contexts>) -> Self {
        let (reader_tx, reader_rx) = unbounded();
        let (writer_tx, writer_rx) = unbounded();

        let accepting = Arc::new(Mutex::new(true));

        let reader = {
            let store = Arc::clone(&store);
            let accepting = Arc::clone(&accepting);
            thread::spawn(move || reader_loop(store, reader_rx, writer_tx, accepting))
        };
        let writer = {
            let contexts = Arc::clone(&contexts);
            thread::spawn(move || writer_loop(contexts, writer_rx))
        };

        Self {
            store,
            contexts,
            reader_tx,
            accepting,
            handles: Mutex::new(vec![reader, writer]),
        }
    }

    /// Queues a request. After shutdown the request is served inline.
    pub(crate) fn prefetch(&self, request: PrefetchRequest) {
        let request = {
            let accepting = self.accepting.lock();
            if !*accepting {
                request
            } else {
                match self.reader_tx.send(ReaderMessage::Fetch(request)) {
                    Ok(()) => return,
                    Err(send_error) => match send_error.into_inner() {
                        ReaderMessage::Fetch(request) => request,
                        ReaderMessage::Shutdown => return,
                    },
                }
            }
        };
        let reads = fetch(self.store.as_ref(), &request);
        deliver(&self.contexts, request.context_id, reads);
    }

    pub(crate) fn stop(&self) {
        // Fails only if the reader is already gone.
        let _ = self.reader_tx.send(ReaderMessage::Shutdown);
    }

    pub(crate) fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("context pipeline thread panicked");
            }
        }
    }
}

/// Reads every requested address. A failed read is handed to the context,
/// which reports it to whoever reads the address.
fn fetch(store: &dyn StateStore, request: &PrefetchRequest) -> Vec<(String, StoreRead)> {
    request
        .addresses
        .iter()
        .map(|address| {
            let read = store.read(&request.state_root, address);
            if let Err(e) = &read {
                warn!(context = %request.context_id, address = %address, error = %e, "failed to read address from store");
            }
            (address.clone(), read)
        })
        .collect()
}

fn deliver(contexts: &Contexts, context_id: ContextId, reads: Vec<(String, StoreRead)>) {
    // Clone out of the map so no shard lock is held while resolving.
    let context = contexts.get(&context_id).map(|entry| Arc::clone(entry.value()));
    match context {
        Some(context) => context.set_from_store(reads),
        None => trace!(context = %context_id, "dropping prefetch for deleted context"),
    }
}

fn reader_loop(
    store: Arc<dyn StateStore>,
    requests: Receiver<ReaderMessage>,
    resolved: Sender<WriterMessage>,
    accepting: Arc<Mutex<bool>>,
) {
    for message in requests.iter() {
        match message {
            ReaderMessage::Fetch(request) => {
                let reads = fetch(store.as_ref(), &request);
                let message = WriterMessage::Resolved {
                    context_id: request.context_id,
                    reads,
                };
                if resolved.send(message).is_err() {
                    break;
                }
            }
            ReaderMessage::Shutdown => break,
        }
    }
    // Nothing is sent after this, so the drain below sees every request
    // that raced with the shutdown.
    *accepting.lock() = false;
    for message in requests.try_iter() {
        if let ReaderMessage::Fetch(request) = message {
            let reads = fetch(store.as_ref(), &request);
            let _ = resolved.send(WriterMessage::Resolved {
                context_id: request.context_id,
                reads,
            });
        }
    }
    let _ = resolved.send(WriterMessage::Shutdown);
}

fn writer_loop(contexts: Arc<Contexts>, resolved: Receiver<WriterMessage>) {
    for message in resolved.iter() {
        match message {
            WriterMessage::Resolved { context_id, reads } => {
                deliver(&contexts, context_id, reads)
            }
            WriterMessage::Shutdown => break,
        }
    }
}

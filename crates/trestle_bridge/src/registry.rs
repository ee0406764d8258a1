//! Call correlation registry.
//!
//! Maps each outstanding call id to its pending completion. Ids are
//! strictly increasing within a worker's lifetime and never reused while
//! pending. Settlement fires at most once per id; a second settlement is a
//! no-op.

use std::collections::HashMap;
use tokio::sync::oneshot;
use trestle_core::{BridgeError, BridgeResult, CallId};

/// Completion payload delivered to the awaiting caller
pub type CallOutcome = BridgeResult<Vec<u8>>;

/// Controller-side table of outstanding calls
#[derive(Debug)]
pub struct CallRegistry {
    next: u64,
    pending: HashMap<CallId, oneshot::Sender<CallOutcome>>,
}

impl CallRegistry {
    /// Create an empty registry; the first id issued is `call_1`
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate the next call id and register its completion sink
    pub fn register(&mut self) -> (CallId, oneshot::Receiver<CallOutcome>) {
        let id = CallId::from_raw(self.next);
        self.next += 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Drop a registration that never reached the worker (send failure)
    pub fn remove(&mut self, id: CallId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Settle a call with its result payload
    ///
    /// A no-op when no call is pending under `id` (already settled, or
    /// never existed).
    pub fn settle_result(&mut self, id: CallId, bytes: Vec<u8>) {
        if let Some(sink) = self.pending.remove(&id) {
            let _ = sink.send(Ok(bytes));
        }
    }

    /// Settle a call with a failure reason
    ///
    /// Returns `false` when no call is pending under `id`; the caller must
    /// then surface the error out of band rather than drop it.
    pub fn settle_error(&mut self, id: CallId, error: BridgeError) -> bool {
        match self.pending.remove(&id) {
            Some(sink) => {
                let _ = sink.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Force-settle every outstanding call (terminate path)
    ///
    /// Returns how many calls were rejected.
    pub fn fail_all(&mut self, error: &BridgeError) -> usize {
        let rejected = self.pending.len();
        for (_, sink) in self.pending.drain() {
            let _ = sink.send(Err(error.clone()));
        }
        rejected
    }

    /// Number of outstanding calls
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

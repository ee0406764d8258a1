//! The async worker handle.
//!
//! `WorkerHandle` is the controller's facade over one worker instance:
//! `init` drives the lifecycle handshake, `call` dispatches a named export
//! and returns an awaitable completion, `terminate` coarsely tears the
//! worker down. Dispatch never blocks; completion arrives through the event
//! pump, which is the single receive point over the worker's event stream.

use crate::registry::CallRegistry;
use crate::worker;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use trestle_core::{
    Argument, BridgeError, BridgeResult, Diagnostic, LogLevel, WorkerEvent, WorkerLifecycle,
    WorkerRequest,
};
use trestle_wasm::{marshal, ChannelTable, DEFAULT_MAX_RESULT_LEN};

/// Bridge configuration
#[derive(Clone)]
pub struct BridgeConfig {
    /// Pre-allocated length of each result channel in bytes
    pub initial_result_len: usize,
    /// Fixed ceiling of each result channel in bytes
    pub max_result_len: u64,
    /// Optional out-of-band sink for guest logs and unmatched errors
    diagnostics: Option<UnboundedSender<Diagnostic>>,
}

impl BridgeConfig {
    /// Create a config with a 64 KiB initial channel and a 1 GiB ceiling
    #[must_use]
    pub fn new() -> Self {
        Self {
            initial_result_len: 64 * 1024,
            max_result_len: DEFAULT_MAX_RESULT_LEN,
            diagnostics: None,
        }
    }

    /// Set the pre-allocated result channel length
    #[must_use]
    pub fn with_initial_result_len(mut self, len: usize) -> Self {
        self.initial_result_len = len;
        self
    }

    /// Set the result channel ceiling
    #[must_use]
    pub fn with_max_result_len(mut self, len: u64) -> Self {
        self.max_result_len = len;
        self
    }

    /// Attach an out-of-band diagnostic sink
    #[must_use]
    pub fn with_diagnostics(mut self, sink: UnboundedSender<Diagnostic>) -> Self {
        self.diagnostics = Some(sink);
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared {
    lifecycle: Mutex<WorkerLifecycle>,
    registry: Mutex<CallRegistry>,
    channels: ChannelTable,
    requests: Mutex<Option<UnboundedSender<WorkerRequest>>>,
    init_waiter: Mutex<Option<oneshot::Sender<BridgeResult<()>>>>,
    diagnostics: Option<UnboundedSender<Diagnostic>>,
    initial_result_len: usize,
    max_result_len: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Async handle over one worker instance
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    /// Spawn the worker's execution context for a compute module
    ///
    /// The module is not instantiated until [`init`](Self::init) is called.
    /// Must run inside a tokio runtime (the event pump is a spawned task).
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the worker thread cannot be spawned.
    pub fn spawn(module: Vec<u8>, config: BridgeConfig) -> BridgeResult<Self> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let channels = ChannelTable::new();

        let shared = Arc::new(Shared {
            lifecycle: Mutex::new(WorkerLifecycle::Uninitialized),
            registry: Mutex::new(CallRegistry::new()),
            channels: channels.clone(),
            requests: Mutex::new(Some(request_tx)),
            init_waiter: Mutex::new(None),
            diagnostics: config.diagnostics,
            initial_result_len: config.initial_result_len,
            max_result_len: config.max_result_len,
        });

        std::thread::Builder::new()
            .name("trestle-worker".to_string())
            .spawn(move || worker::run(module, request_rx, event_tx, channels))
            .map_err(|e| BridgeError::Internal {
                message: format!("failed to spawn worker thread: {}", e),
            })?;

        tokio::spawn(pump(event_rx, Arc::clone(&shared)));

        Ok(Self { shared })
    }

    /// Initialize the worker: instantiate the module and publish exports
    ///
    /// Idempotent success when already Ready; never re-instantiates.
    ///
    /// # Errors
    ///
    /// `Initialization` when instantiation fails (the worker stays
    /// Terminated) or when an init is already in flight; `Terminated` after
    /// shutdown.
    pub async fn init(&self) -> BridgeResult<()> {
        let proceed = lock(&self.shared.lifecycle).begin_init()?;
        if !proceed {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        *lock(&self.shared.init_waiter) = Some(tx);

        if let Err(error) = self.send(WorkerRequest::Init) {
            lock(&self.shared.init_waiter).take();
            lock(&self.shared.lifecycle).mark_terminated();
            return Err(error);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::Terminated),
        }
    }

    /// Dispatch a named export and await its completion
    ///
    /// Arguments are encoded locally, so every marshalling precondition
    /// fails here without contacting the worker. The returned bytes are the
    /// result channel's content at settlement.
    ///
    /// # Errors
    ///
    /// Fails fast outside Ready; otherwise any bridge error raised while
    /// the call was in flight, or `Terminated` if the worker is torn down
    /// before settlement.
    pub async fn call(&self, export: &str, args: &[Argument]) -> BridgeResult<Vec<u8>> {
        lock(&self.shared.lifecycle).ensure_ready()?;

        // marshalling errors are local; nothing crosses the boundary
        let parts = marshal::encode(args)?;

        let (id, rx) = lock(&self.shared.registry).register();
        self.shared.channels.create(
            id,
            self.shared.initial_result_len,
            self.shared.max_result_len,
        );

        let request = WorkerRequest::Call {
            id,
            export: export.to_string(),
            parts,
        };
        if let Err(error) = self.send(request) {
            lock(&self.shared.registry).remove(id);
            self.shared.channels.detach(id);
            return Err(error);
        }

        tracing::debug!(target: "trestle::bridge", %id, export, "dispatched");

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::Terminated),
        }
    }

    /// Tear the worker down
    ///
    /// Synchronously rejects every pending call with `Terminated`, discards
    /// all result channels, and closes the request channel so the worker
    /// thread drains out and drops the module instance. Coarse by design:
    /// this is the bridge's only cancellation primitive.
    pub fn terminate(&self) {
        lock(&self.shared.lifecycle).mark_terminated();

        if let Some(waiter) = lock(&self.shared.init_waiter).take() {
            let _ = waiter.send(Err(BridgeError::Terminated));
        }

        let rejected = lock(&self.shared.registry).fail_all(&BridgeError::Terminated);
        self.shared.channels.clear();
        lock(&self.shared.requests).take();

        if rejected > 0 {
            tracing::debug!(target: "trestle::bridge", rejected, "terminated with calls pending");
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn lifecycle(&self) -> WorkerLifecycle {
        *lock(&self.shared.lifecycle)
    }

    /// Number of calls awaiting settlement
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.registry).pending_count()
    }

    fn send(&self, request: WorkerRequest) -> BridgeResult<()> {
        let guard = lock(&self.shared.requests);
        let sender = guard.as_ref().ok_or(BridgeError::Terminated)?;
        sender.send(request).map_err(|_| BridgeError::Terminated)
    }
}

/// The single receive point over the worker's event stream
async fn pump(mut events: UnboundedReceiver<WorkerEvent>, shared: Arc<Shared>) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Ready => {
                let outcome = lock(&shared.lifecycle).mark_ready();
                if let Some(waiter) = lock(&shared.init_waiter).take() {
                    let _ = waiter.send(outcome);
                }
            }
            WorkerEvent::Log { level, message } => {
                forward_log(level, &message);
                if let Some(sink) = &shared.diagnostics {
                    let _ = sink.send(Diagnostic::Log { level, message });
                }
            }
            WorkerEvent::Result { id } => match shared.channels.detach(id) {
                Some(bytes) => lock(&shared.registry).settle_result(id, bytes),
                None => {
                    tracing::debug!(target: "trestle::bridge", %id, "result for a detached channel")
                }
            },
            WorkerEvent::Error { id: Some(id), error } => {
                shared.channels.detach(id);
                if !lock(&shared.registry).settle_error(id, error.clone()) {
                    surface_unmatched(&shared, error);
                }
            }
            WorkerEvent::Error { id: None, error } => {
                let waiter = lock(&shared.init_waiter).take();
                if let Some(waiter) = waiter {
                    // instantiation failure: the worker parks in Terminated
                    lock(&shared.lifecycle).mark_terminated();
                    let _ = waiter.send(Err(error));
                } else {
                    surface_unmatched(&shared, error);
                }
            }
        }
    }
}

fn forward_log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Error => tracing::error!(target: "trestle::guest", "{message}"),
        LogLevel::Warn => tracing::warn!(target: "trestle::guest", "{message}"),
        LogLevel::Info => tracing::info!(target: "trestle::guest", "{message}"),
        LogLevel::Debug => tracing::debug!(target: "trestle::guest", "{message}"),
        LogLevel::Trace => tracing::trace!(target: "trestle::guest", "{message}"),
    }
}

/// An error with no resolvable call id must still reach a sink
fn surface_unmatched(shared: &Shared, error: BridgeError) {
    tracing::error!(target: "trestle::bridge", %error, "unmatched worker error");
    if let Some(sink) = &shared.diagnostics {
        let _ = sink.send(Diagnostic::UnmatchedError { error });
    }
}

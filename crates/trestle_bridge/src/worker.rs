//! The worker's event loop.
//!
//! Runs on a dedicated thread so the wasmtime store never crosses an await
//! point. Requests are drained one at a time; no two invocations run
//! concurrently within one worker. The loop exits when the controller drops
//! the request sender, which tears down the instance.

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use trestle_core::{BridgeError, WorkerEvent, WorkerRequest};
use trestle_wasm::{ChannelTable, ComputeInstance};

pub(crate) fn run(
    module: Vec<u8>,
    mut requests: UnboundedReceiver<WorkerRequest>,
    events: UnboundedSender<WorkerEvent>,
    channels: ChannelTable,
) {
    let mut instance: Option<ComputeInstance> = None;

    while let Some(request) = requests.blocking_recv() {
        match request {
            WorkerRequest::Init => {
                if instance.is_some() {
                    // the lifecycle gate makes this unreachable; never
                    // re-instantiate regardless
                    let _ = events.send(WorkerEvent::Ready);
                    continue;
                }
                match ComputeInstance::instantiate(&module, channels.clone(), events.clone()) {
                    Ok(ready) => {
                        instance = Some(ready);
                        let _ = events.send(WorkerEvent::Ready);
                    }
                    Err(error) => {
                        tracing::error!(target: "trestle::worker", %error, "instantiation failed");
                        let _ = events.send(WorkerEvent::Error { id: None, error });
                        // instantiation failure is fatal to the worker
                        return;
                    }
                }
            }
            WorkerRequest::Call { id, export, parts } => {
                let Some(active) = instance.as_mut() else {
                    let _ = events.send(WorkerEvent::Error {
                        id: Some(id),
                        error: BridgeError::Initialization {
                            reason: "module not instantiated".to_string(),
                        },
                    });
                    continue;
                };
                tracing::debug!(target: "trestle::worker", %id, export = %export, "invoking export");
                if let Err(error) = active.invoke(id, &export, &parts) {
                    let _ = events.send(WorkerEvent::Error {
                        id: Some(id),
                        error,
                    });
                }
            }
        }
    }

    tracing::debug!(target: "trestle::worker", "request channel closed; worker loop exiting");
}

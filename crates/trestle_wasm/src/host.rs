//! Host import surface for the compute module.
//!
//! The module imports everything under the `host` namespace. All imports
//! take arena-relative addresses as 64-bit words and every one of them
//! bounds-checks `address + length` against the current memory size before
//! touching memory; a violation fails that import call (trapping the owning
//! export invocation) without corrupting arena or registry state.

use crate::channel::ChannelTable;
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use trestle_core::{BridgeError, BridgeResult, CallId, LogLevel, WorkerEvent};
use wasmtime::{Caller, Extern, Linker, Memory};

/// Per-instance state reachable from host imports
pub struct HostState {
    channels: ChannelTable,
    events: UnboundedSender<WorkerEvent>,
    epoch: Instant,
}

impl HostState {
    /// Create host state over the shared channel table and event stream
    #[must_use]
    pub fn new(channels: ChannelTable, events: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            channels,
            events,
            epoch: Instant::now(),
        }
    }
}

/// Register the `host` import namespace on a linker
///
/// # Errors
///
/// Returns `Initialization` if a definition cannot be registered.
pub fn add_to_linker(linker: &mut Linker<HostState>) -> BridgeResult<()> {
    linker
        .func_wrap(
            "host",
            "log_emit",
            |mut caller: Caller<'_, HostState>,
             level: i64,
             ptr: i64,
             len: i64|
             -> anyhow::Result<()> {
                let bytes = read_guest(&mut caller, ptr as u64, len as u64)?;
                let level = LogLevel::from_raw(level as u64)
                    .ok_or_else(|| anyhow::anyhow!("unknown log level {}", level))?;
                let message = String::from_utf8_lossy(&bytes).into_owned();
                match level {
                    LogLevel::Error => tracing::error!(target: "trestle::guest", "{message}"),
                    LogLevel::Warn => tracing::warn!(target: "trestle::guest", "{message}"),
                    LogLevel::Info => tracing::info!(target: "trestle::guest", "{message}"),
                    LogLevel::Debug => tracing::debug!(target: "trestle::guest", "{message}"),
                    LogLevel::Trace => tracing::trace!(target: "trestle::guest", "{message}"),
                }
                let _ = caller
                    .data()
                    .events
                    .send(WorkerEvent::Log { level, message });
                Ok(())
            },
        )
        .map_err(register_error)?;

    linker
        .func_wrap(
            "host",
            "mark",
            |mut caller: Caller<'_, HostState>, ptr: i64, len: i64| -> anyhow::Result<()> {
                let bytes = read_guest(&mut caller, ptr as u64, len as u64)?;
                let label = String::from_utf8_lossy(&bytes).into_owned();
                let elapsed_us = caller.data().epoch.elapsed().as_micros() as u64;
                tracing::info!(target: "trestle::mark", marker = %label, elapsed_us, "timing marker");
                let _ = caller.data().events.send(WorkerEvent::Log {
                    level: LogLevel::Info,
                    message: format!("[mark] {} at {}us", label, elapsed_us),
                });
                Ok(())
            },
        )
        .map_err(register_error)?;

    linker
        .func_wrap(
            "host",
            "random_fill",
            |mut caller: Caller<'_, HostState>, ptr: i64, len: i64| -> anyhow::Result<()> {
                let (address, length) = (ptr as u64, len as u64);
                let memory = guest_memory(&mut caller)?;
                check_bounds(&caller, memory, address, length)?;
                let mut buf = vec![0u8; length as usize];
                OsRng.fill_bytes(&mut buf);
                memory.write(&mut caller, address as usize, &buf)?;
                Ok(())
            },
        )
        .map_err(register_error)?;

    linker
        .func_wrap(
            "host",
            "result_write",
            |mut caller: Caller<'_, HostState>,
             id: i64,
             ptr: i64,
             len: i64|
             -> anyhow::Result<()> {
                let bytes = read_guest(&mut caller, ptr as u64, len as u64)?;
                let id = CallId::from_raw(id as u64);
                caller.data().channels.write(id, &bytes)?;
                let _ = caller.data().events.send(WorkerEvent::Result { id });
                Ok(())
            },
        )
        .map_err(register_error)?;

    Ok(())
}

fn register_error(err: anyhow::Error) -> BridgeError {
    BridgeError::Initialization {
        reason: format!("host import registration failed: {}", err),
    }
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> BridgeResult<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| BridgeError::Internal {
            message: "module exports no memory".to_string(),
        })
}

fn check_bounds(
    caller: &Caller<'_, HostState>,
    memory: Memory,
    address: u64,
    length: u64,
) -> BridgeResult<()> {
    let size = memory.data_size(caller) as u64;
    let end = address
        .checked_add(length)
        .ok_or(BridgeError::OutOfBoundsAccess {
            address,
            length,
            size,
        })?;
    if end > size {
        return Err(BridgeError::OutOfBoundsAccess {
            address,
            length,
            size,
        });
    }
    Ok(())
}

fn read_guest(
    caller: &mut Caller<'_, HostState>,
    address: u64,
    length: u64,
) -> BridgeResult<Vec<u8>> {
    let memory = guest_memory(caller)?;
    check_bounds(caller, memory, address, length)?;
    let size = memory.data_size(&*caller) as u64;
    let mut buf = vec![0u8; length as usize];
    memory
        .read(&mut *caller, address as usize, &mut buf)
        .map_err(|_| BridgeError::OutOfBoundsAccess {
            address,
            length,
            size,
        })?;
    Ok(buf)
}

//! Growable per-call result channels.
//!
//! A channel is created by the controller before dispatch and written by the
//! compute module's return primitive. The payload never travels through the
//! message protocol; the `Result` event carries only the call id and the
//! controller detaches the channel's bytes directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use trestle_core::{BridgeError, BridgeResult, CallId};

/// Default channel ceiling: 1 GiB, bounding worst-case memory commitment
pub const DEFAULT_MAX_RESULT_LEN: u64 = 1 << 30;

/// A growable byte buffer addressed by call id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultChannel {
    id: CallId,
    buf: Vec<u8>,
    len: usize,
    max_len: u64,
}

impl ResultChannel {
    /// Create a channel with a pre-allocated backing of `initial_len` bytes
    /// and a fixed ceiling of `max_len` bytes
    #[must_use]
    pub fn new(id: CallId, initial_len: usize, max_len: u64) -> Self {
        Self {
            id,
            buf: vec![0; initial_len],
            len: 0,
            max_len,
        }
    }

    /// The owning call id
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Bytes of the last successful write
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Length of the last successful write
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no result has been written yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The fixed ceiling
    #[must_use]
    pub fn max_len(&self) -> u64 {
        self.max_len
    }

    /// Replace the channel content with `bytes`
    ///
    /// Grows the backing if the payload exceeds the current length, bounded
    /// by the ceiling. Each write fully replaces prior content; there is no
    /// append.
    ///
    /// # Errors
    ///
    /// Returns `ResultBufferTooSmall` when the payload exceeds the ceiling;
    /// prior content and length are left unchanged.
    pub fn write(&mut self, bytes: &[u8]) -> BridgeResult<()> {
        let required = bytes.len() as u64;
        if required > self.max_len {
            return Err(BridgeError::ResultBufferTooSmall {
                required,
                max: self.max_len,
            });
        }
        if bytes.len() > self.buf.len() {
            self.buf.resize(bytes.len(), 0);
        }
        self.buf[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(())
    }

    /// Consume the channel, yielding the written bytes
    #[must_use]
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.buf.truncate(self.len);
        self.buf
    }
}

/// Result channels shared between controller and worker
///
/// The table is the only mutable state addressable from both sides; by
/// protocol convention each channel is written by at most one side at a
/// time (the controller creates it before dispatch, the worker writes it
/// only in response to that call id).
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    inner: Arc<Mutex<HashMap<CallId, ResultChannel>>>,
}

impl ChannelTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, ResultChannel>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a channel for `id` ahead of dispatch
    pub fn create(&self, id: CallId, initial_len: usize, max_len: u64) {
        self.lock()
            .insert(id, ResultChannel::new(id, initial_len, max_len));
    }

    /// Write a result payload into the channel for `id`
    ///
    /// # Errors
    ///
    /// Returns `UnknownResultChannel` when no channel is registered for
    /// `id`, or the channel's own write errors.
    pub fn write(&self, id: CallId, bytes: &[u8]) -> BridgeResult<()> {
        let mut table = self.lock();
        let channel = table
            .get_mut(&id)
            .ok_or(BridgeError::UnknownResultChannel { id })?;
        channel.write(bytes)
    }

    /// Remove the channel for `id` and yield its bytes
    pub fn detach(&self, id: CallId) -> Option<Vec<u8>> {
        self.lock().remove(&id).map(ResultChannel::into_bytes)
    }

    /// Drop every channel (terminate path)
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of live channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no channels are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

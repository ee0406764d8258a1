//! The controller/worker message protocol.
//!
//! Both directions are closed enums matched exhaustively at their single
//! receive point: the worker's event loop for requests, the controller's
//! pump for events. Result payloads never travel inside a message; the
//! `Result` event carries only the call id and the payload is read from the
//! channel's backing storage.

use crate::error::BridgeError;
use crate::id::CallId;
use serde::{Deserialize, Serialize};

/// Log severity for guest-emitted log traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Unrecoverable or erroneous guest condition
    Error,
    /// Suspicious but non-fatal condition
    Warn,
    /// Informational message
    Info,
    /// Debugging detail
    Debug,
    /// Fine-grained trace output
    Trace,
}

impl LogLevel {
    /// Decode a raw severity word from the import surface
    ///
    /// Returns `None` for an unknown level; the import surface treats that
    /// as a hard error.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Error),
            1 => Some(Self::Warn),
            2 => Some(Self::Info),
            3 => Some(Self::Debug),
            4 => Some(Self::Trace),
            _ => None,
        }
    }

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// One marshalled piece of an argument
///
/// Scalars arrive as ready words; variable-length payloads arrive as bytes
/// plus the alignment and the count word to emit after the pointer. The
/// worker assigns addresses when it commits payloads into the arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgPart {
    /// A ready machine word
    Word(u64),
    /// A payload awaiting an arena address
    Payload {
        /// The encoded payload bytes
        bytes: Vec<u8>,
        /// Required arena alignment, a power of two
        align: u64,
        /// The length word paired with the pointer (byte length for
        /// text/bytes, element count for sequences)
        count: u64,
    },
}

/// Controller-to-worker requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Instantiate the compute module and publish its exports
    Init,
    /// Invoke a named export with pre-encoded arguments
    Call {
        /// Correlation id, also the result channel key
        id: CallId,
        /// Name of the export to invoke
        export: String,
        /// Encoded argument parts in call order
        parts: Vec<ArgPart>,
    },
}

/// Worker-to-controller events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerEvent {
    /// Instantiation succeeded; the worker now accepts calls
    Ready,
    /// Guest log traffic, not tied to any call id
    Log {
        /// Severity reported by the guest
        level: LogLevel,
        /// Decoded message text
        message: String,
    },
    /// The result channel for `id` has been populated
    Result {
        /// The settled call
        id: CallId,
    },
    /// A worker-detected failure
    Error {
        /// Rejects this call when present; out-of-band diagnostic when
        /// absent
        id: Option<CallId>,
        /// The typed failure reason
        error: BridgeError,
    },
}

/// Out-of-band diagnostics surfaced to the controller's sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Diagnostic {
    /// A guest log line
    Log {
        /// Severity reported by the guest
        level: LogLevel,
        /// Decoded message text
        message: String,
    },
    /// An error that matched no pending call
    UnmatchedError {
        /// The orphaned failure
        error: BridgeError,
    },
}

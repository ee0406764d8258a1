//! TRESTLE Core Types
//!
//! This crate contains pure types and logic with no I/O: call identifiers,
//! the typed argument union, the controller/worker message protocol, the
//! worker lifecycle state machine, and the bridge error taxonomy.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod argument;
pub mod error;
pub mod id;
pub mod lifecycle;
pub mod message;

// Re-exports
pub use argument::{Argument, ScalarValue};
pub use error::{BridgeError, BridgeResult};
pub use id::CallId;
pub use lifecycle::WorkerLifecycle;
pub use message::{ArgPart, Diagnostic, LogLevel, WorkerEvent, WorkerRequest};

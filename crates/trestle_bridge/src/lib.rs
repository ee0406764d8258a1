//! TRESTLE Bridge Controller
//!
//! The controller side of the call bridge: the correlation registry that
//! matches responses to outstanding calls, the worker thread that drives the
//! compute module, and the async `WorkerHandle` facade over both.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handle;
pub mod registry;
mod worker;

pub use handle::{BridgeConfig, WorkerHandle};
pub use registry::CallRegistry;

//! TRESTLE WASM Bridge
//!
//! The compute-module-facing half of the bridge: the memory arena that backs
//! argument writes into guest linear memory, the argument marshaller, the
//! growable per-call result channels, the host import surface, and module
//! instantiation with allocator-strategy probing.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod channel;
pub mod host;
pub mod instance;
pub mod marshal;

pub use arena::{ArenaBacking, BumpArena, PAGE_SIZE};
pub use channel::{ChannelTable, ResultChannel, DEFAULT_MAX_RESULT_LEN};
pub use host::HostState;
pub use instance::{AllocStrategy, ComputeInstance};
pub use marshal::{commit_with, encode};

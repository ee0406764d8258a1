//! Worker lifecycle state machine.
//!
//! Transitions: Uninitialized → Initializing → Ready, with Initializing →
//! Terminated on instantiation failure and Ready → Terminated on shutdown.
//! Terminated is absorbing. No call may be dispatched outside Ready.

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerLifecycle {
    /// No init requested yet
    Uninitialized,
    /// Init requested; instantiation in flight
    Initializing,
    /// Module instantiated; calls accepted
    Ready,
    /// Shut down; absorbing
    Terminated,
}

impl WorkerLifecycle {
    /// Attempt the Uninitialized → Initializing transition
    ///
    /// Returns `Ok(true)` when instantiation should proceed and `Ok(false)`
    /// when the worker is already Ready (idempotent success; the module must
    /// not be re-instantiated).
    ///
    /// # Errors
    ///
    /// Fails while an init is already in flight, or after termination.
    pub fn begin_init(&mut self) -> BridgeResult<bool> {
        match self {
            Self::Uninitialized => {
                *self = Self::Initializing;
                Ok(true)
            }
            Self::Ready => Ok(false),
            Self::Initializing => Err(BridgeError::Initialization {
                reason: "initialization already in flight".to_string(),
            }),
            Self::Terminated => Err(BridgeError::Terminated),
        }
    }

    /// Complete initialization: Initializing → Ready
    ///
    /// # Errors
    ///
    /// Fails if the worker was terminated while the init was in flight, or
    /// if no init was in flight.
    pub fn mark_ready(&mut self) -> BridgeResult<()> {
        match self {
            Self::Initializing => {
                *self = Self::Ready;
                Ok(())
            }
            Self::Terminated => Err(BridgeError::Terminated),
            state => Err(BridgeError::Internal {
                message: format!("ready signal in state {:?}", state),
            }),
        }
    }

    /// Enter the absorbing Terminated state
    pub fn mark_terminated(&mut self) {
        *self = Self::Terminated;
    }

    /// Gate for call dispatch
    ///
    /// # Errors
    ///
    /// `Terminated` after shutdown; `Initialization` before the module is
    /// instantiated.
    pub fn ensure_ready(&self) -> BridgeResult<()> {
        match self {
            Self::Ready => Ok(()),
            Self::Terminated => Err(BridgeError::Terminated),
            Self::Uninitialized | Self::Initializing => Err(BridgeError::Initialization {
                reason: "module not instantiated".to_string(),
            }),
        }
    }

    /// Whether the worker accepts calls
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether the worker has shut down
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

//! Bridge error taxonomy for TRESTLE.
//!
//! One closed enum covers every failure mode of the call bridge. The enum
//! is serializable so worker-detected errors cross the message boundary as
//! typed values rather than flattened strings.

use crate::id::CallId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bridge result type
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeError {
    /// Compute module failed to instantiate; fatal to the worker
    Initialization {
        /// Why instantiation failed
        reason: String,
    },

    /// Named function not present in the module's export table
    UnknownExport {
        /// The missing export name
        export: String,
    },

    /// Argument kind has no marshalling rule
    UnsupportedArgumentKind {
        /// Description of the offending kind
        kind: String,
    },

    /// Argument not exactly representable as a 64-bit machine word
    ArgumentRange {
        /// Textual rendering of the offending value
        value: String,
    },

    /// Arena cannot satisfy an allocation without overflowing the
    /// address space
    AllocationOverflow {
        /// Requested allocation size in bytes
        requested: u64,
    },

    /// Result payload exceeds the channel's maximum length
    ResultBufferTooSmall {
        /// Bytes the payload requires
        required: u64,
        /// The channel's fixed ceiling
        max: u64,
    },

    /// No result channel registered for the call id
    UnknownResultChannel {
        /// The unresolvable call id
        id: CallId,
    },

    /// A host import referenced memory outside current bounds
    OutOfBoundsAccess {
        /// Start address of the access
        address: u64,
        /// Length of the access
        length: u64,
        /// Current memory size in bytes
        size: u64,
    },

    /// Worker was shut down; all pending calls reject with this reason
    Terminated,

    /// Unexpected failure inside the worker (e.g. a guest trap)
    Internal {
        /// Error message
        message: String,
    },
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization { reason } => write!(f, "initialization failed: {}", reason),
            Self::UnknownExport { export } => write!(f, "export {} not found", export),
            Self::UnsupportedArgumentKind { kind } => {
                write!(f, "unsupported argument kind: {}", kind)
            }
            Self::ArgumentRange { value } => {
                write!(f, "argument {} not representable as a 64-bit word", value)
            }
            Self::AllocationOverflow { requested } => {
                write!(f, "allocation of {} bytes overflows the arena", requested)
            }
            Self::ResultBufferTooSmall { required, max } => {
                write!(
                    f,
                    "result of {} bytes exceeds channel maximum of {} bytes",
                    required, max
                )
            }
            Self::UnknownResultChannel { id } => {
                write!(f, "no result channel for {}", id)
            }
            Self::OutOfBoundsAccess {
                address,
                length,
                size,
            } => write!(
                f,
                "access of {} bytes at 0x{:X} exceeds memory size {}",
                length, address, size
            ),
            Self::Terminated => write!(f, "worker terminated"),
            Self::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

impl std::error::Error for BridgeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_export_display() {
        let err = BridgeError::UnknownExport {
            export: "prove".to_string(),
        };
        assert_eq!(format!("{}", err), "export prove not found");
    }

    #[test]
    fn test_terminated_display() {
        assert_eq!(format!("{}", BridgeError::Terminated), "worker terminated");
    }

    #[test]
    fn test_result_buffer_display() {
        let err = BridgeError::ResultBufferTooSmall {
            required: 2048,
            max: 1024,
        };
        let s = format!("{}", err);
        assert!(s.contains("2048"));
        assert!(s.contains("1024"));
    }

    #[test]
    fn test_out_of_bounds_display() {
        let err = BridgeError::OutOfBoundsAccess {
            address: 0x1000,
            length: 64,
            size: 4096,
        };
        let s = format!("{}", err);
        assert!(s.contains("0x1000"));
        assert!(s.contains("64"));
    }

    #[test]
    fn test_error_equality() {
        let err1 = BridgeError::Terminated;
        let err2 = BridgeError::Terminated;
        assert_eq!(err1, err2);

        let err3 = BridgeError::Initialization {
            reason: "no memory export".to_string(),
        };
        assert_ne!(err1, err3);
    }

    #[test]
    fn test_error_round_trips_as_json() {
        let err = BridgeError::UnknownResultChannel {
            id: CallId::from_raw(3),
        };
        let encoded = serde_json::to_string(&err).unwrap();
        let decoded: BridgeError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(err, decoded);
    }
}

//! Argument marshalling in two phases.
//!
//! Phase one (`encode`) runs controller-side and is pure: it applies the
//! kind mapping and the exact 64-bit widening, so every marshalling
//! precondition fails before a message is sent and no partial write can
//! occur. Phase two (`commit_with`) runs worker-side: payload parts are
//! placed into the arena and collapse into pointer/length word pairs.
//!
//! Placement is not referentially transparent: every call allocates fresh
//! arena space, so addresses are not stable across calls.

use trestle_core::{ArgPart, Argument, BridgeResult};

const WORD_BYTES: usize = 8;

/// Alignment for raw byte payloads (text and byte sequences)
const BYTE_ALIGN: u64 = 1;
/// Alignment for widened word sequences
const WORD_ALIGN: u64 = 8;

/// Encode arguments into marshalled parts
///
/// Mapping: scalars become single ready words; text and byte sequences
/// become byte payloads whose count word is the byte length; numeric
/// sequences are widened element-wise to little-endian 64-bit words and
/// their count word is the element count.
///
/// # Errors
///
/// Returns `ArgumentRange` when a scalar cannot widen exactly. Nothing is
/// written anywhere on failure.
pub fn encode(args: &[Argument]) -> BridgeResult<Vec<ArgPart>> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Argument::Scalar(scalar) => parts.push(ArgPart::Word(scalar.widen()?)),
            Argument::Text(text) => parts.push(ArgPart::Payload {
                bytes: text.as_bytes().to_vec(),
                align: BYTE_ALIGN,
                count: text.len() as u64,
            }),
            Argument::Bytes(bytes) => parts.push(ArgPart::Payload {
                bytes: bytes.clone(),
                align: BYTE_ALIGN,
                count: bytes.len() as u64,
            }),
            Argument::Sequence(elements) => {
                let mut bytes = Vec::with_capacity(elements.len() * WORD_BYTES);
                for element in elements {
                    bytes.extend_from_slice(&element.widen()?.to_le_bytes());
                }
                parts.push(ArgPart::Payload {
                    bytes,
                    align: WORD_ALIGN,
                    count: elements.len() as u64,
                });
            }
        }
    }
    Ok(parts)
}

/// Collapse marshalled parts into the machine words passed to the export
///
/// `place` allocates arena space for one payload, writes it, and returns
/// its address; each payload becomes a `[pointer, count]` pair and ready
/// words pass through unchanged.
///
/// # Errors
///
/// Propagates placement failures (allocation overflow, bounds violations).
pub fn commit_with<F>(parts: &[ArgPart], mut place: F) -> BridgeResult<Vec<u64>>
where
    F: FnMut(&[u8], u64) -> BridgeResult<u64>,
{
    let mut words = Vec::with_capacity(parts.len() * 2);
    for part in parts {
        match part {
            ArgPart::Word(word) => words.push(*word),
            ArgPart::Payload {
                bytes,
                align,
                count,
            } => {
                let pointer = place(bytes, *align)?;
                words.push(pointer);
                words.push(*count);
            }
        }
    }
    Ok(words)
}

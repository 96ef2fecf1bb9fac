//! Pure wire-protocol codecs for the fleetgate ingestion backend
//!
//! Each codec is a total function over byte slices: `decode` turns a buffer
//! into a typed frame (or a reason it cannot), `encode` turns a response
//! into bytes. No codec performs I/O or keeps state; connection handling
//! and persistence live in `fleetgate-engine` and `fleetgate-server`.

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap
)]

pub mod avl;
pub mod concox;
pub mod crc;
pub mod firmware;
pub mod meiligao;
pub mod satellite;
pub mod wialon;

use thiserror::Error;

/// Why a buffer could not be decoded into a frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame does not start with the protocol's magic bytes
    #[error("bad magic bytes")]
    BadMagic,

    /// Declared length is impossible for this protocol
    #[error("declared length {length} out of bounds")]
    BadLength {
        /// The declared length
        length: usize,
    },

    /// Checksum or CRC mismatch
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    BadChecksum {
        /// Checksum computed over the received bytes
        expected: u16,
        /// Checksum carried by the frame
        actual: u16,
    },

    /// Buffer ends before the frame does
    #[error("truncated frame")]
    Truncated,

    /// First byte / protocol number is not one this codec understands
    #[error("unsupported message type {tag:#04x}")]
    UnknownTag {
        /// The unrecognized tag byte
        tag: u8,
    },

    /// A field could not be parsed
    #[error("malformed field: {0}")]
    Field(String),
}

/// Result of feeding a buffer to a stream codec
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome<T> {
    /// A complete frame was decoded; `consumed` bytes can be dropped
    /// from the front of the buffer
    Frame {
        /// The decoded frame
        frame: T,
        /// Bytes of the buffer the frame occupied
        consumed: usize,
    },
    /// The buffer holds a prefix of a valid frame; read more bytes
    NeedMore,
    /// The buffer does not hold a valid frame; the caller should drop
    /// the data (and usually the connection's read buffer with it)
    Invalid(DecodeError),
}

impl<T> FrameOutcome<T> {
    /// Map the frame type, keeping `NeedMore`/`Invalid` as they are
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FrameOutcome<U> {
        match self {
            Self::Frame { frame, consumed } => FrameOutcome::Frame {
                frame: f(frame),
                consumed,
            },
            Self::NeedMore => FrameOutcome::NeedMore,
            Self::Invalid(e) => FrameOutcome::Invalid(e),
        }
    }
}

/// Decode packed BCD, skipping 0xF filler nibbles.
///
/// Vendor identity fields (Concox IMEI, Meiligao device id) are packed
/// two decimal digits per byte with 0xF padding.
pub(crate) fn decode_bcd(bytes: &[u8]) -> Result<u64, DecodeError> {
    let mut value: u64 = 0;
    for &byte in bytes {
        for nibble in [byte >> 4, byte & 0x0F] {
            match nibble {
                0..=9 => value = value * 10 + u64::from(nibble),
                0xF => {}
                _ => {
                    return Err(DecodeError::Field(format!(
                        "non-decimal BCD nibble {nibble:#x}"
                    )));
                }
            }
        }
    }
    Ok(value)
}

/// Little-endian read helpers over a cursor position.
///
/// All the binary codecs walk buffers the same way; these keep the
/// bounds checks in one place.
pub(crate) mod cursor {
    use super::DecodeError;

    pub(crate) struct Cursor<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Cursor<'a> {
        pub(crate) const fn new(buf: &'a [u8]) -> Self {
            Self { buf, pos: 0 }
        }

        pub(crate) const fn position(&self) -> usize {
            self.pos
        }

        pub(crate) const fn remaining(&self) -> usize {
            self.buf.len() - self.pos
        }

        pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
            if self.remaining() < n {
                return Err(DecodeError::Truncated);
            }
            let slice = &self.buf[self.pos..self.pos + n];
            self.pos += n;
            Ok(slice)
        }

        pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
            Ok(self.take(1)?[0])
        }

        pub(crate) fn u16_le(&mut self) -> Result<u16, DecodeError> {
            let b = self.take(2)?;
            Ok(u16::from_le_bytes([b[0], b[1]]))
        }

        pub(crate) fn u16_be(&mut self) -> Result<u16, DecodeError> {
            let b = self.take(2)?;
            Ok(u16::from_be_bytes([b[0], b[1]]))
        }

        pub(crate) fn u32_le(&mut self) -> Result<u32, DecodeError> {
            let b = self.take(4)?;
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        pub(crate) fn u32_be(&mut self) -> Result<u32, DecodeError> {
            let b = self.take(4)?;
            Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        }

        pub(crate) fn i32_le(&mut self) -> Result<i32, DecodeError> {
            Ok(self.u32_le()? as i32)
        }

        pub(crate) fn u64_le(&mut self) -> Result<u64, DecodeError> {
            let b = self.take(8)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(b);
            Ok(u64::from_le_bytes(arr))
        }

        pub(crate) fn f32_le(&mut self) -> Result<f32, DecodeError> {
            let b = self.take(4)?;
            Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }
    }
}

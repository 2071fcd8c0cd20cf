//! Error types for wire-level decoding.

use std::fmt;

/// Errors that can occur while decoding container primitives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input buffer ended before the expected data.
    UnexpectedEof { context: &'static str },
    /// Invalid data format or structure.
    InvalidFormat {
        context: &'static str,
        detail: String,
    },
    /// A chunk whose declared length is impossible.
    InvalidChunkSize { magic: [u8; 4], length: u32 },
    /// Index does not fit the chosen width.
    IndexOutOfRange { index: u32, max: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof { context } => {
                write!(f, "unexpected end of buffer in {context}")
            }
            Self::InvalidFormat { context, detail } => {
                write!(f, "invalid format in {context}: {detail}")
            }
            Self::InvalidChunkSize { magic, length } => {
                write!(
                    f,
                    "invalid chunk size {length} for {}",
                    String::from_utf8_lossy(magic)
                )
            }
            Self::IndexOutOfRange { index, max } => {
                write!(f, "index {index} does not fit below the width limit {max}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Result type for wire-level decoding operations.
pub type DecodeResult<T> = Result<T, DecodeError>;

//! The errors.

use std::io;

use thiserror::Error;

/// Error returned by buffer-list operations.
///
/// I/O failures keep their OS error code (see [`BufError::errno`]); bad input
/// data is reported separately so callers can tell a failed resource
/// operation from a corrupted payload.
#[derive(Debug, Error)]
pub enum BufError {
    /// A file or descriptor operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Base64 input could not be decoded.
    ///
    /// Carries a hex dump of the offending bytes for diagnostics.
    #[error("malformed base64 input:\n{dump}")]
    Malformed { dump: String },
    /// A sub-range exceeded its parent view.
    #[error("subslice out of range: offset {offset} + length {length} > {available}")]
    OutOfRange {
        offset: usize,
        length: usize,
        available: usize,
    },
}

impl BufError {
    /// The raw OS error code, if this error wraps one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

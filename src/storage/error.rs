//! # Storage Errors
//!
//! Operations return `eyre::Result`. Failures a caller is expected to react to
//! are raised as a `StorageError` inside the report, so they can be told apart
//! with `report.downcast_ref::<StorageError>()`:
//!
//! - `OutOfMemory`: the backing file could not grow, the window limit was
//!   reached, or no window could be mapped after evicting every candidate.
//! - `InvalidHandle`: the handle does not name a Used arena.
//! - `CorruptWindow`: a window that should hold data has a bad signature.
//! - `PayloadTooLarge` / `EmptyPayload`: rejected before any mutation.
//!
//! Everything else (I/O context, chain invariant violations) stays a plain
//! `eyre` report with context attached.

use super::ObjectHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    OutOfMemory { requested: usize, reason: String },
    InvalidHandle { handle: ObjectHandle },
    CorruptWindow { window: u32, signature: u32 },
    PayloadTooLarge { len: usize, max: usize },
    EmptyPayload,
}

impl StorageError {
    pub fn out_of_memory(requested: usize, reason: impl Into<String>) -> Self {
        StorageError::OutOfMemory {
            requested,
            reason: reason.into(),
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, StorageError::OutOfMemory { .. })
    }

    pub fn is_invalid_handle(&self) -> bool {
        matches!(self, StorageError::InvalidHandle { .. })
    }

    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            StorageError::PayloadTooLarge { .. } | StorageError::EmptyPayload
        )
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::OutOfMemory { requested, reason } => {
                write!(f, "out of memory allocating {} bytes: {}", requested, reason)
            }
            StorageError::InvalidHandle { handle } => {
                write!(f, "invalid handle {}: no used arena at that offset", handle)
            }
            StorageError::CorruptWindow { window, signature } => write!(
                f,
                "window {} is corrupt: bad signature {:#010x}",
                window, signature
            ),
            StorageError::PayloadTooLarge { len, max } => write!(
                f,
                "payload of {} bytes exceeds the largest storable payload of {} bytes",
                len, max
            ),
            StorageError::EmptyPayload => write!(f, "payload must not be empty"),
        }
    }
}

impl std::error::Error for StorageError {}

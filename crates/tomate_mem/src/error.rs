// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// Failures surfaced by memory managers, blocks and the data store.
///
/// Invariant violations (refcount underflow, overlapping free runs created at
/// runtime) are not represented here: they indicate a program bug and abort
/// the process after logging.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The manager cannot satisfy an allocation or resize request.
    #[error("out of memory: {requested} bytes requested")]
    OutOfMemory {
        /// Payload bytes the caller asked for.
        requested: usize,
    },

    /// The operation targeted a default handle, a released block, or a block
    /// whose manager no longer exists.
    #[error("block is disposed or default")]
    Disposed,

    /// A zero or otherwise unrepresentable size was requested.
    #[error("invalid size: {0}")]
    InvalidSize(&'static str),

    /// A data-store lookup with a handle whose slot was released or reused.
    #[error("stale handle: slot generation does not match")]
    StaleHandle,

    /// A data-store lookup with a handle of the wrong type.
    #[error("type mismatch: slot holds tag {actual:#010x}, handle expects {expected:#010x}")]
    TypeMismatch {
        /// Tag derived from the handle's type parameter.
        expected: u32,
        /// Tag stored in the slot.
        actual: u32,
    },

    /// The data store cannot grow any further.
    #[error("data store is full")]
    StoreFull,

    /// A memory-mapped file failed validation at open time.
    #[error("memory-mapped file is corrupt: {0}")]
    MmfCorrupt(&'static str),

    /// An operating-system failure while creating, opening or mapping a
    /// memory-mapped file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A failure propagated from the synchronization primitives.
    #[error(transparent)]
    Sync(#[from] tomate_sync::Error),
}

/// A specialized `Result` for memory operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(Error: Send, Sync);
    }

    #[test]
    fn type_mismatch_reports_both_tags() {
        let message = Error::TypeMismatch {
            expected: 0xAB,
            actual: 0xCD,
        }
        .to_string();

        assert!(message.contains("0x000000ab"));
        assert!(message.contains("0x000000cd"));
    }
}

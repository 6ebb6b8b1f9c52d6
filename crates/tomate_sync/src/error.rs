// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// Failures surfaced by the synchronization primitives.
///
/// Deadline expiry is deliberately not represented here: operations that wait
/// report it through a success flag and leave all observable state unchanged.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A small lock's waiter queue was full at enqueue time. The caller was
    /// not enqueued; retrying later is safe.
    #[error("lock queue is full; concurrency limit exceeded")]
    ConcurrencyExceeded,

    /// A lock release was attempted by a caller that does not hold the lock.
    #[error("lock held by {holder:#018x} but released by {caller:#018x}")]
    BadHolder {
        /// Full lock id of the actual holder (0 when the lock is free).
        holder: u64,
        /// Full lock id of the caller.
        caller: u64,
    },

    /// The caller-provided span cannot hold the primitive's state.
    #[error("invalid span for lock state: {0}")]
    InvalidSpan(&'static str),

    /// No process provider is registered under the given id.
    #[error("no process provider registered under id {0}")]
    UnknownProvider(i32),
}

/// A specialized `Result` for synchronization operations.
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
    fn bad_holder_reports_both_identities() {
        let message = Error::BadHolder { holder: 1, caller: 2 }.to_string();

        assert!(message.contains("0x0000000000000001"));
        assert!(message.contains("0x0000000000000002"));
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::{BurnWait, current_thread_id};

/// A 4-byte field granting thread-exclusive ownership via compare-and-swap.
///
/// The field holds the id of the owning thread (0 = free). The type is
/// `#[repr(transparent)]` over an `AtomicU32`, so it can be embedded at a
/// fixed offset inside a shared structure. For ownership that must be unique
/// across processes, use
/// [`CrossProcessExclusiveControl`][crate::CrossProcessExclusiveControl].
///
/// # Reentrancy
///
/// Not reentrant: a thread that already owns the control and calls
/// [`take`][Self::take] without a deadline spins forever. Callers that cannot
/// rule out recursive acquisition must use [`try_take`][Self::try_take] or
/// pass a deadline.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct ExclusiveAccessControl {
    owner: AtomicU32,
}

impl ExclusiveAccessControl {
    /// Creates a free control.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(0),
        }
    }

    /// Attempts to take ownership without waiting.
    pub fn try_take(&self) -> bool {
        self.owner
            .compare_exchange(0, current_thread_id(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Takes ownership, retrying until `max_wait` elapses (forever for `None`).
    ///
    /// Returns whether ownership was acquired. A false return leaves the
    /// control untouched.
    pub fn take(&self, max_wait: Option<Duration>) -> bool {
        if self.try_take() {
            return true;
        }

        let burn = BurnWait::new(max_wait);
        loop {
            if !burn.wait() {
                return false;
            }
            if self.try_take() {
                return true;
            }
        }
    }

    /// Releases ownership. Returns whether the caller was actually the owner;
    /// a foreign or free control is left untouched.
    pub fn release(&self) -> bool {
        self.owner
            .compare_exchange(current_thread_id(), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether any thread currently owns the control.
    #[must_use]
    pub fn is_taken(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// The owning thread id, or 0 when free.
    #[must_use]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(ExclusiveAccessControl: Send, Sync);
    }

    #[test]
    fn take_and_release() {
        let control = ExclusiveAccessControl::new();

        assert!(!control.is_taken());
        assert!(control.try_take());
        assert_eq!(control.owner(), current_thread_id());

        // A second take on the same thread must not succeed; the control is
        // not reentrant.
        assert!(!control.try_take());

        assert!(control.release());
        assert!(!control.is_taken());

        // Releasing a free control reports that we were not the owner.
        assert!(!control.release());
    }

    #[test]
    fn release_by_non_owner_is_rejected() {
        let control = ExclusiveAccessControl::new();
        assert!(control.take(None));

        thread::scope(|scope| {
            scope.spawn(|| {
                assert!(!control.release());
            });
        });

        assert!(control.is_taken());
        assert!(control.release());
    }

    #[test]
    fn take_times_out_while_contended() {
        let control = ExclusiveAccessControl::new();
        assert!(control.take(None));

        thread::scope(|scope| {
            scope.spawn(|| {
                assert!(!control.take(Some(Duration::from_millis(5))));
            });
        });

        assert!(control.release());
    }

    #[test]
    fn contended_take_eventually_wins() {
        let control = ExclusiveAccessControl::new();
        assert!(control.take(None));

        thread::scope(|scope| {
            let waiter = scope.spawn(|| control.take(Some(Duration::from_secs(10))));

            thread::sleep(Duration::from_millis(2));
            assert!(control.release());

            assert!(waiter.join().expect("waiter panicked"));
            assert!(control.is_taken());
            // The waiter owns it now; our release must be rejected.
            assert!(!control.release());
        });
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::{BurnWait, ProcessProvider, current_thread_id, full_lock_id};

/// An 8-byte field granting exclusive ownership across processes.
///
/// Same shape as [`ExclusiveAccessControl`][crate::ExclusiveAccessControl],
/// but the identity is the full lock id `(process_id << 32) | thread_id`, so
/// the field can be embedded in a memory-mapped file and contended by
/// unrelated processes. The process id comes from the supplied
/// [`ProcessProvider`], which keeps the identity mockable in tests.
///
/// Not reentrant; see the single-process variant for the contract.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct CrossProcessExclusiveControl {
    owner: AtomicU64,
}

impl CrossProcessExclusiveControl {
    /// Creates a free control.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
        }
    }

    /// Attempts to take ownership without waiting.
    pub fn try_take(&self, provider: &dyn ProcessProvider) -> bool {
        let identity = full_lock_id(provider, current_thread_id());

        self.owner
            .compare_exchange(0, identity, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Takes ownership, retrying until `max_wait` elapses (forever for `None`).
    ///
    /// Returns whether ownership was acquired.
    pub fn take(&self, provider: &dyn ProcessProvider, max_wait: Option<Duration>) -> bool {
        if self.try_take(provider) {
            return true;
        }

        let burn = BurnWait::new(max_wait);
        loop {
            if !burn.wait() {
                return false;
            }
            if self.try_take(provider) {
                return true;
            }
        }
    }

    /// Releases ownership. Returns whether the caller was actually the owner.
    pub fn release(&self, provider: &dyn ProcessProvider) -> bool {
        let identity = full_lock_id(provider, current_thread_id());

        self.owner
            .compare_exchange(identity, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The full lock id of the owner, or 0 when free.
    #[must_use]
    pub fn holder(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::{BurnWait, ProcessProvider, current_thread_id};

/// An 8-byte control granting many readers XOR one writer.
///
/// The state is two 32-bit fields: `locked_by` (an exclusive-owner identity
/// derived from process id and thread id; 0 = unlocked) and `shared_users`
/// (the count of active readers). The type is `#[repr(C)]` with no padding,
/// so it can be embedded at a fixed offset in a memory-mapped file and
/// contended by unrelated processes.
///
/// There is no fairness guarantee in either direction: readers and the writer
/// race on CPU-relaxed spins. Callers that need FIFO ordering use
/// [`SmallLock`][crate::SmallLock] instead.
///
/// # Reentrancy
///
/// Not reentrant. Calling [`enter_exclusive`][Self::enter_exclusive] while
/// already holding the control exclusively deadlocks (the identity CAS never
/// succeeds against ourselves); pass a deadline where that cannot be ruled
/// out. The control must not be held across operations that may block
/// indefinitely.
#[derive(Debug, Default)]
#[repr(C)]
pub struct AccessControl {
    locked_by: AtomicU32,
    shared_users: AtomicU32,
}

/// Exclusive-owner identity: process id folded with the thread id, forced
/// nonzero because 0 means unlocked.
fn exclusive_identity(provider: &dyn ProcessProvider) -> u32 {
    let identity = provider.current_process_id() ^ current_thread_id();

    if identity == 0 { u32::MAX } else { identity }
}

impl AccessControl {
    /// Creates an unlocked control.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked_by: AtomicU32::new(0),
            shared_users: AtomicU32::new(0),
        }
    }

    /// Enters shared mode, retrying until `max_wait` elapses (forever for
    /// `None`). Returns whether shared mode was entered.
    ///
    /// Every successful call must be paired with [`exit_shared`][Self::exit_shared].
    pub fn enter_shared(&self, max_wait: Option<Duration>) -> bool {
        let burn = BurnWait::new(max_wait);

        loop {
            while self.locked_by.load(Ordering::Acquire) != 0 {
                if !burn.wait() {
                    return false;
                }
            }

            self.shared_users.fetch_add(1, Ordering::AcqRel);

            // An exclusive acquirer may have raced in between the check above
            // and our increment; back out and retry if so.
            if self.locked_by.load(Ordering::Acquire) == 0 {
                return true;
            }

            self.shared_users.fetch_sub(1, Ordering::AcqRel);

            if !burn.wait() {
                return false;
            }
        }
    }

    /// Exits shared mode.
    pub fn exit_shared(&self) {
        let previous = self.shared_users.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous != 0, "exit_shared without a matching enter_shared");
    }

    /// Enters exclusive mode: wins the `locked_by` CAS, then waits out
    /// residual readers. Returns whether exclusive mode was entered; on
    /// deadline expiry the CAS is rolled back and the state is unchanged.
    ///
    /// Every successful call must be paired with
    /// [`exit_exclusive`][Self::exit_exclusive].
    pub fn enter_exclusive(&self, provider: &dyn ProcessProvider, max_wait: Option<Duration>) -> bool {
        let identity = exclusive_identity(provider);
        let burn = BurnWait::new(max_wait);

        loop {
            if self
                .locked_by
                .compare_exchange(0, identity, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            if !burn.wait() {
                return false;
            }
        }

        while self.shared_users.load(Ordering::Acquire) != 0 {
            if !burn.wait() {
                self.locked_by.store(0, Ordering::Release);
                return false;
            }
        }

        true
    }

    /// Exits exclusive mode.
    pub fn exit_exclusive(&self) {
        self.locked_by.store(0, Ordering::Release);
    }

    /// Attempts to promote a shared hold to exclusive.
    ///
    /// The caller must hold shared mode. Losing the `locked_by` race fails
    /// immediately; winning it waits (up to `max_wait`) for the other readers
    /// to drain, then converts the caller's shared registration into the
    /// exclusive hold. On failure the caller still holds shared mode and must
    /// exit with [`exit_shared`][Self::exit_shared]; on success it must exit
    /// with [`exit_exclusive`][Self::exit_exclusive]. Pass
    /// `Some(Duration::ZERO)` for a pure try that only succeeds when the
    /// caller is already the sole reader.
    pub fn try_promote(&self, provider: &dyn ProcessProvider, max_wait: Option<Duration>) -> bool {
        let identity = exclusive_identity(provider);

        if self
            .locked_by
            .compare_exchange(0, identity, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let burn = BurnWait::new(max_wait);
        while self.shared_users.load(Ordering::Acquire) != 1 {
            if !burn.wait() {
                self.locked_by.store(0, Ordering::Release);
                return false;
            }
        }

        // Sole remaining reader is the caller; its shared registration
        // becomes the exclusive hold.
        self.shared_users.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Releases exclusive mode without re-entering shared mode.
    ///
    /// The symmetric counterpart of [`try_promote`][Self::try_promote];
    /// equivalent to [`exit_exclusive`][Self::exit_exclusive]. A caller that
    /// wants to continue reading re-enters shared mode afterwards.
    pub fn demote(&self) {
        self.locked_by.store(0, Ordering::Release);
    }

    /// The current exclusive-owner identity, or 0 when not exclusively held.
    #[must_use]
    pub fn locked_by(&self) -> u32 {
        self.locked_by.load(Ordering::Acquire)
    }

    /// The current count of readers.
    #[must_use]
    pub fn shared_users(&self) -> u32 {
        self.shared_users.load(Ordering::Acquire)
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Spin-based synchronization primitives whose entire state lives in a
//! fixed-size region of memory, with the most important types being:
//!
//! * [`ProcessProvider`] - reports the caller's process id and whether a given
//!   process is still alive. Implementations are addressed through a
//!   process-wide integer-id registry, so structures embedded in shared
//!   memory can name "which provider to ask" without storing a host pointer.
//! * [`AccessControl`] - an 8-byte many-readers-or-one-writer control with
//!   promote and demote, suitable for embedding in a memory-mapped file.
//! * [`SmallLock`] - a fixed-capacity, FIFO-fair, reentrant lock whose state
//!   is placed in a caller-provided span and which recovers from the death of
//!   the process holding it.
//!
//! Supporting types: [`BurnWait`] (deadline-bounded busy-wait),
//! [`ExclusiveAccessControl`] (4-byte thread-exclusive ownership) and
//! [`CrossProcessExclusiveControl`] (8-byte process+thread ownership).
//!
//! # Waiting model
//!
//! Every blocking operation busy-waits with a single CPU-relaxing pause per
//! iteration and honors an optional deadline measured on the monotonic clock.
//! Deadline expiry is the only cancellation mechanism: operations report it
//! through a success flag and leave all observable state unchanged. None of
//! the primitives use OS wait queues, so critical sections must stay short.

mod access_control;
mod burn_wait;
mod cross_process;
mod error;
mod exclusive;
mod process;
mod small_lock;

pub use access_control::AccessControl;
pub use burn_wait::BurnWait;
pub use cross_process::CrossProcessExclusiveControl;
pub use error::{Error, Result};
pub use exclusive::ExclusiveAccessControl;
pub use process::{
    NATIVE_PROVIDER_ID, NativeProcessProvider, ProcessProvider, current_thread_id, full_lock_id,
    process_provider, register_process_provider,
};
pub use small_lock::{EnterStatus, MAX_CAPACITY, SMALL_LOCK_HEADER_LEN, SmallLock};

#[cfg(any(feature = "fakes", test))]
mod fake_process_provider;

#[cfg(any(feature = "fakes", test))]
pub use fake_process_provider::FakeProcessProvider;

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// Reports the identity and liveness of processes.
///
/// Synchronization state that lives in shared memory must be able to tell
/// whether the process that owns it is still running, e.g. to recover a lock
/// whose holder crashed. This trait is the seam through which that question is
/// asked, so tests can substitute an implementation that impersonates other
/// processes (see `FakeProcessProvider` behind the `fakes` feature).
///
/// Implementations are addressed through the process-wide registry
/// ([`register_process_provider`] / [`process_provider`]): shared memory
/// stores the small integer id, never a pointer to the implementation, so the
/// same bytes remain meaningful in every process mapping them.
pub trait ProcessProvider: Send + Sync + Debug {
    /// The id of the calling process as observed by this provider.
    fn current_process_id(&self) -> u32;

    /// Whether the process with the given id is currently alive.
    fn is_process_alive(&self, pid: u32) -> bool;
}

/// The [`ProcessProvider`] backed by the operating system.
#[derive(Debug, Default)]
pub struct NativeProcessProvider;

impl ProcessProvider for NativeProcessProvider {
    fn current_process_id(&self) -> u32 {
        std::process::id()
    }

    fn is_process_alive(&self, pid: u32) -> bool {
        // Signal 0 performs permission and existence checks without delivering
        // anything. EPERM still proves the pid exists.
        // SAFETY: kill() with signal 0 only validates the target pid.
        let rc = unsafe { libc::kill(pid.cast_signed(), 0) };

        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// Registry id of the always-available [`NativeProcessProvider`].
pub const NATIVE_PROVIDER_ID: i32 = 0;

static REGISTRY: Lazy<RwLock<Vec<Arc<dyn ProcessProvider>>>> = Lazy::new(|| {
    let native: Arc<dyn ProcessProvider> = Arc::new(NativeProcessProvider);
    RwLock::new(vec![native])
});

/// Adds a provider to the process-wide registry and returns its id.
///
/// Ids are never reused within a process. Id [`NATIVE_PROVIDER_ID`] is always
/// the native provider.
pub fn register_process_provider(provider: Arc<dyn ProcessProvider>) -> i32 {
    let mut registry = REGISTRY.write().expect("process provider registry poisoned");

    registry.push(provider);

    i32::try_from(registry.len() - 1).expect("more than i32::MAX providers registered")
}

/// Resolves a registry id to its provider, or `None` for an unknown id.
#[must_use]
pub fn process_provider(id: i32) -> Option<Arc<dyn ProcessProvider>> {
    let registry = REGISTRY.read().expect("process provider registry poisoned");

    usize::try_from(id).ok().and_then(|index| registry.get(index).cloned())
}

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// A process-unique nonzero id for the calling thread.
///
/// Assigned from a process-wide counter on first use and stable for the
/// thread's lifetime. This is the identity stored in the single-process
/// [`ExclusiveAccessControl`][crate::ExclusiveAccessControl] and the default
/// lock id of [`SmallLock`][crate::SmallLock] acquisitions.
#[must_use]
pub fn current_thread_id() -> u32 {
    THREAD_ID.with(|id| *id)
}

/// Packs a process id and a lock id into a 64-bit full lock id.
///
/// The result is unique per concurrent acquirer across all processes sharing
/// a lock, which is what the [`SmallLock`][crate::SmallLock] queue and the
/// [`CrossProcessExclusiveControl`][crate::CrossProcessExclusiveControl]
/// identity field store.
#[must_use]
pub fn full_lock_id(provider: &dyn ProcessProvider, lock_id: u32) -> u64 {
    (u64::from(provider.current_process_id()) << 32) | u64::from(lock_id)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn native_provider_sees_self_alive() {
        let provider = NativeProcessProvider;

        assert_eq!(provider.current_process_id(), std::process::id());
        assert!(provider.is_process_alive(std::process::id()));
    }

    #[test]
    fn registry_resolves_registered_provider() {
        let id = register_process_provider(Arc::new(NativeProcessProvider));

        assert!(id > 0);
        assert!(process_provider(id).is_some());
        assert!(process_provider(NATIVE_PROVIDER_ID).is_some());
        assert!(process_provider(-1).is_none());
    }

    #[test]
    fn thread_ids_are_stable_and_distinct() {
        let mine = current_thread_id();
        assert_ne!(mine, 0);
        assert_eq!(mine, current_thread_id());

        let theirs = thread::spawn(current_thread_id).join().expect("thread panicked");
        assert_ne!(mine, theirs);
    }

    #[test]
    fn full_lock_id_packs_pid_and_lock_id() {
        let provider = NativeProcessProvider;

        let id = full_lock_id(&provider, 7);

        assert_eq!(id >> 32, u64::from(std::process::id()));
        assert_eq!(id & 0xFFFF_FFFF, 7);
    }
}

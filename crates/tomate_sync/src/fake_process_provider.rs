// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::ProcessProvider;

thread_local! {
    static PID_OVERRIDE: Cell<Option<u32>> = const { Cell::new(None) };
}

/// A [`ProcessProvider`] for tests, with a configurable set of live processes
/// and a thread-local override of the reported process id.
///
/// The override lets a single test thread impersonate several processes, so
/// cross-process interleavings over shared state can be driven from one test
/// without actually forking.
#[derive(Debug)]
pub struct FakeProcessProvider {
    default_pid: u32,
    live: Mutex<HashSet<u32>>,
}

impl FakeProcessProvider {
    /// Creates a provider reporting `default_pid` and considering only
    /// `default_pid` alive.
    #[must_use]
    pub fn new(default_pid: u32) -> Self {
        Self {
            default_pid,
            live: Mutex::new(HashSet::from([default_pid])),
        }
    }

    /// Marks a process as alive.
    pub fn add_live_process(&self, pid: u32) {
        self.live.lock().expect("live process set poisoned").insert(pid);
    }

    /// Marks a process as dead.
    pub fn kill_process(&self, pid: u32) {
        self.live.lock().expect("live process set poisoned").remove(&pid);
    }

    /// Runs `f` with the calling thread reporting `pid` as its process id.
    ///
    /// The override nests and is restored when `f` returns, even on panic.
    pub fn with_current_pid<R>(pid: u32, f: impl FnOnce() -> R) -> R {
        struct Restore(Option<u32>);

        impl Drop for Restore {
            fn drop(&mut self) {
                PID_OVERRIDE.with(|cell| cell.set(self.0));
            }
        }

        let _restore = Restore(PID_OVERRIDE.with(|cell| cell.replace(Some(pid))));

        f()
    }
}

impl ProcessProvider for FakeProcessProvider {
    fn current_process_id(&self) -> u32 {
        PID_OVERRIDE.with(Cell::get).unwrap_or(self.default_pid)
    }

    fn is_process_alive(&self, pid: u32) -> bool {
        self.live.lock().expect("live process set poisoned").contains(&pid)
    }
}

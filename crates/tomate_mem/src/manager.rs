// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};

use once_cell::sync::Lazy;

use crate::{MemoryBlock, Result, UnmanagedDataStore};

/// Allocates, resizes, reference-counts and frees variable-size memory
/// blocks.
///
/// Two backends exist: [`HeapMemoryManager`][crate::HeapMemoryManager] over
/// the process heap and [`MmfMemoryManager`][crate::MmfMemoryManager] over a
/// memory-mapped file shareable across processes. Both hand out
/// [`MemoryBlock`] handles whose payload is aligned to at least 16 bytes and
/// whose length is rounded up to a backend-defined bucket.
///
/// Managers are constructed as `Arc`s and register themselves in a
/// process-wide registry under a small integer id; block handles carry that
/// id instead of a pointer, so they stay plain data and can detect a manager
/// that has since been dropped. A manager must outlive every block it
/// produced.
pub trait MemoryManager: Send + Sync + Debug {
    /// Allocates a block with `len` bytes of payload, refcount 1.
    fn allocate(&self, len: usize) -> Result<MemoryBlock>;

    /// Resizes a block, returning the handle to use from now on.
    ///
    /// Shrinks and growable extents resize in place (same handle); otherwise
    /// a new block is allocated, `min(old, new)` payload bytes are copied
    /// and one reference on the old block is released. On failure the old
    /// block is left valid.
    fn resize(&self, block: MemoryBlock, new_len: usize) -> Result<MemoryBlock>;

    /// Returns a block's memory to the free-space structure.
    ///
    /// Invoked by the last [`release`][MemoryBlock::release]; not meant to be
    /// called directly while references remain.
    fn free(&self, block: MemoryBlock);

    /// The data store tied to this manager's lifetime and memory.
    fn store(&self) -> &UnmanagedDataStore;

    /// This manager's registry id.
    fn manager_id(&self) -> u32;
}

static NEXT_MANAGER_ID: AtomicU32 = AtomicU32::new(1);

static REGISTRY: Lazy<RwLock<HashMap<u32, Weak<dyn MemoryManager>>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Reserves a fresh, never-reused manager id.
pub(crate) fn reserve_manager_id() -> u32 {
    NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn register_manager(id: u32, manager: Weak<dyn MemoryManager>) {
    REGISTRY
        .write()
        .expect("memory manager registry poisoned")
        .insert(id, manager);
}

pub(crate) fn deregister_manager(id: u32) {
    REGISTRY.write().expect("memory manager registry poisoned").remove(&id);
}

/// Resolves a manager id to the live manager, or `None` once it was dropped.
#[must_use]
pub fn manager(id: u32) -> Option<Arc<dyn MemoryManager>> {
    REGISTRY
        .read()
        .expect("memory manager registry poisoned")
        .get(&id)
        .and_then(Weak::upgrade)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapMemoryManager;

    #[test]
    fn ids_are_unique() {
        let first = reserve_manager_id();
        let second = reserve_manager_id();

        assert_ne!(first, second);
    }

    #[test]
    fn registry_drops_with_the_manager() {
        let heap = HeapMemoryManager::new();
        let id = heap.manager_id();

        assert!(manager(id).is_some());

        drop(heap);
        assert!(manager(id).is_none());
    }
}

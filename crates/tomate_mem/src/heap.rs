// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use tomate_sync::ExclusiveAccessControl;
use tracing::debug;

use crate::block::round_up_16;
use crate::manager::{deregister_manager, register_manager, reserve_manager_id};
use crate::{BlockHeader, Error, MemoryBlock, MemoryManager, Result, UnmanagedDataStore};

/// Payload size of the smallest class.
const CLASS_MIN: usize = 32;

/// Number of power-of-two classes: 32 bytes up to 64 KiB.
const CLASS_COUNT: usize = 12;

/// Class marker for allocations served directly by the OS allocator.
const CLASS_OVERSIZE: u16 = u16::MAX;

/// Minimum arena chunk carved from the OS allocator for a size class.
const ARENA_CHUNK: usize = 64 * 1024;

const fn payload_size_of(class: u16) -> usize {
    CLASS_MIN << class
}

/// Smallest class whose payload size covers `len`, or `None` for oversize.
fn class_for(len: usize) -> Option<u16> {
    (0..CLASS_COUNT as u16).find(|&class| payload_size_of(class) >= len)
}

struct ClassState {
    /// Intrusive LIFO of freed blocks; the next pointer lives in the first
    /// word of each freed block's payload. Null when empty.
    free_head: *mut BlockHeader,
    /// Un-carved remainder of the newest arena.
    carve_next: *mut u8,
    carve_remaining: usize,
    arenas: Vec<(NonNull<u8>, Layout)>,
}

/// One size class: a free list plus carve state, guarded by its own
/// exclusive access control so different classes proceed in parallel.
struct SizeClass {
    guard: ExclusiveAccessControl,
    state: UnsafeCell<ClassState>,
}

// SAFETY: `state` is only touched while `guard` is held (or under `&mut` in
// Drop); the guard serializes all mutation.
unsafe impl Sync for SizeClass {}

// SAFETY: See the Sync impl; the raw pointers target memory owned by the
// containing manager.
unsafe impl Send for SizeClass {}

impl SizeClass {
    fn new() -> Self {
        Self {
            guard: ExclusiveAccessControl::new(),
            state: UnsafeCell::new(ClassState {
                free_head: std::ptr::null_mut(),
                carve_next: std::ptr::null_mut(),
                carve_remaining: 0,
                arenas: Vec::new(),
            }),
        }
    }

    /// Runs `f` on the class state under the class guard.
    fn locked<R>(&self, f: impl FnOnce(&mut ClassState) -> R) -> R {
        let taken = self.guard.take(None);
        debug_assert!(taken, "class guard take cannot time out without a deadline");

        // SAFETY: The guard is held, so we are the only accessor.
        let result = f(unsafe { &mut *self.state.get() });

        let released = self.guard.release();
        debug_assert!(released, "class guard released by its taker");
        result
    }
}

/// The default [`MemoryManager`]: size-class segregated free lists over the
/// process heap.
///
/// Payload classes are powers of two from 32 bytes to 64 KiB; each class
/// keeps an intrusive free list guarded by its own
/// [`ExclusiveAccessControl`], so threads operating on different classes
/// never contend. Arenas are carved from the OS allocator in chunks of at
/// least 64 KiB. Requests above the largest class go straight to the OS
/// allocator and return there on free.
///
/// All payloads are aligned to 16 bytes.
///
/// # Lifetime
///
/// The manager must outlive every block it produced. Dropping it returns all
/// arenas to the OS wholesale; oversize blocks still held by callers at that
/// point are leaked.
pub struct HeapMemoryManager {
    id: u32,
    classes: [SizeClass; CLASS_COUNT],
    store: UnmanagedDataStore,
}

impl fmt::Debug for HeapMemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapMemoryManager").field("id", &self.id).finish_non_exhaustive()
    }
}

static GLOBAL: Lazy<Arc<HeapMemoryManager>> = Lazy::new(HeapMemoryManager::new);

impl HeapMemoryManager {
    /// Creates a manager and registers it in the process-wide registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let id = reserve_manager_id();
        let manager = Arc::new(Self {
            id,
            classes: std::array::from_fn(|_| SizeClass::new()),
            store: UnmanagedDataStore::new(id),
        });

        let weak: Weak<dyn MemoryManager> = Arc::downgrade(&(Arc::clone(&manager) as Arc<dyn MemoryManager>));
        register_manager(id, weak);
        debug!(id, "heap memory manager created");

        manager
    }

    /// The process-wide instance, used wherever no explicit manager is
    /// supplied.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    fn allocate_in_class(&self, class: u16, len: usize) -> Result<MemoryBlock> {
        let stride = BlockHeader::LEN + payload_size_of(class);

        let header_ptr = self.classes[class as usize].locked(|state| {
            if !state.free_head.is_null() {
                let header = state.free_head;
                // SAFETY: Freed blocks store the next free header in the
                // first payload word; header is a live arena block.
                state.free_head = unsafe { (*header).payload().cast::<*mut BlockHeader>().read() };
                return Ok(header);
            }

            if state.carve_remaining < stride {
                let chunk = ARENA_CHUNK.max(stride);
                let layout =
                    Layout::from_size_align(chunk, 16).map_err(|_| Error::OutOfMemory { requested: len })?;
                // SAFETY: The layout has nonzero size.
                let raw = unsafe { alloc::alloc(layout) };
                let Some(arena) = NonNull::new(raw) else {
                    return Err(Error::OutOfMemory { requested: len });
                };
                state.arenas.push((arena, layout));
                state.carve_next = raw;
                state.carve_remaining = chunk;
            }

            let raw = state.carve_next;
            // SAFETY: The remainder check above guarantees stride bytes are
            // left in the arena.
            state.carve_next = unsafe { raw.add(stride) };
            state.carve_remaining -= stride;
            Ok(raw.cast::<BlockHeader>())
        })?;

        // SAFETY: Arena blocks are 16-aligned and live for the manager's
        // lifetime.
        let header = unsafe { &*header_ptr };
        header.initialize(class, len);

        Ok(MemoryBlock::from_raw(NonNull::from(header), self.id))
    }

    fn allocate_oversize(&self, len: usize) -> Result<MemoryBlock> {
        let total = BlockHeader::LEN + round_up_16(len);
        let layout = Layout::from_size_align(total, 16).map_err(|_| Error::OutOfMemory { requested: len })?;

        // SAFETY: The layout has nonzero size.
        let raw = unsafe { alloc::alloc(layout) };
        let Some(header_ptr) = NonNull::new(raw.cast::<BlockHeader>()) else {
            return Err(Error::OutOfMemory { requested: len });
        };

        // SAFETY: Freshly allocated, 16-aligned, large enough for the header.
        let header = unsafe { header_ptr.as_ref() };
        header.initialize(CLASS_OVERSIZE, len);

        Ok(MemoryBlock::from_raw(header_ptr, self.id))
    }

    /// Validates that a handle is a live block of this manager.
    fn live_header<'s>(&self, block: &'s MemoryBlock) -> Result<&'s BlockHeader> {
        if block.manager_id() != self.id {
            return Err(Error::Disposed);
        }
        let header_ptr = block.header_ptr().ok_or(Error::Disposed)?;
        // SAFETY: Blocks of this manager point into memory we keep alive.
        let header = unsafe { header_ptr.as_ref() };
        if header.refcount() == 0 {
            return Err(Error::Disposed);
        }

        Ok(header)
    }
}

impl MemoryManager for HeapMemoryManager {
    fn allocate(&self, len: usize) -> Result<MemoryBlock> {
        if len == 0 {
            return Err(Error::InvalidSize("cannot allocate an empty block"));
        }

        match class_for(len) {
            Some(class) => self.allocate_in_class(class, len),
            None => self.allocate_oversize(len),
        }
    }

    fn resize(&self, block: MemoryBlock, new_len: usize) -> Result<MemoryBlock> {
        if new_len == 0 {
            return Err(Error::InvalidSize("cannot resize a block to zero length"));
        }

        let header = self.live_header(&block)?;
        let class = header.class();

        // In place whenever the backing extent already covers the new
        // length: same class, or an oversize extent of unchanged capacity.
        let in_place = if class == CLASS_OVERSIZE {
            round_up_16(new_len) == header.capacity()
        } else {
            class_for(new_len) == Some(class)
        };
        if in_place {
            header.set_payload_len(new_len);
            return Ok(block);
        }

        let new_block = self.allocate(new_len)?;
        let copy_len = header.payload_len().min(new_len);
        // SAFETY: Source and destination are distinct live blocks, both at
        // least copy_len long.
        unsafe {
            std::ptr::copy_nonoverlapping(header.payload().as_ptr(), new_block.segment().as_ptr().as_ptr(), copy_len);
        }

        let mut old = block;
        old.release()?;

        Ok(new_block)
    }

    fn free(&self, block: MemoryBlock) {
        let Some(header_ptr) = block.header_ptr() else {
            return;
        };
        // SAFETY: Blocks of this manager point into memory we keep alive.
        let header = unsafe { header_ptr.as_ref() };
        let class = header.class();
        header.clear_allocated();

        if class == CLASS_OVERSIZE {
            let total = BlockHeader::LEN + header.capacity();
            let layout = Layout::from_size_align(total, 16).expect("layout was valid at allocation time");
            // SAFETY: Allocated by allocate_oversize with this exact layout;
            // the last reference is gone.
            unsafe { alloc::dealloc(header_ptr.as_ptr().cast(), layout) };
            return;
        }

        self.classes[class as usize].locked(|state| {
            // SAFETY: The block is ours and free; its payload now stores the
            // free-list link.
            unsafe {
                header.payload().cast::<*mut BlockHeader>().write(state.free_head);
            }
            state.free_head = header_ptr.as_ptr();
        });
    }

    fn store(&self) -> &UnmanagedDataStore {
        &self.store
    }

    fn manager_id(&self) -> u32 {
        self.id
    }
}

impl Drop for HeapMemoryManager {
    fn drop(&mut self) {
        deregister_manager(self.id);

        for class in &mut self.classes {
            let state = class.state.get_mut();
            for (arena, layout) in state.arenas.drain(..) {
                // SAFETY: Allocated with this exact layout; the manager
                // outlives its blocks by contract, so nothing uses them now.
                unsafe { alloc::dealloc(arena.as_ptr(), layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(HeapMemoryManager: Send, Sync);
    }

    #[test]
    fn class_selection_covers_the_range() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(32), Some(0));
        assert_eq!(class_for(33), Some(1));
        assert_eq!(class_for(64 * 1024), Some(11));
        assert_eq!(class_for(64 * 1024 + 1), None);
    }

    #[test]
    fn allocates_aligned_disjoint_blocks() {
        let heap = HeapMemoryManager::new();

        let blocks: Vec<_> = (0..8).map(|_| heap.allocate(100).expect("small allocation")).collect();

        for block in &blocks {
            assert_eq!(block.refcount(), 1);
            assert_eq!(block.payload_len(), 100);
            assert_eq!(block.segment().as_ptr().as_ptr() as usize % 16, 0);
        }

        // No two payloads overlap.
        let mut ranges: Vec<_> = blocks
            .iter()
            .map(|b| {
                let start = b.segment().as_ptr().as_ptr() as usize;
                (start, start + b.payload_len())
            })
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "payloads overlap");
        }

        for mut block in blocks {
            assert!(block.release().expect("live block"));
            assert!(block.is_disposed());
        }
    }

    #[test]
    fn refcount_lifecycle() {
        let heap = HeapMemoryManager::new();
        let mut block = heap.allocate(64).expect("small allocation");

        assert_eq!(block.add_ref().expect("live block"), 2);
        assert!(!block.release().expect("live block"));
        assert_eq!(block.refcount(), 1);

        assert!(block.release().expect("live block"));
        assert!(block.is_disposed());
        assert!(matches!(block.add_ref(), Err(Error::Disposed)));
        assert!(matches!(block.release(), Err(Error::Disposed)));
    }

    #[test]
    fn free_list_round_trips_memory() {
        let heap = HeapMemoryManager::new();

        let mut first = heap.allocate(48).expect("small allocation");
        let address = first.segment().as_ptr().as_ptr() as usize;
        assert!(first.release().expect("live block"));

        // Same class allocation reuses the freed block (LIFO free list).
        let mut second = heap.allocate(40).expect("small allocation");
        assert_eq!(second.segment().as_ptr().as_ptr() as usize, address);
        assert!(second.release().expect("live block"));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let heap = HeapMemoryManager::new();

        assert!(matches!(heap.allocate(0), Err(Error::InvalidSize(_))));

        let block = heap.allocate(16).expect("small allocation");
        assert!(matches!(block.resize(0), Err(Error::InvalidSize(_))));

        let mut block = block;
        assert!(block.release().expect("block survives failed resize"));
    }

    #[test]
    fn resize_in_place_within_class() {
        let heap = HeapMemoryManager::new();
        let block = heap.allocate(20).expect("small allocation");
        let address = block.segment().as_ptr().as_ptr() as usize;

        let block = block.resize(30).expect("same class");
        assert_eq!(block.segment().as_ptr().as_ptr() as usize, address);
        assert_eq!(block.payload_len(), 30);

        let mut block = block;
        assert!(block.release().expect("live block"));
    }

    #[test]
    fn resize_across_classes_copies_and_releases() {
        let heap = HeapMemoryManager::new();
        let block = heap.allocate(32).expect("small allocation");

        // SAFETY: The block is live and nobody else touches it.
        let segment = block.segment();
        unsafe { segment.as_mut_slice() }.copy_from_slice(&[0xAB; 32]);
        let old = block;

        let grown = block.resize(1000).expect("larger class");
        assert_ne!(
            grown.segment().as_ptr().as_ptr() as usize,
            old.segment().as_ptr().as_ptr() as usize
        );
        assert_eq!(grown.payload_len(), 1000);
        // SAFETY: The block is live and nobody else touches it.
        let grown_segment = grown.segment();
        assert_eq!(&unsafe { grown_segment.as_slice() }[..32], &[0xAB; 32]);

        // The old block was released by the resize.
        assert!(old.is_disposed());

        let mut grown = grown;
        assert!(grown.release().expect("live block"));
    }

    #[test]
    fn oversize_allocations_bypass_the_classes() {
        let heap = HeapMemoryManager::new();
        let mut block = heap.allocate(100_000).expect("oversize allocation");

        assert_eq!(block.payload_len(), 100_000);
        assert_eq!(block.segment().as_ptr().as_ptr() as usize % 16, 0);

        // SAFETY: The block is live and nobody else touches it.
        let segment = block.segment();
        unsafe { segment.as_mut_slice() }.fill(0x5A);
        assert!(block.release().expect("live block"));
    }

    #[test]
    fn global_instance_is_shared() {
        let first = HeapMemoryManager::global();
        let second = HeapMemoryManager::global();

        assert_eq!(first.manager_id(), second.manager_id());

        let mut block = first.allocate(64).expect("small allocation");
        assert!(block.release().expect("live block"));
    }

    #[test]
    fn classes_allocate_concurrently() {
        let heap = HeapMemoryManager::new();

        thread::scope(|scope| {
            for size in [40_usize, 300, 5000] {
                let heap = &heap;
                scope.spawn(move || {
                    for _ in 0..200 {
                        let mut block = heap.allocate(size).expect("small allocation");
                        assert_eq!(block.payload_len(), size);
                        assert!(block.release().expect("live block"));
                    }
                });
            }
        });
    }
}

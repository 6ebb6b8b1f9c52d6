// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use tomate_sync::ExclusiveAccessControl;
use xxhash_rust::xxh32::xxh32;

use crate::block::round_up_16;
use crate::{Error, MemoryBlock, Result, manager};

/// Maximum number of slot pages per store.
const MAX_PAGES: usize = 256;

/// Slots per page; one page is a single block from the owning manager.
const SLOTS_PER_PAGE: usize = 64;

const SLOT_HEADER_LEN: usize = 16;

const FLAG_OCCUPIED: u32 = 1;
const FLAG_RETIRED: u32 = 1 << 1;

/// 32-bit tag of a stored type, derived from its name.
fn tag_of<T: 'static>() -> u32 {
    xxh32(std::any::type_name::<T>().as_bytes(), 0)
}

const fn slot_size_for(value_size: usize) -> usize {
    SLOT_HEADER_LEN + round_up_16(if value_size == 0 { 1 } else { value_size })
}

/// Per-slot bookkeeping preceding the stored value bytes.
#[repr(C)]
struct SlotHeader {
    /// Bumped on every release; a handle matches only its creation
    /// generation, so handles to freed slots go stale instead of aliasing
    /// the next occupant.
    generation: AtomicU32,
    flags: AtomicU32,
    tag: AtomicU32,
    _reserved: u32,
}

const _: () = assert!(size_of::<SlotHeader>() == SLOT_HEADER_LEN);

/// A typed, 64-bit, generation-tagged reference into an
/// [`UnmanagedDataStore`].
///
/// Handles are plain data: bitwise-copyable, independent of any process
/// address, and convertible to and from a raw `u64` via
/// [`to_bits`][Self::to_bits] / [`from_bits`][Self::from_bits] so they can be
/// persisted, including inside a memory-mapped file. A handle stays valid
/// until the slot it names is released; lookups after that fail with
/// [`StaleHandle`][Error::StaleHandle].
#[repr(C)]
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

const _: () = assert!(size_of::<Handle<u64>>() == 8);

// Manual impls: a handle is plain data regardless of `T`.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<T> Handle<T> {
    const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// The handle as a raw 64-bit value: generation in the high half, slot
    /// index in the low half.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        (self.generation as u64) << 32 | self.index as u64
    }

    /// Reconstructs a handle from [`to_bits`][Self::to_bits].
    ///
    /// The bits carry no type information; pairing them with the wrong `T`
    /// is caught at lookup time as a
    /// [`TypeMismatch`][Error::TypeMismatch].
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self::new(bits as u32, (bits >> 32) as u32)
    }

    const fn page_index(self) -> usize {
        (self.index >> 16) as usize
    }

    const fn slot_index(self) -> usize {
        (self.index & 0xFFFF) as usize
    }
}

struct Page {
    block: MemoryBlock,
    slot_size: usize,
    /// Free slot indices; guarded by the store's access control.
    free: UnsafeCell<Vec<u16>>,
}

impl Page {
    fn slot(&self, index: usize) -> &SlotHeader {
        debug_assert!(index < SLOTS_PER_PAGE);

        // SAFETY: Pages are sized for SLOTS_PER_PAGE slots; the block's
        // payload lives as long as the owning manager.
        unsafe {
            &*self
                .block
                .segment()
                .as_ptr()
                .add(index * self.slot_size)
                .cast::<SlotHeader>()
                .as_ptr()
        }
    }

    fn value_ptr(&self, index: usize) -> NonNull<u8> {
        // SAFETY: The value bytes directly follow the slot header.
        unsafe {
            self.block
                .segment()
                .as_ptr()
                .add(index * self.slot_size + SLOT_HEADER_LEN)
        }
    }
}

/// A generation-tagged slot table handing out stable, typed 64-bit handles
/// to values stored in the owning manager's memory.
///
/// Every [`MemoryManager`][crate::MemoryManager] owns one store
/// ([`store()`][crate::MemoryManager::store]). Slot pages are blocks
/// allocated from that manager, so a store over an
/// [`MmfMemoryManager`][crate::MmfMemoryManager] keeps its values inside the
/// mapped file, where their bytes - and the handles referring to them - are
/// meaningful to every process sharing it. The slot free lists themselves
/// are per-process: concurrent `create`/`release` from different processes
/// against the same region is not coordinated.
///
/// Slot allocation and free are guarded by one exclusive access control;
/// [`get`][Self::get] is lock-free and synchronizes nothing beyond its own
/// validation - synchronizing the contained value is the caller's concern,
/// as is not releasing a slot another thread is still reading.
///
/// The store does not drop surviving values when it goes away; whatever was
/// not released stays behind in the manager's memory.
pub struct UnmanagedDataStore {
    manager_id: u32,
    guard: ExclusiveAccessControl,
    pages: Box<[UnsafeCell<Option<Page>>]>,
    /// Pages below this count are initialized; incremented with release
    /// ordering after the page is written, so readers never see a torn page.
    page_count: AtomicU32,
}

impl fmt::Debug for UnmanagedDataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnmanagedDataStore")
            .field("manager_id", &self.manager_id)
            .field("pages", &self.page_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// SAFETY: Page publication is ordered through `page_count`; all slot state
// is atomic; free lists are only touched under `guard`.
unsafe impl Send for UnmanagedDataStore {}

// SAFETY: See the Send impl.
unsafe impl Sync for UnmanagedDataStore {}

impl UnmanagedDataStore {
    /// Creates the store for the manager with the given registry id.
    pub(crate) fn new(manager_id: u32) -> Self {
        Self {
            manager_id,
            guard: ExclusiveAccessControl::new(),
            pages: (0..MAX_PAGES).map(|_| UnsafeCell::new(None)).collect(),
            page_count: AtomicU32::new(0),
        }
    }

    /// Runs `f` under the store guard, releasing it on every path.
    fn locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let taken = self.guard.take(None);
        debug_assert!(taken, "store guard take cannot time out without a deadline");

        let result = f();

        let released = self.guard.release();
        debug_assert!(released, "store guard released by its taker");
        result
    }

    fn page(&self, index: usize) -> Option<&Page> {
        if index >= self.page_count.load(Ordering::Acquire) as usize {
            return None;
        }
        // SAFETY: Pages below the published count are fully initialized and
        // never replaced.
        unsafe { (*self.pages[index].get()).as_ref() }
    }

    /// Stores a value and returns its handle.
    ///
    /// Values must be `Send` (handles travel between threads) and their
    /// alignment must not exceed 16 (the payload alignment guarantee of the
    /// underlying blocks). Fails with [`StoreFull`][Error::StoreFull] when
    /// no page can be added, or with the manager's error when page
    /// allocation fails.
    pub fn create<T: Send + 'static>(&self, value: T) -> Result<Handle<T>> {
        if align_of::<T>() > 16 {
            return Err(Error::InvalidSize("stored types may not require alignment above 16"));
        }
        let slot_size = slot_size_for(size_of::<T>());

        let (page_index, slot_index, generation) = self.locked(|| {
            let (page_index, slot_index) = self.claim_slot(slot_size)?;
            let page = self.page(page_index).ok_or(Error::StaleHandle)?;
            let slot = page.slot(slot_index);

            debug_assert_eq!(slot.flags.load(Ordering::Relaxed) & FLAG_OCCUPIED, 0);
            slot.tag.store(tag_of::<T>(), Ordering::Release);
            // SAFETY: The slot is ours (claimed under the guard) and its
            // value area is sized and aligned for T.
            unsafe {
                page.value_ptr(slot_index).cast::<T>().write(value);
            }
            slot.flags.store(FLAG_OCCUPIED, Ordering::Release);

            Ok::<(usize, usize, u32), Error>((page_index, slot_index, slot.generation.load(Ordering::Relaxed)))
        })?;

        Ok(Handle::new(((page_index as u32) << 16) | slot_index as u32, generation))
    }

    /// Pops a free slot of the right size, adding a page if needed. Called
    /// under the guard.
    fn claim_slot(&self, slot_size: usize) -> Result<(usize, usize)> {
        let count = self.page_count.load(Ordering::Relaxed) as usize;

        for page_index in 0..count {
            let page = self.page(page_index).ok_or(Error::StaleHandle)?;
            if page.slot_size != slot_size {
                continue;
            }
            // SAFETY: Free lists are only touched under the guard.
            let free = unsafe { &mut *page.free.get() };
            if let Some(slot) = free.pop() {
                return Ok((page_index, usize::from(slot)));
            }
        }

        if count == MAX_PAGES {
            return Err(Error::StoreFull);
        }

        let owner = manager(self.manager_id).ok_or(Error::Disposed)?;
        let block = owner.allocate(slot_size * SLOTS_PER_PAGE)?;

        let page = Page {
            block,
            slot_size,
            // Slot 0 is handed straight to the caller; pop order keeps the
            // rest ascending.
            free: UnsafeCell::new((1..SLOTS_PER_PAGE as u16).rev().collect()),
        };
        for slot_index in 0..SLOTS_PER_PAGE {
            let header = page.value_ptr(slot_index);
            // SAFETY: The slot header precedes the value bytes; fresh pages
            // are exclusively ours until published.
            unsafe {
                header.sub(SLOT_HEADER_LEN).cast::<SlotHeader>().write(SlotHeader {
                    generation: AtomicU32::new(1),
                    flags: AtomicU32::new(0),
                    tag: AtomicU32::new(0),
                    _reserved: 0,
                });
            }
        }

        // SAFETY: Slot `count` is above the published count, so nobody else
        // reads it; the subsequent release store publishes it.
        unsafe {
            *self.pages[count].get() = Some(page);
        }
        self.page_count.store((count + 1) as u32, Ordering::Release);

        Ok((count, 0))
    }

    /// Validates a handle and returns its page and slot.
    fn lookup<T: 'static>(&self, handle: Handle<T>) -> Result<(&Page, &SlotHeader)> {
        let page = self.page(handle.page_index()).ok_or(Error::StaleHandle)?;
        if handle.slot_index() >= SLOTS_PER_PAGE {
            return Err(Error::StaleHandle);
        }
        let slot = page.slot(handle.slot_index());

        if slot.flags.load(Ordering::Acquire) & FLAG_OCCUPIED == 0 {
            return Err(Error::StaleHandle);
        }
        if slot.generation.load(Ordering::Acquire) != handle.generation {
            return Err(Error::StaleHandle);
        }
        let actual = slot.tag.load(Ordering::Acquire);
        let expected = tag_of::<T>();
        if actual != expected {
            return Err(Error::TypeMismatch { expected, actual });
        }

        Ok((page, slot))
    }

    /// Resolves a handle to the stored value.
    ///
    /// Lock-free; fails with [`StaleHandle`][Error::StaleHandle] once the
    /// slot was released and [`TypeMismatch`][Error::TypeMismatch] for a
    /// handle of the wrong type.
    pub fn get<T: 'static>(&self, handle: Handle<T>) -> Result<&T> {
        let (page, _) = self.lookup(handle)?;

        // SAFETY: The slot is occupied at the matching generation; its value
        // area holds an initialized T for as long as the slot stays live.
        Ok(unsafe { page.value_ptr(handle.slot_index()).cast::<T>().as_ref() })
    }

    /// Resolves a handle to the stored value, mutably.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no other reference to this slot's value is
    /// live for the duration of the borrow; the store does not track value
    /// borrows.
    pub unsafe fn get_mut<T: 'static>(&self, handle: Handle<T>) -> Result<&mut T> {
        let (page, _) = self.lookup(handle)?;

        // SAFETY: Occupied slot at the matching generation; exclusivity is
        // the caller's obligation.
        Ok(unsafe { page.value_ptr(handle.slot_index()).cast::<T>().as_mut() })
    }

    /// Releases a slot: drops the value in place, bumps the generation and
    /// returns the slot to the free list.
    ///
    /// A slot whose generation counter would wrap around is retired
    /// permanently instead of being reused, so a persisted handle from the
    /// first life of the slot can never accidentally re-match.
    pub fn release<T: 'static>(&self, handle: Handle<T>) -> Result<()> {
        self.locked(|| {
            let (page, slot) = self.lookup(handle)?;

            // SAFETY: The slot is occupied with a T; the guard keeps
            // allocation paths away while we tear it down.
            unsafe {
                std::ptr::drop_in_place(page.value_ptr(handle.slot_index()).cast::<T>().as_ptr());
            }

            let next_generation = slot.generation.load(Ordering::Relaxed).wrapping_add(1);
            let retired = next_generation == 0;

            slot.generation.store(next_generation, Ordering::Release);
            slot.flags
                .store(if retired { FLAG_RETIRED } else { 0 }, Ordering::Release);

            if !retired {
                // SAFETY: Free lists are only touched under the guard.
                let free = unsafe { &mut *page.free.get() };
                free.push(handle.slot_index() as u16);
            }

            Ok(())
        })
    }

    /// Forces a slot's generation counter, returning the matching handle.
    /// Test hook for exercising generation wrap-around.
    #[cfg(test)]
    fn force_generation<T: 'static>(&self, handle: Handle<T>, generation: u32) -> Result<Handle<T>> {
        self.locked(|| {
            let (_, slot) = self.lookup(handle)?;
            slot.generation.store(generation, Ordering::Release);
            Ok(Handle::new(handle.index, generation))
        })
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::HeapMemoryManager;
    use crate::MemoryManager;

    #[test]
    fn thread_safe_types() {
        assert_impl_all!(UnmanagedDataStore: Send, Sync);
        assert_impl_all!(Handle<u64>: Send, Sync, Copy);
    }

    #[test]
    fn create_get_release_round_trip() {
        let heap = HeapMemoryManager::new();
        let store = heap.store();

        let handle = store.create(42_u64).expect("store has room");
        assert_eq!(*store.get(handle).expect("live slot"), 42);

        // Repeated lookups resolve to the same interior reference.
        let first = std::ptr::from_ref(store.get(handle).expect("live slot"));
        let second = std::ptr::from_ref(store.get(handle).expect("live slot"));
        assert_eq!(first, second);

        store.release(handle).expect("live slot");
        assert!(matches!(store.get(handle), Err(Error::StaleHandle)));
        assert!(matches!(store.release(handle), Err(Error::StaleHandle)));
    }

    #[test]
    fn get_mut_updates_in_place() {
        let heap = HeapMemoryManager::new();
        let store = heap.store();

        let handle = store.create([1_u32, 2, 3, 4]).expect("store has room");
        // SAFETY: No other reference to this slot exists.
        unsafe { store.get_mut(handle) }.expect("live slot")[2] = 99;
        assert_eq!(*store.get(handle).expect("live slot"), [1, 2, 99, 4]);

        store.release(handle).expect("live slot");
    }

    #[test]
    fn wrong_type_is_a_mismatch_not_a_stale_handle() {
        let heap = HeapMemoryManager::new();
        let store = heap.store();

        let handle = store.create(7_u64).expect("store has room");
        let wrong = Handle::<i64>::from_bits(handle.to_bits());

        assert!(matches!(store.get(wrong), Err(Error::TypeMismatch { .. })));
        assert_eq!(*store.get(handle).expect("live slot"), 7);

        store.release(handle).expect("live slot");
    }

    #[test]
    fn handles_survive_the_bit_round_trip() {
        let heap = HeapMemoryManager::new();
        let store = heap.store();

        let handle = store.create(0xFEED_u64).expect("store has room");
        let revived = Handle::<u64>::from_bits(handle.to_bits());

        assert_eq!(revived, handle);
        assert_eq!(*store.get(revived).expect("live slot"), 0xFEED);

        store.release(revived).expect("live slot");
    }

    #[test]
    fn released_slots_are_reused_with_a_new_generation() {
        let heap = HeapMemoryManager::new();
        let store = heap.store();

        let first = store.create(1_u64).expect("store has room");
        store.release(first).expect("live slot");

        let second = store.create(2_u64).expect("store has room");
        assert_eq!(second.index, first.index, "freed slot is reused");
        assert_eq!(second.generation, first.generation + 1);

        assert!(matches!(store.get(first), Err(Error::StaleHandle)));
        assert_eq!(*store.get(second).expect("live slot"), 2);

        store.release(second).expect("live slot");
    }

    #[test]
    fn generation_wrap_retires_the_slot() {
        let heap = HeapMemoryManager::new();
        let store = heap.store();

        let handle = store.create(5_u64).expect("store has room");
        let handle = store.force_generation(handle, u32::MAX).expect("live slot");

        store.release(handle).expect("live slot");

        // The wrapped slot must never be handed out again.
        let next = store.create(6_u64).expect("store has room");
        assert_ne!(next.index, handle.index);
        assert!(matches!(store.get(handle), Err(Error::StaleHandle)));

        store.release(next).expect("live slot");
    }

    #[test]
    fn grows_across_pages() {
        let heap = HeapMemoryManager::new();
        let store = heap.store();

        let handles: Vec<_> = (0..(SLOTS_PER_PAGE as u64 * 2 + 3))
            .map(|value| store.create(value).expect("store has room"))
            .collect();

        for (value, handle) in handles.iter().enumerate() {
            assert_eq!(*store.get(*handle).expect("live slot"), value as u64);
        }

        for handle in handles {
            store.release(handle).expect("live slot");
        }
    }

    #[test]
    fn distinct_sizes_use_distinct_pages() {
        let heap = HeapMemoryManager::new();
        let store = heap.store();

        let small = store.create(1_u8).expect("store has room");
        let large = store.create([0_u64; 8]).expect("store has room");

        assert_ne!(small.page_index(), large.page_index());

        store.release(small).expect("live slot");
        store.release(large).expect("live slot");
    }

    #[test]
    fn release_runs_the_destructor() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize;

        struct Probe(Arc<AtomicUsize>);

        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let heap = HeapMemoryManager::new();
        let store = heap.store();
        let drops = Arc::new(AtomicUsize::new(0));

        let handle = store.create(Probe(Arc::clone(&drops))).expect("store has room");
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        store.release(handle).expect("live slot");
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}

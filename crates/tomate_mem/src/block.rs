// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::error;

use crate::{Error, MemorySegment, Result, manager};

/// Rounds a payload length up to the 16-byte capacity granularity.
pub(crate) const fn round_up_16(len: usize) -> usize {
    (len + 15) & !15
}

/// The fixed header preceding every block payload.
///
/// 16 bytes, `#[repr(C)]`, byte-exact with the on-disk block header of the
/// memory-mapped-file backend: `[refcount u32, class u16, flags u16,
/// payload_len u64]`, little-endian. `class` and `flags` share one atomic
/// (class in the low half, flags in the high half) so concurrent mappers
/// never tear them; on a little-endian target the bytes land exactly where
/// the layout says.
///
/// Payload capacity is always `payload_len` rounded up to 16, so it does not
/// need a field of its own.
#[repr(C)]
pub(crate) struct BlockHeader {
    refcount: AtomicU32,
    class_and_flags: AtomicU32,
    payload_len: AtomicU64,
}

const _: () = assert!(size_of::<BlockHeader>() == BlockHeader::LEN);

impl BlockHeader {
    /// Header length in bytes; also the payload alignment guarantee.
    pub(crate) const LEN: usize = 16;

    /// Flag bit: the block is allocated (not on a free structure).
    pub(crate) const FLAG_ALLOCATED: u16 = 1;

    /// Stamps a fresh header: refcount 1, allocated, with the given class.
    pub(crate) fn initialize(&self, class: u16, payload_len: usize) {
        self.refcount.store(1, Ordering::SeqCst);
        self.class_and_flags.store(
            u32::from(class) | (u32::from(Self::FLAG_ALLOCATED) << 16),
            Ordering::Release,
        );
        self.payload_len.store(payload_len as u64, Ordering::Release);
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Increments the refcount and returns the new value.
    pub(crate) fn increment(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the refcount and returns the new value.
    ///
    /// Underflow means a release without a matching reference - a program
    /// bug that would otherwise free memory still in use, so the process
    /// aborts rather than continue on corrupted state.
    pub(crate) fn decrement(&self) -> u32 {
        let mut current = self.refcount.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                error!("block refcount underflow: release without a matching reference");
                std::process::abort();
            }
            match self
                .refcount
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return current - 1,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn class(&self) -> u16 {
        (self.class_and_flags.load(Ordering::Acquire) & 0xFFFF) as u16
    }

    pub(crate) fn flags(&self) -> u16 {
        (self.class_and_flags.load(Ordering::Acquire) >> 16) as u16
    }

    pub(crate) fn clear_allocated(&self) {
        let class = u32::from(self.class());
        self.class_and_flags.store(class, Ordering::Release);
    }

    pub(crate) fn payload_len(&self) -> usize {
        self.payload_len.load(Ordering::Acquire) as usize
    }

    /// Adjusts the payload length; callers must hold whatever serializes
    /// resizes for the owning manager.
    pub(crate) fn set_payload_len(&self, payload_len: usize) {
        self.payload_len.store(payload_len as u64, Ordering::Release);
    }

    /// Payload capacity in bytes: the length rounded up to 16.
    pub(crate) fn capacity(&self) -> usize {
        round_up_16(self.payload_len())
    }

    /// The payload immediately following this header.
    pub(crate) fn payload(&self) -> NonNull<u8> {
        // SAFETY: The payload is part of the same allocation, directly after
        // the header.
        unsafe { NonNull::from(self).cast::<u8>().add(Self::LEN) }
    }
}

/// A handle to a reference-counted block allocated by a [`MemoryManager`].
///
/// The handle is a plain copyable value: a pointer to the block header plus
/// the registry id of the owning manager. Copies are cheap and never touch
/// the refcount - lifetime management is explicit through
/// [`add_ref`][Self::add_ref] and [`release`][Self::release], so a count
/// stored in a memory-mapped file persists across processes exactly as
/// committed.
///
/// Dropping a handle does nothing. A handle that was never assigned is
/// *default* ([`is_default`][Self::is_default]); one whose block has been
/// freed is *disposed* ([`is_disposed`][Self::is_disposed]). A resize that
/// could not grow in place returns a new handle and releases the old block;
/// the caller must reassign and stop using previous copies.
///
/// [`MemoryManager`]: crate::MemoryManager
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBlock {
    header: Option<NonNull<BlockHeader>>,
    manager_id: u32,
    disposed: bool,
}

// SAFETY: The handle is plain data; the header it points at is managed with
// atomics and owned by the manager, which outlives its blocks by contract.
unsafe impl Send for MemoryBlock {}

// SAFETY: See the Send impl.
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    pub(crate) fn from_raw(header: NonNull<BlockHeader>, manager_id: u32) -> Self {
        Self {
            header: Some(header),
            manager_id,
            disposed: false,
        }
    }

    pub(crate) fn header_ptr(&self) -> Option<NonNull<BlockHeader>> {
        self.header
    }

    fn live_header(&self) -> Result<&BlockHeader> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        // SAFETY: A non-default, non-disposed handle points at a header kept
        // alive by the owning manager.
        let header = unsafe { self.header.ok_or(Error::Disposed)?.as_ref() };
        if header.refcount() == 0 {
            return Err(Error::Disposed);
        }

        Ok(header)
    }

    /// Whether this handle was never assigned a block.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.header.is_none()
    }

    /// Whether the block behind this handle has been freed (or the handle
    /// observed the release itself).
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        if self.disposed {
            return true;
        }
        match self.header {
            // SAFETY: Header storage is kept alive by the owning manager.
            Some(header) => unsafe { header.as_ref() }.refcount() == 0,
            None => false,
        }
    }

    /// Registry id of the owning manager.
    #[must_use]
    pub fn manager_id(&self) -> u32 {
        self.manager_id
    }

    /// The block's payload window, or an empty segment for a default or
    /// disposed handle.
    #[must_use]
    pub fn segment(&self) -> MemorySegment {
        match self.live_header() {
            Ok(header) => MemorySegment::new(header.payload(), header.payload_len()),
            Err(_) => MemorySegment::dangling(),
        }
    }

    /// Current reference count; 0 for a default or disposed handle.
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.live_header().map_or(0, BlockHeader::refcount)
    }

    /// Payload length in bytes; 0 for a default or disposed handle.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.live_header().map_or(0, BlockHeader::payload_len)
    }

    /// Takes an additional reference on the block and returns the new count.
    ///
    /// Every `add_ref` must be paired with one [`release`][Self::release].
    pub fn add_ref(&self) -> Result<u32> {
        Ok(self.live_header()?.increment())
    }

    /// Drops one reference. The 1 -> 0 transition frees the block through
    /// its manager and marks this handle disposed; the call returns whether
    /// that happened. A handle whose count is still positive stays usable.
    pub fn release(&mut self) -> Result<bool> {
        let header = self.live_header()?;

        if header.decrement() > 0 {
            return Ok(false);
        }

        // Last reference gone: hand the memory back. The manager may already
        // have been dropped, in which case the memory went away with it.
        if let Some(owner) = manager(self.manager_id) {
            owner.free(*self);
        }

        self.header = None;
        self.disposed = true;
        Ok(true)
    }

    /// Resizes the block through its manager, returning the handle to use
    /// from now on.
    ///
    /// Grows in place when the manager can extend the backing extent;
    /// otherwise allocates a new block, copies `min(old, new)` bytes and
    /// releases this one. On failure the original block is left valid.
    pub fn resize(self, new_len: usize) -> Result<MemoryBlock> {
        self.live_header()?;

        let owner = manager(self.manager_id).ok_or(Error::Disposed)?;
        owner.resize(self, new_len)
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(MemoryBlock: Send, Sync, Copy);
    }

    #[test]
    fn header_is_sixteen_bytes() {
        assert_eq!(size_of::<BlockHeader>(), 16);
        assert_eq!(BlockHeader::LEN, 16);
    }

    #[test]
    fn default_handle_reports_default_not_disposed() {
        let block = MemoryBlock::default();

        assert!(block.is_default());
        assert!(!block.is_disposed());
        assert_eq!(block.refcount(), 0);
        assert_eq!(block.payload_len(), 0);
        assert!(block.segment().is_empty());
        assert!(matches!(block.add_ref(), Err(Error::Disposed)));
    }

    #[test]
    fn rounding_is_sixteen_byte_granular() {
        assert_eq!(round_up_16(0), 0);
        assert_eq!(round_up_16(1), 16);
        assert_eq!(round_up_16(16), 16);
        assert_eq!(round_up_16(17), 32);
    }

    #[test]
    fn header_stamps_and_tracks_state() {
        let header = BlockHeader {
            refcount: AtomicU32::new(0),
            class_and_flags: AtomicU32::new(0),
            payload_len: AtomicU64::new(0),
        };

        header.initialize(3, 100);
        assert_eq!(header.refcount(), 1);
        assert_eq!(header.class(), 3);
        assert_eq!(header.flags(), BlockHeader::FLAG_ALLOCATED);
        assert_eq!(header.payload_len(), 100);
        assert_eq!(header.capacity(), 112);

        assert_eq!(header.increment(), 2);
        assert_eq!(header.decrement(), 1);
        assert_eq!(header.decrement(), 0);

        header.clear_allocated();
        assert_eq!(header.class(), 3);
        assert_eq!(header.flags(), 0);
    }
}

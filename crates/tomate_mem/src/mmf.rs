// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use tomate_sync::{AccessControl, NATIVE_PROVIDER_ID, ProcessProvider, process_provider};
use tracing::{debug, error};

use crate::block::round_up_16;
use crate::manager::{deregister_manager, register_manager, reserve_manager_id};
use crate::{BlockHeader, Error, MemoryBlock, MemoryManager, Result, UnmanagedDataStore};

/// File magic: 15 bytes of name plus a terminating NUL.
const MAGIC: [u8; 16] = *b"TOMATE-MMF-V001\0";

/// On-disk format version.
const VERSION: u32 = 1;

const OFF_VERSION: usize = 16;
const OFF_TOTAL_SIZE: usize = 20;
const OFF_INDEX_OFFSET: usize = 28;
const OFF_ACCESS_CONTROL: usize = 36;
const OFF_CREATOR_PID: usize = 44;

/// Root header length; the free-run index starts here.
const ROOT_HEADER_LEN: usize = 64;

/// Bytes per `(offset u64, length u64)` index entry.
const RUN_ENTRY_LEN: usize = 16;

/// Smallest file worth managing: leaves a usable data region behind the
/// header and index.
pub const MIN_FILE_SIZE: usize = 4096;

/// Block-header class marking a carved free-run index region, so a
/// relocated index is never mistaken for an ordinary block or for free
/// space.
const CLASS_INDEX: u16 = u16::MAX;

/// Capacity of the initial free-run index region behind the root header,
/// for a file of the given total size.
///
/// Derived deterministically on both the creating and the opening side, so
/// it does not need a field in the byte-exact root header. One extra entry
/// is always reserved for the zero-pair terminator. When fragmentation
/// outgrows this region, a larger one is carved from the tail of the file
/// and the header's index-offset field repoints to it.
const fn initial_index_capacity(total_size: usize) -> usize {
    let entries = total_size / 4096;
    if entries < 64 {
        64
    } else if entries > 4096 {
        4096
    } else {
        entries
    }
}

/// First byte of the data region: header, initial index entries, terminator.
const fn data_base(total_size: usize) -> usize {
    ROOT_HEADER_LEN + (initial_index_capacity(total_size) + 1) * RUN_ENTRY_LEN
}

/// Inserts a free run into the offset-sorted run list, coalescing with
/// adjacent neighbors.
fn insert_run(runs: &mut Vec<(u64, u64)>, offset: u64, length: u64) {
    let pos = runs.partition_point(|&(off, _)| off < offset);

    let merges_prev = pos > 0 && runs[pos - 1].0 + runs[pos - 1].1 == offset;
    if merges_prev {
        runs[pos - 1].1 += length;
        if pos < runs.len() && runs[pos - 1].0 + runs[pos - 1].1 == runs[pos].0 {
            runs[pos - 1].1 += runs[pos].1;
            runs.remove(pos);
        }
        return;
    }

    if pos < runs.len() && offset + length == runs[pos].0 {
        runs[pos].0 = offset;
        runs[pos].1 += length;
        return;
    }

    runs.insert(pos, (offset, length));
}

/// A [`MemoryManager`] over a memory-mapped file shareable across processes.
///
/// The file carries its own metadata: a fixed root header (magic, version,
/// sizes, creator pid), an embedded [`AccessControl`] guarding every
/// metadata update with a cross-process identity, and an offset-sorted,
/// zero-terminated index of free runs. Block headers sit inline, immediately
/// before their payloads. Nothing in the file is a process-local pointer -
/// every link is an offset from the mapping base - so any process mapping
/// the file at its own address sees valid state.
///
/// Allocation takes the metadata control exclusively, best-fit scans the run
/// index and splits the chosen run; free coalesces with adjacent runs.
/// Resize shrinks and grows in place where the neighboring run allows,
/// otherwise falls back to allocate-copy-release. When fragmentation
/// produces more runs than the index region can hold, a larger region is
/// carved from the tail of the file and the index relocates there, returning
/// any superseded region to the free list.
///
/// # Lifetime and crashes
///
/// Dropping the manager unmaps the file locally and never touches
/// refcounts; the file (and any positive counts in it) persists for the
/// next opener. A process that exits without releasing its references
/// leaks them permanently - the library attempts no refcount recovery on
/// open. The backing file cannot be resized after creation.
pub struct MmfMemoryManager {
    base: NonNull<u8>,
    total_size: usize,
    fd: libc::c_int,
    path: PathBuf,
    provider: Arc<dyn ProcessProvider>,
    id: u32,
    store: UnmanagedDataStore,
}

impl fmt::Debug for MmfMemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmfMemoryManager")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

// SAFETY: The mapping is shared state designed for multi-thread and
// multi-process access; every mutable location in it is either atomic or
// guarded by the embedded access control.
unsafe impl Send for MmfMemoryManager {}

// SAFETY: See the Send impl.
unsafe impl Sync for MmfMemoryManager {}

impl MmfMemoryManager {
    /// Creates a new file of `size` bytes at `path` and maps it.
    ///
    /// Fails if the file already exists. Process identity uses the native
    /// provider.
    pub fn create(path: impl AsRef<Path>, size: usize) -> Result<Arc<Self>> {
        Self::create_with_provider(path, size, NATIVE_PROVIDER_ID)
    }

    /// Maps an existing file created by [`create`][Self::create].
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::open_with_provider(path, NATIVE_PROVIDER_ID)
    }

    /// [`create`][Self::create] with an explicit process-provider registry id
    /// for the metadata control's identity.
    pub fn create_with_provider(path: impl AsRef<Path>, size: usize, provider_id: i32) -> Result<Arc<Self>> {
        let path = path.as_ref();
        if size < MIN_FILE_SIZE {
            return Err(Error::InvalidSize("file smaller than the minimum mappable size"));
        }

        let provider =
            process_provider(provider_id).ok_or(tomate_sync::Error::UnknownProvider(provider_id))?;

        let fd = open_fd(path, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL)?;
        let guard = FdGuard(fd);

        // Exclusive file lock while initializing; openers take a shared lock
        // before validating, so nobody observes a half-written header.
        flock(fd, libc::LOCK_EX)?;
        // SAFETY: Freshly opened, owned descriptor.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        let base = map_shared(fd, size)?;

        // The manager owns the descriptor from here on.
        let manager = Self::from_mapping(base, size, fd, path.to_path_buf(), provider);
        std::mem::forget(guard);

        manager.write_u32(OFF_VERSION, VERSION);
        manager.write_u64(OFF_TOTAL_SIZE, size as u64);
        manager.write_u64(OFF_INDEX_OFFSET, ROOT_HEADER_LEN as u64);
        manager.write_u32(OFF_CREATOR_PID, manager.provider.current_process_id());

        let data = data_base(size);
        manager.write_runs(&[(data as u64, (size - data) as u64)]);

        // The magic is written last: it publishes the file as initialized.
        // SAFETY: The first 16 bytes of the mapping are ours to write.
        unsafe {
            std::ptr::copy_nonoverlapping(MAGIC.as_ptr(), manager.base.as_ptr(), MAGIC.len());
        }

        flock(fd, libc::LOCK_UN)?;

        debug!(id = manager.id, path = %manager.path.display(), size, "memory-mapped file created");
        Ok(Self::into_registered(manager))
    }

    /// [`open`][Self::open] with an explicit process-provider registry id.
    pub fn open_with_provider(path: impl AsRef<Path>, provider_id: i32) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let provider =
            process_provider(provider_id).ok_or(tomate_sync::Error::UnknownProvider(provider_id))?;

        let fd = open_fd(path, libc::O_RDWR)?;
        let guard = FdGuard(fd);

        // SAFETY: Freshly opened, owned descriptor.
        let mut stat = unsafe { std::mem::zeroed::<libc::stat>() };
        // SAFETY: stat points at a properly sized buffer.
        if unsafe { libc::fstat(fd, &raw mut stat) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let size = usize::try_from(stat.st_size).map_err(|_| Error::MmfCorrupt("negative file size"))?;
        if size < MIN_FILE_SIZE {
            return Err(Error::MmfCorrupt("file shorter than the minimum mappable size"));
        }

        flock(fd, libc::LOCK_SH)?;
        let base = map_shared(fd, size)?;

        // The manager owns the descriptor from here on.
        let manager = Self::from_mapping(base, size, fd, path.to_path_buf(), provider);
        std::mem::forget(guard);

        let validation = manager.validate();
        flock(fd, libc::LOCK_UN)?;
        validation?;

        debug!(id = manager.id, path = %manager.path.display(), size, "memory-mapped file opened");
        Ok(Self::into_registered(manager))
    }

    /// The directory used by [`create_default`][Self::create_default]: the
    /// `TOMATE_MMF_DIR` environment variable, or the system temp directory.
    #[must_use]
    pub fn default_dir() -> PathBuf {
        std::env::var_os("TOMATE_MMF_DIR").map_or_else(std::env::temp_dir, PathBuf::from)
    }

    /// Creates `name` inside [`default_dir`][Self::default_dir].
    pub fn create_default(name: &str, size: usize) -> Result<Arc<Self>> {
        Self::create(Self::default_dir().join(name), size)
    }

    /// Opens `name` inside [`default_dir`][Self::default_dir].
    pub fn open_default(name: &str) -> Result<Arc<Self>> {
        Self::open(Self::default_dir().join(name))
    }

    fn from_mapping(
        base: NonNull<u8>,
        total_size: usize,
        fd: libc::c_int,
        path: PathBuf,
        provider: Arc<dyn ProcessProvider>,
    ) -> Self {
        let id = reserve_manager_id();
        Self {
            base,
            total_size,
            fd,
            path,
            provider,
            id,
            store: UnmanagedDataStore::new(id),
        }
    }

    fn into_registered(manager: Self) -> Arc<Self> {
        let manager = Arc::new(manager);
        let weak: Weak<dyn MemoryManager> = Arc::downgrade(&(Arc::clone(&manager) as Arc<dyn MemoryManager>));
        register_manager(manager.id, weak);
        manager
    }

    fn validate(&self) -> Result<()> {
        // SAFETY: The mapping is at least MIN_FILE_SIZE long.
        let magic = unsafe { std::slice::from_raw_parts(self.base.as_ptr(), MAGIC.len()) };
        if magic != MAGIC {
            return Err(Error::MmfCorrupt("bad magic"));
        }
        if self.read_u32(OFF_VERSION) != VERSION {
            return Err(Error::MmfCorrupt("unsupported version"));
        }
        if self.read_u64(OFF_TOTAL_SIZE) != self.total_size as u64 {
            return Err(Error::MmfCorrupt("recorded size does not match the file"));
        }
        let data = data_base(self.total_size) as u64;

        let index_offset = self.read_u64(OFF_INDEX_OFFSET) as usize;
        if index_offset != ROOT_HEADER_LEN {
            // The index was relocated by growth: it must be a stamped region
            // inside the data region.
            if index_offset % 16 != 0
                || (index_offset as u64) < data + BlockHeader::LEN as u64
                || index_offset >= self.total_size
            {
                return Err(Error::MmfCorrupt("free-space index outside the data region"));
            }
            // SAFETY: The offset was just bounds-checked against the mapping.
            let region = unsafe { self.header_at((index_offset - BlockHeader::LEN) as u64).as_ref() };
            let region_len = region.payload_len();
            if region.class() != CLASS_INDEX
                || region_len < 2 * RUN_ENTRY_LEN
                || region_len % RUN_ENTRY_LEN != 0
                || index_offset + region_len > self.total_size
            {
                return Err(Error::MmfCorrupt("malformed free-space index region"));
            }
        }

        // The run index must be sorted, 16-granular, in-bounds and
        // non-overlapping.
        let mut previous_end = data;
        for (offset, length) in self.read_runs() {
            if length == 0 || offset % 16 != 0 || length % 16 != 0 {
                return Err(Error::MmfCorrupt("malformed free run"));
            }
            if offset < previous_end {
                return Err(Error::MmfCorrupt("free runs overlap or are unsorted"));
            }
            let Some(end) = offset.checked_add(length) else {
                return Err(Error::MmfCorrupt("free run overflows"));
            };
            if end > self.total_size as u64 {
                return Err(Error::MmfCorrupt("free run outside the file"));
            }
            previous_end = end;
        }

        Ok(())
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0_u8; 4];
        // SAFETY: All fixed header offsets lie within the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), bytes.as_mut_ptr(), 4);
        }
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        // SAFETY: All fixed header offsets lie within the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), self.base.as_ptr().add(offset), 4);
        }
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0_u8; 8];
        // SAFETY: All fixed header offsets lie within the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), bytes.as_mut_ptr(), 8);
        }
        u64::from_le_bytes(bytes)
    }

    fn write_u64(&self, offset: usize, value: u64) {
        // SAFETY: All fixed header offsets lie within the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), self.base.as_ptr().add(offset), 8);
        }
    }

    /// The embedded control guarding every metadata update.
    fn metadata_control(&self) -> &AccessControl {
        // SAFETY: The control state sits at a fixed, 4-aligned header offset
        // and consists entirely of atomics.
        unsafe { &*self.base.as_ptr().add(OFF_ACCESS_CONTROL).cast::<AccessControl>() }
    }

    /// First byte of the current index entries, from the root header field.
    fn index_offset(&self) -> usize {
        self.read_u64(OFF_INDEX_OFFSET) as usize
    }

    /// Entry capacity of the current index region (one terminator slot is
    /// always held back).
    fn index_capacity(&self) -> usize {
        let offset = self.index_offset();
        if offset == ROOT_HEADER_LEN {
            return initial_index_capacity(self.total_size);
        }

        // Carved regions are stamped with a block header whose payload
        // length is the region size.
        // SAFETY: The offset was validated at open or written by us.
        let region = unsafe { self.header_at((offset - BlockHeader::LEN) as u64).as_ref() };
        region.payload_len() / RUN_ENTRY_LEN - 1
    }

    fn read_runs(&self) -> Vec<(u64, u64)> {
        let base = self.index_offset();
        let capacity = self.index_capacity();
        let mut runs = Vec::new();

        for index in 0..capacity {
            let entry = base + index * RUN_ENTRY_LEN;
            let offset = self.read_u64(entry);
            let length = self.read_u64(entry + 8);
            if offset == 0 && length == 0 {
                break;
            }
            runs.push((offset, length));
        }

        runs
    }

    /// Writes the run list plus the zero-pair terminator. The caller keeps
    /// `runs.len()` within the index capacity.
    fn write_runs(&self, runs: &[(u64, u64)]) {
        debug_assert!(runs.len() <= self.index_capacity());

        let base = self.index_offset();
        for (index, &(offset, length)) in runs.iter().enumerate() {
            let entry = base + index * RUN_ENTRY_LEN;
            self.write_u64(entry, offset);
            self.write_u64(entry + 8, length);
        }
        let terminator = base + runs.len() * RUN_ENTRY_LEN;
        self.write_u64(terminator, 0);
        self.write_u64(terminator + 8, 0);
    }

    /// Relocates the index to a larger region carved from the tail of the
    /// file when the run list no longer fits the current one. Called with
    /// the metadata control held, before the runs are written back.
    fn ensure_index_fits(&self, runs: &mut Vec<(u64, u64)>) {
        let capacity = self.index_capacity();
        if runs.len() <= capacity {
            return;
        }

        // Double, and leave headroom for the runs the relocation itself may
        // add.
        let new_capacity = (capacity * 2).max(runs.len() + 64);
        let needed = (BlockHeader::LEN + (new_capacity + 1) * RUN_ENTRY_LEN) as u64;

        // Carve from the tail-most run large enough to host the new region.
        let Some(donor) = runs.iter().rposition(|&(_, length)| length >= needed) else {
            // No run can host a larger index: the file is out of metadata
            // space. Drop the smallest run to stay within the region; its
            // bytes become unreachable for the life of the file.
            if let Some(smallest) = runs
                .iter()
                .enumerate()
                .min_by_key(|&(_, &(_, length))| length)
                .map(|(index, _)| index)
            {
                let (offset, length) = runs[smallest];
                error!(offset, length, "free-run index full and ungrowable; dropping the smallest free run");
                runs.remove(smallest);
            }
            return;
        };

        runs[donor].1 -= needed;
        let region_offset = runs[donor].0 + runs[donor].1;
        if runs[donor].1 == 0 {
            runs.remove(donor);
        }

        // Stamp the region like a block so later openers can derive its
        // capacity from the header and it is never mistaken for free space.
        let region = self.header_at(region_offset);
        // SAFETY: The carved region lies inside the data region of our
        // mapping.
        unsafe { region.as_ref() }.initialize(CLASS_INDEX, (new_capacity + 1) * RUN_ENTRY_LEN);

        let old_offset = self.index_offset();
        self.write_u64(OFF_INDEX_OFFSET, region_offset + BlockHeader::LEN as u64);

        // A superseded carved region goes back to the free list; the
        // original region behind the root header is plain metadata and
        // stays behind.
        if old_offset != ROOT_HEADER_LEN {
            let old_region_offset = (old_offset - BlockHeader::LEN) as u64;
            // SAFETY: Superseded index regions lie inside our mapping.
            let old_region_len = unsafe { self.header_at(old_region_offset).as_ref() }.payload_len();
            insert_run(runs, old_region_offset, (BlockHeader::LEN + old_region_len) as u64);
        }

        debug!(new_capacity, region_offset, "free-run index grown from the file tail");
    }

    fn header_at(&self, header_offset: u64) -> NonNull<BlockHeader> {
        // SAFETY: Callers pass offsets inside the data region; headers are
        // 16-aligned by construction.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(header_offset as usize).cast::<BlockHeader>()) }
    }

    /// Validates that a handle is a live block of this manager and returns
    /// its header and header offset.
    fn live_header(&self, block: &MemoryBlock) -> Result<(&BlockHeader, u64)> {
        if block.manager_id() != self.id {
            return Err(Error::Disposed);
        }
        let header_ptr = block.header_ptr().ok_or(Error::Disposed)?;

        let address = header_ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        if address < base + data_base(self.total_size) || address >= base + self.total_size {
            return Err(Error::Disposed);
        }

        // SAFETY: The pointer targets our mapping, which lives as long as we
        // do.
        let header = unsafe { header_ptr.as_ref() };
        if header.refcount() == 0 {
            return Err(Error::Disposed);
        }

        Ok((header, (address - base) as u64))
    }

    /// The payload offset of a block, suitable for handing to another
    /// process sharing the file (see [`block_at`][Self::block_at]).
    pub fn offset_of(&self, block: &MemoryBlock) -> Result<u64> {
        let (_, header_offset) = self.live_header(block)?;

        Ok(header_offset + BlockHeader::LEN as u64)
    }

    /// Resolves a payload offset - typically received from another process -
    /// to a block handle. The offset must name a currently allocated block.
    pub fn block_at(&self, payload_offset: u64) -> Result<MemoryBlock> {
        let Some(header_offset) = payload_offset.checked_sub(BlockHeader::LEN as u64) else {
            return Err(Error::Disposed);
        };
        if header_offset % 16 != 0
            || header_offset < data_base(self.total_size) as u64
            || payload_offset >= self.total_size as u64
        {
            return Err(Error::Disposed);
        }

        let header_ptr = self.header_at(header_offset);
        // SAFETY: The offset lies inside our mapping.
        let header = unsafe { header_ptr.as_ref() };
        if header.flags() & BlockHeader::FLAG_ALLOCATED == 0
            || header.refcount() == 0
            || header.class() == CLASS_INDEX
        {
            return Err(Error::Disposed);
        }

        Ok(MemoryBlock::from_raw(header_ptr, self.id))
    }

    /// Total bytes currently on the free-run index.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        let entered = self.metadata_control().enter_shared(None);
        debug_assert!(entered, "shared entry without a deadline cannot fail");

        let total = self.read_runs().iter().map(|&(_, length)| length).sum::<u64>() as usize;

        self.metadata_control().exit_shared();
        total
    }

    /// The current free runs as `(offset, length)` pairs.
    #[must_use]
    pub fn free_runs(&self) -> Vec<(u64, u64)> {
        let entered = self.metadata_control().enter_shared(None);
        debug_assert!(entered, "shared entry without a deadline cannot fail");

        let runs = self.read_runs();

        self.metadata_control().exit_shared();
        runs
    }

    /// The file this manager maps.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total size of the file and mapping in bytes.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Pid recorded by the creating process.
    #[must_use]
    pub fn creator_pid(&self) -> u32 {
        self.read_u32(OFF_CREATOR_PID)
    }

    /// Runs `f` on the run list under the exclusive metadata control.
    fn with_runs_exclusive<R>(&self, f: impl FnOnce(&mut Vec<(u64, u64)>) -> R) -> R {
        let entered = self.metadata_control().enter_exclusive(&*self.provider, None);
        debug_assert!(entered, "exclusive entry without a deadline cannot fail");

        let mut runs = self.read_runs();
        let result = f(&mut runs);
        self.ensure_index_fits(&mut runs);
        self.write_runs(&runs);

        self.metadata_control().exit_exclusive();
        result
    }
}

impl MemoryManager for MmfMemoryManager {
    fn allocate(&self, len: usize) -> Result<MemoryBlock> {
        if len == 0 {
            return Err(Error::InvalidSize("cannot allocate an empty block"));
        }

        let need = (BlockHeader::LEN + round_up_16(len)) as u64;

        let header_offset = self.with_runs_exclusive(|runs| {
            // Best fit: the smallest run that still covers the request.
            let best = runs
                .iter()
                .enumerate()
                .filter(|&(_, &(_, length))| length >= need)
                .min_by_key(|&(_, &(_, length))| length)
                .map(|(index, _)| index);

            let Some(index) = best else {
                return Err(Error::OutOfMemory { requested: len });
            };

            let (offset, length) = runs[index];
            if length == need {
                runs.remove(index);
            } else {
                runs[index] = (offset + need, length - need);
            }
            Ok(offset)
        })?;

        let header_ptr = self.header_at(header_offset);
        // SAFETY: The carved run lies inside our mapping.
        unsafe { header_ptr.as_ref() }.initialize(0, len);

        Ok(MemoryBlock::from_raw(header_ptr, self.id))
    }

    fn resize(&self, block: MemoryBlock, new_len: usize) -> Result<MemoryBlock> {
        if new_len == 0 {
            return Err(Error::InvalidSize("cannot resize a block to zero length"));
        }

        let (header, header_offset) = self.live_header(&block)?;
        let old_capacity = header.capacity() as u64;
        let new_capacity = round_up_16(new_len) as u64;

        if new_capacity == old_capacity {
            header.set_payload_len(new_len);
            return Ok(block);
        }

        let block_end = header_offset + BlockHeader::LEN as u64 + old_capacity;

        let resized_in_place = self.with_runs_exclusive(|runs| {
            if new_capacity < old_capacity {
                // Shrink: the trailing capacity becomes a free run.
                header.set_payload_len(new_len);
                insert_run(runs, header_offset + BlockHeader::LEN as u64 + new_capacity, old_capacity - new_capacity);
                return true;
            }

            // Grow: consume the front of the directly adjacent free run,
            // when there is one large enough.
            let extra = new_capacity - old_capacity;
            let adjacent = runs.iter().position(|&(offset, length)| offset == block_end && length >= extra);
            if let Some(index) = adjacent {
                let (offset, length) = runs[index];
                if length == extra {
                    runs.remove(index);
                } else {
                    runs[index] = (offset + extra, length - extra);
                }
                header.set_payload_len(new_len);
                return true;
            }

            false
        });
        if resized_in_place {
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
        // SAFETY: Blocks of this manager point into our mapping.
        let header = unsafe { header_ptr.as_ref() };

        let address = header_ptr.as_ptr() as usize;
        let header_offset = (address - self.base.as_ptr() as usize) as u64;
        let run_length = (BlockHeader::LEN + header.capacity()) as u64;
        header.clear_allocated();

        self.with_runs_exclusive(|runs| {
            insert_run(runs, header_offset, run_length);
        });
    }

    fn store(&self) -> &UnmanagedDataStore {
        &self.store
    }

    fn manager_id(&self) -> u32 {
        self.id
    }
}

impl Drop for MmfMemoryManager {
    fn drop(&mut self) {
        deregister_manager(self.id);

        // SAFETY: Mapped by us with exactly this base and length; nothing
        // may use blocks of a dropped manager.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.total_size);
        }
        // SAFETY: Owned descriptor, opened by us.
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn open_fd(path: &Path, flags: libc::c_int) -> Result<libc::c_int> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Io(std::io::Error::from(std::io::ErrorKind::InvalidFilename)))?;

    // SAFETY: c_path is a valid NUL-terminated string.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags | libc::O_CLOEXEC, 0o600_u32) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(fd)
}

fn flock(fd: libc::c_int, operation: libc::c_int) -> Result<()> {
    // SAFETY: Owned descriptor.
    if unsafe { libc::flock(fd, operation) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(())
}

fn map_shared(fd: libc::c_int, size: usize) -> Result<NonNull<u8>> {
    // SAFETY: Mapping a shared file view with no fixed address request.
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error().into());
    }

    NonNull::new(raw.cast::<u8>()).ok_or_else(|| std::io::Error::last_os_error().into())
}

/// Closes the descriptor unless defused with `mem::forget`.
struct FdGuard(libc::c_int);

impl Drop for FdGuard {
    fn drop(&mut self) {
        // SAFETY: Owned descriptor that nobody else closed.
        unsafe {
            libc::close(self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;
    use tempfile::TempDir;

    use super::*;

    fn file_in(dir: &TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(MmfMemoryManager: Send, Sync);
    }

    #[test]
    fn rejects_undersized_files() {
        let dir = TempDir::new().expect("temp dir");

        let result = MmfMemoryManager::create(file_in(&dir, "tiny.mmf"), 100);
        assert!(matches!(result, Err(Error::InvalidSize(_))));
    }

    #[test]
    fn create_then_open_round_trips_the_header() {
        let dir = TempDir::new().expect("temp dir");
        let path = file_in(&dir, "header.mmf");

        let created = MmfMemoryManager::create(&path, 1 << 20).expect("create");
        assert_eq!(created.total_size(), 1 << 20);
        assert_eq!(created.creator_pid(), std::process::id());
        let initial_free = created.free_bytes();
        drop(created);

        let opened = MmfMemoryManager::open(&path).expect("open");
        assert_eq!(opened.total_size(), 1 << 20);
        assert_eq!(opened.creator_pid(), std::process::id());
        assert_eq!(opened.free_bytes(), initial_free);
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let dir = TempDir::new().expect("temp dir");
        let path = file_in(&dir, "magic.mmf");

        drop(MmfMemoryManager::create(&path, MIN_FILE_SIZE).expect("create"));
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).expect("reopen");
            file.seek(SeekFrom::Start(0)).expect("seek");
            file.write_all(b"NOT-A-TOMATE-MMF").expect("overwrite magic");
        }

        assert!(matches!(MmfMemoryManager::open(&path), Err(Error::MmfCorrupt("bad magic"))));
    }

    #[test]
    fn allocates_and_frees_with_coalescing() {
        let dir = TempDir::new().expect("temp dir");
        let manager = MmfMemoryManager::create(file_in(&dir, "alloc.mmf"), 1 << 20).expect("create");

        let initial_free = manager.free_bytes();
        assert_eq!(manager.free_runs().len(), 1);

        let blocks: Vec<_> = (0..4).map(|_| manager.allocate(1000).expect("allocation fits")).collect();
        for block in &blocks {
            assert_eq!(block.refcount(), 1);
            assert_eq!(block.payload_len(), 1000);
            assert_eq!(block.segment().as_ptr().as_ptr() as usize % 16, 0);
        }
        assert_eq!(manager.free_bytes(), initial_free - 4 * (16 + 1008));

        // Free in a scattered order; coalescing must fold everything back
        // into the single original run.
        for index in [1, 3, 0, 2] {
            let mut block = blocks[index];
            assert!(block.release().expect("live block"));
        }
        assert_eq!(manager.free_bytes(), initial_free);
        assert_eq!(manager.free_runs().len(), 1);
    }

    #[test]
    fn out_of_memory_reports_and_leaves_state() {
        let dir = TempDir::new().expect("temp dir");
        let manager = MmfMemoryManager::create(file_in(&dir, "oom.mmf"), MIN_FILE_SIZE).expect("create");

        let free = manager.free_bytes();
        assert!(matches!(
            manager.allocate(MIN_FILE_SIZE),
            Err(Error::OutOfMemory { requested }) if requested == MIN_FILE_SIZE
        ));
        assert_eq!(manager.free_bytes(), free);
    }

    #[test]
    fn resize_shrinks_and_grows_in_place() {
        let dir = TempDir::new().expect("temp dir");
        let manager = MmfMemoryManager::create(file_in(&dir, "resize.mmf"), 1 << 20).expect("create");

        let block = manager.allocate(4096).expect("allocation fits");
        let address = block.segment().as_ptr().as_ptr() as usize;
        // SAFETY: The block is live and nobody else touches it.
        let segment = block.segment();
        unsafe { segment.as_mut_slice() }.fill(0xC3);

        // Shrink in place: address stays, the trailing capacity is freed.
        let block = block.resize(1024).expect("shrink");
        assert_eq!(block.segment().as_ptr().as_ptr() as usize, address);
        assert_eq!(block.payload_len(), 1024);

        // Grow in place: the run we just released is directly adjacent.
        let block = block.resize(2048).expect("grow");
        assert_eq!(block.segment().as_ptr().as_ptr() as usize, address);
        assert_eq!(block.payload_len(), 2048);
        // SAFETY: The block is live and nobody else touches it.
        let segment = block.segment();
        assert!(unsafe { segment.as_slice() }[..1024].iter().all(|&b| b == 0xC3));

        let mut block = block;
        assert!(block.release().expect("live block"));
    }

    #[test]
    fn resize_falls_back_to_copy_when_blocked() {
        let dir = TempDir::new().expect("temp dir");
        let manager = MmfMemoryManager::create(file_in(&dir, "copy.mmf"), 1 << 20).expect("create");

        let first = manager.allocate(1024).expect("allocation fits");
        // A second allocation sits directly behind the first, blocking
        // in-place growth.
        let second = manager.allocate(1024).expect("allocation fits");

        // SAFETY: The block is live and nobody else touches it.
        let first_segment = first.segment();
        unsafe { first_segment.as_mut_slice() }.fill(0x7E);
        let old_address = first.segment().as_ptr().as_ptr() as usize;

        let grown = first.resize(8192).expect("copying resize");
        assert_ne!(grown.segment().as_ptr().as_ptr() as usize, old_address);
        assert_eq!(grown.payload_len(), 8192);
        // SAFETY: The block is live and nobody else touches it.
        let grown_segment = grown.segment();
        assert!(unsafe { grown_segment.as_slice() }[..1024].iter().all(|&b| b == 0x7E));
        assert!(first.is_disposed());

        let mut grown = grown;
        let mut second = second;
        assert!(grown.release().expect("live block"));
        assert!(second.release().expect("live block"));
    }

    #[test]
    fn index_grows_from_the_tail_when_fragmentation_overflows_it() {
        let dir = TempDir::new().expect("temp dir");
        let path = file_in(&dir, "fragment.mmf");
        let manager = MmfMemoryManager::create(&path, 1 << 20).expect("create");

        let initial_free = manager.free_bytes();
        let initial_capacity = initial_index_capacity(manager.total_size());
        // One doubling is enough for the fragment count below.
        let index_region_bytes = BlockHeader::LEN + (initial_capacity * 2 + 1) * RUN_ENTRY_LEN;

        // More disjoint fragments than the initial index region can hold:
        // freeing every other block leaves each freed extent surrounded by
        // allocated neighbors, so nothing coalesces.
        let block_count = (initial_capacity + 1) * 2;
        let extent = BlockHeader::LEN + 32;
        let blocks: Vec<_> = (0..block_count).map(|_| manager.allocate(32).expect("allocation fits")).collect();

        for block in blocks.iter().skip(1).step_by(2) {
            let mut block = *block;
            assert!(block.release().expect("live block"));
        }

        // Every freed fragment is still tracked: the index relocated to a
        // larger region carved from the file tail instead of dropping runs.
        let odd_count = block_count / 2;
        assert_eq!(manager.free_runs().len(), odd_count + 1);
        assert_eq!(manager.free_bytes(), initial_free - odd_count * extent - index_region_bytes);

        // A mapping opened after the relocation validates and agrees.
        let reader = MmfMemoryManager::open(&path).expect("open survives a relocated index");
        assert_eq!(reader.free_bytes(), manager.free_bytes());

        // Freeing the rest coalesces everything back into one run; only the
        // carved index region stays out of the free set.
        for block in blocks.iter().step_by(2) {
            let mut block = *block;
            assert!(block.release().expect("live block"));
        }
        assert_eq!(manager.free_runs().len(), 1);
        assert_eq!(manager.free_bytes(), initial_free - index_region_bytes);

        // The relocated index keeps serving allocations.
        let mut late = reader.allocate(1000).expect("allocation fits");
        assert!(late.release().expect("live block"));
        assert_eq!(reader.free_bytes(), initial_free - index_region_bytes);
    }

    #[test]
    fn creator_pid_comes_from_the_provider() {
        use std::sync::Arc as StdArc;

        use tomate_sync::{FakeProcessProvider, register_process_provider};

        let provider_id = register_process_provider(StdArc::new(FakeProcessProvider::new(77)));
        let dir = TempDir::new().expect("temp dir");

        let manager = MmfMemoryManager::create_with_provider(file_in(&dir, "pid.mmf"), MIN_FILE_SIZE, provider_id)
            .expect("create");

        assert_eq!(manager.creator_pid(), 77);
        assert!(matches!(
            MmfMemoryManager::open_with_provider(manager.path(), 9999),
            Err(Error::Sync(tomate_sync::Error::UnknownProvider(9999)))
        ));
    }

    #[test]
    fn offsets_round_trip_between_managers() {
        let dir = TempDir::new().expect("temp dir");
        let path = file_in(&dir, "offsets.mmf");

        let writer = MmfMemoryManager::create(&path, 1 << 20).expect("create");
        let block = writer.allocate(256).expect("allocation fits");
        let offset = writer.offset_of(&block).expect("live block");

        // A second mapping of the same file (as another process would have)
        // resolves the offset to the same bytes.
        let reader = MmfMemoryManager::open(&path).expect("open");
        let view = reader.block_at(offset).expect("allocated block");
        assert_eq!(view.payload_len(), 256);
        assert_eq!(view.refcount(), 1);

        assert!(matches!(reader.block_at(8), Err(Error::Disposed)));

        let mut block = block;
        assert!(block.release().expect("live block"));
        assert!(matches!(reader.block_at(offset), Err(Error::Disposed)));
    }
}

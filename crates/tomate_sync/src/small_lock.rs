// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU64, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::{BurnWait, Error, ProcessProvider, Result, current_thread_id, full_lock_id, process_provider};

/// Length in bytes of the lock header at the start of the state span.
///
/// The header fields occupy 28 bytes; 4 pad bytes keep the ring entries that
/// follow 8-aligned.
pub const SMALL_LOCK_HEADER_LEN: usize = 32;

/// Documented maximum queue capacity: the largest count expressible in the
/// header's 16-bit `capacity` and `count` fields.
pub const MAX_CAPACITY: usize = u16::MAX as usize;

/// How many spin iterations pass between liveness checks on the current
/// holder. Liveness is a syscall on the native provider, so probing it every
/// pause would dominate the wait loop.
const LIVENESS_PROBE_INTERVAL: u32 = 1024;

#[repr(C)]
struct SmallLockHeader {
    /// Full lock id of the current holder, 0 when free. Equals the entry at
    /// `head` whenever `count > 0`.
    locked_by: AtomicU64,
    /// Nested acquisitions by the current holder. Touched only by the holder.
    reentrancy: AtomicI32,
    /// Process-provider registry id supplied by the creator; mappers joining
    /// later read it from here.
    provider_id: AtomicI32,
    /// Spin flag guarding every queue mutation (enqueue, dequeue, removal).
    queue_access: AtomicI32,
    head: AtomicU16,
    tail: AtomicU16,
    capacity: AtomicU16,
    count: AtomicU16,
    _pad: [u8; 4],
}

const _: () = assert!(size_of::<SmallLockHeader>() == SMALL_LOCK_HEADER_LEN);
const _: () = assert!(align_of::<SmallLockHeader>() == 8);

/// Outcome of a [`SmallLock`] acquisition attempt.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EnterStatus {
    /// Whether the lock was acquired. False means the deadline elapsed; the
    /// caller was removed from the queue and owns nothing.
    pub acquired: bool,
    /// Whether acquisition involved splicing a crashed holder out of the
    /// queue.
    pub resumed_on_crashed_process: bool,
}

impl EnterStatus {
    const fn newly_acquired(resumed_on_crashed_process: bool) -> Self {
        Self {
            acquired: true,
            resumed_on_crashed_process,
        }
    }

    const fn timed_out() -> Self {
        Self {
            acquired: false,
            resumed_on_crashed_process: false,
        }
    }
}

/// A fixed-capacity, FIFO-fair, reentrant lock living in caller-provided
/// memory.
///
/// The entire state - header plus a ring buffer of queued full lock ids - is
/// placed in a span the caller supplies, so the lock can sit inside a
/// memory-mapped file and be contended by unrelated processes. Waiters are
/// served strictly in enqueue order.
///
/// # Holder identity
///
/// A holder is identified by the 64-bit full lock id packing the process id
/// (from the [`ProcessProvider`] whose registry id is stored in the header)
/// with a caller-chosen lock id, defaulting to the current thread id.
/// Acquisitions by the current holder nest; each [`enter`][Self::enter] is
/// paired with one [`exit`][Self::exit].
///
/// # Crash recovery
///
/// If the holding process dies, the first waiter in line detects it through
/// the provider's liveness check, splices the dead holder out of the queue
/// and takes the lock, reporting
/// [`resumed_on_crashed_process`][EnterStatus::resumed_on_crashed_process].
/// Only the entry directly behind the queue head performs the splice, so
/// exactly one repair happens no matter how many waiters observe the death.
///
/// # Capacity
///
/// Derived from the span: `(len - SMALL_LOCK_HEADER_LEN) / 8`, clamped to
/// 65535 (the largest count the header's 16-bit fields can express). The
/// holder occupies one queue entry, so a lock with capacity N admits N - 1
/// waiters; the next acquirer fails with
/// [`ConcurrencyExceeded`][Error::ConcurrencyExceeded] without being
/// enqueued.
#[derive(Debug)]
pub struct SmallLock {
    header: NonNull<SmallLockHeader>,
    provider: Arc<dyn ProcessProvider>,
}

// SAFETY: All state behind the pointer is atomics, mutated under the
// queue-access flag; the construction contract guarantees the span outlives
// the lock.
unsafe impl Send for SmallLock {}

// SAFETY: See the Send impl.
unsafe impl Sync for SmallLock {}

impl SmallLock {
    /// Initializes lock state in the given span and returns the lock.
    ///
    /// The span must be 8-aligned and long enough for the header and at least
    /// one ring entry. `provider_id` names the process provider in the
    /// process-wide registry; it is stored in the header so later mappers can
    /// resolve it via [`open`][Self::open].
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr..ptr + len` is valid for reads and
    /// writes for the lifetime of every `SmallLock` over it, and that no
    /// other live lock state occupies the span at the time of the call.
    pub unsafe fn create(ptr: NonNull<u8>, len: usize, provider_id: i32) -> Result<Self> {
        let capacity = Self::validate_span(ptr, len)?;
        let provider = process_provider(provider_id).ok_or(Error::UnknownProvider(provider_id))?;

        // SAFETY: The span is valid per the caller's contract and large
        // enough per validate_span; zeroing produces a valid all-free state.
        unsafe {
            ptr.as_ptr().write_bytes(0, SMALL_LOCK_HEADER_LEN + capacity * 8);
        }

        let header = ptr.cast::<SmallLockHeader>();
        // SAFETY: Freshly zeroed, properly aligned header memory.
        let header_ref = unsafe { header.as_ref() };
        header_ref.capacity.store(capacity as u16, Ordering::Relaxed);
        header_ref.provider_id.store(provider_id, Ordering::Release);

        Ok(Self { header, provider })
    }

    /// Joins lock state previously initialized by [`create`][Self::create],
    /// typically from another process mapping the same memory.
    ///
    /// The process provider is resolved from the registry id stored in the
    /// header.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr..ptr + len` is valid for reads and
    /// writes for the lifetime of every `SmallLock` over it, and that the
    /// span holds state initialized by `create` with the same length.
    pub unsafe fn open(ptr: NonNull<u8>, len: usize) -> Result<Self> {
        let span_capacity = Self::validate_span(ptr, len)?;

        let header = ptr.cast::<SmallLockHeader>();
        // SAFETY: Initialized header per the caller's contract.
        let header_ref = unsafe { header.as_ref() };

        let capacity = usize::from(header_ref.capacity.load(Ordering::Relaxed));
        if capacity == 0 || capacity > span_capacity {
            return Err(Error::InvalidSpan("stored capacity does not fit the span"));
        }

        let provider_id = header_ref.provider_id.load(Ordering::Acquire);
        let provider = process_provider(provider_id).ok_or(Error::UnknownProvider(provider_id))?;

        Ok(Self { header, provider })
    }

    fn validate_span(ptr: NonNull<u8>, len: usize) -> Result<usize> {
        if ptr.as_ptr() as usize % align_of::<SmallLockHeader>() != 0 {
            return Err(Error::InvalidSpan("span is not 8-aligned"));
        }
        let Some(entry_bytes) = len.checked_sub(SMALL_LOCK_HEADER_LEN) else {
            return Err(Error::InvalidSpan("span is shorter than the lock header"));
        };
        let capacity = (entry_bytes / 8).min(MAX_CAPACITY);
        if capacity == 0 {
            return Err(Error::InvalidSpan("span has no room for queue entries"));
        }

        Ok(capacity)
    }

    /// Bytes of span a lock with the given queue capacity needs.
    #[must_use]
    pub const fn span_len_for_capacity(capacity: usize) -> usize {
        SMALL_LOCK_HEADER_LEN + capacity * 8
    }

    fn header(&self) -> &SmallLockHeader {
        // SAFETY: Valid for the lifetime of self per the construction
        // contract.
        unsafe { self.header.as_ref() }
    }

    fn entry(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < usize::from(self.header().capacity.load(Ordering::Relaxed)));

        // SAFETY: The entries follow the header within the span validated at
        // construction; index is below capacity.
        unsafe { &*self.header.as_ptr().add(1).cast::<AtomicU64>().add(index) }
    }

    /// Acquires the queue-access spin flag. Critical sections under it are
    /// bounded straight-line queue manipulation, so an unbounded spin here
    /// terminates.
    fn lock_queue(&self) {
        while self
            .header()
            .queue_access
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock_queue(&self) {
        self.header().queue_access.store(0, Ordering::Release);
    }

    /// Acquires the lock with the current thread id as the lock id.
    pub fn enter(&self, max_wait: Option<Duration>) -> Result<EnterStatus> {
        self.enter_as(current_thread_id(), max_wait)
    }

    /// Acquires the lock under an explicit lock id.
    ///
    /// Returns [`EnterStatus::acquired`] false when `max_wait` elapsed first;
    /// the caller is removed from the queue and the lock state is as if the
    /// call never happened. Fails with
    /// [`ConcurrencyExceeded`][Error::ConcurrencyExceeded] when the queue is
    /// full, without enqueuing.
    pub fn enter_as(&self, lock_id: u32, max_wait: Option<Duration>) -> Result<EnterStatus> {
        let my_id = full_lock_id(&*self.provider, lock_id);
        let header = self.header();

        self.lock_queue();

        // Reentry by the current holder.
        if header.locked_by.load(Ordering::Relaxed) == my_id {
            header.reentrancy.fetch_add(1, Ordering::Relaxed);
            self.unlock_queue();
            return Ok(EnterStatus::newly_acquired(false));
        }

        let count = usize::from(header.count.load(Ordering::Relaxed));
        let capacity = usize::from(header.capacity.load(Ordering::Relaxed));

        // Uncontended: the queue is empty, so the identity CAS cannot fail
        // under the queue flag.
        if count == 0
            && header
                .locked_by
                .compare_exchange(0, my_id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.enqueue(my_id);
            header.reentrancy.store(1, Ordering::Relaxed);
            self.unlock_queue();
            return Ok(EnterStatus::newly_acquired(false));
        }

        if count >= capacity {
            self.unlock_queue();
            return Err(Error::ConcurrencyExceeded);
        }

        self.enqueue(my_id);
        self.unlock_queue();

        self.wait_in_line(my_id, max_wait)
    }

    /// Spins until the lock is handed to `my_id`, the holder's process dies
    /// with us first in line, or the deadline elapses.
    fn wait_in_line(&self, my_id: u64, max_wait: Option<Duration>) -> Result<EnterStatus> {
        let header = self.header();
        let burn = BurnWait::new(max_wait);
        let mut iterations = 0_u32;

        loop {
            if header.locked_by.load(Ordering::Acquire) == my_id {
                header.reentrancy.store(1, Ordering::Relaxed);
                return Ok(EnterStatus::newly_acquired(false));
            }

            iterations = iterations.wrapping_add(1);
            if iterations % LIVENESS_PROBE_INTERVAL == 0 && self.try_resume_from_dead_holder(my_id) {
                return Ok(EnterStatus::newly_acquired(true));
            }

            if !burn.wait() {
                if let Some(status) = self.abandon_wait(my_id) {
                    return Ok(status);
                }
                return Ok(EnterStatus::timed_out());
            }
        }
    }

    /// Splices a dead holder out of the queue if - re-verified under the
    /// queue flag - the holder's process is gone and we are the entry
    /// directly behind the head. Returns whether the lock is now ours.
    fn try_resume_from_dead_holder(&self, my_id: u64) -> bool {
        let header = self.header();

        let holder = header.locked_by.load(Ordering::Acquire);
        if holder == 0 || self.provider.is_process_alive(holder_pid(holder)) {
            return false;
        }

        self.lock_queue();

        let count = usize::from(header.count.load(Ordering::Relaxed));
        let capacity = usize::from(header.capacity.load(Ordering::Relaxed));
        let head = usize::from(header.head.load(Ordering::Relaxed));
        let next = (head + 1) % capacity;

        let resumed = count >= 2
            && header.locked_by.load(Ordering::Relaxed) == holder
            && self.entry(head).load(Ordering::Relaxed) == holder
            && self.entry(next).load(Ordering::Relaxed) == my_id;

        if resumed {
            header.head.store(next as u16, Ordering::Relaxed);
            header.count.store((count - 1) as u16, Ordering::Relaxed);
            header.reentrancy.store(1, Ordering::Relaxed);
            header.locked_by.store(my_id, Ordering::Release);

            warn!(
                holder,
                pid = holder_pid(holder),
                "lock holder process died; first waiter spliced it out and resumed"
            );
        }

        self.unlock_queue();
        resumed
    }

    /// Removes a timed-out waiter from the queue. Returns an acquired status
    /// instead if the lock was handed to us in the meantime.
    fn abandon_wait(&self, my_id: u64) -> Option<EnterStatus> {
        let header = self.header();

        self.lock_queue();

        // The hand-off may have happened after the deadline check; honor it.
        if header.locked_by.load(Ordering::Relaxed) == my_id {
            header.reentrancy.store(1, Ordering::Relaxed);
            self.unlock_queue();
            return Some(EnterStatus::newly_acquired(false));
        }

        let capacity = usize::from(header.capacity.load(Ordering::Relaxed));
        let head = usize::from(header.head.load(Ordering::Relaxed));
        let count = usize::from(header.count.load(Ordering::Relaxed));

        // Shift everything behind us forward by one slot; waiters are never
        // at the head (that is the holder), so position 0 is not ours.
        for logical in 1..count {
            let physical = (head + logical) % capacity;
            if self.entry(physical).load(Ordering::Relaxed) != my_id {
                continue;
            }

            for shift in logical..count - 1 {
                let from = (head + shift + 1) % capacity;
                let to = (head + shift) % capacity;
                let value = self.entry(from).load(Ordering::Relaxed);
                self.entry(to).store(value, Ordering::Relaxed);
            }

            let tail = usize::from(header.tail.load(Ordering::Relaxed));
            header.tail.store(((tail + capacity - 1) % capacity) as u16, Ordering::Relaxed);
            header.count.store((count - 1) as u16, Ordering::Relaxed);
            break;
        }

        self.unlock_queue();
        None
    }

    fn enqueue(&self, id: u64) {
        let header = self.header();
        let capacity = usize::from(header.capacity.load(Ordering::Relaxed));
        let tail = usize::from(header.tail.load(Ordering::Relaxed));
        let count = usize::from(header.count.load(Ordering::Relaxed));

        self.entry(tail).store(id, Ordering::Relaxed);
        header.tail.store(((tail + 1) % capacity) as u16, Ordering::Relaxed);
        header.count.store((count + 1) as u16, Ordering::Relaxed);
    }

    /// Releases one level of the current thread's hold.
    pub fn exit(&self) -> Result<()> {
        self.exit_as(current_thread_id())
    }

    /// Releases one level of the hold identified by `lock_id`.
    ///
    /// The outermost release dequeues the holder and hands the lock to the
    /// next waiter in line. Fails with [`BadHolder`][Error::BadHolder] when
    /// the caller does not hold the lock.
    pub fn exit_as(&self, lock_id: u32) -> Result<()> {
        let my_id = full_lock_id(&*self.provider, lock_id);
        let header = self.header();

        let holder = header.locked_by.load(Ordering::Acquire);
        if holder != my_id {
            return Err(Error::BadHolder { holder, caller: my_id });
        }

        // Only the holder touches the reentrancy counter.
        let remaining = header.reentrancy.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining > 0 {
            return Ok(());
        }

        self.lock_queue();

        let capacity = usize::from(header.capacity.load(Ordering::Relaxed));
        let head = usize::from(header.head.load(Ordering::Relaxed));
        let count = usize::from(header.count.load(Ordering::Relaxed));
        debug_assert!(count > 0, "holder missing from its own queue");
        debug_assert_eq!(self.entry(head).load(Ordering::Relaxed), my_id);

        let new_head = (head + 1) % capacity;
        header.head.store(new_head as u16, Ordering::Relaxed);
        header.count.store((count - 1) as u16, Ordering::Relaxed);

        let next = if count - 1 > 0 {
            self.entry(new_head).load(Ordering::Relaxed)
        } else {
            0
        };
        header.locked_by.store(next, Ordering::Release);

        self.unlock_queue();
        Ok(())
    }

    /// Whether the calling thread currently holds the lock.
    #[must_use]
    pub fn is_entered(&self) -> bool {
        let my_id = full_lock_id(&*self.provider, current_thread_id());
        self.header().locked_by.load(Ordering::Acquire) == my_id
    }

    /// Nesting depth of the current holder; meaningful only to the holder.
    #[must_use]
    pub fn reentrancy(&self) -> i32 {
        self.header().reentrancy.load(Ordering::Relaxed)
    }

    /// The queue capacity, including the slot occupied by the holder.
    #[must_use]
    pub fn capacity(&self) -> usize {
        usize::from(self.header().capacity.load(Ordering::Relaxed))
    }

    /// Queue entries in use: the holder plus waiting acquirers.
    #[must_use]
    pub fn pending(&self) -> usize {
        usize::from(self.header().count.load(Ordering::Relaxed))
    }

    /// Full lock id of the current holder, or 0 when free.
    #[must_use]
    pub fn holder(&self) -> u64 {
        self.header().locked_by.load(Ordering::Acquire)
    }
}

const fn holder_pid(full_id: u64) -> u32 {
    (full_id >> 32) as u32
}

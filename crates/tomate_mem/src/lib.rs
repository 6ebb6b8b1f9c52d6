// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Reference-counted memory blocks over pluggable managers, with the most
//! important types being:
//!
//! * [`MemoryBlock`] - a copyable handle to a variable-size, reference-counted
//!   block allocated by a [`MemoryManager`]. Lifetime is explicit
//!   ([`add_ref`][MemoryBlock::add_ref] / [`release`][MemoryBlock::release]),
//!   so the count can live inside a memory-mapped file and persist across
//!   processes.
//! * [`HeapMemoryManager`] - the default backend: size-class segregated free
//!   lists over the process heap, each class guarded by its own exclusive
//!   access control, with a process-wide [`global`][HeapMemoryManager::global]
//!   instance.
//! * [`MmfMemoryManager`] - the same trait over a memory-mapped file: a
//!   persistent, offset-addressed free-run index inside the file, guarded by
//!   an embedded cross-process access control, so unrelated processes can
//!   allocate and free concurrently.
//! * [`UnmanagedDataStore`] - a generation-tagged slot table that hands out
//!   stable, typed, 64-bit [`Handle`]s to values placed in the owning
//!   manager's memory.
//!
//! Blocks are located through [`MemorySegment`]s - plain `(address, length)`
//! descriptors. Managers are addressed by registry id from block handles, so
//! handles stay plain data; a block whose manager has been dropped reports
//! [`Disposed`][Error::Disposed] instead of touching freed state.
//!
//! # Memory-mapped-file discipline
//!
//! Nothing stored inside the mapped file is a process-local pointer: block
//! headers, the free-run index and data-store slots are linked by offsets
//! from the mapping base, so every process sees valid state at its own view
//! address. Synchronization of the file's metadata uses the spin-based
//! primitives from `tomate_sync`, whose state is embedded in the file itself.

mod block;
mod error;
mod heap;
mod manager;
mod mmf;
mod segment;
mod store;

pub use block::MemoryBlock;
pub use error::{Error, Result};
pub use heap::HeapMemoryManager;
pub use manager::{MemoryManager, manager};
pub use mmf::MmfMemoryManager;
pub use segment::MemorySegment;
pub use store::{Handle, UnmanagedDataStore};

pub(crate) use block::BlockHeader;

// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Log-structured key-value store for raw flash partitions.
//!
//! # Specification
//!
//! The [store](KeyValueStore) provides a durable partial function from short
//! string keys to small byte values on top of a raw
//! [flash partition](FlashPartition): sectored media with no filesystem,
//! write-once semantics between erases, and erased bytes reading as `0xFF`.
//! It is designed for embedded devices: all RAM is allocated at
//! construction, capacities are fixed, and every operation is synchronous.
//!
//! The store provides the following operations:
//! -   [`put`](KeyValueStore::put) associates a value with a key, overwriting
//!     any previous value.
//! -   [`get`](KeyValueStore::get) reads the value associated with a key,
//!     optionally from an offset.
//! -   [`delete`](KeyValueStore::delete) removes a key.
//! -   [`value_size`](KeyValueStore::value_size) returns the size of the
//!     value associated with a key.
//! -   [`iter`](KeyValueStore::iter) iterates over the present keys.
//!
//! Mutations are durable once they return: a store that is torn down and
//! [re-initialized](KeyValueStore::init) — including by a power loss at an
//! arbitrary byte of a write — returns for each key the most recent value
//! whose write completed. An incompletely written entry fails its checksum
//! and is ignored in favor of the previous intact entry for the same key.
//!
//! # Implementation
//!
//! Every mutation appends an entry — a checksummed record of the key and
//! value, where a deletion is a tombstone entry — to the erased tail of some
//! sector. Each entry carries a transaction id drawn from a counter that
//! only moves forward; among all entries for a key, the one with the
//! largest id is authoritative. Nothing is modified in place, so the flash
//! is only ever erased a sector at a time by garbage collection, once every
//! entry in the sector has been superseded or relocated.
//!
//! Initialization scans all sectors entry by entry to rebuild the in-RAM
//! index (a table of per-key descriptors) and the per-sector accounting of
//! writable, valid, and recoverable bytes. Corrupt regions are skipped by
//! scanning for the next entry magic, their sector is quarantined from
//! future writes, and initialization reports
//! [`DataLoss`](StoreError::DataLoss) while the store stays usable.
//!
//! At least one sector is kept fully erased at all times, so garbage
//! collection always has a landing zone for the entries it relocates. The
//! allocator rotates which erased sector it picks next, spreading erase wear
//! across the partition.
//!
//! # Preconditions
//!
//! The store is single-threaded and does not lock; callers serialize access.
//! The partition is modified exclusively by the store. Keys are 1 to
//! [`MAX_KEY_LENGTH`] bytes; values and their entry overhead must fit in one
//! sector.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod alignment;
#[cfg(feature = "std")]
mod buffer;
mod cache;
mod checksum;
#[cfg(feature = "std")]
mod driver;
mod entry;
#[cfg(feature = "std")]
mod file;
mod format;
#[cfg(feature = "std")]
mod model;
mod partition;
mod sectors;
mod store;

#[cfg(feature = "std")]
pub use self::buffer::{BufferOptions, BufferPartition, CorruptFunction};
pub use self::checksum::{ChecksumAlgorithm, Crc16Ccitt, Crc32};
#[cfg(feature = "std")]
pub use self::driver::{
    DriverConfig, DriverStore, StoreDriver, StoreDriverOff, StoreDriverOn, StoreInterruption,
    StoreInvariant, DRIVER_FORMAT,
};
pub use self::entry::MAX_KEY_LENGTH;
#[cfg(feature = "std")]
pub use self::file::FilePartition;
pub use self::format::EntryFormat;
#[cfg(feature = "std")]
pub use self::model::{StoreModel, StoreOperation};
pub use self::partition::{Address, FlashPartition, PartitionError, PartitionResult};
pub use self::store::{
    ErrorRecovery, GarbageCollectOnWrite, Item, Iter, KeyValueStore, Options, StorageStats,
    StoreError, StoreResult, MAX_REDUNDANCY,
};

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

//! Flash partition for testing.
//!
//! [`BufferPartition`] implements the flash [`FlashPartition`] interface but
//! doesn't interface with an actual flash device. Instead it uses a buffer in
//! memory to represent the flash state.

use crate::partition::{Address, FlashPartition, PartitionError, PartitionResult};
use alloc::borrow::Borrow;
use alloc::boxed::Box;
use alloc::vec;

/// Simulates a flash partition using a buffer in memory.
///
/// This partition can be used in place of an actual flash device. It is
/// particularly useful for tests, for which it has dedicated functionality.
///
/// The partition tracks how many times each alignment unit is written between
/// erase cycles and how many times each sector is erased, and whether an
/// operation flips bits in the wrong direction. Violations panic when strict
/// mode is set. The partition also permits interrupting mutable operations
/// to simulate a power loss, optionally corrupting the interrupted operation.
#[derive(Clone)]
pub struct BufferPartition {
    /// Content of the partition.
    storage: Box<[u8]>,

    /// Options of the partition.
    options: BufferOptions,

    /// Number of times each alignment unit was written since the last erase
    /// of its sector.
    unit_writes: Box<[usize]>,

    /// Number of times each sector was erased.
    sector_erases: Box<[usize]>,

    /// Interruption state.
    interruption: Interruption,
}

/// Options of a buffer partition.
#[derive(Clone, Copy, Debug)]
pub struct BufferOptions {
    /// Minimum write granularity in bytes.
    pub alignment_bytes: usize,

    /// Size of a sector in bytes.
    pub sector_size_bytes: usize,

    /// How many times an alignment unit can be written between erases.
    pub max_write_cycles: usize,

    /// How many times a sector can be erased.
    pub max_erase_cycles: usize,

    /// Whether the partition should check the flash invariants.
    ///
    /// When set, the following conditions panic:
    /// - A bit is written from 0 to 1.
    /// - A unit is written more than [`Self::max_write_cycles`] times.
    /// - A sector is erased more than [`Self::max_erase_cycles`] times.
    pub strict_mode: bool,
}

/// Corrupts an interrupted operation given actual and expected content.
///
/// A corruption function is called exactly once and takes 2 arguments:
/// - A mutable slice representing the flash before the interrupted operation.
/// - A shared slice representing what the flash would have been if the
///   operation had completed.
///
/// The corruption function may flip an arbitrary number of bits in the
/// mutable slice, but may only flip bits that differ between both slices.
pub type CorruptFunction<'a> = Box<dyn FnOnce(&mut [u8], &[u8]) + 'a>;

impl BufferPartition {
    /// Creates a buffer partition.
    ///
    /// # Panics
    ///
    /// The following preconditions must hold:
    /// - `options.alignment_bytes` must be a power of two.
    /// - `options.sector_size_bytes` must be aligned.
    /// - `storage.len()` must be a multiple of the sector size.
    pub fn new(storage: Box<[u8]>, options: BufferOptions) -> BufferPartition {
        assert!(options.alignment_bytes.is_power_of_two());
        assert_eq!(options.sector_size_bytes % options.alignment_bytes, 0);
        assert_eq!(storage.len() % options.sector_size_bytes, 0);
        let num_units = storage.len() / options.alignment_bytes;
        let num_sectors = storage.len() / options.sector_size_bytes;
        BufferPartition {
            storage,
            options,
            unit_writes: vec![0; num_units].into_boxed_slice(),
            sector_erases: vec![0; num_sectors].into_boxed_slice(),
            interruption: Interruption::Ready,
        }
    }

    /// Arms an interruption after a given delay.
    ///
    /// Before each subsequent mutable operation (a write, or each sector of
    /// an erase), the delay is decremented if positive. Once the delay is
    /// elapsed, the operation is saved and an error is returned. Subsequent
    /// mutable operations panic until either of:
    /// - The interrupted operation is
    ///   [corrupted](BufferPartition::corrupt_operation).
    /// - The interruption is [reset](BufferPartition::reset_interruption).
    ///
    /// # Panics
    ///
    /// Panics if an interruption is already armed.
    pub fn arm_interruption(&mut self, delay: usize) {
        self.interruption.arm(delay);
    }

    /// Disarms an interruption that did not trigger.
    ///
    /// Returns the remaining delay.
    ///
    /// # Panics
    ///
    /// Panics if an interruption was not armed or has triggered.
    pub fn disarm_interruption(&mut self) -> usize {
        self.interruption.get().err().unwrap()
    }

    /// Resets an interruption regardless of triggering.
    ///
    /// # Panics
    ///
    /// Panics if an interruption was not armed.
    pub fn reset_interruption(&mut self) {
        let _ = self.interruption.get();
    }

    /// Corrupts an interrupted operation.
    ///
    /// Applies the corruption function to the flash content. Counters are
    /// updated accordingly: a fully written unit counts as written and a
    /// fully erased sector counts as erased.
    ///
    /// # Panics
    ///
    /// Panics if any of the following conditions hold:
    /// - An interruption was not armed, or was armed but did not trigger.
    /// - The corruption function corrupts more bits than allowed.
    pub fn corrupt_operation(&mut self, corrupt: CorruptFunction) {
        let operation = self.interruption.get().unwrap();
        let range = self.operation_range(&operation).unwrap();
        let mut before = self.storage[range.clone()].to_vec().into_boxed_slice();
        match operation {
            BufferOperation::Write { value: after, .. } => {
                corrupt(&mut before, &after);
                self.check_reachable(&self.storage[range.clone()], &before);
                self.incr_unit_writes(range.start, &before, &after);
            }
            BufferOperation::Erase { sector } => {
                let after = vec![0xff; self.options.sector_size_bytes].into_boxed_slice();
                corrupt(&mut before, &after);
                if before == after {
                    self.incr_sector_erases(sector);
                }
            }
        }
        self.storage[range].copy_from_slice(&before);
    }

    /// Returns the number of times an alignment unit was written.
    pub fn get_unit_writes(&self, unit: usize) -> usize {
        self.unit_writes[unit]
    }

    /// Returns the number of times a sector was erased.
    pub fn get_sector_erases(&self, sector: usize) -> usize {
        self.sector_erases[sector]
    }

    fn is_aligned(&self, value: usize) -> bool {
        value & (self.options.alignment_bytes - 1) == 0
    }

    /// Checks that `target` only differs from `source` by bits flipped from
    /// 1 to 0 (the only direction a write can take without an erase).
    fn check_reachable(&self, source: &[u8], target: &[u8]) {
        for (&source, &target) in source.iter().zip(target.iter()) {
            assert_eq!(source & target, target);
        }
    }

    /// Updates the counters as if a sector was erased.
    ///
    /// # Panics
    ///
    /// Panics in strict mode if the sector was already erased
    /// [`BufferOptions::max_erase_cycles`] times.
    fn incr_sector_erases(&mut self, sector: usize) {
        if self.options.strict_mode {
            assert!(self.sector_erases[sector] < self.options.max_erase_cycles);
        }
        self.sector_erases[sector] += 1;
        let units_per_sector = self.options.sector_size_bytes / self.options.alignment_bytes;
        for unit in 0..units_per_sector {
            self.unit_writes[sector * units_per_sector + unit] = 0;
        }
    }

    /// Updates the unit counters as if a possibly partial write occurred.
    ///
    /// The write is described as if `complete` was supposed to be written
    /// starting at byte `index` but only `value` was written. Unit counters
    /// are incremented only for units that change and are fully written.
    ///
    /// # Panics
    ///
    /// Panics in strict mode if a unit was already written
    /// [`BufferOptions::max_write_cycles`] times.
    fn incr_unit_writes(&mut self, index: usize, value: &[u8], complete: &[u8]) {
        let alignment = self.options.alignment_bytes;
        for i in 0..value.len() / alignment {
            let range = i * alignment..(i + 1) * alignment;
            // Partial unit writes do not count.
            if value[range.clone()] != complete[range.clone()] {
                continue;
            }
            // Units are written only if necessary.
            if value[range.clone()] == self.storage[index..][range] {
                continue;
            }
            let unit = index / alignment + i;
            if self.options.strict_mode {
                assert!(self.unit_writes[unit] < self.options.max_write_cycles);
            }
            self.unit_writes[unit] += 1;
        }
    }

    /// Returns the storage range of an operation.
    fn operation_range(
        &self,
        operation: &BufferOperation<impl Borrow<[u8]>>,
    ) -> PartitionResult<core::ops::Range<usize>> {
        let (start, len) = match operation {
            BufferOperation::Write { address, value } => {
                (*address as usize, value.borrow().len())
            }
            BufferOperation::Erase { sector } => (
                sector * self.options.sector_size_bytes,
                self.options.sector_size_bytes,
            ),
        };
        if start + len > self.storage.len() {
            return Err(PartitionError::OutOfBounds);
        }
        Ok(start..start + len)
    }

    fn erase_sector(&mut self, sector: usize) -> PartitionResult<()> {
        let operation = BufferOperation::Erase { sector };
        let range = self.operation_range(&operation)?;
        // Interrupt the operation if armed and the delay expired.
        self.interruption.tick(&operation)?;
        self.incr_sector_erases(sector);
        self.storage[range].fill(0xff);
        Ok(())
    }
}

impl FlashPartition for BufferPartition {
    fn sector_size_bytes(&self) -> usize {
        self.options.sector_size_bytes
    }

    fn sector_count(&self) -> usize {
        self.storage.len() / self.options.sector_size_bytes
    }

    fn alignment_bytes(&self) -> usize {
        self.options.alignment_bytes
    }

    fn read(&self, address: Address, buf: &mut [u8]) -> PartitionResult<usize> {
        let start = address as usize;
        if start + buf.len() > self.storage.len() {
            return Err(PartitionError::OutOfBounds);
        }
        buf.copy_from_slice(&self.storage[start..start + buf.len()]);
        Ok(buf.len())
    }

    fn write(&mut self, address: Address, data: &[u8]) -> PartitionResult<usize> {
        if !self.is_aligned(address as usize) || !self.is_aligned(data.len()) {
            return Err(PartitionError::NotAligned);
        }
        let operation = BufferOperation::Write {
            address,
            value: data,
        };
        let range = self.operation_range(&operation)?;
        // Interrupt the operation if armed and the delay expired.
        self.interruption.tick(&operation)?;
        self.incr_unit_writes(range.start, data, data);
        // Check that bits are flipped in the right direction.
        if self.options.strict_mode {
            self.check_reachable(&self.storage[range.clone()], data);
        }
        self.storage[range].copy_from_slice(data);
        Ok(data.len())
    }

    fn erase(&mut self, address: Address, sector_count: usize) -> PartitionResult<()> {
        let sector_size = self.options.sector_size_bytes;
        if address as usize % sector_size != 0 {
            return Err(PartitionError::NotAligned);
        }
        let first = address as usize / sector_size;
        for sector in first..first + sector_count {
            self.erase_sector(sector)?;
        }
        Ok(())
    }
}

/// Represents a mutable flash operation.
///
/// It is polymorphic over the ownership of the byte slice to avoid
/// unnecessary copies.
#[derive(Clone, Debug, PartialEq, Eq)]
enum BufferOperation<ByteSlice: Borrow<[u8]>> {
    /// Represents a write operation.
    Write {
        /// The address at which the write should occur.
        address: Address,

        /// The slice that should be written.
        value: ByteSlice,
    },

    /// Represents an erase operation of a single sector.
    Erase {
        /// The sector that should be erased.
        sector: usize,
    },
}

/// Represents a flash operation owning its byte slice.
type OwnedBufferOperation = BufferOperation<Box<[u8]>>;

/// Represents a flash operation sharing its byte slice.
type SharedBufferOperation<'a> = BufferOperation<&'a [u8]>;

impl<'a> SharedBufferOperation<'a> {
    fn to_owned(&self) -> OwnedBufferOperation {
        match *self {
            BufferOperation::Write { address, value } => BufferOperation::Write {
                address,
                value: value.to_vec().into_boxed_slice(),
            },
            BufferOperation::Erase { sector } => BufferOperation::Erase { sector },
        }
    }
}

/// Controls when a mutable operation is interrupted.
///
/// This is used to simulate power losses while the device is writing or
/// erasing flash.
#[derive(Clone)]
enum Interruption {
    /// Mutable operations have normal behavior.
    Ready,

    /// If the delay is positive, mutable operations decrement it. If the
    /// delay is zero, mutable operations fail and are saved.
    Armed { delay: usize },

    /// Mutable operations panic.
    Saved { operation: OwnedBufferOperation },
}

impl Interruption {
    fn arm(&mut self, delay: usize) {
        match self {
            Interruption::Ready => *self = Interruption::Armed { delay },
            _ => panic!("interruption already armed"),
        }
    }

    /// Disarms an interruption, returning the interrupted operation if any,
    /// otherwise the remaining delay.
    fn get(&mut self) -> Result<OwnedBufferOperation, usize> {
        match core::mem::replace(self, Interruption::Ready) {
            Interruption::Armed { delay } => Err(delay),
            Interruption::Saved { operation } => Ok(operation),
            Interruption::Ready => panic!("interruption was not armed"),
        }
    }

    /// Interrupts an operation if the delay is over.
    fn tick(&mut self, operation: &SharedBufferOperation) -> PartitionResult<()> {
        match self {
            Interruption::Ready => (),
            Interruption::Armed { delay } if *delay == 0 => {
                let operation = operation.to_owned();
                *self = Interruption::Saved { operation };
                return Err(PartitionError::Custom);
            }
            Interruption::Armed { delay } => *delay -= 1,
            Interruption::Saved { .. } => panic!("operation after triggered interruption"),
        }
        Ok(())
    }
}

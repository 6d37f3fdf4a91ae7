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

//! Flash partition abstraction.

/// A byte offset into a flash partition.
pub type Address = u32;

/// Represents a possible flash driver error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionError {
    /// Arguments are not correctly aligned.
    NotAligned,

    /// Arguments are out of bounds.
    OutOfBounds,

    /// Implementation-specific error.
    Custom,
}

pub type PartitionResult<T> = Result<T, PartitionError>;

/// Abstracts a partition of sectored flash memory.
///
/// Addresses are relative to the start of the partition. Reads of erased
/// regions yield all-`0xFF` bytes.
pub trait FlashPartition {
    /// The size of a sector in bytes.
    ///
    /// A sector is the smallest unit of erasable flash.
    fn sector_size_bytes(&self) -> usize;

    /// The number of sectors in the partition.
    fn sector_count(&self) -> usize;

    /// The minimum write granularity in bytes.
    fn alignment_bytes(&self) -> usize;

    /// The total size of the partition in bytes.
    fn size_bytes(&self) -> usize {
        self.sector_count() * self.sector_size_bytes()
    }

    /// Reads `buf.len()` bytes starting at `address`.
    ///
    /// Returns the number of bytes read. Reads have no alignment
    /// requirements.
    fn read(&self, address: Address, buf: &mut [u8]) -> PartitionResult<usize>;

    /// Writes `data` starting at `address`.
    ///
    /// Both `address` and `data.len()` must be multiples of
    /// [`alignment_bytes`](FlashPartition::alignment_bytes). Returns the
    /// number of bytes written.
    fn write(&mut self, address: Address, data: &[u8]) -> PartitionResult<usize>;

    /// Erases `sector_count` sectors starting at `address`.
    ///
    /// `address` must be a multiple of
    /// [`sector_size_bytes`](FlashPartition::sector_size_bytes). Erased bytes
    /// read back as `0xFF`.
    fn erase(&mut self, address: Address, sector_count: usize) -> PartitionResult<()>;
}

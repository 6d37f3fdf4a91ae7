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

//! Per-sector space accounting.

/// Tracks how the bytes of one flash sector are used.
///
/// Every byte of a sector is in exactly one of three states: writable (the
/// erased tail), valid (referenced by an authoritative descriptor), or
/// recoverable (superseded or corrupt, reclaimed by erasing the sector).
/// Only the first two are stored; recoverable bytes are the remainder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SectorDescriptor {
    writable_bytes: usize,
    valid_bytes: usize,
}

impl SectorDescriptor {
    /// Describes a fully erased sector.
    pub fn new(sector_size: usize) -> SectorDescriptor {
        SectorDescriptor {
            writable_bytes: sector_size,
            valid_bytes: 0,
        }
    }

    /// The unused tail available for appends.
    pub fn writable_bytes(&self) -> usize {
        self.writable_bytes
    }

    /// The bytes referenced by authoritative descriptors.
    pub fn valid_bytes(&self) -> usize {
        self.valid_bytes
    }

    /// The bytes that an erase would reclaim.
    pub fn recoverable_bytes(&self, sector_size: usize) -> usize {
        sector_size - self.writable_bytes - self.valid_bytes
    }

    /// Whether the sector is fully erased.
    pub fn empty(&self, sector_size: usize) -> bool {
        self.writable_bytes == sector_size
    }

    /// Whether an entry of `size` bytes fits in the writable tail.
    pub fn has_space(&self, size: usize) -> bool {
        self.writable_bytes >= size
    }

    pub fn add_valid_bytes(&mut self, size: usize) {
        self.valid_bytes += size;
    }

    pub fn remove_valid_bytes(&mut self, size: usize) {
        debug_assert!(self.valid_bytes >= size);
        self.valid_bytes = self.valid_bytes.saturating_sub(size);
    }

    pub fn remove_writable_bytes(&mut self, size: usize) {
        debug_assert!(self.writable_bytes >= size);
        self.writable_bytes = self.writable_bytes.saturating_sub(size);
    }

    /// Sets the writable tail directly; used while rebuilding the accounting
    /// during initialization and to quarantine corrupt sectors.
    pub fn set_writable_bytes(&mut self, writable_bytes: usize) {
        self.writable_bytes = writable_bytes;
    }

    /// Resets the accounting after the sector was erased.
    pub fn reset(&mut self, sector_size: usize) {
        self.writable_bytes = sector_size;
        self.valid_bytes = 0;
    }
}

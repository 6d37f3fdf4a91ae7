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

//! In-RAM index of the entries on flash.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, error, warn};

use crate::partition::Address;
use crate::store::{StoreError, StoreResult};

/// Whether the newest entry for a key stores a value or a tombstone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryState {
    Valid,
    Deleted,
}

/// In-RAM summary of one key's on-flash state.
///
/// All addresses of a descriptor refer to entries with the same key and the
/// same transaction id, at most one per sector.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeyDescriptor {
    hash: u32,
    transaction_id: u32,
    state: EntryState,
    address_count: usize,
}

impl KeyDescriptor {
    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn deleted(&self) -> bool {
        self.state == EntryState::Deleted
    }
}

/// Append-only table of key descriptors, linear-scanned by hash.
///
/// The descriptor table and the address storage are allocated once at
/// construction and never grow. Addresses are kept in a flat array with a
/// fixed number of slots per descriptor so that descriptors stay `Copy` and
/// no per-key allocation happens at runtime.
///
/// Descriptors are never removed: a deleted key keeps its descriptor in the
/// [`Deleted`](EntryState::Deleted) state so that stale copies of the key
/// still on flash cannot resurrect it.
#[derive(Clone, Debug)]
pub(crate) struct EntryCache {
    descriptors: Vec<KeyDescriptor>,
    addresses: Box<[Address]>,
    slots: usize,
    max_entries: usize,
}

impl EntryCache {
    /// Allocates a cache for `max_entries` keys with `redundancy` copies per
    /// key.
    ///
    /// One extra address slot per descriptor absorbs the duplicate copy left
    /// behind by a relocation interrupted between write and erase.
    pub fn new(max_entries: usize, redundancy: usize) -> EntryCache {
        let slots = redundancy + 1;
        EntryCache {
            descriptors: Vec::with_capacity(max_entries),
            addresses: vec![0; max_entries * slots].into_boxed_slice(),
            slots,
            max_entries,
        }
    }

    pub fn clear(&mut self) {
        self.descriptors.clear();
    }

    /// The number of descriptors, including deleted keys.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn is_full(&self) -> bool {
        self.descriptors.len() >= self.max_entries
    }

    /// The number of present (not deleted) keys.
    pub fn present_entries(&self) -> usize {
        self.descriptors
            .iter()
            .filter(|descriptor| !descriptor.deleted())
            .count()
    }

    /// Finds the descriptor with a matching hash, if any.
    pub fn find(&self, hash: u32) -> Option<usize> {
        self.descriptors
            .iter()
            .position(|descriptor| descriptor.hash == hash)
    }

    pub fn descriptor(&self, index: usize) -> &KeyDescriptor {
        &self.descriptors[index]
    }

    /// The addresses of all copies of the entry for a descriptor.
    pub fn addresses(&self, index: usize) -> &[Address] {
        let count = self.descriptors[index].address_count;
        &self.addresses[index * self.slots..index * self.slots + count]
    }

    /// The address of the first copy of the entry for a descriptor.
    pub fn first_address(&self, index: usize) -> Address {
        self.addresses(index)[0]
    }

    /// Appends a descriptor for a key seen for the first time.
    pub fn insert(
        &mut self,
        hash: u32,
        transaction_id: u32,
        state: EntryState,
        address: Address,
    ) -> StoreResult<usize> {
        if self.is_full() {
            return Err(StoreError::ResourceExhausted);
        }
        let index = self.descriptors.len();
        self.descriptors.push(KeyDescriptor {
            hash,
            transaction_id,
            state,
            address_count: 1,
        });
        self.addresses[index * self.slots] = address;
        Ok(index)
    }

    /// Overwrites a descriptor with a newer entry for the same key.
    ///
    /// The address list is replaced by the single new address.
    pub fn update(
        &mut self,
        index: usize,
        transaction_id: u32,
        state: EntryState,
        address: Address,
    ) {
        let descriptor = &mut self.descriptors[index];
        descriptor.transaction_id = transaction_id;
        descriptor.state = state;
        descriptor.address_count = 1;
        self.addresses[index * self.slots] = address;
    }

    /// Replaces one address of a descriptor in place, keeping the rest.
    pub fn replace_address(&mut self, index: usize, old: Address, new: Address) {
        let count = self.descriptors[index].address_count;
        let addresses = &mut self.addresses[index * self.slots..index * self.slots + count];
        match addresses.iter_mut().find(|address| **address == old) {
            Some(address) => *address = new,
            None => debug_assert!(false, "address {:#x} not in descriptor", old),
        }
    }

    /// Records an entry observed during the initialization scan.
    ///
    /// A new hash appends a descriptor; a newer transaction id overwrites the
    /// existing one; an equal id is a redundant copy of the same entry; an
    /// older id is stale and ignored.
    pub fn upsert(
        &mut self,
        hash: u32,
        transaction_id: u32,
        state: EntryState,
        address: Address,
        sector_size: usize,
    ) -> StoreResult<()> {
        let index = match self.find(hash) {
            None => {
                self.insert(hash, transaction_id, state, address)?;
                return Ok(());
            }
            Some(index) => index,
        };
        let existing = self.descriptors[index];
        if transaction_id > existing.transaction_id {
            self.update(index, transaction_id, state, address);
        } else if transaction_id == existing.transaction_id {
            self.add_redundant_address(index, address, sector_size)?;
        } else {
            debug!(
                "Found stale entry for key {:#010x} (transaction {} < {}); ignoring",
                hash, transaction_id, existing.transaction_id
            );
        }
        Ok(())
    }

    /// Adds the address of a redundant copy to an existing descriptor.
    fn add_redundant_address(
        &mut self,
        index: usize,
        address: Address,
        sector_size: usize,
    ) -> StoreResult<()> {
        // Copies of one entry must live in distinct sectors; a duplicate in
        // the same sector means the flash contents are inconsistent.
        for &existing in self.addresses(index) {
            if existing as usize / sector_size == address as usize / sector_size {
                error!(
                    "Duplicate copies of key {:#010x} in sector {}",
                    self.descriptors[index].hash,
                    address as usize / sector_size
                );
                return Err(StoreError::DataLoss);
            }
        }
        let descriptor = &mut self.descriptors[index];
        if descriptor.address_count >= self.slots {
            // Drop the extra copy from tracking. It is never counted as
            // valid, so it ages into recoverable bytes and is erased by the
            // next garbage collection of its sector.
            warn!(
                "Key {:#010x} has more than {} copies; dropping address {:#x}",
                descriptor.hash, self.slots, address
            );
            return Ok(());
        }
        let count = descriptor.address_count;
        descriptor.address_count = count + 1;
        self.addresses[index * self.slots + count] = address;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECTOR_SIZE: usize = 4096;

    #[test]
    fn insert_and_find() {
        let mut cache = EntryCache::new(4, 1);
        assert_eq!(cache.find(0x1111), None);
        let index = cache.insert(0x1111, 1, EntryState::Valid, 0x40).unwrap();
        assert_eq!(cache.find(0x1111), Some(index));
        assert_eq!(cache.addresses(index), &[0x40]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.present_entries(), 1);
    }

    #[test]
    fn insert_past_capacity_is_exhausted() {
        let mut cache = EntryCache::new(2, 1);
        cache.insert(1, 1, EntryState::Valid, 0).unwrap();
        cache.insert(2, 2, EntryState::Valid, 0x20).unwrap();
        assert_eq!(
            cache.insert(3, 3, EntryState::Valid, 0x40).unwrap_err(),
            StoreError::ResourceExhausted
        );
    }

    #[test]
    fn upsert_newer_entry_wins() {
        let mut cache = EntryCache::new(4, 1);
        cache
            .upsert(0x1111, 1, EntryState::Valid, 0x40, SECTOR_SIZE)
            .unwrap();
        cache
            .upsert(0x1111, 5, EntryState::Deleted, 0x1040, SECTOR_SIZE)
            .unwrap();
        let index = cache.find(0x1111).unwrap();
        assert_eq!(cache.descriptor(index).transaction_id(), 5);
        assert!(cache.descriptor(index).deleted());
        assert_eq!(cache.addresses(index), &[0x1040]);
        assert_eq!(cache.present_entries(), 0);
    }

    #[test]
    fn upsert_stale_entry_is_ignored() {
        let mut cache = EntryCache::new(4, 1);
        cache
            .upsert(0x1111, 5, EntryState::Valid, 0x40, SECTOR_SIZE)
            .unwrap();
        cache
            .upsert(0x1111, 2, EntryState::Valid, 0x2000, SECTOR_SIZE)
            .unwrap();
        let index = cache.find(0x1111).unwrap();
        assert_eq!(cache.descriptor(index).transaction_id(), 5);
        assert_eq!(cache.addresses(index), &[0x40]);
    }

    #[test]
    fn upsert_redundant_copy_in_other_sector() {
        let mut cache = EntryCache::new(4, 1);
        cache
            .upsert(0x1111, 5, EntryState::Valid, 0x40, SECTOR_SIZE)
            .unwrap();
        cache
            .upsert(0x1111, 5, EntryState::Valid, 0x1040, SECTOR_SIZE)
            .unwrap();
        let index = cache.find(0x1111).unwrap();
        assert_eq!(cache.addresses(index), &[0x40, 0x1040]);
    }

    #[test]
    fn upsert_duplicate_in_same_sector_is_data_loss() {
        let mut cache = EntryCache::new(4, 1);
        cache
            .upsert(0x1111, 5, EntryState::Valid, 0x40, SECTOR_SIZE)
            .unwrap();
        assert_eq!(
            cache
                .upsert(0x1111, 5, EntryState::Valid, 0x80, SECTOR_SIZE)
                .unwrap_err(),
            StoreError::DataLoss
        );
    }

    #[test]
    fn extra_redundant_copies_are_dropped() {
        let mut cache = EntryCache::new(4, 1);
        cache
            .upsert(0x1111, 5, EntryState::Valid, 0x40, SECTOR_SIZE)
            .unwrap();
        cache
            .upsert(0x1111, 5, EntryState::Valid, 0x1040, SECTOR_SIZE)
            .unwrap();
        // A third copy exceeds the two slots of a redundancy-1 cache.
        cache
            .upsert(0x1111, 5, EntryState::Valid, 0x2040, SECTOR_SIZE)
            .unwrap();
        let index = cache.find(0x1111).unwrap();
        assert_eq!(cache.addresses(index), &[0x40, 0x1040]);
    }

    #[test]
    fn replace_address_keeps_others() {
        let mut cache = EntryCache::new(4, 1);
        cache
            .upsert(0x1111, 5, EntryState::Valid, 0x40, SECTOR_SIZE)
            .unwrap();
        cache
            .upsert(0x1111, 5, EntryState::Valid, 0x1040, SECTOR_SIZE)
            .unwrap();
        let index = cache.find(0x1111).unwrap();
        cache.replace_address(index, 0x40, 0x2040);
        assert_eq!(cache.addresses(index), &[0x2040, 0x1040]);
    }

    #[test]
    fn update_replaces_address_list() {
        let mut cache = EntryCache::new(4, 1);
        cache
            .upsert(0x1111, 5, EntryState::Valid, 0x40, SECTOR_SIZE)
            .unwrap();
        cache
            .upsert(0x1111, 5, EntryState::Valid, 0x1040, SECTOR_SIZE)
            .unwrap();
        let index = cache.find(0x1111).unwrap();
        cache.update(index, 6, EntryState::Valid, 0x2040);
        assert_eq!(cache.addresses(index), &[0x2040]);
        assert_eq!(cache.descriptor(index).transaction_id(), 6);
    }
}

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

//! Log-structured key-value store engine.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};
use core::marker::PhantomData;
use log::{debug, error, info, warn};

use crate::cache::{EntryCache, EntryState};
use crate::checksum::{hash_key, ChecksumAlgorithm};
use crate::entry::{Entry, KeyBuffer, MAX_KEY_LENGTH, MIN_ALIGNMENT_BYTES};
use crate::format::{EntryFormat, EntryFormats};
use crate::partition::{Address, FlashPartition, PartitionError};
use crate::sectors::SectorDescriptor;

/// Maximum supported redundancy level.
pub const MAX_REDUNDANCY: usize = 4;

/// Address slots per descriptor: one per redundant copy, plus one to absorb
/// the duplicate left by an interrupted relocation.
const MAX_ADDRESS_SLOTS: usize = MAX_REDUNDANCY + 1;

/// Represents a possible store error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The key is not present in the store.
    NotFound,

    /// A different key with the same hash is already in the store.
    AlreadyExists,

    /// The key is empty or too long, or the value is too large for one
    /// sector.
    InvalidArgument,

    /// The store is not initialized, or its configuration does not fit the
    /// partition.
    FailedPrecondition,

    /// Out of space: the descriptor table is full, no sector has enough free
    /// space even after garbage collection, or an output buffer is too small
    /// for the value.
    ResourceExhausted,

    /// Corrupt data was encountered. The store remains usable; the most
    /// recent intact entry of each key stays authoritative.
    DataLoss,

    /// An internal invariant was violated.
    Internal,

    /// The flash driver reported an unexpected error.
    Unknown,
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<PartitionError> for StoreError {
    fn from(error: PartitionError) -> StoreError {
        match error {
            PartitionError::Custom => StoreError::Unknown,
            // The store derives all addresses from the partition geometry, so
            // these indicate a bookkeeping bug rather than a flash failure.
            PartitionError::NotAligned | PartitionError::OutOfBounds => StoreError::Internal,
        }
    }
}

/// Controls garbage collection triggered by a write that runs out of space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GarbageCollectOnWrite {
    /// Never collect on write; the write fails with `ResourceExhausted`.
    Disabled,

    /// Collect at most one sector before retrying the write.
    OneSector,

    /// Collect as many sectors as needed before giving up.
    AsManySectorsNeeded,
}

/// Controls when detected corruption is cleaned up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorRecovery {
    /// Reclaim quarantined sectors as soon as initialization detects them.
    Immediate,

    /// Leave quarantined sectors to the next garbage collection.
    Lazy,
}

/// Store configuration, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub gc_on_write: GarbageCollectOnWrite,
    pub recovery: ErrorRecovery,

    /// Verify an entry's checksum after reading its value from flash.
    pub verify_on_read: bool,

    /// Verify an entry's checksum in flash after writing it.
    pub verify_on_write: bool,

    /// Capacity of the key descriptor table.
    pub max_entries: usize,

    /// Capacity of the sector table; must cover the partition.
    pub max_usable_sectors: usize,

    /// Number of copies kept per entry, at most [`MAX_REDUNDANCY`].
    pub redundancy: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            gc_on_write: GarbageCollectOnWrite::OneSector,
            recovery: ErrorRecovery::Lazy,
            verify_on_read: true,
            verify_on_write: true,
            max_entries: 64,
            max_usable_sectors: 64,
            redundancy: 1,
        }
    }
}

/// A snapshot of how the partition's bytes are used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageStats {
    /// Bytes available for new entries, excluding the reserved sector.
    pub writable_bytes: usize,

    /// Bytes referenced by present or deleted keys.
    pub in_use_bytes: usize,

    /// Bytes reclaimable by garbage collection.
    pub reclaimable_bytes: usize,
}

/// What the sector allocator is searching space for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FindMode {
    /// A regular append; one erased sector must stay in reserve.
    AppendEntry,

    /// A relocation during garbage collection; the reserve may be consumed
    /// because the collection ends with a freshly erased sector.
    GarbageCollect,
}

/// Log-structured key-value store over a raw flash partition.
///
/// Entries are appended to sectors and never modified in place; newer entries
/// supersede older ones by transaction id, and deletions append tombstones.
/// Superseded space is reclaimed by erasing whole sectors after relocating
/// their live entries. At least one sector is kept erased at all times so
/// garbage collection always has a landing zone.
///
/// All RAM the store uses is allocated at construction. The store is
/// single-threaded; callers must serialize access.
pub struct KeyValueStore<P: FlashPartition, C: ChecksumAlgorithm + Default> {
    partition: P,
    formats: EntryFormats,
    options: Options,
    cache: EntryCache,
    sectors: Vec<SectorDescriptor>,

    /// Scratch buffer of one sector, used to relocate entries.
    working_buffer: Box<[u8]>,

    /// The sector most recently selected as a fresh write target. Starting
    /// the next search after it rotates which erased sector is picked,
    /// spreading erase wear across the partition.
    last_new_sector: usize,

    last_transaction_id: u32,
    initialized: bool,
    checksum: PhantomData<C>,
}

impl<P: FlashPartition, C: ChecksumAlgorithm + Default> KeyValueStore<P, C> {
    /// Creates a store over `partition`.
    ///
    /// The first format is used for new entries; the rest are accepted when
    /// reading. The store is unusable until [`init`](KeyValueStore::init)
    /// runs.
    pub fn new(
        partition: P,
        formats: &[EntryFormat],
        options: Options,
    ) -> StoreResult<KeyValueStore<P, C>> {
        let formats = EntryFormats::new(formats).ok_or(StoreError::InvalidArgument)?;
        if options.max_entries == 0
            || options.redundancy == 0
            || options.redundancy > MAX_REDUNDANCY
        {
            return Err(StoreError::InvalidArgument);
        }
        let alignment = partition.alignment_bytes();
        let sector_size = partition.sector_size_bytes();
        if !alignment.is_power_of_two()
            || alignment > crate::alignment::MAX_ALIGNMENT_BYTES
            || sector_size % alignment.max(MIN_ALIGNMENT_BYTES) != 0
        {
            return Err(StoreError::InvalidArgument);
        }
        Ok(KeyValueStore {
            working_buffer: vec![0; sector_size].into_boxed_slice(),
            cache: EntryCache::new(options.max_entries, options.redundancy),
            sectors: Vec::with_capacity(options.max_usable_sectors),
            partition,
            formats,
            options,
            last_new_sector: 0,
            last_transaction_id: 0,
            initialized: false,
            checksum: PhantomData,
        })
    }

    /// Initializes the store from the partition contents.
    ///
    /// Scans every sector for entries, rebuilds the in-RAM index and the
    /// sector accounting, and restores the free-sector invariant. Returns
    /// `DataLoss` if corrupt data was observed; the store is still usable
    /// and intact entries are unaffected.
    pub fn init(&mut self) -> StoreResult<()> {
        self.initialized = false;
        self.cache.clear();
        self.last_new_sector = 0;
        self.last_transaction_id = 0;

        info!("Initializing key value store");
        if self.partition.sector_count() > self.options.max_usable_sectors {
            error!(
                "Init failed: max_usable_sectors (={}) must cover the partition's {} sectors",
                self.options.max_usable_sectors,
                self.partition.sector_count()
            );
            return Err(StoreError::FailedPrecondition);
        }
        let sector_size = self.partition.sector_size_bytes();
        if self.working_buffer.len() < sector_size {
            error!(
                "Init failed: working buffer ({} B) is smaller than a sector ({} B)",
                self.working_buffer.len(),
                sector_size
            );
            return Err(StoreError::FailedPrecondition);
        }

        self.sectors.clear();
        self.sectors
            .resize(self.partition.sector_count(), SectorDescriptor::new(sector_size));

        debug!("First pass: reading all entries from all sectors");
        let mut total_corrupt_bytes = 0;
        let mut corrupt_entries = 0;
        let mut empty_sector_found = false;

        for sector_index in 0..self.sectors.len() {
            let sector_base = (sector_index * sector_size) as Address;
            let mut entry_address = sector_base;
            let mut sector_corrupt_bytes = 0;

            loop {
                if (entry_address - sector_base) as usize >= sector_size {
                    break;
                }
                let next = match self.load_entry(entry_address) {
                    Ok(next) => next,
                    Err(StoreError::NotFound) => break,
                    Err(StoreError::DataLoss) => {
                        // The entry could not be read. Scan the remainder of
                        // the sector for further entries.
                        error!(
                            "Init: data loss detected in sector {} at address {:#x}",
                            sector_index, entry_address
                        );
                        corrupt_entries += 1;
                        let scan_start = entry_address + MIN_ALIGNMENT_BYTES as Address;
                        match self.scan_for_entry(sector_index, scan_start) {
                            Ok(next) => {
                                sector_corrupt_bytes += (next - entry_address) as usize;
                                next
                            }
                            Err(StoreError::NotFound) => {
                                // No further entries. The size of the corrupt
                                // entry is unknown, so the rest of the sector
                                // counts as corrupt.
                                sector_corrupt_bytes +=
                                    sector_size - (entry_address - sector_base) as usize;
                                break;
                            }
                            Err(error) => {
                                error!("Unexpected error during init: {:?}", error);
                                return Err(StoreError::Unknown);
                            }
                        }
                    }
                    Err(error) => {
                        error!("Unexpected error during init: {:?}", error);
                        return Err(StoreError::Unknown);
                    }
                };
                entry_address = next;
                self.sectors[sector_index]
                    .set_writable_bytes(sector_size - (entry_address - sector_base) as usize);
            }

            if sector_corrupt_bytes > 0 {
                // Quarantine: no further appends land here, which also makes
                // the sector a good garbage collection candidate. Intact
                // entries in it remain readable.
                self.sectors[sector_index].set_writable_bytes(0);
                warn!(
                    "Sector {} contains {} B of corrupt data",
                    sector_index, sector_corrupt_bytes
                );
            }
            if self.sectors[sector_index].empty(sector_size) {
                empty_sector_found = true;
            }
            total_corrupt_bytes += sector_corrupt_bytes;
        }

        debug!("Second pass: counting valid bytes in each sector");
        let mut newest: Option<(u32, Address)> = None;
        for index in 0..self.cache.len() {
            for slot in 0..self.cache.addresses(index).len() {
                let address = self.cache.addresses(index)[slot];
                let entry = Entry::read(&self.partition, address, &self.formats)?;
                self.sectors[address as usize / sector_size].add_valid_bytes(entry.size());
            }
            let descriptor = self.cache.descriptor(index);
            if newest.map_or(true, |(id, _)| descriptor.transaction_id() > id) {
                let last = *self.cache.addresses(index).last().unwrap();
                newest = Some((descriptor.transaction_id(), last));
            }
        }
        if let Some((transaction_id, address)) = newest {
            self.last_transaction_id = transaction_id;
            self.last_new_sector = address as usize / sector_size;
        }

        if !empty_sector_found {
            if let Err(error) = self.garbage_collect_partial() {
                error!(
                    "Init failed: unable to maintain a free sector: {:?}",
                    error
                );
                // A flash driver failure is reported as such; anything else
                // means the collection could not restore the invariant.
                return Err(match error {
                    StoreError::Unknown => StoreError::Unknown,
                    _ => StoreError::Internal,
                });
            }
        }

        self.initialized = true;
        info!(
            "Init complete: {} present keys, {} deleted keys, {} sectors of {} B",
            self.size(),
            self.cache.len() - self.size(),
            self.sectors.len(),
            sector_size
        );

        if total_corrupt_bytes > 0 {
            warn!(
                "Found {} corrupt bytes and {} corrupt entries during init; some keys may be missing",
                total_corrupt_bytes, corrupt_entries
            );
            if self.options.recovery == ErrorRecovery::Immediate {
                if let Err(error) = self.garbage_collect_full() {
                    if error == StoreError::Unknown {
                        // The flash driver failed mid-recovery; the store is
                        // not usable without another initialization.
                        self.initialized = false;
                        return Err(StoreError::Unknown);
                    }
                    warn!("Immediate recovery failed: {:?}", error);
                }
            }
            return Err(StoreError::DataLoss);
        }
        Ok(())
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Reads the value of an entry into `value`, starting at `offset`.
    ///
    /// Returns the number of bytes read. If the buffer cannot hold the whole
    /// value it is filled completely and `ResourceExhausted` is returned;
    /// the rest of the value can be read by calling `get` with an offset.
    pub fn get(&self, key: &str, value: &mut [u8], offset: usize) -> StoreResult<usize> {
        self.check_operation(key)?;
        let index = self.find_existing_key_descriptor(key)?;
        self.get_by_descriptor(index, key, value, offset)
    }

    /// Adds a key-value entry to the store, overwriting an existing value.
    ///
    /// All keys must have distinct hashes; writing a key whose hash collides
    /// with a different existing key fails with `AlreadyExists`.
    pub fn put(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        debug!(
            "Writing key/value; key length={}, value length={}",
            key.len(),
            value.len()
        );
        self.check_operation(key)?;
        let entry_size = Entry::size_for(self.partition.alignment_bytes(), key, value.len());
        if entry_size > self.partition.sector_size_bytes() || value.len() >= 0xffff {
            debug!(
                "{} B value with {} B key cannot fit in one sector",
                value.len(),
                key.len()
            );
            return Err(StoreError::InvalidArgument);
        }

        match self.find_key_descriptor(key) {
            Ok(index) => self.write_entry_for_existing_key(index, EntryState::Valid, key, value),
            Err(StoreError::NotFound) => self.write_entry_for_new_key(key, value),
            Err(error) => Err(error),
        }
    }

    /// Removes a key from the store by appending a tombstone entry.
    pub fn delete(&mut self, key: &str) -> StoreResult<()> {
        self.check_operation(key)?;
        let index = self.find_existing_key_descriptor(key)?;
        debug!(
            "Writing tombstone for key {:#010x}",
            self.cache.descriptor(index).hash()
        );
        self.write_entry_for_existing_key(index, EntryState::Deleted, key, &[])
    }

    /// Returns the size of the value stored for `key`.
    pub fn value_size(&self, key: &str) -> StoreResult<usize> {
        self.check_operation(key)?;
        let index = self.find_existing_key_descriptor(key)?;
        self.value_size_by_descriptor(index)
    }

    /// Iterates over the present keys in descriptor order.
    pub fn iter(&self) -> Iter<'_, P, C> {
        Iter {
            store: self,
            index: 0,
        }
    }

    /// The number of present keys.
    pub fn size(&self) -> usize {
        self.cache.present_entries()
    }

    /// The maximum number of keys the store can hold.
    pub fn max_size(&self) -> usize {
        self.cache.max_entries()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The number of write transactions since the flash was first used.
    ///
    /// Retained across initializations; reset only if the flash is erased.
    pub fn transaction_count(&self) -> u32 {
        self.last_transaction_id
    }

    /// The number of copies written per entry.
    pub fn redundancy(&self) -> usize {
        self.options.redundancy
    }

    /// Summarizes the partition's space usage.
    pub fn storage_stats(&self) -> StorageStats {
        let mut stats = StorageStats {
            writable_bytes: 0,
            in_use_bytes: 0,
            reclaimable_bytes: 0,
        };
        let sector_size = self.partition.sector_size_bytes();
        let mut found_empty_sector = false;
        for sector in &self.sectors {
            stats.in_use_bytes += sector.valid_bytes();
            stats.reclaimable_bytes += sector.recoverable_bytes(sector_size);
            // One empty sector is reserved for garbage collection and not
            // counted as writable space.
            if !found_empty_sector && sector.empty(sector_size) {
                found_empty_sector = true;
                continue;
            }
            stats.writable_bytes += sector.writable_bytes();
        }
        stats
    }

    /// Garbage collects every sector with reclaimable space.
    pub fn garbage_collect_full(&mut self) -> StoreResult<()> {
        debug!("Garbage collecting all sectors");
        let sector_count = self.sectors.len();
        let mut sector = self.last_new_sector;
        for _ in 0..sector_count {
            sector = (sector + 1) % sector_count;
            let sector_size = self.partition.sector_size_bytes();
            if self.sectors[sector].recoverable_bytes(sector_size) > 0 {
                self.garbage_collect_sector(sector)?;
            }
        }
        Ok(())
    }

    /// Garbage collects a single sector, chosen for the most reclaimable
    /// space. A no-op if nothing is reclaimable.
    pub fn garbage_collect_partial(&mut self) -> StoreResult<()> {
        match self.find_sector_to_garbage_collect() {
            None => Ok(()),
            Some(victim) => self.garbage_collect_sector(victim),
        }
    }

    /// Dumps the per-sector space accounting at debug level.
    pub fn log_sectors(&self) {
        debug!("Sector descriptors: count {}", self.sectors.len());
        let sector_size = self.partition.sector_size_bytes();
        for (index, sector) in self.sectors.iter().enumerate() {
            debug!(
                "  - Sector {}: valid {}, recoverable {}, free {}",
                index,
                sector.valid_bytes(),
                sector.recoverable_bytes(sector_size),
                sector.writable_bytes()
            );
        }
    }

    /// Dumps the key descriptor table at debug level.
    pub fn log_key_descriptors(&self) {
        debug!("Key descriptors: count {}", self.cache.len());
        for index in 0..self.cache.len() {
            let descriptor = self.cache.descriptor(index);
            debug!(
                "  - Key: {}, hash {:#010x}, transaction id {}, address {:#x}",
                if descriptor.deleted() { "Deleted" } else { "Valid" },
                descriptor.hash(),
                descriptor.transaction_id(),
                self.cache.first_address(index)
            );
        }
    }

    /// Read-only access to the partition.
    pub fn partition(&self) -> &P {
        &self.partition
    }

    /// Mutable access to the partition.
    pub fn partition_mut(&mut self) -> &mut P {
        &mut self.partition
    }

    /// Consumes the store, returning the partition.
    pub fn into_partition(self) -> P {
        self.partition
    }

    #[cfg(feature = "std")]
    pub(crate) fn sector_descriptors(&self) -> &[SectorDescriptor] {
        &self.sectors
    }

    #[cfg(feature = "std")]
    pub(crate) fn entry_cache(&self) -> &EntryCache {
        &self.cache
    }

    #[cfg(feature = "std")]
    pub(crate) fn entry_size_at(&self, address: Address) -> StoreResult<usize> {
        Ok(Entry::read(&self.partition, address, &self.formats)?.size())
    }

    fn check_operation(&self, key: &str) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::InvalidArgument);
        }
        if !self.initialized {
            return Err(StoreError::FailedPrecondition);
        }
        Ok(())
    }

    /// Loads the entry at `entry_address` into the cache during init.
    ///
    /// Returns the address at which the next entry could be located.
    fn load_entry(&mut self, entry_address: Address) -> StoreResult<Address> {
        let entry = Entry::read(&self.partition, entry_address, &self.formats)?;

        let mut key_buffer: KeyBuffer = [0; MAX_KEY_LENGTH];
        let key_length = entry.read_key(&self.partition, &mut key_buffer)?;
        entry.verify_checksum_in_flash::<P, C>(&self.partition)?;

        let state = if entry.deleted() {
            EntryState::Deleted
        } else {
            EntryState::Valid
        };
        self.cache.upsert(
            hash_key(&key_buffer[..key_length]),
            entry.transaction_id(),
            state,
            entry_address,
            self.partition.sector_size_bytes(),
        )?;
        Ok(entry.next_address())
    }

    /// Scans a sector for the magic word of the next entry.
    ///
    /// Entries start at multiples of the minimum alignment, but the actual
    /// alignment can vary between entries, so the scan probes every minimum
    /// alignment boundary.
    fn scan_for_entry(&self, sector_index: usize, start_address: Address) -> StoreResult<Address> {
        debug!(
            "Scanning sector {} for entries starting from address {:#x}",
            sector_index, start_address
        );
        let sector_size = self.partition.sector_size_bytes();
        let sector_end = ((sector_index + 1) * sector_size) as Address;
        let mut address =
            crate::alignment::align_up(start_address as usize, MIN_ALIGNMENT_BYTES) as Address;
        while address < sector_end {
            let mut magic_bytes = [0u8; 4];
            self.partition.read(address, &mut magic_bytes)?;
            if self.formats.contains(LittleEndian::read_u32(&magic_bytes)) {
                debug!("Found entry magic at address {:#x}", address);
                return Ok(address);
            }
            address += MIN_ALIGNMENT_BYTES as Address;
        }
        Err(StoreError::NotFound)
    }

    /// Finds the descriptor matching `key`.
    ///
    /// `NotFound` means the key is absent and its hash is unused;
    /// `AlreadyExists` means a different key with the same hash is present.
    fn find_key_descriptor(&self, key: &str) -> StoreResult<usize> {
        let hash = hash_key(key.as_bytes());
        let index = match self.cache.find(hash) {
            None => return Err(StoreError::NotFound),
            Some(index) => index,
        };
        let entry = Entry::read(&self.partition, self.cache.first_address(index), &self.formats)?;
        let mut key_buffer: KeyBuffer = [0; MAX_KEY_LENGTH];
        let key_length = entry.read_key(&self.partition, &mut key_buffer)?;
        if &key_buffer[..key_length] == key.as_bytes() {
            debug!("Found match for key hash {:#010x}", hash);
            Ok(index)
        } else {
            warn!("Found key hash collision for {:#010x}", hash);
            Err(StoreError::AlreadyExists)
        }
    }

    /// As [`find_key_descriptor`](Self::find_key_descriptor), but treats
    /// colliding and deleted keys as absent.
    fn find_existing_key_descriptor(&self, key: &str) -> StoreResult<usize> {
        match self.find_key_descriptor(key) {
            Ok(index) if self.cache.descriptor(index).deleted() => Err(StoreError::NotFound),
            Err(StoreError::AlreadyExists) => Err(StoreError::NotFound),
            result => result,
        }
    }

    fn get_by_descriptor(
        &self,
        index: usize,
        key: &str,
        value: &mut [u8],
        offset: usize,
    ) -> StoreResult<usize> {
        let entry = Entry::read(&self.partition, self.cache.first_address(index), &self.formats)?;
        let read = entry.read_value(&self.partition, value, offset)?;
        if self.options.verify_on_read && offset == 0 {
            if let Err(error) = entry.verify_checksum::<C>(key, &value[..read]) {
                // Do not hand out data that failed verification.
                value[..read].fill(0);
                return Err(error);
            }
        }
        Ok(read)
    }

    fn value_size_by_descriptor(&self, index: usize) -> StoreResult<usize> {
        let entry = Entry::read(&self.partition, self.cache.first_address(index), &self.formats)?;
        Ok(entry.value_size())
    }

    fn write_entry_for_existing_key(
        &mut self,
        index: usize,
        new_state: EntryState,
        key: &str,
        value: &[u8],
    ) -> StoreResult<()> {
        // The size of the superseded copies, for the sector accounting after
        // the new entry is in place. Relocations preserve entry sizes, so
        // the size stays correct even if a garbage collection below moves
        // the old copies.
        let old_entry =
            Entry::read(&self.partition, self.cache.first_address(index), &self.formats)?;
        let old_size = old_entry.size();

        let entry_size = Entry::size_for(self.partition.alignment_bytes(), key, value.len());
        let sector = self.find_or_recover_sector(entry_size)?;

        // Capture the old copy locations only now: a garbage collection
        // during the sector search may have relocated them.
        let mut old_addresses = [0 as Address; MAX_ADDRESS_SLOTS];
        let old_count = self.cache.addresses(index).len();
        old_addresses[..old_count].copy_from_slice(self.cache.addresses(index));
        debug!(
            "Writing existing key {:#010x} to sector {}",
            self.cache.descriptor(index).hash(),
            sector
        );
        let entry = self.append_entry(sector, key, value, new_state)?;
        self.cache
            .update(index, entry.transaction_id(), new_state, entry.address());

        let sector_size = self.partition.sector_size_bytes();
        for &address in &old_addresses[..old_count] {
            self.sectors[address as usize / sector_size].remove_valid_bytes(old_size);
        }
        Ok(())
    }

    fn write_entry_for_new_key(&mut self, key: &str, value: &[u8]) -> StoreResult<()> {
        if self.cache.is_full() {
            warn!(
                "Cannot store new entry; already have {} entries",
                self.cache.len()
            );
            return Err(StoreError::ResourceExhausted);
        }
        let entry_size = Entry::size_for(self.partition.alignment_bytes(), key, value.len());
        let sector = self.find_or_recover_sector(entry_size)?;
        debug!("Writing new key to sector {}", sector);
        let entry = self.append_entry(sector, key, value, EntryState::Valid)?;
        // Only add the descriptor once the write is known to have succeeded.
        self.cache.insert(
            hash_key(key.as_bytes()),
            entry.transaction_id(),
            EntryState::Valid,
            entry.address(),
        )?;
        Ok(())
    }

    /// Appends a new entry, consuming a fresh transaction id.
    fn append_entry(
        &mut self,
        sector_index: usize,
        key: &str,
        value: &[u8],
        state: EntryState,
    ) -> StoreResult<Entry> {
        // The id is burned even if the write fails below. Reusing the id of
        // a failed write for a later successful one would put two distinct
        // entries with the same id on flash.
        self.last_transaction_id = self.last_transaction_id.wrapping_add(1);
        let transaction_id = self.last_transaction_id;
        self.append_entry_with_id(sector_index, key, value, state, transaction_id)
    }

    /// Appends an entry with an explicit transaction id.
    ///
    /// Relocations use this to write a copy that keeps the original id.
    fn append_entry_with_id(
        &mut self,
        sector_index: usize,
        key: &str,
        value: &[u8],
        state: EntryState,
        transaction_id: u32,
    ) -> StoreResult<Entry> {
        let address = self.next_writable_address(sector_index);
        let alignment = self.entry_alignment();
        let format = self.formats.primary();
        let entry = match state {
            EntryState::Deleted => {
                Entry::tombstone::<C>(address, format, key, transaction_id, alignment)
            }
            EntryState::Valid => {
                Entry::valid::<C>(address, format, key, value, transaction_id, alignment)
            }
        };
        debug_assert!(self.sectors[sector_index].has_space(entry.size()));
        debug!(
            "Appending {} B entry with transaction id {} to address {:#x}",
            entry.size(),
            transaction_id,
            address
        );

        let (written, result) = entry.write(&mut self.partition, key, value);
        // Remove the bytes that were written even if the write failed, to
        // retain the writable-space invariant on the sector.
        self.sectors[sector_index].remove_writable_bytes(written);
        if let Err(error) = result {
            error!(
                "Failed to write {} B at {:#x}; {} B were written",
                entry.size(),
                address,
                written
            );
            return Err(error);
        }

        if self.options.verify_on_write {
            entry.verify_checksum_in_flash::<P, C>(&self.partition)?;
        }
        self.sectors[sector_index].add_valid_bytes(entry.size());
        Ok(entry)
    }

    /// Finds a sector for a new entry, garbage collecting if allowed.
    fn find_or_recover_sector(&mut self, entry_size: usize) -> StoreResult<usize> {
        match self.find_sector_with_space(entry_size, FindMode::AppendEntry, &[]) {
            Err(StoreError::ResourceExhausted)
                if self.options.gc_on_write != GarbageCollectOnWrite::Disabled =>
            {
                let attempts = match self.options.gc_on_write {
                    GarbageCollectOnWrite::OneSector => 1,
                    _ => self.sectors.len().max(1),
                };
                for _ in 0..attempts {
                    self.garbage_collect_partial()?;
                    match self.find_sector_with_space(entry_size, FindMode::AppendEntry, &[]) {
                        Err(StoreError::ResourceExhausted) => continue,
                        result => return result,
                    }
                }
                Err(StoreError::ResourceExhausted)
            }
            result => result,
        }
    }

    /// Finds a sector with `size` writable bytes.
    ///
    /// The search starts one past the last selected fresh sector and wraps
    /// around the partition. It prefers partially written sectors, falling
    /// back to the first empty sector seen, and requires a second empty
    /// sector to exist outside of garbage collection so one always stays in
    /// reserve. In garbage collection mode, partially written sectors with
    /// reclaimable bytes are not considered, to avoid immediately relocating
    /// the relocated entries again.
    fn find_sector_with_space(
        &mut self,
        size: usize,
        mode: FindMode,
        sectors_to_skip: &[usize],
    ) -> StoreResult<usize> {
        let sector_size = self.partition.sector_size_bytes();
        let sector_count = self.sectors.len();
        let mut first_empty_sector: Option<usize> = None;
        let mut at_least_two_empty_sectors = mode == FindMode::GarbageCollect;

        debug!(
            "Finding sector with {} B available, starting after sector {}",
            size, self.last_new_sector
        );

        let mut sector = self.last_new_sector;
        for _ in 0..sector_count {
            sector = (sector + 1) % sector_count;
            if sectors_to_skip.contains(&sector) {
                continue;
            }
            let descriptor = &self.sectors[sector];
            if !descriptor.empty(sector_size)
                && descriptor.has_space(size)
                && (mode == FindMode::AppendEntry
                    || descriptor.recoverable_bytes(sector_size) == 0)
            {
                return Ok(sector);
            }
            if descriptor.empty(sector_size) {
                if first_empty_sector.is_none() {
                    first_empty_sector = Some(sector);
                } else {
                    at_least_two_empty_sectors = true;
                }
            }
        }

        if at_least_two_empty_sectors {
            if let Some(sector) = first_empty_sector {
                debug!("Using empty sector {}", sector);
                self.last_new_sector = sector;
                return Ok(sector);
            }
        }
        debug!("Unable to find a usable sector");
        Err(StoreError::ResourceExhausted)
    }

    /// Chooses the sector to garbage collect.
    ///
    /// Sectors holding only stale data are preferred, since they need no
    /// relocations; within a group, the most reclaimable bytes win.
    fn find_sector_to_garbage_collect(&self) -> Option<usize> {
        let sector_size = self.partition.sector_size_bytes();
        let mut candidate: Option<usize> = None;
        let mut candidate_bytes = 0;

        for (index, sector) in self.sectors.iter().enumerate() {
            if sector.valid_bytes() == 0 && sector.recoverable_bytes(sector_size) > candidate_bytes
            {
                candidate = Some(index);
                candidate_bytes = sector.recoverable_bytes(sector_size);
            }
        }
        if candidate.is_none() {
            for (index, sector) in self.sectors.iter().enumerate() {
                if sector.recoverable_bytes(sector_size) > candidate_bytes {
                    candidate = Some(index);
                    candidate_bytes = sector.recoverable_bytes(sector_size);
                }
            }
        }

        match candidate {
            Some(index) => debug!(
                "Found sector {} to garbage collect, {} recoverable bytes",
                index, candidate_bytes
            ),
            None => debug!("Unable to find sector to garbage collect"),
        }
        candidate
    }

    /// Relocates the live entries out of `victim` and erases it.
    fn garbage_collect_sector(&mut self, victim: usize) -> StoreResult<()> {
        let sector_size = self.partition.sector_size_bytes();
        if self.sectors[victim].valid_bytes() != 0 {
            for index in 0..self.cache.len() {
                loop {
                    let address = self
                        .cache
                        .addresses(index)
                        .iter()
                        .copied()
                        .find(|&address| address as usize / sector_size == victim);
                    match address {
                        Some(address) => self.relocate_entry(index, address)?,
                        None => break,
                    }
                }
            }
        }

        if self.sectors[victim].valid_bytes() != 0 {
            error!(
                "Failed to relocate valid entries from sector {}; {} valid bytes remain",
                victim,
                self.sectors[victim].valid_bytes()
            );
            return Err(StoreError::Internal);
        }

        // Unusable until the erase completes.
        self.sectors[victim].set_writable_bytes(0);
        self.partition
            .erase((victim * sector_size) as Address, 1)?;
        self.sectors[victim].reset(sector_size);
        debug!("Garbage collect of sector {} complete", victim);
        Ok(())
    }

    /// Copies one entry to another sector, keeping its transaction id.
    fn relocate_entry(&mut self, index: usize, address: Address) -> StoreResult<()> {
        debug!(
            "Relocating entry at {:#x} for key {:#010x}",
            address,
            self.cache.descriptor(index).hash()
        );
        let mut working_buffer = core::mem::take(&mut self.working_buffer);
        let result = self.relocate_entry_into(index, address, &mut working_buffer);
        self.working_buffer = working_buffer;
        result
    }

    fn relocate_entry_into(
        &mut self,
        index: usize,
        address: Address,
        buffer: &mut [u8],
    ) -> StoreResult<()> {
        let sector_size = self.partition.sector_size_bytes();
        let entry = Entry::read(&self.partition, address, &self.formats)?;

        let mut key_buffer: KeyBuffer = [0; MAX_KEY_LENGTH];
        let key_length = entry.read_key(&self.partition, &mut key_buffer)?;
        let key =
            core::str::from_utf8(&key_buffer[..key_length]).map_err(|_| StoreError::DataLoss)?;
        let value_size = entry.value_size();
        entry.read_value(&self.partition, &mut buffer[..value_size], 0)?;
        entry.verify_checksum::<C>(key, &buffer[..value_size])?;

        // The copy must not land in a sector that already holds this key.
        let mut sectors_to_skip = [0; MAX_ADDRESS_SLOTS];
        let skip_count = self.cache.addresses(index).len();
        for (slot, &copy) in self.cache.addresses(index).iter().enumerate() {
            sectors_to_skip[slot] = copy as usize / sector_size;
        }

        let target = self.find_sector_with_space(
            entry.size(),
            FindMode::GarbageCollect,
            &sectors_to_skip[..skip_count],
        )?;
        let descriptor = *self.cache.descriptor(index);
        let new_entry = self.append_entry_with_id(
            target,
            key,
            &buffer[..value_size],
            descriptor.state(),
            descriptor.transaction_id(),
        )?;

        self.cache.replace_address(index, address, new_entry.address());
        self.sectors[address as usize / sector_size].remove_valid_bytes(entry.size());
        Ok(())
    }

    fn next_writable_address(&self, sector_index: usize) -> Address {
        let sector_size = self.partition.sector_size_bytes();
        ((sector_index + 1) * sector_size - self.sectors[sector_index].writable_bytes()) as Address
    }

    fn entry_alignment(&self) -> usize {
        self.partition.alignment_bytes().max(MIN_ALIGNMENT_BYTES)
    }
}

impl<P, C> Clone for KeyValueStore<P, C>
where
    P: FlashPartition + Clone,
    C: ChecksumAlgorithm + Default,
{
    fn clone(&self) -> KeyValueStore<P, C> {
        KeyValueStore {
            partition: self.partition.clone(),
            formats: self.formats.clone(),
            options: self.options,
            cache: self.cache.clone(),
            sectors: self.sectors.clone(),
            working_buffer: self.working_buffer.clone(),
            last_new_sector: self.last_new_sector,
            last_transaction_id: self.last_transaction_id,
            initialized: self.initialized,
            checksum: PhantomData,
        }
    }
}

/// Iterator over the present keys of a store.
pub struct Iter<'a, P: FlashPartition, C: ChecksumAlgorithm + Default> {
    store: &'a KeyValueStore<P, C>,
    index: usize,
}

impl<'a, P: FlashPartition, C: ChecksumAlgorithm + Default> Iterator for Iter<'a, P, C> {
    type Item = Item<'a, P, C>;

    fn next(&mut self) -> Option<Item<'a, P, C>> {
        while self.index < self.store.cache.len() {
            let current = self.index;
            self.index += 1;
            if self.store.cache.descriptor(current).deleted() {
                continue;
            }
            let mut item = Item {
                store: self.store,
                descriptor_index: current,
                key_buffer: [0; MAX_KEY_LENGTH + 1],
            };
            item.read_key();
            return Some(item);
        }
        None
    }
}

/// One present key yielded by iteration.
pub struct Item<'a, P: FlashPartition, C: ChecksumAlgorithm + Default> {
    store: &'a KeyValueStore<P, C>,
    descriptor_index: usize,

    /// Buffer large enough for a null-terminated version of any valid key.
    key_buffer: [u8; MAX_KEY_LENGTH + 1],
}

impl<'a, P: FlashPartition, C: ChecksumAlgorithm + Default> Item<'a, P, C> {
    /// The entry's key.
    pub fn key(&self) -> &str {
        let length = self
            .key_buffer
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(MAX_KEY_LENGTH);
        core::str::from_utf8(&self.key_buffer[..length]).unwrap_or("")
    }

    /// Reads the entry's value. Equivalent to [`KeyValueStore::get`].
    pub fn get(&self, value: &mut [u8], offset: usize) -> StoreResult<usize> {
        self.store
            .get_by_descriptor(self.descriptor_index, self.key(), value, offset)
    }

    /// Reads the size of the entry's value. Equivalent to
    /// [`KeyValueStore::value_size`].
    pub fn value_size(&self) -> StoreResult<usize> {
        self.store.value_size_by_descriptor(self.descriptor_index)
    }

    fn read_key(&mut self) {
        let store = self.store;
        let address = store.cache.first_address(self.descriptor_index);
        if let Ok(entry) = Entry::read(&store.partition, address, &store.formats) {
            let mut key: KeyBuffer = [0; MAX_KEY_LENGTH];
            if let Ok(length) = entry.read_key(&store.partition, &mut key) {
                self.key_buffer[..length].copy_from_slice(&key[..length]);
            }
        }
    }
}

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

use flash_kvs::{
    BufferOptions, BufferPartition, Crc16Ccitt, EntryFormat, ErrorRecovery, FlashPartition,
    GarbageCollectOnWrite, KeyValueStore, Options, StoreError,
};

const FORMAT: EntryFormat = EntryFormat { magic: 0x600d_f00d };

const SECTOR_SIZE: usize = 4096;
const SECTOR_COUNT: usize = 4;
const MAX_ENTRIES: usize = 16;

type Store = KeyValueStore<BufferPartition, Crc16Ccitt>;

fn buffer_options(sector_size_bytes: usize) -> BufferOptions {
    BufferOptions {
        alignment_bytes: 16,
        sector_size_bytes,
        max_write_cycles: 2,
        max_erase_cycles: 10000,
        strict_mode: true,
    }
}

fn new_partition() -> BufferPartition {
    BufferPartition::new(
        vec![0xff; SECTOR_COUNT * SECTOR_SIZE].into_boxed_slice(),
        buffer_options(SECTOR_SIZE),
    )
}

fn store_options() -> Options {
    Options {
        max_entries: MAX_ENTRIES,
        max_usable_sectors: SECTOR_COUNT,
        ..Options::default()
    }
}

fn new_store() -> Store {
    let mut store = KeyValueStore::new(new_partition(), &[FORMAT], store_options()).unwrap();
    store.init().unwrap();
    store
}

/// Tears the store down and initializes a fresh one over the same flash.
fn power_cycle(store: Store) -> (Store, flash_kvs::StoreResult<()>) {
    let partition = store.into_partition();
    let mut store = KeyValueStore::new(partition, &[FORMAT], store_options()).unwrap();
    let result = store.init();
    (store, result)
}

#[test]
fn init_on_erased_partition() {
    let store = new_store();
    assert_eq!(store.size(), 0);
    assert!(store.is_empty());
    assert_eq!(store.transaction_count(), 0);
    let stats = store.storage_stats();
    // One sector is held in reserve for garbage collection.
    assert_eq!(stats.writable_bytes, (SECTOR_COUNT - 1) * SECTOR_SIZE);
    assert_eq!(stats.in_use_bytes, 0);
    assert_eq!(stats.reclaimable_bytes, 0);
}

#[test]
fn put_and_get() {
    let mut store = new_store();
    store.put("alpha", &[0x01, 0x02, 0x03]).unwrap();
    let mut value = [0u8; 16];
    assert_eq!(store.get("alpha", &mut value, 0).unwrap(), 3);
    assert_eq!(&value[..3], &[1, 2, 3]);
    assert_eq!(store.value_size("alpha").unwrap(), 3);
    assert_eq!(store.transaction_count(), 1);
    assert_eq!(store.size(), 1);
}

#[test]
fn empty_values_round_trip() {
    let mut store = new_store();
    store.put("flag", &[]).unwrap();
    let mut value = [0u8; 4];
    assert_eq!(store.get("flag", &mut value, 0).unwrap(), 0);
    assert_eq!(store.value_size("flag").unwrap(), 0);
    assert_eq!(store.size(), 1);
}

#[test]
fn overwrite_reclaims_old_entry_space() {
    let mut store = new_store();
    store.put("alpha", &[0x01, 0x02, 0x03]).unwrap();
    // 16 B header + 5 B key + 3 B value, padded to 16 B alignment.
    let first_entry_size = 32;
    store.put("alpha", &[0x09]).unwrap();
    let mut value = [0u8; 16];
    assert_eq!(store.get("alpha", &mut value, 0).unwrap(), 1);
    assert_eq!(value[0], 9);
    assert_eq!(store.transaction_count(), 2);
    // The superseded copy is now reclaimable.
    assert_eq!(store.storage_stats().reclaimable_bytes, first_entry_size);
}

#[test]
fn delete_hides_key_and_iteration() {
    let mut store = new_store();
    store.put("alpha", &[1, 2, 3]).unwrap();
    store.delete("alpha").unwrap();

    let mut value = [0u8; 16];
    assert_eq!(
        store.get("alpha", &mut value, 0).unwrap_err(),
        StoreError::NotFound
    );
    assert_eq!(
        store.value_size("alpha").unwrap_err(),
        StoreError::NotFound
    );
    assert_eq!(store.delete("alpha").unwrap_err(), StoreError::NotFound);
    assert_eq!(store.size(), 0);
    assert_eq!(store.iter().count(), 0);
    assert_eq!(store.transaction_count(), 2);

    // The key can be written again.
    store.put("alpha", &[7]).unwrap();
    assert_eq!(store.get("alpha", &mut value, 0).unwrap(), 1);
    assert_eq!(value[0], 7);
}

#[test]
fn fill_then_garbage_collect_then_update() {
    let mut store = new_store();
    let mut keys = Vec::new();
    // Fill with distinct keys until the store rejects a new one.
    for i in 0.. {
        let key = format!("key{}", i);
        match store.put(&key, &[i as u8; 8]) {
            Ok(()) => keys.push((key, i as u8)),
            Err(error) => {
                assert_eq!(error, StoreError::ResourceExhausted);
                break;
            }
        }
    }
    assert_eq!(keys.len(), MAX_ENTRIES);

    store.garbage_collect_full().unwrap();

    // No visible change to any key.
    let mut value = [0u8; 8];
    for (key, byte) in &keys {
        assert_eq!(store.get(key, &mut value, 0).unwrap(), 8);
        assert_eq!(value, [*byte; 8]);
    }
    // Updating an existing key still succeeds.
    store.put(&keys[0].0, &[0xee; 4]).unwrap();
    assert_eq!(store.get(&keys[0].0, &mut value, 0).unwrap(), 4);
    assert_eq!(&value[..4], &[0xee; 4]);
}

#[test]
fn truncated_write_is_detected_on_init() {
    let mut store = new_store();
    // One initial write and 100 overwrites. The value fills the entry to its
    // aligned size, so a truncated last byte cannot hide in the padding.
    for i in 0..=100u8 {
        store.put("k", &[i; 15]).unwrap();
    }
    assert_eq!(store.transaction_count(), 101);

    // Interrupt the next overwrite during its second flash write and drop
    // the last byte of what would have been written.
    store.partition_mut().arm_interruption(1);
    assert_eq!(store.put("k", &[101; 15]).unwrap_err(), StoreError::Unknown);
    let mut partition = store.into_partition();
    partition.corrupt_operation(Box::new(|before, after| {
        let last = before.len() - 1;
        before[..last].copy_from_slice(&after[..last]);
    }));

    let mut store: Store = KeyValueStore::new(partition, &[FORMAT], store_options()).unwrap();
    assert_eq!(store.init().unwrap_err(), StoreError::DataLoss);

    // The store is usable and serves the last complete write.
    let mut value = [0u8; 15];
    assert_eq!(store.get("k", &mut value, 0).unwrap(), 15);
    assert_eq!(value, [100; 15]);
    assert!(store.transaction_count() >= 101);

    // Writes still work after the data loss.
    store.put("k", &[0xaa; 4]).unwrap();
    let mut value = [0u8; 4];
    assert_eq!(store.get("k", &mut value, 0).unwrap(), 4);
    assert_eq!(value, [0xaa; 4]);
}

#[test]
fn values_survive_power_cycles() {
    let mut store = new_store();
    store.put("first", b"one").unwrap();
    store.put("second", b"two").unwrap();
    store.put("third", b"three").unwrap();
    store.delete("second").unwrap();
    store.put("third", b"THREE").unwrap();
    let transactions = store.transaction_count();

    let (store, result) = power_cycle(store);
    result.unwrap();

    let mut value = [0u8; 16];
    assert_eq!(store.get("first", &mut value, 0).unwrap(), 3);
    assert_eq!(&value[..3], b"one");
    assert_eq!(store.get("third", &mut value, 0).unwrap(), 5);
    assert_eq!(&value[..5], b"THREE");
    // Deleted keys stay deleted; the stale copy on flash cannot resurrect
    // them.
    assert_eq!(
        store.get("second", &mut value, 0).unwrap_err(),
        StoreError::NotFound
    );
    assert_eq!(store.size(), 2);
    assert_eq!(store.transaction_count(), transactions);
}

#[test]
fn argument_validation() {
    let mut store = new_store();
    let mut value = [0u8; 4];
    let long_key = "k".repeat(64);
    assert_eq!(
        store.put("", &[1]).unwrap_err(),
        StoreError::InvalidArgument
    );
    assert_eq!(
        store.put(&long_key, &[1]).unwrap_err(),
        StoreError::InvalidArgument
    );
    assert_eq!(
        store.get("", &mut value, 0).unwrap_err(),
        StoreError::InvalidArgument
    );
    assert_eq!(
        store.delete(&long_key).unwrap_err(),
        StoreError::InvalidArgument
    );
    // A 63-byte key is the maximum and works.
    let max_key = "m".repeat(63);
    store.put(&max_key, &[2]).unwrap();
    assert_eq!(store.get(&max_key, &mut value, 0).unwrap(), 1);
    // An entry larger than one sector is rejected.
    assert_eq!(
        store.put("big", &vec![0; SECTOR_SIZE]).unwrap_err(),
        StoreError::InvalidArgument
    );
}

#[test]
fn operations_require_initialization() {
    let mut store: Store =
        KeyValueStore::new(new_partition(), &[FORMAT], store_options()).unwrap();
    assert!(!store.initialized());
    let mut value = [0u8; 4];
    assert_eq!(
        store.get("key", &mut value, 0).unwrap_err(),
        StoreError::FailedPrecondition
    );
    assert_eq!(
        store.put("key", &[1]).unwrap_err(),
        StoreError::FailedPrecondition
    );
    assert_eq!(
        store.delete("key").unwrap_err(),
        StoreError::FailedPrecondition
    );
}

#[test]
fn init_rejects_undersized_sector_table() {
    let partition = new_partition();
    let options = Options {
        max_usable_sectors: SECTOR_COUNT - 1,
        ..store_options()
    };
    let mut store: Store = KeyValueStore::new(partition, &[FORMAT], options).unwrap();
    assert_eq!(store.init().unwrap_err(), StoreError::FailedPrecondition);
}

#[test]
fn get_with_offset_and_partial_reads() {
    let mut store = new_store();
    let value: Vec<u8> = (0u8..50).collect();
    store.put("chunked", &value).unwrap();

    // A too-small buffer is filled completely and reports exhaustion.
    let mut buf = [0u8; 20];
    assert_eq!(
        store.get("chunked", &mut buf, 0).unwrap_err(),
        StoreError::ResourceExhausted
    );
    assert_eq!(&buf[..], &value[..20]);
    // The rest can be read with offsets.
    assert_eq!(
        store.get("chunked", &mut buf, 20).unwrap_err(),
        StoreError::ResourceExhausted
    );
    assert_eq!(&buf[..], &value[20..40]);
    assert_eq!(store.get("chunked", &mut buf, 40).unwrap(), 10);
    assert_eq!(&buf[..10], &value[40..]);
}

#[test]
fn iteration_yields_all_present_keys() {
    let mut store = new_store();
    store.put("one", &[1]).unwrap();
    store.put("two", &[2]).unwrap();
    store.put("three", &[3]).unwrap();
    store.delete("two").unwrap();

    let mut seen = Vec::new();
    for item in store.iter() {
        let mut value = [0u8; 4];
        let read = item.get(&mut value, 0).unwrap();
        assert_eq!(item.value_size().unwrap(), read);
        seen.push((item.key().to_string(), value[0]));
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![("one".to_string(), 1), ("three".to_string(), 3)]
    );
}

#[test]
fn hash_collision_is_rejected() {
    // "l98cu" and "pvdba" have the same CRC-32 (0x5304d385), so the second
    // key cannot be stored while the first is present, deleted or not.
    let mut store = new_store();
    store.put("l98cu", &[1]).unwrap();
    assert_eq!(
        store.put("pvdba", &[2]).unwrap_err(),
        StoreError::AlreadyExists
    );
    // The colliding key reads as absent.
    let mut value = [0u8; 4];
    assert_eq!(
        store.get("pvdba", &mut value, 0).unwrap_err(),
        StoreError::NotFound
    );
    // The original is unaffected.
    assert_eq!(store.get("l98cu", &mut value, 0).unwrap(), 1);
}

#[test]
fn garbage_collection_is_idempotent() {
    let mut store = new_store();
    for i in 0..8u8 {
        store.put("churn", &[i; 100]).unwrap();
    }
    store.put("keep", &[0x42; 10]).unwrap();

    store.garbage_collect_full().unwrap();
    let stats = store.storage_stats();
    assert_eq!(stats.reclaimable_bytes, 0);
    store.garbage_collect_full().unwrap();
    assert_eq!(store.storage_stats(), stats);

    let mut value = [0u8; 100];
    assert_eq!(store.get("churn", &mut value, 0).unwrap(), 100);
    assert_eq!(value, [7; 100]);
}

#[test]
fn gc_on_write_reclaims_space_transparently() {
    // Small sectors: overwrites exhaust the free space quickly, so puts
    // trigger garbage collection internally.
    let options = Options {
        max_entries: 8,
        max_usable_sectors: 4,
        ..Options::default()
    };
    let partition = BufferPartition::new(
        vec![0xff; 4 * 512].into_boxed_slice(),
        buffer_options(512),
    );
    let mut store: Store = KeyValueStore::new(partition, &[FORMAT], options).unwrap();
    store.init().unwrap();

    for i in 0..100u8 {
        store.put("cycled", &[i; 60]).unwrap();
    }
    let mut value = [0u8; 60];
    assert_eq!(store.get("cycled", &mut value, 0).unwrap(), 60);
    assert_eq!(value, [99; 60]);
    assert!(store.transaction_count() >= 100);
}

#[test]
fn disabled_gc_on_write_surfaces_exhaustion() {
    let options = Options {
        gc_on_write: GarbageCollectOnWrite::Disabled,
        max_entries: 8,
        max_usable_sectors: 4,
        ..Options::default()
    };
    let partition = BufferPartition::new(
        vec![0xff; 4 * 512].into_boxed_slice(),
        buffer_options(512),
    );
    let mut store: Store = KeyValueStore::new(partition, &[FORMAT], options).unwrap();
    store.init().unwrap();

    let mut result = Ok(());
    for i in 0..100u8 {
        result = store.put("cycled", &[i; 60]);
        if result.is_err() {
            break;
        }
    }
    assert_eq!(result.unwrap_err(), StoreError::ResourceExhausted);

    // An explicit collection recovers the space.
    store.garbage_collect_full().unwrap();
    store.put("cycled", &[0xbb; 60]).unwrap();
}

#[test]
fn read_verification_zeroes_corrupt_values() {
    let mut store = new_store();
    store.put("fragile", &[0xaa; 12]).unwrap();

    // Decay one bit of the stored value, as worn flash might.
    let value_address = {
        // The entry is the first in its sector: header at the base, then the
        // 7-byte key, then the value.
        let sector = store
            .partition()
            .sector_size_bytes();
        let base = (1..4)
            .map(|i| (i * sector) as u32)
            .find(|&base| {
                let mut magic = [0u8; 4];
                store.partition().read(base, &mut magic).unwrap();
                magic != [0xff; 4]
            })
            .unwrap();
        base + 16 + 7
    };
    let unit = value_address / 16 * 16;
    let mut bytes = [0u8; 16];
    store.partition().read(unit, &mut bytes).unwrap();
    bytes[(value_address - unit) as usize] &= !0x08;
    store.partition_mut().write(unit, &bytes).unwrap();

    let mut value = [0u8; 12];
    assert_eq!(
        store.get("fragile", &mut value, 0).unwrap_err(),
        StoreError::DataLoss
    );
    // The output buffer does not leak the corrupt bytes.
    assert_eq!(value, [0; 12]);
}

#[test]
fn corrupt_sector_is_quarantined_and_recovered() {
    for recovery in [ErrorRecovery::Lazy, ErrorRecovery::Immediate] {
        let mut store = new_store();
        store.put("stable", &[0x11; 8]).unwrap();
        store.put("churn", &[0x22; 8]).unwrap();
        store.put("churn", &[0x33; 8]).unwrap();

        // Corrupt the first (superseded) copy of "churn" on flash: flip a
        // bit in its value so its checksum fails on the next init.
        let sector = store.partition().sector_size_bytes();
        let base = (1..4)
            .map(|i| (i * sector) as u32)
            .find(|&base| {
                let mut magic = [0u8; 4];
                store.partition().read(base, &mut magic).unwrap();
                magic != [0xff; 4]
            })
            .unwrap();
        // Entries are 32 B each; the second entry is the first "churn" copy.
        let unit = base + 32 + 16;
        let mut bytes = [0u8; 16];
        store.partition().read(unit, &mut bytes).unwrap();
        bytes[6] &= !0x20;
        store.partition_mut().write(unit, &bytes).unwrap();

        let partition = store.into_partition();
        let options = Options {
            recovery,
            ..store_options()
        };
        let mut store: Store = KeyValueStore::new(partition, &[FORMAT], options).unwrap();
        assert_eq!(store.init().unwrap_err(), StoreError::DataLoss);

        // Intact entries are unaffected either way.
        let mut value = [0u8; 8];
        assert_eq!(store.get("stable", &mut value, 0).unwrap(), 8);
        assert_eq!(value, [0x11; 8]);
        assert_eq!(store.get("churn", &mut value, 0).unwrap(), 8);
        assert_eq!(value, [0x33; 8]);

        match recovery {
            // Immediate recovery reclaims the quarantined sector at init.
            ErrorRecovery::Immediate => {
                assert_eq!(store.storage_stats().reclaimable_bytes, 0)
            }
            // Lazy recovery leaves it to the next collection.
            ErrorRecovery::Lazy => {
                assert!(store.storage_stats().reclaimable_bytes > 0);
                store.garbage_collect_full().unwrap();
                assert_eq!(store.storage_stats().reclaimable_bytes, 0);
            }
        }
        assert_eq!(store.get("churn", &mut value, 0).unwrap(), 8);
        assert_eq!(value, [0x33; 8]);
    }
}

#[test]
fn construction_validates_configuration() {
    // No formats.
    assert!(
        KeyValueStore::<BufferPartition, Crc16Ccitt>::new(new_partition(), &[], store_options())
            .is_err()
    );
    // Zero redundancy.
    let options = Options {
        redundancy: 0,
        ..store_options()
    };
    assert!(
        KeyValueStore::<BufferPartition, Crc16Ccitt>::new(new_partition(), &[FORMAT], options)
            .is_err()
    );
    // Excessive redundancy.
    let options = Options {
        redundancy: flash_kvs::MAX_REDUNDANCY + 1,
        ..store_options()
    };
    assert!(
        KeyValueStore::<BufferPartition, Crc16Ccitt>::new(new_partition(), &[FORMAT], options)
            .is_err()
    );
}

#[test]
fn entries_written_under_other_accepted_formats_are_read() {
    // Write under the old magic, then reopen accepting both formats with a
    // new primary.
    let mut store = new_store();
    store.put("migrated", &[5; 5]).unwrap();
    let partition = store.into_partition();

    let new_format = EntryFormat { magic: 0x0fab_1e55 };
    let mut store: Store =
        KeyValueStore::new(partition, &[new_format, FORMAT], store_options()).unwrap();
    store.init().unwrap();

    let mut value = [0u8; 8];
    assert_eq!(store.get("migrated", &mut value, 0).unwrap(), 5);
    assert_eq!(&value[..5], &[5; 5]);

    // New writes carry the new magic and coexist with the old entries.
    store.put("fresh", &[6; 6]).unwrap();
    assert_eq!(store.get("fresh", &mut value, 0).unwrap(), 6);
}

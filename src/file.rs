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

//! File-backed flash partition for host tooling.
//!
//! [`FilePartition`] implements the [`FlashPartition`] interface but doesn't
//! interface with an actual flash device. Instead it uses a host file to
//! persist the partition state between runs.

use crate::buffer::{BufferOptions, BufferPartition};
use crate::partition::{Address, FlashPartition, PartitionError, PartitionResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Simulates a flash partition using a host file.
///
/// Provides the same behavior as [`BufferPartition`], but stored content
/// survives application restarts. Write and erase cycle counters are not
/// persisted.
pub struct FilePartition {
    /// Content of the partition.
    partition: BufferPartition,

    /// File persisting the partition content.
    backing_file: File,
}

impl FilePartition {
    /// Opens or creates a file-backed partition of `sector_count` sectors.
    ///
    /// # Panics
    ///
    /// Panics if the file exists but its size does not match the requested
    /// geometry.
    pub fn new(path: &Path, options: BufferOptions, sector_count: usize) -> PartitionResult<FilePartition> {
        let size = sector_count * options.sector_size_bytes;
        let mut partition =
            BufferPartition::new(vec![0xff; size].into_boxed_slice(), options);

        let mut backing_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|_| PartitionError::Custom)?;
        let file_len = backing_file
            .metadata()
            .map_err(|_| PartitionError::Custom)?
            .len();

        if file_len == 0 {
            // Fresh file: persist the erased partition.
            backing_file
                .set_len(size as u64)
                .and_then(|_| backing_file.seek(SeekFrom::Start(0)))
                .and_then(|_| backing_file.write_all(&vec![0xff; size]))
                .map_err(|_| PartitionError::Custom)?;
        } else if file_len == size as u64 {
            // Existing file: rebuild the buffer from its content. Wear
            // counters restart from zero, as they are not persisted.
            let mut content = vec![0u8; size];
            backing_file
                .seek(SeekFrom::Start(0))
                .and_then(|_| backing_file.read_exact(&mut content))
                .map_err(|_| PartitionError::Custom)?;
            partition = BufferPartition::new(content.into_boxed_slice(), options);
        } else {
            panic!(
                "Invalid file size {}, should be {}",
                file_len, size
            );
        }
        Ok(FilePartition {
            partition,
            backing_file,
        })
    }
}

impl FlashPartition for FilePartition {
    fn sector_size_bytes(&self) -> usize {
        self.partition.sector_size_bytes()
    }

    fn sector_count(&self) -> usize {
        self.partition.sector_count()
    }

    fn alignment_bytes(&self) -> usize {
        self.partition.alignment_bytes()
    }

    fn read(&self, address: Address, buf: &mut [u8]) -> PartitionResult<usize> {
        self.partition.read(address, buf)
    }

    fn write(&mut self, address: Address, data: &[u8]) -> PartitionResult<usize> {
        self.backing_file
            .seek(SeekFrom::Start(address as u64))
            .and_then(|_| self.backing_file.write_all(data))
            .map_err(|_| PartitionError::Custom)?;
        self.partition.write(address, data)
    }

    fn erase(&mut self, address: Address, sector_count: usize) -> PartitionResult<()> {
        let erased = vec![0xffu8; sector_count * self.sector_size_bytes()];
        self.backing_file
            .seek(SeekFrom::Start(address as u64))
            .and_then(|_| self.backing_file.write_all(&erased))
            .map_err(|_| PartitionError::Custom)?;
        self.partition.erase(address, sector_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Crc16Ccitt;
    use crate::format::EntryFormat;
    use crate::store::{KeyValueStore, Options, StoreError};
    use tempfile::TempDir;

    const OPTIONS: BufferOptions = BufferOptions {
        alignment_bytes: 16,
        sector_size_bytes: 512,
        max_write_cycles: 2,
        max_erase_cycles: 10000,
        strict_mode: true,
    };
    const FORMAT: EntryFormat = EntryFormat { magic: 0x9d9f_51b1 };

    #[test]
    fn content_persists_across_reopen() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("partition.bin");
        {
            let partition = FilePartition::new(&path, OPTIONS, 4).unwrap();
            let mut store: KeyValueStore<_, Crc16Ccitt> =
                KeyValueStore::new(partition, &[FORMAT], Options::default()).unwrap();
            store.init().unwrap();
            store.put("persisted", b"value").unwrap();
        }
        {
            let partition = FilePartition::new(&path, OPTIONS, 4).unwrap();
            let mut store: KeyValueStore<_, Crc16Ccitt> =
                KeyValueStore::new(partition, &[FORMAT], Options::default()).unwrap();
            store.init().unwrap();
            let mut value = [0u8; 8];
            assert_eq!(store.get("persisted", &mut value, 0).unwrap(), 5);
            assert_eq!(&value[..5], b"value");
            assert_eq!(
                store.get("missing", &mut value, 0).unwrap_err(),
                StoreError::NotFound
            );
        }
    }
}

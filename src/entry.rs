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

//! On-flash entry format.
//!
//! An entry is a header, the key bytes, the value bytes, and `0xFF` padding
//! up to the entry alignment:
//!
//! | Offset | Size | Field                                       |
//! | ------:| ----:| ------------------------------------------- |
//! |      0 |    4 | `magic`                                     |
//! |      4 |    4 | `checksum` (zero-extended digest)           |
//! |      8 |    1 | `alignment_units`                           |
//! |      9 |    1 | `key_length_bytes`                          |
//! |     10 |    2 | `value_size_bytes` (`0xFFFF` for tombstone) |
//! |     12 |    4 | `transaction_id`                            |
//!
//! All fields are little-endian. The checksum covers the header with the
//! checksum field skipped, followed by the key and value bytes. An all-`0xFF`
//! header is an erased region, not an entry.

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::alignment::{align_up, AlignedWriter};
use crate::checksum::ChecksumAlgorithm;
use crate::format::{EntryFormat, EntryFormats};
use crate::partition::{Address, FlashPartition};
use crate::store::{StoreError, StoreResult};

/// Size of the entry header in bytes.
pub(crate) const HEADER_SIZE: usize = 16;

/// Minimum alignment of an entry address.
///
/// Entries always start at a multiple of the header size, whatever the
/// partition alignment is.
pub(crate) const MIN_ALIGNMENT_BYTES: usize = HEADER_SIZE;

/// Maximum length of a key in bytes.
pub const MAX_KEY_LENGTH: usize = 0b11_1111;

/// `value_size_bytes` sentinel marking a deletion record.
const TOMBSTONE_VALUE_LENGTH: u16 = 0xffff;

/// Buffer capable of holding any valid key.
pub(crate) type KeyBuffer = [u8; MAX_KEY_LENGTH];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EntryHeader {
    pub magic: u32,
    pub checksum: u32,
    pub alignment_units: u8,
    pub key_length_bytes: u8,
    pub value_size_bytes: u16,
    pub transaction_id: u32,
}

impl EntryHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.magic);
        LittleEndian::write_u32(&mut bytes[4..8], self.checksum);
        bytes[8] = self.alignment_units;
        bytes[9] = self.key_length_bytes;
        LittleEndian::write_u16(&mut bytes[10..12], self.value_size_bytes);
        LittleEndian::write_u32(&mut bytes[12..16], self.transaction_id);
        bytes
    }

    fn decode(bytes: &[u8; HEADER_SIZE]) -> EntryHeader {
        EntryHeader {
            magic: LittleEndian::read_u32(&bytes[0..4]),
            checksum: LittleEndian::read_u32(&bytes[4..8]),
            alignment_units: bytes[8],
            key_length_bytes: bytes[9],
            value_size_bytes: LittleEndian::read_u16(&bytes[10..12]),
            transaction_id: LittleEndian::read_u32(&bytes[12..16]),
        }
    }
}

/// One serialized key/value or tombstone record on flash.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Entry {
    address: Address,
    header: EntryHeader,
}

impl Entry {
    /// Reads the entry header at `address`.
    ///
    /// Returns `NotFound` if the header region is erased (and thus not an
    /// entry) and `DataLoss` if the header is not a valid entry of an
    /// accepted format.
    pub fn read<P: FlashPartition>(
        partition: &P,
        address: Address,
        formats: &EntryFormats,
    ) -> StoreResult<Entry> {
        let mut bytes = [0u8; HEADER_SIZE];
        partition.read(address, &mut bytes)?;
        if bytes.iter().all(|&byte| byte == 0xff) {
            return Err(StoreError::NotFound);
        }
        let header = EntryHeader::decode(&bytes);
        if !formats.contains(header.magic) {
            warn!(
                "Found unrecognized magic {:#010x} at address {:#x}",
                header.magic, address
            );
            return Err(StoreError::DataLoss);
        }
        if header.key_length_bytes == 0 || header.key_length_bytes as usize > MAX_KEY_LENGTH {
            warn!(
                "Entry at address {:#x} has invalid key length {}",
                address, header.key_length_bytes
            );
            return Err(StoreError::DataLoss);
        }
        let entry = Entry { address, header };
        // The encoded alignment determines the entry size. A size that runs
        // past the end of the sector cannot be a real entry.
        let sector_size = partition.sector_size_bytes();
        let sector_end = (address as usize / sector_size + 1) * sector_size;
        if address as usize + entry.size() > sector_end {
            warn!(
                "Entry at address {:#x} claims {} B, which overruns its sector",
                address,
                entry.size()
            );
            return Err(StoreError::DataLoss);
        }
        Ok(entry)
    }

    /// Creates a new entry for a present key.
    pub fn valid<C: ChecksumAlgorithm + Default>(
        address: Address,
        format: EntryFormat,
        key: &str,
        value: &[u8],
        transaction_id: u32,
        alignment_bytes: usize,
    ) -> Entry {
        debug_assert!(value.len() < TOMBSTONE_VALUE_LENGTH as usize);
        Entry::new::<C>(
            address,
            format,
            key,
            value,
            value.len() as u16,
            transaction_id,
            alignment_bytes,
        )
    }

    /// Creates a new tombstone entry, which marks a deleted key.
    pub fn tombstone<C: ChecksumAlgorithm + Default>(
        address: Address,
        format: EntryFormat,
        key: &str,
        transaction_id: u32,
        alignment_bytes: usize,
    ) -> Entry {
        Entry::new::<C>(
            address,
            format,
            key,
            &[],
            TOMBSTONE_VALUE_LENGTH,
            transaction_id,
            alignment_bytes,
        )
    }

    fn new<C: ChecksumAlgorithm + Default>(
        address: Address,
        format: EntryFormat,
        key: &str,
        value: &[u8],
        value_size_bytes: u16,
        transaction_id: u32,
        alignment_bytes: usize,
    ) -> Entry {
        debug_assert!(!key.is_empty() && key.len() <= MAX_KEY_LENGTH);
        let mut header = EntryHeader {
            magic: format.magic,
            checksum: 0,
            alignment_units: alignment_bytes_to_units(alignment_bytes),
            key_length_bytes: key.len() as u8,
            value_size_bytes,
            transaction_id,
        };
        header.checksum = compute_checksum::<C>(&header, key.as_bytes(), value);
        Entry { address, header }
    }

    /// Calculates the total size of an entry, including padding.
    pub fn size_for(partition_alignment: usize, key: &str, value_len: usize) -> usize {
        align_up(
            HEADER_SIZE + key.len() + value_len,
            partition_alignment.max(MIN_ALIGNMENT_BYTES),
        )
    }

    /// Serializes the entry to flash, padding with `0xFF` to its aligned
    /// size.
    ///
    /// Returns the number of bytes physically written along with the write
    /// status, so callers can account for the consumed sector space even
    /// when the write fails partway.
    pub fn write<P: FlashPartition>(
        &self,
        partition: &mut P,
        key: &str,
        value: &[u8],
    ) -> (usize, StoreResult<()>) {
        let mut writer = AlignedWriter::new(partition, self.address, self.alignment_bytes());
        let result = self.write_parts(&mut writer, key, value);
        (writer.bytes_written(), result)
    }

    fn write_parts<P: FlashPartition>(
        &self,
        writer: &mut AlignedWriter<P>,
        key: &str,
        value: &[u8],
    ) -> StoreResult<()> {
        writer.write(&self.header.encode())?;
        writer.write(key.as_bytes())?;
        writer.write(value)?;
        writer.pad(self.size() - self.content_size())?;
        debug_assert_eq!(writer.bytes_buffered(), 0);
        Ok(())
    }

    /// Reads the key into `buf`, returning its length.
    pub fn read_key<P: FlashPartition>(
        &self,
        partition: &P,
        buf: &mut KeyBuffer,
    ) -> StoreResult<usize> {
        let length = self.key_length();
        partition.read(self.address + HEADER_SIZE as Address, &mut buf[..length])?;
        Ok(length)
    }

    /// Reads the value into `buf`, starting `offset` bytes into the value.
    ///
    /// If `buf` cannot hold the remainder of the value, it is filled
    /// completely and `ResourceExhausted` is returned; the caller may resume
    /// with a larger offset.
    pub fn read_value<P: FlashPartition>(
        &self,
        partition: &P,
        buf: &mut [u8],
        offset: usize,
    ) -> StoreResult<usize> {
        let value_size = self.value_size();
        if offset > value_size {
            return Err(StoreError::InvalidArgument);
        }
        let remaining = value_size - offset;
        let n = remaining.min(buf.len());
        let value_address = self.address + (HEADER_SIZE + self.key_length() + offset) as Address;
        partition.read(value_address, &mut buf[..n])?;
        if n < remaining {
            return Err(StoreError::ResourceExhausted);
        }
        Ok(n)
    }

    /// Verifies the checksum against key and value bytes held in memory.
    pub fn verify_checksum<C: ChecksumAlgorithm + Default>(
        &self,
        key: &str,
        value: &[u8],
    ) -> StoreResult<()> {
        let bytes = self.header.encode();
        let mut algo = C::default();
        algo.update(&bytes[..4]);
        algo.update(&bytes[8..]);
        algo.update(key.as_bytes());
        algo.update(value);
        if algo.verify(self.header.checksum) {
            Ok(())
        } else {
            warn!(
                "Entry at address {:#x} failed checksum against stored value {:#010x}",
                self.address, self.header.checksum
            );
            Err(StoreError::DataLoss)
        }
    }

    /// Streams the entry back from flash and verifies its checksum.
    pub fn verify_checksum_in_flash<P: FlashPartition, C: ChecksumAlgorithm + Default>(
        &self,
        partition: &P,
    ) -> StoreResult<()> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        partition.read(self.address, &mut header_bytes)?;
        let expected = LittleEndian::read_u32(&header_bytes[4..8]);

        let mut algo = C::default();
        algo.update(&header_bytes[..4]);
        algo.update(&header_bytes[8..]);

        let mut remaining = self.key_length() + self.value_size();
        let mut address = self.address + HEADER_SIZE as Address;
        let mut chunk = [0u8; 64];
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            partition.read(address, &mut chunk[..n])?;
            algo.update(&chunk[..n]);
            address += n as Address;
            remaining -= n;
        }

        if algo.verify(expected) {
            Ok(())
        } else {
            warn!(
                "Entry at address {:#x} failed checksum verification in flash",
                self.address
            );
            Err(StoreError::DataLoss)
        }
    }

    /// The address of the entry header.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The address at which the next entry could be located.
    pub fn next_address(&self) -> Address {
        self.address + self.size() as Address
    }

    /// Total size of the entry on flash, including padding.
    pub fn size(&self) -> usize {
        align_up(self.content_size(), self.alignment_bytes())
    }

    /// The length of the key in bytes.
    pub fn key_length(&self) -> usize {
        (self.header.key_length_bytes & MAX_KEY_LENGTH as u8) as usize
    }

    /// The size of the value in bytes; 0 for a tombstone.
    pub fn value_size(&self) -> usize {
        if self.deleted() {
            0
        } else {
            self.header.value_size_bytes as usize
        }
    }

    /// Whether this entry marks its key as deleted.
    pub fn deleted(&self) -> bool {
        self.header.value_size_bytes == TOMBSTONE_VALUE_LENGTH
    }

    pub fn transaction_id(&self) -> u32 {
        self.header.transaction_id
    }

    fn alignment_bytes(&self) -> usize {
        (self.header.alignment_units as usize + 1) * 16
    }

    /// The total size of the entry, excluding padding.
    fn content_size(&self) -> usize {
        HEADER_SIZE + self.key_length() + self.value_size()
    }
}

fn alignment_bytes_to_units(alignment_bytes: usize) -> u8 {
    debug_assert!(alignment_bytes > 0);
    ((alignment_bytes + 15) / 16 - 1) as u8
}

fn compute_checksum<C: ChecksumAlgorithm + Default>(
    header: &EntryHeader,
    key: &[u8],
    value: &[u8],
) -> u32 {
    let bytes = header.encode();
    let mut algo = C::default();
    algo.update(&bytes[..4]);
    algo.update(&bytes[8..]);
    algo.update(key);
    algo.update(value);
    algo.finish()
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::buffer::{BufferOptions, BufferPartition};
    use crate::checksum::Crc16Ccitt;
    use alloc::vec;
    use alloc::vec::Vec;

    const FORMAT: EntryFormat = EntryFormat { magic: 0x9d9f_51b1 };

    fn test_partition() -> BufferPartition {
        let options = BufferOptions {
            alignment_bytes: 16,
            sector_size_bytes: 512,
            max_write_cycles: 2,
            max_erase_cycles: 100,
            strict_mode: true,
        };
        BufferPartition::new(vec![0xff; 1024].into_boxed_slice(), options)
    }

    fn formats() -> EntryFormats {
        EntryFormats::new(&[FORMAT]).unwrap()
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut partition = test_partition();
        let entry = Entry::valid::<Crc16Ccitt>(0, FORMAT, "key", &[1, 2, 3], 7, 16);
        let (written, result) = entry.write(&mut partition, "key", &[1, 2, 3]);
        result.unwrap();
        assert_eq!(written, entry.size());
        assert_eq!(entry.size(), 32);

        let read_back = Entry::read(&partition, 0, &formats()).unwrap();
        assert_eq!(read_back.transaction_id(), 7);
        assert_eq!(read_back.key_length(), 3);
        assert_eq!(read_back.value_size(), 3);
        assert!(!read_back.deleted());
        assert_eq!(read_back.next_address(), 32);

        let mut key = [0u8; MAX_KEY_LENGTH];
        assert_eq!(read_back.read_key(&partition, &mut key).unwrap(), 3);
        assert_eq!(&key[..3], b"key");

        let mut value = [0u8; 8];
        assert_eq!(read_back.read_value(&partition, &mut value, 0).unwrap(), 3);
        assert_eq!(&value[..3], &[1, 2, 3]);

        read_back
            .verify_checksum_in_flash::<_, Crc16Ccitt>(&partition)
            .unwrap();
    }

    #[test]
    fn erased_region_is_not_found() {
        let partition = test_partition();
        assert_eq!(
            Entry::read(&partition, 0, &formats()).unwrap_err(),
            StoreError::NotFound
        );
    }

    #[test]
    fn unknown_magic_is_data_loss() {
        let mut partition = test_partition();
        let other = EntryFormat { magic: 0x0bad_0bad };
        let entry = Entry::valid::<Crc16Ccitt>(0, other, "key", &[1], 1, 16);
        entry.write(&mut partition, "key", &[1]).1.unwrap();
        assert_eq!(
            Entry::read(&partition, 0, &formats()).unwrap_err(),
            StoreError::DataLoss
        );
    }

    #[test]
    fn corrupt_value_fails_flash_verification() {
        let mut partition = test_partition();
        let entry = Entry::valid::<Crc16Ccitt>(0, FORMAT, "key", &[0xaa; 13], 1, 16);
        entry.write(&mut partition, "key", &[0xaa; 13]).1.unwrap();
        // Clear one value bit; on flash a 1 can decay to 0 without an erase.
        use crate::partition::FlashPartition;
        let mut unit = [0u8; 16];
        partition.read(16, &mut unit).unwrap();
        unit[4] &= !0x02;
        partition.write(16, &unit).unwrap();
        let read_back = Entry::read(&partition, 0, &formats()).unwrap();
        assert_eq!(
            read_back
                .verify_checksum_in_flash::<_, Crc16Ccitt>(&partition)
                .unwrap_err(),
            StoreError::DataLoss
        );
    }

    #[test]
    fn tombstone_round_trip() {
        let mut partition = test_partition();
        let entry = Entry::tombstone::<Crc16Ccitt>(0, FORMAT, "gone", 9, 16);
        entry.write(&mut partition, "gone", &[]).1.unwrap();
        let read_back = Entry::read(&partition, 0, &formats()).unwrap();
        assert!(read_back.deleted());
        assert_eq!(read_back.value_size(), 0);
        assert_eq!(read_back.size(), 32);
        read_back
            .verify_checksum_in_flash::<_, Crc16Ccitt>(&partition)
            .unwrap();
    }

    #[test]
    fn size_includes_padding() {
        assert_eq!(Entry::size_for(16, "k", 0), 32);
        assert_eq!(Entry::size_for(16, "k", 15), 32);
        assert_eq!(Entry::size_for(16, "k", 16), 48);
        assert_eq!(Entry::size_for(64, "k", 1), 64);
    }

    #[test]
    fn oversized_header_is_data_loss() {
        let mut partition = test_partition();
        // Craft a header whose alignment units put the entry's end past its
        // sector, as a bit flip in the alignment byte would.
        let entry = Entry::valid::<Crc16Ccitt>(0, FORMAT, "key", &[1], 1, 16);
        let mut bytes = entry.header.encode();
        bytes[8] = 0xff; // 4096-byte alignment in a 512-byte sector
        use crate::partition::FlashPartition;
        partition.write(0, &bytes).unwrap();
        assert_eq!(
            Entry::read(&partition, 0, &formats()).unwrap_err(),
            StoreError::DataLoss
        );
    }

    #[test]
    fn value_read_with_offset_and_small_buffer() {
        let mut partition = test_partition();
        let value: Vec<u8> = (0u8..40).collect();
        let entry = Entry::valid::<Crc16Ccitt>(0, FORMAT, "key", &value, 1, 16);
        entry.write(&mut partition, "key", &value).1.unwrap();
        let read_back = Entry::read(&partition, 0, &formats()).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(
            read_back.read_value(&partition, &mut buf, 0).unwrap_err(),
            StoreError::ResourceExhausted
        );
        assert_eq!(&buf[..], &value[..16]);
        assert_eq!(read_back.read_value(&partition, &mut buf, 32).unwrap(), 8);
        assert_eq!(&buf[..8], &value[32..]);
        assert_eq!(
            read_back.read_value(&partition, &mut buf, 41).unwrap_err(),
            StoreError::InvalidArgument
        );
    }
}

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

//! Alignment arithmetic and aligned flash output.

use crate::partition::{Address, FlashPartition, PartitionResult};

/// Maximum write alignment supported by [`AlignedWriter`].
pub(crate) const MAX_ALIGNMENT_BYTES: usize = 256;

/// Rounds `value` up to the next multiple of `alignment`.
pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    ((value + alignment - 1) / alignment) * alignment
}

/// Rounds `value` down to a multiple of `alignment`.
pub(crate) const fn align_down(value: usize, alignment: usize) -> usize {
    (value / alignment) * alignment
}

/// Writes a byte stream to a flash partition in whole alignment units.
///
/// Callers feed arbitrarily sized slices; the writer buffers the ragged tail
/// and only ever issues partition writes whose address and length are
/// multiples of the alignment. [`AlignedWriter::pad`] fills the remainder of
/// the last unit with `0xFF` so the stream ends on an alignment boundary.
///
/// The number of bytes handed to the partition is tracked even when a write
/// fails, so callers can account for partially written regions.
pub(crate) struct AlignedWriter<'a, P: FlashPartition> {
    partition: &'a mut P,
    address: Address,
    alignment: usize,
    buffer: [u8; MAX_ALIGNMENT_BYTES],
    buffered: usize,
    written: usize,
}

impl<'a, P: FlashPartition> AlignedWriter<'a, P> {
    /// Creates a writer starting at `address`.
    ///
    /// `address` must be a multiple of `alignment`, and `alignment` must not
    /// exceed [`MAX_ALIGNMENT_BYTES`].
    pub fn new(partition: &'a mut P, address: Address, alignment: usize) -> AlignedWriter<'a, P> {
        debug_assert!(alignment <= MAX_ALIGNMENT_BYTES);
        debug_assert_eq!(address as usize % alignment, 0);
        AlignedWriter {
            partition,
            address,
            alignment,
            buffer: [0xff; MAX_ALIGNMENT_BYTES],
            buffered: 0,
            written: 0,
        }
    }

    /// Appends `data` to the output stream.
    pub fn write(&mut self, mut data: &[u8]) -> PartitionResult<()> {
        while !data.is_empty() {
            if self.buffered > 0 || data.len() < self.alignment {
                let n = (self.alignment - self.buffered).min(data.len());
                self.buffer[self.buffered..self.buffered + n].copy_from_slice(&data[..n]);
                self.buffered += n;
                data = &data[n..];
                if self.buffered == self.alignment {
                    self.flush_unit()?;
                }
            } else {
                // Fast path: write whole alignment units straight from the
                // input without copying through the internal buffer.
                let n = align_down(data.len(), self.alignment);
                self.partition.write(self.address, &data[..n])?;
                self.address += n as Address;
                self.written += n;
                data = &data[n..];
            }
        }
        Ok(())
    }

    /// Appends `len` bytes of `0xFF` padding.
    pub fn pad(&mut self, mut len: usize) -> PartitionResult<()> {
        const PADDING: [u8; MAX_ALIGNMENT_BYTES] = [0xff; MAX_ALIGNMENT_BYTES];
        while len > 0 {
            let n = len.min(PADDING.len());
            self.write(&PADDING[..n])?;
            len -= n;
        }
        Ok(())
    }

    /// The number of bytes successfully written to the partition so far.
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// The number of bytes accepted but not yet flushed to the partition.
    pub fn bytes_buffered(&self) -> usize {
        self.buffered
    }

    fn flush_unit(&mut self) -> PartitionResult<()> {
        let alignment = self.alignment;
        self.partition.write(self.address, &self.buffer[..alignment])?;
        self.address += alignment as Address;
        self.written += alignment;
        self.buffered = 0;
        self.buffer[..alignment].fill(0xff);
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::buffer::{BufferOptions, BufferPartition};
    use alloc::vec;

    fn test_partition() -> BufferPartition {
        let options = BufferOptions {
            alignment_bytes: 16,
            sector_size_bytes: 128,
            max_write_cycles: 2,
            max_erase_cycles: 100,
            strict_mode: true,
        };
        BufferPartition::new(vec![0xff; 256].into_boxed_slice(), options)
    }

    #[test]
    fn align_up_and_down() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_down(15, 16), 0);
        assert_eq!(align_down(33, 16), 32);
    }

    #[test]
    fn write_ragged_slices() {
        let mut partition = test_partition();
        let mut writer = AlignedWriter::new(&mut partition, 0, 16);
        writer.write(&[0x11; 5]).unwrap();
        assert_eq!(writer.bytes_written(), 0);
        assert_eq!(writer.bytes_buffered(), 5);
        writer.write(&[0x22; 11]).unwrap();
        assert_eq!(writer.bytes_written(), 16);
        writer.write(&[0x33; 40]).unwrap();
        writer.pad(8).unwrap();
        assert_eq!(writer.bytes_written(), 64);
        assert_eq!(writer.bytes_buffered(), 0);

        let mut read = [0u8; 64];
        use crate::partition::FlashPartition;
        partition.read(0, &mut read).unwrap();
        assert_eq!(&read[..5], &[0x11; 5]);
        assert_eq!(&read[5..16], &[0x22; 11]);
        assert_eq!(&read[16..56], &[0x33; 40]);
        assert_eq!(&read[56..], &[0xff; 8]);
    }

    #[test]
    fn pad_to_alignment_boundary() {
        let mut partition = test_partition();
        let mut writer = AlignedWriter::new(&mut partition, 16, 16);
        writer.write(&[0xab; 3]).unwrap();
        writer.pad(13).unwrap();
        assert_eq!(writer.bytes_written(), 16);
        assert_eq!(writer.bytes_buffered(), 0);
    }
}

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

//! Streaming checksum abstraction for entry integrity.

use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISO_HDLC};

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A streaming digest used to protect entries on flash.
///
/// The digest may be at most 4 bytes. Digests shorter than 4 bytes are
/// zero-extended when stored, so comparisons mask the stored value down to
/// [`size_bytes`](ChecksumAlgorithm::size_bytes).
pub trait ChecksumAlgorithm {
    /// The size of the digest in bytes, at most 4.
    fn size_bytes(&self) -> usize;

    /// Resets the digest to its initial state.
    fn reset(&mut self);

    /// Feeds `data` into the digest.
    fn update(&mut self, data: &[u8]);

    /// Finishes the digest and resets it, returning the zero-extended value.
    fn finish(&mut self) -> u32;

    /// Finishes the digest and compares it against an expected value.
    fn verify(&mut self, expected: u32) -> bool {
        let mask = digest_mask(self.size_bytes());
        self.finish() & mask == expected & mask
    }
}

/// The mask covering the low `size_bytes` bytes of a stored digest.
pub(crate) fn digest_mask(size_bytes: usize) -> u32 {
    debug_assert!(0 < size_bytes && size_bytes <= 4);
    if size_bytes >= 4 {
        u32::MAX
    } else {
        (1 << (8 * size_bytes)) - 1
    }
}

/// CRC-16/CCITT-FALSE digest (polynomial `0x1021`, initial value `0xFFFF`).
pub struct Crc16Ccitt {
    digest: crc::Digest<'static, u16>,
}

impl Default for Crc16Ccitt {
    fn default() -> Crc16Ccitt {
        Crc16Ccitt {
            digest: CRC16.digest(),
        }
    }
}

impl ChecksumAlgorithm for Crc16Ccitt {
    fn size_bytes(&self) -> usize {
        2
    }

    fn reset(&mut self) {
        self.digest = CRC16.digest();
    }

    fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    fn finish(&mut self) -> u32 {
        let digest = core::mem::replace(&mut self.digest, CRC16.digest());
        u32::from(digest.finalize())
    }
}

/// CRC-32 (ISO-HDLC) digest filling the whole checksum field.
pub struct Crc32 {
    digest: crc::Digest<'static, u32>,
}

impl Default for Crc32 {
    fn default() -> Crc32 {
        Crc32 {
            digest: CRC32.digest(),
        }
    }
}

impl ChecksumAlgorithm for Crc32 {
    fn size_bytes(&self) -> usize {
        4
    }

    fn reset(&mut self) {
        self.digest = CRC32.digest();
    }

    fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    fn finish(&mut self) -> u32 {
        let digest = core::mem::replace(&mut self.digest, CRC32.digest());
        digest.finalize()
    }
}

/// Hashes a key to its 32-bit descriptor hash.
pub(crate) fn hash_key(key: &[u8]) -> u32 {
    CRC32.checksum(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK_INPUT: &[u8] = b"123456789";

    #[test]
    fn crc16_check_value() {
        let mut algo = Crc16Ccitt::default();
        algo.update(CHECK_INPUT);
        assert_eq!(algo.finish(), 0x29b1);
    }

    #[test]
    fn crc16_streaming_matches_one_shot() {
        let mut algo = Crc16Ccitt::default();
        algo.update(&CHECK_INPUT[..4]);
        algo.update(&CHECK_INPUT[4..]);
        assert!(algo.verify(0x29b1));
    }

    #[test]
    fn crc16_ignores_padding_in_expected_value() {
        let mut algo = Crc16Ccitt::default();
        algo.update(CHECK_INPUT);
        // The upper half of the stored field is zero padding for a 2-byte
        // digest and must not participate in the comparison.
        assert!(algo.verify(0xdead_29b1));
    }

    #[test]
    fn crc32_check_value() {
        let mut algo = Crc32::default();
        algo.update(CHECK_INPUT);
        assert_eq!(algo.finish(), 0xcbf4_3926);
    }

    #[test]
    fn finish_resets_state() {
        let mut algo = Crc16Ccitt::default();
        algo.update(CHECK_INPUT);
        let first = algo.finish();
        algo.update(CHECK_INPUT);
        assert_eq!(algo.finish(), first);
    }

    #[test]
    fn reset_discards_pending_input() {
        let mut algo = Crc16Ccitt::default();
        algo.update(b"garbage");
        algo.reset();
        algo.update(CHECK_INPUT);
        assert!(algo.verify(0x29b1));
    }

    #[test]
    fn key_hash_is_stable() {
        assert_eq!(hash_key(b"123456789"), 0xcbf4_3926);
        assert_ne!(hash_key(b"alpha"), hash_key(b"beta"));
    }
}

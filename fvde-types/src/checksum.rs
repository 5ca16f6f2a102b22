// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The weak CRC-32 protecting volume headers and metadata blocks.
//!
//! Core Storage checksums use the reflected Castagnoli polynomial but,
//! unlike the common CRC-32C, apply no final XOR: the raw shift register
//! value is stored on disk, seeded from an initial value that is itself
//! stored next to the checksum field.

/// Reflected form of the Castagnoli polynomial.
const POLYNOMIAL: u32 = 0x82f6_3b78;

const fn build_table(polynomial: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut index = 0;

    while index < 256 {
        let mut checksum = index as u32;
        let mut bit = 0;

        while bit < 8 {
            checksum = if checksum & 1 != 0 {
                polynomial ^ (checksum >> 1)
            } else {
                checksum >> 1
            };
            bit += 1;
        }
        table[index] = checksum;
        index += 1;
    }
    table
}

static TABLE: [u32; 256] = build_table(POLYNOMIAL);

/// Compute the weak CRC-32 of `data` seeded with `initial_value`.
pub fn weak_crc32(data: &[u8], initial_value: u32) -> u32 {
    let mut checksum = initial_value;

    for &byte in data {
        let index = ((checksum ^ u32::from(byte)) & 0xff) as usize;
        checksum = TABLE[index] ^ (checksum >> 8);
    }
    checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-by-bit reference implementation, no lookup table.
    fn reference_crc32(data: &[u8], initial_value: u32) -> u32 {
        let mut checksum = initial_value;

        for &byte in data {
            checksum ^= u32::from(byte);

            for _ in 0..8 {
                checksum = if checksum & 1 != 0 {
                    POLYNOMIAL ^ (checksum >> 1)
                } else {
                    checksum >> 1
                };
            }
        }
        checksum
    }

    #[test]
    fn empty_input_returns_initial_value() {
        assert_eq!(weak_crc32(&[], 0), 0);
        assert_eq!(weak_crc32(&[], 0xffff_ffff), 0xffff_ffff);
        assert_eq!(weak_crc32(&[], 0x1234_5678), 0x1234_5678);
    }

    #[test]
    fn matches_reference_implementation() {
        let samples: [&[u8]; 5] = [
            b"",
            b"\x00",
            b"123456789",
            b"The quick brown fox jumps over the lazy dog",
            &[0xff; 512],
        ];

        for sample in samples {
            for initial in [0u32, 0xffff_ffff, 0xdead_beef] {
                assert_eq!(
                    weak_crc32(sample, initial),
                    reference_crc32(sample, initial),
                    "sample length {} initial {:#x}",
                    sample.len(),
                    initial
                );
            }
        }
    }

    #[test]
    fn sensitive_to_every_byte() {
        let mut data = [0u8; 64];
        let base = weak_crc32(&data, 0xffff_ffff);

        for index in 0..data.len() {
            data[index] = 1;
            assert_ne!(weak_crc32(&data, 0xffff_ffff), base);
            data[index] = 0;
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Core Storage volume header.
//!
//! A 512-byte structure at byte 0 of the physical volume. The layout used
//! here (all little-endian):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 4    | checksum (weak CRC-32) |
//! | 4      | 4    | checksum initial value |
//! | 72     | 8    | physical volume size in bytes |
//! | 88     | 2    | signature `"CS"` |
//! | 96     | 4    | block size |
//! | 100    | 4    | metadata size in bytes |
//! | 104    | 32   | four metadata block numbers |
//!
//! The checksum covers bytes `[8..512)` seeded with the initial value.

use crate::checksum::weak_crc32;
use crate::{ensure_len, ParseError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Size of the volume header in bytes.
pub const VOLUME_HEADER_SIZE: usize = 512;

/// The `"CS"` signature at byte offset 88.
pub const VOLUME_HEADER_SIGNATURE: [u8; 2] = *b"CS";

const CHECKSUM_OFFSET: usize = 0;
const INITIAL_VALUE_OFFSET: usize = 4;
const PHYSICAL_VOLUME_SIZE_OFFSET: usize = 72;
const SIGNATURE_OFFSET: usize = 88;
const BLOCK_SIZE_OFFSET: usize = 96;
const METADATA_SIZE_OFFSET: usize = 100;
const METADATA_BLOCK_NUMBERS_OFFSET: usize = 104;

/// Decoded volume header fields.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VolumeHeader {
    pub checksum: u32,
    pub initial_value: u32,
    pub physical_volume_size: u64,
    pub block_size: u32,
    pub metadata_size: u32,
    /// Block numbers of the four metadata block copies.
    pub metadata_block_numbers: [u64; 4],
}

impl VolumeHeader {
    /// Decode a volume header from the first 512 bytes of a volume.
    ///
    /// Verifies the signature but not the checksum; use
    /// [Self::verify_checksum] for that.
    pub fn parse(data: &[u8]) -> Result<Self> {
        ensure_len(data, VOLUME_HEADER_SIZE)?;

        if data[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] != VOLUME_HEADER_SIGNATURE {
            return Err(ParseError::UnsupportedSignature);
        }
        let mut metadata_block_numbers = [0u64; 4];

        for (index, number) in metadata_block_numbers.iter_mut().enumerate() {
            let offset = METADATA_BLOCK_NUMBERS_OFFSET + index * 8;
            *number = LittleEndian::read_u64(&data[offset..offset + 8]);
        }

        Ok(Self {
            checksum: LittleEndian::read_u32(&data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]),
            initial_value: LittleEndian::read_u32(
                &data[INITIAL_VALUE_OFFSET..INITIAL_VALUE_OFFSET + 4],
            ),
            physical_volume_size: LittleEndian::read_u64(
                &data[PHYSICAL_VOLUME_SIZE_OFFSET..PHYSICAL_VOLUME_SIZE_OFFSET + 8],
            ),
            block_size: LittleEndian::read_u32(&data[BLOCK_SIZE_OFFSET..BLOCK_SIZE_OFFSET + 4]),
            metadata_size: LittleEndian::read_u32(
                &data[METADATA_SIZE_OFFSET..METADATA_SIZE_OFFSET + 4],
            ),
            metadata_block_numbers,
        })
    }

    /// Byte offsets of the four metadata block copies.
    pub fn metadata_block_offsets(&self) -> [u64; 4] {
        self.metadata_block_numbers
            .map(|number| number * u64::from(self.block_size))
    }

    /// Compute the header checksum over raw header bytes.
    ///
    /// Covers `[8..512)` seeded with the stored initial value.
    pub fn compute_checksum(data: &[u8]) -> Result<u32> {
        ensure_len(data, VOLUME_HEADER_SIZE)?;

        let initial_value =
            LittleEndian::read_u32(&data[INITIAL_VALUE_OFFSET..INITIAL_VALUE_OFFSET + 4]);

        Ok(weak_crc32(&data[8..VOLUME_HEADER_SIZE], initial_value))
    }

    /// Whether the stored checksum matches the computed one.
    pub fn verify_checksum(data: &[u8]) -> Result<bool> {
        let stored = LittleEndian::read_u32(&data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);

        Ok(Self::compute_checksum(data)? == stored)
    }

    /// Recompute the checksum and store it at bytes `[0..4)`.
    pub fn update_checksum(data: &mut [u8]) -> Result<()> {
        let checksum = Self::compute_checksum(data)?;

        LittleEndian::write_u32(&mut data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4], checksum);

        Ok(())
    }

    /// Rewrite the four metadata block numbers in place and refresh the
    /// checksum.
    pub fn write_metadata_block_numbers(data: &mut [u8], numbers: [u64; 4]) -> Result<()> {
        ensure_len(data, VOLUME_HEADER_SIZE)?;

        for (index, number) in numbers.iter().enumerate() {
            let offset = METADATA_BLOCK_NUMBERS_OFFSET + index * 8;
            LittleEndian::write_u64(&mut data[offset..offset + 8], *number);
        }

        Self::update_checksum(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> [u8; VOLUME_HEADER_SIZE] {
        let mut data = [0u8; VOLUME_HEADER_SIZE];
        LittleEndian::write_u32(&mut data[4..8], 0xffff_ffff);
        LittleEndian::write_u64(&mut data[72..80], 0);
        data[88..90].copy_from_slice(b"CS");
        LittleEndian::write_u32(&mut data[96..100], 4096);
        LittleEndian::write_u64(&mut data[100..108], 8192);
        for (index, number) in [1u64, 3, 5, 7].iter().enumerate() {
            LittleEndian::write_u64(&mut data[104 + index * 8..112 + index * 8], *number);
        }
        data
    }

    #[test]
    fn parse_sample_header() {
        let data = sample_header();
        let header = VolumeHeader::parse(&data).unwrap();

        assert_eq!(header.physical_volume_size, 0);
        assert_eq!(header.block_size, 4096);
        assert_eq!(header.metadata_size, 8192);
        assert_eq!(header.metadata_block_numbers, [1, 3, 5, 7]);
        assert_eq!(
            header.metadata_block_offsets(),
            [4096, 12288, 20480, 28672]
        );
    }

    #[test]
    fn rejects_bad_signature() {
        let mut data = sample_header();
        data[88] = b'X';

        assert!(matches!(
            VolumeHeader::parse(&data),
            Err(ParseError::UnsupportedSignature)
        ));
    }

    #[test]
    fn rejects_short_input() {
        assert!(matches!(
            VolumeHeader::parse(&[0u8; 100]),
            Err(ParseError::InputTooSmall { .. })
        ));
    }

    #[test]
    fn rewrite_updates_checksum() {
        let mut data = sample_header();
        VolumeHeader::write_metadata_block_numbers(&mut data, [1, 3, 5, 7]).unwrap();

        let expected = crate::checksum::weak_crc32(&data[8..], 0xffff_ffff);
        assert_eq!(LittleEndian::read_u32(&data[0..4]), expected);
        assert!(VolumeHeader::verify_checksum(&data).unwrap());

        // Changing the slots changes the checksum.
        let before = LittleEndian::read_u32(&data[0..4]);
        VolumeHeader::write_metadata_block_numbers(&mut data, [2, 4, 6, 8]).unwrap();
        assert_ne!(LittleEndian::read_u32(&data[0..4]), before);
        assert!(VolumeHeader::verify_checksum(&data).unwrap());

        let header = VolumeHeader::parse(&data).unwrap();
        assert_eq!(header.metadata_block_numbers, [2, 4, 6, 8]);
    }

    #[test]
    fn checksum_mismatch_detected() {
        let mut data = sample_header();
        VolumeHeader::update_checksum(&mut data).unwrap();
        assert!(VolumeHeader::verify_checksum(&data).unwrap());

        data[200] ^= 0x55;
        assert!(!VolumeHeader::verify_checksum(&data).unwrap());
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core Storage metadata blocks.
//!
//! Each of the four metadata copies is a `metadata_size`-byte block
//! (typically 8192 bytes) starting with a 64-byte block header:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 4    | checksum (weak CRC-32 over `[8..metadata_size)`) |
//! | 4      | 4    | checksum initial value |
//! | 16     | 8    | transaction identifier |
//! | 64     | ..   | block-type dependent payload |
//!
//! The volume groups descriptor offset lives at byte 220 (156 bytes into
//! the payload) and is relative to the start of the block, block header
//! included. The descriptor carries the encrypted metadata geometry; its
//! block number fields pack a 16-bit physical volume index into the high
//! bits.

use crate::checksum::weak_crc32;
use crate::{ensure_len, ParseError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Size of the metadata block header in bytes.
pub const METADATA_BLOCK_HEADER_SIZE: usize = 64;

/// Mask selecting the block number from a packed block number field.
pub const BLOCK_NUMBER_MASK: u64 = 0x0000_ffff_ffff_ffff;

const CHECKSUM_OFFSET: usize = 0;
const INITIAL_VALUE_OFFSET: usize = 4;
const TRANSACTION_IDENTIFIER_OFFSET: usize = 16;
const VOLUME_GROUPS_DESCRIPTOR_OFFSET: usize = METADATA_BLOCK_HEADER_SIZE + 156;

const DESCRIPTOR_ENCRYPTED_METADATA_SIZE: usize = 8;
const DESCRIPTOR_ENCRYPTED_METADATA_1: usize = 32;
const DESCRIPTOR_ENCRYPTED_METADATA_2: usize = 40;
const DESCRIPTOR_USED_SIZE: usize = 48;

/// The encrypted metadata geometry carried by a volume groups descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EncryptedMetadataDescriptor {
    /// Size of each encrypted metadata region in blocks.
    pub size_in_blocks: u64,
    pub first_block_number: u64,
    pub first_volume_index: u16,
    pub second_block_number: u64,
    pub second_volume_index: u16,
    /// Transaction identifier of the metadata block the descriptor was
    /// read from.
    pub transaction_identifier: u64,
}

impl EncryptedMetadataDescriptor {
    pub fn first_byte_offset(&self, block_size: u32) -> u64 {
        self.first_block_number * u64::from(block_size)
    }

    pub fn second_byte_offset(&self, block_size: u32) -> u64 {
        self.second_block_number * u64::from(block_size)
    }

    pub fn size_in_bytes(&self, block_size: u32) -> u64 {
        self.size_in_blocks * u64::from(block_size)
    }
}

/// Read the transaction identifier at byte 16.
pub fn transaction_identifier(data: &[u8]) -> Result<u64> {
    ensure_len(data, TRANSACTION_IDENTIFIER_OFFSET + 8)?;

    Ok(LittleEndian::read_u64(
        &data[TRANSACTION_IDENTIFIER_OFFSET..TRANSACTION_IDENTIFIER_OFFSET + 8],
    ))
}

/// Read the volume groups descriptor offset at byte 220.
pub fn volume_groups_descriptor_offset(data: &[u8]) -> Result<u32> {
    ensure_len(data, VOLUME_GROUPS_DESCRIPTOR_OFFSET + 4)?;

    Ok(LittleEndian::read_u32(
        &data[VOLUME_GROUPS_DESCRIPTOR_OFFSET..VOLUME_GROUPS_DESCRIPTOR_OFFSET + 4],
    ))
}

fn descriptor_base(data: &[u8]) -> Result<Option<usize>> {
    let offset = volume_groups_descriptor_offset(data)?;

    // An offset inside the block header means no descriptor is present.
    if offset <= METADATA_BLOCK_HEADER_SIZE as u32 {
        return Ok(None);
    }
    let base = offset as usize;

    if base + DESCRIPTOR_USED_SIZE > data.len() {
        return Err(ParseError::DescriptorOutOfBounds(offset));
    }
    Ok(Some(base))
}

/// Locate the encrypted metadata descriptor within a metadata block.
///
/// Returns `Ok(None)` when the block carries no volume groups descriptor.
pub fn encrypted_metadata_descriptor(data: &[u8]) -> Result<Option<EncryptedMetadataDescriptor>> {
    let base = match descriptor_base(data)? {
        Some(base) => base,
        None => return Ok(None),
    };
    let first = LittleEndian::read_u64(
        &data[base + DESCRIPTOR_ENCRYPTED_METADATA_1..base + DESCRIPTOR_ENCRYPTED_METADATA_1 + 8],
    );
    let second = LittleEndian::read_u64(
        &data[base + DESCRIPTOR_ENCRYPTED_METADATA_2..base + DESCRIPTOR_ENCRYPTED_METADATA_2 + 8],
    );

    Ok(Some(EncryptedMetadataDescriptor {
        size_in_blocks: LittleEndian::read_u64(
            &data[base + DESCRIPTOR_ENCRYPTED_METADATA_SIZE
                ..base + DESCRIPTOR_ENCRYPTED_METADATA_SIZE + 8],
        ),
        first_block_number: first & BLOCK_NUMBER_MASK,
        first_volume_index: (first >> 48) as u16,
        second_block_number: second & BLOCK_NUMBER_MASK,
        second_volume_index: (second >> 48) as u16,
        transaction_identifier: transaction_identifier(data)?,
    }))
}

/// Rewrite the encrypted metadata block numbers and refresh the checksum.
///
/// Writes the two values verbatim (64 bits, no volume index masking) into
/// the descriptor, then recomputes the block checksum from the stored
/// initial value. Returns `false` when the block has no descriptor, in
/// which case it is left untouched.
pub fn rewrite_encrypted_metadata(
    data: &mut [u8],
    first_block_number: u64,
    second_block_number: u64,
) -> Result<bool> {
    let base = match descriptor_base(data)? {
        Some(base) => base,
        None => return Ok(false),
    };

    LittleEndian::write_u64(
        &mut data[base + DESCRIPTOR_ENCRYPTED_METADATA_1
            ..base + DESCRIPTOR_ENCRYPTED_METADATA_1 + 8],
        first_block_number,
    );
    LittleEndian::write_u64(
        &mut data[base + DESCRIPTOR_ENCRYPTED_METADATA_2
            ..base + DESCRIPTOR_ENCRYPTED_METADATA_2 + 8],
        second_block_number,
    );
    update_checksum(data)?;

    Ok(true)
}

/// Compute the metadata block checksum over `[8..len)` seeded with the
/// stored initial value.
pub fn compute_checksum(data: &[u8]) -> Result<u32> {
    ensure_len(data, METADATA_BLOCK_HEADER_SIZE)?;

    let initial_value =
        LittleEndian::read_u32(&data[INITIAL_VALUE_OFFSET..INITIAL_VALUE_OFFSET + 4]);

    Ok(weak_crc32(&data[8..], initial_value))
}

/// Whether the stored checksum matches the computed one.
pub fn verify_checksum(data: &[u8]) -> Result<bool> {
    let stored = LittleEndian::read_u32(&data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);

    Ok(compute_checksum(data)? == stored)
}

/// Recompute the checksum and store it at bytes `[0..4)`.
pub fn update_checksum(data: &mut [u8]) -> Result<()> {
    let checksum = compute_checksum(data)?;

    LittleEndian::write_u32(&mut data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4], checksum);

    Ok(())
}

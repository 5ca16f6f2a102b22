// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk data structures for Apple Core Storage / FVDE volumes.
//!
//! This crate decodes and re-emits the plaintext structures of a Core
//! Storage physical volume: the 512-byte volume header, the four metadata
//! block copies it points at, and the segment descriptors that map logical
//! volumes onto physical block ranges. All multi-byte fields are
//! little-endian. Nothing in here performs I/O; callers hand in byte
//! slices.

pub mod checksum;
pub mod metadata_block;
pub mod segment;
pub mod volume_header;

use thiserror::Error;

/// Error for decoding an on-disk structure.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported volume header signature")]
    UnsupportedSignature,
    #[error("input data too small: need {expected} bytes, have {actual}")]
    InputTooSmall { expected: usize, actual: usize },
    #[error("volume groups descriptor offset {0} is out of bounds")]
    DescriptorOutOfBounds(u32),
}

pub type Result<T, E = ParseError> = std::result::Result<T, E>;

pub(crate) fn ensure_len(data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        Err(ParseError::InputTooSmall {
            expected,
            actual: data.len(),
        })
    } else {
        Ok(())
    }
}

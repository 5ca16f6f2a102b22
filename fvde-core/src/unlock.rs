// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The unlocker contract.
//!
//! Deriving the volume master key from credentials and decrypting the
//! encrypted metadata is the job of an external unlock backend. This
//! module fixes the shape of what such a backend consumes (credentials
//! and a seekable source) and what it yields (a volume group with
//! per-logical-volume keys and segment descriptors). Everything
//! downstream of unlock operates on these types only.

use crate::error::{Error, Result};
use fvde_types::segment::SegmentDescriptor;
use std::io::{Read, Seek};
use std::path::PathBuf;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Seekable read-only volume source.
pub trait VolumeSource: Read + Seek {}

impl<T: Read + Seek> VolumeSource for T {}

/// Credentials handed to an unlock backend.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub password: Option<String>,
    pub recovery_password: Option<String>,
    pub volume_master_key: Option<[u8; 16]>,
    pub encrypted_root_plist: Option<PathBuf>,
}

impl Credentials {
    /// Parse a raw volume master key from its 32-character base16 form.
    pub fn parse_volume_master_key(text: &str) -> Result<[u8; 16]> {
        if text.len() != 32 {
            return Err(Error::InvalidArgument(format!(
                "volume master key must be 32 base16 characters, got {}",
                text.len()
            )));
        }
        let bytes = hex::decode(text)
            .map_err(|_| Error::InvalidArgument("volume master key is not valid base16".into()))?;
        let mut key = [0u8; 16];
        key.copy_from_slice(&bytes);

        Ok(key)
    }

    pub fn is_empty(&self) -> bool {
        self.password.is_none()
            && self.recovery_password.is_none()
            && self.volume_master_key.is_none()
            && self.encrypted_root_plist.is_none()
    }
}

/// Per-logical-volume AES-XTS key material.
///
/// Zeroed on drop; these bytes exist only between unlock and keyring
/// insertion or table emission.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VolumeKeys {
    pub volume_master_key: [u8; 16],
    pub volume_tweak_key: [u8; 32],
}

impl std::fmt::Debug for VolumeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes never reach logs or error output.
        f.debug_struct("VolumeKeys").finish_non_exhaustive()
    }
}

/// A physical volume as reported by the unlock backend.
#[derive(Clone, Debug)]
pub struct PhysicalVolumeRecord {
    pub identifier: [u8; 16],
    pub size: u64,
}

/// A logical volume as reported by the unlock backend.
#[derive(Clone, Debug)]
pub struct LogicalVolumeRecord {
    pub identifier: [u8; 16],
    pub name: Option<String>,
    pub size: u64,
    pub is_locked: bool,
    pub keys: Option<VolumeKeys>,
    pub segments: Vec<SegmentDescriptor>,
}

impl LogicalVolumeRecord {
    /// The key material, or [Error::Locked] when the volume was not
    /// unlocked.
    pub fn keys(&self) -> Result<&VolumeKeys> {
        self.keys
            .as_ref()
            .filter(|_| !self.is_locked)
            .ok_or_else(|| Error::Locked(crate::format_identifier(&self.identifier)))
    }
}

/// The unlock backend's view of a volume group.
#[derive(Clone, Debug, Default)]
pub struct VolumeGroup {
    pub physical_volumes: Vec<PhysicalVolumeRecord>,
    pub logical_volumes: Vec<LogicalVolumeRecord>,
}

/// An unlock backend.
pub trait Unlocker {
    /// Open and unlock the volume group backed by `source`.
    ///
    /// Logical volumes whose credentials did not match are returned with
    /// `is_locked` set rather than failing the whole group.
    fn unlock(&self, source: &mut dyn VolumeSource, credentials: &Credentials)
        -> Result<VolumeGroup>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_base16_master_key() {
        let key =
            Credentials::parse_volume_master_key("000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[15], 0x0f);
    }

    #[test]
    fn rejects_bad_master_keys() {
        assert!(Credentials::parse_volume_master_key("abcd").is_err());
        assert!(
            Credentials::parse_volume_master_key("zz0102030405060708090a0b0c0d0e0f").is_err()
        );
    }

    #[test]
    fn locked_volume_yields_no_keys() {
        let record = LogicalVolumeRecord {
            identifier: [0u8; 16],
            name: None,
            size: 0,
            is_locked: true,
            keys: Some(VolumeKeys {
                volume_master_key: [1u8; 16],
                volume_tweak_key: [2u8; 32],
            }),
            segments: Vec::new(),
        };

        assert!(matches!(record.keys(), Err(Error::Locked(_))));
    }

    #[test]
    fn debug_output_hides_key_bytes() {
        let keys = VolumeKeys {
            volume_master_key: [0xaa; 16],
            volume_tweak_key: [0xbb; 32],
        };
        let rendered = format!("{:?}", keys);

        assert!(!rendered.contains("170")); // 0xaa
        assert!(!rendered.contains("aa"));
    }
}

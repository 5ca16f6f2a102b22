// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel keyring insertion.
//!
//! dm-crypt fetches the AES-XTS key from the kernel keyring by the token
//! in the table line: a 48-byte `logon` key described as `fvde:<uuid>`.
//! The payload is the volume master key followed by the tweak key; it is
//! zeroed as soon as the syscall returns.

use crate::error::{Error, Result};
use crate::format_identifier;
use crate::unlock::VolumeKeys;
use std::str::FromStr;

/// Combined key size: 16-byte master key plus 32-byte tweak key.
pub const COMBINED_KEY_SIZE: usize = 48;

/// The keyring a key is added to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum KeyringTarget {
    /// `@s`
    #[default]
    Session,
    /// `@u`
    User,
    /// `@us`
    UserSession,
    /// A numeric keyring serial.
    Id(i32),
}

impl KeyringTarget {
    /// The serial passed to `add_key(2)`.
    pub fn serial(&self) -> i32 {
        // Special keyring serials from linux/keyctl.h.
        const KEY_SPEC_SESSION_KEYRING: i32 = -3;
        const KEY_SPEC_USER_KEYRING: i32 = -4;
        const KEY_SPEC_USER_SESSION_KEYRING: i32 = -5;

        match self {
            Self::Session => KEY_SPEC_SESSION_KEYRING,
            Self::User => KEY_SPEC_USER_KEYRING,
            Self::UserSession => KEY_SPEC_USER_SESSION_KEYRING,
            Self::Id(id) => *id,
        }
    }
}

impl FromStr for KeyringTarget {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        match text {
            "@s" => Ok(Self::Session),
            "@u" => Ok(Self::User),
            "@us" => Ok(Self::UserSession),
            other => match other.parse::<i32>() {
                Ok(id) if id != 0 => Ok(Self::Id(id)),
                _ => Err(Error::UnsupportedValue(format!(
                    "unknown keyring ID {other:?}"
                ))),
            },
        }
    }
}

/// The `logon` key description for a logical volume.
pub fn key_description(volume_identifier: &[u8; 16]) -> String {
    format!("fvde:{}", format_identifier(volume_identifier))
}

/// Add a logical volume's keys to the kernel keyring.
///
/// Returns the serial of the new key. The add is atomic; on failure the
/// underlying OS error is reported and nothing is left in the keyring.
#[cfg(target_os = "linux")]
pub fn add_logon_key(
    keys: &VolumeKeys,
    volume_identifier: &[u8; 16],
    target: KeyringTarget,
) -> Result<i32> {
    use std::ffi::CString;
    use zeroize::Zeroize;

    let description = CString::new(key_description(volume_identifier))
        .expect("UUID strings contain no NUL bytes");
    let key_type = c"logon";

    let mut payload = [0u8; COMBINED_KEY_SIZE];
    payload[..16].copy_from_slice(&keys.volume_master_key);
    payload[16..].copy_from_slice(&keys.volume_tweak_key);

    let serial = unsafe {
        libc::syscall(
            libc::SYS_add_key,
            key_type.as_ptr(),
            description.as_ptr(),
            payload.as_ptr(),
            payload.len(),
            target.serial() as libc::c_long,
        )
    };
    payload.zeroize();

    if serial < 0 {
        Err(Error::Keyring(std::io::Error::last_os_error()))
    } else {
        Ok(serial as i32)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn add_logon_key(
    _keys: &VolumeKeys,
    _volume_identifier: &[u8; 16],
    _target: KeyringTarget,
) -> Result<i32> {
    Err(Error::KeyringUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_keyrings() {
        assert_eq!("@s".parse::<KeyringTarget>().unwrap(), KeyringTarget::Session);
        assert_eq!("@u".parse::<KeyringTarget>().unwrap(), KeyringTarget::User);
        assert_eq!(
            "@us".parse::<KeyringTarget>().unwrap(),
            KeyringTarget::UserSession
        );
        assert_eq!(
            "12345".parse::<KeyringTarget>().unwrap(),
            KeyringTarget::Id(12345)
        );
    }

    #[test]
    fn rejects_unknown_keyrings() {
        assert!("@x".parse::<KeyringTarget>().is_err());
        assert!("0".parse::<KeyringTarget>().is_err());
        assert!("session".parse::<KeyringTarget>().is_err());
    }

    #[test]
    fn named_keyrings_map_to_special_serials() {
        assert_eq!(KeyringTarget::Session.serial(), -3);
        assert_eq!(KeyringTarget::User.serial(), -4);
        assert_eq!(KeyringTarget::UserSession.serial(), -5);
        assert_eq!(KeyringTarget::Id(77).serial(), 77);
    }

    #[test]
    fn description_uses_fvde_prefix() {
        let mut identifier = [0u8; 16];
        identifier[0] = 0x12;
        identifier[15] = 0x34;

        assert_eq!(
            key_description(&identifier),
            "fvde:12000000-0000-0000-0000-000000000034"
        );
    }
}

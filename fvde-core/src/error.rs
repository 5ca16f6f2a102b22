// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use fvde_types::ParseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),
    #[error("unable to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("unable to read {region} at offset {offset:#x}: {source}")]
    Read {
        region: &'static str,
        offset: u64,
        source: std::io::Error,
    },
    #[error("unable to write {region} at offset {offset:#x}: {source}")]
    Write {
        region: &'static str,
        offset: u64,
        source: std::io::Error,
    },
    #[error("unable to seek to {region} at offset {offset:#x}: {source}")]
    Seek {
        region: &'static str,
        offset: u64,
        source: std::io::Error,
    },
    #[error("destination {0} already exists; pass --force to overwrite")]
    DestinationExists(String),
    #[error("maximum number of {0} volumes reached")]
    CapacityExceeded(&'static str),
    #[error("{0} volume index {1} is out of bounds")]
    OutOfBounds(&'static str, u32),
    #[error("logical volume {0} is locked")]
    Locked(String),
    #[error("no unlock backend is available; logical volumes remain locked")]
    NoUnlockBackend,
    #[error("abort requested")]
    AbortRequested,
    #[error("checksum mismatch in {region}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        region: &'static str,
        stored: u32,
        computed: u32,
    },
    #[error("unable to add key to kernel keyring: {0}")]
    Keyring(std::io::Error),
    #[error("kernel keyring support requires Linux")]
    KeyringUnsupported,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

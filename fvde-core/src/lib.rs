// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core engineering for the FVDE forensic toolkit.
//!
//! Builds on [fvde_types] to provide the in-memory allocation state for a
//! Core Storage volume group, the walker that populates it from an
//! unlocked volume, the metadata dump/rewrite engine, and the dm-crypt /
//! kernel-keyring emitters.

pub mod dmsetup;
pub mod dump;
pub mod error;
pub mod extent;
pub mod keyring;
pub mod report;
pub mod source;
pub mod unlock;
pub mod walker;

pub use error::{Error, Result};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative abort flag shared between a signal handler and the
/// long-running copy and walk loops.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an abort. Safe to call from a signal handler.
    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_signalled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return [Error::AbortRequested] if the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_signalled() {
            Err(Error::AbortRequested)
        } else {
            Ok(())
        }
    }
}

/// Render a 16-byte volume identifier in lowercase dashed form.
pub fn format_identifier(identifier: &[u8; 16]) -> String {
    uuid::Uuid::from_bytes(*identifier).to_string()
}

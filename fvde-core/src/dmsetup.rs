// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-mapper crypt table emission.
//!
//! Each unlocked logical volume yields one `dm-crypt` table line in
//! 512-byte sector units. The key is not inlined; the line references a
//! 48-byte `logon` key in the kernel keyring by its `fvde:<uuid>`
//! description, so the table itself carries no secret material.

use crate::format_identifier;
use fvde_types::segment::LINUX_SECTOR_SIZE;
use std::io::{self, Write};

/// Fallback mapper name when a logical volume has no usable name.
pub const DEFAULT_MAPPER_NAME: &str = "fvde";

/// One device-mapper table entry.
#[derive(Clone, Debug)]
pub struct TableEntry<'a> {
    pub volume_identifier: &'a [u8; 16],
    /// Logical volume size in bytes.
    pub volume_size: u64,
    /// Path of the backing device or image.
    pub source_path: &'a str,
    /// Byte offset of the volume within the source.
    pub volume_offset: u64,
}

impl TableEntry<'_> {
    /// Render the raw `dmsetup` table line.
    pub fn table_line(&self) -> String {
        let size_in_sectors = self.volume_size / LINUX_SECTOR_SIZE;
        let offset_in_sectors = self.volume_offset / LINUX_SECTOR_SIZE;

        format!(
            "0 {} crypt aes-xts-plain64 :48:logon:fvde:{} 0 {} {}",
            size_in_sectors,
            format_identifier(self.volume_identifier),
            self.source_path,
            offset_in_sectors,
        )
    }

    /// Render the shell command form, piping the table line into
    /// `dmsetup create`.
    ///
    /// `volume_index` is 1-based and appended to the mapper name.
    pub fn shell_command(&self, mapper_name: &str, volume_index: usize) -> String {
        format!(
            "echo \"{}\" | dmsetup create {}{}",
            self.table_line(),
            mapper_name,
            volume_index,
        )
    }
}

/// Pick the mapper base name for a logical volume.
pub fn mapper_name<'a>(requested: Option<&'a str>, volume_name: Option<&'a str>) -> &'a str {
    requested
        .or(volume_name)
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_MAPPER_NAME)
}

/// Write a table entry, optionally in shell form.
pub fn write_table_entry(
    out: &mut dyn Write,
    entry: &TableEntry<'_>,
    shell_mode: bool,
    mapper_name: &str,
    volume_index: usize,
) -> io::Result<()> {
    if shell_mode {
        writeln!(out, "{}", entry.shell_command(mapper_name, volume_index))
    } else {
        writeln!(out, "{}", entry.table_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry<'a>() -> TableEntry<'a> {
        TableEntry {
            volume_identifier: &[
                0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc,
                0xdd, 0xee, 0xff,
            ],
            volume_size: 8 << 30,
            source_path: "/dev/sda2",
            volume_offset: 0,
        }
    }

    #[test]
    fn table_line_for_eight_gib_volume() {
        assert_eq!(
            sample_entry().table_line(),
            "0 16777216 crypt aes-xts-plain64 \
             :48:logon:fvde:00112233-4455-6677-8899-aabbccddeeff 0 /dev/sda2 0"
        );
    }

    #[test]
    fn shell_command_wraps_table_line() {
        assert_eq!(
            sample_entry().shell_command("fv", 1),
            "echo \"0 16777216 crypt aes-xts-plain64 \
             :48:logon:fvde:00112233-4455-6677-8899-aabbccddeeff 0 /dev/sda2 0\" \
             | dmsetup create fv1"
        );
    }

    #[test]
    fn offset_converts_to_sectors() {
        let mut entry = sample_entry();
        entry.volume_offset = 409600;

        assert!(entry.table_line().ends_with("/dev/sda2 800"));
    }

    #[test]
    fn mapper_name_fallback_chain() {
        assert_eq!(mapper_name(Some("custom"), Some("Macintosh HD")), "custom");
        assert_eq!(mapper_name(None, Some("Macintosh HD")), "Macintosh HD");
        assert_eq!(mapper_name(None, Some("")), "fvde");
        assert_eq!(mapper_name(None, None), "fvde");
    }
}

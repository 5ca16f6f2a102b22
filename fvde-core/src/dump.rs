// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Metadata extraction into sparse or compact images.
//!
//! A dump keeps only the structurally significant regions of a physical
//! volume: the volume header, the four metadata block copies and the two
//! encrypted metadata regions. Sparse mode copies each region to its
//! original offset in a destination truncated to the full volume size.
//! Compact mode repacks the regions contiguously and rewrites the offset
//! fields inside the copied header and metadata blocks, recomputing every
//! checksum, so the result still decodes like the original.

use crate::error::{Error, Result};
use crate::AbortFlag;
use fvde_types::metadata_block::{self, EncryptedMetadataDescriptor};
use fvde_types::volume_header::{VolumeHeader, VOLUME_HEADER_SIZE};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Copy chunk size.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

static METADATA_REGION_NAMES: [&str; 4] = [
    "metadata 1",
    "metadata 2",
    "metadata 3",
    "metadata 4",
];

/// Options for a dump operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct DumpOptions {
    /// Repack regions contiguously instead of writing a sparse image.
    pub compact: bool,
    /// Overwrite an existing destination.
    pub force: bool,
    /// Restrict descriptor extraction to the copy with the highest
    /// transaction identifier. All four copies are emitted either way.
    pub best_metadata_only: bool,
    /// Number of encrypted filesystem blocks to include. Accepted for
    /// compatibility; no sample region is emitted.
    pub sample_blocks: u32,
}

/// Encrypted metadata regions resolved to byte offsets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EncryptedMetadataRegions {
    pub first_offset: u64,
    pub second_offset: u64,
    pub size: u64,
}

/// Geometry captured from the source before copying.
#[derive(Clone, Debug)]
pub struct SourceGeometry {
    pub header: VolumeHeader,
    /// Byte offsets of the four metadata block copies.
    pub metadata_offsets: [u64; 4],
    pub encrypted_metadata: Option<EncryptedMetadataRegions>,
    /// Index of the metadata copy with the highest transaction id.
    pub best_metadata_index: usize,
    pub highest_transaction: u64,
}

impl SourceGeometry {
    /// Read the volume header and scan the four metadata copies.
    ///
    /// The encrypted metadata descriptor is taken from the copy with the
    /// highest transaction identifier. Checksum mismatches are reported
    /// but do not fail the read.
    pub fn read_from<R: Read + Seek>(source: &mut R, abort: &AbortFlag) -> Result<Self> {
        let mut header_data = [0u8; VOLUME_HEADER_SIZE];

        read_at(source, 0, &mut header_data, "volume header")?;

        let header = VolumeHeader::parse(&header_data)?;

        if !VolumeHeader::verify_checksum(&header_data)? {
            warn!("volume header checksum mismatch");
        }
        if header.block_size == 0 {
            return Err(Error::InvalidArgument("volume block size is zero".into()));
        }
        if header.metadata_size == 0 {
            return Err(Error::InvalidArgument("volume metadata size is zero".into()));
        }
        debug!(
            "volume header: size {} bytes, block size {}, metadata size {}",
            header.physical_volume_size, header.block_size, header.metadata_size
        );

        let metadata_offsets = header.metadata_block_offsets();
        let mut metadata_data = vec![0u8; header.metadata_size as usize];
        let mut best_metadata_index = 0;
        let mut highest_transaction = 0;
        let mut descriptor: Option<EncryptedMetadataDescriptor> = None;

        for (index, offset) in metadata_offsets.into_iter().enumerate() {
            abort.check()?;

            read_at(
                source,
                offset,
                &mut metadata_data,
                METADATA_REGION_NAMES[index],
            )?;

            if !metadata_block::verify_checksum(&metadata_data)? {
                warn!("{} checksum mismatch", METADATA_REGION_NAMES[index]);
            }
            let transaction = metadata_block::transaction_identifier(&metadata_data)?;
            debug!(
                "{}: transaction identifier {transaction}",
                METADATA_REGION_NAMES[index]
            );

            if transaction > highest_transaction {
                highest_transaction = transaction;
                best_metadata_index = index;
                descriptor = metadata_block::encrypted_metadata_descriptor(&metadata_data)?;
            }
        }

        let encrypted_metadata = descriptor.map(|descriptor| EncryptedMetadataRegions {
            first_offset: descriptor.first_byte_offset(header.block_size),
            second_offset: descriptor.second_byte_offset(header.block_size),
            size: descriptor.size_in_bytes(header.block_size),
        });

        Ok(Self {
            header,
            metadata_offsets,
            encrypted_metadata,
            best_metadata_index,
            highest_transaction,
        })
    }

    /// The encrypted metadata descriptor in block units, for the walker's
    /// reserved-region bootstrap.
    pub fn encrypted_metadata_descriptor(&self) -> Option<EncryptedMetadataDescriptor> {
        let block_size = u64::from(self.header.block_size);

        self.encrypted_metadata
            .map(|regions| EncryptedMetadataDescriptor {
                size_in_blocks: regions.size / block_size,
                first_block_number: regions.first_offset / block_size,
                first_volume_index: 0,
                second_block_number: regions.second_offset / block_size,
                second_volume_index: 0,
                transaction_identifier: self.highest_transaction,
            })
    }
}

/// Result of a completed dump.
#[derive(Clone, Copy, Debug)]
pub struct DumpSummary {
    pub bytes_copied: u64,
    pub destination_size: u64,
    pub compact: bool,
}

/// Extracts FVDE metadata from a source into a destination image.
pub struct Dumper<R: Read + Seek> {
    source: R,
    geometry: SourceGeometry,
    options: DumpOptions,
    abort: AbortFlag,
    bytes_copied: u64,
}

impl Dumper<BufReader<File>> {
    /// Open a source file or block device and capture its geometry.
    pub fn open(path: &Path, options: DumpOptions, abort: AbortFlag) -> Result<Self> {
        let source = File::open(path).map_err(|source| Error::Open {
            path: path.display().to_string(),
            source,
        })?;

        Self::new(BufReader::new(source), options, abort)
    }
}

impl<R: Read + Seek> Dumper<R> {
    /// Construct from an already opened source, capturing its geometry.
    ///
    /// Reads the volume header and scans all four metadata copies for the
    /// highest transaction identifier and the encrypted metadata
    /// descriptor. Checksum mismatches are reported but do not fail the
    /// open.
    pub fn new(mut source: R, options: DumpOptions, abort: AbortFlag) -> Result<Self> {
        let geometry = SourceGeometry::read_from(&mut source, &abort)?;

        Ok(Self {
            source,
            geometry,
            options,
            abort,
            bytes_copied: 0,
        })
    }

    pub fn geometry(&self) -> &SourceGeometry {
        &self.geometry
    }

    /// Write the dump to `path`.
    ///
    /// Refuses to overwrite an existing destination unless the force
    /// option is set. On failure the destination is left in an undefined
    /// state.
    pub fn dump_to(&mut self, path: &Path) -> Result<DumpSummary> {
        if path.exists() && !self.options.force {
            return Err(Error::DestinationExists(path.display().to_string()));
        }
        let mut destination = File::create(path).map_err(|source| Error::Open {
            path: path.display().to_string(),
            source,
        })?;
        self.bytes_copied = 0;

        let summary = if self.options.compact {
            self.dump_compact(&mut destination)?
        } else {
            self.dump_sparse(&mut destination)?
        };
        info!(
            "dump complete: {} bytes copied, destination size {} bytes",
            summary.bytes_copied, summary.destination_size
        );

        Ok(summary)
    }

    fn dump_sparse(&mut self, destination: &mut File) -> Result<DumpSummary> {
        let header = self.geometry.header;

        // Unwritten ranges read back as zeros without consuming storage.
        destination.set_len(header.physical_volume_size)?;
        debug!(
            "created sparse destination of {} bytes",
            header.physical_volume_size
        );

        self.copy_region(destination, 0, 0, VOLUME_HEADER_SIZE as u64, "volume header")?;

        for (index, offset) in self.geometry.metadata_offsets.into_iter().enumerate() {
            self.copy_region(
                destination,
                offset,
                offset,
                u64::from(header.metadata_size),
                METADATA_REGION_NAMES[index],
            )?;
        }
        if let Some(regions) = self.geometry.encrypted_metadata {
            if regions.first_offset != 0 {
                self.copy_region(
                    destination,
                    regions.first_offset,
                    regions.first_offset,
                    regions.size,
                    "encrypted metadata 1",
                )?;
            }
            if regions.second_offset != 0 {
                self.copy_region(
                    destination,
                    regions.second_offset,
                    regions.second_offset,
                    regions.size,
                    "encrypted metadata 2",
                )?;
            }
        }

        Ok(DumpSummary {
            bytes_copied: self.bytes_copied,
            destination_size: header.physical_volume_size,
            compact: false,
        })
    }

    fn dump_compact(&mut self, destination: &mut File) -> Result<DumpSummary> {
        let header = self.geometry.header;
        let block_size = u64::from(header.block_size);
        let metadata_size = u64::from(header.metadata_size);

        self.write_corrected_volume_header(destination)?;

        // Metadata copies land back to back starting at block 1; the
        // encrypted metadata regions follow immediately after them.
        let mut current_offset = block_size;
        let encrypted_metadata_1_offset = block_size + 4 * metadata_size;
        let encrypted_metadata_size = self
            .geometry
            .encrypted_metadata
            .map(|regions| regions.size)
            .unwrap_or(0);
        let encrypted_metadata_2_offset = encrypted_metadata_1_offset + encrypted_metadata_size;

        for (index, source_offset) in self.geometry.metadata_offsets.into_iter().enumerate() {
            self.write_corrected_metadata(
                destination,
                source_offset,
                current_offset,
                encrypted_metadata_1_offset / block_size,
                encrypted_metadata_2_offset / block_size,
                METADATA_REGION_NAMES[index],
            )?;
            current_offset += metadata_size;
        }
        if let Some(regions) = self.geometry.encrypted_metadata {
            if regions.first_offset != 0 {
                self.copy_region(
                    destination,
                    regions.first_offset,
                    current_offset,
                    regions.size,
                    "encrypted metadata 1",
                )?;
                current_offset += regions.size;
            }
            if regions.second_offset != 0 {
                self.copy_region(
                    destination,
                    regions.second_offset,
                    current_offset,
                    regions.size,
                    "encrypted metadata 2",
                )?;
                current_offset += regions.size;
            }
        }

        Ok(DumpSummary {
            bytes_copied: self.bytes_copied,
            destination_size: current_offset,
            compact: true,
        })
    }

    /// Emit the volume header with its metadata slots retargeted at the
    /// compact layout and the checksum recomputed.
    fn write_corrected_volume_header(&mut self, destination: &mut File) -> Result<()> {
        let header = self.geometry.header;
        let mut data = [0u8; VOLUME_HEADER_SIZE];

        read_at(&mut self.source, 0, &mut data, "volume header")?;

        let metadata_blocks = u64::from(header.metadata_size).div_ceil(u64::from(header.block_size));
        let mut slot_numbers = [0u64; 4];
        let mut block = 1;

        for slot in &mut slot_numbers {
            *slot = block;
            block += metadata_blocks;
        }
        VolumeHeader::write_metadata_block_numbers(&mut data, slot_numbers)?;
        debug!("corrected metadata slots to blocks {slot_numbers:?}");

        write_at(destination, 0, &data, "volume header")?;
        self.bytes_copied += VOLUME_HEADER_SIZE as u64;

        Ok(())
    }

    /// Emit one metadata copy with its encrypted metadata block numbers
    /// retargeted and the block checksum recomputed.
    fn write_corrected_metadata(
        &mut self,
        destination: &mut File,
        source_offset: u64,
        destination_offset: u64,
        encrypted_metadata_1_block: u64,
        encrypted_metadata_2_block: u64,
        region: &'static str,
    ) -> Result<()> {
        self.abort.check()?;

        let mut data = vec![0u8; self.geometry.header.metadata_size as usize];

        read_at(&mut self.source, source_offset, &mut data, region)?;

        if metadata_block::rewrite_encrypted_metadata(
            &mut data,
            encrypted_metadata_1_block,
            encrypted_metadata_2_block,
        )? {
            debug!(
                "corrected {region}: encrypted metadata blocks {} and {}",
                encrypted_metadata_1_block, encrypted_metadata_2_block
            );
        }
        write_at(destination, destination_offset, &data, region)?;
        self.bytes_copied += data.len() as u64;

        Ok(())
    }

    /// Copy `size` bytes from the source to the destination in 64-KiB
    /// chunks, polling the abort flag before each chunk.
    fn copy_region(
        &mut self,
        destination: &mut File,
        source_offset: u64,
        destination_offset: u64,
        size: u64,
        region: &'static str,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        debug!("copying {region}: {size} bytes from {source_offset:#x} to {destination_offset:#x}");

        self.source
            .seek(SeekFrom::Start(source_offset))
            .map_err(|source| Error::Seek {
                region,
                offset: source_offset,
                source,
            })?;
        destination
            .seek(SeekFrom::Start(destination_offset))
            .map_err(|source| Error::Seek {
                region,
                offset: destination_offset,
                source,
            })?;

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut remaining = size;

        while remaining > 0 {
            self.abort.check()?;

            let chunk = remaining.min(COPY_BUFFER_SIZE as u64) as usize;

            self.source
                .read_exact(&mut buffer[..chunk])
                .map_err(|source| Error::Read {
                    region,
                    offset: source_offset + (size - remaining),
                    source,
                })?;
            destination
                .write_all(&buffer[..chunk])
                .map_err(|source| Error::Write {
                    region,
                    offset: destination_offset + (size - remaining),
                    source,
                })?;
            remaining -= chunk as u64;
            self.bytes_copied += chunk as u64;
        }
        Ok(())
    }
}

fn read_at<R: Read + Seek>(
    source: &mut R,
    offset: u64,
    data: &mut [u8],
    region: &'static str,
) -> Result<()> {
    source
        .seek(SeekFrom::Start(offset))
        .map_err(|source| Error::Seek {
            region,
            offset,
            source,
        })?;
    source.read_exact(data).map_err(|source| Error::Read {
        region,
        offset,
        source,
    })
}

fn write_at(destination: &mut File, offset: u64, data: &[u8], region: &'static str) -> Result<()> {
    destination
        .seek(SeekFrom::Start(offset))
        .map_err(|source| Error::Seek {
            region,
            offset,
            source,
        })?;
    destination.write_all(data).map_err(|source| Error::Write {
        region,
        offset,
        source,
    })
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Populates the extent store from an unlocked volume group.
//!
//! The walk registers every volume, marks the bootstrap reserved regions
//! (volume header, the four metadata slots, the two encrypted metadata
//! regions), then projects each logical volume's segment descriptors onto
//! the physical address space. Overlaps are recorded as violations and
//! never abort the walk; the extent store stays an append-only log of
//! what the metadata claims.

use crate::error::Result;
use crate::extent::{ExtentState, Provenance, VolumeState};
use crate::unlock::VolumeGroup;
use crate::AbortFlag;
use fvde_types::metadata_block::EncryptedMetadataDescriptor;
use fvde_types::volume_header::VolumeHeader;
use log::{debug, warn};
use std::fmt;
use std::str::FromStr;

/// Block type stamped on allocations from segment descriptors.
const SEGMENT_ALLOCATION_BLOCK_TYPE: u16 = 0x0305;

static METADATA_SLOT_DESCRIPTIONS: [&str; 4] = [
    "Metadata block 1",
    "Metadata block 2",
    "Metadata block 3",
    "Metadata block 4",
];

/// Metadata block processing order requested on the command line.
///
/// Accepted and echoed in reports; the walk itself always follows the
/// volume group's enumeration order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ProcessingOrder {
    #[default]
    Ascending,
    Descending,
    Physical,
}

impl ProcessingOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ascending => "ascending",
            Self::Descending => "descending",
            Self::Physical => "physical",
        }
    }
}

impl FromStr for ProcessingOrder {
    type Err = crate::Error;

    fn from_str(text: &str) -> Result<Self> {
        match text {
            "ascending" => Ok(Self::Ascending),
            "descending" => Ok(Self::Descending),
            "physical" => Ok(Self::Physical),
            other => Err(crate::Error::UnsupportedValue(format!(
                "unknown processing order {other:?}"
            ))),
        }
    }
}

/// Options controlling a walk.
#[derive(Clone, Debug, Default)]
pub struct WalkOptions {
    pub order: ProcessingOrder,
    pub stop_at_block: Option<u32>,
    pub stop_at_transaction: Option<u64>,
}

/// Kinds of allocation inconsistencies detected during a walk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ViolationKind {
    PhysicalOverlap,
    AllocateAfterAllocate,
    ReservedViolation,
    FreeAfterFree,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PhysicalOverlap => "Physical overlap",
            Self::AllocateAfterAllocate => "Block already allocated",
            Self::ReservedViolation => "Allocation overlaps reserved area",
            Self::FreeAfterFree => "Block freed when already free",
        };
        f.write_str(text)
    }
}

/// One recorded inconsistency.
#[derive(Clone, Debug)]
pub struct Violation {
    pub kind: ViolationKind,
    pub physical_volume: u32,
    pub block_start: u64,
    pub block_count: u64,
    pub description: String,
}

/// The result of walking a volume group.
#[derive(Debug, Default)]
pub struct VolumeWalk {
    pub state: VolumeState,
    pub options: WalkOptions,
    pub errors: Vec<Violation>,
    pub warnings: Vec<Violation>,
    pub transactions_processed: u32,
    pub metadata_blocks_processed: u32,
}

impl VolumeWalk {
    fn classify(existing: &ExtentState) -> ViolationKind {
        match existing {
            ExtentState::Reserved { .. } => ViolationKind::ReservedViolation,
            ExtentState::Allocated { .. } => ViolationKind::AllocateAfterAllocate,
            ExtentState::Free { .. } => ViolationKind::PhysicalOverlap,
        }
    }

    /// Record an overlap against an existing extent, classified by the
    /// existing extent's state.
    fn record_overlap(
        &mut self,
        physical_volume: u32,
        block_start: u64,
        block_count: u64,
    ) {
        let existing = match self.state.check_overlap(physical_volume, block_start, block_count) {
            Some(extent) => extent,
            None => return,
        };
        let kind = Self::classify(&existing.state);
        let violation = Violation {
            kind,
            physical_volume,
            block_start,
            block_count,
            description: format!(
                "blocks {}-{} overlap {} extent at blocks {}-{}",
                block_start,
                block_start + block_count - 1,
                existing.state.name(),
                existing.physical_block_start,
                existing.physical_end() - 1,
            ),
        };
        warn!("PV{physical_volume}: {kind}: {}", violation.description);

        match kind {
            ViolationKind::FreeAfterFree | ViolationKind::PhysicalOverlap => {
                self.warnings.push(violation)
            }
            _ => self.errors.push(violation),
        }
    }
}

/// Walk an unlocked volume group into a populated [VolumeState].
///
/// `header` supplies the geometry and the metadata slot locations;
/// `encrypted_metadata` is the descriptor extracted from the best
/// metadata copy, when one exists.
pub fn walk_volume_group(
    group: &VolumeGroup,
    header: &VolumeHeader,
    encrypted_metadata: Option<&EncryptedMetadataDescriptor>,
    options: WalkOptions,
    abort: &AbortFlag,
) -> Result<VolumeWalk> {
    let mut walk = VolumeWalk {
        options,
        ..Default::default()
    };
    let block_size = if header.block_size != 0 {
        header.block_size
    } else {
        crate::extent::DEFAULT_BLOCK_SIZE
    };
    walk.state.set_block_size(block_size)?;

    for record in &group.physical_volumes {
        let pv = walk
            .state
            .add_physical_volume(record.identifier, record.size / u64::from(block_size))?;

        // Block 0 of every physical volume holds its volume header.
        walk.state.mark_reserved(pv, 0, 1, "Volume header")?;
    }

    // Metadata regions are tracked against physical volume 0.
    if !group.physical_volumes.is_empty() {
        let metadata_blocks = u64::from(header.metadata_size) / u64::from(block_size);

        for (index, offset) in header.metadata_block_offsets().into_iter().enumerate() {
            walk.state.mark_reserved(
                0,
                offset / u64::from(block_size),
                metadata_blocks,
                METADATA_SLOT_DESCRIPTIONS[index],
            )?;
            walk.metadata_blocks_processed += 1;
        }

        if let Some(descriptor) = encrypted_metadata {
            if descriptor.size_in_blocks > 0 {
                if descriptor.first_block_number > 0 {
                    walk.state.mark_reserved(
                        0,
                        descriptor.first_block_number,
                        descriptor.size_in_blocks,
                        "Encrypted metadata 1",
                    )?;
                }
                if descriptor.second_block_number > 0 {
                    walk.state.mark_reserved(
                        0,
                        descriptor.second_block_number,
                        descriptor.size_in_blocks,
                        "Encrypted metadata 2",
                    )?;
                }
            }
            walk.transactions_processed += 1;
        }
    }

    for (index, logical) in group.logical_volumes.iter().enumerate() {
        abort.check()?;

        let lv = walk
            .state
            .add_logical_volume(logical.identifier, logical.size / u64::from(block_size))?;

        if logical.is_locked {
            debug!("logical volume {index} is locked; no segments to walk");
            continue;
        }
        for segment in &logical.segments {
            walk.record_overlap(
                u32::from(segment.physical_volume_index),
                segment.physical_block_number,
                segment.number_of_blocks,
            );
            walk.state.mark_allocated(
                u32::from(segment.physical_volume_index),
                segment.physical_block_number,
                segment.number_of_blocks,
                lv,
                segment.logical_block_number,
                Provenance::new(0, 0, SEGMENT_ALLOCATION_BLOCK_TYPE),
            )?;
        }
    }
    walk.state.recompute_statistics();

    Ok(walk)
}

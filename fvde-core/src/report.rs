// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Report output for the check operation.
//!
//! Three mutually exclusive forms: the human-readable allocation summary,
//! the per-extent allocation map, and a JSON document with a stable
//! schema. Block lookups translate a Linux 512-byte sector into the
//! containing extent.

use crate::extent::{ExtentState, VolumeState};
use crate::format_identifier;
use crate::walker::VolumeWalk;
use fvde_types::segment::{linux_sector_to_block, LINUX_SECTOR_SIZE};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// Allocation map lines emitted per physical volume before truncation.
const ALLOCATION_MAP_LIMIT: usize = 1000;

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}

/// Print the allocation summary.
pub fn write_allocation_summary(out: &mut dyn Write, walk: &VolumeWalk) -> io::Result<()> {
    let state = &walk.state;

    writeln!(out, "\nAllocation Summary:")?;

    for (index, volume) in state.physical_volumes().iter().enumerate() {
        let total = volume.size_in_blocks;

        writeln!(out, "\nPhysical Volume {index}:")?;
        writeln!(out, "  Identifier:       {}", format_identifier(&volume.identifier))?;
        writeln!(out, "  Total blocks:     {total}")?;
        writeln!(
            out,
            "  Reserved:         {} ({:.2}%)",
            volume.reserved_blocks,
            percent(volume.reserved_blocks, total)
        )?;
        writeln!(
            out,
            "  Allocated:        {} ({:.2}%)",
            volume.allocated_blocks,
            percent(volume.allocated_blocks, total)
        )?;
        writeln!(
            out,
            "  Free:             {} ({:.2}%)",
            volume.free_blocks,
            percent(volume.free_blocks, total)
        )?;
    }
    for (index, volume) in state.logical_volumes().iter().enumerate() {
        let total = volume.size_in_blocks;

        writeln!(out, "\nLogical Volume {index}:")?;
        writeln!(out, "  Identifier:       {}", format_identifier(&volume.identifier))?;
        writeln!(out, "  Total blocks:     {total}")?;
        writeln!(
            out,
            "  Mapped:           {} ({:.2}%)",
            volume.mapped_blocks,
            percent(volume.mapped_blocks, total)
        )?;
        writeln!(out, "  Unmapped:         {}", volume.unmapped_blocks)?;
    }
    writeln!(out)?;
    writeln!(out, "Total extents tracked: {}", state.total_extents())?;
    writeln!(out, "Errors: {}", walk.errors.len())?;
    writeln!(out, "Warnings: {}", walk.warnings.len())?;

    Ok(())
}

/// Print the per-extent allocation map.
///
/// Output is truncated after 1000 extents per physical volume unless
/// `verbose` is set.
pub fn write_allocation_map(
    out: &mut dyn Write,
    walk: &VolumeWalk,
    verbose: bool,
) -> io::Result<()> {
    let state = &walk.state;

    writeln!(out, "\nAllocation Map:")?;

    for index in 0..state.physical_volumes().len() as u32 {
        writeln!(out, "\nPhysical Volume {index} Extents:")?;

        let mut extent_count = 0usize;

        for extent in state.physical_extents(index) {
            write!(
                out,
                "  [{:<9}] blocks {}-{} ({} blocks)",
                extent.state.name(),
                extent.physical_block_start,
                extent.physical_end() - 1,
                extent.physical_block_count
            )?;

            match &extent.state {
                ExtentState::Allocated {
                    logical_volume, ..
                } => {
                    let (start, end) = extent.logical_range().expect("allocated extent");
                    write!(out, " -> LV{}:{}-{}", logical_volume, start, end - 1)?;
                }
                ExtentState::Reserved { description } => {
                    write!(out, " - {description}")?;
                }
                ExtentState::Free { .. } => {}
            }
            writeln!(out)?;

            extent_count += 1;

            if extent_count >= ALLOCATION_MAP_LIMIT && !verbose {
                writeln!(
                    out,
                    "  ... ({} more extents, use -v for full list)",
                    state.total_extents() - extent_count as u64
                )?;
                break;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct JsonPhysicalVolume {
    index: u32,
    uuid: String,
    size_blocks: u64,
    block_size: u32,
}

#[derive(Debug, Serialize)]
struct JsonLogicalVolume {
    index: u32,
    uuid: String,
    size_blocks: u64,
}

#[derive(Debug, Serialize)]
struct JsonVolume {
    physical_volumes: Vec<JsonPhysicalVolume>,
    logical_volumes: Vec<JsonLogicalVolume>,
}

#[derive(Debug, Serialize)]
struct JsonProcessing {
    order: &'static str,
    transactions_processed: u32,
    metadata_blocks_processed: u32,
}

#[derive(Debug, Serialize)]
struct JsonPhysicalAllocation {
    reserved_blocks: u64,
    allocated_blocks: u64,
    free_blocks: u64,
}

#[derive(Debug, Serialize)]
struct JsonLogicalAllocation {
    mapped_blocks: u64,
    unmapped_blocks: u64,
}

#[derive(Debug, Serialize)]
struct JsonAllocation {
    physical: BTreeMap<String, JsonPhysicalAllocation>,
    logical: BTreeMap<String, JsonLogicalAllocation>,
}

#[derive(Debug, Serialize)]
struct JsonReport {
    volume: JsonVolume,
    processing: JsonProcessing,
    allocation: JsonAllocation,
    errors: Vec<String>,
    warnings: Vec<String>,
}

fn build_json_report(walk: &VolumeWalk) -> JsonReport {
    let state = &walk.state;

    JsonReport {
        volume: JsonVolume {
            physical_volumes: state
                .physical_volumes()
                .iter()
                .enumerate()
                .map(|(index, volume)| JsonPhysicalVolume {
                    index: index as u32,
                    uuid: format_identifier(&volume.identifier),
                    size_blocks: volume.size_in_blocks,
                    block_size: state.block_size(),
                })
                .collect(),
            logical_volumes: state
                .logical_volumes()
                .iter()
                .enumerate()
                .map(|(index, volume)| JsonLogicalVolume {
                    index: index as u32,
                    uuid: format_identifier(&volume.identifier),
                    size_blocks: volume.size_in_blocks,
                })
                .collect(),
        },
        processing: JsonProcessing {
            order: walk.options.order.as_str(),
            transactions_processed: walk.transactions_processed,
            metadata_blocks_processed: walk.metadata_blocks_processed,
        },
        allocation: JsonAllocation {
            physical: state
                .physical_volumes()
                .iter()
                .enumerate()
                .map(|(index, volume)| {
                    (
                        index.to_string(),
                        JsonPhysicalAllocation {
                            reserved_blocks: volume.reserved_blocks,
                            allocated_blocks: volume.allocated_blocks,
                            free_blocks: volume.free_blocks,
                        },
                    )
                })
                .collect(),
            logical: state
                .logical_volumes()
                .iter()
                .enumerate()
                .map(|(index, volume)| {
                    (
                        index.to_string(),
                        JsonLogicalAllocation {
                            mapped_blocks: volume.mapped_blocks,
                            unmapped_blocks: volume.unmapped_blocks,
                        },
                    )
                })
                .collect(),
        },
        errors: walk
            .errors
            .iter()
            .map(|violation| format!("{}: {}", violation.kind, violation.description))
            .collect(),
        warnings: walk
            .warnings
            .iter()
            .map(|violation| format!("{}: {}", violation.kind, violation.description))
            .collect(),
    }
}

/// Print the JSON report.
pub fn write_json_report(out: &mut dyn Write, walk: &VolumeWalk) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, &build_json_report(walk))?;
    writeln!(out)?;

    Ok(())
}

/// Print the lookup for a Linux 512-byte sector.
///
/// Lookups resolve against physical volume 0.
pub fn write_sector_lookup(
    out: &mut dyn Write,
    state: &VolumeState,
    linux_sector: u64,
) -> io::Result<()> {
    let byte_offset = linux_sector * LINUX_SECTOR_SIZE;
    let block_number = linux_sector_to_block(linux_sector, state.block_size());

    writeln!(out, "\nBlock Information:")?;
    writeln!(out, "  Linux sector:       {linux_sector} (512-byte sectors)")?;
    writeln!(out, "  Linux byte offset:  {byte_offset} ({byte_offset:#x})")?;
    writeln!(out, "\n  FVDE physical:")?;
    writeln!(out, "    Volume index:     0")?;
    writeln!(out, "    Block number:     {block_number}")?;

    let extent = match state.find_physical_extent(0, block_number) {
        Some(extent) => extent,
        None => {
            writeln!(out, "\n  State:              UNKNOWN (not in any tracked extent)")?;
            writeln!(out)?;
            return Ok(());
        }
    };

    writeln!(out, "\n  State:              {}", extent.state.name())?;

    match &extent.state {
        ExtentState::Reserved { description } => {
            writeln!(out, "  Reserved for:       {description}")?;
        }
        ExtentState::Allocated {
            logical_volume,
            provenance,
            ..
        } => {
            writeln!(
                out,
                "  Allocated by:       Transaction {}, {:#06x}",
                provenance.transaction_id, provenance.block_type
            )?;
            writeln!(out, "\n  FVDE logical:")?;
            writeln!(out, "    Volume index:     {logical_volume}")?;
            writeln!(
                out,
                "    Block number:     {}",
                extent.logical_block_for(block_number).expect("block in extent")
            )?;
        }
        ExtentState::Free { provenance } => {
            writeln!(
                out,
                "  Freed by:           Transaction {}, {:#06x}",
                provenance.transaction_id, provenance.block_type
            )?;
        }
    }

    writeln!(out, "\n  Extent context:")?;
    writeln!(
        out,
        "    Physical extent:  PV{} blocks {}-{} ({} blocks)",
        extent.physical_volume,
        extent.physical_block_start,
        extent.physical_end() - 1,
        extent.physical_block_count
    )?;
    if let (ExtentState::Allocated { logical_volume, .. }, Some((start, end))) =
        (&extent.state, extent.logical_range())
    {
        writeln!(
            out,
            "    Logical extent:   LV{} blocks {}-{} ({} blocks)",
            logical_volume,
            start,
            end - 1,
            extent.physical_block_count
        )?;
    }
    writeln!(out)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Provenance;
    use crate::walker::{Violation, ViolationKind};

    fn sample_walk() -> VolumeWalk {
        let mut walk = VolumeWalk::default();
        let mut identifier = [0u8; 16];
        identifier[0] = 0xab;

        walk.state.add_physical_volume(identifier, 1000).unwrap();
        walk.state.add_logical_volume(identifier, 500).unwrap();
        walk.state.mark_reserved(0, 0, 1, "Volume header").unwrap();
        walk.state
            .mark_allocated(0, 10, 5, 0, 0, Provenance::new(7, 0, 0x0305))
            .unwrap();
        walk.state.recompute_statistics();
        walk
    }

    #[test]
    fn summary_lists_volumes_and_totals() {
        let walk = sample_walk();
        let mut out = Vec::new();
        write_allocation_summary(&mut out, &walk).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("Physical Volume 0:"));
        assert!(text.contains("ab000000-0000-0000-0000-000000000000"));
        assert!(text.contains("Reserved:         1 (0.10%)"));
        assert!(text.contains("Allocated:        5 (0.50%)"));
        assert!(text.contains("Mapped:           5 (1.00%)"));
        assert!(text.contains("Total extents tracked: 2"));
    }

    #[test]
    fn map_renders_extent_lines() {
        let walk = sample_walk();
        let mut out = Vec::new();
        write_allocation_map(&mut out, &walk, false).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("[RESERVED ] blocks 0-0 (1 blocks) - Volume header"));
        assert!(text.contains("[ALLOCATED] blocks 10-14 (5 blocks) -> LV0:0-4"));
        assert!(!text.contains("more extents"));
    }

    #[test]
    fn map_truncates_without_verbose() {
        let mut walk = VolumeWalk::default();
        walk.state.add_physical_volume([0u8; 16], 1 << 20).unwrap();

        for index in 0..1100u64 {
            walk.state
                .mark_free(0, index * 2, 1, Provenance::default())
                .unwrap();
        }
        let mut out = Vec::new();
        write_allocation_map(&mut out, &walk, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("... (100 more extents, use -v for full list)"));

        let mut out = Vec::new();
        write_allocation_map(&mut out, &walk, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("more extents"));
        assert!(text.contains("blocks 2198-2198"));
    }

    #[test]
    fn json_schema_is_stable() {
        let mut walk = sample_walk();
        walk.errors.push(Violation {
            kind: ViolationKind::ReservedViolation,
            physical_volume: 0,
            block_start: 0,
            block_count: 1,
            description: "blocks 0-0 overlap RESERVED extent at blocks 0-0".into(),
        });

        let mut out = Vec::new();
        write_json_report(&mut out, &walk).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(
            value["volume"]["physical_volumes"][0]["uuid"],
            "ab000000-0000-0000-0000-000000000000"
        );
        assert_eq!(value["volume"]["physical_volumes"][0]["block_size"], 4096);
        assert_eq!(value["processing"]["order"], "ascending");
        assert_eq!(value["allocation"]["physical"]["0"]["reserved_blocks"], 1);
        assert_eq!(value["allocation"]["physical"]["0"]["allocated_blocks"], 5);
        assert_eq!(value["allocation"]["logical"]["0"]["mapped_blocks"], 5);
        assert_eq!(value["allocation"]["logical"]["0"]["unmapped_blocks"], 495);
        assert_eq!(value["errors"].as_array().unwrap().len(), 1);
        assert_eq!(value["warnings"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn lookup_reports_allocated_blocks() {
        let walk = sample_walk();
        let mut out = Vec::new();
        // Sector 96 is byte offset 49152, block 12.
        write_sector_lookup(&mut out, &walk.state, 96).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("Linux sector:       96"));
        assert!(text.contains("Block number:     12"));
        assert!(text.contains("State:              ALLOCATED"));
        assert!(text.contains("Allocated by:       Transaction 7, 0x0305"));
        assert!(text.contains("Block number:     2"));
        assert!(text.contains("Physical extent:  PV0 blocks 10-14 (5 blocks)"));
        assert!(text.contains("Logical extent:   LV0 blocks 0-4 (5 blocks)"));
    }

    #[test]
    fn lookup_reports_unknown_blocks() {
        let walk = sample_walk();
        let mut out = Vec::new();
        write_sector_lookup(&mut out, &walk.state, 9999).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("UNKNOWN (not in any tracked extent)"));
    }
}

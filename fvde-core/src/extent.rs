// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory allocation state for a Core Storage volume group.
//!
//! Extents live in an append-only arena; each physical volume keeps a
//! list of arena indices sorted by physical block start, and each logical
//! volume keeps a list sorted by logical block start. An allocated extent
//! therefore appears in exactly one physical list and one logical list.
//! Extents are never removed or merged; adjacent extents of the same
//! state stay separate entries.

use crate::error::{Error, Result};

/// Maximum supported physical volumes per volume group.
pub const MAX_PHYSICAL_VOLUMES: usize = 16;

/// Maximum supported logical volumes per volume group.
pub const MAX_LOGICAL_VOLUMES: usize = 16;

/// Default Core Storage block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Metadata origin of an extent, carried for reporting only.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Provenance {
    pub transaction_id: u64,
    pub metadata_block_index: u32,
    pub block_type: u16,
}

impl Provenance {
    pub fn new(transaction_id: u64, metadata_block_index: u32, block_type: u16) -> Self {
        Self {
            transaction_id,
            metadata_block_index,
            block_type,
        }
    }
}

/// Allocation state of an extent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExtentState {
    Free {
        provenance: Provenance,
    },
    Allocated {
        logical_volume: u32,
        logical_block_start: u64,
        provenance: Provenance,
    },
    Reserved {
        description: &'static str,
    },
}

impl ExtentState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Free { .. } => "FREE",
            Self::Allocated { .. } => "ALLOCATED",
            Self::Reserved { .. } => "RESERVED",
        }
    }
}

/// A contiguous run of blocks on one physical volume.
#[derive(Clone, Debug)]
pub struct Extent {
    pub physical_volume: u32,
    pub physical_block_start: u64,
    pub physical_block_count: u64,
    pub state: ExtentState,
}

impl Extent {
    /// First block past the extent.
    pub fn physical_end(&self) -> u64 {
        self.physical_block_start + self.physical_block_count
    }

    pub fn contains_physical(&self, block_number: u64) -> bool {
        block_number >= self.physical_block_start && block_number < self.physical_end()
    }

    /// Half-open interval overlap test against `[start, start + count)`.
    pub fn overlaps(&self, start: u64, count: u64) -> bool {
        start < self.physical_end() && self.physical_block_start < start + count
    }

    /// Logical range of an allocated extent; the logical length equals the
    /// physical length.
    pub fn logical_range(&self) -> Option<(u64, u64)> {
        match &self.state {
            ExtentState::Allocated {
                logical_block_start,
                ..
            } => Some((
                *logical_block_start,
                *logical_block_start + self.physical_block_count,
            )),
            _ => None,
        }
    }

    /// Translate a physical block inside this extent to its logical block.
    pub fn logical_block_for(&self, physical_block: u64) -> Option<u64> {
        if !self.contains_physical(physical_block) {
            return None;
        }
        self.logical_range()
            .map(|(start, _)| start + (physical_block - self.physical_block_start))
    }
}

type ExtentId = usize;

/// A physical volume and its ordered extent list.
#[derive(Clone, Debug)]
pub struct PhysicalVolumeInfo {
    pub identifier: [u8; 16],
    pub size_in_blocks: u64,
    extents: Vec<ExtentId>,
    pub reserved_blocks: u64,
    pub allocated_blocks: u64,
    pub free_blocks: u64,
}

/// A logical volume and its ordered allocated-extent list.
#[derive(Clone, Debug)]
pub struct LogicalVolumeInfo {
    pub identifier: [u8; 16],
    pub size_in_blocks: u64,
    extents: Vec<ExtentId>,
    pub mapped_blocks: u64,
    pub unmapped_blocks: u64,
}

/// Root of the allocation state.
#[derive(Clone, Debug)]
pub struct VolumeState {
    physical_volumes: Vec<PhysicalVolumeInfo>,
    logical_volumes: Vec<LogicalVolumeInfo>,
    extents: Vec<Extent>,
    block_size: u32,
}

impl Default for VolumeState {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeState {
    pub fn new() -> Self {
        Self {
            physical_volumes: Vec::new(),
            logical_volumes: Vec::new(),
            extents: Vec::new(),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn set_block_size(&mut self, block_size: u32) -> Result<()> {
        if block_size == 0 {
            return Err(Error::InvalidArgument("block size must be non-zero".into()));
        }
        self.block_size = block_size;
        Ok(())
    }

    /// Register a physical volume, returning its index.
    pub fn add_physical_volume(&mut self, identifier: [u8; 16], size_in_blocks: u64) -> Result<u32> {
        if self.physical_volumes.len() >= MAX_PHYSICAL_VOLUMES {
            return Err(Error::CapacityExceeded("physical"));
        }
        self.physical_volumes.push(PhysicalVolumeInfo {
            identifier,
            size_in_blocks,
            extents: Vec::new(),
            reserved_blocks: 0,
            allocated_blocks: 0,
            free_blocks: 0,
        });

        Ok((self.physical_volumes.len() - 1) as u32)
    }

    /// Register a logical volume, returning its index.
    pub fn add_logical_volume(&mut self, identifier: [u8; 16], size_in_blocks: u64) -> Result<u32> {
        if self.logical_volumes.len() >= MAX_LOGICAL_VOLUMES {
            return Err(Error::CapacityExceeded("logical"));
        }
        self.logical_volumes.push(LogicalVolumeInfo {
            identifier,
            size_in_blocks,
            extents: Vec::new(),
            mapped_blocks: 0,
            unmapped_blocks: 0,
        });

        Ok((self.logical_volumes.len() - 1) as u32)
    }

    pub fn physical_volumes(&self) -> &[PhysicalVolumeInfo] {
        &self.physical_volumes
    }

    pub fn logical_volumes(&self) -> &[LogicalVolumeInfo] {
        &self.logical_volumes
    }

    pub fn total_extents(&self) -> u64 {
        self.extents.len() as u64
    }

    fn check_physical_index(&self, physical_volume: u32) -> Result<usize> {
        if (physical_volume as usize) < self.physical_volumes.len() {
            Ok(physical_volume as usize)
        } else {
            Err(Error::OutOfBounds("physical", physical_volume))
        }
    }

    fn check_logical_index(&self, logical_volume: u32) -> Result<usize> {
        if (logical_volume as usize) < self.logical_volumes.len() {
            Ok(logical_volume as usize)
        } else {
            Err(Error::OutOfBounds("logical", logical_volume))
        }
    }

    fn check_block_count(block_count: u64) -> Result<()> {
        if block_count == 0 {
            Err(Error::InvalidArgument(
                "extent block count must be non-zero".into(),
            ))
        } else {
            Ok(())
        }
    }

    /// Insert into the physical list, keeping it sorted by block start.
    /// On equal keys the new extent lands after existing entries.
    fn insert_physical(&mut self, pv: usize, id: ExtentId) {
        let start = self.extents[id].physical_block_start;
        let extents = &self.extents;
        let list = &mut self.physical_volumes[pv].extents;
        let position = list.partition_point(|&entry| extents[entry].physical_block_start <= start);

        list.insert(position, id);
    }

    /// Insert into the logical list, sorted by logical block start with
    /// the same equal-key discipline as [Self::insert_physical].
    fn insert_logical(&mut self, lv: usize, id: ExtentId) {
        let start = match self.extents[id].logical_range() {
            Some((start, _)) => start,
            None => return,
        };
        let extents = &self.extents;
        let list = &mut self.logical_volumes[lv].extents;
        let position = list.partition_point(|&entry| match extents[entry].logical_range() {
            Some((existing, _)) => existing <= start,
            None => true,
        });

        list.insert(position, id);
    }

    /// Record a reserved region on a physical volume.
    pub fn mark_reserved(
        &mut self,
        physical_volume: u32,
        block_start: u64,
        block_count: u64,
        description: &'static str,
    ) -> Result<()> {
        let pv = self.check_physical_index(physical_volume)?;
        Self::check_block_count(block_count)?;

        self.extents.push(Extent {
            physical_volume,
            physical_block_start: block_start,
            physical_block_count: block_count,
            state: ExtentState::Reserved { description },
        });
        self.insert_physical(pv, self.extents.len() - 1);

        Ok(())
    }

    /// Record a free region on a physical volume.
    pub fn mark_free(
        &mut self,
        physical_volume: u32,
        block_start: u64,
        block_count: u64,
        provenance: Provenance,
    ) -> Result<()> {
        let pv = self.check_physical_index(physical_volume)?;
        Self::check_block_count(block_count)?;

        self.extents.push(Extent {
            physical_volume,
            physical_block_start: block_start,
            physical_block_count: block_count,
            state: ExtentState::Free { provenance },
        });
        self.insert_physical(pv, self.extents.len() - 1);

        Ok(())
    }

    /// Record an allocation mapping a physical range onto a logical range.
    ///
    /// The extent enters both the physical volume's list and the logical
    /// volume's list.
    pub fn mark_allocated(
        &mut self,
        physical_volume: u32,
        physical_block_start: u64,
        block_count: u64,
        logical_volume: u32,
        logical_block_start: u64,
        provenance: Provenance,
    ) -> Result<()> {
        let pv = self.check_physical_index(physical_volume)?;
        let lv = self.check_logical_index(logical_volume)?;
        Self::check_block_count(block_count)?;

        self.extents.push(Extent {
            physical_volume,
            physical_block_start,
            physical_block_count: block_count,
            state: ExtentState::Allocated {
                logical_volume,
                logical_block_start,
                provenance,
            },
        });
        let id = self.extents.len() - 1;
        self.insert_physical(pv, id);
        self.insert_logical(lv, id);

        Ok(())
    }

    /// Find the extent containing a physical block, if any.
    pub fn find_physical_extent(&self, physical_volume: u32, block_number: u64) -> Option<&Extent> {
        let info = self.physical_volumes.get(physical_volume as usize)?;

        for &id in &info.extents {
            let extent = &self.extents[id];

            if extent.contains_physical(block_number) {
                return Some(extent);
            }
            // The list is sorted; nothing later can contain the block.
            if extent.physical_block_start > block_number {
                break;
            }
        }
        None
    }

    /// Find the allocated extent containing a logical block, if any.
    pub fn find_logical_extent(&self, logical_volume: u32, block_number: u64) -> Option<&Extent> {
        let info = self.logical_volumes.get(logical_volume as usize)?;

        for &id in &info.extents {
            let extent = &self.extents[id];
            let (start, end) = extent.logical_range()?;

            if block_number >= start && block_number < end {
                return Some(extent);
            }
            if start > block_number {
                break;
            }
        }
        None
    }

    /// Return the first stored extent overlapping `[block_start,
    /// block_start + block_count)` on the physical volume, if any.
    pub fn check_overlap(
        &self,
        physical_volume: u32,
        block_start: u64,
        block_count: u64,
    ) -> Option<&Extent> {
        let info = self.physical_volumes.get(physical_volume as usize)?;
        let block_end = block_start + block_count;

        for &id in &info.extents {
            let extent = &self.extents[id];

            if extent.overlaps(block_start, block_count) {
                return Some(extent);
            }
            if extent.physical_block_start >= block_end {
                break;
            }
        }
        None
    }

    /// Iterate a physical volume's extents in block order.
    pub fn physical_extents(&self, physical_volume: u32) -> impl Iterator<Item = &Extent> + '_ {
        self.physical_volumes
            .get(physical_volume as usize)
            .map(|info| info.extents.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&id| &self.extents[id])
    }

    /// Iterate a logical volume's allocated extents in logical order.
    pub fn logical_extents(&self, logical_volume: u32) -> impl Iterator<Item = &Extent> + '_ {
        self.logical_volumes
            .get(logical_volume as usize)
            .map(|info| info.extents.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&id| &self.extents[id])
    }

    /// Recompute all per-volume statistics from the extent lists.
    ///
    /// Idempotent; the statistics are pure functions of the lists.
    pub fn recompute_statistics(&mut self) {
        for pv in 0..self.physical_volumes.len() {
            let mut reserved = 0;
            let mut allocated = 0;
            let mut free = 0;

            for &id in &self.physical_volumes[pv].extents {
                let extent = &self.extents[id];

                match extent.state {
                    ExtentState::Reserved { .. } => reserved += extent.physical_block_count,
                    ExtentState::Allocated { .. } => allocated += extent.physical_block_count,
                    ExtentState::Free { .. } => free += extent.physical_block_count,
                }
            }
            let info = &mut self.physical_volumes[pv];
            info.reserved_blocks = reserved;
            info.allocated_blocks = allocated;
            info.free_blocks = free;
        }
        for lv in 0..self.logical_volumes.len() {
            let mapped = self.logical_volumes[lv]
                .extents
                .iter()
                .map(|&id| self.extents[id].physical_block_count)
                .sum();
            let info = &mut self.logical_volumes[lv];
            info.mapped_blocks = mapped;
            info.unmapped_blocks = info.size_in_blocks.saturating_sub(mapped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifier(tag: u8) -> [u8; 16] {
        let mut id = [0u8; 16];
        id[15] = tag;
        id
    }

    fn state_with_volumes() -> VolumeState {
        let mut state = VolumeState::new();
        state.add_physical_volume(identifier(1), 1000).unwrap();
        state.add_logical_volume(identifier(2), 500).unwrap();
        state
    }

    #[test]
    fn insertion_keeps_physical_order() {
        let mut state = state_with_volumes();
        state.mark_reserved(0, 0, 1, "H").unwrap();
        state
            .mark_allocated(0, 10, 5, 0, 0, Provenance::default())
            .unwrap();
        state
            .mark_allocated(0, 4, 3, 0, 5, Provenance::default())
            .unwrap();

        let starts: Vec<u64> = state
            .physical_extents(0)
            .map(|extent| extent.physical_block_start)
            .collect();
        assert_eq!(starts, [0, 4, 10]);

        let overlap = state.check_overlap(0, 6, 3).unwrap();
        assert_eq!(overlap.physical_block_start, 4);

        let found = state.find_physical_extent(0, 12).unwrap();
        assert_eq!(found.physical_block_start, 10);
    }

    #[test]
    fn equal_keys_append_after_existing() {
        let mut state = state_with_volumes();
        state.mark_reserved(0, 5, 2, "first").unwrap();
        state.mark_reserved(0, 5, 4, "second").unwrap();

        let counts: Vec<u64> = state
            .physical_extents(0)
            .map(|extent| extent.physical_block_count)
            .collect();
        assert_eq!(counts, [2, 4]);
    }

    #[test]
    fn physical_volume_capacity() {
        let mut state = VolumeState::new();

        for tag in 0..16 {
            state.add_physical_volume(identifier(tag), 100).unwrap();
        }
        assert!(matches!(
            state.add_physical_volume(identifier(16), 100),
            Err(Error::CapacityExceeded("physical"))
        ));
        assert_eq!(state.physical_volumes().len(), 16);
    }

    #[test]
    fn logical_volume_capacity() {
        let mut state = VolumeState::new();

        for tag in 0..16 {
            state.add_logical_volume(identifier(tag), 100).unwrap();
        }
        assert!(matches!(
            state.add_logical_volume(identifier(16), 100),
            Err(Error::CapacityExceeded("logical"))
        ));
    }

    #[test]
    fn rejects_out_of_bounds_indices() {
        let mut state = state_with_volumes();

        assert!(matches!(
            state.mark_reserved(3, 0, 1, "x"),
            Err(Error::OutOfBounds("physical", 3))
        ));
        assert!(matches!(
            state.mark_allocated(0, 0, 1, 7, 0, Provenance::default()),
            Err(Error::OutOfBounds("logical", 7))
        ));
        assert!(state.find_physical_extent(3, 0).is_none());
        assert!(state.check_overlap(3, 0, 1).is_none());
    }

    #[test]
    fn rejects_empty_extents() {
        let mut state = state_with_volumes();

        assert!(matches!(
            state.mark_reserved(0, 0, 0, "x"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            state.mark_free(0, 0, 0, Provenance::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn overlap_is_half_open() {
        let mut state = state_with_volumes();
        state.mark_reserved(0, 10, 5, "r").unwrap();

        // Touching ranges do not overlap.
        assert!(state.check_overlap(0, 15, 5).is_none());
        assert!(state.check_overlap(0, 5, 5).is_none());
        // One block of intersection does.
        assert!(state.check_overlap(0, 14, 5).is_some());
        assert!(state.check_overlap(0, 5, 6).is_some());
        // Fully contained and fully containing ranges overlap.
        assert!(state.check_overlap(0, 11, 2).is_some());
        assert!(state.check_overlap(0, 0, 100).is_some());
    }

    #[test]
    fn find_physical_extent_boundaries() {
        let mut state = state_with_volumes();
        state.mark_reserved(0, 10, 5, "r").unwrap();

        assert!(state.find_physical_extent(0, 9).is_none());
        assert_eq!(
            state
                .find_physical_extent(0, 10)
                .unwrap()
                .physical_block_start,
            10
        );
        assert_eq!(
            state
                .find_physical_extent(0, 14)
                .unwrap()
                .physical_block_start,
            10
        );
        assert!(state.find_physical_extent(0, 15).is_none());
    }

    #[test]
    fn logical_lookup_uses_logical_order() {
        let mut state = state_with_volumes();
        // Physical order differs from logical order.
        state
            .mark_allocated(0, 100, 10, 0, 50, Provenance::default())
            .unwrap();
        state
            .mark_allocated(0, 200, 10, 0, 0, Provenance::default())
            .unwrap();

        let starts: Vec<u64> = state
            .logical_extents(0)
            .map(|extent| extent.logical_range().unwrap().0)
            .collect();
        assert_eq!(starts, [0, 50]);

        let extent = state.find_logical_extent(0, 55).unwrap();
        assert_eq!(extent.physical_block_start, 100);
        assert_eq!(extent.logical_block_for(105), Some(55));

        assert!(state.find_logical_extent(0, 20).is_none());
        assert!(state.find_logical_extent(0, 60).is_none());
    }

    #[test]
    fn statistics_match_brute_force() {
        let mut state = state_with_volumes();
        state.mark_reserved(0, 0, 1, "header").unwrap();
        state.mark_reserved(0, 1, 2, "metadata").unwrap();
        state
            .mark_allocated(0, 10, 5, 0, 0, Provenance::default())
            .unwrap();
        state
            .mark_allocated(0, 20, 7, 0, 5, Provenance::default())
            .unwrap();
        state.mark_free(0, 30, 4, Provenance::default()).unwrap();

        state.recompute_statistics();

        let pv = &state.physical_volumes()[0];
        assert_eq!(pv.reserved_blocks, 3);
        assert_eq!(pv.allocated_blocks, 12);
        assert_eq!(pv.free_blocks, 4);

        let lv = &state.logical_volumes()[0];
        assert_eq!(lv.mapped_blocks, 12);
        assert_eq!(lv.unmapped_blocks, 500 - 12);

        // A second pass yields identical totals.
        state.recompute_statistics();
        assert_eq!(state.physical_volumes()[0].reserved_blocks, 3);
        assert_eq!(state.logical_volumes()[0].mapped_blocks, 12);
    }

    #[test]
    fn unmapped_saturates_at_zero() {
        let mut state = VolumeState::new();
        state.add_physical_volume(identifier(1), 1000).unwrap();
        state.add_logical_volume(identifier(2), 5).unwrap();
        state
            .mark_allocated(0, 0, 10, 0, 0, Provenance::default())
            .unwrap();

        state.recompute_statistics();
        assert_eq!(state.logical_volumes()[0].unmapped_blocks, 0);
    }

    #[test]
    fn allocated_extent_in_both_lists_with_same_count() {
        let mut state = state_with_volumes();
        state
            .mark_allocated(0, 42, 6, 0, 7, Provenance::new(9, 1, 0x0305))
            .unwrap();

        let physical: Vec<_> = state.physical_extents(0).collect();
        let logical: Vec<_> = state.logical_extents(0).collect();
        assert_eq!(physical.len(), 1);
        assert_eq!(logical.len(), 1);
        assert_eq!(
            physical[0].physical_block_count,
            logical[0].physical_block_count
        );
        assert_eq!(state.total_extents(), 1);
    }
}

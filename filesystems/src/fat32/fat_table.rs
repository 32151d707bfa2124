// FAT32 allocation table: typed entries, chain walking and mirrored-copy flushing
// Copy 0 is the working copy; every dirty sector is written to all copies on flush

use super::boot_sector::BootSector;
use crate::fat_common::*;
use byteorder::{ByteOrder, LittleEndian};
use fat32mgr_core::{BlockDevice, VolumeError};
use log::{debug, trace, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Meaning of one FAT slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    /// Values 0x0000001 (and the two reserved slots)
    Reserved,
    Allocated(u32),
    EndOfChain,
    Bad,
}

impl FatEntry {
    pub fn from_raw(raw: u32) -> Self {
        match raw & FAT32_ENTRY_MASK {
            FAT32_FREE => FatEntry::Free,
            1 => FatEntry::Reserved,
            FAT32_BAD => FatEntry::Bad,
            v if v >= FAT32_EOC => FatEntry::EndOfChain,
            v => FatEntry::Allocated(v),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            FatEntry::Free => FAT32_FREE,
            FatEntry::Reserved => 1,
            FatEntry::Allocated(next) => next & FAT32_ENTRY_MASK,
            FatEntry::EndOfChain => FAT32_EOC_MAX,
            FatEntry::Bad => FAT32_BAD,
        }
    }
}

/// Kind of structural fault found in a cluster chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ClusterFault {
    OutOfRange,
    Free,
    Bad,
    Cycle,
    CrossLink,
}

impl fmt::Display for ClusterFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ClusterFault::OutOfRange => "cluster number out of range",
            ClusterFault::Free => "free cluster in chain",
            ClusterFault::Bad => "bad cluster in chain",
            ClusterFault::Cycle => "chain loops back on itself",
            ClusterFault::CrossLink => "cluster claimed by another file",
        };
        f.write_str(text)
    }
}

/// Where a chain walk stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainFault {
    /// FAT slot holding the faulty value; `None` for the start cluster itself
    pub fat_index: Option<u32>,
    pub value: u32,
    pub fault: ClusterFault,
}

impl From<ChainFault> for VolumeError {
    fn from(f: ChainFault) -> Self {
        let cluster = f.fat_index.unwrap_or(f.value);
        VolumeError::chain(cluster, format!("{} (value 0x{:08X})", f.fault, f.value))
    }
}

/// A FAT copy that disagrees with copy 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatDivergence {
    pub fat_index: u32,
    pub first_cluster: u32,
    pub differing_entries: u32,
}

#[derive(Debug, Clone)]
pub struct FatTable {
    slots: Vec<u32>,
    /// Slots 0..limit map to real clusters (limit = max cluster + 1)
    limit: u32,
    num_fats: u32,
    fat_start: u64,
    sectors_per_fat: u64,
    bytes_per_sector: usize,
    dirty: BTreeSet<u64>,
    modified: bool,
    divergences: Vec<FatDivergence>,
}

fn decode_slots(bytes: &[u8]) -> Vec<u32> {
    bytes.chunks_exact(FAT32_ENTRY_SIZE).map(LittleEndian::read_u32).collect()
}

impl FatTable {
    /// Read every FAT copy, keeping copy 0 and recording where the others differ
    pub fn load<D: BlockDevice>(device: &mut D, boot: &BootSector) -> Result<Self, VolumeError> {
        let bytes_per_sector = boot.bytes_per_sector as usize;
        let fat_bytes = boot.sectors_per_fat as usize * bytes_per_sector;
        let limit = boot.max_cluster() + 1;

        let mut buf = vec![0u8; fat_bytes];
        device.read_sectors(boot.fat_start_sector(0), &mut buf)?;
        let slots = decode_slots(&buf);

        let mut divergences = Vec::new();
        for fat_index in 1..boot.num_fats {
            device.read_sectors(boot.fat_start_sector(fat_index), &mut buf)?;
            let mirror = decode_slots(&buf);
            let mut first_cluster = None;
            let mut differing = 0u32;
            for cluster in 0..limit as usize {
                if (slots[cluster] ^ mirror[cluster]) & FAT32_ENTRY_MASK != 0 {
                    first_cluster.get_or_insert(cluster as u32);
                    differing += 1;
                }
            }
            if let Some(first_cluster) = first_cluster {
                warn!(
                    "FAT copy {} differs from copy 0 in {} entries (first at cluster {})",
                    fat_index, differing, first_cluster
                );
                divergences.push(FatDivergence {
                    fat_index,
                    first_cluster,
                    differing_entries: differing,
                });
            }
        }

        debug!("Loaded FAT: {} clusters, {} copies", limit - FAT32_MIN_CLUSTER, boot.num_fats);
        Ok(Self {
            slots,
            limit,
            num_fats: boot.num_fats,
            fat_start: boot.fat_start_sector(0),
            sectors_per_fat: boot.sectors_per_fat as u64,
            bytes_per_sector,
            dirty: BTreeSet::new(),
            modified: false,
            divergences,
        })
    }

    pub fn divergences(&self) -> &[FatDivergence] {
        &self.divergences
    }

    /// Highest valid cluster number
    pub fn max_cluster(&self) -> u32 {
        self.limit - 1
    }

    pub fn in_range(&self, cluster: u32) -> bool {
        cluster >= FAT32_MIN_CLUSTER && cluster < self.limit
    }

    /// True once any entry has been written since mount
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    fn check(&self, cluster: u32) -> Result<(), VolumeError> {
        if self.in_range(cluster) {
            Ok(())
        } else {
            Err(VolumeError::chain(cluster, format!("cluster out of range 2..={}", self.max_cluster())))
        }
    }

    /// Raw 32-bit slot value (high nibble included)
    pub fn raw(&self, cluster: u32) -> Result<u32, VolumeError> {
        self.check(cluster)?;
        Ok(self.slots[cluster as usize])
    }

    pub fn read(&self, cluster: u32) -> Result<FatEntry, VolumeError> {
        self.raw(cluster).map(FatEntry::from_raw)
    }

    /// Update one entry, keeping the reserved high nibble
    pub fn write(&mut self, cluster: u32, entry: FatEntry) -> Result<(), VolumeError> {
        self.check(cluster)?;
        let slot = &mut self.slots[cluster as usize];
        *slot = (*slot & !FAT32_ENTRY_MASK) | entry.to_raw();
        let entries_per_sector = (self.bytes_per_sector / FAT32_ENTRY_SIZE) as u64;
        self.dirty.insert(cluster as u64 / entries_per_sector);
        self.modified = true;
        trace!("FAT[{}] = {:?}", cluster, entry);
        Ok(())
    }

    pub fn is_free(&self, cluster: u32) -> bool {
        self.in_range(cluster) && self.slots[cluster as usize] & FAT32_ENTRY_MASK == FAT32_FREE
    }

    pub fn free_count(&self) -> u32 {
        (FAT32_MIN_CLUSTER..self.limit).filter(|&c| self.is_free(c)).count() as u32
    }

    pub fn first_free(&self) -> Option<u32> {
        (FAT32_MIN_CLUSTER..self.limit).find(|&c| self.is_free(c))
    }

    /// Lowest cluster starting `len` consecutive free clusters
    pub fn find_free_run(&self, len: u32) -> Option<u32> {
        if len == 0 {
            return None;
        }
        let mut run_start = FAT32_MIN_CLUSTER;
        let mut run_len = 0;
        for cluster in FAT32_MIN_CLUSTER..self.limit {
            if self.is_free(cluster) {
                if run_len == 0 {
                    run_start = cluster;
                }
                run_len += 1;
                if run_len == len {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Allocate `len` free clusters in ascending order and link them into a chain
    pub fn allocate_chain(&mut self, len: u32) -> Result<Vec<u32>, VolumeError> {
        let clusters: Vec<u32> = (FAT32_MIN_CLUSTER..self.limit)
            .filter(|&c| self.is_free(c))
            .take(len as usize)
            .collect();
        if clusters.len() < len as usize {
            return Err(VolumeError::Capacity(format!(
                "{} clusters requested, {} free",
                len,
                clusters.len()
            )));
        }
        self.link(&clusters)?;
        Ok(clusters)
    }

    /// Link `clusters` in order, terminating with end of chain
    pub fn link(&mut self, clusters: &[u32]) -> Result<(), VolumeError> {
        for pair in clusters.windows(2) {
            self.write(pair[0], FatEntry::Allocated(pair[1]))?;
        }
        if let Some(&last) = clusters.last() {
            self.write(last, FatEntry::EndOfChain)?;
        }
        Ok(())
    }

    /// Free the whole chain starting at `start`; nothing is freed if the chain is corrupt
    pub fn free_chain(&mut self, start: u32) -> Result<u32, VolumeError> {
        let chain = self.chain(start)?;
        for &cluster in &chain {
            self.write(cluster, FatEntry::Free)?;
        }
        Ok(chain.len() as u32)
    }

    pub fn mark_bad(&mut self, cluster: u32) -> Result<(), VolumeError> {
        self.write(cluster, FatEntry::Bad)
    }

    /// Lazily follow the chain starting at `start`
    pub fn walk(&self, start: u32) -> ChainWalk<'_> {
        ChainWalk::new(self, start)
    }

    pub fn chain(&self, start: u32) -> Result<Vec<u32>, VolumeError> {
        self.walk(start).map(|r| r.map_err(VolumeError::from)).collect()
    }

    pub fn cluster_count(&self, start: u32) -> Result<u32, VolumeError> {
        self.chain(start).map(|c| c.len() as u32)
    }

    /// Write dirty FAT sectors to every copy
    pub fn flush<D: BlockDevice>(&mut self, device: &mut D) -> Result<(), VolumeError> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let entries_per_sector = self.bytes_per_sector / FAT32_ENTRY_SIZE;
        let mut sector = vec![0u8; self.bytes_per_sector];
        for fat_index in 0..self.num_fats as u64 {
            let base = self.fat_start + fat_index * self.sectors_per_fat;
            for &index in &self.dirty {
                let first = index as usize * entries_per_sector;
                LittleEndian::write_u32_into(&self.slots[first..first + entries_per_sector], &mut sector);
                device.write_sector(base + index, &sector)?;
            }
        }
        device.flush()?;
        debug!("Flushed {} FAT sectors to {} copies", self.dirty.len(), self.num_fats);
        self.dirty.clear();
        Ok(())
    }
}

/// Iterator over a cluster chain.
///
/// Yields each cluster of the chain; a structural fault is yielded as a
/// final `Err` and ends the walk.
pub struct ChainWalk<'a> {
    fat: &'a FatTable,
    next: Option<u32>,
    pending: Option<ChainFault>,
    visited: HashSet<u32>,
}

impl<'a> ChainWalk<'a> {
    fn new(fat: &'a FatTable, start: u32) -> Self {
        let mut walk = Self {
            fat,
            next: None,
            pending: None,
            visited: HashSet::new(),
        };
        if fat.in_range(start) {
            walk.next = Some(start);
            walk.visited.insert(start);
        } else {
            walk.pending = Some(ChainFault {
                fat_index: None,
                value: start,
                fault: ClusterFault::OutOfRange,
            });
        }
        walk
    }
}

impl Iterator for ChainWalk<'_> {
    type Item = Result<u32, ChainFault>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(fault) = self.pending.take() {
            return Some(Err(fault));
        }
        let current = self.next.take()?;
        let raw = self.fat.slots[current as usize] & FAT32_ENTRY_MASK;
        let fault = |fault| ChainFault {
            fat_index: Some(current),
            value: raw,
            fault,
        };

        match FatEntry::from_raw(raw) {
            FatEntry::EndOfChain => {}
            FatEntry::Allocated(next) if !self.fat.in_range(next) => {
                self.pending = Some(fault(ClusterFault::OutOfRange));
            }
            FatEntry::Allocated(next) => {
                if self.visited.insert(next) {
                    self.next = Some(next);
                } else {
                    self.pending = Some(fault(ClusterFault::Cycle));
                }
            }
            FatEntry::Free => self.pending = Some(fault(ClusterFault::Free)),
            FatEntry::Bad => self.pending = Some(fault(ClusterFault::Bad)),
            FatEntry::Reserved => self.pending = Some(fault(ClusterFault::OutOfRange)),
        }
        Some(Ok(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory table with `clusters` data clusters and no device behind it
    fn table(clusters: u32) -> FatTable {
        let limit = clusters + 2;
        let mut slots = vec![0u32; limit as usize];
        slots[0] = 0x0FFFFFF8;
        slots[1] = FAT32_EOC_MAX;
        FatTable {
            slots,
            limit,
            num_fats: 2,
            fat_start: 32,
            sectors_per_fat: 1,
            bytes_per_sector: 512,
            dirty: BTreeSet::new(),
            modified: false,
            divergences: Vec::new(),
        }
    }

    #[test]
    fn entry_decoding() {
        assert_eq!(FatEntry::from_raw(0), FatEntry::Free);
        assert_eq!(FatEntry::from_raw(0xF000_0000), FatEntry::Free);
        assert_eq!(FatEntry::from_raw(5), FatEntry::Allocated(5));
        assert_eq!(FatEntry::from_raw(0x0FFFFFF7), FatEntry::Bad);
        assert_eq!(FatEntry::from_raw(0x0FFFFFF8), FatEntry::EndOfChain);
        assert_eq!(FatEntry::from_raw(0xFFFFFFFF), FatEntry::EndOfChain);
    }

    #[test]
    fn read_is_bounds_checked() {
        let fat = table(10);
        assert!(matches!(fat.read(0), Err(VolumeError::ClusterChain { cluster: 0, .. })));
        assert!(matches!(fat.read(12), Err(VolumeError::ClusterChain { cluster: 12, .. })));
        assert_eq!(fat.read(11).unwrap(), FatEntry::Free);
    }

    #[test]
    fn allocate_first_fit_and_walk() {
        let mut fat = table(10);
        fat.write(2, FatEntry::EndOfChain).unwrap();
        fat.write(4, FatEntry::EndOfChain).unwrap();
        let chain = fat.allocate_chain(3).unwrap();
        assert_eq!(chain, vec![3, 5, 6]);
        assert_eq!(fat.chain(3).unwrap(), chain);
        assert_eq!(fat.free_count(), 10 - 5);
    }

    #[test]
    fn allocation_failure_leaves_table_untouched() {
        let mut fat = table(4);
        fat.write(2, FatEntry::EndOfChain).unwrap();
        let before = fat.slots.clone();
        assert!(matches!(fat.allocate_chain(4), Err(VolumeError::Capacity(_))));
        assert_eq!(fat.slots, before);
    }

    #[test]
    fn walk_detects_cycles() {
        let mut fat = table(10);
        fat.write(2, FatEntry::Allocated(3)).unwrap();
        fat.write(3, FatEntry::Allocated(4)).unwrap();
        fat.write(4, FatEntry::Allocated(2)).unwrap();

        let items: Vec<_> = fat.walk(2).collect();
        assert_eq!(items.len(), 4);
        assert_eq!(
            items[3],
            Err(ChainFault {
                fat_index: Some(4),
                value: 2,
                fault: ClusterFault::Cycle
            })
        );
        assert!(matches!(fat.free_chain(2), Err(VolumeError::ClusterChain { .. })));
        // nothing freed
        assert_eq!(fat.read(3).unwrap(), FatEntry::Allocated(4));
    }

    #[test]
    fn walk_rejects_free_bad_and_out_of_range_links() {
        let mut fat = table(10);
        fat.write(2, FatEntry::Allocated(3)).unwrap();
        let last = fat.walk(2).last().unwrap();
        assert_eq!(last.unwrap_err().fault, ClusterFault::Free);

        fat.write(3, FatEntry::Bad).unwrap();
        assert_eq!(fat.walk(2).last().unwrap().unwrap_err().fault, ClusterFault::Bad);

        fat.write(3, FatEntry::Allocated(500)).unwrap();
        let fault = fat.walk(2).last().unwrap().unwrap_err();
        assert_eq!(fault.fault, ClusterFault::OutOfRange);
        assert_eq!(fault.fat_index, Some(3));

        let fault = fat.walk(99).next().unwrap().unwrap_err();
        assert_eq!(fault.fat_index, None);
        assert_eq!(fault.value, 99);
    }

    #[test]
    fn free_chain_releases_every_cluster() {
        let mut fat = table(10);
        let chain = fat.allocate_chain(4).unwrap();
        assert_eq!(fat.free_chain(chain[0]).unwrap(), 4);
        assert_eq!(fat.free_count(), 10);
    }

    #[test]
    fn find_free_run_returns_lowest() {
        let mut fat = table(10);
        fat.write(4, FatEntry::EndOfChain).unwrap();
        fat.write(8, FatEntry::EndOfChain).unwrap();
        assert_eq!(fat.find_free_run(2), Some(2));
        assert_eq!(fat.find_free_run(3), Some(5));
        assert_eq!(fat.find_free_run(4), None);
    }

    #[test]
    fn writes_preserve_high_nibble() {
        let mut fat = table(10);
        fat.slots[5] = 0xA000_0000;
        fat.write(5, FatEntry::EndOfChain).unwrap();
        assert_eq!(fat.slots[5], 0xAFFF_FFFF);
        assert!(fat.is_dirty());
    }
}

// Mounted FAT32 volume: owns the device, the working FAT and the directory tree
// Mutations write cluster data first, then the FAT, then the directory record

use super::boot_sector::{BootSector, FsInfo};
use super::directory::*;
use super::fat_table::{FatDivergence, FatEntry, FatTable};
use crate::fat_common::attributes::*;
use crate::fat_common::*;
use chrono::NaiveDateTime;
use fat32mgr_core::{BlockDevice, EngineConfig, VolumeError};
use log::{debug, info, trace, warn};
use serde::Serialize;

/// FAT32 directories hold at most 65536 records
const MAX_DIRECTORY_BYTES: usize = 65536 * DIR_ENTRY_SIZE;

#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Clamp out-of-range date and time fields instead of dropping them
    pub fix_dates: bool,
}

impl From<&EngineConfig> for MountOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            fix_dates: config.fix_dir_entry_dates,
        }
    }
}

/// Summary of a mounted volume, as shown by `info`
#[derive(Debug, Clone, Serialize)]
pub struct VolumeProperties {
    pub label: String,
    pub serial: String,
    pub media_descriptor: u8,
    pub formatter_name: String,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub total_sectors: u32,
    pub hidden_sectors: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub sectors_per_fat: u32,
    pub backup_boot_sector: u16,
    pub root_cluster: u32,
    pub num_clusters: u32,
    pub free_clusters: u32,
    pub fat_divergences: Vec<FatDivergence>,
}

pub struct Volume<D: BlockDevice> {
    pub(crate) device: D,
    pub(crate) boot: BootSector,
    pub(crate) fat: FatTable,
    pub(crate) tree: DirectoryTree,
    pub(crate) options: MountOptions,
}

impl<D: BlockDevice> Volume<D> {
    pub fn mount(device: D) -> Result<Self, VolumeError> {
        Self::mount_with(device, MountOptions::default())
    }

    /// Read and validate the boot sector, then load the FAT
    pub fn mount_with(mut device: D, options: MountOptions) -> Result<Self, VolumeError> {
        let mut sector = vec![0u8; device.sector_size()];
        device.read_sector(0, &mut sector)?;
        let boot = BootSector::parse(&sector)?;
        boot.check_device(device.sector_size(), device.num_sectors())?;
        let fat = FatTable::load(&mut device, &boot)?;

        info!(
            "Mounted FAT32 volume \"{}\" ({} clusters of {} bytes)",
            boot.label(),
            boot.num_clusters(),
            boot.cluster_size()
        );
        Ok(Self {
            tree: DirectoryTree::new(boot.root_cluster),
            device,
            boot,
            fat,
            options,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn boot_sector(&self) -> &BootSector {
        &self.boot
    }

    pub fn fat(&self) -> &FatTable {
        &self.fat
    }

    pub fn fat_divergences(&self) -> &[FatDivergence] {
        self.fat.divergences()
    }

    pub fn info(&self) -> VolumeProperties {
        let boot = &self.boot;
        VolumeProperties {
            label: boot.label(),
            serial: format_volume_serial(boot.volume_id),
            media_descriptor: boot.media_descriptor,
            formatter_name: boot.formatter_name.clone(),
            bytes_per_sector: boot.bytes_per_sector,
            sectors_per_cluster: boot.sectors_per_cluster,
            total_sectors: boot.total_sectors,
            hidden_sectors: boot.hidden_sectors,
            reserved_sectors: boot.reserved_sectors,
            num_fats: boot.num_fats,
            sectors_per_fat: boot.sectors_per_fat,
            backup_boot_sector: boot.backup_boot_sector,
            root_cluster: boot.root_cluster,
            num_clusters: boot.num_clusters(),
            free_clusters: self.fat.free_count(),
            fat_divergences: self.fat.divergences().to_vec(),
        }
    }

    // ---- raw access ----

    pub fn read_sector(&mut self, index: u64) -> Result<Vec<u8>, VolumeError> {
        let mut buf = vec![0u8; self.device.sector_size()];
        self.device.read_sector(index, &mut buf)?;
        Ok(buf)
    }

    pub fn read_cluster(&mut self, cluster: u32) -> Result<Vec<u8>, VolumeError> {
        self.read_clusters(&[cluster])
    }

    pub fn cluster_to_sector(&self, cluster: u32) -> Result<u64, VolumeError> {
        self.check_cluster(cluster)?;
        Ok(self.boot.cluster_to_sector(cluster))
    }

    pub fn sector_to_cluster(&self, sector: u64) -> Option<(u32, u32)> {
        self.boot.sector_to_cluster(sector)
    }

    fn check_cluster(&self, cluster: u32) -> Result<(), VolumeError> {
        if self.fat.in_range(cluster) {
            Ok(())
        } else {
            Err(VolumeError::chain(
                cluster,
                format!("cluster out of range 2..={}", self.fat.max_cluster()),
            ))
        }
    }

    /// Contiguous runs in `clusters` as (position, length)
    fn runs(clusters: &[u32]) -> Vec<(usize, usize)> {
        let mut runs = Vec::new();
        let mut i = 0;
        while i < clusters.len() {
            let mut len = 1;
            while i + len < clusters.len() && clusters[i + len] == clusters[i] + len as u32 {
                len += 1;
            }
            runs.push((i, len));
            i += len;
        }
        runs
    }

    pub(crate) fn read_clusters(&mut self, clusters: &[u32]) -> Result<Vec<u8>, VolumeError> {
        let cluster_size = self.boot.cluster_size();
        let mut data = vec![0u8; clusters.len() * cluster_size];
        for (at, len) in Self::runs(clusters) {
            self.check_cluster(clusters[at])?;
            self.check_cluster(clusters[at + len - 1])?;
            let sector = self.boot.cluster_to_sector(clusters[at]);
            trace!("Reading clusters {}..{} at sector {}", clusters[at], clusters[at] + len as u32, sector);
            self.device
                .read_sectors(sector, &mut data[at * cluster_size..(at + len) * cluster_size])?;
        }
        Ok(data)
    }

    /// Write `data` over `clusters`, zero-padding the last one
    pub(crate) fn write_clusters(&mut self, clusters: &[u32], data: &[u8]) -> Result<(), VolumeError> {
        let cluster_size = self.boot.cluster_size();
        let mut buf = data.to_vec();
        buf.resize(clusters.len() * cluster_size, 0);
        for (at, len) in Self::runs(clusters) {
            self.check_cluster(clusters[at])?;
            self.check_cluster(clusters[at + len - 1])?;
            let sector = self.boot.cluster_to_sector(clusters[at]);
            trace!("Writing clusters {}..{} at sector {}", clusters[at], clusters[at] + len as u32, sector);
            self.device
                .write_sectors(sector, &buf[at * cluster_size..(at + len) * cluster_size])?;
        }
        Ok(())
    }

    // ---- directory plumbing ----

    pub(crate) fn load_table(&mut self, first_cluster: u32) -> Result<DirTable, VolumeError> {
        let clusters = self.fat.chain(first_cluster)?;
        let data = self.read_clusters(&clusters)?;
        Ok(DirTable { clusters, data })
    }

    pub(crate) fn write_table(&mut self, table: &DirTable) -> Result<(), VolumeError> {
        self.write_clusters(&table.clusters, &table.data)?;
        self.device.flush()
    }

    pub(crate) fn dir_table(&mut self, dir: NodeId) -> Result<DirTable, VolumeError> {
        let first_cluster = self.tree.node(dir)?.first_cluster;
        self.load_table(first_cluster)
    }

    pub(crate) fn ensure_loaded(&mut self, id: NodeId) -> Result<(), VolumeError> {
        let node = self.tree.node(id)?;
        if node.loaded {
            return Ok(());
        }
        if !node.is_directory() {
            return Err(VolumeError::InvalidInput(format!(
                "{} is not a directory",
                self.tree.path_of(id)
            )));
        }
        let path = self.tree.path_of(id);
        let table = self.dir_table(id)?;
        let entries = parse_table(&table.data, &path, self.options.fix_dates)?;
        debug!("Read directory {} ({} entries)", path, entries.len());
        self.tree.set_entries(id, entries);
        Ok(())
    }

    /// Node for `path`; components match long or short names case-insensitively
    pub(crate) fn resolve(&mut self, path: &str) -> Result<NodeId, VolumeError> {
        let mut id = DirectoryTree::ROOT;
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            if part == ".." {
                id = self.tree.node(id)?.parent.unwrap_or(DirectoryTree::ROOT);
                continue;
            }
            self.ensure_loaded(id)?;
            id = self
                .tree
                .find_child(id, part)
                .ok_or_else(|| VolumeError::NotFound(path.to_string()))?;
        }
        Ok(id)
    }

    pub(crate) fn resolve_dir(&mut self, path: &str) -> Result<NodeId, VolumeError> {
        let id = self.resolve(path)?;
        self.ensure_loaded(id)?;
        Ok(id)
    }

    fn entry_of(&self, id: NodeId) -> Result<DirEntry, VolumeError> {
        self.tree
            .node(id)?
            .entry
            .clone()
            .ok_or_else(|| VolumeError::InvalidInput("the root directory has no entry".to_string()))
    }

    fn parent_of(&self, id: NodeId) -> Result<NodeId, VolumeError> {
        self.tree
            .node(id)?
            .parent
            .ok_or_else(|| VolumeError::InvalidInput("the root directory has no parent".to_string()))
    }

    fn entry_at(&mut self, dir: NodeId, index: usize) -> Result<DirEntry, VolumeError> {
        self.ensure_loaded(dir)?;
        self.tree
            .node(dir)?
            .entries
            .iter()
            .find(|e| e.index == index)
            .cloned()
            .ok_or_else(|| VolumeError::NotFound(format!("{} record {}", self.tree.path_of(dir), index)))
    }

    fn check_absent(&mut self, dir: NodeId, name: &str) -> Result<(), VolumeError> {
        self.ensure_loaded(dir)?;
        let taken = self
            .tree
            .node(dir)?
            .entries
            .iter()
            .any(|e| e.kind != EntryKind::VolumeLabel && e.matches(name));
        if taken {
            return Err(VolumeError::AlreadyExists(join_path(&self.tree.path_of(dir), name)));
        }
        Ok(())
    }

    /// Cluster number stored in ".." records pointing at `dir`
    fn dotdot_cluster(&self, dir: NodeId) -> Result<u32, VolumeError> {
        if dir == DirectoryTree::ROOT {
            Ok(0)
        } else {
            Ok(self.tree.node(dir)?.first_cluster)
        }
    }

    /// Write `records` into `table` (already edited by the caller), growing the directory as needed
    pub(crate) fn store_records(
        &mut self,
        dir: NodeId,
        mut table: DirTable,
        records: &[[u8; 32]],
    ) -> Result<usize, VolumeError> {
        let cluster_size = self.boot.cluster_size();
        let index = match table.insert(records) {
            Some(index) => index,
            None => {
                let missing = records.len() - table.trailing_free().min(records.len());
                let count = (missing * DIR_ENTRY_SIZE + cluster_size - 1) / cluster_size;
                if table.data.len() + count * cluster_size > MAX_DIRECTORY_BYTES {
                    return Err(VolumeError::Capacity(format!(
                        "directory {} is full",
                        self.tree.path_of(dir)
                    )));
                }
                let added = self.fat.allocate_chain(count as u32)?;
                if let Some(&last) = table.clusters.last() {
                    self.fat.write(last, FatEntry::Allocated(added[0]))?;
                }
                for &cluster in &added {
                    table.extend(cluster, cluster_size);
                }
                debug!("Extended directory {} by {} clusters", self.tree.path_of(dir), count);
                table.insert(records).ok_or_else(|| {
                    VolumeError::Capacity(format!("no room in directory {}", self.tree.path_of(dir)))
                })?
            }
        };
        self.write_table(&table)?;
        self.fat.flush(&mut self.device)?;
        self.tree.invalidate(dir);
        Ok(index)
    }

    fn add_entry(
        &mut self,
        dir: NodeId,
        name: &str,
        attributes: u8,
        first_cluster: u32,
        size: u32,
    ) -> Result<DirEntry, VolumeError> {
        self.ensure_loaded(dir)?;
        let existing = self.tree.node(dir)?.entries.clone();
        let template = build_short_record(&[b' '; 11], 0, attributes, first_cluster, size, &current_fat_datetime());
        let records = name_records(name, &existing, &template);
        let table = self.dir_table(dir)?;
        let index = self.store_records(dir, table, &records)?;
        self.entry_at(dir, index)
    }

    /// Undo an allocation whose directory record could not be written
    fn release_clusters(&mut self, clusters: &[u32]) {
        for &cluster in clusters {
            if let Err(e) = self.fat.write(cluster, FatEntry::Free) {
                warn!("Could not release cluster {}: {}", cluster, e);
            }
        }
        if let Err(e) = self.fat.flush(&mut self.device) {
            warn!("Could not release {} clusters: {}", clusters.len(), e);
        }
    }

    // ---- public directory operations ----

    /// Every live entry of the directory at `path`, in table order
    pub fn list_directory(&mut self, path: &str) -> Result<Vec<DirEntry>, VolumeError> {
        let dir = self.resolve_dir(path)?;
        Ok(self.tree.node(dir)?.entries.clone())
    }

    /// Entry for `path` (not the root)
    pub fn stat(&mut self, path: &str) -> Result<DirEntry, VolumeError> {
        let id = self.resolve(path)?;
        self.entry_of(id)
    }

    pub fn create_file(&mut self, path: &str, contents: &[u8]) -> Result<DirEntry, VolumeError> {
        let (parent, name) = split_path(path)?;
        validate_name(&name)?;
        let size = u32::try_from(contents.len())
            .map_err(|_| VolumeError::InvalidInput("files are limited to 4 GiB".to_string()))?;
        let dir = self.resolve_dir(&parent)?;
        self.check_absent(dir, &name)?;

        let cluster_size = self.boot.cluster_size();
        let count = (contents.len() + cluster_size - 1) / cluster_size;
        let clusters = if count > 0 {
            self.fat.allocate_chain(count as u32)?
        } else {
            Vec::new()
        };
        let first_cluster = clusters.first().copied().unwrap_or(0);

        let result = self
            .write_clusters(&clusters, contents)
            .and_then(|_| self.fat.flush(&mut self.device))
            .and_then(|_| self.add_entry(dir, &name, ATTR_ARCHIVE, first_cluster, size));
        match result {
            Ok(entry) => {
                debug!("Created {} ({} bytes, {} clusters)", path, size, count);
                Ok(entry)
            }
            Err(e) => {
                self.release_clusters(&clusters);
                Err(e)
            }
        }
    }

    pub fn create_directory(&mut self, path: &str) -> Result<DirEntry, VolumeError> {
        let (parent, name) = split_path(path)?;
        validate_name(&name)?;
        let dir = self.resolve_dir(&parent)?;
        self.check_absent(dir, &name)?;

        let parent_cluster = self.dotdot_cluster(dir)?;
        let clusters = self.fat.allocate_chain(1)?;
        let cluster = clusters[0];
        let now = current_fat_datetime();
        let mut data = vec![0u8; self.boot.cluster_size()];
        data[..DIR_ENTRY_SIZE].copy_from_slice(&build_short_record(b".          ", 0, ATTR_DIRECTORY, cluster, 0, &now));
        data[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]
            .copy_from_slice(&build_short_record(b"..         ", 0, ATTR_DIRECTORY, parent_cluster, 0, &now));

        let result = self
            .write_clusters(&clusters, &data)
            .and_then(|_| self.fat.flush(&mut self.device))
            .and_then(|_| self.add_entry(dir, &name, ATTR_DIRECTORY, cluster, 0));
        match result {
            Ok(entry) => {
                debug!("Created directory {} at cluster {}", path, cluster);
                Ok(entry)
            }
            Err(e) => {
                self.release_clusters(&clusters);
                Err(e)
            }
        }
    }

    /// Contents of a file, truncated to its recorded size
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, VolumeError> {
        let entry = self.stat(path)?;
        if !entry.is_file() {
            return Err(VolumeError::InvalidInput(format!("{} is not a file", path)));
        }
        if entry.first_cluster == 0 {
            return Ok(Vec::new());
        }
        let clusters = self.fat.chain(entry.first_cluster)?;
        let mut data = self.read_clusters(&clusters)?;
        if data.len() < entry.size as usize {
            warn!(
                "{}: chain holds {} bytes but the entry records {}",
                path,
                data.len(),
                entry.size
            );
        }
        data.truncate(entry.size as usize);
        Ok(data)
    }

    /// Remove a file or an empty directory
    pub fn delete(&mut self, path: &str) -> Result<(), VolumeError> {
        let id = self.resolve(path)?;
        let entry = self.entry_of(id)?;
        if entry.is_directory() {
            self.ensure_loaded(id)?;
            let empty = self
                .tree
                .node(id)?
                .entries
                .iter()
                .all(|e| e.kind == EntryKind::SpecialDirectory);
            if !empty {
                return Err(VolumeError::InvalidInput(format!("directory {} is not empty", path)));
            }
        }
        let parent = self.parent_of(id)?;
        let mut table = self.dir_table(parent)?;
        table.mark_deleted(entry.index, entry.slot_count);
        self.write_table(&table)?;
        self.tree.invalidate(parent);

        if entry.first_cluster != 0 {
            match self.fat.free_chain(entry.first_cluster) {
                Ok(freed) => debug!("Deleted {} ({} clusters freed)", path, freed),
                Err(e) => warn!("Deleted {} but left its clusters allocated: {}", path, e),
            }
            self.fat.flush(&mut self.device)?;
        }
        Ok(())
    }

    pub fn rename(&mut self, path: &str, new_name: &str) -> Result<DirEntry, VolumeError> {
        validate_name(new_name)?;
        let id = self.resolve(path)?;
        let entry = self.entry_of(id)?;
        let parent = self.parent_of(id)?;
        if let Some(other) = self.tree.find_child(parent, new_name) {
            if other != id {
                return Err(VolumeError::AlreadyExists(join_path(&self.tree.path_of(parent), new_name)));
            }
        }

        let siblings: Vec<DirEntry> = self
            .tree
            .node(parent)?
            .entries
            .iter()
            .filter(|e| e.index != entry.index)
            .cloned()
            .collect();
        let mut table = self.dir_table(parent)?;
        let mut template = [0u8; 32];
        template.copy_from_slice(table.slot(entry.short_slot()));
        let records = name_records(new_name, &siblings, &template);
        table.mark_deleted(entry.index, entry.slot_count);
        let index = self.store_records(parent, table, &records)?;
        debug!("Renamed {} to {}", path, new_name);
        self.entry_at(parent, index)
    }

    /// Move a file or directory into `dest_dir`, keeping its name
    pub fn move_entry(&mut self, path: &str, dest_dir: &str) -> Result<DirEntry, VolumeError> {
        let id = self.resolve(path)?;
        let entry = self.entry_of(id)?;
        let source = self.parent_of(id)?;
        let dest = self.resolve_dir(dest_dir)?;
        if dest == source {
            return Ok(entry);
        }
        if entry.is_directory() && self.tree.is_ancestor(id, dest) {
            return Err(VolumeError::InvalidInput(format!(
                "cannot move {} into itself or one of its subdirectories",
                path
            )));
        }
        self.check_absent(dest, &entry.name)?;

        let source_path = self.tree.path_of(source);
        let dest_path = self.tree.path_of(dest);
        let dotdot = self.dotdot_cluster(dest)?;
        let mut source_table = self.dir_table(source)?;
        let mut template = [0u8; 32];
        template.copy_from_slice(source_table.slot(entry.short_slot()));
        let existing = self.tree.node(dest)?.entries.clone();
        let records = name_records(&entry.name, &existing, &template);

        // New record first, so an interrupted move leaves two names rather than none
        let dest_table = self.dir_table(dest)?;
        let index = self.store_records(dest, dest_table, &records)?;

        source_table.mark_deleted(entry.index, entry.slot_count);
        self.write_table(&source_table)?;
        let source = self.resolve(&source_path)?;
        self.tree.invalidate(source);

        if entry.is_directory() {
            let mut table = self.load_table(entry.first_cluster)?;
            let slot = (0..table.slot_count().min(2)).find(|&i| &table.slot(i)[..11] == b"..         ");
            if let Some(slot) = slot {
                set_record_first_cluster(table.slot_mut(slot), dotdot);
                self.write_table(&table)?;
            }
        }

        debug!("Moved {} to {}", path, dest_path);
        let dest = self.resolve_dir(&dest_path)?;
        self.entry_at(dest, index)
    }

    pub fn set_timestamp(&mut self, path: &str, modified: NaiveDateTime) -> Result<DirEntry, VolumeError> {
        let id = self.resolve(path)?;
        let entry = self.entry_of(id)?;
        let parent = self.parent_of(id)?;
        let mut table = self.dir_table(parent)?;
        set_record_modified(table.slot_mut(entry.short_slot()), &modified);
        self.write_table(&table)?;
        self.tree.invalidate(parent);
        self.entry_at(parent, entry.index)
    }

    /// Set the volume label in the boot sector, its backup and the root label entry.
    /// An empty label removes the root entry and writes "NO NAME" to the boot sectors.
    pub fn set_label(&mut self, text: &str, timestamp: Option<NaiveDateTime>) -> Result<(), VolumeError> {
        let text = text.trim();
        let label = if text.is_empty() {
            *NO_NAME_LABEL
        } else {
            format_volume_label(text)?
        };
        let timestamp = timestamp.unwrap_or_else(current_fat_datetime);

        let mut sectors = vec![0u64];
        if self.boot.backup_boot_sector != 0 {
            sectors.push(self.boot.backup_boot_sector as u64);
        }
        for index in sectors {
            let mut sector = self.read_sector(index)?;
            sector[BS32_VOL_LAB..BS32_VOL_LAB + VOLUME_LABEL_LEN].copy_from_slice(&label);
            self.device.write_sector(index, &sector)?;
        }
        self.boot.volume_label = label;

        let root = DirectoryTree::ROOT;
        self.ensure_loaded(root)?;
        let current = self
            .tree
            .node(root)?
            .entries
            .iter()
            .find(|e| e.kind == EntryKind::VolumeLabel)
            .cloned();
        let mut table = self.dir_table(root)?;
        match current {
            Some(entry) if text.is_empty() => {
                table.mark_deleted(entry.index, entry.slot_count);
                self.write_table(&table)?;
                self.tree.invalidate(root);
            }
            Some(entry) => {
                let record = table.slot_mut(entry.short_slot());
                record[DIR_NAME..DIR_NAME + VOLUME_LABEL_LEN].copy_from_slice(&label);
                set_record_modified(record, &timestamp);
                self.write_table(&table)?;
                self.tree.invalidate(root);
            }
            None if !text.is_empty() => {
                let record = build_short_record(&label, 0, ATTR_VOLUME_ID, 0, 0, &timestamp);
                self.store_records(root, table, &[record])?;
            }
            None => {}
        }
        self.device.flush()?;
        info!("Volume label set to \"{}\"", parse_volume_label(&label));
        Ok(())
    }

    /// Deleted records still present in the directory at `path`
    pub fn find_deleted_entries(&mut self, path: &str) -> Result<Vec<DirEntry>, VolumeError> {
        let dir = self.resolve_dir(path)?;
        let table = self.dir_table(dir)?;
        Ok(parse_deleted(&table.data, self.options.fix_dates))
    }

    /// Files and directories below `path` in traversal order: a directory's
    /// own entries (table order) before those of its subdirectories
    pub(crate) fn collect_entries(
        &mut self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<(String, DirEntry)>, VolumeError> {
        let mut out = Vec::new();
        let mut pending = vec![path.to_string()];
        while let Some(dir_path) = pending.pop() {
            let dir = self.resolve_dir(&dir_path)?;
            let entries = self.tree.node(dir)?.entries.clone();
            let mut subdirs = Vec::new();
            for entry in entries {
                if !matches!(entry.kind, EntryKind::File | EntryKind::Directory) {
                    continue;
                }
                let entry_path = join_path(&dir_path, &entry.name);
                if recursive && entry.is_directory() {
                    subdirs.push(entry_path.clone());
                }
                out.push((entry_path, entry));
            }
            pending.extend(subdirs.into_iter().rev());
        }
        Ok(out)
    }

    /// Write pending FAT sectors and flush the device
    pub fn flush(&mut self) -> Result<(), VolumeError> {
        self.fat.flush(&mut self.device)?;
        self.device.flush()
    }

    fn update_fsinfo(&mut self) -> Result<(), VolumeError> {
        let info = FsInfo {
            free_count: self.fat.free_count(),
            next_free: self.fat.first_free().unwrap_or(FSINFO_UNKNOWN),
        };
        let fs_info = self.boot.fs_info_sector as u64;
        if fs_info == 0 || fs_info == 0xFFFF {
            return Ok(());
        }
        let mut sectors = vec![fs_info];
        if self.boot.backup_boot_sector != 0 {
            sectors.push(self.boot.backup_boot_sector as u64 + fs_info);
        }
        for index in sectors {
            let mut sector = self.read_sector(index)?;
            if FsInfo::parse(&sector).is_none() {
                debug!("Sector {} carries no FSInfo signatures; left alone", index);
                continue;
            }
            info.write_into(&mut sector);
            self.device.write_sector(index, &sector)?;
        }
        Ok(())
    }

    /// Flush everything and give the device back
    pub fn unmount(mut self) -> Result<D, VolumeError> {
        let modified = self.fat.is_modified();
        self.fat.flush(&mut self.device)?;
        if modified {
            self.update_fsinfo()?;
        }
        self.device.flush()?;
        info!("Unmounted FAT32 volume \"{}\"", self.boot.label());
        Ok(self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{formatted_volume, pattern};
    use chrono::NaiveDate;

    #[test]
    fn fresh_volume_holds_only_the_label() {
        let mut volume = formatted_volume();
        let root = volume.list_directory("/").unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].kind, EntryKind::VolumeLabel);
        assert_eq!(root[0].name, "TESTVOL");

        let info = volume.info();
        assert_eq!(info.label, "TESTVOL");
        assert_eq!(info.serial, "1234-5678");
        assert_eq!(info.free_clusters, info.num_clusters - 1);
        assert!(info.fat_divergences.is_empty());
    }

    #[test]
    fn unlabelled_volume_has_an_empty_root() {
        let mut volume = crate::test_helpers::formatted_volume_with(Some(1), None);
        assert!(volume.list_directory("/").unwrap().is_empty());
        assert_eq!(volume.info().label, "NO NAME");
        assert_eq!(volume.boot_sector().cluster_size(), 512);
    }

    #[test]
    fn release_keeps_going_past_a_bad_cluster() {
        let mut volume = formatted_volume();
        let free = volume.fat().free_count();
        let mut clusters = volume.fat.allocate_chain(2).unwrap();
        clusters.insert(1, volume.fat().max_cluster() + 1);

        volume.release_clusters(&clusters);
        assert_eq!(volume.fat().free_count(), free);
        assert!(volume.fat().is_free(clusters[2]));
    }

    #[test]
    fn files_round_trip() {
        let mut volume = formatted_volume();
        let data = pattern(10_000, 7);
        let entry = volume.create_file("/Hello World.txt", &data).unwrap();
        assert_eq!(entry.name, "Hello World.txt");
        assert_eq!(entry.short_name, "HELLOW~1.TXT");
        assert_eq!(entry.size, 10_000);
        assert_eq!(volume.fat().cluster_count(entry.first_cluster).unwrap(), 3);
        assert_eq!(volume.read_file("/hello world.TXT").unwrap(), data);
        assert_eq!(volume.read_file("/HELLOW~1.TXT").unwrap(), data);
        assert!(matches!(
            volume.create_file("/HELLO WORLD.TXT", b"x"),
            Err(VolumeError::AlreadyExists(_))
        ));

        let empty = volume.create_file("/empty.bin", &[]).unwrap();
        assert_eq!(empty.first_cluster, 0);
        assert!(volume.read_file("/empty.bin").unwrap().is_empty());
    }

    #[test]
    fn directories_nest() {
        let mut volume = formatted_volume();
        let docs = volume.create_directory("/docs").unwrap();
        let sub = volume.create_directory("/docs/sub").unwrap();
        volume.create_file("/docs/sub/a.txt", b"alpha").unwrap();

        let listing = volume.list_directory("/docs").unwrap();
        assert_eq!(listing[0].name, ".");
        assert_eq!(listing[0].first_cluster, docs.first_cluster);
        assert_eq!(listing[1].name, "..");
        assert_eq!(listing[1].first_cluster, 0);
        assert_eq!(listing[2].name, "sub");

        let inner = volume.list_directory("/docs/sub").unwrap();
        assert_eq!(inner[1].first_cluster, docs.first_cluster);
        assert_eq!(inner[0].first_cluster, sub.first_cluster);
        assert_eq!(volume.read_file("/DOCS/SUB/A.TXT").unwrap(), b"alpha");
        assert!(matches!(volume.list_directory("/docs/sub/a.txt"), Err(VolumeError::InvalidInput(_))));
        assert!(matches!(volume.read_file("/nope/a.txt"), Err(VolumeError::NotFound(_))));
    }

    #[test]
    fn directory_grows_when_full() {
        let mut volume = formatted_volume();
        for i in 0..130 {
            volume.create_file(&format!("/F{}.TXT", i), &[]).unwrap();
        }
        let root_cluster = volume.boot_sector().root_cluster;
        assert_eq!(volume.fat().cluster_count(root_cluster).unwrap(), 2);
        assert_eq!(volume.list_directory("/").unwrap().len(), 131);
        assert!(volume.stat("/F129.TXT").is_ok());
    }

    #[test]
    fn delete_frees_clusters() {
        let mut volume = formatted_volume();
        let free = volume.fat().free_count();
        volume.create_directory("/dir").unwrap();
        volume.create_file("/dir/big.bin", &pattern(20_000, 1)).unwrap();
        assert!(matches!(volume.delete("/dir"), Err(VolumeError::InvalidInput(_))));

        volume.delete("/dir/big.bin").unwrap();
        volume.delete("/dir").unwrap();
        assert_eq!(volume.fat().free_count(), free);
        assert!(matches!(volume.stat("/dir"), Err(VolumeError::NotFound(_))));
    }

    #[test]
    fn rename_and_move() {
        let mut volume = formatted_volume();
        volume.create_directory("/a").unwrap();
        volume.create_directory("/b").unwrap();
        volume.create_file("/a/notes.txt", b"text").unwrap();

        let renamed = volume.rename("/a/notes.txt", "Meeting notes.txt").unwrap();
        assert_eq!(renamed.name, "Meeting notes.txt");
        assert_eq!(volume.read_file("/a/meeting notes.txt").unwrap(), b"text");
        assert!(volume.stat("/a/notes.txt").is_err());

        volume.move_entry("/a/Meeting notes.txt", "/b").unwrap();
        assert_eq!(volume.read_file("/b/Meeting notes.txt").unwrap(), b"text");
        assert!(volume.stat("/a/Meeting notes.txt").is_err());

        let b = volume.stat("/b").unwrap();
        volume.move_entry("/a", "/b").unwrap();
        let moved = volume.list_directory("/b/a").unwrap();
        assert_eq!(moved[1].name, "..");
        assert_eq!(moved[1].first_cluster, b.first_cluster);
    }

    #[test]
    fn moving_into_own_subdirectory_is_rejected() {
        let mut volume = formatted_volume();
        volume.create_directory("/top").unwrap();
        volume.create_directory("/top/inner").unwrap();
        assert!(matches!(volume.move_entry("/top", "/top/inner"), Err(VolumeError::InvalidInput(_))));
        assert!(matches!(volume.move_entry("/top", "/top"), Err(VolumeError::InvalidInput(_))));
    }

    #[test]
    fn label_updates_boot_sectors_and_root() {
        let mut volume = formatted_volume();
        volume.set_label("new name", None).unwrap();
        assert_eq!(volume.info().label, "NEW NAME");
        let backup = volume.boot_sector().backup_boot_sector as u64;
        let sector = volume.read_sector(backup).unwrap();
        assert_eq!(&sector[BS32_VOL_LAB..BS32_VOL_LAB + 11], b"NEW NAME   ");
        let root = volume.list_directory("/").unwrap();
        assert_eq!(root[0].name, "NEW NAME");

        volume.set_label("", None).unwrap();
        assert_eq!(volume.info().label, "NO NAME");
        assert!(volume.list_directory("/").unwrap().is_empty());

        volume.set_label("again", None).unwrap();
        assert_eq!(volume.list_directory("/").unwrap()[0].kind, EntryKind::VolumeLabel);
        assert!(volume.set_label("a.b", None).is_err());
    }

    #[test]
    fn timestamps_can_be_set() {
        let mut volume = formatted_volume();
        volume.create_file("/t.txt", b"t").unwrap();
        let when = NaiveDate::from_ymd_opt(2001, 9, 9).unwrap().and_hms_opt(1, 46, 40).unwrap();
        let entry = volume.set_timestamp("/t.txt", when).unwrap();
        assert_eq!(entry.modified, Some(when));
        assert_eq!(volume.stat("/t.txt").unwrap().modified, Some(when));
    }

    #[test]
    fn deleted_entries_listed_until_erased() {
        let mut volume = formatted_volume();
        volume.create_file("/KEEP.TXT", b"k").unwrap();
        volume.create_file("/REPORT.DOC", b"r").unwrap();
        volume.delete("/REPORT.DOC").unwrap();

        let deleted = volume.find_deleted_entries("/").unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name, "?EPORT.DOC");

        assert_eq!(volume.erase_deleted_entries("/", false).unwrap(), 1);
        assert!(volume.find_deleted_entries("/").unwrap().is_empty());
        assert_eq!(volume.read_file("/KEEP.TXT").unwrap(), b"k");
    }

    #[test]
    fn unmount_records_free_space() {
        let mut volume = formatted_volume();
        volume.create_file("/data.bin", &pattern(9000, 3)).unwrap();
        let free = volume.fat().free_count();
        let device = volume.unmount().unwrap();

        let fsinfo = FsInfo::parse(&device.as_bytes()[512..1024]).unwrap();
        assert_eq!(fsinfo.free_count, free);
        let backup = FsInfo::parse(&device.as_bytes()[7 * 512..8 * 512]).unwrap();
        assert_eq!(backup, fsinfo);

        let mut volume = Volume::mount(device).unwrap();
        assert_eq!(volume.read_file("/data.bin").unwrap(), pattern(9000, 3));
    }

    #[test]
    fn sector_and_cluster_mapping() {
        let volume = formatted_volume();
        let first = volume.cluster_to_sector(2).unwrap();
        assert_eq!(volume.sector_to_cluster(first + 9), Some((3, 1)));
        assert_eq!(volume.sector_to_cluster(0), None);
        assert!(volume.cluster_to_sector(1).is_err());
    }
}

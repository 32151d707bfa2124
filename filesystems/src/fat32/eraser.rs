// Erasing unused space: free clusters volume-wide or those left behind by a subtree's
// deleted entries, and compaction of deleted directory records

use super::volume::Volume;
use crate::fat_common::{DIR_DELETED_MARKER, DIR_NAME, FAT32_MIN_CLUSTER};
use fat32mgr_core::{BlockDevice, CancelToken, ProgressCallback, ProgressReporter, VolumeError};
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Clusters written per batch; cancellation is checked between batches
const ERASE_BATCH_CLUSTERS: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EraseScope {
    /// Every free cluster of the volume
    Volume,
    /// Free clusters still referenced by deleted records in the directory
    /// tables under `path`
    Directory { path: String, recursive: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EraseReport {
    pub clusters_erased: u64,
    pub cancelled: bool,
}

impl<D: BlockDevice> Volume<D> {
    /// Overwrite free clusters in `scope` with `filler`. Allocated clusters
    /// are never written.
    pub fn erase_unused(
        &mut self,
        scope: &EraseScope,
        filler: u8,
        cancel: &CancelToken,
        progress: Arc<dyn ProgressCallback>,
    ) -> Result<EraseReport, VolumeError> {
        let free: Vec<u32> = match scope {
            EraseScope::Volume => (FAT32_MIN_CLUSTER..=self.fat.max_cluster())
                .filter(|&c| self.fat.is_free(c))
                .collect(),
            EraseScope::Directory { path, recursive } => self.deleted_entry_clusters(path, *recursive)?,
        };
        self.fill_clusters(&free, filler, cancel, progress)
    }

    /// Compact the directory at `path` (and its descendants when `recursive`),
    /// dropping deleted records. Returns the number of records removed.
    pub fn erase_deleted_entries(&mut self, path: &str, recursive: bool) -> Result<usize, VolumeError> {
        let mut erased = 0;
        for dir_path in self.subtree_directories(path, recursive)? {
            let dir = self.resolve_dir(&dir_path)?;
            let entries = self.tree.node(dir)?.entries.clone();
            let mut table = self.dir_table(dir)?;
            let end = table.end_index();
            let deleted = (0..end).filter(|&i| table.slot(i)[DIR_NAME] == DIR_DELETED_MARKER).count();
            if deleted > 0 {
                table.rewrite(&entries);
                self.write_table(&table)?;
                self.tree.invalidate(dir);
                debug!("Removed {} deleted records from {}", deleted, dir_path);
                erased += deleted;
            }
        }
        Ok(erased)
    }

    /// `path` followed by its descendant directories when `recursive`
    fn subtree_directories(&mut self, path: &str, recursive: bool) -> Result<Vec<String>, VolumeError> {
        let mut dirs = vec![path.to_string()];
        dirs.extend(
            self.collect_entries(path, recursive)?
                .into_iter()
                .filter(|(_, e)| recursive && e.is_directory())
                .map(|(p, _)| p),
        );
        Ok(dirs)
    }

    /// Clusters a deleted record under `path` still points at and that are
    /// free. A record's clusters are taken as the contiguous run from its
    /// first cluster, cut short at the first cluster in use again.
    fn deleted_entry_clusters(&mut self, path: &str, recursive: bool) -> Result<Vec<u32>, VolumeError> {
        let cluster_size = self.boot.cluster_size() as u64;
        let max = self.fat.max_cluster();
        let mut clusters = BTreeSet::new();
        for dir_path in self.subtree_directories(path, recursive)? {
            for entry in self.find_deleted_entries(&dir_path)? {
                if !(entry.is_file() || entry.is_directory()) || entry.first_cluster < FAT32_MIN_CLUSTER {
                    continue;
                }
                let count = ((entry.size as u64 + cluster_size - 1) / cluster_size).max(1) as u32;
                let run = (entry.first_cluster..entry.first_cluster.saturating_add(count))
                    .take_while(|&c| c <= max && self.fat.is_free(c));
                clusters.extend(run);
                debug!("{}: deleted {} leaves clusters from {}", dir_path, entry.name, entry.first_cluster);
            }
        }
        Ok(clusters.into_iter().collect())
    }

    fn fill_clusters(
        &mut self,
        free: &[u32],
        filler: u8,
        cancel: &CancelToken,
        progress: Arc<dyn ProgressCallback>,
    ) -> Result<EraseReport, VolumeError> {
        let mut reporter = ProgressReporter::new("erase", free.len() as u64, progress);
        let cluster_size = self.boot.cluster_size();
        let pattern = vec![filler; cluster_size * ERASE_BATCH_CLUSTERS as usize];
        let mut report = EraseReport::default();

        for batch in free.chunks(ERASE_BATCH_CLUSTERS as usize) {
            if cancel.is_cancelled() {
                info!("Erase cancelled after {} clusters", report.clusters_erased);
                report.cancelled = true;
                break;
            }
            // The list is sorted, so each batch splits into few contiguous writes
            let mut at = 0;
            while at < batch.len() {
                let mut len = 1;
                while at + len < batch.len() && batch[at + len] == batch[at] + len as u32 {
                    len += 1;
                }
                self.write_clusters(&batch[at..at + len], &pattern[..len * cluster_size])?;
                at += len;
            }
            self.device.flush()?;
            report.clusters_erased += batch.len() as u64;
            reporter.report(format!("cluster {}", batch[batch.len() - 1]), report.clusters_erased);
        }

        reporter.complete();
        info!("Erased {} free clusters with 0x{:02X}", report.clusters_erased, filler);
        Ok(report)
    }
}

// Integrity scan: every chain reachable from the directory tree, checked against the FAT
// Best-effort; a fault ends the walk of that chain but not the scan

use super::directory::{join_path, parse_table, EntryKind};
use super::fat_table::{ClusterFault, FatDivergence};
use super::volume::Volume;
use fat32mgr_core::{BlockDevice, CancelToken, ProgressCallback, ProgressReporter, VolumeError};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One directory-entry/FAT mismatch
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct InvalidCluster {
    pub pathname: String,
    /// FAT slot holding `value`; `None` when `value` is the entry's start cluster
    pub fat_index: Option<u32>,
    pub value: u32,
    pub fault: ClusterFault,
}

/// File whose chain length does not match its recorded size
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LengthMismatch {
    pub pathname: String,
    pub size: u32,
    pub expected_clusters: u32,
    pub actual_clusters: u32,
}

/// Directory whose table could not be read or parsed; its subtree is not scanned
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadableDirectory {
    pub pathname: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub invalid_clusters: Vec<InvalidCluster>,
    pub clusters_checked: u64,
    pub fat_divergences: Vec<FatDivergence>,
    pub length_mismatches: Vec<LengthMismatch>,
    pub unreadable_directories: Vec<UnreadableDirectory>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.invalid_clusters.is_empty()
            && self.fat_divergences.is_empty()
            && self.length_mismatches.is_empty()
            && self.unreadable_directories.is_empty()
    }
}

struct ScanState {
    owners: HashMap<u32, String>,
    report: ScanReport,
}

impl ScanState {
    /// Walk one chain, claiming its clusters. Returns the clusters walked and
    /// whether the chain ended cleanly.
    fn claim_chain<D: BlockDevice>(&mut self, volume: &Volume<D>, pathname: &str, start: u32) -> (Vec<u32>, bool) {
        let mut clusters = Vec::new();
        let mut previous = None;
        for step in volume.fat.walk(start) {
            match step {
                Ok(cluster) => {
                    if let Some(owner) = self.owners.get(&cluster) {
                        debug!("{}: cluster {} already belongs to {}", pathname, cluster, owner);
                        self.report.invalid_clusters.push(InvalidCluster {
                            pathname: pathname.to_string(),
                            fat_index: previous,
                            value: cluster,
                            fault: ClusterFault::CrossLink,
                        });
                        return (clusters, false);
                    }
                    self.owners.insert(cluster, pathname.to_string());
                    self.report.clusters_checked += 1;
                    clusters.push(cluster);
                    previous = Some(cluster);
                }
                Err(fault) => {
                    self.report.invalid_clusters.push(InvalidCluster {
                        pathname: pathname.to_string(),
                        fat_index: fault.fat_index,
                        value: fault.value,
                        fault: fault.fault,
                    });
                    return (clusters, false);
                }
            }
        }
        (clusters, true)
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Cross-check every reachable cluster chain; findings ordered by pathname then index
    pub fn scan_integrity(&mut self, cancel: &CancelToken) -> Result<Vec<InvalidCluster>, VolumeError> {
        let progress: Arc<dyn ProgressCallback> = Arc::new(fat32mgr_core::NoOpProgress);
        Ok(self.scan_report(cancel, progress)?.invalid_clusters)
    }

    /// Full scan: invalid clusters plus mirror divergences, length mismatches and unreadable directories
    pub fn scan_report(
        &mut self,
        cancel: &CancelToken,
        progress: Arc<dyn ProgressCallback>,
    ) -> Result<ScanReport, VolumeError> {
        let mut reporter = ProgressReporter::new("scan", self.boot.num_clusters() as u64, progress);
        let report = self.scan_tree(cancel, &mut reporter)?;
        reporter.complete();
        if report.is_clean() {
            info!("Integrity scan found no problems ({} clusters checked)", report.clusters_checked);
        } else {
            warn!(
                "Integrity scan: {} invalid clusters, {} length mismatches, {} divergent FAT copies",
                report.invalid_clusters.len(),
                report.length_mismatches.len(),
                report.fat_divergences.len()
            );
        }
        Ok(report)
    }

    /// Clusters claimed by more than one directory entry
    pub(crate) fn cross_linked_clusters(&mut self, cancel: &CancelToken) -> Result<HashSet<u32>, VolumeError> {
        let mut reporter = ProgressReporter::with_noop("scan", self.boot.num_clusters() as u64);
        let report = self.scan_tree(cancel, &mut reporter)?;
        Ok(report
            .invalid_clusters
            .iter()
            .filter(|finding| finding.fault == ClusterFault::CrossLink)
            .map(|finding| finding.value)
            .collect())
    }

    fn scan_tree(&mut self, cancel: &CancelToken, reporter: &mut ProgressReporter) -> Result<ScanReport, VolumeError> {
        let cluster_size = self.boot.cluster_size() as u64;
        let mut state = ScanState {
            owners: HashMap::new(),
            report: ScanReport {
                fat_divergences: self.fat.divergences().to_vec(),
                ..ScanReport::default()
            },
        };

        let mut pending = vec![("/".to_string(), self.boot.root_cluster)];
        while let Some((dir_path, first_cluster)) = pending.pop() {
            cancel.check()?;
            let (clusters, _) = state.claim_chain(self, &dir_path, first_cluster);
            if clusters.is_empty() {
                continue;
            }
            let entries = match self
                .read_clusters(&clusters)
                .and_then(|data| parse_table(&data, &dir_path, self.options.fix_dates))
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Skipping directory {}: {}", dir_path, e);
                    state.report.unreadable_directories.push(UnreadableDirectory {
                        pathname: dir_path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let mut subdirs = Vec::new();
            for entry in entries {
                let path = join_path(&dir_path, &entry.name);
                match entry.kind {
                    EntryKind::Directory => {
                        if entry.first_cluster == 0 {
                            state.report.invalid_clusters.push(InvalidCluster {
                                pathname: path,
                                fat_index: None,
                                value: 0,
                                fault: ClusterFault::OutOfRange,
                            });
                        } else {
                            subdirs.push((path, entry.first_cluster));
                        }
                    }
                    EntryKind::File => {
                        cancel.check()?;
                        let expected = ((entry.size as u64 + cluster_size - 1) / cluster_size) as u32;
                        let (clusters, complete) = if entry.first_cluster == 0 {
                            (Vec::new(), true)
                        } else {
                            state.claim_chain(self, &path, entry.first_cluster)
                        };
                        if complete && clusters.len() as u32 != expected {
                            state.report.length_mismatches.push(LengthMismatch {
                                pathname: path.clone(),
                                size: entry.size,
                                expected_clusters: expected,
                                actual_clusters: clusters.len() as u32,
                            });
                        }
                        reporter.report(path, state.report.clusters_checked);
                    }
                    EntryKind::VolumeLabel | EntryKind::SpecialDirectory => {}
                }
            }
            pending.extend(subdirs.into_iter().rev());
        }

        let mut report = state.report;
        report.invalid_clusters.sort();
        Ok(report)
    }
}

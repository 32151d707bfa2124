// Defragmenter: moves each fragmented file into one ascending contiguous run
// The preview runs the same planning against a copy of the FAT and writes nothing

use super::directory::{set_record_first_cluster, split_path, DirEntry};
use super::fat_table::{FatEntry, FatTable};
use super::volume::Volume;
use fat32mgr_core::{BlockDevice, CancelToken, ProgressCallback, ProgressReporter, VolumeError};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

/// Outcome for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DefragStatus {
    NotFragmented,
    /// First cluster before and after
    Defragmented { from: u32, to: u32 },
    NotEnoughSpace,
    ChainError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDefrag {
    pub path: String,
    pub clusters: u32,
    pub status: DefragStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DefragReport {
    pub files: Vec<FileDefrag>,
    pub preview: bool,
    pub cancelled: bool,
}

impl DefragReport {
    pub fn defragmented(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.status, DefragStatus::Defragmented { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.status, DefragStatus::NotEnoughSpace | DefragStatus::ChainError(_)))
            .count()
    }
}

pub fn is_contiguous(chain: &[u32]) -> bool {
    chain.windows(2).all(|w| w[1] == w[0] + 1)
}

/// Where a fragmented chain goes: the first `keep` clusters stay, the rest move to `target`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Relocation {
    keep: usize,
    target: Vec<u32>,
}

/// Extend the contiguous prefix in place if the clusters after it are free,
/// otherwise take the lowest free run long enough for the whole file
fn plan_relocation(fat: &FatTable, chain: &[u32]) -> Option<Relocation> {
    let len = chain.len() as u32;
    let first = chain[0];
    let prefix = 1 + chain.windows(2).take_while(|w| w[1] == w[0] + 1).count();
    let extension: Vec<u32> = (first + prefix as u32..first + len).collect();
    if extension.iter().all(|&c| fat.is_free(c)) {
        return Some(Relocation {
            keep: prefix,
            target: extension,
        });
    }
    let start = fat.find_free_run(len)?;
    Some(Relocation {
        keep: 0,
        target: (start..start + len).collect(),
    })
}

/// FAT side of a relocation, applied in memory only
fn apply_to_fat(fat: &mut FatTable, chain: &[u32], plan: &Relocation) -> Result<(), VolumeError> {
    fat.link(&plan.target)?;
    if plan.keep > 0 {
        fat.write(chain[plan.keep - 1], FatEntry::Allocated(plan.target[0]))?;
    }
    for &cluster in &chain[plan.keep..] {
        fat.write(cluster, FatEntry::Free)?;
    }
    Ok(())
}

impl<D: BlockDevice> Volume<D> {
    /// Defragment the files under `path` (just that directory unless `recursive`)
    pub fn defragment(
        &mut self,
        path: &str,
        recursive: bool,
        cancel: &CancelToken,
        progress: Arc<dyn ProgressCallback>,
    ) -> Result<DefragReport, VolumeError> {
        self.run_defrag(path, recursive, false, cancel, progress)
    }

    /// Statuses `defragment` would produce, without writing anything
    pub fn defragment_preview(&mut self, path: &str, recursive: bool) -> Result<DefragReport, VolumeError> {
        let progress: Arc<dyn ProgressCallback> = Arc::new(fat32mgr_core::NoOpProgress);
        self.run_defrag(path, recursive, true, &CancelToken::new(), progress)
    }

    /// Paths of files whose chains are not a single ascending run
    pub fn fragmented_files(&mut self, path: &str, recursive: bool) -> Result<Vec<String>, VolumeError> {
        let mut fragmented = Vec::new();
        for (file_path, entry) in self.collect_entries(path, recursive)? {
            if !entry.is_file() || entry.first_cluster == 0 {
                continue;
            }
            match self.fat.chain(entry.first_cluster) {
                Ok(chain) if !is_contiguous(&chain) => fragmented.push(file_path),
                Ok(_) => {}
                Err(e) => debug!("{}: {}", file_path, e),
            }
        }
        Ok(fragmented)
    }

    fn run_defrag(
        &mut self,
        path: &str,
        recursive: bool,
        preview: bool,
        cancel: &CancelToken,
        progress: Arc<dyn ProgressCallback>,
    ) -> Result<DefragReport, VolumeError> {
        let files: Vec<(String, DirEntry)> = self
            .collect_entries(path, recursive)?
            .into_iter()
            .filter(|(_, e)| e.is_file() && e.first_cluster != 0)
            .collect();
        let total: u64 = files
            .iter()
            .map(|(_, e)| self.fat.cluster_count(e.first_cluster).unwrap_or(0) as u64)
            .sum();
        let mut report = DefragReport {
            preview,
            ..DefragReport::default()
        };
        let shared = match self.cross_linked_clusters(cancel) {
            Ok(shared) => shared,
            Err(VolumeError::UserCancelled) => {
                info!("Defragmentation cancelled before the first file");
                report.cancelled = true;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        let mut reporter = ProgressReporter::new("defragment", total, progress);
        let mut shadow = if preview { Some(self.fat.clone()) } else { None };

        for (file_path, entry) in files {
            if cancel.is_cancelled() {
                info!("Defragmentation cancelled after {} files", report.files.len());
                report.cancelled = true;
                break;
            }

            let fat = shadow.as_ref().unwrap_or(&self.fat);
            let chain = fat.chain(entry.first_cluster).and_then(|chain| {
                match chain.iter().find(|&&c| shared.contains(&c)) {
                    Some(&cluster) => Err(VolumeError::chain(cluster, "cluster is shared with another entry")),
                    None => Ok(chain),
                }
            });
            let (clusters, status) = match chain {
                Err(e) => {
                    warn!("Not defragmenting {}: {}", file_path, e);
                    (0, DefragStatus::ChainError(e.to_string()))
                }
                Ok(chain) if is_contiguous(&chain) => (chain.len() as u32, DefragStatus::NotFragmented),
                Ok(chain) => {
                    let status = match plan_relocation(fat, &chain) {
                        None => {
                            warn!("Not enough contiguous free space to defragment {}", file_path);
                            DefragStatus::NotEnoughSpace
                        }
                        Some(plan) => {
                            let to = if plan.keep > 0 { chain[0] } else { plan.target[0] };
                            match shadow.as_mut() {
                                Some(shadow) => apply_to_fat(shadow, &chain, &plan)?,
                                None => self.relocate(&file_path, &entry, &chain, &plan)?,
                            }
                            debug!("{}: {} clusters, first cluster {} -> {}", file_path, chain.len(), chain[0], to);
                            DefragStatus::Defragmented { from: chain[0], to }
                        }
                    };
                    (chain.len() as u32, status)
                }
            };
            reporter.advance(file_path.clone(), clusters as u64);
            report.files.push(FileDefrag {
                path: file_path,
                clusters,
                status,
            });
        }

        reporter.complete();
        info!(
            "Defragmentation{}: {} of {} files moved, {} skipped",
            if preview { " preview" } else { "" },
            report.defragmented(),
            report.files.len(),
            report.skipped()
        );
        Ok(report)
    }

    /// Move one file. Each step is flushed before the next so an interruption
    /// leaves either the old chain or the new one in use, never a mix.
    fn relocate(&mut self, path: &str, entry: &DirEntry, chain: &[u32], plan: &Relocation) -> Result<(), VolumeError> {
        let moving = &chain[plan.keep..];
        for (&from, &to) in moving.iter().zip(&plan.target) {
            let data = self.read_clusters(&[from])?;
            self.write_clusters(&[to], &data)?;
        }
        self.device.flush()?;

        self.fat.link(&plan.target)?;
        self.fat.flush(&mut self.device)?;

        if plan.keep > 0 {
            self.fat.write(chain[plan.keep - 1], FatEntry::Allocated(plan.target[0]))?;
            self.fat.flush(&mut self.device)?;
        } else {
            let (parent_path, _) = split_path(path)?;
            let parent = self.resolve_dir(&parent_path)?;
            let mut table = self.dir_table(parent)?;
            set_record_first_cluster(table.slot_mut(entry.short_slot()), plan.target[0]);
            self.write_table(&table)?;
            self.tree.invalidate(parent);
        }

        for &cluster in moving {
            self.fat.write(cluster, FatEntry::Free)?;
        }
        self.fat.flush(&mut self.device)
    }
}

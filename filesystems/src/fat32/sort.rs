// Sorting directory tables by entry kind and name
// Preview and the real run share the traversal and comparison; only the write is skipped

use super::directory::{join_path, sorted_entries};
use super::volume::Volume;
use fat32mgr_core::{BlockDevice, CancelToken, VolumeError};
use log::{debug, info};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SortOptions {
    pub recursive: bool,
    pub ignore_case: bool,
    pub preview: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectorySort {
    pub path: String,
    pub changed: bool,
    /// Entry names in their sorted order
    pub order: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SortReport {
    pub directories: Vec<DirectorySort>,
    pub preview: bool,
}

impl SortReport {
    pub fn changed(&self) -> usize {
        self.directories.iter().filter(|d| d.changed).count()
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Sort the directory at `path`; with `recursive`, subdirectories are
    /// sorted before their parent
    pub fn sort(&mut self, path: &str, options: &SortOptions, cancel: &CancelToken) -> Result<SortReport, VolumeError> {
        let mut report = SortReport {
            preview: options.preview,
            ..SortReport::default()
        };
        self.sort_directory(path, options, cancel, &mut report)?;
        info!(
            "Sort{}: {} of {} directories {}",
            if options.preview { " preview" } else { "" },
            report.changed(),
            report.directories.len(),
            if options.preview { "would change" } else { "changed" }
        );
        Ok(report)
    }

    fn sort_directory(
        &mut self,
        path: &str,
        options: &SortOptions,
        cancel: &CancelToken,
        report: &mut SortReport,
    ) -> Result<(), VolumeError> {
        cancel.check()?;
        let dir = self.resolve_dir(path)?;
        let entries = self.tree.node(dir)?.entries.clone();

        if options.recursive {
            for entry in entries.iter().filter(|e| e.is_directory()) {
                self.sort_directory(&join_path(path, &entry.name), options, cancel, report)?;
            }
        }

        let sorted = sorted_entries(&entries, options.ignore_case);
        let changed = sorted.iter().zip(&entries).any(|(a, b)| a.index != b.index);
        if changed && !options.preview {
            let dir = self.resolve_dir(path)?;
            let mut table = self.dir_table(dir)?;
            table.rewrite(&sorted);
            self.write_table(&table)?;
            self.tree.invalidate(dir);
            debug!("Sorted {} ({} entries)", path, sorted.len());
        }
        report.directories.push(DirectorySort {
            path: path.to_string(),
            changed,
            order: sorted.into_iter().map(|e| e.name).collect(),
        });
        Ok(())
    }
}

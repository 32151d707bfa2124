// FAT32 volume engine: on-disk primitives and the mounted-volume operations

pub mod fat32;
pub mod fat_common;

#[cfg(test)]
pub mod test_helpers;

pub use fat32::{
    simulate_format, BootSector, ClusterFault, DefragReport, DefragStatus, DirEntry, EntryKind, EraseReport,
    EraseScope, FatEntry, FormatReport, InvalidCluster, MountOptions, ScanReport, SortOptions, SortReport, Volume,
    VolumeProperties,
};
pub use fat_common::{compute_geometry, compute_geometry_auto, valid_sectors_per_cluster, Geometry};

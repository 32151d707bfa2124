// FAT32 volume engine

pub mod boot_sector;
pub mod defrag;
pub mod directory;
pub mod eraser;
pub mod fat_table;
pub mod formatter;
pub mod scanner;
pub mod sort;
pub mod volume;

pub use boot_sector::{BootSector, FsInfo};
pub use defrag::{DefragReport, DefragStatus, FileDefrag};
pub use directory::{DirEntry, EntryKind};
pub use eraser::{EraseReport, EraseScope};
pub use fat_table::{ClusterFault, FatDivergence, FatEntry, FatTable};
pub use formatter::{simulate_format, FormatReport};
pub use scanner::{InvalidCluster, LengthMismatch, ScanReport, UnreadableDirectory};
pub use sort::{DirectorySort, SortOptions, SortReport};
pub use volume::{MountOptions, Volume, VolumeProperties};

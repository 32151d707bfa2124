// On-disk primitives shared by the FAT32 engine

pub mod cluster_calc;
pub mod constants;
pub mod directory;
pub mod fat_init;
pub mod long_names;
pub mod timestamps;

pub use cluster_calc::{compute_geometry, compute_geometry_auto, valid_sectors_per_cluster, Geometry};
pub use constants::*;
pub use directory::{
    attributes, format_83_name, format_volume_label, is_valid_83_char, is_valid_volume_label_char,
    lfn_checksum, needs_lfn, parse_83_name, parse_volume_label, short_name_fit,
};
pub use fat_init::init_fat32_table;
pub use long_names::{create_vfat_lfn_entries, generate_short_name, lfn_entries_needed, LfnAccumulator};
pub use timestamps::{current_fat_datetime, decode_fat_date, decode_fat_datetime, encode_fat_date, encode_fat_datetime};

/// Generate a volume serial number
pub fn generate_volume_serial() -> u32 {
    rand::random::<u32>()
}

/// Serial numbers are shown as two groups of four hex digits
pub fn format_volume_serial(serial: u32) -> String {
    format!("{:04X}-{:04X}", serial >> 16, serial & 0xFFFF)
}

// Shared fixtures for the volume integration tests
#![allow(dead_code)]

use fat32mgr_core::{CancelToken, FormatOptions, FormatParams, MemoryDevice, NoOpProgress};
use fat32mgr_filesystems::Volume;
use std::sync::Arc;

/// 64 MiB with 512-byte sectors
pub const SECTORS_64_MIB: u64 = 64 * 1024 * 1024 / 512;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn options(sectors_per_cluster: u32) -> FormatOptions {
    FormatOptions {
        label: Some("TEST".to_string()),
        sectors_per_cluster: Some(sectors_per_cluster),
        volume_id: Some(0xDEAD_BEEF),
        hidden_sectors: 0,
    }
}

/// Formatted 64 MiB volume in memory
pub fn memory_volume(sectors_per_cluster: u32) -> Volume<MemoryDevice> {
    init_logging();
    Volume::format(
        MemoryDevice::new(512, SECTORS_64_MIB),
        &FormatParams::default(),
        &options(sectors_per_cluster),
        &CancelToken::new(),
        Arc::new(NoOpProgress),
    )
    .expect("format")
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Overwrite FAT entry `cluster` in every FAT copy of a raw image
pub fn poke_fat(device: &mut MemoryDevice, cluster: u32, value: u32) {
    let bytes = device.as_bytes().to_vec();
    let reserved = u16::from_le_bytes([bytes[14], bytes[15]]) as usize;
    let num_fats = bytes[16] as usize;
    let sectors_per_fat = u32::from_le_bytes([bytes[36], bytes[37], bytes[38], bytes[39]]) as usize;
    for fat in 0..num_fats {
        let offset = (reserved + fat * sectors_per_fat) * 512 + cluster as usize * 4;
        device.as_bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

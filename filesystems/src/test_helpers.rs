// Test helpers: small formatted volumes in memory

use crate::fat32::Volume;
use fat32mgr_core::{CancelToken, FormatOptions, FormatParams, MemoryDevice, NoOpProgress};
use std::sync::Arc;

/// 64 MiB device, 512-byte sectors
pub const TEST_SECTORS: u64 = 131072;

/// Freshly formatted in-memory volume with 4 KiB clusters
pub fn formatted_volume() -> Volume<MemoryDevice> {
    formatted_volume_with(Some(8), Some("TESTVOL"))
}

pub fn formatted_volume_with(sectors_per_cluster: Option<u32>, label: Option<&str>) -> Volume<MemoryDevice> {
    let options = FormatOptions {
        label: label.map(str::to_string),
        sectors_per_cluster,
        volume_id: Some(0x1234_5678),
        hidden_sectors: 0,
    };
    Volume::format(
        MemoryDevice::new(512, TEST_SECTORS),
        &FormatParams::default(),
        &options,
        &CancelToken::new(),
        Arc::new(NoOpProgress),
    )
    .expect("format test volume")
}

/// `len` bytes of a repeating pattern seeded by `seed`
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

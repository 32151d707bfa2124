// FAT32 table initialization for freshly formatted volumes

use super::constants::{FAT32_EOC_MAX, FAT32_ENTRY_SIZE};

/// Initialize the first sector of a FAT32 table
///
/// The first three entries are reserved:
/// - FAT[0] = 0x0FFFFF00 | media_descriptor
/// - FAT[1] = 0x0FFFFFFF (end of chain marker)
/// - FAT[root_cluster] = 0x0FFFFFFF (root directory end marker)
pub fn init_fat32_table(fat_data: &mut [u8], media_descriptor: u8, root_cluster: u32) {
    fat_data.fill(0);

    let fat0_value: u32 = 0x0FFFFF00 | (media_descriptor as u32);
    fat_data[0..4].copy_from_slice(&fat0_value.to_le_bytes());
    fat_data[4..8].copy_from_slice(&FAT32_EOC_MAX.to_le_bytes());

    let root_offset = root_cluster as usize * FAT32_ENTRY_SIZE;
    if root_cluster >= 2 && root_offset + FAT32_ENTRY_SIZE <= fat_data.len() {
        fat_data[root_offset..root_offset + FAT32_ENTRY_SIZE].copy_from_slice(&FAT32_EOC_MAX.to_le_bytes());
    }
}

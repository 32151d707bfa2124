// FAT32 boot sector (BIOS parameter block) and FSInfo sector
// Parsing validates the BPB before anything else on the volume is trusted

use crate::fat_common::*;
use byteorder::{ByteOrder, LittleEndian};
use fat32mgr_core::format::SUPPORTED_SECTOR_SIZES;
use fat32mgr_core::VolumeError;
use serde::Serialize;

/// x86 stub that prints the message following it, waits for a key and reboots.
/// The message address is absolute (0x7C00 + 0x5A + stub length).
const BOOT_STUB: [u8; 29] = [
    0x0E, // push cs
    0x1F, // pop ds
    0xBE, 0x77, 0x7C, // mov si, message
    0xAC, // lodsb
    0x22, 0xC0, // and al, al
    0x74, 0x0B, // jz wait_key
    0x56, // push si
    0xB4, 0x0E, // mov ah, 0Eh
    0xBB, 0x07, 0x00, // mov bx, 0007h
    0xCD, 0x10, // int 10h
    0x5E, // pop si
    0xEB, 0xF0, // jmp print
    0x32, 0xE4, // xor ah, ah
    0xCD, 0x16, // int 16h
    0xCD, 0x19, // int 19h
    0xEB, 0xFE, // jmp $
];

const BOOT_MESSAGE: &[u8] = b"This volume is not bootable.\r\nPress any key to reboot.\r\n\0";

/// Decoded FAT32 boot sector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootSector {
    pub formatter_name: String,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub media_descriptor: u8,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors: u32,
    pub sectors_per_fat: u32,
    pub ext_flags: u16,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub backup_boot_sector: u16,
    pub drive_number: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
}

fn invalid(reason: impl Into<String>) -> VolumeError {
    VolumeError::VolumeFormat(reason.into())
}

fn ascii_field(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { ' ' })
        .collect::<String>()
        .trim_end()
        .to_string()
}

impl BootSector {
    /// Parse and validate sector 0 of a FAT32 volume
    pub fn parse(sector: &[u8]) -> Result<Self, VolumeError> {
        if sector.len() < 512 {
            return Err(invalid("boot sector shorter than 512 bytes"));
        }
        if sector[BS_JMP_BOOT] != 0xEB || sector[BS_JMP_BOOT + 2] != 0x90 {
            return Err(invalid("missing jump instruction"));
        }
        if sector[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2] != BOOT_SIGNATURE {
            return Err(invalid("missing boot sector signature 0x55AA"));
        }
        if LittleEndian::read_u16(&sector[BPB_ROOT_ENT_CNT..]) != 0 {
            return Err(invalid("root entry count is not zero"));
        }
        if LittleEndian::read_u16(&sector[BPB_FAT_SZ16..]) != 0 {
            return Err(invalid("16-bit FAT size is not zero"));
        }
        if LittleEndian::read_u16(&sector[BPB_FS_VER..]) != 0 {
            return Err(invalid("unsupported file system version"));
        }
        if sector[BS32_BOOT_SIG] != EXTENDED_BOOT_SIGNATURE {
            return Err(invalid("missing extended boot signature"));
        }
        if &sector[BS32_FIL_SYS_TYPE..BS32_FIL_SYS_TYPE + 8] != FS_TYPE_FAT32 {
            return Err(invalid("file system type is not FAT32"));
        }

        let media_descriptor = sector[BPB_MEDIA];
        if media_descriptor < MEDIA_MIN {
            return Err(invalid(format!("invalid media descriptor 0x{:02X}", media_descriptor)));
        }

        let bytes_per_sector = LittleEndian::read_u16(&sector[BPB_BYTES_PER_SEC..]) as u32;
        if !SUPPORTED_SECTOR_SIZES.contains(&bytes_per_sector) {
            return Err(invalid(format!("unsupported bytes per sector: {}", bytes_per_sector)));
        }

        let sectors_per_cluster = sector[BPB_SEC_PER_CLUS] as u32;
        if !sectors_per_cluster.is_power_of_two() || sectors_per_cluster > MAX_SECTORS_PER_CLUSTER {
            return Err(invalid(format!("invalid sectors per cluster: {}", sectors_per_cluster)));
        }

        let num_fats = sector[BPB_NUM_FATS] as u32;
        if num_fats == 0 {
            return Err(invalid("no FATs"));
        }

        let total_16 = LittleEndian::read_u16(&sector[BPB_TOT_SEC16..]) as u32;
        let total_sectors = if total_16 != 0 {
            total_16
        } else {
            LittleEndian::read_u32(&sector[BPB_TOT_SEC32..])
        };

        let reserved_sectors = LittleEndian::read_u16(&sector[BPB_RSVD_SEC_CNT..]) as u32;
        let sectors_per_fat = LittleEndian::read_u32(&sector[BPB_FAT_SZ32..]);
        let backup_boot_sector = LittleEndian::read_u16(&sector[BPB_BK_BOOT_SEC..]);

        let header = reserved_sectors as u64 + num_fats as u64 * sectors_per_fat as u64;
        if (total_sectors as u64) < header
            || reserved_sectors < backup_boot_sector as u32 + FAT32_BOOT_REGION_SECTORS as u32
        {
            return Err(invalid("inconsistent sector parameters"));
        }

        let mut volume_label = [0u8; 11];
        volume_label.copy_from_slice(&sector[BS32_VOL_LAB..BS32_VOL_LAB + VOLUME_LABEL_LEN]);

        let boot = Self {
            formatter_name: ascii_field(&sector[BS_OEM_NAME..BS_OEM_NAME + 8]),
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            media_descriptor,
            sectors_per_track: LittleEndian::read_u16(&sector[BPB_SEC_PER_TRK..]),
            num_heads: LittleEndian::read_u16(&sector[BPB_NUM_HEADS..]),
            hidden_sectors: LittleEndian::read_u32(&sector[BPB_HIDD_SEC..]),
            total_sectors,
            sectors_per_fat,
            ext_flags: LittleEndian::read_u16(&sector[BPB_EXT_FLAGS..]),
            root_cluster: LittleEndian::read_u32(&sector[BPB_ROOT_CLUS..]),
            fs_info_sector: LittleEndian::read_u16(&sector[BPB_FS_INFO..]),
            backup_boot_sector,
            drive_number: sector[BS32_DRV_NUM],
            volume_id: LittleEndian::read_u32(&sector[BS32_VOL_ID..]),
            volume_label,
        };

        let entries_per_fat = sectors_per_fat as u64 * bytes_per_sector as u64 / FAT32_ENTRY_SIZE as u64;
        if entries_per_fat < boot.max_cluster() as u64 + 1 {
            return Err(invalid("too few sectors per FAT"));
        }
        if boot.num_clusters() == 0 {
            return Err(invalid("volume has no data clusters"));
        }
        if boot.root_cluster < FAT32_MIN_CLUSTER || boot.root_cluster > boot.max_cluster() {
            return Err(invalid(format!("root cluster {} out of range", boot.root_cluster)));
        }

        Ok(boot)
    }

    /// Boot sector for a volume about to be formatted
    pub fn for_geometry(
        geometry: &Geometry,
        formatter_name: &str,
        volume_id: u32,
        volume_label: [u8; 11],
        hidden_sectors: u32,
    ) -> Self {
        Self {
            formatter_name: formatter_name.to_string(),
            bytes_per_sector: geometry.bytes_per_sector,
            sectors_per_cluster: geometry.sectors_per_cluster,
            reserved_sectors: geometry.reserved_sectors,
            num_fats: geometry.num_fats,
            media_descriptor: MEDIA_FIXED,
            sectors_per_track: FORMAT_SECTORS_PER_TRACK,
            num_heads: FORMAT_NUM_HEADS,
            hidden_sectors,
            total_sectors: geometry.total_sectors,
            sectors_per_fat: geometry.sectors_per_fat,
            ext_flags: 0,
            root_cluster: FAT32_ROOT_CLUSTER,
            fs_info_sector: FAT32_FS_INFO_SECTOR,
            backup_boot_sector: FAT32_BACKUP_BOOT_SECTOR,
            drive_number: FORMAT_DRIVE_NUMBER,
            volume_id,
            volume_label,
        }
    }

    /// Encode into a full sector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut sector = vec![0u8; self.bytes_per_sector as usize];

        sector[BS_JMP_BOOT..BS_JMP_BOOT + 3].copy_from_slice(&JUMP_CODE);
        let mut oem = [b' '; 8];
        for (dst, src) in oem.iter_mut().zip(self.formatter_name.bytes()) {
            *dst = src;
        }
        sector[BS_OEM_NAME..BS_OEM_NAME + 8].copy_from_slice(&oem);

        LittleEndian::write_u16(&mut sector[BPB_BYTES_PER_SEC..], self.bytes_per_sector as u16);
        sector[BPB_SEC_PER_CLUS] = self.sectors_per_cluster as u8;
        LittleEndian::write_u16(&mut sector[BPB_RSVD_SEC_CNT..], self.reserved_sectors as u16);
        sector[BPB_NUM_FATS] = self.num_fats as u8;
        sector[BPB_MEDIA] = self.media_descriptor;
        LittleEndian::write_u16(&mut sector[BPB_SEC_PER_TRK..], self.sectors_per_track);
        LittleEndian::write_u16(&mut sector[BPB_NUM_HEADS..], self.num_heads);
        LittleEndian::write_u32(&mut sector[BPB_HIDD_SEC..], self.hidden_sectors);
        LittleEndian::write_u32(&mut sector[BPB_TOT_SEC32..], self.total_sectors);

        LittleEndian::write_u32(&mut sector[BPB_FAT_SZ32..], self.sectors_per_fat);
        LittleEndian::write_u16(&mut sector[BPB_EXT_FLAGS..], self.ext_flags);
        LittleEndian::write_u32(&mut sector[BPB_ROOT_CLUS..], self.root_cluster);
        LittleEndian::write_u16(&mut sector[BPB_FS_INFO..], self.fs_info_sector);
        LittleEndian::write_u16(&mut sector[BPB_BK_BOOT_SEC..], self.backup_boot_sector);
        sector[BS32_DRV_NUM] = self.drive_number;
        sector[BS32_BOOT_SIG] = EXTENDED_BOOT_SIGNATURE;
        LittleEndian::write_u32(&mut sector[BS32_VOL_ID..], self.volume_id);
        sector[BS32_VOL_LAB..BS32_VOL_LAB + VOLUME_LABEL_LEN].copy_from_slice(&self.volume_label);
        sector[BS32_FIL_SYS_TYPE..BS32_FIL_SYS_TYPE + 8].copy_from_slice(FS_TYPE_FAT32);

        let stub_end = BS32_BOOT_CODE + BOOT_STUB.len();
        sector[BS32_BOOT_CODE..stub_end].copy_from_slice(&BOOT_STUB);
        sector[stub_end..stub_end + BOOT_MESSAGE.len()].copy_from_slice(BOOT_MESSAGE);

        sector[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2].copy_from_slice(&BOOT_SIGNATURE);
        sector
    }

    /// Check the BPB against the device it was read from
    pub fn check_device(&self, sector_size: usize, num_sectors: u64) -> Result<(), VolumeError> {
        if self.bytes_per_sector as usize != sector_size {
            return Err(invalid(format!(
                "bytes per sector {} does not match device sector size {}",
                self.bytes_per_sector, sector_size
            )));
        }
        if self.total_sectors as u64 > num_sectors {
            return Err(invalid(format!(
                "volume has {} sectors but the device only {}",
                self.total_sectors, num_sectors
            )));
        }
        Ok(())
    }

    pub fn label(&self) -> String {
        parse_volume_label(&self.volume_label)
    }

    pub fn fat_start_sector(&self, fat_index: u32) -> u64 {
        self.reserved_sectors as u64 + fat_index as u64 * self.sectors_per_fat as u64
    }

    pub fn first_data_sector(&self) -> u64 {
        self.fat_start_sector(self.num_fats)
    }

    pub fn cluster_size(&self) -> usize {
        (self.bytes_per_sector * self.sectors_per_cluster) as usize
    }

    /// Number of data clusters
    pub fn num_clusters(&self) -> u32 {
        let data = (self.total_sectors as u64).saturating_sub(self.first_data_sector());
        let clusters = data / self.sectors_per_cluster as u64;
        clusters.min((FAT32_MAX_CLUSTER - 1) as u64) as u32
    }

    /// Highest valid cluster number
    pub fn max_cluster(&self) -> u32 {
        self.num_clusters() + FAT32_MIN_CLUSTER - 1
    }

    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.first_data_sector() + (cluster - FAT32_MIN_CLUSTER) as u64 * self.sectors_per_cluster as u64
    }

    /// Cluster holding `sector` and the sector's offset within it; `None`
    /// for sectors in the reserved area, the FATs, or the slack after the last cluster
    pub fn sector_to_cluster(&self, sector: u64) -> Option<(u32, u32)> {
        let first = self.first_data_sector();
        if sector < first {
            return None;
        }
        let relative = sector - first;
        let cluster = relative / self.sectors_per_cluster as u64 + FAT32_MIN_CLUSTER as u64;
        if cluster > self.max_cluster() as u64 {
            return None;
        }
        Some((cluster as u32, (relative % self.sectors_per_cluster as u64) as u32))
    }
}

/// Free-cluster hints from the FSInfo sector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsInfo {
    pub free_count: u32,
    pub next_free: u32,
}

impl FsInfo {
    /// `None` if the sector does not carry the FSInfo signatures
    pub fn parse(sector: &[u8]) -> Option<Self> {
        if sector.len() < 512
            || LittleEndian::read_u32(&sector[FSINFO_LEAD_SIG_OFFSET..]) != FSINFO_LEAD_SIG
            || LittleEndian::read_u32(&sector[FSINFO_STRUCT_SIG_OFFSET..]) != FSINFO_STRUCT_SIG
            || LittleEndian::read_u32(&sector[FSINFO_TRAIL_SIG_OFFSET..]) != FSINFO_TRAIL_SIG
        {
            return None;
        }
        Some(Self {
            free_count: LittleEndian::read_u32(&sector[FSINFO_FREE_COUNT_OFFSET..]),
            next_free: LittleEndian::read_u32(&sector[FSINFO_NEXT_FREE_OFFSET..]),
        })
    }

    /// Store the hints into an existing FSInfo sector
    pub fn write_into(&self, sector: &mut [u8]) {
        LittleEndian::write_u32(&mut sector[FSINFO_FREE_COUNT_OFFSET..], self.free_count);
        LittleEndian::write_u32(&mut sector[FSINFO_NEXT_FREE_OFFSET..], self.next_free);
    }
}

/// Create FSInfo sector with both hints set to "unknown"
pub fn create_fsinfo_sector(bytes_per_sector: usize) -> Vec<u8> {
    let mut fsinfo = vec![0u8; bytes_per_sector];
    LittleEndian::write_u32(&mut fsinfo[FSINFO_LEAD_SIG_OFFSET..], FSINFO_LEAD_SIG);
    LittleEndian::write_u32(&mut fsinfo[FSINFO_STRUCT_SIG_OFFSET..], FSINFO_STRUCT_SIG);
    FsInfo {
        free_count: FSINFO_UNKNOWN,
        next_free: FSINFO_UNKNOWN,
    }
    .write_into(&mut fsinfo);
    LittleEndian::write_u32(&mut fsinfo[FSINFO_TRAIL_SIG_OFFSET..], FSINFO_TRAIL_SIG);
    fsinfo
}

/// Third sector of the boot region; carries only the signature
pub fn create_signature_sector(bytes_per_sector: usize) -> Vec<u8> {
    let mut sector = vec![0u8; bytes_per_sector];
    sector[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2].copy_from_slice(&BOOT_SIGNATURE);
    sector
}

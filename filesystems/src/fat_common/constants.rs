// FAT32 on-disk constants: boot sector, FSInfo, FAT entries, directory records

use static_assertions::const_assert;

// Boot sector offsets
pub const BS_JMP_BOOT: usize = 0x00;
pub const BS_OEM_NAME: usize = 0x03;
pub const BPB_BYTES_PER_SEC: usize = 0x0B;
pub const BPB_SEC_PER_CLUS: usize = 0x0D;
pub const BPB_RSVD_SEC_CNT: usize = 0x0E;
pub const BPB_NUM_FATS: usize = 0x10;
pub const BPB_ROOT_ENT_CNT: usize = 0x11;
pub const BPB_TOT_SEC16: usize = 0x13;
pub const BPB_MEDIA: usize = 0x15;
pub const BPB_FAT_SZ16: usize = 0x16;
pub const BPB_SEC_PER_TRK: usize = 0x18;
pub const BPB_NUM_HEADS: usize = 0x1A;
pub const BPB_HIDD_SEC: usize = 0x1C;
pub const BPB_TOT_SEC32: usize = 0x20;

// FAT32 extended BPB (start at 36)
pub const BPB_FAT_SZ32: usize = 0x24;
pub const BPB_EXT_FLAGS: usize = 0x28;
pub const BPB_FS_VER: usize = 0x2A;
pub const BPB_ROOT_CLUS: usize = 0x2C;
pub const BPB_FS_INFO: usize = 0x30;
pub const BPB_BK_BOOT_SEC: usize = 0x32;
pub const BS32_DRV_NUM: usize = 0x40;
pub const BS32_BOOT_SIG: usize = 0x42;
pub const BS32_VOL_ID: usize = 0x43;
pub const BS32_VOL_LAB: usize = 0x47;
pub const BS32_FIL_SYS_TYPE: usize = 0x52;
pub const BS32_BOOT_CODE: usize = 0x5A;

// Boot sector signature
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;
pub const JUMP_CODE: [u8; 3] = [0xEB, (BS32_BOOT_CODE - 2) as u8, 0x90];
pub const EXTENDED_BOOT_SIGNATURE: u8 = 0x29;
pub const FS_TYPE_FAT32: &[u8; 8] = b"FAT32   ";
pub const VOLUME_LABEL_LEN: usize = 11;
pub const NO_NAME_LABEL: &[u8; 11] = b"NO NAME    ";

// FSInfo sector
pub const FSINFO_LEAD_SIG: u32 = 0x41615252; // "RRaA"
pub const FSINFO_STRUCT_SIG: u32 = 0x61417272; // "rrAa"
pub const FSINFO_TRAIL_SIG: u32 = 0xAA550000;
pub const FSINFO_LEAD_SIG_OFFSET: usize = 0;
pub const FSINFO_STRUCT_SIG_OFFSET: usize = 484;
pub const FSINFO_FREE_COUNT_OFFSET: usize = 488;
pub const FSINFO_NEXT_FREE_OFFSET: usize = 492;
pub const FSINFO_TRAIL_SIG_OFFSET: usize = 508;
pub const FSINFO_UNKNOWN: u32 = 0xFFFFFFFF;

// FAT entry values (28 bits)
pub const FAT32_ENTRY_SIZE: usize = 4;
pub const FAT32_ENTRY_MASK: u32 = 0x0FFFFFFF;
pub const FAT32_FREE: u32 = 0x00000000;
pub const FAT32_MIN_CLUSTER: u32 = 2;
pub const FAT32_MAX_CLUSTER: u32 = 0x0FFFFFF6;
pub const FAT32_BAD: u32 = 0x0FFFFFF7; // Bad cluster marker
pub const FAT32_EOC: u32 = 0x0FFFFFF8; // Lowest end of chain marker
pub const FAT32_EOC_MAX: u32 = 0x0FFFFFFF; // End of chain value written by the engine

// Standard values for newly formatted volumes
pub const FAT32_ROOT_CLUSTER: u32 = 2;
pub const FAT32_FS_INFO_SECTOR: u16 = 1;
pub const FAT32_BACKUP_BOOT_SECTOR: u16 = 6;
pub const FAT32_NUM_FATS: u32 = 2;
pub const FAT32_BOOT_REGION_SECTORS: usize = 3;
pub const FORMAT_SECTORS_PER_TRACK: u16 = 63;
pub const FORMAT_NUM_HEADS: u16 = 255;
pub const FORMAT_DRIVE_NUMBER: u8 = 0x80;
pub const MIN_SECTORS_PER_CLUSTER: u32 = 1;
pub const MAX_SECTORS_PER_CLUSTER: u32 = 128;
pub const DEFAULT_SECTORS_PER_CLUSTER: u32 = 8;

// Media descriptors
pub const MEDIA_FIXED: u8 = 0xF8;
pub const MEDIA_MIN: u8 = 0xF0;

// Directory records
pub const DIR_ENTRY_SIZE: usize = 32;
pub const DIR_NAME: usize = 0x00;
pub const DIR_EXT: usize = 0x08;
pub const DIR_ATTR: usize = 0x0B;
pub const DIR_NT_RES: usize = 0x0C;
pub const DIR_CRT_TIME_TENTH: usize = 0x0D;
pub const DIR_CRT_TIME: usize = 0x0E;
pub const DIR_CRT_DATE: usize = 0x10;
pub const DIR_LST_ACC_DATE: usize = 0x12;
pub const DIR_FST_CLUS_HI: usize = 0x14;
pub const DIR_WRT_TIME: usize = 0x16;
pub const DIR_WRT_DATE: usize = 0x18;
pub const DIR_FST_CLUS_LO: usize = 0x1A;
pub const DIR_FILE_SIZE: usize = 0x1C;

pub const DIR_END_MARKER: u8 = 0x00;
pub const DIR_DELETED_MARKER: u8 = 0xE5;
pub const DIR_KANJI_E5_ESCAPE: u8 = 0x05;

// NT case bits in DIR_NT_RES
pub const CASE_LOWER_BASE: u8 = 0x08;
pub const CASE_LOWER_EXT: u8 = 0x10;

// Long filename records
pub const LFN_ORD: usize = 0x00;
pub const LFN_TYPE: usize = 0x0C;
pub const LFN_CHECKSUM: usize = 0x0D;
pub const LFN_LAST_ENTRY_FLAG: u8 = 0x40;
pub const LFN_ORD_MASK: u8 = 0x1F;
pub const LFN_MAX_ORD: u8 = 20;
pub const LFN_CHARS_PER_ENTRY: usize = 13;
/// (offset, number of UTF-16 units) for the three name fragments
pub const LFN_CHAR_RANGES: [(usize, usize); 3] = [(0x01, 5), (0x0E, 6), (0x1C, 2)];
pub const MAX_LFN_LENGTH: usize = 255;

const_assert!(DIR_FILE_SIZE + 4 == DIR_ENTRY_SIZE);
const_assert!(5 + 6 + 2 == LFN_CHARS_PER_ENTRY);
const_assert!(BS32_FIL_SYS_TYPE + 8 == BS32_BOOT_CODE);

// Short-name (8.3) and volume label handling for FAT32 directory records

use super::constants::{CASE_LOWER_BASE, CASE_LOWER_EXT, DIR_DELETED_MARKER, DIR_KANJI_E5_ESCAPE, VOLUME_LABEL_LEN};
use fat32mgr_core::VolumeError;

/// Directory entry attribute bits
pub mod attributes {
    pub const ATTR_READ_ONLY: u8 = 0x01;
    pub const ATTR_HIDDEN: u8 = 0x02;
    pub const ATTR_SYSTEM: u8 = 0x04;
    pub const ATTR_VOLUME_ID: u8 = 0x08;
    pub const ATTR_DIRECTORY: u8 = 0x10;
    pub const ATTR_ARCHIVE: u8 = 0x20;
    pub const ATTR_LONG_NAME: u8 = 0x0F; // LFN marker

    /// Render as the usual "DVSHRA" column, '-' for unset bits
    pub fn to_flag_string(attrs: u8) -> String {
        [
            (ATTR_DIRECTORY, 'D'),
            (ATTR_VOLUME_ID, 'V'),
            (ATTR_SYSTEM, 'S'),
            (ATTR_HIDDEN, 'H'),
            (ATTR_READ_ONLY, 'R'),
            (ATTR_ARCHIVE, 'A'),
        ]
        .iter()
        .map(|&(bit, c)| if attrs & bit != 0 { c } else { '-' })
        .collect()
    }
}

const INVALID_LABEL_CHARS: &str = "\"*+,./:;<=>?[\\]|";

fn decode_field(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != b' ' && b != 0).map_or(0, |i| i + 1);
    bytes[..end].iter().map(|&b| b as char).collect()
}

/// Parse an 8.3 name, applying the NT lower-case bits
pub fn parse_83_name(name: &[u8; 11], case_flags: u8) -> String {
    let mut raw = *name;
    if raw[0] == DIR_KANJI_E5_ESCAPE {
        raw[0] = DIR_DELETED_MARKER;
    }

    let mut stem = decode_field(&raw[0..8]);
    let mut ext = decode_field(&raw[8..11]);
    if case_flags & CASE_LOWER_BASE != 0 {
        stem = stem.to_lowercase();
    }
    if case_flags & CASE_LOWER_EXT != 0 {
        ext = ext.to_lowercase();
    }

    if ext.is_empty() {
        stem
    } else {
        format!("{}.{}", stem, ext)
    }
}

/// Volume labels use all 11 bytes without a separator
pub fn parse_volume_label(name: &[u8; 11]) -> String {
    decode_field(name)
}

/// Format a filename to 8.3 format
pub fn format_83_name(filename: &str) -> Result<[u8; 11], VolumeError> {
    let mut result = [0x20u8; 11]; // Space-padded

    if filename == "." || filename == ".." {
        result[..filename.len()].copy_from_slice(filename.as_bytes());
        return Ok(result);
    }

    let upper = filename.to_uppercase();
    let (base, ext) = match upper.rsplit_once('.') {
        Some((base, ext)) => (base, Some(ext)),
        None => (upper.as_str(), None),
    };

    // Base name (max 8 chars)
    if base.is_empty() || base.len() > 8 {
        return Err(VolumeError::InvalidInput(format!("Invalid filename: {}", filename)));
    }
    for (i, byte) in base.bytes().enumerate() {
        if !is_valid_83_char(byte) {
            return Err(VolumeError::InvalidInput(format!("Invalid character in filename: {}", filename)));
        }
        result[i] = byte;
    }
    if result[0] == DIR_DELETED_MARKER {
        result[0] = DIR_KANJI_E5_ESCAPE;
    }

    // Extension (max 3 chars)
    if let Some(ext) = ext {
        if ext.is_empty() || ext.len() > 3 {
            return Err(VolumeError::InvalidInput(format!("Invalid extension: {}", filename)));
        }
        for (i, byte) in ext.bytes().enumerate() {
            if !is_valid_83_char(byte) {
                return Err(VolumeError::InvalidInput(format!("Invalid character in extension: {}", ext)));
            }
            result[8 + i] = byte;
        }
    }

    Ok(result)
}

/// Check if a character is valid for 8.3 filenames
pub fn is_valid_83_char(c: u8) -> bool {
    matches!(c,
        b'A'..=b'Z' | b'0'..=b'9' | b'!' | b'#' | b'$' | b'%' | b'&' |
        b'\'' | b'(' | b')' | b'-' | b'@' | b'^' | b'_' | b'`' |
        b'{' | b'}' | b'~')
}

/// If `name` can be stored as a plain short entry, return the 8.3 bytes and
/// the NT case bits that reproduce its case. Mixed-case parts need a long name.
pub fn short_name_fit(name: &str) -> Option<([u8; 11], u8)> {
    if name == "." || name == ".." {
        return format_83_name(name).ok().map(|n| (n, 0));
    }
    let short = format_83_name(name).ok()?;
    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };

    let mut flags = 0u8;
    for (part, bit) in [(base, CASE_LOWER_BASE), (ext, CASE_LOWER_EXT)] {
        let has_lower = part.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = part.chars().any(|c| c.is_ascii_uppercase());
        match (has_lower, has_upper) {
            (true, true) => return None,
            (true, false) => flags |= bit,
            _ => {}
        }
    }
    Some((short, flags))
}

/// Check if a name needs long filename support
pub fn needs_lfn(name: &str) -> bool {
    short_name_fit(name).is_none()
}

/// Calculate checksum for LFN entries
pub fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    let mut sum = 0u8;
    for &byte in short_name {
        sum = ((sum >> 1) | ((sum & 1) << 7)).wrapping_add(byte);
    }
    sum
}

pub fn is_valid_volume_label_char(c: char) -> bool {
    (c == ' ' || ('\u{21}'..='\u{7E}').contains(&c)) && !INVALID_LABEL_CHARS.contains(c)
}

/// Convert a label to its 11-byte, space-padded, upper-case on-disk form
pub fn format_volume_label(label: &str) -> Result<[u8; 11], VolumeError> {
    let upper = label.trim_end().to_uppercase();
    if upper.len() > VOLUME_LABEL_LEN {
        return Err(VolumeError::InvalidInput(format!(
            "Volume label longer than {} characters: {}",
            VOLUME_LABEL_LEN, label
        )));
    }
    if upper.starts_with(' ') {
        return Err(VolumeError::InvalidInput("Volume label must not start with a space".to_string()));
    }
    if let Some(c) = upper.chars().find(|&c| !is_valid_volume_label_char(c)) {
        return Err(VolumeError::InvalidInput(format!("Invalid character in volume label: {:?}", c)));
    }

    let mut result = [0x20u8; 11];
    result[..upper.len()].copy_from_slice(upper.as_bytes());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_83_name() {
        assert_eq!(parse_83_name(b"README  TXT", 0), "README.TXT");
        assert_eq!(parse_83_name(b"FOLDER     ", 0), "FOLDER");
        assert_eq!(parse_83_name(b"TEST    C  ", 0), "TEST.C");
        assert_eq!(parse_83_name(b"..         ", 0), "..");
    }

    #[test]
    fn case_bits_lower_stem_and_extension() {
        assert_eq!(parse_83_name(b"README  TXT", CASE_LOWER_BASE), "readme.TXT");
        assert_eq!(parse_83_name(b"README  TXT", CASE_LOWER_EXT), "README.txt");
        assert_eq!(parse_83_name(b"README  TXT", CASE_LOWER_BASE | CASE_LOWER_EXT), "readme.txt");
    }

    #[test]
    fn escaped_e5_first_byte() {
        let mut raw = *b"XFILE   BIN";
        raw[0] = DIR_KANJI_E5_ESCAPE;
        assert_eq!(parse_83_name(&raw, 0), "\u{e5}FILE.BIN");
    }

    #[test]
    fn test_format_83_name() {
        assert_eq!(format_83_name("README.TXT").unwrap(), *b"README  TXT");
        assert_eq!(format_83_name("test.c").unwrap(), *b"TEST    C  ");
        assert_eq!(format_83_name("FOLDER").unwrap(), *b"FOLDER     ");
        assert_eq!(format_83_name(".").unwrap(), *b".          ");
        assert!(format_83_name("toolongname.txt").is_err());
        assert!(format_83_name("a b.txt").is_err());
        assert!(format_83_name("x.jpeg").is_err());
    }

    #[test]
    fn short_name_fit_uses_case_bits() {
        assert_eq!(short_name_fit("README.TXT"), Some((*b"README  TXT", 0)));
        assert_eq!(short_name_fit("readme.txt"), Some((*b"README  TXT", CASE_LOWER_BASE | CASE_LOWER_EXT)));
        assert_eq!(short_name_fit("Makefile"), None);
        assert_eq!(short_name_fit("notes.Md"), None);
    }

    #[test]
    fn test_needs_lfn() {
        assert!(!needs_lfn("README.TXT"));
        assert!(!needs_lfn("readme.txt"));
        assert!(needs_lfn("ReadMe.txt"));
        assert!(needs_lfn("very_long_filename.txt"));
        assert!(needs_lfn("file.jpeg"));
        assert!(needs_lfn("two.dots.txt"));
    }

    #[test]
    fn checksum_matches_reference_value() {
        // Checksum of "README  TXT" as computed by Windows
        assert_eq!(lfn_checksum(b"README  TXT"), 0x73);
    }

    #[test]
    fn volume_labels() {
        assert_eq!(format_volume_label("backup 1").unwrap(), *b"BACKUP 1   ");
        assert!(format_volume_label("TWELVE_CHARS").is_err());
        assert!(format_volume_label("A*B").is_err());
        assert!(format_volume_label(" LEAD").is_err());
        assert_eq!(parse_volume_label(b"BACKUP 1   "), "BACKUP 1");
    }

    #[test]
    fn attribute_flags_render() {
        use attributes::*;
        assert_eq!(to_flag_string(ATTR_DIRECTORY | ATTR_HIDDEN), "D--H--");
        assert_eq!(to_flag_string(ATTR_ARCHIVE | ATTR_READ_ONLY), "----RA");
    }
}

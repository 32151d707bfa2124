// Long filename (VFAT) support for FAT32 directories
// Builds LFN record runs, decodes them back and derives unique 8.3 aliases

use super::constants::*;
use super::directory::{is_valid_83_char, lfn_checksum};

/// Number of LFN records needed to hold `name`
pub fn lfn_entries_needed(name: &str) -> usize {
    (name.encode_utf16().count() + LFN_CHARS_PER_ENTRY - 1) / LFN_CHARS_PER_ENTRY
}

/// Create the LFN records for `long_name`, in on-disk order (highest ordinal first)
pub fn create_vfat_lfn_entries(long_name: &str, short_name: &[u8; 11]) -> Vec<[u8; 32]> {
    let checksum = lfn_checksum(short_name);
    let utf16: Vec<u16> = long_name.encode_utf16().collect();
    let num_entries = lfn_entries_needed(long_name);

    let mut entries = Vec::with_capacity(num_entries);
    for i in 0..num_entries {
        let mut entry = [0u8; 32];
        entry[LFN_ORD] = (i + 1) as u8;
        if i == num_entries - 1 {
            entry[LFN_ORD] |= LFN_LAST_ENTRY_FLAG;
        }
        entry[DIR_ATTR] = super::directory::attributes::ATTR_LONG_NAME;
        entry[LFN_TYPE] = 0;
        entry[LFN_CHECKSUM] = checksum;

        // Name terminated by 0x0000 when it does not fill the record, then padded with 0xFFFF
        let mut index = i * LFN_CHARS_PER_ENTRY;
        for &(offset, count) in LFN_CHAR_RANGES.iter() {
            for j in 0..count {
                let unit = match index.cmp(&utf16.len()) {
                    std::cmp::Ordering::Less => utf16[index],
                    std::cmp::Ordering::Equal => 0x0000,
                    std::cmp::Ordering::Greater => 0xFFFF,
                };
                let pos = offset + j * 2;
                entry[pos..pos + 2].copy_from_slice(&unit.to_le_bytes());
                index += 1;
            }
        }
        entries.push(entry);
    }

    entries.reverse();
    entries
}

/// The 13 UTF-16 units held by one LFN record
pub fn lfn_fragment(entry: &[u8]) -> [u16; LFN_CHARS_PER_ENTRY] {
    let mut units = [0u16; LFN_CHARS_PER_ENTRY];
    let mut i = 0;
    for &(offset, count) in LFN_CHAR_RANGES.iter() {
        for j in 0..count {
            let pos = offset + j * 2;
            units[i] = u16::from_le_bytes([entry[pos], entry[pos + 1]]);
            i += 1;
        }
    }
    units
}

/// Collects a run of LFN records while a directory table is parsed.
///
/// Records arrive highest ordinal first; the run is complete once ordinal 1
/// has been seen, and is then matched against the short entry that follows.
#[derive(Debug, Default)]
pub struct LfnAccumulator {
    fragments: Vec<[u16; LFN_CHARS_PER_ENTRY]>,
    next_ordinal: u8,
    checksum: u8,
    active: bool,
}

impl LfnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn reset(&mut self) {
        self.fragments.clear();
        self.next_ordinal = 0;
        self.active = false;
    }

    /// Feed one LFN record
    pub fn push(&mut self, entry: &[u8]) -> Result<(), String> {
        let ord = entry[LFN_ORD];
        let ordinal = ord & LFN_ORD_MASK;
        if entry[LFN_TYPE] != 0 {
            return Err(format!("unsupported long-name record type {}", entry[LFN_TYPE]));
        }
        if ordinal == 0 || ordinal > LFN_MAX_ORD {
            return Err(format!("long-name ordinal {} out of range", ordinal));
        }

        if ord & LFN_LAST_ENTRY_FLAG != 0 {
            if self.active {
                return Err("long name restarted before it was complete".to_string());
            }
            self.active = true;
            self.checksum = entry[LFN_CHECKSUM];
            self.fragments = vec![[0xFFFF; LFN_CHARS_PER_ENTRY]; ordinal as usize];
        } else {
            if !self.active {
                return Err("long-name record without a leading record".to_string());
            }
            if ordinal != self.next_ordinal {
                return Err(format!(
                    "long-name ordinal {} out of sequence, expected {}",
                    ordinal, self.next_ordinal
                ));
            }
            if entry[LFN_CHECKSUM] != self.checksum {
                return Err("long-name records disagree on checksum".to_string());
            }
        }

        self.fragments[ordinal as usize - 1] = lfn_fragment(entry);
        self.next_ordinal = ordinal - 1;
        Ok(())
    }

    /// Close the run against the short entry that follows it.
    /// Returns `None` when no LFN run preceded the short entry.
    pub fn finish(&mut self, short_name: &[u8; 11]) -> Result<Option<String>, String> {
        if !self.active {
            return Ok(None);
        }
        if self.next_ordinal != 0 {
            self.reset();
            return Err("long name is missing records".to_string());
        }
        if lfn_checksum(short_name) != self.checksum {
            self.reset();
            return Err("long-name checksum does not match short name".to_string());
        }

        let units: Vec<u16> = self
            .fragments
            .iter()
            .flat_map(|f| f.iter().copied())
            .take_while(|&u| u != 0x0000)
            .filter(|&u| u != 0xFFFF)
            .collect();
        self.reset();

        if units.len() > MAX_LFN_LENGTH {
            return Err(format!("long name longer than {} characters", MAX_LFN_LENGTH));
        }
        String::from_utf16(&units)
            .map(Some)
            .map_err(|_| "long name is not valid UTF-16".to_string())
    }
}

/// Map one character of a long name into the short-name alphabet.
/// Returns `None` for characters that are dropped entirely.
fn short_char(c: char) -> Option<u8> {
    if c == ' ' || c == '.' {
        return None;
    }
    let upper = c.to_ascii_uppercase();
    if upper.is_ascii() && is_valid_83_char(upper as u8) {
        Some(upper as u8)
    } else {
        Some(b'_')
    }
}

/// Generate a unique 8.3 alias for `long_name`.
///
/// The basis name keeps the first 8 usable characters of the stem and 3 of
/// the extension; a `~N` tail is added when characters were lost or when
/// `exists` reports a collision.
pub fn generate_short_name<F>(long_name: &str, exists: F) -> [u8; 11]
where
    F: Fn(&[u8; 11]) -> bool,
{
    let trimmed = long_name.trim_start_matches(|c| c == '.' || c == ' ');
    let (stem, ext) = match trimmed.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (trimmed, ""),
    };

    let stem_chars: Vec<u8> = stem.chars().filter_map(short_char).collect();
    let ext_chars: Vec<u8> = ext.chars().filter_map(short_char).collect();
    let lossy = stem_chars.len() > 8
        || ext_chars.len() > 3
        || stem_chars.len() != stem.chars().count()
        || ext_chars.len() != ext.chars().count()
        || trimmed.len() != long_name.len()
        || stem.contains('.')
        || stem_chars.contains(&b'_') && !stem.contains('_');

    let mut base = stem_chars;
    if base.is_empty() {
        base.push(b'_');
    }

    let mut name = [b' '; 11];
    for (i, &b) in ext_chars.iter().take(3).enumerate() {
        name[8 + i] = b;
    }

    let place_base = |name: &mut [u8; 11], len: usize| {
        name[..8].fill(b' ');
        name[..len].copy_from_slice(&base[..len]);
        if name[0] == DIR_DELETED_MARKER {
            name[0] = DIR_KANJI_E5_ESCAPE;
        }
    };

    if !lossy {
        place_base(&mut name, base.len().min(8));
        if !exists(&name) {
            return name;
        }
    }

    for n in 1u32..=999_999 {
        let tail = format!("~{}", n);
        let keep = base.len().min(8 - tail.len());
        place_base(&mut name, keep);
        name[keep..keep + tail.len()].copy_from_slice(tail.as_bytes());
        if !exists(&name) {
            return name;
        }
    }

    // A directory cannot hold a million aliases of one basis
    place_base(&mut name, base.len().min(6));
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat_common::directory::parse_83_name;

    fn decode(entries: &[[u8; 32]], short: &[u8; 11]) -> Result<Option<String>, String> {
        let mut acc = LfnAccumulator::new();
        for entry in entries {
            acc.push(entry)?;
        }
        acc.finish(short)
    }

    #[test]
    fn test_vfat_entries_needed() {
        assert_eq!(lfn_entries_needed("thirteenchars"), 1);
        assert_eq!(lfn_entries_needed("fourteenchars!"), 2);
        assert_eq!(lfn_entries_needed("twentysixcharactersexactly"), 2);
    }

    #[test]
    fn lfn_records_round_trip() {
        let short = *b"LONGFI~1TXT";
        let name = "Long file name with spaces.txt";
        let entries = create_vfat_lfn_entries(name, &short);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0][LFN_ORD], 0x43);
        assert_eq!(entries[2][LFN_ORD], 0x01);
        assert!(entries.iter().all(|e| e[DIR_ATTR] == 0x0F));
        assert_eq!(decode(&entries, &short).unwrap().as_deref(), Some(name));
    }

    #[test]
    fn lfn_name_is_terminated_then_padded() {
        let entries = create_vfat_lfn_entries("abc", b"ABC        ");
        let units = lfn_fragment(&entries[0]);
        assert_eq!(&units[..4], &[b'a' as u16, b'b' as u16, b'c' as u16, 0x0000]);
        assert!(units[4..].iter().all(|&u| u == 0xFFFF));
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let entries = create_vfat_lfn_entries("Some Name", b"SOMENA~1   ");
        assert!(decode(&entries, b"OTHER   TXT").is_err());
    }

    #[test]
    fn out_of_sequence_records_are_rejected() {
        let entries = create_vfat_lfn_entries("a name that needs three records", b"ANAMET~1   ");
        let shuffled = [entries[0], entries[2], entries[1]];
        assert!(decode(&shuffled, b"ANAMET~1   ").is_err());

        // continuation record without a leading one
        let mut acc = LfnAccumulator::new();
        assert!(acc.push(&entries[1]).is_err());
    }

    #[test]
    fn incomplete_run_is_rejected() {
        let entries = create_vfat_lfn_entries("a name that needs three records", b"ANAMET~1   ");
        assert!(decode(&entries[..2], b"ANAMET~1   ").is_err());
    }

    #[test]
    fn short_name_without_lfn_yields_none() {
        let mut acc = LfnAccumulator::new();
        assert_eq!(acc.finish(b"README  TXT").unwrap(), None);
    }

    #[test]
    fn test_vfat_short_name_generation() {
        let short = generate_short_name("LongFileName.txt", |_| false);
        assert_eq!(parse_83_name(&short, 0), "LONGFI~1.TXT");

        let short = generate_short_name("ReadMe.txt", |_| false);
        assert_eq!(parse_83_name(&short, 0), "README.TXT");

        let short = generate_short_name("my file+1.jpeg", |_| false);
        assert_eq!(parse_83_name(&short, 0), "MYFILE~1.JPE");
    }

    #[test]
    fn numeric_tail_skips_existing_aliases() {
        let taken = [*b"LONGFI~1TXT", *b"LONGFI~2TXT"];
        let short = generate_short_name("LongFileName.txt", |n| taken.contains(n));
        assert_eq!(&short, b"LONGFI~3TXT");

        let short = generate_short_name("ReadMe.txt", |n| n == b"README  TXT");
        assert_eq!(&short, b"README~1TXT");
    }
}

// FAT32 directory tables: 32-byte record codec, table editing and the in-memory tree
// The tree is an arena; nodes refer to their parent by index for path reconstruction only

use crate::fat_common::attributes::*;
use crate::fat_common::*;
use byteorder::{ByteOrder, LittleEndian};
use chrono::{NaiveDate, NaiveDateTime};
use fat32mgr_core::VolumeError;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::VecDeque;

/// Sort precedence of directory entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EntryKind {
    VolumeLabel,
    SpecialDirectory,
    Directory,
    File,
}

/// One live (or deleted) directory entry with its long-name records
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub short_name: String,
    #[serde(skip)]
    pub raw_short_name: [u8; 11],
    pub attributes: u8,
    pub kind: EntryKind,
    pub size: u32,
    pub first_cluster: u32,
    /// First slot of the entry's record run (its first LFN record, if any)
    pub index: usize,
    /// LFN records plus the short record
    pub slot_count: usize,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub accessed: Option<NaiveDate>,
}

impl DirEntry {
    /// Slot holding the short record
    pub fn short_slot(&self) -> usize {
        self.index + self.slot_count - 1
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Whether `name` refers to this entry (case-insensitive, long or short name)
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.name.to_lowercase() == name.to_lowercase()
            || self.short_name.eq_ignore_ascii_case(name)
    }
}

fn kind_of(attributes: u8, raw_name: &[u8; 11]) -> EntryKind {
    if attributes & ATTR_VOLUME_ID != 0 {
        EntryKind::VolumeLabel
    } else if attributes & ATTR_DIRECTORY != 0 {
        if raw_name == b".          " || raw_name == b"..         " {
            EntryKind::SpecialDirectory
        } else {
            EntryKind::Directory
        }
    } else {
        EntryKind::File
    }
}

pub fn record_first_cluster(record: &[u8]) -> u32 {
    let hi = LittleEndian::read_u16(&record[DIR_FST_CLUS_HI..]) as u32;
    let lo = LittleEndian::read_u16(&record[DIR_FST_CLUS_LO..]) as u32;
    (hi << 16) | lo
}

pub fn set_record_first_cluster(record: &mut [u8], cluster: u32) {
    LittleEndian::write_u16(&mut record[DIR_FST_CLUS_HI..], (cluster >> 16) as u16);
    LittleEndian::write_u16(&mut record[DIR_FST_CLUS_LO..], cluster as u16);
}

pub fn set_record_modified(record: &mut [u8], modified: &NaiveDateTime) {
    let (date, time, _) = encode_fat_datetime(modified);
    LittleEndian::write_u16(&mut record[DIR_WRT_TIME..], time);
    LittleEndian::write_u16(&mut record[DIR_WRT_DATE..], date);
}

fn raw_name(record: &[u8]) -> [u8; 11] {
    let mut name = [0u8; 11];
    name.copy_from_slice(&record[DIR_NAME..DIR_NAME + 11]);
    name
}

/// Decode the short record at `record`, given the long name that preceded it
fn decode_record(
    record: &[u8],
    long_name: Option<String>,
    index: usize,
    slot_count: usize,
    fix_dates: bool,
) -> DirEntry {
    let raw = raw_name(record);
    let attributes = record[DIR_ATTR];
    let kind = kind_of(attributes, &raw);
    let case_flags = record[DIR_NT_RES];

    let short_name = if kind == EntryKind::VolumeLabel {
        parse_volume_label(&raw)
    } else {
        parse_83_name(&raw, 0)
    };
    let name = match long_name {
        Some(name) => name,
        None if kind == EntryKind::VolumeLabel => short_name.clone(),
        None => parse_83_name(&raw, case_flags),
    };

    let read16 = |offset| LittleEndian::read_u16(&record[offset..]);
    let modified = decode_fat_datetime(read16(DIR_WRT_DATE), read16(DIR_WRT_TIME), 0, fix_dates);
    let (created, accessed, first_cluster) = if kind == EntryKind::VolumeLabel {
        (None, None, 0)
    } else {
        (
            decode_fat_datetime(read16(DIR_CRT_DATE), read16(DIR_CRT_TIME), record[DIR_CRT_TIME_TENTH], fix_dates),
            decode_fat_date(read16(DIR_LST_ACC_DATE), fix_dates),
            record_first_cluster(record),
        )
    };

    DirEntry {
        name,
        short_name,
        raw_short_name: raw,
        attributes,
        kind,
        size: if kind == EntryKind::File {
            LittleEndian::read_u32(&record[DIR_FILE_SIZE..])
        } else {
            0
        },
        first_cluster,
        index,
        slot_count,
        created,
        modified,
        accessed,
    }
}

/// Parse the live entries of a directory table.
///
/// Stops at the first record starting with 0x00, skips deleted records and
/// attaches long names to the short record that follows them.
pub fn parse_table(data: &[u8], path: &str, fix_dates: bool) -> Result<Vec<DirEntry>, VolumeError> {
    let mut entries = Vec::new();
    let mut lfn = LfnAccumulator::new();
    let mut lfn_start = 0;
    let invalid = |index: usize, reason: String| VolumeError::InvalidEntry {
        path: path.to_string(),
        index,
        reason,
    };

    for (index, record) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
        match record[DIR_NAME] {
            DIR_END_MARKER => break,
            DIR_DELETED_MARKER => {
                if lfn.is_active() {
                    return Err(invalid(index, "long name interrupted by a deleted record".to_string()));
                }
                continue;
            }
            _ => {}
        }

        if record[DIR_ATTR] == ATTR_LONG_NAME {
            if !lfn.is_active() {
                if record[LFN_ORD] & LFN_LAST_ENTRY_FLAG == 0 {
                    return Err(invalid(index, "first record of a long name expected".to_string()));
                }
                lfn_start = index;
            }
            lfn.push(record).map_err(|reason| invalid(index, reason))?;
            continue;
        }

        let had_lfn = lfn.is_active();
        let long_name = lfn.finish(&raw_name(record)).map_err(|reason| invalid(index, reason))?;
        let start = if had_lfn { lfn_start } else { index };
        entries.push(decode_record(record, long_name, start, index - start + 1, fix_dates));
    }

    if lfn.is_active() {
        return Err(invalid(entries.len(), "long name without a short record".to_string()));
    }
    Ok(entries)
}

/// Deleted entries still present in a directory table.
/// The lost first character of the short name is shown as '?'.
pub fn parse_deleted(data: &[u8], fix_dates: bool) -> Vec<DirEntry> {
    let mut deleted = Vec::new();
    let mut fragments: VecDeque<String> = VecDeque::new();
    let mut run_start = 0;

    for (index, record) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
        match record[DIR_NAME] {
            DIR_END_MARKER => break,
            DIR_DELETED_MARKER => {}
            _ => {
                fragments.clear();
                continue;
            }
        }

        if record[DIR_ATTR] == ATTR_LONG_NAME {
            if fragments.is_empty() {
                run_start = index;
            }
            let units: Vec<u16> = long_names::lfn_fragment(record)
                .iter()
                .copied()
                .take_while(|&u| u != 0x0000 && u != 0xFFFF)
                .collect();
            fragments.push_front(String::from_utf16_lossy(&units));
            continue;
        }

        let long_name = if fragments.is_empty() {
            None
        } else {
            Some(fragments.drain(..).collect::<String>())
        };
        let start = if long_name.is_some() { run_start } else { index };
        let mut entry = decode_record(record, long_name.clone(), start, index - start + 1, fix_dates);

        let mut raw = entry.raw_short_name;
        raw[0] = b'?';
        entry.short_name = parse_83_name(&raw, 0);
        if long_name.is_none() {
            entry.name = parse_83_name(&raw, record[DIR_NT_RES]);
        }
        deleted.push(entry);
    }
    deleted
}

/// Build the short record of a new entry
pub fn build_short_record(
    short_name: &[u8; 11],
    case_flags: u8,
    attributes: u8,
    first_cluster: u32,
    size: u32,
    timestamp: &NaiveDateTime,
) -> [u8; 32] {
    let mut record = [0u8; 32];
    record[DIR_NAME..DIR_NAME + 11].copy_from_slice(short_name);
    record[DIR_ATTR] = attributes;
    record[DIR_NT_RES] = case_flags;

    let (date, time, centis) = encode_fat_datetime(timestamp);
    record[DIR_CRT_TIME_TENTH] = centis;
    LittleEndian::write_u16(&mut record[DIR_CRT_TIME..], time);
    LittleEndian::write_u16(&mut record[DIR_CRT_DATE..], date);
    LittleEndian::write_u16(&mut record[DIR_LST_ACC_DATE..], date);
    LittleEndian::write_u16(&mut record[DIR_WRT_TIME..], time);
    LittleEndian::write_u16(&mut record[DIR_WRT_DATE..], date);
    set_record_first_cluster(&mut record, first_cluster);
    LittleEndian::write_u32(&mut record[DIR_FILE_SIZE..], size);
    record
}

/// Check a name for use as a long name
pub fn validate_name(name: &str) -> Result<(), VolumeError> {
    const FORBIDDEN: &str = "\"*/:<>?\\|";
    if name.is_empty() || name == "." || name == ".." {
        return Err(VolumeError::InvalidInput(format!("invalid name: {:?}", name)));
    }
    if name.encode_utf16().count() > MAX_LFN_LENGTH {
        return Err(VolumeError::InvalidInput(format!(
            "name longer than {} characters",
            MAX_LFN_LENGTH
        )));
    }
    if let Some(c) = name.chars().find(|&c| c < ' ' || FORBIDDEN.contains(c)) {
        return Err(VolumeError::InvalidInput(format!("invalid character {:?} in name {:?}", c, name)));
    }
    if name.ends_with(' ') || name.ends_with('.') {
        return Err(VolumeError::InvalidInput(format!("name must not end with a space or dot: {:?}", name)));
    }
    Ok(())
}

/// Record run (LFN records, then the short record) naming `name` in a
/// directory that already holds `existing`
pub fn name_records(name: &str, existing: &[DirEntry], short_template: &[u8; 32]) -> Vec<[u8; 32]> {
    let mut short = *short_template;
    let (short_name, case_flags, long) = match short_name_fit(name) {
        Some((short_name, flags)) if !existing.iter().any(|e| e.raw_short_name == short_name) => {
            (short_name, flags, false)
        }
        _ => {
            let alias = generate_short_name(name, |candidate| existing.iter().any(|e| &e.raw_short_name == candidate));
            (alias, 0, true)
        }
    };
    short[DIR_NAME..DIR_NAME + 11].copy_from_slice(&short_name);
    short[DIR_NT_RES] = case_flags;

    let mut records = if long {
        create_vfat_lfn_entries(name, &short_name)
    } else {
        Vec::new()
    };
    records.push(short);
    records
}

/// Ordering used by the sort operation: kind first, then name
pub fn compare_entries(a: &DirEntry, b: &DirEntry, ignore_case: bool) -> Ordering {
    a.kind.cmp(&b.kind).then_with(|| {
        if ignore_case {
            a.name
                .to_uppercase()
                .cmp(&b.name.to_uppercase())
                .then_with(|| a.name.cmp(&b.name))
        } else {
            a.name.cmp(&b.name)
        }
    })
}

/// Entries reordered for sorting; the sort is stable
pub fn sorted_entries(entries: &[DirEntry], ignore_case: bool) -> Vec<DirEntry> {
    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| compare_entries(a, b, ignore_case));
    sorted
}

/// Raw records of one directory, read from its whole cluster chain
#[derive(Debug, Clone)]
pub struct DirTable {
    pub clusters: Vec<u32>,
    pub data: Vec<u8>,
}

impl DirTable {
    pub fn slot_count(&self) -> usize {
        self.data.len() / DIR_ENTRY_SIZE
    }

    pub fn slot(&self, index: usize) -> &[u8] {
        &self.data[index * DIR_ENTRY_SIZE..(index + 1) * DIR_ENTRY_SIZE]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.data[index * DIR_ENTRY_SIZE..(index + 1) * DIR_ENTRY_SIZE]
    }

    /// Index of the end-of-directory record (or the slot count)
    pub fn end_index(&self) -> usize {
        (0..self.slot_count())
            .find(|&i| self.slot(i)[DIR_NAME] == DIR_END_MARKER)
            .unwrap_or_else(|| self.slot_count())
    }

    /// First run of `count` reusable slots
    pub fn find_space(&self, count: usize) -> Option<usize> {
        let end = self.end_index();
        let mut run = 0;
        for i in 0..self.slot_count() {
            if i >= end || self.slot(i)[DIR_NAME] == DIR_DELETED_MARKER {
                run += 1;
                if run == count {
                    return Some(i + 1 - count);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Reusable slots at the very end of the table
    pub fn trailing_free(&self) -> usize {
        let end = self.end_index();
        (0..self.slot_count())
            .rev()
            .take_while(|&i| i >= end || self.slot(i)[DIR_NAME] == DIR_DELETED_MARKER)
            .count()
    }

    /// Store `records` in free slots; `None` when the table must grow first
    pub fn insert(&mut self, records: &[[u8; 32]]) -> Option<usize> {
        let end = self.end_index();
        let at = self.find_space(records.len())?;
        for (i, record) in records.iter().enumerate() {
            self.slot_mut(at + i).copy_from_slice(record);
        }
        // Keep the table terminated after records written past the old end
        let after = at + records.len();
        if after > end && after < self.slot_count() {
            self.slot_mut(after).fill(0);
        }
        Some(at)
    }

    pub fn mark_deleted(&mut self, index: usize, count: usize) {
        for i in index..index + count {
            self.slot_mut(i)[DIR_NAME] = DIR_DELETED_MARKER;
        }
    }

    /// Rewrite the table to hold exactly `entries` in the given order, zero-filling the rest
    pub fn rewrite(&mut self, entries: &[DirEntry]) {
        let mut out = vec![0u8; self.data.len()];
        let mut at = 0;
        for entry in entries {
            let from = entry.index * DIR_ENTRY_SIZE;
            let len = entry.slot_count * DIR_ENTRY_SIZE;
            out[at..at + len].copy_from_slice(&self.data[from..from + len]);
            at += len;
        }
        self.data = out;
    }

    /// Append a zeroed cluster
    pub fn extend(&mut self, cluster: u32, cluster_size: usize) {
        self.clusters.push(cluster);
        self.data.resize(self.data.len() + cluster_size, 0);
    }
}

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct DirNode {
    /// Entry in the parent directory; `None` for the root
    pub entry: Option<DirEntry>,
    pub first_cluster: u32,
    pub parent: Option<NodeId>,
    /// Every parsed entry of this directory, in table order
    pub entries: Vec<DirEntry>,
    /// Nodes for the files and subdirectories among `entries`
    pub children: Vec<NodeId>,
    pub loaded: bool,
}

impl DirNode {
    pub fn name(&self) -> &str {
        self.entry.as_ref().map_or("", |e| e.name.as_str())
    }

    pub fn is_directory(&self) -> bool {
        self.entry.as_ref().map_or(true, |e| e.is_directory())
    }
}

/// Arena of directory nodes materialized on demand
#[derive(Debug, Clone)]
pub struct DirectoryTree {
    nodes: Vec<Option<DirNode>>,
    free: Vec<NodeId>,
}

impl DirectoryTree {
    pub const ROOT: NodeId = 0;

    pub fn new(root_cluster: u32) -> Self {
        Self {
            nodes: vec![Some(DirNode {
                entry: None,
                first_cluster: root_cluster,
                parent: None,
                entries: Vec::new(),
                children: Vec::new(),
                loaded: false,
            })],
            free: Vec::new(),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&DirNode> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    pub fn node(&self, id: NodeId) -> Result<&DirNode, VolumeError> {
        self.get(id)
            .ok_or_else(|| VolumeError::NotFound(format!("directory node {}", id)))
    }

    fn alloc(&mut self, node: DirNode) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release_children(&mut self, id: NodeId) {
        let children = match self.nodes.get_mut(id).and_then(|n| n.as_mut()) {
            Some(node) => std::mem::take(&mut node.children),
            None => return,
        };
        for child in children {
            self.release_children(child);
            self.nodes[child] = None;
            self.free.push(child);
        }
    }

    /// Replace the parsed contents of directory `id`
    pub fn set_entries(&mut self, id: NodeId, entries: Vec<DirEntry>) {
        self.release_children(id);
        let children: Vec<NodeId> = entries
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::Directory | EntryKind::File))
            .cloned()
            .map(|entry| {
                self.alloc(DirNode {
                    first_cluster: entry.first_cluster,
                    entry: Some(entry),
                    parent: Some(id),
                    entries: Vec::new(),
                    children: Vec::new(),
                    loaded: false,
                })
            })
            .collect();
        if let Some(node) = self.nodes.get_mut(id).and_then(|n| n.as_mut()) {
            node.entries = entries;
            node.children = children;
            node.loaded = true;
        }
    }

    /// Forget the contents of `id` so they are read again on next use
    pub fn invalidate(&mut self, id: NodeId) {
        self.release_children(id);
        if let Some(node) = self.nodes.get_mut(id).and_then(|n| n.as_mut()) {
            node.entries.clear();
            node.loaded = false;
        }
    }

    pub fn find_child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        let node = self.get(id)?;
        node.children.iter().copied().find(|&child| {
            self.get(child)
                .and_then(|c| c.entry.as_ref())
                .map_or(false, |e| e.matches(name))
        })
    }

    /// Pathname of `id`, "/" for the root
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current.and_then(|i| self.get(i)) {
            if node.entry.is_some() {
                parts.push(node.name().to_string());
            }
            current = node.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// True if `ancestor` is `id` or one of its ancestors
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(i) = current {
            if i == ancestor {
                return true;
            }
            current = self.get(i).and_then(|n| n.parent);
        }
        false
    }
}

/// Join a directory path and an entry name
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Split "/a/b/c" into ("/a/b", "c")
pub fn split_path(path: &str) -> Result<(String, String), VolumeError> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => {
            let parent = if parent.is_empty() { "/" } else { parent };
            Ok((parent.to_string(), name.to_string()))
        }
        None if !trimmed.is_empty() => Ok(("/".to_string(), trimmed.to_string())),
        _ => Err(VolumeError::InvalidInput(format!("path has no final component: {:?}", path))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(12, 0, 0).unwrap()
    }

    fn table_with(records: &[[u8; 32]]) -> Vec<u8> {
        let mut data = vec![0u8; 16 * DIR_ENTRY_SIZE];
        for (i, r) in records.iter().enumerate() {
            data[i * 32..(i + 1) * 32].copy_from_slice(r);
        }
        data
    }

    fn file(name: &[u8; 11], cluster: u32, size: u32) -> [u8; 32] {
        build_short_record(name, 0, ATTR_ARCHIVE, cluster, size, &ts())
    }

    #[test]
    fn parses_short_entries_and_stops_at_end_marker() {
        let mut deleted = file(b"GONE    TXT", 9, 10);
        deleted[0] = DIR_DELETED_MARKER;
        let mut label = [0u8; 32];
        label[..11].copy_from_slice(b"MY DISK    ");
        label[DIR_ATTR] = ATTR_VOLUME_ID;

        let mut data = table_with(&[label, file(b"A       TXT", 3, 100), deleted, file(b"B       BIN", 4, 5)]);
        // garbage after the end marker is ignored
        data[6 * 32..7 * 32].copy_from_slice(&file(b"GHOST      ", 5, 1));

        let entries = parse_table(&data, "/", false).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntryKind::VolumeLabel);
        assert_eq!(entries[0].name, "MY DISK");
        assert_eq!(entries[1].name, "A.TXT");
        assert_eq!(entries[1].size, 100);
        assert_eq!(entries[1].first_cluster, 3);
        assert_eq!(entries[1].modified, Some(ts()));
        assert_eq!(entries[2].name, "B.BIN");
        assert_eq!(entries[2].index, 3);
    }

    #[test]
    fn long_names_are_attached() {
        let existing = Vec::new();
        let template = file(b"           ", 7, 42);
        let records = name_records("Quarterly report.pdf", &existing, &template);
        assert_eq!(records.len(), 3);

        let data = table_with(&records);
        let entries = parse_table(&data, "/", false).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Quarterly report.pdf");
        assert_eq!(entries[0].short_name, "QUARTE~1.PDF");
        assert_eq!(entries[0].index, 0);
        assert_eq!(entries[0].slot_count, 3);
        assert_eq!(entries[0].first_cluster, 7);
    }

    #[test]
    fn lowercase_names_use_case_bits() {
        let records = name_records("notes.txt", &[], &file(b"           ", 0, 0));
        assert_eq!(records.len(), 1);
        let entries = parse_table(&table_with(&records), "/", false).unwrap();
        assert_eq!(entries[0].name, "notes.txt");
        assert_eq!(entries[0].short_name, "NOTES.TXT");
    }

    #[test]
    fn bad_lfn_sequence_is_an_invalid_entry() {
        let records = name_records("A rather long file name.txt", &[], &file(b"           ", 0, 0));
        // drop the leading record
        let data = table_with(&records[1..]);
        match parse_table(&data, "/DOCS", false) {
            Err(VolumeError::InvalidEntry { path, index, .. }) => {
                assert_eq!(path, "/DOCS");
                assert_eq!(index, 0);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // checksum mismatch
        let mut records = records;
        let last = records.len() - 1;
        records[last][0] = b'Z';
        assert!(parse_table(&table_with(&records), "/", false).is_err());
    }

    #[test]
    fn deleted_entries_show_question_mark() {
        let mut gone = file(b"REPORT  DOC", 9, 10);
        gone[0] = DIR_DELETED_MARKER;
        let data = table_with(&[file(b"KEEP    TXT", 3, 1), gone]);
        let deleted = parse_deleted(&data, false);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name, "?EPORT.DOC");
        assert_eq!(deleted[0].index, 1);
    }

    #[test]
    fn sort_order_kind_then_name() {
        let dir = build_short_record(b"ZDIR       ", 0, ATTR_DIRECTORY, 5, 0, &ts());
        let dot = build_short_record(b".          ", 0, ATTR_DIRECTORY, 6, 0, &ts());
        let data = table_with(&[file(b"B       TXT", 3, 1), dir, file(b"A       TXT", 4, 1), dot]);
        let entries = parse_table(&data, "/", false).unwrap();
        let names: Vec<_> = sorted_entries(&entries, false).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec![".", "ZDIR", "A.TXT", "B.TXT"]);
    }

    #[test]
    fn ignore_case_sorting() {
        let records_a = name_records("apple", &[], &file(b"           ", 0, 0));
        let records_b = name_records("Banana", &[], &file(b"           ", 0, 0));
        let mut all = records_b.clone();
        all.extend(records_a);
        let entries = parse_table(&table_with(&all), "/", false).unwrap();

        let ordinal: Vec<_> = sorted_entries(&entries, false).into_iter().map(|e| e.name).collect();
        assert_eq!(ordinal, vec!["Banana", "apple"]);
        let folded: Vec<_> = sorted_entries(&entries, true).into_iter().map(|e| e.name).collect();
        assert_eq!(folded, vec!["apple", "Banana"]);
    }

    #[test]
    fn table_insert_reuses_deleted_slots_and_terminates() {
        let mut deleted = file(b"OLD     TXT", 9, 10);
        deleted[0] = DIR_DELETED_MARKER;
        let mut table = DirTable {
            clusters: vec![2],
            data: table_with(&[file(b"A       TXT", 3, 1), deleted, file(b"B       TXT", 4, 1)]),
        };
        assert_eq!(table.insert(&[file(b"C       TXT", 5, 1)]), Some(1));
        // two slots do not fit in the hole, go after the last entry
        let at = table.insert(&[file(b"D       TXT", 6, 1), file(b"E       TXT", 7, 1)]).unwrap();
        assert_eq!(at, 3);
        assert_eq!(table.end_index(), 5);

        let mut full = DirTable {
            clusters: vec![2],
            data: table_with(&[file(b"A       TXT", 3, 1)])[..32].to_vec(),
        };
        assert_eq!(full.insert(&[file(b"B       TXT", 4, 1)]), None);
        full.extend(9, 64);
        assert_eq!(full.insert(&[file(b"B       TXT", 4, 1)]), Some(1));
    }

    #[test]
    fn rewrite_drops_deleted_records() {
        let mut deleted = file(b"OLD     TXT", 9, 10);
        deleted[0] = DIR_DELETED_MARKER;
        let mut table = DirTable {
            clusters: vec![2],
            data: table_with(&[file(b"B       TXT", 3, 1), deleted, file(b"A       TXT", 4, 1)]),
        };
        let entries = parse_table(&table.data, "/", false).unwrap();
        let sorted = sorted_entries(&entries, false);
        table.rewrite(&sorted);
        let after = parse_table(&table.data, "/", false).unwrap();
        let names: Vec<_> = after.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A.TXT", "B.TXT"]);
        assert_eq!(table.end_index(), 2);
    }

    #[test]
    fn tree_paths_and_ancestry() {
        let mut tree = DirectoryTree::new(2);
        let sub = build_short_record(b"SUB        ", 0, ATTR_DIRECTORY, 5, 0, &ts());
        let data = table_with(&[sub, file(b"A       TXT", 3, 1)]);
        tree.set_entries(DirectoryTree::ROOT, parse_table(&data, "/", false).unwrap());

        let sub_id = tree.find_child(DirectoryTree::ROOT, "sub").unwrap();
        assert_eq!(tree.path_of(sub_id), "/SUB");
        assert_eq!(tree.path_of(DirectoryTree::ROOT), "/");
        assert!(tree.is_ancestor(DirectoryTree::ROOT, sub_id));
        assert!(!tree.is_ancestor(sub_id, DirectoryTree::ROOT));

        let inner = parse_table(&table_with(&[file(b"X       TXT", 8, 1)]), "/SUB", false).unwrap();
        tree.set_entries(sub_id, inner);
        let x = tree.find_child(sub_id, "x.txt").unwrap();
        assert_eq!(tree.path_of(x), "/SUB/X.TXT");

        tree.invalidate(DirectoryTree::ROOT);
        assert!(tree.get(x).is_none());
        assert!(!tree.node(DirectoryTree::ROOT).unwrap().loaded);
    }

    #[test]
    fn path_splitting() {
        assert_eq!(split_path("/a/b").unwrap(), ("/a".to_string(), "b".to_string()));
        assert_eq!(split_path("/a").unwrap(), ("/".to_string(), "a".to_string()));
        assert_eq!(split_path("a").unwrap(), ("/".to_string(), "a".to_string()));
        assert!(split_path("/").is_err());
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/a", "x"), "/a/x");
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("ok name.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a:b").is_err());
        assert!(validate_name("trailing.").is_err());
    }
}

// Erasing free clusters and compacting deleted directory records

mod common;

use common::*;
use fat32mgr_core::{CancelToken, MemoryDevice, NoOpProgress};
use fat32mgr_filesystems::{EraseScope, Volume};
use std::sync::Arc;

fn cluster_bytes(volume: &Volume<MemoryDevice>, cluster: u32) -> Vec<u8> {
    let size = volume.boot_sector().cluster_size();
    let start = volume.cluster_to_sector(cluster).unwrap() as usize * 512;
    volume.device().as_bytes()[start..start + size].to_vec()
}

#[test]
fn free_clusters_take_the_filler_and_allocated_ones_are_untouched() {
    let mut volume = memory_volume(8);
    volume.create_directory("/docs").unwrap();
    volume.create_file("/docs/keep.txt", &pattern(10_000, 1)).unwrap();
    volume.create_file("/gone.bin", &pattern(20_000, 2)).unwrap();
    volume.create_file("/stay.bin", &pattern(5_000, 3)).unwrap();
    volume.delete("/gone.bin").unwrap();

    let max = volume.fat().max_cluster();
    let allocated: Vec<(u32, Vec<u8>)> = (2..=max)
        .filter(|&c| !volume.fat().is_free(c))
        .map(|c| (c, cluster_bytes(&volume, c)))
        .collect();
    let free_before = volume.fat().free_count() as u64;

    let report = volume
        .erase_unused(&EraseScope::Volume, 0x5A, &CancelToken::new(), Arc::new(NoOpProgress))
        .unwrap();
    assert_eq!(report.clusters_erased, free_before);
    assert!(!report.cancelled);

    for (cluster, before) in &allocated {
        assert_eq!(&cluster_bytes(&volume, *cluster), before, "cluster {}", cluster);
    }
    for cluster in (2..=max).filter(|&c| volume.fat().is_free(c)) {
        assert!(cluster_bytes(&volume, cluster).iter().all(|&b| b == 0x5A), "cluster {}", cluster);
    }
    assert_eq!(volume.read_file("/docs/keep.txt").unwrap(), pattern(10_000, 1));
    assert!(volume.scan_integrity(&CancelToken::new()).unwrap().is_empty());
}

/// /sub holding A.TXT and C.TXT, with B.TXT deleted; returns B's old first cluster
fn directory_with_deleted_file() -> (Volume<MemoryDevice>, u32) {
    let mut volume = memory_volume(8);
    volume.create_directory("/sub").unwrap();
    for name in ["A.TXT", "B.TXT", "C.TXT"] {
        volume.create_file(&format!("/sub/{}", name), name.as_bytes()).unwrap();
    }
    let b = volume.stat("/sub/B.TXT").unwrap().first_cluster;
    volume.delete("/sub/B.TXT").unwrap();
    assert_eq!(volume.find_deleted_entries("/sub").unwrap().len(), 1);
    (volume, b)
}

fn allocated_snapshot(volume: &Volume<MemoryDevice>) -> Vec<(u32, Vec<u8>)> {
    (2..=volume.fat().max_cluster())
        .filter(|&c| !volume.fat().is_free(c))
        .map(|c| (c, cluster_bytes(volume, c)))
        .collect()
}

#[test]
fn directory_scope_fills_only_clusters_left_by_deleted_entries() {
    let (mut volume, b) = directory_with_deleted_file();
    let allocated = allocated_snapshot(&volume);
    let last = volume.fat().max_cluster();
    let untouched = cluster_bytes(&volume, last);

    let scope = EraseScope::Directory {
        path: "/sub".to_string(),
        recursive: false,
    };
    let report = volume
        .erase_unused(&scope, 0x5A, &CancelToken::new(), Arc::new(NoOpProgress))
        .unwrap();
    assert_eq!(report.clusters_erased, 1);
    assert!(cluster_bytes(&volume, b).iter().all(|&x| x == 0x5A));

    // Directory tables and files keep their bytes, the deleted record included
    for (cluster, before) in &allocated {
        assert_eq!(&cluster_bytes(&volume, *cluster), before, "cluster {}", cluster);
    }
    assert_eq!(cluster_bytes(&volume, last), untouched);
    assert_eq!(volume.find_deleted_entries("/sub").unwrap().len(), 1);
    assert_eq!(volume.read_file("/sub/C.TXT").unwrap(), b"C.TXT");
}

#[test]
fn directory_scope_skips_clusters_in_use_again() {
    let (mut volume, b) = directory_with_deleted_file();
    volume.create_file("/D.TXT", b"reused").unwrap();
    assert_eq!(volume.stat("/D.TXT").unwrap().first_cluster, b);
    let allocated = allocated_snapshot(&volume);

    let scope = EraseScope::Directory {
        path: "/".to_string(),
        recursive: true,
    };
    let report = volume
        .erase_unused(&scope, 0x5A, &CancelToken::new(), Arc::new(NoOpProgress))
        .unwrap();
    assert_eq!(report.clusters_erased, 0);
    assert_eq!(allocated_snapshot(&volume), allocated);
    assert_eq!(volume.read_file("/D.TXT").unwrap(), b"reused");
}

#[test]
fn deleted_records_are_compacted_on_request() {
    let (mut volume, _) = directory_with_deleted_file();
    assert_eq!(volume.erase_deleted_entries("/sub", false).unwrap(), 1);
    assert!(volume.find_deleted_entries("/sub").unwrap().is_empty());

    let names: Vec<_> = volume
        .list_directory("/sub")
        .unwrap()
        .into_iter()
        .filter(|e| e.is_file())
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["A.TXT", "C.TXT"]);
    assert_eq!(volume.read_file("/sub/C.TXT").unwrap(), b"C.TXT");
}

#[test]
fn recursive_compaction_reaches_subdirectories() {
    let mut volume = memory_volume(8);
    volume.create_directory("/a").unwrap();
    volume.create_directory("/a/b").unwrap();
    volume.create_file("/X.TXT", b"x").unwrap();
    volume.create_file("/a/b/Y.TXT", b"y").unwrap();
    volume.create_file("/a/b/Z.TXT", b"z").unwrap();
    volume.delete("/X.TXT").unwrap();
    volume.delete("/a/b/Y.TXT").unwrap();

    assert_eq!(volume.erase_deleted_entries("/a", false).unwrap(), 0);
    assert_eq!(volume.erase_deleted_entries("/", true).unwrap(), 2);
    assert!(volume.find_deleted_entries("/").unwrap().is_empty());
    assert!(volume.find_deleted_entries("/a/b").unwrap().is_empty());
    assert_eq!(volume.read_file("/a/b/Z.TXT").unwrap(), b"z");
}

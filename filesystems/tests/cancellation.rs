// Cancellation from another task while long operations run on the blocking pool

mod common;

use common::*;
use fat32mgr_core::{CancelToken, FnProgress, NoOpProgress, OperationProgress, VolumeError};
use fat32mgr_filesystems::{EraseScope, SortOptions};
use std::sync::Arc;

const CLUSTER: usize = 4096;

#[tokio::test]
async fn cancelled_defragment_returns_a_partial_report() {
    let mut volume = memory_volume(8);
    volume.create_file("/A.BIN", &pattern(CLUSTER, 1)).unwrap();
    volume.create_file("/B.BIN", &pattern(CLUSTER, 2)).unwrap();
    volume.delete("/A.BIN").unwrap();
    volume.create_file("/C.BIN", &pattern(2 * CLUSTER, 3)).unwrap();
    let fragmented = volume.fragmented_files("/", true).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let worker = cancel.clone();
    let (report, mut volume) = tokio::task::spawn_blocking(move || {
        let report = volume.defragment("/", true, &worker, Arc::new(NoOpProgress));
        (report, volume)
    })
    .await
    .unwrap();

    let report = report.unwrap();
    assert!(report.cancelled);
    assert!(report.files.is_empty());
    assert_eq!(volume.fragmented_files("/", true).unwrap(), fragmented);
}

#[tokio::test]
async fn erase_stops_between_batches() {
    let mut volume = memory_volume(8);
    let free = volume.fat().free_count() as u64;
    let cancel = CancelToken::new();

    // Cancel from the progress callback once the first batch is written
    let trigger = cancel.clone();
    let progress = Arc::new(FnProgress::new(move |p: &OperationProgress| {
        if p.done > 0 {
            trigger.cancel();
        }
    }));
    let worker = cancel.clone();
    let report = tokio::task::spawn_blocking(move || {
        volume.erase_unused(&EraseScope::Volume, 0xFF, &worker, progress)
    })
    .await
    .unwrap()
    .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.clusters_erased, 256);
    assert!(report.clusters_erased < free);
}

#[tokio::test]
async fn cancelled_scan_is_an_error() {
    let mut volume = memory_volume(8);
    volume.create_file("/A.BIN", b"data").unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = tokio::task::spawn_blocking(move || volume.scan_integrity(&cancel))
        .await
        .unwrap();
    assert!(matches!(result, Err(VolumeError::UserCancelled)));
}

#[test]
fn cancelled_sort_writes_nothing() {
    let mut volume = memory_volume(8);
    volume.create_file("/b.txt", b"b").unwrap();
    volume.create_file("/a.txt", b"a").unwrap();
    let writes = volume.device().write_count();

    let cancel = CancelToken::new();
    let sorted = tokio_test::block_on(async {
        cancel.cancel();
        volume.sort("/", &SortOptions::default(), &cancel)
    });
    assert!(sorted.unwrap_err().is_cancelled());
    assert_eq!(volume.device().write_count(), writes);
}

// Format/mount round trips on memory and file-backed devices

mod common;

use common::*;
use fat32mgr_core::{
    BlockDevice, CancelToken, ClusterAlignment, FileDevice, FormatParams, MemoryDevice, NoOpProgress, VolumeError,
};
use fat32mgr_filesystems::{compute_geometry_auto, EntryKind, Volume};
use std::sync::Arc;
use tempfile::NamedTempFile;

#[test]
fn mount_reports_the_computed_geometry() {
    let params = FormatParams::default();
    for spc in [1, 8, 64] {
        let expected = compute_geometry_auto(SECTORS_64_MIB, &params, Some(spc)).unwrap();
        let device = memory_volume(spc).unmount().unwrap();
        let volume = Volume::mount(device).unwrap();
        let boot = volume.boot_sector();
        assert_eq!(boot.sectors_per_cluster, expected.sectors_per_cluster);
        assert_eq!(boot.reserved_sectors, expected.reserved_sectors);
        assert_eq!(boot.sectors_per_fat, expected.sectors_per_fat);
        assert_eq!(boot.num_fats, expected.num_fats);
        assert_eq!(boot.total_sectors, expected.total_sectors);
        assert_eq!(boot.num_clusters(), expected.num_clusters);
    }
}

#[test]
fn sixty_four_mib_integral_multiple_scenario() {
    init_logging();
    let params = FormatParams {
        bytes_per_sector: 512,
        min_num_sectors: 65536,
        cluster_alignment: ClusterAlignment::IntegralMultiple,
        align_fats_to_clusters: true,
        ..FormatParams::default()
    };
    let mut volume = Volume::format(
        MemoryDevice::new(512, SECTORS_64_MIB),
        &params,
        &fat32mgr_core::FormatOptions::default(),
        &CancelToken::new(),
        Arc::new(NoOpProgress),
    )
    .unwrap();

    let boot = volume.boot_sector().clone();
    assert_eq!(boot.first_data_sector() % boot.sectors_per_cluster as u64, 0);
    assert_eq!(boot.sectors_per_fat % boot.sectors_per_cluster, 0);
    assert_eq!(boot.label(), "NO NAME");
    assert!(volume.list_directory("/").unwrap().is_empty());
    assert!(volume.scan_integrity(&CancelToken::new()).unwrap().is_empty());
}

#[test]
fn boot_region_is_backed_up() {
    let device = memory_volume(8).unmount().unwrap();
    let bytes = device.as_bytes();
    assert_eq!(&bytes[0..3], &[0xEB, 0x58, 0x90]);
    assert_eq!(&bytes[510..512], &[0x55, 0xAA]);
    assert_eq!(&bytes[2 * 512 + 510..2 * 512 + 512], &[0x55, 0xAA]);
    assert_eq!(&bytes[0..512], &bytes[6 * 512..7 * 512]);
    assert_eq!(&bytes[1024..1536], &bytes[8 * 512..9 * 512]);
}

#[test]
fn file_backed_image_survives_reopen() {
    init_logging();
    let image = NamedTempFile::new().unwrap();
    image.as_file().set_len(SECTORS_64_MIB * 512).unwrap();

    let device = FileDevice::open(image.path(), 512).unwrap();
    let mut volume = Volume::format(
        device,
        &FormatParams::default(),
        &options(8),
        &CancelToken::new(),
        Arc::new(NoOpProgress),
    )
    .unwrap();
    volume.create_directory("/photos").unwrap();
    volume.create_file("/photos/Holiday 2023.jpg", &pattern(50_000, 9)).unwrap();
    volume.unmount().unwrap();

    let mut volume = Volume::mount(FileDevice::open(image.path(), 512).unwrap()).unwrap();
    assert_eq!(volume.info().label, "TEST");
    let photos = volume.list_directory("/photos").unwrap();
    let names: Vec<_> = photos
        .iter()
        .filter(|e| e.kind == EntryKind::File)
        .map(|e| e.name.as_str())
        .collect();
    assert_eq!(names, vec!["Holiday 2023.jpg"]);
    assert_eq!(volume.read_file("/photos/holiday 2023.jpg").unwrap(), pattern(50_000, 9));
}

#[test]
fn garbage_is_not_mountable() {
    let mut device = MemoryDevice::new(512, 1024);
    device.write_sector(0, &[0x42; 512]).unwrap();
    assert!(matches!(Volume::mount(device), Err(VolumeError::VolumeFormat(_))));
}

#[test]
fn sector_size_must_match_the_device() {
    let image = memory_volume(8).unmount().unwrap().into_bytes();
    let device = MemoryDevice::from_bytes(image, 1024);
    assert!(matches!(Volume::mount(device), Err(VolumeError::VolumeFormat(_))));
}

#[test]
fn write_fault_surfaces_sector_and_rolls_back() {
    let volume = memory_volume(8);
    let cluster = volume.fat().first_free().unwrap();
    let sector = volume.cluster_to_sector(cluster).unwrap();
    let free = volume.fat().free_count();

    let mut device = volume.unmount().unwrap();
    device.fail_writes_to(Some(sector));
    let mut volume = Volume::mount(device).unwrap();

    match volume.create_file("/doomed.bin", &pattern(4096, 1)) {
        Err(VolumeError::Io { sector: failed, .. }) => assert_eq!(failed, sector),
        other => panic!("expected an IO error, got {:?}", other),
    }
    assert_eq!(volume.fat().free_count(), free);
    assert!(matches!(volume.stat("/doomed.bin"), Err(VolumeError::NotFound(_))));
}

#[test]
fn full_volume_reports_capacity() {
    let mut volume = memory_volume(64);
    let free = volume.fat().free_count() as usize;
    let too_big = vec![0u8; (free + 1) * 32 * 1024];
    assert!(matches!(volume.create_file("/huge.bin", &too_big), Err(VolumeError::Capacity(_))));
    assert_eq!(volume.fat().free_count() as usize, free);
}

// FAT32 formatter: computes a geometry and writes a fresh, empty volume
// The boot region is written last so an interrupted format never mounts

use super::boot_sector::{create_fsinfo_sector, create_signature_sector, BootSector};
use super::directory::build_short_record;
use super::volume::{MountOptions, Volume};
use crate::fat_common::attributes::ATTR_VOLUME_ID;
use crate::fat_common::*;
use fat32mgr_core::{
    BlockDevice, CancelToken, FormatOptions, FormatParams, ProgressCallback, ProgressReporter, VolumeError,
};
use log::{debug, info};
use serde::Serialize;
use std::io;
use std::sync::Arc;

/// Largest single write while zero-filling
const ZERO_CHUNK_BYTES: usize = 1024 * 1024;

/// What `format` would do, computed without touching the device
#[derive(Debug, Clone, Serialize)]
pub struct FormatReport {
    pub geometry: Geometry,
    pub num_clusters: u32,
    pub usable_bytes: u64,
    pub warnings: Vec<String>,
}

fn label_bytes(options: &FormatOptions) -> Result<Option<[u8; 11]>, VolumeError> {
    match options.label.as_deref().map(str::trim) {
        Some(label) if !label.is_empty() => format_volume_label(label).map(Some),
        _ => Ok(None),
    }
}

/// Geometry and warnings for formatting `num_sectors` sectors
pub fn simulate_format(
    num_sectors: u64,
    params: &FormatParams,
    options: &FormatOptions,
) -> Result<FormatReport, VolumeError> {
    label_bytes(options)?;
    let geometry = compute_geometry_auto(num_sectors, params, options.sectors_per_cluster)?;

    let mut warnings = Vec::new();
    if let Some(requested) = options.sectors_per_cluster {
        if requested != geometry.sectors_per_cluster {
            warnings.push(format!(
                "{} sectors per cluster is not valid for this device; using {}",
                requested, geometry.sectors_per_cluster
            ));
        }
    }
    let unused = num_sectors - geometry.total_sectors as u64;
    if unused > 0 {
        warnings.push(format!("{} sectors at the end of the device will not be used", unused));
    }
    if geometry.num_clusters < 65525 {
        warnings.push(format!(
            "only {} clusters; some systems treat volumes with fewer than 65525 clusters as FAT16",
            geometry.num_clusters
        ));
    }

    Ok(FormatReport {
        num_clusters: geometry.num_clusters,
        usable_bytes: geometry.data_bytes(),
        geometry,
        warnings,
    })
}

fn write_zeros<D: BlockDevice>(device: &mut D, start: u64, count: u64, sector_size: usize) -> Result<(), VolumeError> {
    let per_chunk = (ZERO_CHUNK_BYTES / sector_size) as u64;
    let zeros = vec![0u8; per_chunk.min(count.max(1)) as usize * sector_size];
    let mut done = 0;
    while done < count {
        let n = per_chunk.min(count - done);
        device.write_sectors(start + done, &zeros[..n as usize * sector_size])?;
        done += n;
    }
    Ok(())
}

/// Write two patterns to `sector` and read each back
fn verify_sector<D: BlockDevice>(device: &mut D, sector: u64, sector_size: usize) -> Result<(), VolumeError> {
    let mut readback = vec![0u8; sector_size];
    for pattern in [0xAAu8, 0x00] {
        let data = vec![pattern; sector_size];
        device.write_sector(sector, &data)?;
        device.flush()?;
        device.read_sector(sector, &mut readback)?;
        if readback != data {
            return Err(VolumeError::io(
                sector,
                io::Error::new(io::ErrorKind::Other, format!("pattern 0x{:02X} did not read back", pattern)),
            ));
        }
    }
    Ok(())
}

impl<D: BlockDevice> Volume<D> {
    /// Write a new FAT32 volume over the whole device and mount it
    pub fn format(
        mut device: D,
        params: &FormatParams,
        options: &FormatOptions,
        cancel: &CancelToken,
        progress: Arc<dyn ProgressCallback>,
    ) -> Result<Self, VolumeError> {
        params.validate()?;
        let sector_size = device.sector_size();
        if sector_size != params.bytes_per_sector as usize {
            return Err(VolumeError::InvalidInput(format!(
                "device sector size {} does not match the requested {} bytes per sector",
                sector_size, params.bytes_per_sector
            )));
        }
        let label = label_bytes(options)?;
        let geometry = compute_geometry_auto(device.num_sectors(), params, options.sectors_per_cluster)?;
        info!(
            "FAT32 geometry: {} sectors, {} sectors/cluster, {} reserved, {} sectors/FAT, {} clusters",
            geometry.total_sectors,
            geometry.sectors_per_cluster,
            geometry.reserved_sectors,
            geometry.sectors_per_fat,
            geometry.num_clusters
        );

        let boot = BootSector::for_geometry(
            &geometry,
            &params.formatter_name,
            options.volume_id.unwrap_or_else(generate_volume_serial),
            label.unwrap_or(*NO_NAME_LABEL),
            options.hidden_sectors,
        );
        let header_sectors = geometry.first_data_sector() as u64;
        let total = header_sectors + geometry.sectors_per_cluster as u64 + 1;
        let mut reporter = ProgressReporter::new("format", total, progress);

        // Reserved region
        cancel.check()?;
        write_zeros(&mut device, 0, geometry.reserved_sectors as u64, sector_size)?;
        reporter.report("reserved sectors", geometry.reserved_sectors as u64);

        // FAT copies
        let mut first_fat_sector = vec![0u8; sector_size];
        init_fat32_table(&mut first_fat_sector, boot.media_descriptor, boot.root_cluster);
        for fat_index in 0..geometry.num_fats {
            cancel.check()?;
            let start = geometry.fat_start_sector(fat_index) as u64;
            write_zeros(&mut device, start, geometry.sectors_per_fat as u64, sector_size)?;
            device.write_sector(start, &first_fat_sector)?;
            reporter.report(
                format!("FAT {}", fat_index + 1),
                geometry.fat_start_sector(fat_index + 1) as u64,
            );
        }
        debug!("Wrote {} FAT copies", geometry.num_fats);

        // Root directory, holding only the label entry
        cancel.check()?;
        let mut root = vec![0u8; geometry.cluster_size() as usize];
        if let Some(label) = label {
            let record = build_short_record(&label, 0, ATTR_VOLUME_ID, 0, 0, &current_fat_datetime());
            root[..DIR_ENTRY_SIZE].copy_from_slice(&record);
        }
        device.write_sectors(header_sectors, &root)?;
        reporter.report("root directory", header_sectors + geometry.sectors_per_cluster as u64);

        cancel.check()?;
        verify_sector(&mut device, geometry.total_sectors as u64 - 1, sector_size)?;
        debug!("Verified last sector {}", geometry.total_sectors - 1);

        // Boot region and its backup
        let boot_sector = boot.to_bytes();
        let fsinfo = create_fsinfo_sector(sector_size);
        let signature = create_signature_sector(sector_size);
        for base in [0u64, boot.backup_boot_sector as u64] {
            device.write_sector(base, &boot_sector)?;
            device.write_sector(base + boot.fs_info_sector as u64, &fsinfo)?;
            device.write_sector(base + 2, &signature)?;
        }
        device.flush()?;
        reporter.complete();

        info!(
            "Formatted FAT32 volume \"{}\" ({} bytes usable)",
            boot.label(),
            geometry.data_bytes()
        );
        Volume::mount_with(device, MountOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fat32mgr_core::MemoryDevice;

    #[test]
    fn simulation_reports_geometry_without_writes() {
        let params = FormatParams::default();
        let report = simulate_format(131072, &params, &FormatOptions::default()).unwrap();
        assert_eq!(report.geometry.sectors_per_cluster, 8);
        assert_eq!(report.num_clusters, report.geometry.num_clusters);
        assert_eq!(report.usable_bytes, report.num_clusters as u64 * 4096);
        assert!(report.warnings.iter().any(|w| w.contains("FAT16")));
    }

    #[test]
    fn too_small_device_is_a_capacity_error() {
        let device = MemoryDevice::new(512, 1000);
        let result = Volume::format(
            device,
            &FormatParams::default(),
            &FormatOptions::default(),
            &CancelToken::new(),
            Arc::new(fat32mgr_core::NoOpProgress),
        );
        assert!(matches!(result, Err(VolumeError::Capacity(_))));
    }

    #[test]
    fn cancelled_format_stops_before_writing() {
        let device = MemoryDevice::new(512, 65536);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = Volume::format(
            device,
            &FormatParams::default(),
            &FormatOptions::default(),
            &cancel,
            Arc::new(fat32mgr_core::NoOpProgress),
        );
        assert!(matches!(result, Err(VolumeError::UserCancelled)));
    }

    #[test]
    fn bad_label_is_rejected_up_front() {
        let options = FormatOptions {
            label: Some("BAD*LABEL".to_string()),
            ..FormatOptions::default()
        };
        assert!(simulate_format(131072, &FormatParams::default(), &options).is_err());
    }
}

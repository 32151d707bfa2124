// Block device contract used by the volume engine
// Sector-addressed access over disk images, raw devices and in-memory stores

use crate::VolumeError;
use log::trace;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Random-access sector store.
///
/// The engine never assumes caching beyond what it requests: every
/// `read_sector` goes to the store and every `write_sector` is visible to
/// the next read. `flush` marks a checkpoint.
pub trait BlockDevice {
    fn sector_size(&self) -> usize;

    fn num_sectors(&self) -> u64;

    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<(), VolumeError>;

    fn write_sector(&mut self, index: u64, data: &[u8]) -> Result<(), VolumeError>;

    /// Read consecutive sectors into `buf`, whose length must be a multiple
    /// of the sector size
    fn read_sectors(&mut self, start: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        let sector_size = self.sector_size();
        for (i, chunk) in buf.chunks_mut(sector_size).enumerate() {
            self.read_sector(start + i as u64, chunk)?;
        }
        Ok(())
    }

    fn write_sectors(&mut self, start: u64, data: &[u8]) -> Result<(), VolumeError> {
        let sector_size = self.sector_size();
        for (i, chunk) in data.chunks(sector_size).enumerate() {
            self.write_sector(start + i as u64, chunk)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), VolumeError> {
        Ok(())
    }

    fn capacity_bytes(&self) -> u64 {
        self.num_sectors() * self.sector_size() as u64
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn sector_size(&self) -> usize {
        (**self).sector_size()
    }

    fn num_sectors(&self) -> u64 {
        (**self).num_sectors()
    }

    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        (**self).read_sector(index, buf)
    }

    fn write_sector(&mut self, index: u64, data: &[u8]) -> Result<(), VolumeError> {
        (**self).write_sector(index, data)
    }

    fn read_sectors(&mut self, start: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        (**self).read_sectors(start, buf)
    }

    fn write_sectors(&mut self, start: u64, data: &[u8]) -> Result<(), VolumeError> {
        (**self).write_sectors(start, data)
    }

    fn flush(&mut self) -> Result<(), VolumeError> {
        (**self).flush()
    }
}

fn check_range(start: u64, len: usize, sector_size: usize, num_sectors: u64) -> Result<(), VolumeError> {
    if len % sector_size != 0 {
        return Err(VolumeError::InvalidInput(format!(
            "buffer of {} bytes is not a whole number of {}-byte sectors",
            len, sector_size
        )));
    }
    let count = (len / sector_size) as u64;
    if start + count > num_sectors {
        let sector = start.max(num_sectors);
        return Err(VolumeError::io(
            sector,
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "sector beyond end of device"),
        ));
    }
    Ok(())
}

/// Disk image or raw device accessed through the filesystem
pub struct FileDevice {
    file: File,
    sector_size: usize,
    num_sectors: u64,
}

impl FileDevice {
    /// Open an existing image or device node read-write
    pub fn open(path: impl AsRef<Path>, sector_size: usize) -> Result<Self, VolumeError> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        Self::from_file(file, sector_size)
    }

    pub fn open_read_only(path: impl AsRef<Path>, sector_size: usize) -> Result<Self, VolumeError> {
        let file = File::open(path.as_ref())?;
        Self::from_file(file, sector_size)
    }

    /// Create (or truncate) a sparse image holding `num_sectors` sectors
    pub fn create(path: impl AsRef<Path>, sector_size: usize, num_sectors: u64) -> Result<Self, VolumeError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(num_sectors * sector_size as u64)?;
        Self::from_file(file, sector_size)
    }

    pub fn from_file(mut file: File, sector_size: usize) -> Result<Self, VolumeError> {
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(VolumeError::InvalidInput(format!("invalid sector size: {}", sector_size)));
        }
        // Block devices report a zero length in their metadata, so seek to the end instead
        let len = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            sector_size,
            num_sectors: len / sector_size as u64,
        })
    }

    fn seek_to(&mut self, index: u64) -> Result<(), VolumeError> {
        self.file
            .seek(SeekFrom::Start(index * self.sector_size as u64))
            .map_err(|e| VolumeError::io(index, e))?;
        Ok(())
    }
}

impl BlockDevice for FileDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        self.read_sectors(index, buf)
    }

    fn write_sector(&mut self, index: u64, data: &[u8]) -> Result<(), VolumeError> {
        self.write_sectors(index, data)
    }

    fn read_sectors(&mut self, start: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        check_range(start, buf.len(), self.sector_size, self.num_sectors)?;
        trace!("Reading {} bytes at sector {}", buf.len(), start);
        self.seek_to(start)?;
        self.file.read_exact(buf).map_err(|e| VolumeError::io(start, e))
    }

    fn write_sectors(&mut self, start: u64, data: &[u8]) -> Result<(), VolumeError> {
        check_range(start, data.len(), self.sector_size, self.num_sectors)?;
        trace!("Writing {} bytes at sector {}", data.len(), start);
        self.seek_to(start)?;
        self.file.write_all(data).map_err(|e| VolumeError::io(start, e))
    }

    fn flush(&mut self) -> Result<(), VolumeError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory sector store, mainly for tests and dry runs
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    data: Vec<u8>,
    sector_size: usize,
    fail_write_sector: Option<u64>,
    writes: u64,
}

impl MemoryDevice {
    pub fn new(sector_size: usize, num_sectors: u64) -> Self {
        Self {
            data: vec![0u8; sector_size * num_sectors as usize],
            sector_size,
            fail_write_sector: None,
            writes: 0,
        }
    }

    pub fn from_bytes(data: Vec<u8>, sector_size: usize) -> Self {
        Self {
            data,
            sector_size,
            fail_write_sector: None,
            writes: 0,
        }
    }

    /// Make every subsequent write touching `sector` fail
    pub fn fail_writes_to(&mut self, sector: Option<u64>) {
        self.fail_write_sector = sector;
    }

    /// Number of sectors written since creation
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for MemoryDevice {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn num_sectors(&self) -> u64 {
        (self.data.len() / self.sector_size) as u64
    }

    fn read_sector(&mut self, index: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        self.read_sectors(index, buf)
    }

    fn write_sector(&mut self, index: u64, data: &[u8]) -> Result<(), VolumeError> {
        self.write_sectors(index, data)
    }

    fn read_sectors(&mut self, start: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        check_range(start, buf.len(), self.sector_size, self.num_sectors())?;
        let offset = start as usize * self.sector_size;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_sectors(&mut self, start: u64, data: &[u8]) -> Result<(), VolumeError> {
        check_range(start, data.len(), self.sector_size, self.num_sectors())?;
        let count = (data.len() / self.sector_size) as u64;
        if let Some(bad) = self.fail_write_sector {
            if bad >= start && bad < start + count {
                return Err(VolumeError::io(
                    bad,
                    std::io::Error::new(std::io::ErrorKind::Other, "injected write fault"),
                ));
            }
        }
        let offset = start as usize * self.sector_size;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        self.writes += count;
        Ok(())
    }
}

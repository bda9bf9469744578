//! Block device abstraction the file system is built on.
//! The crate ships two implementations: [`MemDisk`], a
//! Vec-backed device for tests and embedding, and
//! [`DiskImage`], an mmap'ed raw image file.

pub mod image;

pub use image::DiskImage;

/// Every device transfers data in sectors of this size.
pub const SECTOR_SIZE: usize = 512;

/// Trait that abstracts out a block device at sector
/// granularity. Sector indices start at 0; passing an
/// out-of-range sector or an undersized buffer is a caller
/// bug and implementations are expected to panic on it.
pub trait BlockDevice {
    /// The total amount of sectors available to do IO.
    fn sector_count(&self) -> usize;
    /// Read the sector at `sector` into `buf`
    /// (must be at least `SECTOR_SIZE` long).
    fn read_sector(&self, sector: usize, buf: &mut [u8]);
    /// Write `buf` (at least `SECTOR_SIZE` long) to the
    /// sector at `sector`.
    fn write_sector(&mut self, sector: usize, buf: &[u8]);
}

/// An in-memory block device.
#[derive(Debug, Clone)]
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    pub fn new(sector_count: usize) -> Self {
        Self {
            data: vec![0; sector_count * SECTOR_SIZE],
        }
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> usize {
        self.data.len() / SECTOR_SIZE
    }

    fn read_sector(&self, sector: usize, buf: &mut [u8]) {
        assert!(buf.len() >= SECTOR_SIZE, "provided buffer is too small");
        let offset = sector * SECTOR_SIZE;
        assert!(offset + SECTOR_SIZE <= self.data.len(), "sector out of range");
        buf[..SECTOR_SIZE].copy_from_slice(&self.data[offset..offset + SECTOR_SIZE]);
    }

    fn write_sector(&mut self, sector: usize, buf: &[u8]) {
        assert!(buf.len() >= SECTOR_SIZE, "provided buffer is too small");
        let offset = sector * SECTOR_SIZE;
        assert!(offset + SECTOR_SIZE <= self.data.len(), "sector out of range");
        self.data[offset..offset + SECTOR_SIZE].copy_from_slice(&buf[..SECTOR_SIZE]);
    }
}

#[test]
fn memdisk_sector_roundtrip() {
    let mut disk = MemDisk::new(4);
    let mut sector = [0u8; SECTOR_SIZE];
    sector[0] = 0xAB;
    sector[SECTOR_SIZE - 1] = 0xCD;
    disk.write_sector(2, &sector);
    let mut back = [0u8; SECTOR_SIZE];
    disk.read_sector(2, &mut back);
    assert_eq!(sector, back);
    disk.read_sector(3, &mut back);
    assert_eq!(back, [0u8; SECTOR_SIZE]);
}

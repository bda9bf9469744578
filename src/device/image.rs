use super::{BlockDevice, SECTOR_SIZE};
use eyre::{ensure, Context, Result};
use std::ffi::c_void;
use std::fs::{self, File};
use std::io::{self, Write};
use std::mem::MaybeUninit;
use std::os::fd::IntoRawFd;
use std::path::Path;
use tracing::{debug, trace};

/// A raw volume image file, mapped into memory for the
/// lifetime of the value. The file carries no header: its
/// size (a multiple of `SECTOR_SIZE`) is the capacity.
#[derive(Debug)]
pub struct DiskImage {
    data_addr: *mut u8,
    data_size: usize,
}

impl DiskImage {
    fn stat_file_size(fd: libc::c_int) -> Result<usize> {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let stat = unsafe { stat.assume_init() };
        trace!("Stat'ed image size: {}", stat.st_size);
        Ok(stat.st_size as usize)
    }

    fn mmap_image_file(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(addr as *mut u8)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().canonicalize()?;
        debug!("Opening volume image at {:?}", path);
        let image = File::options()
            .append(false)
            .read(true)
            .write(true)
            .open(path)
            .context("Couldn't open volume image file")?;
        let fd = image.into_raw_fd();
        let size = Self::stat_file_size(fd)?;
        ensure!(size > 0, "volume image is empty");
        ensure!(
            size % SECTOR_SIZE == 0,
            "volume image size {} is not a multiple of the sector size {}",
            size,
            SECTOR_SIZE,
        );
        let mmap = Self::mmap_image_file(fd, size)?;
        Ok(Self {
            data_addr: mmap,
            data_size: size,
        })
    }

    /// Creates a zero-filled image of `sector_count` sectors
    /// at `path`. The new file is not opened; call
    /// [`DiskImage::open`] afterwards.
    pub fn create(path: impl AsRef<Path>, sector_count: usize) -> Result<()> {
        let path = path.as_ref();
        debug!("Creating volume image at {path:?} ({sector_count} sectors)");
        ensure!(
            path.parent().map(|p| p.is_dir()).unwrap_or(false),
            "target file location has no parent directory"
        );
        ensure!(!path.is_file(), "target file location already exists");
        ensure!(sector_count > 0, "sector count must be positive");
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        let sector = [0u8; SECTOR_SIZE];
        for _ in 0..sector_count {
            file.write_all(&sector)?;
        }
        file.flush()?;
        Ok(())
    }

    /// Flushes dirty pages of the mapping back to the file.
    pub fn sync(&self) -> Result<()> {
        let err =
            unsafe { libc::msync(self.data_addr as *mut c_void, self.data_size, libc::MS_SYNC) };
        if err != 0 {
            Err(io::Error::last_os_error().into())
        } else {
            Ok(())
        }
    }
}

impl BlockDevice for DiskImage {
    fn sector_count(&self) -> usize {
        self.data_size / SECTOR_SIZE
    }

    fn read_sector(&self, sector: usize, buf: &mut [u8]) {
        assert!(buf.len() >= SECTOR_SIZE, "provided buffer is too small");
        let offset = sector * SECTOR_SIZE;
        assert!(offset + SECTOR_SIZE <= self.data_size, "sector out of range");
        let addr = self.data_addr.wrapping_add(offset);
        let data = unsafe { std::slice::from_raw_parts(addr, SECTOR_SIZE) };
        buf[..SECTOR_SIZE].copy_from_slice(data);
    }

    fn write_sector(&mut self, sector: usize, buf: &[u8]) {
        assert!(buf.len() >= SECTOR_SIZE, "provided buffer is too small");
        let offset = sector * SECTOR_SIZE;
        assert!(offset + SECTOR_SIZE <= self.data_size, "sector out of range");
        let addr = self.data_addr.wrapping_add(offset);
        let data = unsafe { std::slice::from_raw_parts_mut(addr, SECTOR_SIZE) };
        data.copy_from_slice(&buf[..SECTOR_SIZE]);
    }
}

impl Drop for DiskImage {
    fn drop(&mut self) {
        unsafe {
            libc::msync(self.data_addr as *mut c_void, self.data_size, libc::MS_SYNC);
            libc::munmap(self.data_addr as *mut c_void, self.data_size);
        }
    }
}

#[test]
fn image_create_open_roundtrip() {
    let path = std::env::temp_dir().join(format!("tinyfat-image-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);
    DiskImage::create(&path, 16).unwrap();
    {
        let mut image = DiskImage::open(&path).unwrap();
        assert_eq!(image.sector_count(), 16);
        let mut sector = [0u8; SECTOR_SIZE];
        sector[7] = 0x5A;
        image.write_sector(9, &sector);
        image.sync().unwrap();
    }
    {
        let image = DiskImage::open(&path).unwrap();
        let mut back = [0u8; SECTOR_SIZE];
        image.read_sector(9, &mut back);
        assert_eq!(back[7], 0x5A);
    }
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn image_rejects_missing_parent() {
    let path = std::env::temp_dir()
        .join("tinyfat-no-such-dir")
        .join("volume.img");
    assert!(DiskImage::create(&path, 4).is_err());
}

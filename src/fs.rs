//! The file system core: a FAT-style allocation table, a flat
//! directory and a buffered cluster I/O engine layered over a
//! [`BlockDevice`].

use thiserror::Error;
use tracing::{debug, trace};

pub mod dir;
pub mod fat;
pub mod session;

use crate::device::{BlockDevice, SECTOR_SIZE};
use dir::Directory;
use fat::Fat;
use session::{Mode, Session, Sessions};

pub use session::OpenMode;

/// Sectors per cluster; the allocation unit is
/// `CLUSTER_SIZE` bytes.
pub const SECTORS_PER_CLUSTER: usize = 8;
pub const CLUSTER_SIZE: usize = SECTOR_SIZE * SECTORS_PER_CLUSTER;

/// Entries in the allocation table, one per cluster.
pub const FAT_ENTRIES: usize = 65536;
/// Sectors [0, 256) hold the table image.
pub const FAT_SECTORS: usize = FAT_ENTRIES * 2 / SECTOR_SIZE;
/// Sectors [256, 264) hold the directory image.
pub const DIR_SECTORS: usize = 8;

/// Clusters 0..32 back the table image on disk.
pub const FAT_RESERVED_CLUSTERS: u16 = (FAT_SECTORS / SECTORS_PER_CLUSTER) as u16;
/// Cluster 32 backs the directory image.
pub const DIR_CLUSTER: u16 = FAT_RESERVED_CLUSTERS;
/// First cluster available for file data.
pub const FIRST_DATA_CLUSTER: u16 = DIR_CLUSTER + 1;

/// Directory capacity; slot indices double as file handles.
pub const DIR_SLOTS: usize = 128;
/// Longest permitted file name, in bytes.
pub const NAME_MAX: usize = 24;

/// Smallest device the file system fits on: the metadata
/// sectors plus one data cluster.
pub const MIN_SECTORS: usize = FAT_SECTORS + DIR_SECTORS + SECTORS_PER_CLUSTER;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FsError {
    #[error("The volume is not formatted")]
    NotFormatted,
    #[error("A file named {0:?} already exists")]
    NameCollision(String),
    #[error("No file named {0:?} exists")]
    NotFound(String),
    #[error("{0:?} is not a valid file name")]
    InvalidName(String),
    #[error("File name {0:?} is longer than {max} bytes", max = NAME_MAX)]
    NameTooLong(String),
    #[error("The directory is full ({max} entries)", max = DIR_SLOTS)]
    DirectoryFull,
    #[error("Handle {0} is not open in the requested mode")]
    SessionNotOpen(usize),
    #[error("Handle {0} is out of range")]
    BadHandle(usize),
    #[error("No free cluster is left on the volume")]
    VolumeFull,
    #[error("The device has {0} sectors, but at least {min} are required", min = MIN_SECTORS)]
    DeviceTooSmall(usize),
}

type Result<T> = std::result::Result<T, FsError>;

/// When buffered write data is pushed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Flush a cluster once it is full, and the partial tail
    /// on close. Fewest device writes.
    #[default]
    OnClusterFull,
    /// Additionally flush the partial cluster and persist the
    /// metadata at the end of every write call, making each
    /// call durable without a close.
    EveryWrite,
}

/// A mounted single-volume file system.
///
/// All state lives in this object: the in-memory allocation
/// table and directory, the per-slot session cursors and one
/// shared cluster-sized scratch buffer. The scratch buffer is
/// shared across sessions, so only one read or write session
/// may be mid-operation at a time; the caller must finish (or
/// close) one before advancing another.
#[derive(Debug)]
pub struct FileSystem<D: BlockDevice> {
    device: D,
    fat: Fat,
    dir: Directory,
    sessions: Sessions,
    scratch: Vec<u8>,
    formatted: bool,
    flush_policy: FlushPolicy,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Mounts `device`, loading the table and directory from
    /// it. An unformatted volume mounts fine; everything but
    /// [`format`](Self::format) and
    /// [`free_space`](Self::free_space) then fails with
    /// [`FsError::NotFormatted`].
    pub fn mount(device: D) -> Result<Self> {
        let sectors = device.sector_count();
        if sectors < MIN_SECTORS {
            return Err(FsError::DeviceTooSmall(sectors));
        }
        let mut fs = Self {
            fat: Fat::new(sectors / SECTORS_PER_CLUSTER),
            dir: Directory::new(),
            sessions: Sessions::new(),
            scratch: vec![0; CLUSTER_SIZE],
            formatted: false,
            flush_policy: FlushPolicy::default(),
            device,
        };
        fs.reload_meta();
        fs.formatted = fs.fat.is_formatted();
        debug!(
            clusters = fs.fat.cluster_count(),
            formatted = fs.formatted,
            "mounted volume"
        );
        Ok(fs)
    }

    /// Hands the device back. Open write sessions that were
    /// never closed lose their unflushed tail.
    pub fn unmount(self) -> D {
        self.device
    }

    pub fn is_formatted(&self) -> bool {
        self.formatted
    }

    pub fn set_flush_policy(&mut self, policy: FlushPolicy) {
        self.flush_policy = policy;
    }

    /// Resets the volume to an empty, formatted state and
    /// persists it.
    pub fn format(&mut self) {
        debug!(clusters = self.fat.cluster_count(), "formatting volume");
        self.fat.format();
        self.dir.clear_all();
        self.sessions = Sessions::new();
        self.formatted = true;
        self.persist_meta();
    }

    /// Total bytes held in free clusters.
    pub fn free_space(&self) -> u64 {
        self.fat.free_bytes()
    }

    /// Walks the in-use directory records in slot order.
    pub fn list(&self) -> Result<impl Iterator<Item = (&str, u32)> + '_> {
        self.ensure_formatted()?;
        Ok(self.dir.entries())
    }

    /// Creates an empty file and returns its handle.
    pub fn create(&mut self, name: &str) -> Result<usize> {
        self.ensure_formatted()?;
        let encoded = dir::encode_name(name)?;
        if self.dir.lookup(name).is_some() {
            return Err(FsError::NameCollision(name.into()));
        }
        let slot = self.dir.first_free_slot().ok_or(FsError::DirectoryFull)?;
        let cluster = self.fat.first_free_from(0)?;
        self.fat.set(cluster, fat::END_OF_CHAIN);
        self.dir.fill_slot(slot, encoded, cluster);
        self.persist_meta();
        debug!(name, slot, cluster, "created file");
        Ok(slot)
    }

    /// Removes a file, releasing its whole cluster chain.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        self.ensure_formatted()?;
        let slot = self
            .dir
            .lookup(name)
            .ok_or_else(|| FsError::NotFound(name.into()))?;
        let first = self.dir.slot(slot).first_cluster;
        self.dir.clear_slot(slot);
        self.fat.release_chain(first);
        self.sessions.close(slot);
        self.persist_meta();
        debug!(name, slot, "removed file");
        Ok(())
    }

    /// Opens a file and returns its handle.
    ///
    /// Read mode requires the file to exist. Write mode
    /// truncates: an existing file is removed and recreated
    /// empty, a missing one is created.
    pub fn open(&mut self, name: &str, mode: OpenMode) -> Result<usize> {
        self.ensure_formatted()?;
        match mode {
            OpenMode::Read => {
                let slot = self
                    .dir
                    .lookup(name)
                    .ok_or_else(|| FsError::NotFound(name.into()))?;
                let first = self.dir.slot(slot).first_cluster;
                self.sessions.open_read(slot, first);
                Ok(slot)
            }
            OpenMode::Write => {
                if self.dir.lookup(name).is_some() {
                    self.remove(name)?;
                }
                let slot = self.create(name)?;
                let first = self.dir.slot(slot).first_cluster;
                self.scratch.fill(0);
                self.sessions.open_write(slot, first);
                Ok(slot)
            }
        }
    }

    /// Closes the sessions of `handle` and only of `handle`.
    /// An open write session has its partial cluster flushed
    /// and the metadata persisted first. Closing an already
    /// closed handle does nothing.
    pub fn close(&mut self, handle: usize) -> Result<()> {
        if handle >= DIR_SLOTS {
            return Err(FsError::BadHandle(handle));
        }
        if self.sessions.write_session(handle).mode == Mode::Write {
            let base = self.sessions.write_session(handle).current_sector;
            self.flush_cluster_at(base);
            self.persist_meta();
            trace!(handle, base, "flushed on close");
        }
        self.sessions.close(handle);
        Ok(())
    }

    /// Appends `data` to the file behind `handle`, returning
    /// the number of bytes accepted. On [`FsError::VolumeFull`]
    /// the bytes accepted before the failure stay in the file.
    pub fn write(&mut self, handle: usize, data: &[u8]) -> Result<usize> {
        if handle >= DIR_SLOTS {
            return Err(FsError::BadHandle(handle));
        }
        let mut s = *self.sessions.write_session(handle);
        if s.mode != Mode::Write || !self.dir.slot(handle).in_use() {
            return Err(FsError::SessionNotOpen(handle));
        }

        let mut accepted = 0usize;
        let mut failure = None;
        for &byte in data {
            if s.buffer_pos == CLUSTER_SIZE {
                if let Err(e) = self.extend_chain(&mut s) {
                    failure = Some(e);
                    break;
                }
            }
            self.scratch[s.buffer_pos] = byte;
            s.buffer_pos += 1;
            s.transferred += 1;
            accepted += 1;
        }

        self.dir.slot_mut(handle).size += accepted as u32;
        if failure.is_none() && self.flush_policy == FlushPolicy::EveryWrite {
            self.flush_cluster_at(s.current_sector);
            self.persist_meta();
        }
        *self.sessions.write_session_mut(handle) = s;
        match failure {
            Some(e) => Err(e),
            None => Ok(accepted),
        }
    }

    /// Reads up to `buf.len()` bytes from the file behind
    /// `handle`, returning the number of bytes copied. A short
    /// or zero count signals end-of-file; it is not an error.
    ///
    /// The table and directory are reloaded from the device
    /// first, so state committed by an earlier close is
    /// observed.
    pub fn read(&mut self, handle: usize, buf: &mut [u8]) -> Result<usize> {
        if handle >= DIR_SLOTS {
            return Err(FsError::BadHandle(handle));
        }
        let mut s = *self.sessions.read_session(handle);
        if s.mode != Mode::Read {
            return Err(FsError::SessionNotOpen(handle));
        }
        self.reload_meta();
        if !self.dir.slot(handle).in_use() {
            return Err(FsError::SessionNotOpen(handle));
        }
        let size = u64::from(self.dir.slot(handle).size);

        let mut copied = 0usize;
        for out in buf.iter_mut() {
            if s.transferred >= size {
                break;
            }
            if s.buffer_pos == CLUSTER_SIZE {
                let next = self.fat.entry(s.current_cluster);
                if next < FIRST_DATA_CLUSTER {
                    // recorded size runs past the chain end
                    break;
                }
                s.current_cluster = next;
                s.current_sector = next as usize * SECTORS_PER_CLUSTER;
                s.buffer_pos = 0;
            }
            if s.buffer_pos == 0 {
                self.load_cluster_at(s.current_sector);
            }
            *out = self.scratch[s.buffer_pos];
            s.buffer_pos += 1;
            s.transferred += 1;
            copied += 1;
        }

        *self.sessions.read_session_mut(handle) = s;
        Ok(copied)
    }

    fn ensure_formatted(&self) -> Result<()> {
        if self.formatted {
            Ok(())
        } else {
            Err(FsError::NotFormatted)
        }
    }

    /// Flushes the full scratch buffer, links a fresh cluster
    /// onto the chain tail and persists the mutated metadata.
    fn extend_chain(&mut self, s: &mut Session) -> Result<()> {
        self.flush_cluster_at(s.current_sector);
        let next = self.fat.first_free_from(s.current_cluster)?;
        self.scratch.fill(0);
        self.fat.set(s.current_cluster, next);
        self.fat.set(next, fat::END_OF_CHAIN);
        trace!(from = s.current_cluster, to = next, "extended chain");
        s.current_cluster = next;
        s.current_sector = next as usize * SECTORS_PER_CLUSTER;
        s.buffer_pos = 0;
        self.persist_meta();
        Ok(())
    }

    /// Writes the scratch buffer to the 8 sectors starting at
    /// `base`.
    fn flush_cluster_at(&mut self, base: usize) {
        for i in 0..SECTORS_PER_CLUSTER {
            self.device
                .write_sector(base + i, &self.scratch[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        }
    }

    /// Reads the 8 sectors starting at `base` into the scratch
    /// buffer.
    fn load_cluster_at(&mut self, base: usize) {
        for i in 0..SECTORS_PER_CLUSTER {
            self.device
                .read_sector(base + i, &mut self.scratch[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        }
    }

    /// Writes the full table image followed by the full
    /// directory image to their reserved sector ranges.
    fn persist_meta(&mut self) {
        let mut buf = [0u8; SECTOR_SIZE];
        for sector in 0..FAT_SECTORS {
            self.fat.pack_sector(sector, &mut buf);
            self.device.write_sector(sector, &buf);
        }
        for sector in 0..DIR_SECTORS {
            self.dir.pack_sector(sector, &mut buf);
            self.device.write_sector(FAT_SECTORS + sector, &buf);
        }
    }

    /// Inverse of [`persist_meta`](Self::persist_meta).
    fn reload_meta(&mut self) {
        let mut buf = [0u8; SECTOR_SIZE];
        for sector in 0..FAT_SECTORS {
            self.device.read_sector(sector, &mut buf);
            self.fat.unpack_sector(sector, &buf);
        }
        for sector in 0..DIR_SECTORS {
            self.device.read_sector(FAT_SECTORS + sector, &mut buf);
            self.dir.unpack_sector(sector, &buf);
        }
    }
}

#[cfg(test)]
use crate::device::MemDisk;

#[cfg(test)]
fn formatted_fs(sectors: usize) -> FileSystem<MemDisk> {
    let mut fs = FileSystem::mount(MemDisk::new(sectors)).unwrap();
    fs.format();
    fs
}

#[test]
fn mount_rejects_a_tiny_device() {
    let result = FileSystem::mount(MemDisk::new(MIN_SECTORS - 1));
    assert!(matches!(result, Err(FsError::DeviceTooSmall(_))));
}

#[test]
fn fresh_volume_is_unformatted() {
    let mut fs = FileSystem::mount(MemDisk::new(1024)).unwrap();
    assert!(!fs.is_formatted());
    assert!(matches!(fs.create("a"), Err(FsError::NotFormatted)));
    assert!(matches!(fs.remove("a"), Err(FsError::NotFormatted)));
    assert!(matches!(
        fs.open("a", OpenMode::Write),
        Err(FsError::NotFormatted)
    ));
    assert!(fs.list().is_err());
}

#[test]
fn format_frees_exactly_the_data_clusters() {
    let fs = formatted_fs(1024);
    // 1024 sectors = 128 clusters, 33 of them reserved
    let data_clusters = 128 - FIRST_DATA_CLUSTER as u64;
    assert_eq!(fs.free_space(), data_clusters * CLUSTER_SIZE as u64);
}

#[test]
fn create_list_remove() {
    let mut fs = formatted_fs(1024);
    fs.create("notes.txt").unwrap();
    let listed: Vec<(String, u32)> = fs
        .list()
        .unwrap()
        .map(|(n, s)| (n.to_owned(), s))
        .collect();
    assert_eq!(listed, vec![("notes.txt".to_owned(), 0)]);

    assert!(matches!(
        fs.create("notes.txt"),
        Err(FsError::NameCollision(_))
    ));
    assert!(matches!(fs.remove("missing"), Err(FsError::NotFound(_))));

    let before = fs.free_space();
    fs.remove("notes.txt").unwrap();
    assert_eq!(fs.list().unwrap().count(), 0);
    assert_eq!(fs.free_space(), before + CLUSTER_SIZE as u64);
}

#[test]
fn write_read_roundtrip() {
    let mut fs = formatted_fs(1024);
    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let h = fs.open("data.bin", OpenMode::Write).unwrap();
    assert_eq!(fs.write(h, &payload).unwrap(), payload.len());
    fs.close(h).unwrap();

    let h = fs.open("data.bin", OpenMode::Read).unwrap();
    let mut back = vec![0u8; payload.len()];
    assert_eq!(fs.read(h, &mut back).unwrap(), payload.len());
    assert_eq!(back, payload);
    fs.close(h).unwrap();
}

#[test]
fn large_write_extends_the_chain() {
    let mut fs = formatted_fs(1024);
    let h = fs.open("big", OpenMode::Write).unwrap();
    fs.write(h, &[0x42u8; 5000]).unwrap();
    fs.close(h).unwrap();

    let first = fs.dir.slot(h).first_cluster;
    let second = fs.fat.entry(first);
    assert!(second >= FIRST_DATA_CLUSTER, "first entry must be a link");
    assert_eq!(fs.fat.entry(second), fat::END_OF_CHAIN);
    assert_eq!(fs.dir.slot(h).size, 5000);

    // both clusters come back after a read
    let h = fs.open("big", OpenMode::Read).unwrap();
    let mut back = vec![0u8; 5000];
    assert_eq!(fs.read(h, &mut back).unwrap(), 5000);
    assert!(back.iter().all(|&b| b == 0x42));
}

#[test]
fn reading_past_the_end_is_a_short_read() {
    let mut fs = formatted_fs(1024);
    let h = fs.open("short", OpenMode::Write).unwrap();
    fs.write(h, b"0123456789").unwrap();
    fs.close(h).unwrap();

    let h = fs.open("short", OpenMode::Read).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(fs.read(h, &mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], b"0123456789");
    assert_eq!(fs.read(h, &mut buf).unwrap(), 0);
    assert_eq!(fs.read(h, &mut buf).unwrap(), 0);
}

#[test]
fn open_for_write_truncates() {
    let mut fs = formatted_fs(1024);
    let h = fs.open("f", OpenMode::Write).unwrap();
    fs.write(h, &[7u8; 6000]).unwrap();
    fs.close(h).unwrap();
    let free_after_first = fs.free_space();

    let h = fs.open("f", OpenMode::Write).unwrap();
    fs.write(h, b"z").unwrap();
    fs.close(h).unwrap();

    // the two-cluster chain was released, one fresh cluster taken
    assert_eq!(fs.free_space(), free_after_first + CLUSTER_SIZE as u64);
    let h = fs.open("f", OpenMode::Read).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(h, &mut buf).unwrap(), 1);
    assert_eq!(buf[0], b'z');
}

#[test]
fn session_preconditions() {
    let mut fs = formatted_fs(1024);
    let mut buf = [0u8; 4];
    assert!(matches!(fs.read(200, &mut buf), Err(FsError::BadHandle(200))));
    assert!(matches!(fs.write(200, &buf), Err(FsError::BadHandle(200))));
    assert!(matches!(fs.read(0, &mut buf), Err(FsError::SessionNotOpen(0))));
    assert!(matches!(fs.write(0, &buf), Err(FsError::SessionNotOpen(0))));

    // a handle open for read rejects writes
    fs.create("r").unwrap();
    let h = fs.open("r", OpenMode::Read).unwrap();
    assert!(matches!(fs.write(h, &buf), Err(FsError::SessionNotOpen(_))));
}

#[test]
fn directory_full_is_reported() {
    // plenty of clusters, so only the slot array can run out
    let mut fs = formatted_fs(2048);
    for i in 0..DIR_SLOTS {
        fs.create(&format!("f{i}")).unwrap();
    }
    assert_eq!(fs.list().unwrap().count(), DIR_SLOTS);
    assert!(matches!(fs.create("straw"), Err(FsError::DirectoryFull)));
}

#[test]
fn volume_full_is_reported() {
    // exactly one data cluster
    let mut fs = formatted_fs(MIN_SECTORS);
    let h = fs.open("only", OpenMode::Write).unwrap();
    assert_eq!(fs.write(h, &[1u8; CLUSTER_SIZE]).unwrap(), CLUSTER_SIZE);
    assert!(matches!(fs.write(h, &[1u8]), Err(FsError::VolumeFull)));
    // the accepted bytes survived
    assert_eq!(fs.dir.slot(h).size, CLUSTER_SIZE as u32);
}

#[test]
fn every_write_policy_is_durable_without_close() {
    let mut fs = formatted_fs(1024);
    fs.set_flush_policy(FlushPolicy::EveryWrite);
    let h = fs.open("journal", OpenMode::Write).unwrap();
    fs.write(h, b"hello").unwrap();

    // no close: the data and size must already be on the device
    let h = fs.open("journal", OpenMode::Read).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(h, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
}

#[test]
fn cluster_full_policy_defers_the_tail_to_close() {
    let mut fs = formatted_fs(1024);
    let h = fs.open("lazy", OpenMode::Write).unwrap();
    fs.write(h, b"hello").unwrap();

    // read reloads from the device; nothing was flushed yet,
    // so the persisted size is still zero
    let h2 = fs.open("lazy", OpenMode::Read).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(h2, &mut buf).unwrap(), 0);
    assert_eq!(h, h2);
}

#[test]
fn session_sector_tracks_the_current_cluster() {
    let mut fs = formatted_fs(1024);
    let h = fs.open("two", OpenMode::Write).unwrap();
    fs.write(h, &[1u8; 5000]).unwrap();
    let w = fs.sessions.write_session(h);
    assert_eq!(
        w.current_sector,
        w.current_cluster as usize * SECTORS_PER_CLUSTER
    );
    fs.close(h).unwrap();

    // crossing a cluster boundary keeps the read cursor in step
    let h = fs.open("two", OpenMode::Read).unwrap();
    let mut buf = vec![0u8; 5000];
    assert_eq!(fs.read(h, &mut buf).unwrap(), 5000);
    let r = fs.sessions.read_session(h);
    assert_eq!(
        r.current_sector,
        r.current_cluster as usize * SECTORS_PER_CLUSTER
    );
    assert_ne!(r.current_cluster, fs.dir.slot(h).first_cluster);
}

#[test]
fn metadata_survives_a_remount() {
    let mut fs = formatted_fs(1024);
    let h = fs.open("keep", OpenMode::Write).unwrap();
    fs.write(h, b"persistent").unwrap();
    fs.close(h).unwrap();

    let device = fs.unmount();
    let mut fs = FileSystem::mount(device).unwrap();
    assert!(fs.is_formatted());
    let listed: Vec<(String, u32)> = fs
        .list()
        .unwrap()
        .map(|(n, s)| (n.to_owned(), s))
        .collect();
    assert_eq!(listed, vec![("keep".to_owned(), 10)]);

    let h = fs.open("keep", OpenMode::Read).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(h, &mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], b"persistent");
}

#[test]
fn removing_a_file_frees_its_whole_chain() {
    let mut fs = formatted_fs(1024);

    let a = fs.open("a", OpenMode::Write).unwrap();
    fs.write(a, &[9u8; 10000]).unwrap();
    fs.close(a).unwrap();

    let b = fs.open("b", OpenMode::Write).unwrap();
    fs.write(b, &[8u8; 100]).unwrap();
    fs.close(b).unwrap();

    let listed: Vec<(String, u32)> = fs
        .list()
        .unwrap()
        .map(|(n, s)| (n.to_owned(), s))
        .collect();
    assert_eq!(
        listed,
        vec![("a".to_owned(), 10000), ("b".to_owned(), 100)]
    );

    // 10000 bytes span three clusters
    let before = fs.free_space();
    fs.remove("a").unwrap();
    assert_eq!(fs.free_space(), before + 3 * CLUSTER_SIZE as u64);
}

//! The allocation table: one u16 entry per cluster, chaining
//! each file's clusters together.

use super::{
    FsError, Result, CLUSTER_SIZE, FAT_ENTRIES, FAT_RESERVED_CLUSTERS, FIRST_DATA_CLUSTER,
    SECTOR_SIZE,
};

/// Cluster is free.
pub const FREE: u16 = 1;
/// Cluster is allocated and terminates a chain.
pub const END_OF_CHAIN: u16 = 2;
/// Cluster holds part of the table's own on-disk image.
pub const RESERVED_FAT: u16 = 3;
/// Cluster holds the directory's on-disk image.
pub const RESERVED_DIR: u16 = 4;
// Any value >= FIRST_DATA_CLUSTER is the index of the next
// cluster in the chain.

const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / 2;

#[derive(Debug, Clone)]
pub struct Fat {
    entries: Vec<u16>,
    /// Clusters actually backed by the device; entries past
    /// this index are never handed out.
    cluster_count: usize,
}

impl Fat {
    pub fn new(cluster_count: usize) -> Self {
        let cluster_count = cluster_count.min(FAT_ENTRIES);
        Self {
            entries: vec![0; FAT_ENTRIES],
            cluster_count,
        }
    }

    pub fn cluster_count(&self) -> usize {
        self.cluster_count
    }

    pub fn entry(&self, cluster: u16) -> u16 {
        self.entries[cluster as usize]
    }

    pub fn set(&mut self, cluster: u16, value: u16) {
        self.entries[cluster as usize] = value;
    }

    /// The volume is considered formatted when every cluster
    /// backing the table image is marked reserved.
    pub fn is_formatted(&self) -> bool {
        self.entries[..FAT_RESERVED_CLUSTERS as usize]
            .iter()
            .all(|&e| e == RESERVED_FAT)
    }

    /// Resets every entry to the freshly formatted layout:
    /// table clusters reserved, the directory cluster after
    /// them, everything else in range free.
    pub fn format(&mut self) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            *entry = if i >= self.cluster_count {
                0
            } else if i < FAT_RESERVED_CLUSTERS as usize {
                RESERVED_FAT
            } else if i < FIRST_DATA_CLUSTER as usize {
                RESERVED_DIR
            } else {
                FREE
            };
        }
    }

    pub fn free_bytes(&self) -> u64 {
        let free = self.entries[..self.cluster_count]
            .iter()
            .filter(|&&e| e == FREE)
            .count();
        free as u64 * CLUSTER_SIZE as u64
    }

    /// Finds the lowest-indexed free cluster at or after
    /// `start`. Chain extension passes the current tail here
    /// so a growing file never rescans the whole table.
    pub fn first_free_from(&self, start: u16) -> Result<u16> {
        self.entries[start as usize..self.cluster_count]
            .iter()
            .position(|&e| e == FREE)
            .map(|off| start + off as u16)
            .ok_or(FsError::VolumeFull)
    }

    /// Walks the chain starting at `first`, freeing every
    /// visited cluster, the end-of-chain one included. A link
    /// below the data area (which a well-formed chain never
    /// contains) also stops the walk, so a corrupt or cyclic
    /// chain cannot loop forever.
    pub fn release_chain(&mut self, first: u16) {
        let mut cluster = first;
        loop {
            let next = self.entries[cluster as usize];
            self.entries[cluster as usize] = FREE;
            if next == END_OF_CHAIN || next < FIRST_DATA_CLUSTER {
                break;
            }
            cluster = next;
        }
    }

    pub fn pack_sector(&self, sector: usize, buf: &mut [u8]) {
        let base = sector * ENTRIES_PER_SECTOR;
        for (chunk, &entry) in buf
            .chunks_exact_mut(2)
            .zip(self.entries[base..base + ENTRIES_PER_SECTOR].iter())
        {
            chunk.copy_from_slice(&entry.to_le_bytes());
        }
    }

    pub fn unpack_sector(&mut self, sector: usize, buf: &[u8]) {
        let base = sector * ENTRIES_PER_SECTOR;
        for (chunk, entry) in buf
            .chunks_exact(2)
            .zip(self.entries[base..base + ENTRIES_PER_SECTOR].iter_mut())
        {
            *entry = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
    }
}

#[test]
fn format_lays_out_reserved_clusters() {
    let mut fat = Fat::new(1024);
    assert!(!fat.is_formatted());
    fat.format();
    assert!(fat.is_formatted());
    for c in 0..32 {
        assert_eq!(fat.entry(c), RESERVED_FAT);
    }
    assert_eq!(fat.entry(32), RESERVED_DIR);
    for c in FIRST_DATA_CLUSTER..1024 {
        assert_eq!(fat.entry(c), FREE);
    }
    let data_clusters = 1024 - FIRST_DATA_CLUSTER as u64;
    assert_eq!(fat.free_bytes(), data_clusters * CLUSTER_SIZE as u64);
}

#[test]
fn first_free_skips_allocated_clusters() {
    let mut fat = Fat::new(64);
    fat.format();
    assert_eq!(fat.first_free_from(0).unwrap(), FIRST_DATA_CLUSTER);
    fat.set(FIRST_DATA_CLUSTER, END_OF_CHAIN);
    fat.set(FIRST_DATA_CLUSTER + 1, END_OF_CHAIN);
    assert_eq!(fat.first_free_from(0).unwrap(), FIRST_DATA_CLUSTER + 2);
    assert_eq!(
        fat.first_free_from(FIRST_DATA_CLUSTER + 2).unwrap(),
        FIRST_DATA_CLUSTER + 2
    );
}

#[test]
fn first_free_reports_full_volume() {
    let mut fat = Fat::new(FIRST_DATA_CLUSTER as usize + 2);
    fat.format();
    fat.set(FIRST_DATA_CLUSTER, END_OF_CHAIN);
    fat.set(FIRST_DATA_CLUSTER + 1, END_OF_CHAIN);
    assert!(matches!(fat.first_free_from(0), Err(FsError::VolumeFull)));
}

#[test]
fn release_chain_frees_every_link() {
    let mut fat = Fat::new(64);
    fat.format();
    let (a, b, c) = (33, 40, 41);
    fat.set(a, b);
    fat.set(b, c);
    fat.set(c, END_OF_CHAIN);
    fat.release_chain(a);
    assert_eq!(fat.entry(a), FREE);
    assert_eq!(fat.entry(b), FREE);
    assert_eq!(fat.entry(c), FREE);
}

#[test]
fn sector_image_roundtrip_is_little_endian() {
    let mut fat = Fat::new(1024);
    fat.format();
    fat.set(33, 0x1234);
    let mut buf = [0u8; SECTOR_SIZE];
    fat.pack_sector(0, &mut buf);
    // entry 33 lives at byte offset 66 of sector 0
    assert_eq!(buf[66], 0x34);
    assert_eq!(buf[67], 0x12);
    let mut other = Fat::new(1024);
    other.unpack_sector(0, &buf);
    assert_eq!(other.entry(33), 0x1234);
    assert_eq!(other.entry(0), RESERVED_FAT);
}

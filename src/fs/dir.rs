//! The flat directory: a fixed array of 128 file records,
//! persisted right after the allocation table. A record's
//! array position doubles as the file handle.

use super::{FsError, Result, DIR_SLOTS, NAME_MAX, SECTOR_SIZE};
use packed_struct::prelude::*;

/// Bytes a record's name field occupies on disk; one more
/// than the longest name so the terminator always fits.
pub const NAME_BYTES: usize = NAME_MAX + 1;

/// Packed size of one directory record.
pub const SLOT_BYTES: usize = 32;

const SLOTS_PER_SECTOR: usize = SECTOR_SIZE / SLOT_BYTES;

// the derive macro below needs the literal length
const _: () = assert!(NAME_BYTES == 25);

/// One directory record, exactly as stored on disk.
#[derive(PackedStruct, Debug, Clone, Copy)]
#[packed_struct(endian = "lsb")]
pub struct DirSlot {
    pub used: u8,
    pub name: [u8; 25],
    pub first_cluster: u16,
    pub size: u32,
}

impl DirSlot {
    const EMPTY: DirSlot = DirSlot {
        used: 0,
        name: [0; NAME_BYTES],
        first_cluster: 0,
        size: 0,
    };

    pub fn in_use(&self) -> bool {
        self.used != 0
    }

    /// The stored name up to its NUL terminator. Undecodable
    /// on-disk bytes come back empty rather than panicking.
    pub fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_BYTES);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

/// Validates a file name and returns its fixed-size,
/// NUL-terminated on-disk form.
pub fn encode_name(name: &str) -> Result<[u8; NAME_BYTES]> {
    if name.is_empty() || name.as_bytes().contains(&0) {
        return Err(FsError::InvalidName(name.into()));
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong(name.into()));
    }
    let mut bytes = [0; NAME_BYTES];
    bytes[..name.len()].copy_from_slice(name.as_bytes());
    Ok(bytes)
}

#[derive(Debug, Clone)]
pub struct Directory {
    slots: [DirSlot; DIR_SLOTS],
}

impl Directory {
    pub fn new() -> Self {
        Self {
            slots: [DirSlot::EMPTY; DIR_SLOTS],
        }
    }

    pub fn slot(&self, index: usize) -> &DirSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut DirSlot {
        &mut self.slots[index]
    }

    /// Index of the in-use record named `name`, if any.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.in_use() && s.name() == name)
    }

    pub fn first_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.in_use())
    }

    pub fn fill_slot(&mut self, index: usize, name: [u8; NAME_BYTES], first_cluster: u16) {
        self.slots[index] = DirSlot {
            used: 1,
            name,
            first_cluster,
            size: 0,
        };
    }

    pub fn clear_slot(&mut self, index: usize) {
        self.slots[index] = DirSlot::EMPTY;
    }

    pub fn clear_all(&mut self) {
        self.slots = [DirSlot::EMPTY; DIR_SLOTS];
    }

    /// Lazy walk over the in-use records in slot order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.slots
            .iter()
            .filter(|s| s.in_use())
            .map(|s| (s.name(), s.size))
    }

    pub fn pack_sector(&self, sector: usize, buf: &mut [u8]) {
        let base = sector * SLOTS_PER_SECTOR;
        for (i, slot) in self.slots[base..base + SLOTS_PER_SECTOR].iter().enumerate() {
            // Infallible, the struct has only primitive members
            let packed = slot.pack().unwrap();
            buf[i * SLOT_BYTES..(i + 1) * SLOT_BYTES].copy_from_slice(&packed);
        }
    }

    pub fn unpack_sector(&mut self, sector: usize, buf: &[u8]) {
        let base = sector * SLOTS_PER_SECTOR;
        for (i, slot) in self.slots[base..base + SLOTS_PER_SECTOR]
            .iter_mut()
            .enumerate()
        {
            *slot = DirSlot::unpack_from_slice(&buf[i * SLOT_BYTES..(i + 1) * SLOT_BYTES]).unwrap();
        }
    }
}

#[test]
fn record_layout_is_32_bytes() {
    let slot = DirSlot {
        used: 1,
        name: encode_name("hello.txt").unwrap(),
        first_cluster: 33,
        size: 0x01020304,
    };
    let packed = slot.pack().unwrap();
    assert_eq!(packed.len(), SLOT_BYTES);
    assert_eq!(packed[0], 1);
    assert_eq!(&packed[1..10], b"hello.txt");
    assert_eq!(packed[10], 0);
    // first_cluster and size are little-endian
    assert_eq!([packed[26], packed[27]], [33, 0]);
    assert_eq!([packed[28], packed[29]], [4, 3]);
}

#[test]
fn lookup_requires_the_in_use_flag() {
    let mut dir = Directory::new();
    dir.fill_slot(3, encode_name("stale").unwrap(), 40);
    dir.slots[3].used = 0;
    assert_eq!(dir.lookup("stale"), None);
    dir.fill_slot(5, encode_name("live").unwrap(), 41);
    assert_eq!(dir.lookup("live"), Some(5));
}

#[test]
fn name_validation() {
    assert!(matches!(encode_name(""), Err(FsError::InvalidName(_))));
    assert!(matches!(
        encode_name("bad\0name"),
        Err(FsError::InvalidName(_))
    ));
    assert!(matches!(
        encode_name("an-absurdly-long-file-name"),
        Err(FsError::NameTooLong(_))
    ));
    let exactly_24 = "123456789012345678901234";
    assert_eq!(exactly_24.len(), NAME_MAX);
    assert!(encode_name(exactly_24).is_ok());
}

#[test]
fn entries_walk_in_slot_order() {
    let mut dir = Directory::new();
    dir.fill_slot(7, encode_name("b").unwrap(), 34);
    dir.fill_slot(2, encode_name("a").unwrap(), 33);
    dir.slot_mut(2).size = 10;
    let listed: Vec<_> = dir.entries().collect();
    assert_eq!(listed, vec![("a", 10), ("b", 0)]);
}

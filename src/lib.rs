pub mod device;
pub mod fs;

pub use device::{BlockDevice, DiskImage, MemDisk, SECTOR_SIZE};
pub use fs::{FileSystem, FlushPolicy, FsError, OpenMode};

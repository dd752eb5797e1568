//! Byte streams backing hash-join spill files.
//!
//! A spill file is append-only while a batch is being written and read
//! sequentially from the start once it is rewound. Both backends delete their
//! storage when the handle is dropped.
use std::path::Path;

use crate::Result;

mod disk;
mod memory;

pub use disk::{DiskFile, TempFileIO};
pub use memory::{MemoryFile, MemoryIO};

pub trait File: Send {
    /// Appends `buf` at the end of the file and returns the number of bytes
    /// written. Fewer bytes than requested means the backend ran out of room.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    /// Reads from the read position into `buf`. Returns 0 at end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Moves the read position back to the start of the file.
    fn rewind(&mut self) -> Result<()>;
    fn size(&self) -> Result<u64>;
    fn path(&self) -> Option<&Path> {
        None
    }
}

pub trait IO: Send + Sync {
    fn create_temp(&self) -> Result<Box<dyn File>>;
}

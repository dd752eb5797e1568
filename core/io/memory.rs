use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use super::{File, IO};
use crate::Result;

/// Spill files kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryIO {
    /// Per-file byte limit; writes past it are cut short.
    file_capacity: Option<usize>,
    files_created: AtomicUsize,
}

impl MemoryIO {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every file created by this IO accepts at most `capacity` bytes.
    pub fn with_file_capacity(capacity: usize) -> Self {
        Self {
            file_capacity: Some(capacity),
            files_created: AtomicUsize::new(0),
        }
    }

    pub fn files_created(&self) -> usize {
        self.files_created.load(Ordering::Relaxed)
    }
}

impl IO for MemoryIO {
    fn create_temp(&self) -> Result<Box<dyn File>> {
        let n = self.files_created.fetch_add(1, Ordering::Relaxed);
        trace!(file = n, "creating in-memory spill file");
        Ok(Box::new(MemoryFile {
            data: Vec::new(),
            read_pos: 0,
            capacity: self.file_capacity,
        }))
    }
}

#[derive(Debug, Default)]
pub struct MemoryFile {
    data: Vec<u8>,
    read_pos: usize,
    capacity: Option<usize>,
}

impl MemoryFile {
    /// A file preloaded with `data`, positioned at its start.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            read_pos: 0,
            capacity: None,
        }
    }
}

impl File for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = match self.capacity {
            Some(cap) => buf.len().min(cap.saturating_sub(self.data.len())),
            None => buf.len(),
        };
        self.data.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.data[self.read_pos.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.read_pos += n;
        Ok(n)
    }

    fn rewind(&mut self) -> Result<()> {
        self.read_pos = 0;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }
}

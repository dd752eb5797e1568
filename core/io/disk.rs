use std::{
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use super::{File, IO};
use crate::Result;

/// Spill files backed by named temporary files on disk.
#[derive(Debug, Default, Clone)]
pub struct TempFileIO {
    dir: Option<PathBuf>,
}

impl TempFileIO {
    /// Temporary files go to the system temporary directory.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }
}

impl IO for TempFileIO {
    fn create_temp(&self) -> Result<Box<dyn File>> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("symjoin-spill-");
            b
        };
        let file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        debug!(path = %file.path().display(), "created spill file");
        Ok(Box::new(DiskFile { file, read_pos: 0 }))
    }
}

/// Deleted from disk when dropped.
pub struct DiskFile {
    file: tempfile::NamedTempFile,
    read_pos: u64,
}

impl File for DiskFile {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let file = self.file.as_file_mut();
        file.seek(SeekFrom::End(0))?;
        let mut written = 0;
        while written < buf.len() {
            match file.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let file = self.file.as_file_mut();
        file.seek(SeekFrom::Start(self.read_pos))?;
        loop {
            match file.read(buf) {
                Ok(n) => {
                    self.read_pos += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        self.file.as_file_mut().flush()?;
        self.read_pos = 0;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.as_file().metadata()?.len())
    }

    fn path(&self) -> Option<&Path> {
        Some(self.file.path())
    }
}

//! Spill files for rows whose batch is not resident.
//!
//! Each record is laid out as `[hash: u32][TupleHeader][payload]`, all
//! little-endian and without padding. The header carries the payload length
//! and column count needed to rebuild the row, plus the arrival and eviction
//! stamps the batch phase uses to skip pairs already joined in memory.
use crate::{
    error::JoinError,
    io::{File, IO},
    types::Row,
    Result,
};

pub const HASH_SIZE: usize = 4;
pub const TUPLE_HEADER_SIZE: usize = 24;
const PAYLOAD_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TupleHeader {
    pub payload_len: u32,
    pub natts: u16,
    pub flags: u16,
    pub arrival: u64,
    pub eviction: u64,
}

impl TupleHeader {
    pub const MATCHED: u16 = 0x1;

    pub fn matched(&self) -> bool {
        self.flags & Self::MATCHED != 0
    }

    pub fn to_bytes(&self) -> [u8; TUPLE_HEADER_SIZE] {
        let mut buf = [0u8; TUPLE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[4..6].copy_from_slice(&self.natts.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.arrival.to_le_bytes());
        buf[16..24].copy_from_slice(&self.eviction.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; TUPLE_HEADER_SIZE]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            u64::from_le_bytes(b)
        };
        Self {
            payload_len: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            natts: u16_at(4),
            flags: u16_at(6),
            arrival: u64_at(8),
            eviction: u64_at(16),
        }
    }
}

/// One record read back from a spill file.
#[derive(Debug, Clone, PartialEq)]
pub struct SpillRecord {
    pub hash: u32,
    pub header: TupleHeader,
    pub row: Row,
}

/// The spill file of one batch. Created lazily on the first append and
/// deleted when dropped.
#[derive(Default)]
pub struct BatchFile {
    file: Option<Box<dyn File>>,
    rows: u64,
    bytes: u64,
    payload: Vec<u8>,
}

impl BatchFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing file, positioned for reading.
    pub fn from_file(file: Box<dyn File>) -> Self {
        Self {
            file: Some(file),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Records appended since creation.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Appends one record and returns the number of bytes written.
    pub fn append(
        &mut self,
        io: &dyn IO,
        hash: u32,
        arrival: u64,
        eviction: u64,
        matched: bool,
        row: &Row,
    ) -> Result<usize> {
        if self.file.is_none() {
            self.file = Some(io.create_temp()?);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(JoinError::InternalError("spill file missing".into()));
        };

        self.payload.clear();
        row.serialize(&mut self.payload);
        let payload_len = u32::try_from(self.payload.len()).map_err(|_| {
            JoinError::InvalidArgument(format!("row of {} bytes is too large to spill", self.payload.len()))
        })?;
        let natts = u16::try_from(row.len()).map_err(|_| {
            JoinError::InvalidArgument(format!("row of {} columns is too wide to spill", row.len()))
        })?;
        let header = TupleHeader {
            payload_len,
            natts,
            flags: if matched { TupleHeader::MATCHED } else { 0 },
            arrival,
            eviction,
        };

        write_exact(file.as_mut(), &hash.to_le_bytes())?;
        write_exact(file.as_mut(), &header.to_bytes())?;
        write_exact(file.as_mut(), &self.payload)?;

        let written = HASH_SIZE + TUPLE_HEADER_SIZE + self.payload.len();
        self.rows += 1;
        self.bytes += written as u64;
        Ok(written)
    }

    /// Positions the file at its first record.
    pub fn rewind(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.rewind()?;
        }
        Ok(())
    }

    /// Reads the next record, or `None` at a clean end of file.
    pub fn read_next(&mut self) -> Result<Option<SpillRecord>> {
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };

        let mut hash_buf = [0u8; HASH_SIZE];
        match read_full(file.as_mut(), &mut hash_buf)? {
            0 => return Ok(None),
            HASH_SIZE => {}
            read => {
                return Err(JoinError::ShortRead {
                    expected: HASH_SIZE,
                    read,
                })
            }
        }
        let hash = u32::from_le_bytes(hash_buf);

        let mut header_buf = [0u8; TUPLE_HEADER_SIZE];
        read_exact(file.as_mut(), &mut header_buf)?;
        let header = TupleHeader::from_bytes(&header_buf);

        read_payload(file.as_mut(), &mut self.payload, header.payload_len as usize)?;
        let row = Row::deserialize(&self.payload, header.natts as usize)?;

        Ok(Some(SpillRecord { hash, header, row }))
    }
}

/// Reads a payload of `len` bytes into `buf`, growing it one chunk at a
/// time so a corrupt length fails on the short read instead of allocating.
fn read_payload(file: &mut dyn File, buf: &mut Vec<u8>, len: usize) -> Result<()> {
    buf.clear();
    while buf.len() < len {
        let start = buf.len();
        let end = len.min(start + PAYLOAD_CHUNK_SIZE);
        buf.resize(end, 0);
        let read = read_full(file, &mut buf[start..end])?;
        if read != end - start {
            return Err(JoinError::ShortRead {
                expected: len,
                read: start + read,
            });
        }
    }
    Ok(())
}

fn write_exact(file: &mut dyn File, buf: &[u8]) -> Result<()> {
    let written = file.write(buf)?;
    if written != buf.len() {
        return Err(JoinError::ShortWrite {
            expected: buf.len(),
            written,
        });
    }
    Ok(())
}

/// Fills `buf` unless the file ends first; returns the bytes read.
fn read_full(file: &mut dyn File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn read_exact(file: &mut dyn File, buf: &mut [u8]) -> Result<()> {
    let read = read_full(file, buf)?;
    if read != buf.len() {
        return Err(JoinError::ShortRead {
            expected: buf.len(),
            read,
        });
    }
    Ok(())
}

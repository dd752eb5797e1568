use std::fmt::Display;

use crate::{error::JoinError, Result};

const NULL_TAG: u8 = 0;
const INT_TAG: u8 = 1;
const FLOAT_TAG: u8 = 2;
const TEXT_TAG: u8 = 3;
const BLOB_TAG: u8 = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn build_text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn from_blob(data: Vec<u8>) -> Self {
        Self::Blob(data)
    }

    pub fn to_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Approximate heap footprint, used for memory budgeting.
    pub fn mem_size(&self) -> usize {
        let heap = match self {
            Self::Text(t) => t.capacity(),
            Self::Blob(b) => b.capacity(),
            _ => 0,
        };
        std::mem::size_of::<Value>() + heap
    }

    fn serialized_len(&self) -> usize {
        1 + match self {
            Self::Null => 0,
            Self::Integer(_) | Self::Float(_) => 8,
            Self::Text(t) => varint_len(t.len() as u64) + t.len(),
            Self::Blob(b) => varint_len(b.len() as u64) + b.len(),
        }
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            Self::Null => out.push(NULL_TAG),
            Self::Integer(i) => {
                out.push(INT_TAG);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Self::Float(f) => {
                out.push(FLOAT_TAG);
                out.extend_from_slice(&f.to_le_bytes());
            }
            Self::Text(t) => {
                out.push(TEXT_TAG);
                push_varint(out, t.len() as u64);
                out.extend_from_slice(t.as_bytes());
            }
            Self::Blob(b) => {
                out.push(BLOB_TAG);
                push_varint(out, b.len() as u64);
                out.extend_from_slice(b);
            }
        }
    }

    fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        let Some(&tag) = buf.first() else {
            return Err(JoinError::Corrupt("truncated value tag".into()));
        };
        let rest = &buf[1..];
        match tag {
            NULL_TAG => Ok((Self::Null, 1)),
            INT_TAG => {
                let bytes = fixed8(rest)?;
                Ok((Self::Integer(i64::from_le_bytes(bytes)), 9))
            }
            FLOAT_TAG => {
                let bytes = fixed8(rest)?;
                Ok((Self::Float(f64::from_le_bytes(bytes)), 9))
            }
            TEXT_TAG | BLOB_TAG => {
                let (len, n) = read_varint(rest)?;
                let body = usize::try_from(len)
                    .ok()
                    .and_then(|len| n.checked_add(len))
                    .and_then(|end| rest.get(n..end))
                    .ok_or_else(|| JoinError::Corrupt(format!("truncated value body of {len} bytes")))?;
                let len = body.len();
                let value = if tag == TEXT_TAG {
                    let text = std::str::from_utf8(body)
                        .map_err(|e| JoinError::Corrupt(format!("invalid UTF-8 in text value: {e}")))?;
                    Self::Text(text.to_string())
                } else {
                    Self::Blob(body.to_vec())
                };
                Ok((value, 1 + n + len))
            }
            other => Err(JoinError::Corrupt(format!("unknown value tag {other}"))),
        }
    }
}

fn fixed8(buf: &[u8]) -> Result<[u8; 8]> {
    buf.get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| JoinError::Corrupt("truncated fixed-width value".into()))
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(fl) => write!(f, "{fl}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Blob(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

/// An owned tuple. Clones are deep copies; no two holders ever share a row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// All-NULL row of the given width, used to null-extend outer joins.
    pub fn null(width: usize) -> Self {
        Self {
            values: vec![Value::Null; width],
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Row>() + self.values.iter().map(Value::mem_size).sum::<usize>()
    }

    /// Length in bytes of the row's serialized payload.
    pub fn payload_size(&self) -> usize {
        self.values.iter().map(Value::serialized_len).sum()
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.reserve(self.payload_size());
        for value in &self.values {
            value.serialize(out);
        }
    }

    /// Rebuilds a row of `natts` columns from a payload. The row owns copies
    /// of every value; nothing borrows from `buf`.
    pub fn deserialize(buf: &[u8], natts: usize) -> Result<Self> {
        let mut values = Vec::with_capacity(natts);
        let mut offset = 0;
        for _ in 0..natts {
            let (value, n) = Value::deserialize(&buf[offset..])?;
            values.push(value);
            offset += n;
        }
        if offset != buf.len() {
            return Err(JoinError::Corrupt(format!(
                "row payload has {} trailing bytes",
                buf.len() - offset
            )));
        }
        Ok(Self { values })
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

pub fn varint_len(value: u64) -> usize {
    if value <= 0x7f {
        return 1;
    }
    if value & (0xff000000_u64 << 32) != 0 {
        return 9;
    }
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Writes a SQLite-style big-endian varint into `buf`, returning its length.
pub fn write_varint(buf: &mut [u8], value: u64) -> usize {
    if value <= 0x7f {
        buf[0] = value as u8;
        return 1;
    }
    if value & (0xff000000_u64 << 32) != 0 {
        let mut v = value;
        buf[8] = v as u8;
        v >>= 8;
        for i in (0..8).rev() {
            buf[i] = ((v & 0x7f) | 0x80) as u8;
            v >>= 7;
        }
        return 9;
    }
    let mut encoded = [0u8; 9];
    let mut n = 0;
    let mut v = value;
    while v != 0 {
        encoded[n] = ((v & 0x7f) | 0x80) as u8;
        n += 1;
        v >>= 7;
    }
    encoded[0] &= 0x7f;
    for i in 0..n {
        buf[i] = encoded[n - 1 - i];
    }
    n
}

fn push_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; 9];
    let n = write_varint(&mut buf, value);
    out.extend_from_slice(&buf[..n]);
}

pub fn read_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut v: u64 = 0;
    for i in 0..8 {
        match buf.get(i) {
            Some(c) => {
                v = (v << 7) + (c & 0x7f) as u64;
                if (c & 0x80) == 0 {
                    return Ok((v, i + 1));
                }
            }
            None => return Err(JoinError::Corrupt("invalid varint".into())),
        }
    }
    match buf.get(8) {
        Some(&c) => {
            v = (v << 8) + c as u64;
            Ok((v, 9))
        }
        None => Err(JoinError::Corrupt("invalid varint".into())),
    }
}

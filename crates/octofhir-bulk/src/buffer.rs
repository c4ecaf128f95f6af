//! In-memory NDJSON chunk accumulator.
//!
//! A [`ChunkBuffer`] collects serialized records until the checkpoint policy
//! decides the bytes should become an upload part. The buffer itself never
//! enforces a size limit.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

/// Record separator appended after every resource, including the last one.
pub const RECORD_SEPARATOR: u8 = b'\n';

/// Why a single record could not be appended.
#[derive(Debug)]
pub enum AppendError {
    /// The record itself could not be rendered as JSON. Per-record; the
    /// caller counts it and moves on.
    Serialize(serde_json::Error),
    /// Writing into the buffer failed. Fatal to the partition.
    Io(std::io::Error),
}

impl From<serde_json::Error> for AppendError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::Io(err.into())
        } else {
            Self::Serialize(err)
        }
    }
}

/// Bytes drained from a [`ChunkBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub bytes: Bytes,
    /// Number of records contained in `bytes`.
    pub records: u64,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Byte accumulator owned by exactly one partition.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    bytes: BytesMut,
    records: u64,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a buffer from bytes carried inside a checkpoint.
    pub fn from_carry_over(carried: &str, records: u64) -> Self {
        let mut buffer = Self::new();
        buffer.append(carried.as_bytes());
        buffer.records = records;
        buffer
    }

    /// Append raw bytes verbatim.
    pub fn append(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Serialize `record` as one compact JSON line followed by
    /// [`RECORD_SEPARATOR`]. On failure nothing of the record remains in the
    /// buffer. Returns the number of bytes appended.
    pub fn append_record<T: Serialize + ?Sized>(
        &mut self,
        record: &T,
    ) -> Result<usize, AppendError> {
        let start = self.bytes.len();
        let mut writer = (&mut self.bytes).writer();
        if let Err(err) = serde_json::to_writer(&mut writer, record) {
            self.bytes.truncate(start);
            return Err(err.into());
        }
        self.bytes.put_u8(RECORD_SEPARATOR);
        self.records += 1;
        Ok(self.bytes.len() - start)
    }

    /// Current buffered byte count.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Records appended since the last drain.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Buffered bytes as text, for carrying them inside a checkpoint.
    pub fn as_carry_over(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Take everything appended since the previous drain and reset to empty.
    pub fn drain(&mut self) -> Chunk {
        let records = std::mem::take(&mut self.records);
        Chunk {
            bytes: self.bytes.split().freeze(),
            records,
        }
    }
}

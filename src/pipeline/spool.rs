//! Spool record extraction: split an EMF spool capture into embedded metafiles.
//!
//! ## Wire format
//!
//! ```text
//! ┌──────────────┬────────────────┬──────────────────────┬─────────┐
//! │ record_id u32│ record_size u32│ payload (record_size)│ pad 0-3 │  … repeat
//! └──────────────┴────────────────┴──────────────────────┴─────────┘
//!   little-endian, 8-byte header      next record starts on a 4-byte boundary
//! ```
//!
//! Records with id [`METAFILE_RECORD_ID`] carry one complete embedded
//! metafile; every other id is skipped but still consumes its declared span.
//!
//! ## Truncation vs. corruption
//!
//! A capture cut short (fewer than 8 bytes left, or a declared size running
//! past the end) is an ordinary end-of-stream: everything yielded so far is
//! valid and [`RecordCursor::is_truncated`] reports the early stop. A record
//! that would not move the cursor forward is different: continuing would
//! spin forever, so it ends the sequence with a [`MalformedSpool`] error.
//!
//! ## Does `record_size` include the header?
//!
//! Captures seen in the wild use payload-only sizes, but some producers
//! count the header as well. [`SizeConvention`] makes the choice explicit
//! instead of baking one reading into the arithmetic.

use serde::{Deserialize, Serialize};
use std::iter::FusedIterator;
use thiserror::Error;

/// Length of the fixed `(record_id, record_size)` header.
pub const RECORD_HEADER_LEN: usize = 8;

/// `EMRI_METAFILE_DATA`: the record carries an embedded page-description blob.
pub const METAFILE_RECORD_ID: u32 = 0x0000_000C;

/// How `record_size` relates to the bytes a record occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeConvention {
    /// `record_size` counts payload bytes only; the record spans `8 + record_size`. (default)
    #[default]
    PayloadOnly,
    /// `record_size` counts the 8-byte header too; the record spans `record_size`.
    IncludesHeader,
}

/// Fixed 8-byte record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_id: u32,
    pub record_size: u32,
}

impl RecordHeader {
    /// Decode a header from the first [`RECORD_HEADER_LEN`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let id: [u8; 4] = bytes.get(0..4)?.try_into().ok()?;
        let size: [u8; 4] = bytes.get(4..8)?.try_into().ok()?;
        Some(Self {
            record_id: u32::from_le_bytes(id),
            record_size: u32::from_le_bytes(size),
        })
    }

    pub fn is_metafile(&self) -> bool {
        self.record_id == METAFILE_RECORD_ID
    }

    /// Zero bytes needed after the payload to reach the next 4-byte boundary.
    pub fn padding(&self) -> usize {
        (4 - self.record_size as usize % 4) % 4
    }
}

/// One framed record borrowed from the spool buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    /// Byte offset of the header within the buffer.
    pub offset: usize,
    pub header: RecordHeader,
    pub payload: &'a [u8],
}

/// Structural violation that makes further extraction meaningless.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed spool record at offset {offset}: {reason}")]
pub struct MalformedSpool {
    pub offset: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Active,
    Exhausted,
    Truncated,
    Failed,
}

/// Bounded forward-only cursor over the records of a spool buffer.
///
/// Yields every record, metafile or not, in offset order. The cursor is
/// consumed by iteration and cannot be rewound.
#[derive(Debug)]
pub struct RecordCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    convention: SizeConvention,
    state: CursorState,
}

impl<'a> RecordCursor<'a> {
    pub fn new(buf: &'a [u8], convention: SizeConvention) -> Self {
        Self {
            buf,
            pos: 0,
            convention,
            state: CursorState::Active,
        }
    }

    /// Offset of the next record header (or where extraction stopped).
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// True once the cursor stopped on a partial header or a record whose
    /// declared size runs past the end of the buffer.
    pub fn is_truncated(&self) -> bool {
        self.state == CursorState::Truncated
    }

    /// Bytes left unread after the cursor stopped.
    pub fn trailing_bytes(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn fail(&mut self, reason: impl Into<String>) -> Option<Result<Record<'a>, MalformedSpool>> {
        self.state = CursorState::Failed;
        Some(Err(MalformedSpool {
            offset: self.pos,
            reason: reason.into(),
        }))
    }

    /// Validate a forward step of `by` bytes, refusing any step that makes
    /// no progress.
    fn checked_step(&self, by: usize) -> Result<usize, MalformedSpool> {
        if by == 0 {
            return Err(MalformedSpool {
                offset: self.pos,
                reason: "record makes no forward progress".into(),
            });
        }
        // Missing padding after the final record is tolerated.
        Ok(self.pos.saturating_add(by).min(self.buf.len()))
    }
}

impl<'a> Iterator for RecordCursor<'a> {
    type Item = Result<Record<'a>, MalformedSpool>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != CursorState::Active {
            return None;
        }

        let remaining = self.buf.len() - self.pos;
        if remaining < RECORD_HEADER_LEN {
            self.state = if remaining == 0 {
                CursorState::Exhausted
            } else {
                CursorState::Truncated
            };
            return None;
        }

        let header = RecordHeader::parse(&self.buf[self.pos..])?;
        let size = header.record_size as usize;

        let span = match self.convention {
            SizeConvention::PayloadOnly => RECORD_HEADER_LEN.checked_add(size),
            SizeConvention::IncludesHeader => Some(size),
        };
        let Some(advance) = span.and_then(|s| s.checked_add(header.padding())) else {
            return self.fail(format!("record size {size} overflows the cursor"));
        };
        let span = advance - header.padding();

        let next_pos = match self.checked_step(advance) {
            Ok(pos) => pos,
            Err(e) => {
                self.state = CursorState::Failed;
                return Some(Err(e));
            }
        };
        if span < RECORD_HEADER_LEN {
            return self.fail(format!(
                "declared size {size} is smaller than the {RECORD_HEADER_LEN}-byte header"
            ));
        }
        if span > remaining {
            self.state = CursorState::Truncated;
            return None;
        }

        let offset = self.pos;
        self.pos = next_pos;
        Some(Ok(Record {
            offset,
            header,
            payload: &self.buf[offset + RECORD_HEADER_LEN..offset + span],
        }))
    }
}

impl FusedIterator for RecordCursor<'_> {}

/// Lazy sequence of embedded metafile payloads, in encounter order.
#[derive(Debug)]
pub struct MetafileRecords<'a> {
    cursor: RecordCursor<'a>,
}

impl<'a> MetafileRecords<'a> {
    pub fn is_truncated(&self) -> bool {
        self.cursor.is_truncated()
    }

    pub fn offset(&self) -> usize {
        self.cursor.offset()
    }
}

impl<'a> Iterator for MetafileRecords<'a> {
    type Item = Result<&'a [u8], MalformedSpool>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.cursor.next()? {
                Ok(record) if record.header.is_metafile() => return Some(Ok(record.payload)),
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl FusedIterator for MetafileRecords<'_> {}

/// Iterate over every record in `buf`.
pub fn records(buf: &[u8], convention: SizeConvention) -> RecordCursor<'_> {
    RecordCursor::new(buf, convention)
}

/// Iterate over the payloads of the metafile records in `buf`.
pub fn metafile_records(buf: &[u8], convention: SizeConvention) -> MetafileRecords<'_> {
    MetafileRecords {
        cursor: RecordCursor::new(buf, convention),
    }
}

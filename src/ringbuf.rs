//! Ring-buffer page framing and record walking.
//!
//! A per-CPU trace file is a concatenation of fixed-size pages. Each page
//! carries a 64-bit base timestamp and a commit length, followed by
//! variable-length records. Every record header packs a 5-bit type_len code
//! and a 27-bit time delta relative to the running page time.

use std::fmt;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::format::HeaderFormat;

/// Byte order of the captured trace. Kernels on big-endian hardware write
/// big-endian buffers; everything else is little-endian.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    pub fn read_u16(&self, buf: &[u8]) -> u16 {
        match self {
            Endianness::Little => LittleEndian::read_u16(buf),
            Endianness::Big => BigEndian::read_u16(buf),
        }
    }

    pub fn read_u32(&self, buf: &[u8]) -> u32 {
        match self {
            Endianness::Little => LittleEndian::read_u32(buf),
            Endianness::Big => BigEndian::read_u32(buf),
        }
    }

    pub fn read_u64(&self, buf: &[u8]) -> u64 {
        match self {
            Endianness::Little => LittleEndian::read_u64(buf),
            Endianness::Big => BigEndian::read_u64(buf),
        }
    }

    /// Read an unsigned integer of 1..=8 bytes.
    pub fn read_uint(&self, buf: &[u8], nbytes: usize) -> u64 {
        match self {
            Endianness::Little => LittleEndian::read_uint(buf, nbytes),
            Endianness::Big => BigEndian::read_uint(buf, nbytes),
        }
    }

    /// Read a sign-extended integer of 1..=8 bytes.
    pub fn read_int(&self, buf: &[u8], nbytes: usize) -> i64 {
        match self {
            Endianness::Little => LittleEndian::read_int(buf, nbytes),
            Endianness::Big => BigEndian::read_int(buf, nbytes),
        }
    }
}

const TYPE_LEN_TIME_EXTEND: u32 = 29;
const TYPE_LEN_TIME_STAMP: u32 = 30;
const TYPE_LEN_PADDING: u32 = 31;

/// Errors raised while decoding a per-CPU byte stream.
#[derive(Debug)]
pub enum DecodeError {
    /// A page (or a record within it) is shorter than its framing claims.
    TruncatedPage { reason: String },
    /// A record's event id has no format in the catalog.
    UnknownEvent { id: u16 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TruncatedPage { reason } => write!(f, "truncated page: {reason}"),
            DecodeError::UnknownEvent { id } => write!(f, "no event format with id {id}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// One decoded page: base timestamp, committed payload, overwrite flag.
#[derive(Debug)]
pub struct Page<'a> {
    pub base_timestamp: u64,
    pub overwrite: bool,
    /// Payload bytes covered by the commit length.
    pub data: &'a [u8],
}

/// Decode a page's header. The commit word's low bits give the committed
/// payload length; its top bit flags pages written in overwrite mode.
pub fn parse_page<'a>(
    header: &HeaderFormat,
    page: &'a [u8],
    endian: Endianness,
) -> Result<Page<'a>, DecodeError> {
    let page_size = header.page_size().map_err(|e| DecodeError::TruncatedPage {
        reason: e.to_string(),
    })?;
    if page.len() < page_size {
        return Err(DecodeError::TruncatedPage {
            reason: format!("page has {} bytes, layout requires {page_size}", page.len()),
        });
    }
    let data_offset = header.data_offset().map_err(|e| DecodeError::TruncatedPage {
        reason: e.to_string(),
    })?;
    let commit_offset = header
        .commit_offset()
        .map_err(|e| DecodeError::TruncatedPage {
            reason: e.to_string(),
        })?;
    let commit_size = header.commit_size().map_err(|e| DecodeError::TruncatedPage {
        reason: e.to_string(),
    })?;

    let base_timestamp = endian.read_u64(&page[..8]);
    let commit_word =
        endian.read_uint(&page[commit_offset..commit_offset + commit_size], commit_size);
    let flag_bit = commit_size as u64 * 8 - 1;
    let overwrite = commit_word >> flag_bit != 0;
    let committed = (commit_word & !(1 << flag_bit)) as usize;

    let payload = &page[data_offset..page_size];
    if committed > payload.len() {
        return Err(DecodeError::TruncatedPage {
            reason: format!(
                "commit length {committed} exceeds payload size {}",
                payload.len()
            ),
        });
    }
    Ok(Page {
        base_timestamp,
        overwrite,
        data: &payload[..committed],
    })
}

/// One event record pulled out of a page, with its absolute timestamp.
#[derive(Debug, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub timestamp: u64,
    pub data: &'a [u8],
}

/// Walks the records of one page, maintaining the running timestamp.
///
/// `event_length` resolves the byte length of a type_len-0 record from the
/// event id found in its body; it returns `None` for unknown ids, which
/// makes further framing impossible and surfaces as `UnknownEvent`.
pub struct RecordIter<'a, F> {
    data: &'a [u8],
    cursor: usize,
    time: u64,
    endian: Endianness,
    event_length: F,
    done: bool,
}

impl<'a, F> RecordIter<'a, F>
where
    F: Fn(u16) -> Option<usize>,
{
    pub fn new(page: &Page<'a>, endian: Endianness, event_length: F) -> Self {
        RecordIter {
            data: page.data,
            cursor: 0,
            time: page.base_timestamp,
            endian,
            event_length,
            done: false,
        }
    }

    /// The 32-bit extension word following time-extend and time-stamp
    /// headers.
    fn extension(&self) -> Option<u64> {
        let at = self.cursor + 4;
        if at + 4 > self.data.len() {
            return None;
        }
        Some(self.endian.read_u32(&self.data[at..at + 4]) as u64)
    }
}

impl<'a, F> Iterator for RecordIter<'a, F>
where
    F: Fn(u16) -> Option<usize>,
{
    type Item = Result<RawRecord<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.cursor + 4 > self.data.len() {
                return None;
            }
            let word = self.endian.read_u32(&self.data[self.cursor..self.cursor + 4]);
            let type_len = word & 0x1f;
            let delta = (word >> 5) as u64;

            match type_len {
                TYPE_LEN_PADDING => {
                    self.done = true;
                    return None;
                }
                TYPE_LEN_TIME_EXTEND => {
                    // 59-bit delta: 27 low bits in the header, 32 more in
                    // the extension word.
                    let ext = match self.extension() {
                        Some(ext) => ext,
                        None => {
                            self.done = true;
                            return Some(Err(DecodeError::TruncatedPage {
                                reason: "time-extend record crosses commit boundary".to_string(),
                            }));
                        }
                    };
                    self.time += (ext << 27) | delta;
                    self.cursor += 8;
                }
                TYPE_LEN_TIME_STAMP => {
                    let ext = match self.extension() {
                        Some(ext) => ext,
                        None => {
                            self.done = true;
                            return Some(Err(DecodeError::TruncatedPage {
                                reason: "time-stamp record crosses commit boundary".to_string(),
                            }));
                        }
                    };
                    self.time = (ext << 27) | delta;
                    self.cursor += 8;
                }
                0 => {
                    // Length comes from the event format, keyed by the
                    // common_type field at the start of the body.
                    if self.cursor + 6 > self.data.len() {
                        self.done = true;
                        return None;
                    }
                    let id = self
                        .endian
                        .read_u16(&self.data[self.cursor + 4..self.cursor + 6]);
                    let len = match (self.event_length)(id) {
                        Some(len) => len,
                        None => {
                            self.done = true;
                            return Some(Err(DecodeError::UnknownEvent { id }));
                        }
                    };
                    let start = self.cursor + 4;
                    if start + len > self.data.len() {
                        self.done = true;
                        return None;
                    }
                    self.time += delta;
                    self.cursor = start + len;
                    return Some(Ok(RawRecord {
                        timestamp: self.time,
                        data: &self.data[start..start + len],
                    }));
                }
                type_len => {
                    let len = type_len as usize * 4;
                    let start = self.cursor + 4;
                    if start + len > self.data.len() {
                        // A record crossing the commit boundary ends the page.
                        self.done = true;
                        return None;
                    }
                    self.time += delta;
                    self.cursor = start + len;
                    return Some(Ok(RawRecord {
                        timestamp: self.time,
                        data: &self.data[start..start + len],
                    }));
                }
            }
        }
    }
}

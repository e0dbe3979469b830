//! The raw trace parser: format catalog + ring-buffer decoding + event
//! projection.
//!
//! A [`TraceParser`] is built once from the `header_page` format and the
//! event format files, then fed per-CPU binary buffers. Each record is
//! located by the ring-buffer framing in [`crate::ringbuf`] and projected
//! into a [`TraceEvent`] using the field layout of its format.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::events::{CpuId, TraceEvent};
use crate::format::{
    parse_event_format, parse_header_format, EventFormat, FieldDef, HeaderFormat, SemanticType,
};
use crate::ringbuf::{parse_page, DecodeError, Endianness, RecordIter};

/// Parses per-CPU ring-buffer dumps into typed events.
pub struct TraceParser {
    header: HeaderFormat,
    formats: HashMap<u16, EventFormat>,
    endian: Endianness,
    fail_on_unknown_event_format: bool,
}

impl TraceParser {
    /// Build a parser from the `header_page` text and one text blob per
    /// event format file.
    pub fn new<'a>(
        header_text: &str,
        format_texts: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self> {
        let header = parse_header_format(header_text, true)?;
        let mut formats = HashMap::new();
        for text in format_texts {
            let format = parse_event_format(text, true)?;
            if let Some(previous) = formats.insert(format.id, format) {
                anyhow::bail!(
                    "duplicate event format id {} ('{}')",
                    previous.id,
                    previous.name
                );
            }
        }
        Ok(TraceParser {
            header,
            formats,
            endian: Endianness::Little,
            fail_on_unknown_event_format: true,
        })
    }

    pub fn set_endianness(&mut self, endian: Endianness) {
        self.endian = endian;
    }

    /// When false, records with unrecognized event ids are emitted as
    /// `"unknown"` events with empty fields instead of failing.
    pub fn set_fail_on_unknown_event_format(&mut self, fail: bool) {
        self.fail_on_unknown_event_format = fail;
    }

    pub fn formats(&self) -> impl Iterator<Item = &EventFormat> {
        self.formats.values()
    }

    pub fn header(&self) -> &HeaderFormat {
        &self.header
    }

    /// Walk every page of one CPU's buffer, invoking `callback` for each
    /// decoded event. The callback returns `false` to stop early.
    ///
    /// Events are emitted with `index` 0; the event-set builder assigns
    /// trace-wide indices. Events on pages flagged overwrite are emitted
    /// clipped.
    pub fn parse_trace<F>(&self, data: &[u8], cpu: CpuId, mut callback: F) -> Result<()>
    where
        F: FnMut(TraceEvent) -> Result<bool>,
    {
        let page_size = self.header.page_size()?;
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + page_size).min(data.len());
            let page = parse_page(&self.header, &data[offset..end], self.endian)
                .with_context(|| format!("cpu{cpu}: page at byte offset {offset}"))?;
            let records = RecordIter::new(&page, self.endian, |id| {
                self.formats.get(&id).map(|f| f.record_length())
            });
            for record in records {
                let record = match record {
                    Ok(record) => record,
                    Err(DecodeError::UnknownEvent { id })
                        if !self.fail_on_unknown_event_format =>
                    {
                        // Without a format the record cannot even be
                        // framed, so the rest of this page is opaque.
                        tracing::debug!(cpu, id, "skipping page tail after unknown event id");
                        break;
                    }
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("cpu{cpu}: page at byte offset {offset}"))
                    }
                };
                let event = self.project(cpu, record.timestamp, page.overwrite, record.data)?;
                if !callback(event)? {
                    return Ok(());
                }
            }
            offset += page_size;
        }
        Ok(())
    }

    /// Project one raw record into a typed event using its format.
    fn project(
        &self,
        cpu: CpuId,
        timestamp: u64,
        clipped: bool,
        data: &[u8],
    ) -> Result<TraceEvent> {
        if data.len() < 2 {
            anyhow::bail!("record too short to carry an event id");
        }
        let id = self.endian.read_u16(&data[..2]);
        let mut event = TraceEvent {
            cpu,
            timestamp: timestamp as i64,
            clipped,
            ..Default::default()
        };
        let format = match self.formats.get(&id) {
            Some(format) => format,
            None if self.fail_on_unknown_event_format => {
                return Err(DecodeError::UnknownEvent { id }).context("projecting record");
            }
            None => {
                event.name = "unknown".to_string();
                return Ok(event);
            }
        };
        event.name = format.name.clone();
        for field in format.common_fields.iter().chain(format.fields.iter()) {
            if field.offset + field.size > data.len() {
                tracing::debug!(
                    event = %format.name,
                    field = %field.name,
                    "field extends past record payload, skipping"
                );
                continue;
            }
            let bytes = &data[field.offset..field.offset + field.size];
            match field.semantic_type {
                SemanticType::CharArray | SemanticType::Str => {
                    event
                        .text_properties
                        .insert(field.name.clone(), decode_string(bytes));
                }
                SemanticType::SignedInt => {
                    event
                        .number_properties
                        .insert(field.name.clone(), self.decode_int(field, bytes, true));
                }
                SemanticType::UnsignedInt => {
                    event
                        .number_properties
                        .insert(field.name.clone(), self.decode_int(field, bytes, false));
                }
            }
        }
        Ok(event)
    }

    fn decode_int(&self, field: &FieldDef, bytes: &[u8], signed: bool) -> i64 {
        let width = field.size.min(8);
        if signed || field.signed {
            self.endian.read_int(&bytes[..width], width)
        } else {
            self.endian.read_uint(&bytes[..width], width) as i64
        }
    }
}

/// NUL-terminated bytes to a string, lossily.
fn decode_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn stats_counter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(overrun|commit overrun|dropped events):\s*(\d+)\s*$").unwrap()
    })
}

/// The clipping oracle: a CPU is clipped if its stats file reports any lost
/// events (`overrun`, `commit overrun`, or `dropped events` non-zero).
pub fn cpu_overflowed(stats_text: &str) -> Result<bool> {
    let mut seen = 0;
    for caps in stats_counter_re().captures_iter(stats_text) {
        seen += 1;
        let count: u64 = caps[2]
            .parse()
            .with_context(|| format!("parsing '{}' counter", &caps[1]))?;
        if count != 0 {
            return Ok(true);
        }
    }
    if seen == 0 {
        anyhow::bail!("stats text carries no overrun counters");
    }
    Ok(false)
}

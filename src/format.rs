//! Parsing of ftrace `events/*/format` description files.
//!
//! Every event the kernel can emit is described by a text file listing its
//! fields with byte offsets, sizes, and signedness. The ring-buffer page
//! layout itself is described by the same grammar in the `header_page` file.
//! This module turns that text into typed layouts the decoder can use.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Semantic interpretation of a field, inferred from its C declarator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemanticType {
    SignedInt,
    UnsignedInt,
    Str,
    CharArray,
}

/// A single field of an event record.
///
/// # Fields
/// - `name`: field name from the declarator (e.g. `prev_pid`)
/// - `semantic_type`: how the bytes should be interpreted
/// - `offset`: byte offset within the record
/// - `size`: total byte size of the field
/// - `element_size`: size of one element (`size / element_count`)
/// - `element_count`: array length from a bracketed dimension, else 1
/// - `signed`: the `signed:` attribute from the format file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub semantic_type: SemanticType,
    pub offset: usize,
    pub size: usize,
    pub element_size: usize,
    pub element_count: usize,
    pub signed: bool,
}

/// Layout of one event type, keyed by its numeric id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFormat {
    pub id: u16,
    pub name: String,
    pub common_fields: Vec<FieldDef>,
    pub fields: Vec<FieldDef>,
}

impl EventFormat {
    /// Look up a field by name, checking event fields before common ones.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields
            .iter()
            .chain(self.common_fields.iter())
            .find(|f| f.name == name)
    }

    /// Byte length of one record of this event, aligned to the 4-byte
    /// ring-buffer word size.
    pub fn record_length(&self) -> usize {
        let end = self
            .common_fields
            .iter()
            .chain(self.fields.iter())
            .map(|f| f.offset + f.size)
            .max()
            .unwrap_or(0);
        (end + 3) & !3
    }
}

/// Layout of the per-page ring-buffer header: a 64-bit base timestamp, a
/// commit length whose width distinguishes 32- from 64-bit captures, an
/// overwrite flag, and the payload byte array.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderFormat {
    pub fields: Vec<FieldDef>,
}

impl HeaderFormat {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn required(&self, name: &'static str) -> Result<&FieldDef, FormatError> {
        self.field(name)
            .ok_or(FormatError::MissingHeaderField { name })
    }

    /// Byte offset of the record payload within a page.
    pub fn data_offset(&self) -> Result<usize, FormatError> {
        Ok(self.required("data")?.offset)
    }

    /// Total page size: payload offset plus payload length.
    pub fn page_size(&self) -> Result<usize, FormatError> {
        let data = self.required("data")?;
        Ok(data.offset + data.size)
    }

    pub fn commit_offset(&self) -> Result<usize, FormatError> {
        Ok(self.required("commit")?.offset)
    }

    /// Width of the commit field: 8 on 64-bit captures, 4 on 32-bit ones.
    pub fn commit_size(&self) -> Result<usize, FormatError> {
        let commit = self.required("commit")?;
        match commit.size {
            4 | 8 => Ok(commit.size),
            other => Err(FormatError::InvalidHeader {
                reason: format!("commit field has unsupported size {other}"),
            }),
        }
    }

    fn validate(&self) -> Result<(), FormatError> {
        let ts = self.required("timestamp")?;
        if ts.size != 8 {
            return Err(FormatError::InvalidHeader {
                reason: format!("timestamp field has size {}, expected 8", ts.size),
            });
        }
        self.commit_size()?;
        let data = self.required("data")?;
        if data.size == 0 {
            return Err(FormatError::InvalidHeader {
                reason: "data field has zero size".to_string(),
            });
        }
        Ok(())
    }
}

/// Errors raised while parsing format description text.
#[derive(Debug)]
pub enum FormatError {
    /// A `field:` line that does not match the ftrace grammar.
    MalformedLine { line: String },
    /// The event description lacks a `name:` or `ID:` header.
    MissingEventHeader { what: &'static str },
    /// The header-page format lacks a required field.
    MissingHeaderField { name: &'static str },
    /// The header-page format is structurally unusable.
    InvalidHeader { reason: String },
    /// A field's declared sizes are inconsistent.
    InconsistentField { name: String, reason: String },
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::MalformedLine { line } => {
                write!(f, "malformed format line: '{line}'")
            }
            FormatError::MissingEventHeader { what } => {
                write!(f, "event format is missing its '{what}:' header")
            }
            FormatError::MissingHeaderField { name } => {
                write!(f, "header-page format is missing the '{name}' field")
            }
            FormatError::InvalidHeader { reason } => {
                write!(f, "invalid header-page format: {reason}")
            }
            FormatError::InconsistentField { name, reason } => {
                write!(f, "field '{name}': {reason}")
            }
        }
    }
}

impl std::error::Error for FormatError {}

fn field_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*field:\s*(?P<decl>[^;]+);\s*offset:(?P<offset>\d+);\s*size:(?P<size>\d+);\s*signed:(?P<signed>\d+);\s*$")
            .unwrap()
    })
}

/// Parse one `field:` line into a `FieldDef`, or `Ok(None)` for lines that
/// are not field lines at all.
fn parse_field_line(line: &str) -> Result<Option<FieldDef>, FormatError> {
    let caps = match field_line_re().captures(line) {
        Some(caps) => caps,
        None => return Ok(None),
    };
    let decl = caps["decl"].trim();
    let offset: usize = caps["offset"].parse().map_err(|_| FormatError::MalformedLine {
        line: line.trim().to_string(),
    })?;
    let size: usize = caps["size"].parse().map_err(|_| FormatError::MalformedLine {
        line: line.trim().to_string(),
    })?;
    let signed = &caps["signed"] == "1";

    let mut tokens: Vec<&str> = decl.split_whitespace().collect();
    let declarator = match tokens.pop() {
        Some(d) => d,
        None => {
            return Err(FormatError::MalformedLine {
                line: line.trim().to_string(),
            })
        }
    };

    // A bracketed dimension on the declarator gives the element count.
    let (name, element_count) = match declarator.find('[') {
        Some(open) => {
            let close = declarator.rfind(']').ok_or_else(|| FormatError::MalformedLine {
                line: line.trim().to_string(),
            })?;
            let count: usize = declarator[open + 1..close].parse().map_err(|_| {
                FormatError::MalformedLine {
                    line: line.trim().to_string(),
                }
            })?;
            (declarator[..open].to_string(), count)
        }
        None => (declarator.to_string(), 1),
    };
    if name.is_empty() || tokens.is_empty() {
        return Err(FormatError::MalformedLine {
            line: line.trim().to_string(),
        });
    }

    let element_count = element_count.max(1);
    if size % element_count != 0 {
        return Err(FormatError::InconsistentField {
            name,
            reason: format!("size {size} is not divisible by element count {element_count}"),
        });
    }
    let element_size = size / element_count;

    let is_char = tokens.iter().any(|t| *t == "char");
    let is_unsigned = tokens
        .iter()
        .any(|t| *t == "unsigned" || matches!(*t, "u8" | "u16" | "u32" | "u64"));
    let semantic_type = if is_char {
        if element_count > 1 {
            SemanticType::CharArray
        } else {
            SemanticType::Str
        }
    } else if is_unsigned {
        SemanticType::UnsignedInt
    } else {
        SemanticType::SignedInt
    };

    Ok(Some(FieldDef {
        name,
        semantic_type,
        offset,
        size,
        element_size,
        element_count,
        signed,
    }))
}

/// Parse one `events/<sys>/<event>/format` file.
///
/// The `format:` section lists the common fields first, then the event's own
/// fields after a blank line. Unknown lines fail in strict mode and are
/// skipped otherwise.
pub fn parse_event_format(text: &str, strict: bool) -> Result<EventFormat, FormatError> {
    let mut name: Option<String> = None;
    let mut id: Option<u16> = None;
    let mut common_fields = Vec::new();
    let mut fields = Vec::new();
    let mut in_common = true;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            // A blank line inside the format section separates the common
            // fields from the event-specific ones.
            if !common_fields.is_empty() {
                in_common = false;
            }
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("name:") {
            name = Some(rest.trim().to_string());
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("ID:") {
            id = rest.trim().parse().ok();
            continue;
        }
        if trimmed == "format:" {
            continue;
        }
        if trimmed.starts_with("print fmt:") {
            break;
        }
        match parse_field_line(line) {
            Ok(Some(field)) => {
                if in_common {
                    common_fields.push(field);
                } else {
                    fields.push(field);
                }
            }
            Ok(None) | Err(_) if !strict => {
                tracing::debug!(line = trimmed, "skipping unrecognized format line");
            }
            Ok(None) => {
                return Err(FormatError::MalformedLine {
                    line: trimmed.to_string(),
                })
            }
            Err(err) => return Err(err),
        }
    }

    let name = name.ok_or(FormatError::MissingEventHeader { what: "name" })?;
    let id = id.ok_or(FormatError::MissingEventHeader { what: "ID" })?;
    Ok(EventFormat {
        id,
        name,
        common_fields,
        fields,
    })
}

/// Parse the `header_page` format file describing ring-buffer page layout.
pub fn parse_header_format(text: &str, strict: bool) -> Result<HeaderFormat, FormatError> {
    let mut fields = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_field_line(line) {
            Ok(Some(field)) => fields.push(field),
            Ok(None) | Err(_) if !strict => {
                tracing::debug!(line = trimmed, "skipping unrecognized header line");
            }
            Ok(None) => {
                return Err(FormatError::MalformedLine {
                    line: trimmed.to_string(),
                })
            }
            Err(err) => return Err(err),
        }
    }
    let header = HeaderFormat { fields };
    header.validate()?;
    Ok(header)
}

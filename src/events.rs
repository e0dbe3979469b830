//! Typed trace events, the interned string bank, and the EventSet wire model.
//!
//! The parser emits [`TraceEvent`]s; the [`EventSetBuilder`] packs them into
//! an [`EventSet`], the serializable intermediate between the converter and
//! the scheduling collection. Text field values are interned into the event
//! set's string table so repeated command names cost one slot each.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::format::{EventFormat, SemanticType};

pub type Timestamp = i64;
pub type Pid = i64;
pub type CpuId = i64;
pub type Priority = i64;

/// Stable id of an interned string; index into the string table.
pub type StringId = usize;

/// Reserved string id for threads whose command was never observed.
pub const UNKNOWN_COMMAND: StringId = 0;

const UNKNOWN_COMMAND_TEXT: &str = "<unknown>";

/// One decoded trace event.
///
/// # Fields
/// - `index`: trace-wide insertion order, assigned when the event enters an
///   event set
/// - `name`: event name from its format (`"unknown"` for unrecognized ids)
/// - `cpu`: the per-CPU buffer the event was read from
/// - `timestamp`: absolute nanoseconds from the trace origin
/// - `clipped`: the event sat in an overflowed buffer and may be misleading
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceEvent {
    pub index: usize,
    pub name: String,
    pub cpu: CpuId,
    pub timestamp: Timestamp,
    pub clipped: bool,
    pub number_properties: HashMap<String, i64>,
    pub text_properties: HashMap<String, String>,
}

impl TraceEvent {
    pub fn number(&self, name: &str) -> Option<i64> {
        self.number_properties.get(name).copied()
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.text_properties.get(name).map(String::as_str)
    }
}

/// Append-only intern table for command strings. Id 0 is reserved for
/// `"<unknown>"`; ids are stable for the lifetime of the bank.
#[derive(Clone, Debug)]
pub struct StringBank {
    strings: Vec<String>,
    ids: HashMap<String, StringId>,
}

impl Default for StringBank {
    fn default() -> Self {
        Self::new()
    }
}

impl StringBank {
    pub fn new() -> Self {
        let mut bank = StringBank {
            strings: Vec::new(),
            ids: HashMap::new(),
        };
        bank.intern(UNKNOWN_COMMAND_TEXT);
        bank
    }

    /// Rebuild a bank from a serialized string table.
    pub fn from_table(table: &[String]) -> Self {
        let mut bank = StringBank::new();
        for s in table {
            bank.intern(s);
        }
        bank
    }

    /// Return the existing id for `s` or allocate the next one. The empty
    /// string maps to [`UNKNOWN_COMMAND`].
    pub fn intern(&mut self, s: &str) -> StringId {
        if s.is_empty() {
            return UNKNOWN_COMMAND;
        }
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = self.strings.len();
        self.strings.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        id
    }

    pub fn lookup(&self, id: StringId) -> Result<&str> {
        match self.strings.get(id) {
            Some(s) => Ok(s),
            None => bail!("no string with id {id} in string bank"),
        }
    }

    pub fn table(&self) -> &[String] {
        &self.strings
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// Kind of a serialized event field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Number,
    Text,
}

/// Name and kind of one field of a serialized event type. The name is a
/// string-table id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: StringId,
    pub kind: FieldKind,
}

/// One event type in an event set: interned name plus ordered fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub name: StringId,
    pub fields: Vec<FieldDescriptor>,
}

/// Which loader group a collection should use to rebuild transitions from
/// this event set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoaderGroup {
    #[default]
    Sched,
}

/// One serialized event. `values` line up positionally with the descriptor's
/// fields; `Text` values hold string-table ids.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEventRecord {
    pub index: usize,
    pub descriptor: usize,
    pub cpu: CpuId,
    pub timestamp: Timestamp,
    pub clipped: bool,
    pub values: Vec<i64>,
}

/// The serializable intermediate form of a parsed trace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSet {
    pub string_table: Vec<String>,
    pub descriptors: Vec<EventDescriptor>,
    pub events: Vec<RawEventRecord>,
    pub default_loaders: LoaderGroup,
}

impl EventSet {
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    fn string(&self, id: StringId) -> Result<&str> {
        match self.string_table.get(id) {
            Some(s) => Ok(s.as_str()),
            None => bail!("event set references string id {id} outside its table"),
        }
    }

    /// Materialize the event at `index` back into a [`TraceEvent`].
    pub fn event(&self, index: usize) -> Result<TraceEvent> {
        let record = match self.events.get(index) {
            Some(record) => record,
            None => bail!("event index {index} out of range"),
        };
        let descriptor = match self.descriptors.get(record.descriptor) {
            Some(d) => d,
            None => bail!(
                "event {index} references descriptor {} outside the set",
                record.descriptor
            ),
        };
        if record.values.len() != descriptor.fields.len() {
            bail!(
                "event {index} carries {} values for {} descriptor fields",
                record.values.len(),
                descriptor.fields.len()
            );
        }
        let mut event = TraceEvent {
            index: record.index,
            name: self.string(descriptor.name)?.to_string(),
            cpu: record.cpu,
            timestamp: record.timestamp,
            clipped: record.clipped,
            ..Default::default()
        };
        for (field, &value) in descriptor.fields.iter().zip(record.values.iter()) {
            let name = self.string(field.name)?.to_string();
            match field.kind {
                FieldKind::Number => {
                    event.number_properties.insert(name, value);
                }
                FieldKind::Text => {
                    let text = self.string(value as StringId)?.to_string();
                    event.text_properties.insert(name, text);
                }
            }
        }
        Ok(event)
    }
}

/// Accumulates parsed events into an [`EventSet`], assigning trace-wide
/// indices in insertion order.
pub struct EventSetBuilder {
    set: EventSet,
    bank: StringBank,
    descriptor_ids: HashMap<String, usize>,
    clipped_cpus: HashSet<CpuId>,
}

impl EventSetBuilder {
    /// Pre-register a descriptor for every format in the catalog so field
    /// ordering is deterministic across runs.
    pub fn new<'a>(formats: impl IntoIterator<Item = &'a EventFormat>) -> Self {
        let mut builder = EventSetBuilder {
            set: EventSet::default(),
            bank: StringBank::new(),
            descriptor_ids: HashMap::new(),
            clipped_cpus: HashSet::new(),
        };
        let mut formats: Vec<&EventFormat> = formats.into_iter().collect();
        formats.sort_by_key(|f| f.id);
        for format in formats {
            let fields = format
                .common_fields
                .iter()
                .chain(format.fields.iter())
                .map(|f| FieldDescriptor {
                    name: builder.bank.intern(&f.name),
                    kind: match f.semantic_type {
                        SemanticType::Str | SemanticType::CharArray => FieldKind::Text,
                        SemanticType::SignedInt | SemanticType::UnsignedInt => FieldKind::Number,
                    },
                })
                .collect();
            builder.register(&format.name, fields);
        }
        builder
    }

    fn register(&mut self, name: &str, fields: Vec<FieldDescriptor>) -> usize {
        if let Some(&id) = self.descriptor_ids.get(name) {
            return id;
        }
        let id = self.set.descriptors.len();
        let name_id = self.bank.intern(name);
        self.set.descriptors.push(EventDescriptor {
            name: name_id,
            fields,
        });
        self.descriptor_ids.insert(name.to_string(), id);
        id
    }

    /// Mark whole CPUs as clipped; every event on them is flagged.
    pub fn set_clipped_cpus(&mut self, cpus: impl IntoIterator<Item = CpuId>) {
        self.clipped_cpus = cpus.into_iter().collect();
    }

    /// Append one event, assigning the next trace-wide index.
    pub fn add_trace_event(&mut self, event: &TraceEvent) -> Result<()> {
        let descriptor_id = match self.descriptor_ids.get(&event.name) {
            Some(&id) => id,
            // Events decoded leniently without a format get an empty
            // descriptor registered on first sight.
            None => self.register(&event.name, Vec::new()),
        };
        let fields = self.set.descriptors[descriptor_id].fields.clone();
        let mut values = Vec::with_capacity(fields.len());
        for field in &fields {
            let name = self.bank.lookup(field.name)?.to_string();
            let value = match field.kind {
                FieldKind::Number => event.number(&name).unwrap_or(0),
                FieldKind::Text => self.bank.intern(event.text(&name).unwrap_or("")) as i64,
            };
            values.push(value);
        }
        let index = self.set.events.len();
        self.set.events.push(RawEventRecord {
            index,
            descriptor: descriptor_id,
            cpu: event.cpu,
            timestamp: event.timestamp,
            clipped: event.clipped || self.clipped_cpus.contains(&event.cpu),
            values,
        });
        Ok(())
    }

    /// Finish the set, freezing the string table.
    pub fn finalize(mut self) -> EventSet {
        self.set.string_table = self.bank.strings;
        self.set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::parse_event_format;

    #[test]
    fn string_bank_ids_are_stable() {
        let mut bank = StringBank::new();
        assert_eq!(bank.lookup(UNKNOWN_COMMAND).unwrap(), "<unknown>");
        let a = bank.intern("bash");
        let b = bank.intern("systemd");
        assert_ne!(a, b);
        assert_eq!(bank.intern("bash"), a);
        assert_eq!(bank.lookup(a).unwrap(), "bash");
        assert_eq!(bank.lookup(b).unwrap(), "systemd");
        assert!(bank.lookup(99).is_err());
    }

    #[test]
    fn empty_string_interns_to_unknown() {
        let mut bank = StringBank::new();
        assert_eq!(bank.intern(""), UNKNOWN_COMMAND);
    }

    const WAKEUP_FORMAT: &str = "\
name: sched_wakeup
ID: 299
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:char comm[16];\toffset:8;\tsize:16;\tsigned:1;
\tfield:pid_t pid;\toffset:24;\tsize:4;\tsigned:1;
\tfield:int prio;\toffset:28;\tsize:4;\tsigned:1;
\tfield:int target_cpu;\toffset:36;\tsize:4;\tsigned:1;
";

    fn wakeup_event(ts: Timestamp, cpu: CpuId, pid: Pid, comm: &str) -> TraceEvent {
        let mut event = TraceEvent {
            name: "sched_wakeup".to_string(),
            cpu,
            timestamp: ts,
            ..Default::default()
        };
        event.number_properties.insert("pid".to_string(), pid);
        event.number_properties.insert("prio".to_string(), 120);
        event.number_properties.insert("target_cpu".to_string(), cpu);
        event
            .text_properties
            .insert("comm".to_string(), comm.to_string());
        event
    }

    #[test]
    fn event_set_round_trips_events() {
        let format = parse_event_format(WAKEUP_FORMAT, true).unwrap();
        let mut builder = EventSetBuilder::new([&format]);
        builder
            .add_trace_event(&wakeup_event(100, 1, 42, "bash"))
            .unwrap();
        builder
            .add_trace_event(&wakeup_event(200, 0, 43, "bash"))
            .unwrap();
        let set = builder.finalize();

        assert_eq!(set.event_count(), 2);
        let first = set.event(0).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.name, "sched_wakeup");
        assert_eq!(first.timestamp, 100);
        assert_eq!(first.number("pid"), Some(42));
        assert_eq!(first.number("target_cpu"), Some(1));
        assert_eq!(first.text("comm"), Some("bash"));

        // Both events share one interned "bash" slot.
        assert_eq!(
            set.string_table.iter().filter(|s| *s == "bash").count(),
            1
        );

        let json = serde_json::to_string(&set).unwrap();
        let reparsed: EventSet = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed, set);
        assert_eq!(reparsed.event(1).unwrap(), set.event(1).unwrap());
    }

    #[test]
    fn clipped_cpus_flag_their_events() {
        let format = parse_event_format(WAKEUP_FORMAT, true).unwrap();
        let mut builder = EventSetBuilder::new([&format]);
        builder.set_clipped_cpus([1]);
        builder
            .add_trace_event(&wakeup_event(100, 1, 42, "bash"))
            .unwrap();
        builder
            .add_trace_event(&wakeup_event(200, 0, 43, "sh"))
            .unwrap();
        let set = builder.finalize();
        assert!(set.event(0).unwrap().clipped);
        assert!(!set.event(1).unwrap().clipped);
    }

    #[test]
    fn unknown_events_get_an_empty_descriptor() {
        let format = parse_event_format(WAKEUP_FORMAT, true).unwrap();
        let mut builder = EventSetBuilder::new([&format]);
        let event = TraceEvent {
            name: "unknown".to_string(),
            cpu: 2,
            timestamp: 50,
            ..Default::default()
        };
        builder.add_trace_event(&event).unwrap();
        let set = builder.finalize();
        let back = set.event(0).unwrap();
        assert_eq!(back.name, "unknown");
        assert!(back.number_properties.is_empty());
        assert!(back.text_properties.is_empty());
    }
}

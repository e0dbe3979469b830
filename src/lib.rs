//! schedtrace library - ftrace scheduling-trace parsing and inference.
//!
//! This library turns raw Linux ftrace ring-buffer captures into a
//! queryable per-PID / per-CPU scheduling history. It is split along the
//! pipeline:
//!
//! - [`format`] - parsing of `events/*/format` description files
//! - [`ringbuf`] - ring-buffer page framing and record walking
//! - [`parser`] - the raw trace parser producing typed [`events::TraceEvent`]s
//! - [`events`] - the EventSet intermediate form and the string bank
//! - [`sched`] - thread-transition inference and the queryable [`sched::Collection`]
//!
//! # Example
//!
//! ```no_run
//! use schedtrace::sched::{Collection, CollectionOptions};
//!
//! let json = std::fs::read_to_string("trace.events.json")?;
//! let event_set: schedtrace::EventSet = serde_json::from_str(&json)?;
//! let collection = Collection::new(&event_set, CollectionOptions::default())?;
//! for cpu in collection.expand_cpus(&[]) {
//!     let running = collection.running_spans(cpu, &[])?;
//!     println!("cpu{cpu}: {} running spans", running.len());
//! }
//! # anyhow::Ok(())
//! ```

pub mod events;
pub mod format;
pub mod parser;
pub mod ringbuf;
pub mod sched;

// Re-export for convenience
pub use events::{EventSet, EventSetBuilder, StringBank, TraceEvent};
pub use parser::{cpu_overflowed, TraceParser};
pub use ringbuf::Endianness;
pub use sched::{Collection, CollectionOptions};

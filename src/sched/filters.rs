//! Query filters and their resolution against a collection's caches.
//!
//! Filters compose by intersection: the resolved universe starts as the
//! whole collection and every filter narrows it. An intersection that
//! leaves an empty or inverted time range is reported to the caller rather
//! than silently returning nothing.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::events::{CpuId, Pid, Timestamp};
use crate::sched::Collection;

/// One query constraint. Time bounds are inclusive at both ends.
#[derive(Clone, Debug)]
pub enum Filter {
    TimeRange(Timestamp, Timestamp),
    StartTimestamp(Timestamp),
    EndTimestamp(Timestamp),
    Cpus(Vec<CpuId>),
    Pids(Vec<Pid>),
    EventNames(Vec<String>),
}

/// The intersected universe a query runs over. The time range is half-open
/// `[start, end)` in normalized timestamps.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedFilter {
    pub start: Timestamp,
    pub end: Timestamp,
    pub cpus: HashSet<CpuId>,
    pub pids: HashSet<Pid>,
    /// `None` means all event names.
    pub event_names: Option<HashSet<String>>,
}

pub(crate) fn build_filter(collection: &Collection, filters: &[Filter]) -> Result<ResolvedFilter> {
    let mut resolved = ResolvedFilter {
        start: collection.start_timestamp(),
        end: collection.end_timestamp(),
        cpus: collection.cpus.clone(),
        pids: collection.pids.clone(),
        event_names: None,
    };

    for filter in filters {
        match filter {
            Filter::TimeRange(s, e) => {
                if s > e {
                    bail!("inverted time range: {s} > {e}");
                }
                resolved.start = resolved.start.max(*s);
                resolved.end = resolved.end.min(e.saturating_add(1));
            }
            Filter::StartTimestamp(s) => {
                resolved.start = resolved.start.max(*s);
            }
            Filter::EndTimestamp(e) => {
                resolved.end = resolved.end.min(e.saturating_add(1));
            }
            Filter::Cpus(cpus) => {
                let keep: HashSet<CpuId> = cpus.iter().copied().collect();
                resolved.cpus.retain(|cpu| keep.contains(cpu));
            }
            Filter::Pids(pids) => {
                let keep: HashSet<Pid> = pids.iter().copied().collect();
                resolved.pids.retain(|pid| keep.contains(pid));
            }
            Filter::EventNames(names) => {
                let keep: HashSet<String> = names.iter().cloned().collect();
                resolved.event_names = Some(match resolved.event_names.take() {
                    Some(existing) => existing.intersection(&keep).cloned().collect(),
                    None => keep,
                });
            }
        }
    }

    if resolved.start >= resolved.end {
        bail!(
            "query range [{}, {}) is empty or outside the collection",
            resolved.start,
            resolved.end
        );
    }
    Ok(resolved)
}

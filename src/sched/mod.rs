//! Scheduling collections: the queryable model built from an event set.
//!
//! [`Collection::new`] runs the whole inference pipeline: events are put in
//! a global `(timestamp, cpu, index)` order, translated into thread
//! transitions by the loader map, convoluted into per-PID span chains, and
//! finally projected into per-CPU indexes. The result is immutable and
//! freely shareable; every query method is read-only.

pub mod filters;
pub mod inference;
pub mod interval_tree;
pub mod spans;
pub mod transitions;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::events::{
    CpuId, EventSet, Pid, StringId, Timestamp, TraceEvent, UNKNOWN_COMMAND,
};
use crate::StringBank;
use filters::{build_filter, Filter};
use inference::{InferenceOptions, ThreadSpanSet};
use spans::{CpuSpanSet, SpanId, ThreadSpan};
use transitions::{default_loaders, ConflictPolicy, EventLoaderFn, TransitionSetBuilder};

/// Knobs for collection construction.
#[derive(Clone)]
pub struct CollectionOptions {
    /// Subtract the first usable event's timestamp from everything exposed.
    pub normalize_timestamps: bool,
    /// Keep decoded events around so `raw_events` works.
    pub preserve_raw_events: bool,
    /// Loader map override; `None` uses the event set's default group.
    pub loaders: Option<HashMap<&'static str, EventLoaderFn>>,
    /// Default policy when a transition's CPU pre-condition contradicts the
    /// inferred tuple.
    pub cpu_conflict_policy: ConflictPolicy,
    /// Default policy for state contradictions.
    pub state_conflict_policy: ConflictPolicy,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions {
            normalize_timestamps: false,
            preserve_raw_events: true,
            loaders: None,
            cpu_conflict_policy: ConflictPolicy::DropSelf,
            state_conflict_policy: ConflictPolicy::InsertSynthetic,
        }
    }
}

/// A fully built scheduling history, indexed by PID and by CPU.
pub struct Collection {
    string_bank: StringBank,
    normalization_offset: Timestamp,
    start_ts: Timestamp,
    /// Exclusive: one nanosecond past the last usable event.
    end_ts: Timestamp,
    /// Span arena; per-PID and per-CPU structures hold indexes into it.
    arena: Vec<ThreadSpan>,
    spans_by_pid: HashMap<Pid, Vec<SpanId>>,
    cpu_spans: CpuSpanSet,
    pub(crate) cpus: HashSet<CpuId>,
    pub(crate) pids: HashSet<Pid>,
    /// Decoded events with their original absolute timestamps, in trace
    /// order. `None` when `preserve_raw_events` was off.
    raw_events: Option<Vec<TraceEvent>>,
    dropped_event_counts: HashMap<usize, usize>,
    synthetic_transition_count: usize,
}

impl Collection {
    pub fn new(event_set: &EventSet, options: CollectionOptions) -> Result<Self> {
        let loaders = options
            .loaders
            .clone()
            .unwrap_or_else(|| default_loaders(event_set.default_loaders));

        let mut events = Vec::with_capacity(event_set.event_count());
        for index in 0..event_set.event_count() {
            events.push(event_set.event(index)?);
        }
        // The inference engine requires a total order even though the
        // converter appended whole CPUs one after another.
        let mut order: Vec<usize> = (0..events.len()).collect();
        order.sort_by_key(|&i| (events[i].timestamp, events[i].cpu, events[i].index));

        let infer_options = InferenceOptions {
            cpu_conflict_policy: options.cpu_conflict_policy,
            state_conflict_policy: options.state_conflict_policy,
        };
        let mut bank = StringBank::new();
        let mut span_set: Option<ThreadSpanSet> = None;
        let mut offset: Timestamp = 0;
        let mut start_ts: Timestamp = 0;
        let mut last_ts: Timestamp = 0;

        for &i in &order {
            let event = &events[i];
            if event.clipped {
                continue;
            }
            let loader = match loaders.get(event.name.as_str()) {
                Some(loader) => loader,
                None => continue,
            };
            let mut builder = TransitionSetBuilder::new(&mut bank);
            loader(event, &mut builder)
                .with_context(|| format!("loading event {} ('{}')", event.index, event.name))?;
            let transitions = builder.finish();
            if transitions.is_empty() {
                continue;
            }
            let set = span_set.get_or_insert_with(|| {
                offset = if options.normalize_timestamps {
                    event.timestamp
                } else {
                    0
                };
                start_ts = event.timestamp - offset;
                ThreadSpanSet::new(start_ts, infer_options)
            });
            last_ts = event.timestamp - offset;
            for mut transition in transitions {
                transition.timestamp -= offset;
                set.add_transition(&transition);
            }
        }

        let span_set = match span_set {
            Some(set) => set,
            None => bail!("no usable events in collection"),
        };
        let end_ts = last_ts + 1;
        let result = span_set.finish(end_ts);

        let mut arena = Vec::new();
        let mut spans_by_pid = HashMap::new();
        for (pid, pid_spans) in result.spans_by_pid {
            let mut ids = Vec::with_capacity(pid_spans.len());
            for span in pid_spans {
                ids.push(arena.len() as SpanId);
                arena.push(span);
            }
            spans_by_pid.insert(pid, ids);
        }

        let mut cpus = HashSet::new();
        let mut pids = HashSet::new();
        for span in &arena {
            if let Some(cpu) = span.cpu {
                cpus.insert(cpu);
                pids.insert(span.pid);
            }
        }
        let cpu_spans = CpuSpanSet::build(&arena);

        tracing::debug!(
            events = events.len(),
            pids = pids.len(),
            cpus = cpus.len(),
            spans = arena.len(),
            dropped = result.dropped_event_counts.len(),
            synthetic = result.synthetic_transition_count,
            "built scheduling collection"
        );

        Ok(Collection {
            string_bank: bank,
            normalization_offset: offset,
            start_ts,
            end_ts,
            arena,
            spans_by_pid,
            cpu_spans,
            cpus,
            pids,
            raw_events: options.preserve_raw_events.then_some(events),
            dropped_event_counts: result.dropped_event_counts,
            synthetic_transition_count: result.synthetic_transition_count,
        })
    }

    /// First timestamp covered by the collection (normalized).
    pub fn start_timestamp(&self) -> Timestamp {
        self.start_ts
    }

    /// One nanosecond past the last usable event (normalized, exclusive).
    pub fn end_timestamp(&self) -> Timestamp {
        self.end_ts
    }

    /// The duration subtracted from every exposed timestamp: zero unless
    /// normalization was requested, in which case it is the absolute
    /// timestamp of the first usable scheduling event.
    pub fn normalization_offset(&self) -> Timestamp {
        self.normalization_offset
    }

    /// The collection's covered range clipped by the filters.
    pub fn interval(&self, filters: &[Filter]) -> Result<(Timestamp, Timestamp)> {
        let f = build_filter(self, filters)?;
        Ok((f.start, f.end))
    }

    /// CPUs the collection covers, clipped by any `Cpus` filter.
    pub fn cpus(&self, filters: &[Filter]) -> Result<HashSet<CpuId>> {
        Ok(build_filter(self, filters)?.cpus)
    }

    /// PIDs the collection covers, clipped by any `Pids` filter.
    pub fn pids(&self, filters: &[Filter]) -> Result<HashSet<Pid>> {
        Ok(build_filter(self, filters)?.pids)
    }

    /// CPUs an event should be attributed to: migrations belong to both
    /// ends of the move, wakeups to the target runqueue.
    fn event_cpus(event: &TraceEvent) -> Vec<CpuId> {
        match event.name.as_str() {
            "sched_migrate_task" => match event.number("orig_cpu") {
                Some(orig) if orig != event.cpu => vec![event.cpu, orig],
                _ => vec![event.cpu],
            },
            "sched_wakeup" | "sched_wakeup_new" => {
                vec![event.number("target_cpu").unwrap_or(event.cpu)]
            }
            _ => vec![event.cpu],
        }
    }

    /// PIDs named by an event, for `Pids` filtering of raw events.
    fn event_pids(event: &TraceEvent) -> Vec<Pid> {
        ["pid", "prev_pid", "next_pid"]
            .iter()
            .filter_map(|name| event.number(name))
            .collect()
    }

    /// Re-emit decoded events, filtered and with normalized timestamps.
    ///
    /// Clipped events flow through here even though inference ignored them,
    /// so CPU and PID restrictions only apply when explicitly filtered.
    pub fn raw_events(&self, filters: &[Filter]) -> Result<Vec<TraceEvent>> {
        let events = match self.raw_events.as_ref() {
            Some(events) => events,
            None => bail!("collection was built without raw events"),
        };
        let f = build_filter(self, filters)?;
        let cpu_filtered = filters.iter().any(|f| matches!(f, Filter::Cpus(_)));
        let pid_filtered = filters.iter().any(|f| matches!(f, Filter::Pids(_)));
        let mut out = Vec::new();
        for event in events {
            let ts = event.timestamp - self.normalization_offset;
            if ts < f.start || ts >= f.end {
                continue;
            }
            if let Some(names) = &f.event_names {
                if !names.contains(&event.name) {
                    continue;
                }
            }
            if cpu_filtered
                && !Self::event_cpus(event).iter().any(|cpu| f.cpus.contains(cpu))
            {
                continue;
            }
            if pid_filtered && !Self::event_pids(event).iter().any(|pid| f.pids.contains(pid)) {
                continue;
            }
            let mut event = event.clone();
            event.timestamp = ts;
            out.push(event);
        }
        Ok(out)
    }

    fn collect_spans(&self, ids: &[SpanId], start: Timestamp, end: Timestamp) -> Vec<ThreadSpan> {
        // Within one chain spans are sorted and non-overlapping, so ends
        // are monotonic and the overlap set is one contiguous run.
        let first = ids.partition_point(|&id| self.arena[id as usize].end_ts <= start);
        ids[first..]
            .iter()
            .map(|&id| &self.arena[id as usize])
            .take_while(|span| span.start_ts < end)
            .cloned()
            .collect()
    }

    /// RUNNING spans on `cpu` overlapping the filtered range, by start.
    pub fn running_spans(&self, cpu: CpuId, filters: &[Filter]) -> Result<Vec<ThreadSpan>> {
        let f = build_filter(self, filters)?;
        Ok(match self.cpu_spans.running.get(&cpu) {
            Some(ids) => self.collect_spans(ids, f.start, f.end),
            None => Vec::new(),
        })
    }

    fn tree_spans(
        &self,
        trees: &HashMap<CpuId, interval_tree::IntervalTree>,
        cpu: CpuId,
        filters: &[Filter],
    ) -> Result<Vec<ThreadSpan>> {
        let f = build_filter(self, filters)?;
        let mut ids = Vec::new();
        if let Some(tree) = trees.get(&cpu) {
            tree.overlapping(f.start, f.end, &mut ids);
        }
        let mut spans: Vec<ThreadSpan> = ids
            .into_iter()
            .map(|id| self.arena[id as usize].clone())
            .collect();
        spans.sort_by_key(|span| (span.start_ts, span.pid));
        Ok(spans)
    }

    /// SLEEPING spans on `cpu` overlapping the filtered range.
    pub fn sleeping_spans(&self, cpu: CpuId, filters: &[Filter]) -> Result<Vec<ThreadSpan>> {
        self.tree_spans(&self.cpu_spans.sleeping, cpu, filters)
    }

    /// WAITING spans on `cpu` overlapping the filtered range.
    pub fn waiting_spans(&self, cpu: CpuId, filters: &[Filter]) -> Result<Vec<ThreadSpan>> {
        self.tree_spans(&self.cpu_spans.waiting, cpu, filters)
    }

    /// Every span of one PID overlapping the filtered range.
    pub fn spans_for_pid(&self, pid: Pid, filters: &[Filter]) -> Result<Vec<ThreadSpan>> {
        let f = build_filter(self, filters)?;
        Ok(match self.spans_by_pid.get(&pid) {
            Some(ids) => self.collect_spans(ids, f.start, f.end),
            None => Vec::new(),
        })
    }

    /// The command string behind an interned id.
    pub fn lookup_command(&self, command: StringId) -> Result<String> {
        if command == UNKNOWN_COMMAND {
            return Ok("<unknown>".to_string());
        }
        let s = self
            .string_bank
            .lookup(command)
            .with_context(|| format!("failed to find command for id {command}"))?;
        Ok(s.to_string())
    }

    /// Indices of events dropped during inference, ascending.
    pub fn dropped_event_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.dropped_event_counts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Synthetic transitions the engine had to fabricate.
    pub fn synthetic_transition_count(&self) -> usize {
        self.synthetic_transition_count
    }

    /// An empty CPU list expands to every CPU in the collection, ascending.
    pub fn expand_cpus(&self, cpus: &[CpuId]) -> Vec<CpuId> {
        if !cpus.is_empty() {
            return cpus.to_vec();
        }
        let mut all: Vec<CpuId> = self.cpus.iter().copied().collect();
        all.sort_unstable();
        all
    }

    pub fn timestamp_from_duration(&self, duration: Duration) -> Timestamp {
        duration.as_nanos() as Timestamp
    }

    pub fn duration_from_timestamp(&self, ts: Timestamp) -> Duration {
        Duration::from_nanos(ts.max(0) as u64)
    }
}

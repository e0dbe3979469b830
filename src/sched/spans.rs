//! Finalized thread spans and their per-CPU projection.

use std::collections::HashMap;
use std::fmt;

use crate::events::{CpuId, Pid, Priority, StringId, Timestamp};
use crate::sched::interval_tree::{Interval, IntervalTree};

/// What a thread was doing during a span.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ThreadState {
    Running,
    Waiting,
    Sleeping,
    #[default]
    Unknown,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadState::Running => "RUNNING",
            ThreadState::Waiting => "WAITING",
            ThreadState::Sleeping => "SLEEPING",
            ThreadState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A contiguous interval `[start_ts, end_ts)` during which one PID held one
/// (cpu, state, command, priority) tuple. CPU and priority stay `None` when
/// the trace never revealed them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadSpan {
    pub pid: Pid,
    pub cpu: Option<CpuId>,
    pub state: ThreadState,
    pub command: StringId,
    pub priority: Option<Priority>,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
}

impl ThreadSpan {
    pub fn duration(&self) -> Timestamp {
        self.end_ts - self.start_ts
    }
}

/// Id of a span within a collection's arena.
pub(crate) type SpanId = u32;

/// Per-CPU projection of the finalized span arena: a start-sorted vector of
/// running spans plus interval trees for the sleeping and waiting states.
#[derive(Debug, Default)]
pub(crate) struct CpuSpanSet {
    pub running: HashMap<CpuId, Vec<SpanId>>,
    pub sleeping: HashMap<CpuId, IntervalTree>,
    pub waiting: HashMap<CpuId, IntervalTree>,
}

impl CpuSpanSet {
    /// Bucket every span with a known CPU and state. Spans the inference
    /// engine could not pin to a CPU stay queryable per PID only.
    pub fn build(arena: &[ThreadSpan]) -> Self {
        let mut running: HashMap<CpuId, Vec<SpanId>> = HashMap::new();
        let mut sleeping: HashMap<CpuId, Vec<Interval>> = HashMap::new();
        let mut waiting: HashMap<CpuId, Vec<Interval>> = HashMap::new();

        for (id, span) in arena.iter().enumerate() {
            let cpu = match span.cpu {
                Some(cpu) => cpu,
                None => continue,
            };
            let id = id as SpanId;
            let interval = Interval {
                start: span.start_ts,
                end: span.end_ts,
                id,
            };
            match span.state {
                ThreadState::Running => running.entry(cpu).or_default().push(id),
                ThreadState::Sleeping => sleeping.entry(cpu).or_default().push(interval),
                ThreadState::Waiting => waiting.entry(cpu).or_default().push(interval),
                ThreadState::Unknown => {}
            }
        }

        for ids in running.values_mut() {
            ids.sort_by_key(|&id| arena[id as usize].start_ts);
        }

        CpuSpanSet {
            running,
            sleeping: sleeping
                .into_iter()
                .map(|(cpu, items)| (cpu, IntervalTree::build(items)))
                .collect(),
            waiting: waiting
                .into_iter()
                .map(|(cpu, items)| (cpu, IntervalTree::build(items)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UNKNOWN_COMMAND;

    fn span(
        pid: Pid,
        cpu: Option<CpuId>,
        state: ThreadState,
        start_ts: Timestamp,
        end_ts: Timestamp,
    ) -> ThreadSpan {
        ThreadSpan {
            pid,
            cpu,
            state,
            command: UNKNOWN_COMMAND,
            priority: None,
            start_ts,
            end_ts,
        }
    }

    #[test]
    fn projection_buckets_by_cpu_and_state() {
        let arena = vec![
            span(1, Some(0), ThreadState::Running, 0, 10),
            span(2, Some(0), ThreadState::Waiting, 0, 10),
            span(1, Some(0), ThreadState::Sleeping, 10, 20),
            span(2, Some(0), ThreadState::Running, 10, 20),
            span(3, Some(1), ThreadState::Running, 5, 15),
            span(4, None, ThreadState::Running, 0, 20),
        ];
        let set = CpuSpanSet::build(&arena);

        assert_eq!(set.running[&0], vec![0, 3]);
        assert_eq!(set.running[&1], vec![4]);
        assert_eq!(set.sleeping[&0].len(), 1);
        assert_eq!(set.waiting[&0].len(), 1);
        // Span with no CPU never reaches an index.
        assert!(!set.running.values().any(|ids| ids.contains(&5)));
    }

    #[test]
    fn running_spans_sorted_by_start() {
        let arena = vec![
            span(1, Some(0), ThreadState::Running, 20, 30),
            span(2, Some(0), ThreadState::Running, 0, 10),
            span(3, Some(0), ThreadState::Running, 10, 20),
        ];
        let set = CpuSpanSet::build(&arena);
        assert_eq!(set.running[&0], vec![1, 2, 0]);
    }
}

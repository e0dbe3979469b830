//! The span inference engine.
//!
//! Transitions arrive per PID in global timestamp order. Each PID runs a
//! small state machine over its current (cpu, state, command, priority)
//! tuple: pre-conditions unify against the tuple, the open span closes at
//! the transition's timestamp, and the post-conditions become the new
//! tuple. A value that becomes known late writes back through every prior
//! span still waiting on it, so a thread first seen mid-trace gets its
//! leading spans filled in retroactively.

use std::collections::HashMap;

use crate::events::{Pid, Timestamp, UNKNOWN_COMMAND};
use crate::sched::spans::{ThreadSpan, ThreadState};
use crate::sched::transitions::{ConflictPolicy, ThreadTransition};

/// Engine-wide defaults for transitions that do not override their policies.
#[derive(Clone, Copy, Debug)]
pub struct InferenceOptions {
    pub cpu_conflict_policy: ConflictPolicy,
    pub state_conflict_policy: ConflictPolicy,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        InferenceOptions {
            cpu_conflict_policy: ConflictPolicy::DropSelf,
            state_conflict_policy: ConflictPolicy::InsertSynthetic,
        }
    }
}

/// What happened to one transition.
enum Outcome {
    Applied { synthetic: bool },
    Dropped,
}

/// The thread tuple being inferred.
#[derive(Clone, Copy, Debug, Default)]
struct Tuple {
    cpu: Option<i64>,
    state: ThreadState,
    command: Option<usize>,
    priority: Option<i64>,
}

struct PidMachine {
    pid: Pid,
    span_start: Timestamp,
    cur: Tuple,
    spans: Vec<ThreadSpan>,
    // Back-pointer chains: spans emitted before the field became known.
    pending_cpu: Vec<usize>,
    pending_state: Vec<usize>,
    pending_command: Vec<usize>,
    pending_priority: Vec<usize>,
}

impl PidMachine {
    fn new(pid: Pid, start: Timestamp) -> Self {
        PidMachine {
            pid,
            span_start: start,
            cur: Tuple::default(),
            spans: Vec::new(),
            pending_cpu: Vec::new(),
            pending_state: Vec::new(),
            pending_command: Vec::new(),
            pending_priority: Vec::new(),
        }
    }

    /// Close the open span at `end`, remembering which of its fields are
    /// still unknown so late resolutions can write through.
    fn close_span(&mut self, end: Timestamp) {
        if end <= self.span_start {
            return;
        }
        let idx = self.spans.len();
        if self.cur.cpu.is_none() {
            self.pending_cpu.push(idx);
        }
        if self.cur.state == ThreadState::Unknown {
            self.pending_state.push(idx);
        }
        if self.cur.command.is_none() {
            self.pending_command.push(idx);
        }
        if self.cur.priority.is_none() {
            self.pending_priority.push(idx);
        }
        self.spans.push(ThreadSpan {
            pid: self.pid,
            cpu: self.cur.cpu,
            state: self.cur.state,
            command: self.cur.command.unwrap_or(UNKNOWN_COMMAND),
            priority: self.cur.priority,
            start_ts: self.span_start,
            end_ts: end,
        });
        self.span_start = end;
    }

    fn apply(&mut self, tt: &ThreadTransition, defaults: &InferenceOptions) -> Outcome {
        let cpu_conflict =
            matches!((self.cur.cpu, tt.prev_cpu), (Some(a), Some(b)) if a != b);
        let state_conflict = self.cur.state != ThreadState::Unknown
            && tt.prev_state != ThreadState::Unknown
            && self.cur.state != tt.prev_state;
        let cpu_policy = tt.cpu_conflict_policy.unwrap_or(defaults.cpu_conflict_policy);
        let state_policy = tt
            .state_conflict_policy
            .unwrap_or(defaults.state_conflict_policy);

        // DropSelf dominates: if any conflicting field says drop, the whole
        // transition goes and the prior tuple survives untouched.
        if (cpu_conflict && cpu_policy == ConflictPolicy::DropSelf)
            || (state_conflict && state_policy == ConflictPolicy::DropSelf)
        {
            return Outcome::Dropped;
        }

        // DropPrior: the transition's pre-condition outranks the inferred
        // value, so the open span is rewritten in place. Finalized spans
        // behind it are anchored by direct observations and stay.
        if cpu_conflict && cpu_policy == ConflictPolicy::DropPrior {
            self.cur.cpu = tt.prev_cpu;
        }
        if state_conflict && state_policy == ConflictPolicy::DropPrior {
            self.cur.state = tt.prev_state;
        }

        // InsertSynthetic: close the open span as observed, then bridge to
        // the transition's pre-conditions with a zero-width step at its own
        // timestamp.
        let cpu_bridge = cpu_conflict && cpu_policy == ConflictPolicy::InsertSynthetic;
        let state_bridge = state_conflict && state_policy == ConflictPolicy::InsertSynthetic;
        let synthetic = cpu_bridge || state_bridge;
        if synthetic {
            self.close_span(tt.timestamp);
            if cpu_bridge {
                self.cur.cpu = tt.prev_cpu;
            }
            if state_bridge {
                self.cur.state = tt.prev_state;
            }
        }

        // Unify the remaining pre-conditions: a known value meets an
        // unknown one, and the unknown side adopts it, backfilling every
        // span still waiting on that field.
        if self.cur.cpu.is_none() {
            if let Some(cpu) = tt.prev_cpu {
                for &idx in &self.pending_cpu {
                    self.spans[idx].cpu = Some(cpu);
                }
                self.pending_cpu.clear();
                self.cur.cpu = Some(cpu);
            }
        }
        if self.cur.state == ThreadState::Unknown && tt.prev_state != ThreadState::Unknown {
            for &idx in &self.pending_state {
                self.spans[idx].state = tt.prev_state;
            }
            self.pending_state.clear();
            self.cur.state = tt.prev_state;
        }

        // Commands and priorities change legitimately over a thread's life,
        // so a disagreement is not a conflict: the newest observation about
        // the past wins, and only unknowns backfill.
        if let Some(command) = tt.prev_command {
            if self.cur.command.is_none() {
                for &idx in &self.pending_command {
                    self.spans[idx].command = command;
                }
                self.pending_command.clear();
            }
            self.cur.command = Some(command);
        }
        if let Some(priority) = tt.prev_priority {
            if self.cur.priority.is_none() {
                for &idx in &self.pending_priority {
                    self.spans[idx].priority = Some(priority);
                }
                self.pending_priority.clear();
            }
            self.cur.priority = Some(priority);
        }

        // Close the interval this transition terminates, then adopt the
        // post-conditions as the new tuple.
        self.close_span(tt.timestamp);
        if let Some(cpu) = tt.next_cpu {
            self.cur.cpu = Some(cpu);
        }
        if tt.next_state != ThreadState::Unknown {
            self.cur.state = tt.next_state;
        }
        if let Some(command) = tt.next_command {
            self.cur.command = Some(command);
        }
        if let Some(priority) = tt.next_priority {
            self.cur.priority = Some(priority);
        }

        Outcome::Applied { synthetic }
    }
}

/// Everything the engine produces for a collection.
pub struct InferenceResult {
    pub spans_by_pid: HashMap<Pid, Vec<ThreadSpan>>,
    pub dropped_event_counts: HashMap<usize, usize>,
    pub synthetic_transition_count: usize,
}

/// Accumulates transitions into per-PID span chains.
pub struct ThreadSpanSet {
    start: Timestamp,
    defaults: InferenceOptions,
    machines: HashMap<Pid, PidMachine>,
    dropped_event_counts: HashMap<usize, usize>,
    synthetic_transition_count: usize,
}

impl ThreadSpanSet {
    /// `start` is the collection's start timestamp; every PID's first span
    /// begins there regardless of when the PID was first observed.
    pub fn new(start: Timestamp, defaults: InferenceOptions) -> Self {
        ThreadSpanSet {
            start,
            defaults,
            machines: HashMap::new(),
            dropped_event_counts: HashMap::new(),
            synthetic_transition_count: 0,
        }
    }

    pub fn add_transition(&mut self, tt: &ThreadTransition) {
        let machine = self
            .machines
            .entry(tt.pid)
            .or_insert_with(|| PidMachine::new(tt.pid, self.start));
        match machine.apply(tt, &self.defaults) {
            Outcome::Dropped => {
                tracing::debug!(
                    pid = tt.pid,
                    event_index = tt.event_index,
                    "dropping irreconcilable transition"
                );
                *self
                    .dropped_event_counts
                    .entry(tt.event_index)
                    .or_insert(0) += 1;
            }
            Outcome::Applied { synthetic } => {
                if synthetic {
                    self.synthetic_transition_count += 1;
                }
            }
        }
    }

    /// Close every open span at the collection end and hand back the chains.
    pub fn finish(mut self, end: Timestamp) -> InferenceResult {
        for machine in self.machines.values_mut() {
            machine.close_span(end);
        }
        InferenceResult {
            spans_by_pid: self
                .machines
                .into_iter()
                .map(|(pid, machine)| (pid, machine.spans))
                .collect(),
            dropped_event_counts: self.dropped_event_counts,
            synthetic_transition_count: self.synthetic_transition_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> ThreadSpanSet {
        ThreadSpanSet::new(0, InferenceOptions::default())
    }

    #[test]
    fn leading_span_is_backfilled_from_first_transition() {
        let mut ts = set();
        // First sight of PID 7 at t=100: it stops running on CPU 2.
        ts.add_transition(
            &ThreadTransition::new(0, 100, 7)
                .with_cpus(2)
                .with_prev_state(ThreadState::Running)
                .with_next_state(ThreadState::Waiting),
        );
        let result = ts.finish(200);
        let spans = &result.spans_by_pid[&7];
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start_ts, 0);
        assert_eq!(spans[0].end_ts, 100);
        assert_eq!(spans[0].state, ThreadState::Running);
        assert_eq!(spans[0].cpu, Some(2));
        assert_eq!(spans[1].start_ts, 100);
        assert_eq!(spans[1].end_ts, 200);
        assert_eq!(spans[1].state, ThreadState::Waiting);
    }

    #[test]
    fn wake_target_does_not_claim_the_sleep_cpu() {
        let mut ts = set();
        // A wakeup claims nothing about the source CPU.
        ts.add_transition(
            &ThreadTransition::new(0, 100, 7)
                .with_prev_state(ThreadState::Sleeping)
                .with_next_state(ThreadState::Waiting)
                .with_next_cpu(3),
        );
        let result = ts.finish(200);
        let spans = &result.spans_by_pid[&7];
        assert_eq!(spans.len(), 2);
        // Sleeping span's CPU stayed unknown; the waiting span knows it.
        assert_eq!(spans[0].cpu, None);
        assert_eq!(spans[0].state, ThreadState::Sleeping);
        assert_eq!(spans[1].cpu, Some(3));
    }

    #[test]
    fn wake_without_sleep_inserts_a_synthetic_bridge() {
        let mut ts = set();
        ts.add_transition(
            &ThreadTransition::new(0, 100, 7)
                .with_cpus(0)
                .with_prev_state(ThreadState::Waiting)
                .with_next_state(ThreadState::Running),
        );
        // Wakeup claims the thread was sleeping, but it is running.
        ts.add_transition(
            &ThreadTransition::new(1, 150, 7)
                .with_prev_state(ThreadState::Sleeping)
                .with_next_state(ThreadState::Waiting)
                .with_next_cpu(0),
        );
        let result = ts.finish(200);
        assert_eq!(result.synthetic_transition_count, 1);
        assert!(result.dropped_event_counts.is_empty());
        let spans = &result.spans_by_pid[&7];
        // Running span closes at the wake; the bridge is zero-width.
        assert_eq!(spans[1].state, ThreadState::Running);
        assert_eq!(spans[1].end_ts, 150);
        assert_eq!(spans[2].state, ThreadState::Waiting);
        assert_eq!(spans[2].start_ts, 150);
    }

    #[test]
    fn cpu_contradiction_drops_the_transition() {
        let mut ts = set();
        ts.add_transition(
            &ThreadTransition::new(4, 100, 7)
                .with_cpus(1)
                .with_prev_state(ThreadState::Waiting)
                .with_next_state(ThreadState::Running),
        );
        ts.add_transition(
            &ThreadTransition::new(9, 150, 7)
                .with_cpus(0)
                .with_prev_state(ThreadState::Running)
                .with_next_state(ThreadState::Sleeping),
        );
        let result = ts.finish(200);
        assert_eq!(result.dropped_event_counts.get(&9), Some(&1));
        let spans = &result.spans_by_pid[&7];
        // The running span survives to the end on its original CPU.
        let last = spans.last().unwrap();
        assert_eq!(last.state, ThreadState::Running);
        assert_eq!(last.cpu, Some(1));
        assert_eq!(last.end_ts, 200);
    }

    #[test]
    fn drop_prior_rewrites_the_open_span() {
        let mut ts = set();
        ts.add_transition(
            &ThreadTransition::new(0, 100, 7)
                .with_cpus(0)
                .with_prev_state(ThreadState::Waiting)
                .with_next_state(ThreadState::Running),
        );
        // A migrate insists the thread was waiting, not running.
        ts.add_transition(
            &ThreadTransition::new(1, 150, 7)
                .with_prev_cpu(0)
                .with_next_cpu(3)
                .with_prev_state(ThreadState::Waiting)
                .with_next_state(ThreadState::Waiting)
                .on_state_conflict(ConflictPolicy::DropPrior),
        );
        let result = ts.finish(200);
        assert_eq!(result.synthetic_transition_count, 0);
        let spans = &result.spans_by_pid[&7];
        assert_eq!(spans.len(), 3);
        // [100, 150) was claimed RUNNING but the migrate rewrote it.
        assert_eq!(spans[1].start_ts, 100);
        assert_eq!(spans[1].end_ts, 150);
        assert_eq!(spans[1].state, ThreadState::Waiting);
        assert_eq!(spans[1].cpu, Some(0));
        assert_eq!(spans[2].cpu, Some(3));
        assert_eq!(spans[2].state, ThreadState::Waiting);
    }

    #[test]
    fn late_command_and_priority_backfill_unknown_spans() {
        let mut ts = set();
        ts.add_transition(
            &ThreadTransition::new(0, 100, 7)
                .with_cpus(1)
                .with_prev_state(ThreadState::Waiting)
                .with_next_state(ThreadState::Running),
        );
        ts.add_transition(
            &ThreadTransition::new(1, 150, 7)
                .with_cpus(1)
                .with_prev_state(ThreadState::Running)
                .with_next_state(ThreadState::Sleeping)
                .with_commands(5)
                .with_priorities(120),
        );
        let result = ts.finish(200);
        let spans = &result.spans_by_pid[&7];
        assert_eq!(spans.len(), 3);
        // Both earlier spans learned the command and priority late.
        assert_eq!(spans[0].command, 5);
        assert_eq!(spans[0].priority, Some(120));
        assert_eq!(spans[1].command, 5);
        assert_eq!(spans[1].priority, Some(120));
    }

    #[test]
    fn spans_tile_the_collection_range() {
        let mut ts = set();
        for (i, t) in [(0usize, 100i64), (1, 130), (2, 220)] {
            let (prev, next) = if i % 2 == 0 {
                (ThreadState::Waiting, ThreadState::Running)
            } else {
                (ThreadState::Running, ThreadState::Waiting)
            };
            ts.add_transition(
                &ThreadTransition::new(i, t, 7)
                    .with_cpus(0)
                    .with_prev_state(prev)
                    .with_next_state(next),
            );
        }
        let result = ts.finish(300);
        let spans = &result.spans_by_pid[&7];
        assert_eq!(spans.first().unwrap().start_ts, 0);
        assert_eq!(spans.last().unwrap().end_ts, 300);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end_ts, pair[1].start_ts);
        }
    }
}

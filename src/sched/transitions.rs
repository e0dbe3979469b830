//! Thread transitions and the event loaders that derive them.
//!
//! Each scheduling event becomes zero or more [`ThreadTransition`]s: per-PID
//! constraint records with pre- and post-conditions on the thread's
//! (cpu, state, priority, command) tuple. Loaders are plain functions keyed
//! by event name, so new event families plug in without touching the
//! inference engine.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::events::{CpuId, LoaderGroup, Pid, Priority, StringId, Timestamp, TraceEvent};
use crate::sched::spans::ThreadState;
use crate::StringBank;

/// How the inference engine resolves a contradiction between a transition's
/// pre-conditions and the thread's inferred tuple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Discard the offending transition, keeping the prior tuple.
    DropSelf,
    /// The transition's pre-condition outranks the inferred prior value;
    /// rewrite the open span.
    DropPrior,
    /// Fabricate a minimal bridging transition and carry on.
    InsertSynthetic,
}

/// A per-PID constraint derived from one trace event. Fields left `None`
/// (or `ThreadState::Unknown`) are narrowed by inference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadTransition {
    pub event_index: usize,
    pub timestamp: Timestamp,
    pub pid: Pid,
    pub prev_cpu: Option<CpuId>,
    pub next_cpu: Option<CpuId>,
    pub prev_state: ThreadState,
    pub next_state: ThreadState,
    pub prev_command: Option<StringId>,
    pub next_command: Option<StringId>,
    pub prev_priority: Option<Priority>,
    pub next_priority: Option<Priority>,
    /// Policy overrides; `None` falls back to the collection defaults.
    pub cpu_conflict_policy: Option<ConflictPolicy>,
    pub state_conflict_policy: Option<ConflictPolicy>,
}

impl ThreadTransition {
    pub fn new(event_index: usize, timestamp: Timestamp, pid: Pid) -> Self {
        ThreadTransition {
            event_index,
            timestamp,
            pid,
            prev_cpu: None,
            next_cpu: None,
            prev_state: ThreadState::Unknown,
            next_state: ThreadState::Unknown,
            prev_command: None,
            next_command: None,
            prev_priority: None,
            next_priority: None,
            cpu_conflict_policy: None,
            state_conflict_policy: None,
        }
    }

    pub fn with_prev_cpu(mut self, cpu: CpuId) -> Self {
        self.prev_cpu = Some(cpu);
        self
    }

    pub fn with_next_cpu(mut self, cpu: CpuId) -> Self {
        self.next_cpu = Some(cpu);
        self
    }

    /// Constrain both sides to the same CPU.
    pub fn with_cpus(self, cpu: CpuId) -> Self {
        self.with_prev_cpu(cpu).with_next_cpu(cpu)
    }

    pub fn with_prev_state(mut self, state: ThreadState) -> Self {
        self.prev_state = state;
        self
    }

    pub fn with_next_state(mut self, state: ThreadState) -> Self {
        self.next_state = state;
        self
    }

    pub fn with_prev_command(mut self, command: StringId) -> Self {
        self.prev_command = Some(command);
        self
    }

    pub fn with_next_command(mut self, command: StringId) -> Self {
        self.next_command = Some(command);
        self
    }

    /// Constrain both sides to the same command.
    pub fn with_commands(self, command: StringId) -> Self {
        self.with_prev_command(command).with_next_command(command)
    }

    pub fn with_prev_priority(mut self, priority: Priority) -> Self {
        self.prev_priority = Some(priority);
        self
    }

    pub fn with_next_priority(mut self, priority: Priority) -> Self {
        self.next_priority = Some(priority);
        self
    }

    /// Constrain both sides to the same priority.
    pub fn with_priorities(self, priority: Priority) -> Self {
        self.with_prev_priority(priority).with_next_priority(priority)
    }

    pub fn on_cpu_conflict(mut self, policy: ConflictPolicy) -> Self {
        self.cpu_conflict_policy = Some(policy);
        self
    }

    pub fn on_state_conflict(mut self, policy: ConflictPolicy) -> Self {
        self.state_conflict_policy = Some(policy);
        self
    }
}

/// Collects the transitions one event produces; loaders intern command
/// strings through it so span commands share the collection's string bank.
pub struct TransitionSetBuilder<'a> {
    bank: &'a mut StringBank,
    transitions: Vec<ThreadTransition>,
}

impl<'a> TransitionSetBuilder<'a> {
    pub fn new(bank: &'a mut StringBank) -> Self {
        TransitionSetBuilder {
            bank,
            transitions: Vec::new(),
        }
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        self.bank.intern(s)
    }

    pub fn push(&mut self, transition: ThreadTransition) {
        self.transitions.push(transition);
    }

    pub fn finish(self) -> Vec<ThreadTransition> {
        self.transitions
    }
}

/// A loader translates one event into transitions. Unknown event names have
/// no loader and contribute nothing (the raw event still flows).
pub type EventLoaderFn = fn(&TraceEvent, &mut TransitionSetBuilder<'_>) -> Result<()>;

/// The loader map for a loader group tag.
pub fn default_loaders(group: LoaderGroup) -> HashMap<&'static str, EventLoaderFn> {
    match group {
        LoaderGroup::Sched => {
            let mut loaders: HashMap<&'static str, EventLoaderFn> = HashMap::new();
            loaders.insert("sched_switch", load_sched_switch);
            loaders.insert("sched_wakeup", load_sched_wakeup);
            loaders.insert("sched_wakeup_new", load_sched_wakeup);
            loaders.insert("sched_migrate_task", load_sched_migrate_task);
            loaders
        }
    }
}

fn required(event: &TraceEvent, field: &str) -> Result<i64> {
    match event.number(field) {
        Some(value) => Ok(value),
        None => bail!("{} event lacks the '{field}' field", event.name),
    }
}

/// `sched_switch`: the previous thread stops running (waiting if it was
/// preempted, sleeping otherwise) and the next thread starts, both on the
/// event's CPU.
fn load_sched_switch(event: &TraceEvent, builder: &mut TransitionSetBuilder<'_>) -> Result<()> {
    let prev_pid = required(event, "prev_pid")?;
    let next_pid = required(event, "next_pid")?;
    let prev_task_state = required(event, "prev_state")?;
    let cpu = event.cpu;

    let mut prev = ThreadTransition::new(event.index, event.timestamp, prev_pid)
        .with_cpus(cpu)
        .with_prev_state(ThreadState::Running)
        .with_next_state(if prev_task_state == 0 {
            ThreadState::Waiting
        } else {
            ThreadState::Sleeping
        });
    if let Some(comm) = event.text("prev_comm") {
        let id = builder.intern(comm);
        prev = prev.with_commands(id);
    }
    if let Some(prio) = event.number("prev_prio") {
        prev = prev.with_priorities(prio);
    }
    builder.push(prev);

    let mut next = ThreadTransition::new(event.index, event.timestamp, next_pid)
        .with_cpus(cpu)
        .with_prev_state(ThreadState::Waiting)
        .with_next_state(ThreadState::Running);
    if let Some(comm) = event.text("next_comm") {
        let id = builder.intern(comm);
        next = next.with_commands(id);
    }
    if let Some(prio) = event.number("next_prio") {
        next = next.with_priorities(prio);
    }
    builder.push(next);
    Ok(())
}

/// `sched_wakeup` / `sched_wakeup_new`: a sleeping thread becomes runnable
/// on the target CPU. The pre-CPU is left open since wakeups can land a
/// thread on a different runqueue.
fn load_sched_wakeup(event: &TraceEvent, builder: &mut TransitionSetBuilder<'_>) -> Result<()> {
    let pid = required(event, "pid")?;
    let target_cpu = required(event, "target_cpu")?;

    let mut tt = ThreadTransition::new(event.index, event.timestamp, pid)
        .with_next_cpu(target_cpu)
        .with_prev_state(ThreadState::Sleeping)
        .with_next_state(ThreadState::Waiting);
    if let Some(comm) = event.text("comm") {
        let id = builder.intern(comm);
        tt = tt.with_commands(id);
    }
    if let Some(prio) = event.number("prio") {
        tt = tt.with_priorities(prio);
    }
    builder.push(tt);
    Ok(())
}

/// `sched_migrate_task`: a runnable thread moves between runqueues. The
/// kernel never migrates the thread actually running, so the WAITING
/// pre-condition outranks whatever was inferred before it.
fn load_sched_migrate_task(
    event: &TraceEvent,
    builder: &mut TransitionSetBuilder<'_>,
) -> Result<()> {
    let pid = required(event, "pid")?;
    let orig_cpu = required(event, "orig_cpu")?;
    let dest_cpu = required(event, "dest_cpu")?;

    let mut tt = ThreadTransition::new(event.index, event.timestamp, pid)
        .with_prev_cpu(orig_cpu)
        .with_next_cpu(dest_cpu)
        .with_prev_state(ThreadState::Waiting)
        .with_next_state(ThreadState::Waiting)
        .on_state_conflict(ConflictPolicy::DropPrior);
    if let Some(comm) = event.text("comm") {
        let id = builder.intern(comm);
        tt = tt.with_commands(id);
    }
    if let Some(prio) = event.number("prio") {
        tt = tt.with_priorities(prio);
    }
    builder.push(tt);
    Ok(())
}

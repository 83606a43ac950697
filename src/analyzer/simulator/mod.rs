use crate::config::{AnalyzerConfig, ChoiceStrategy};
use crate::diagnostics::Diagnostic;
use crate::protocol::ast::Role;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;

pub mod asynch;
pub mod callstack;
pub mod global;

pub use asynch::{AsyncReport, AsyncSimulator, simulate_async};
pub use callstack::{CallFrame, CallStackManager};
pub use global::{GlobalReport, GlobalSimulator, simulate_global};

use crate::analyzer::safety::BufferView;

/// How a simulation ended. `MaxSteps` is reported, not fatal: the
/// simulator state stays valid and stepping may resume with a larger
/// budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SimStatus {
    Running,
    Complete,
    Stuck,
    MaxSteps,
    Failed { diagnostic: Diagnostic },
}

impl SimStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SimStatus::Running)
    }
}

/// One entry of the ordered simulation trace. `timestamp` is the logical
/// step counter, which keeps traces deterministic and the pipeline pure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub timestamp: u64,
    pub frame_depth: usize,
    #[serde(flatten)]
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TraceEventKind {
    /// Synchronous pairing fired by the global simulator.
    Message { from: Role, to: Role, label: String },
    /// Asynchronous send into a buffer.
    Sent { from: Role, to: Role, label: String },
    /// Asynchronous receive from a buffer head.
    Received { from: Role, to: Role, label: String },
    SilentStep { role: Role },
    BranchTaken { at: Role, label: String },
    Forked { branches: usize },
    Joined,
    RecursionEntered { label: String, iterations: u32 },
    Continued { label: String },
    CallPushed { protocol: String },
    CallPopped { protocol: String },
    Buffers { buffers: Vec<BufferView> },
}

/// Ordered event collector. Recording is switched off as a whole by
/// configuration; the simulators still run identically.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
    record: bool,
}

impl Trace {
    pub fn new(record: bool) -> Self {
        Self {
            events: Vec::new(),
            record,
        }
    }

    pub fn push(&mut self, timestamp: u64, frame_depth: usize, kind: TraceEventKind) {
        if self.record {
            self.events.push(TraceEvent {
                timestamp,
                frame_depth,
                kind,
            });
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Resolves branch points and schedules enabled steps. The random variant
/// is reproducible through the configured seed; user picks are queued up
/// front and fall back to the first option when exhausted.
pub enum Strategy {
    Deterministic,
    Random(StdRng),
    UserPicked(VecDeque<usize>),
}

impl Strategy {
    pub fn from_config(config: &AnalyzerConfig) -> Self {
        match config.choice_strategy {
            ChoiceStrategy::Deterministic => Strategy::Deterministic,
            ChoiceStrategy::Random => Strategy::Random(match config.random_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            }),
            ChoiceStrategy::UserPicked => Strategy::UserPicked(VecDeque::new()),
        }
    }

    /// Queue a pick for the user-driven strategy; ignored otherwise.
    pub fn queue_pick(&mut self, choice: usize) {
        if let Strategy::UserPicked(queue) = self {
            queue.push_back(choice);
        }
    }

    pub fn pick(&mut self, count: usize) -> usize {
        debug_assert!(count > 0);
        match self {
            Strategy::Deterministic => 0,
            Strategy::Random(rng) => rng.gen_range(0..count),
            Strategy::UserPicked(queue) => queue
                .pop_front()
                .filter(|choice| *choice < count)
                .unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_random_strategy_is_reproducible() {
        let mut config = AnalyzerConfig::default();
        config.choice_strategy = ChoiceStrategy::Random;
        config.random_seed = Some(42);
        let mut first = Strategy::from_config(&config);
        let mut second = Strategy::from_config(&config);
        let picks_first: Vec<usize> = (0..16).map(|_| first.pick(5)).collect();
        let picks_second: Vec<usize> = (0..16).map(|_| second.pick(5)).collect();
        assert_eq!(picks_first, picks_second);
    }

    #[test]
    fn test_user_picks_fall_back_to_first_option() {
        let mut strategy = Strategy::UserPicked(VecDeque::new());
        strategy.queue_pick(2);
        strategy.queue_pick(9);
        assert_eq!(strategy.pick(3), 2);
        assert_eq!(strategy.pick(3), 0, "out-of-range pick falls back");
        assert_eq!(strategy.pick(3), 0, "exhausted queue falls back");
    }

    #[test]
    fn test_trace_respects_record_flag() {
        let mut trace = Trace::new(false);
        trace.push(0, 0, TraceEventKind::Joined);
        assert!(trace.is_empty());
        let mut trace = Trace::new(true);
        trace.push(0, 0, TraceEventKind::Joined);
        assert_eq!(trace.len(), 1);
    }
}

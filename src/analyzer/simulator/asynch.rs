use super::{SimStatus, Strategy, Trace, TraceEvent, TraceEventKind};
use crate::analyzer::cfsm::{ActionLabel, StateId};
use crate::analyzer::safety::{BufferView, CfsmSystem, TypingContext};
use crate::config::AnalyzerConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::protocol::ast::Role;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Result of an asynchronous simulation run: the trace plus the final Γ.
#[derive(Debug, Clone, Serialize)]
pub struct AsyncReport {
    pub status: SimStatus,
    pub steps: u32,
    pub trace: Vec<TraceEvent>,
    pub final_states: BTreeMap<Role, String>,
    pub final_buffers: Vec<BufferView>,
}

pub fn simulate_async(system: &CfsmSystem, config: &AnalyzerConfig) -> AsyncReport {
    let mut simulator = AsyncSimulator::new(system, config);
    simulator.run();
    simulator.into_report()
}

/// One schedulable step of the composed machines.
#[derive(Debug, Clone)]
enum Candidate {
    Send {
        role: Role,
        peer: Role,
        label: String,
        to_state: StateId,
    },
    Receive {
        role: Role,
        peer: Role,
        label: String,
        to_state: StateId,
    },
    Tau {
        role: Role,
        to_state: StateId,
    },
}

/// Step-wise interpreter over a typing context with per-sender FIFO
/// buffers. Send is non-blocking up to the hard buffer bound; receive is
/// enabled only on a matching buffer head; τ is always safe to fire.
pub struct AsyncSimulator<'a> {
    system: &'a CfsmSystem,
    config: &'a AnalyzerConfig,
    strategy: Strategy,
    ctx: TypingContext,
    trace: Trace,
    steps: u32,
    status: SimStatus,
}

impl<'a> AsyncSimulator<'a> {
    pub fn new(system: &'a CfsmSystem, config: &'a AnalyzerConfig) -> Self {
        Self {
            system,
            config,
            strategy: Strategy::from_config(config),
            ctx: TypingContext::initial(system),
            trace: Trace::new(config.record_trace),
            steps: 0,
            status: SimStatus::Running,
        }
    }

    pub fn status(&self) -> &SimStatus {
        &self.status
    }

    pub fn context(&self) -> &TypingContext {
        &self.ctx
    }

    /// Queue a pick for the user-driven strategy.
    pub fn queue_pick(&mut self, choice: usize) {
        self.strategy.queue_pick(choice);
    }

    fn candidates(&self) -> Vec<Candidate> {
        let mut out = Vec::new();
        for (role, cfsm) in self.system {
            let state = self.ctx.state_of(role);
            for transition in cfsm.outgoing(state) {
                match &transition.action {
                    ActionLabel::Send { peer, label } => out.push(Candidate::Send {
                        role: role.clone(),
                        peer: peer.clone(),
                        label: label.clone(),
                        to_state: transition.to,
                    }),
                    ActionLabel::Receive { peer, label } => {
                        if self.ctx.buffer_head(peer, role) == Some(label.as_str()) {
                            out.push(Candidate::Receive {
                                role: role.clone(),
                                peer: peer.clone(),
                                label: label.clone(),
                                to_state: transition.to,
                            });
                        }
                    }
                    ActionLabel::Tau => out.push(Candidate::Tau {
                        role: role.clone(),
                        to_state: transition.to,
                    }),
                }
            }
        }
        out
    }

    /// Fire one scheduled step. The strategy sees every enabled candidate
    /// in role order, then transition order, so deterministic runs are
    /// reproducible.
    pub fn step(&mut self) {
        if !self.status.is_running() {
            return;
        }
        if self.steps >= self.config.max_steps {
            self.status = SimStatus::MaxSteps;
            return;
        }

        let candidates = self.candidates();
        if candidates.is_empty() {
            self.status = if self.ctx.is_terminal(self.system) {
                SimStatus::Complete
            } else {
                SimStatus::Stuck
            };
            return;
        }

        let choice = self.strategy.pick(candidates.len());
        let candidate = candidates[choice].clone();
        self.steps += 1;
        let timestamp = self.steps as u64;

        match candidate {
            Candidate::Send {
                role,
                peer,
                label,
                to_state,
            } => {
                if self.ctx.buffer_len(&role, &peer) >= self.config.buffer_bound as usize {
                    self.status = SimStatus::Failed {
                        diagnostic: Diagnostic::error(
                            DiagnosticKind::BufferOverflow,
                            format!(
                                "sending {label} from {role} to {peer} exceeds the buffer bound of {}",
                                self.config.buffer_bound
                            ),
                        )
                        .entity(format!("({role}, {peer})")),
                    };
                    return;
                }
                self.ctx.push_message(&role, &peer, label.clone());
                self.ctx.set_state(&role, to_state);
                self.trace.push(
                    timestamp,
                    0,
                    TraceEventKind::Sent {
                        from: role,
                        to: peer,
                        label,
                    },
                );
                self.snapshot_buffers(timestamp);
            }
            Candidate::Receive {
                role,
                peer,
                label,
                to_state,
            } => {
                self.ctx.pop_message(&peer, &role);
                self.ctx.set_state(&role, to_state);
                self.trace.push(
                    timestamp,
                    0,
                    TraceEventKind::Received {
                        from: peer,
                        to: role,
                        label,
                    },
                );
                self.snapshot_buffers(timestamp);
            }
            Candidate::Tau { role, to_state } => {
                self.ctx.set_state(&role, to_state);
                self.trace
                    .push(timestamp, 0, TraceEventKind::SilentStep { role });
            }
        }
    }

    fn snapshot_buffers(&mut self, timestamp: u64) {
        let buffers = self.ctx.buffer_snapshot();
        self.trace
            .push(timestamp, 0, TraceEventKind::Buffers { buffers });
    }

    pub fn run(&mut self) -> &SimStatus {
        while self.status.is_running() {
            self.step();
        }
        debug!(steps = self.steps, status = ?self.status, "async simulation finished");
        &self.status
    }

    pub fn into_report(self) -> AsyncReport {
        let final_states = self
            .system
            .keys()
            .map(|role| (role.clone(), self.ctx.state_of(role).to_string()))
            .collect();
        AsyncReport {
            status: self.status,
            steps: self.steps,
            trace: self.trace.into_events(),
            final_states,
            final_buffers: self.ctx.buffer_snapshot(),
        }
    }
}

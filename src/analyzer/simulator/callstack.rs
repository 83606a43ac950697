use super::{Trace, TraceEventKind};
use crate::analyzer::cfg::NodeId;
use crate::config::AnalyzerConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind, SourceLoc};
use crate::protocol::ast::Role;
use std::collections::BTreeMap;

/// One sub-protocol invocation in flight.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub protocol: String,
    /// The `do` node in the caller's CFG; execution resumes after it.
    pub call_node: NodeId,
    pub role_mapping: BTreeMap<Role, Role>,
}

/// Shared by every simulator instance of one run: the cross-protocol call
/// stack, the step budget and the trace. Recursion stacks deliberately do
/// not live here; each simulator instance keeps its own, which is what
/// scopes `continue` labels lexically.
#[derive(Debug)]
pub struct CallStackManager {
    frames: Vec<CallFrame>,
    max_depth: usize,
    steps_taken: u32,
    max_steps: u32,
    trace: Trace,
}

impl CallStackManager {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            frames: Vec::new(),
            max_depth: config.call_stack_max as usize,
            steps_taken: 0,
            max_steps: config.max_steps,
            trace: Trace::new(config.record_trace),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, frame: CallFrame, loc: Option<SourceLoc>) -> Result<(), Diagnostic> {
        if self.frames.len() + 1 > self.max_depth {
            return Err(Diagnostic::error(
                DiagnosticKind::CallStackOverflow,
                format!(
                    "invoking {} would exceed the call stack bound of {}",
                    frame.protocol, self.max_depth
                ),
            )
            .at_opt(loc)
            .entity(frame.protocol.clone()));
        }
        self.record(TraceEventKind::CallPushed {
            protocol: frame.protocol.clone(),
        });
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<CallFrame> {
        let frame = self.frames.pop();
        if let Some(frame) = &frame {
            self.record(TraceEventKind::CallPopped {
                protocol: frame.protocol.clone(),
            });
        }
        frame
    }

    pub fn current_frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    /// Consume one unit of the shared step budget. Returns false when the
    /// budget is exhausted; the caller reports `MaxSteps` and keeps state.
    pub fn consume_step(&mut self) -> bool {
        if self.steps_taken >= self.max_steps {
            return false;
        }
        self.steps_taken += 1;
        true
    }

    pub fn steps_taken(&self) -> u32 {
        self.steps_taken
    }

    pub fn record(&mut self, kind: TraceEventKind) {
        let timestamp = self.steps_taken as u64;
        let depth = self.frames.len();
        self.trace.push(timestamp, depth, kind);
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_beyond_bound_overflows() {
        let mut config = AnalyzerConfig::default();
        config.call_stack_max = 2;
        let mut manager = CallStackManager::new(&config);
        for i in 0..2 {
            manager
                .push(
                    CallFrame {
                        protocol: format!("P{i}"),
                        call_node: NodeId(0),
                        role_mapping: BTreeMap::new(),
                    },
                    None,
                )
                .unwrap();
        }
        let error = manager
            .push(
                CallFrame {
                    protocol: "Deep".to_string(),
                    call_node: NodeId(0),
                    role_mapping: BTreeMap::new(),
                },
                None,
            )
            .unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::CallStackOverflow);
        assert_eq!(manager.depth(), 2);
    }

    #[test]
    fn test_step_budget_is_shared_and_bounded() {
        let mut config = AnalyzerConfig::default();
        config.max_steps = 3;
        let mut manager = CallStackManager::new(&config);
        assert!(manager.consume_step());
        assert!(manager.consume_step());
        assert!(manager.consume_step());
        assert!(!manager.consume_step(), "budget of 3 admits exactly 3 steps");
        assert_eq!(manager.steps_taken(), 3);
    }
}

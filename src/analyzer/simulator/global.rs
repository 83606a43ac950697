use super::callstack::{CallFrame, CallStackManager};
use super::{SimStatus, Strategy, TraceEvent, TraceEventKind};
use crate::analyzer::cfg::{Cfg, CfgNode, EdgeLabel, NodeId};
use crate::config::AnalyzerConfig;
use crate::protocol::ast::Role;
use crate::protocol::registry::ProtocolRegistry;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Result of a global-mode simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalReport {
    pub status: SimStatus,
    pub steps: u32,
    pub trace: Vec<TraceEvent>,
}

/// Walk one CFG synchronously, orchestrating every role. Parallel branches
/// are interleaved round-robin over branch indices so traces reproduce.
pub fn simulate_global(
    cfg: &Cfg,
    registry: &ProtocolRegistry,
    config: &AnalyzerConfig,
) -> GlobalReport {
    let mut manager = CallStackManager::new(config);
    let mut strategy = Strategy::from_config(config);
    let mut simulator = GlobalSimulator::new(cfg, registry, config, BTreeMap::new());
    let status = simulator.run(&mut manager, &mut strategy);
    debug!(steps = manager.steps_taken(), ?status, "global simulation finished");
    GlobalReport {
        status,
        steps: manager.steps_taken(),
        trace: manager.into_trace().into_events(),
    }
}

/// Intra-protocol loop bookkeeping; one stack per simulator instance.
#[derive(Debug, Clone)]
pub struct RecursionFrame {
    pub label: String,
    pub entry: NodeId,
    pub iterations: u32,
}

/// One interpreter instance over one CFG. Sub-protocol invocations spawn a
/// child instance sharing the call-stack manager but owning a fresh
/// recursion stack, which enforces lexical scoping of continue labels.
pub struct GlobalSimulator<'a> {
    cfg: &'a Cfg,
    registry: &'a ProtocolRegistry,
    config: &'a AnalyzerConfig,
    /// Formal-to-actual substitution; empty at the top level.
    mapping: BTreeMap<Role, Role>,
    /// Program counters; more than one only between fork and join.
    cursors: Vec<NodeId>,
    round_robin: usize,
    join_arrivals: HashMap<NodeId, usize>,
    join_expected: HashMap<NodeId, usize>,
    recursion: Vec<RecursionFrame>,
    status: SimStatus,
}

impl<'a> GlobalSimulator<'a> {
    pub fn new(
        cfg: &'a Cfg,
        registry: &'a ProtocolRegistry,
        config: &'a AnalyzerConfig,
        mapping: BTreeMap<Role, Role>,
    ) -> Self {
        Self {
            cfg,
            registry,
            config,
            mapping,
            cursors: vec![cfg.entry],
            round_robin: 0,
            join_arrivals: HashMap::new(),
            join_expected: HashMap::new(),
            recursion: Vec::new(),
            status: SimStatus::Running,
        }
    }

    pub fn status(&self) -> &SimStatus {
        &self.status
    }

    pub fn recursion_stack(&self) -> &[RecursionFrame] {
        &self.recursion
    }

    fn actual(&self, role: &Role) -> Role {
        self.mapping.get(role).cloned().unwrap_or_else(|| role.clone())
    }

    pub fn run(&mut self, manager: &mut CallStackManager, strategy: &mut Strategy) -> SimStatus {
        while self.status.is_running() {
            self.step(manager, strategy);
        }
        self.status.clone()
    }

    /// Fire the next enabled action: advance the scheduled cursor through
    /// structural nodes, then execute one message, branch decision, fork,
    /// continue or sub-protocol invocation.
    pub fn step(&mut self, manager: &mut CallStackManager, strategy: &mut Strategy) {
        if !self.status.is_running() {
            return;
        }
        if self.cursors.is_empty() {
            self.status = SimStatus::Complete;
            return;
        }

        let slot = self.round_robin % self.cursors.len();

        // Structural nodes advance for free until an action is due.
        loop {
            let node = self.cursors[slot];
            match self.cfg.node(node) {
                CfgNode::Entry | CfgNode::Merge => {
                    let Some(next) = self.forward(node) else {
                        self.status = SimStatus::Stuck;
                        return;
                    };
                    self.cursors[slot] = next;
                }
                CfgNode::RecEntry { label } => {
                    if !self.recursion.iter().any(|f| f.entry == node) {
                        self.recursion.push(RecursionFrame {
                            label: label.clone(),
                            entry: node,
                            iterations: 0,
                        });
                        manager.record(TraceEventKind::RecursionEntered {
                            label: label.clone(),
                            iterations: 0,
                        });
                    }
                    let Some(next) = self.forward(node) else {
                        self.status = SimStatus::Stuck;
                        return;
                    };
                    self.cursors[slot] = next;
                }
                CfgNode::Join { .. } => {
                    let expected = *self.join_expected.get(&node).unwrap_or(&1);
                    let arrived = self.join_arrivals.entry(node).or_insert(0);
                    *arrived += 1;
                    if *arrived < expected {
                        // Park this cursor; the last arriver continues.
                        self.cursors.remove(slot);
                        self.round_robin = slot;
                        if self.cursors.is_empty() {
                            self.status = SimStatus::Stuck;
                        }
                        return;
                    }
                    self.join_arrivals.remove(&node);
                    manager.record(TraceEventKind::Joined);
                    let Some(next) = self.forward(node) else {
                        self.status = SimStatus::Stuck;
                        return;
                    };
                    self.cursors[slot] = next;
                }
                CfgNode::Exit => {
                    self.cursors.remove(slot);
                    self.round_robin = slot;
                    if self.cursors.is_empty() {
                        self.status = SimStatus::Complete;
                    }
                    return;
                }
                _ => break,
            }
        }

        if !manager.consume_step() {
            self.status = SimStatus::MaxSteps;
            return;
        }

        let node = self.cursors[slot];
        self.round_robin = slot + 1;
        match self.cfg.node(node).clone() {
            CfgNode::Message { from, to, message } => {
                manager.record(TraceEventKind::Message {
                    from: self.actual(&from),
                    to: self.actual(&to),
                    label: message.label,
                });
                match self.forward(node) {
                    Some(next) => self.cursors[slot] = next,
                    None => self.status = SimStatus::Stuck,
                }
            }
            CfgNode::Branch { at } => {
                let options: Vec<(NodeId, String)> = self
                    .cfg
                    .successors(node)
                    .iter()
                    .filter_map(|(target, edge)| match edge {
                        EdgeLabel::Branch { label } => Some((*target, label.clone())),
                        _ => None,
                    })
                    .collect();
                if options.is_empty() {
                    self.status = SimStatus::Stuck;
                    return;
                }
                let choice = strategy.pick(options.len());
                let (target, label) = options[choice].clone();
                manager.record(TraceEventKind::BranchTaken {
                    at: self.actual(&at),
                    label,
                });
                self.cursors[slot] = target;
            }
            CfgNode::Fork { .. } => {
                let targets: Vec<NodeId> = self
                    .cfg
                    .successors(node)
                    .iter()
                    .filter_map(|(target, edge)| match edge {
                        EdgeLabel::Par { .. } => Some(*target),
                        _ => None,
                    })
                    .collect();
                if let Some(join) = self.cfg.join_of(node) {
                    self.join_expected.insert(join, targets.len());
                }
                manager.record(TraceEventKind::Forked {
                    branches: targets.len(),
                });
                // The current slot takes the first branch; the rest are
                // appended. Scheduling restarts at the first branch so the
                // canonical interleaving is round-robin in index order.
                let mut targets = targets.into_iter();
                match targets.next() {
                    Some(first) => self.cursors[slot] = first,
                    None => {
                        self.status = SimStatus::Stuck;
                        return;
                    }
                }
                self.cursors.extend(targets);
                self.round_robin = slot;
            }
            CfgNode::Continue { label } => {
                let Some(rec) = self.cfg.recursion_entry_of(node) else {
                    self.status = SimStatus::Stuck;
                    return;
                };
                if let Some(frame) = self.recursion.iter_mut().find(|f| f.entry == rec) {
                    frame.iterations += 1;
                    manager.record(TraceEventKind::Continued { label });
                    manager.record(TraceEventKind::RecursionEntered {
                        label: frame.label.clone(),
                        iterations: frame.iterations,
                    });
                }
                self.cursors[slot] = rec;
            }
            CfgNode::SubInvoke {
                protocol,
                role_args,
                ..
            } => {
                self.invoke_sub_protocol(manager, strategy, node, &protocol, &role_args, slot);
            }
            CfgNode::Entry
            | CfgNode::Exit
            | CfgNode::Merge
            | CfgNode::Join { .. }
            | CfgNode::RecEntry { .. } => {
                unreachable!("structural nodes are consumed before the action dispatch")
            }
        }
    }

    /// Push a frame, run a child simulator instance over the callee's CFG
    /// to completion, pop the frame and resume after the `do` node.
    fn invoke_sub_protocol(
        &mut self,
        manager: &mut CallStackManager,
        strategy: &mut Strategy,
        node: NodeId,
        protocol: &str,
        role_args: &[Role],
        slot: usize,
    ) {
        let loc = self.cfg.loc(node);
        let actual_args: Vec<Role> = role_args.iter().map(|r| self.actual(r)).collect();
        let mapping = match self.registry.substitution(protocol, &actual_args, loc) {
            Ok(mapping) => mapping,
            Err(diagnostic) => {
                self.status = SimStatus::Failed { diagnostic };
                return;
            }
        };
        let entry = self
            .registry
            .get(protocol)
            .expect("substitution already resolved the protocol");

        if let Err(diagnostic) = manager.push(
            CallFrame {
                protocol: protocol.to_string(),
                call_node: node,
                role_mapping: mapping.clone(),
            },
            loc,
        ) {
            self.status = SimStatus::Failed { diagnostic };
            return;
        }

        let mut child = GlobalSimulator::new(&entry.cfg, self.registry, self.config, mapping);
        let child_status = child.run(manager, strategy);
        manager.pop();

        match child_status {
            SimStatus::Complete => match self.forward(node) {
                Some(next) => self.cursors[slot] = next,
                None => self.status = SimStatus::Stuck,
            },
            other => self.status = other,
        }
    }

    fn forward(&self, node: NodeId) -> Option<NodeId> {
        self.cfg
            .successors(node)
            .iter()
            .find(|(_, edge)| !matches!(edge, EdgeLabel::Back))
            .map(|(next, _)| *next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::parser::parse_source;
    use crate::config::ChoiceStrategy;
    use crate::diagnostics::DiagnosticKind;

    fn run(source: &str, name: &str, config: &AnalyzerConfig) -> GlobalReport {
        let outcome = parse_source(source);
        assert!(outcome.is_clean(), "parse failed: {:?}", outcome.diagnostics);
        let (registry, diagnostics) = ProtocolRegistry::from_module(&outcome.module);
        assert!(!diagnostics.has_errors(), "CFG failed: {diagnostics:?}");
        let cfg = &registry.get(name).expect("protocol registered").cfg;
        simulate_global(cfg, &registry, config)
    }

    fn messages(report: &GlobalReport) -> Vec<String> {
        report
            .trace
            .iter()
            .filter_map(|e| match &e.kind {
                TraceEventKind::Message { from, to, label } => {
                    Some(format!("{from}->{to}:{label}"))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ping_pong_trace_order() {
        let report = run(
            "protocol PingPong(role A, role B) { A -> B: Ping(); B -> A: Pong(); }",
            "PingPong",
            &AnalyzerConfig::default(),
        );
        assert_eq!(report.status, SimStatus::Complete);
        assert_eq!(
            messages(&report),
            vec!["A->B:Ping".to_string(), "B->A:Pong".to_string()]
        );
        assert_eq!(report.steps, 2);
    }

    #[test]
    fn test_deterministic_strategy_takes_first_branch() {
        let report = run(
            r#"
protocol P(role A, role B) {
    choice at A {
        A -> B: Left();
    } or {
        A -> B: Right();
    }
}
            "#,
            "P",
            &AnalyzerConfig::default(),
        );
        assert_eq!(report.status, SimStatus::Complete);
        assert_eq!(messages(&report), vec!["A->B:Left".to_string()]);
        assert!(report.trace.iter().any(|e| matches!(
            &e.kind,
            TraceEventKind::BranchTaken { label, .. } if label == "Left"
        )));
    }

    #[test]
    fn test_parallel_branches_interleave_round_robin() {
        let report = run(
            r#"
protocol P(role A, role B, role C) {
    par {
        A -> B: M1();
        A -> B: M2();
    } and {
        A -> C: N1();
        A -> C: N2();
    }
}
            "#,
            "P",
            &AnalyzerConfig::default(),
        );
        assert_eq!(report.status, SimStatus::Complete);
        assert_eq!(
            messages(&report),
            vec![
                "A->B:M1".to_string(),
                "A->C:N1".to_string(),
                "A->B:M2".to_string(),
                "A->C:N2".to_string()
            ],
            "round-robin over branch indices is the canonical interleaving"
        );
    }

    #[test]
    fn test_recursion_stops_at_max_steps_and_is_reported() {
        let mut config = AnalyzerConfig::default();
        config.max_steps = 7;
        let report = run(
            "protocol Forever(role A, role B) { rec L { A -> B: Tick(); continue L; } }",
            "Forever",
            &config,
        );
        assert_eq!(report.status, SimStatus::MaxSteps);
        assert_eq!(report.steps, 7);
    }

    #[test]
    fn test_sub_protocol_runs_to_completion_and_pops() {
        let report = run(
            r#"
protocol Main(role A, role B) {
    A -> B: Start();
    do Child(A, B);
    B -> A: Done();
}

protocol Child(role X, role Y) {
    X -> Y: Work();
}
            "#,
            "Main",
            &AnalyzerConfig::default(),
        );
        assert_eq!(report.status, SimStatus::Complete);
        assert_eq!(
            messages(&report),
            vec![
                "A->B:Start".to_string(),
                "A->B:Work".to_string(),
                "B->A:Done".to_string()
            ],
            "role substitution renames the callee's roles in the trace"
        );
        let pushes = report
            .trace
            .iter()
            .filter(|e| matches!(e.kind, TraceEventKind::CallPushed { .. }))
            .count();
        let pops = report
            .trace
            .iter()
            .filter(|e| matches!(e.kind, TraceEventKind::CallPopped { .. }))
            .count();
        assert_eq!(pushes, 1);
        assert_eq!(pops, 1);
    }

    #[test]
    fn test_unbounded_mutual_invocation_overflows_call_stack() {
        let mut config = AnalyzerConfig::default();
        config.call_stack_max = 4;
        let report = run(
            r#"
protocol Main(role A, role B) { do Main(A, B); }
            "#,
            "Main",
            &config,
        );
        match report.status {
            SimStatus::Failed { diagnostic } => {
                assert_eq!(diagnostic.kind, DiagnosticKind::CallStackOverflow);
            }
            other => panic!("expected call stack overflow, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_recursion_labels_stay_lexical() {
        // The child's `continue L` loops inside the child only; the parent
        // then resumes and its own `continue L` drives the outer loop.
        let mut config = AnalyzerConfig::default();
        config.max_steps = 40;
        let report = run(
            r#"
protocol Parent(role A, role B) {
    rec L {
        A -> B: Outer();
        do Child(A, B);
        continue L;
    }
}

protocol Child(role X, role Y) {
    rec L {
        choice at X {
            X -> Y: Inner();
        } or {
            X -> Y: InnerAgain();
            continue L;
        }
    }
}
            "#,
            "Parent",
            &config,
        );
        // Deterministic strategy always takes the first child branch, so
        // the child terminates each time and the parent loops until the
        // step budget runs out.
        assert_eq!(report.status, SimStatus::MaxSteps);
        let sequence = messages(&report);
        assert!(sequence.len() >= 4);
        for pair in sequence.chunks(2) {
            if pair.len() == 2 {
                assert_eq!(pair[0], "A->B:Outer");
                assert_eq!(pair[1], "A->B:Inner");
            }
        }
        let pushes = report
            .trace
            .iter()
            .filter(|e| matches!(e.kind, TraceEventKind::CallPushed { .. }))
            .count();
        let pops = report
            .trace
            .iter()
            .filter(|e| matches!(e.kind, TraceEventKind::CallPopped { .. }))
            .count();
        assert_eq!(pushes, pops, "every frame pushed is popped");
    }

    #[test]
    fn test_random_strategy_with_seed_is_reproducible() {
        let mut config = AnalyzerConfig::default();
        config.choice_strategy = ChoiceStrategy::Random;
        config.random_seed = Some(7);
        let source = r#"
protocol P(role A, role B) {
    choice at A {
        A -> B: Left();
    } or {
        A -> B: Right();
    }
}
        "#;
        let first = run(source, "P", &config);
        let second = run(source, "P", &config);
        assert_eq!(messages(&first), messages(&second));
    }
}

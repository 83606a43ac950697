use crate::analyzer::cfg::NodeId;
use crate::protocol::ast::Role;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Write as _;

/// Stable index of a state inside one CFSM arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct StateId(pub u32);

impl StateId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Alphabet symbol of a local machine: `!peer⟨label⟩`, `?peer⟨label⟩` or τ.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ActionLabel {
    Send { peer: Role, label: String },
    Receive { peer: Role, label: String },
    Tau,
}

impl ActionLabel {
    pub fn is_tau(&self) -> bool {
        matches!(self, ActionLabel::Tau)
    }

    pub fn is_observable(&self) -> bool {
        !self.is_tau()
    }
}

impl std::fmt::Display for ActionLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionLabel::Send { peer, label } => write!(f, "!{peer}<{label}>"),
            ActionLabel::Receive { peer, label } => write!(f, "?{peer}<{label}>"),
            ActionLabel::Tau => f.write_str("tau"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: StateId,
    pub action: ActionLabel,
    pub to: StateId,
}

/// Communicating finite state machine for one role. States carry optional
/// provenance (the CFG node that produced them) for diagnostics only.
#[derive(Debug, Clone, Serialize)]
pub struct Cfsm {
    pub role: Role,
    provenance: Vec<Option<NodeId>>,
    transitions: Vec<Transition>,
    outgoing: Vec<Vec<usize>>,
    pub initial: StateId,
    terminals: BTreeSet<StateId>,
}

impl Cfsm {
    pub fn new(role: Role) -> Self {
        let mut cfsm = Self {
            role,
            provenance: Vec::new(),
            transitions: Vec::new(),
            outgoing: Vec::new(),
            initial: StateId(0),
            terminals: BTreeSet::new(),
        };
        cfsm.initial = cfsm.add_state(None);
        cfsm
    }

    pub fn add_state(&mut self, provenance: Option<NodeId>) -> StateId {
        let id = StateId(self.provenance.len() as u32);
        self.provenance.push(provenance);
        self.outgoing.push(Vec::new());
        id
    }

    /// Add a transition, deduplicating exact repeats (merged branches may
    /// contribute the same edge twice).
    pub fn add_transition(&mut self, from: StateId, action: ActionLabel, to: StateId) {
        let duplicate = self.outgoing[from.index()]
            .iter()
            .any(|&t| self.transitions[t].action == action && self.transitions[t].to == to);
        if duplicate {
            return;
        }
        let index = self.transitions.len();
        self.transitions.push(Transition { from, action, to });
        self.outgoing[from.index()].push(index);
    }

    pub fn mark_terminal(&mut self, state: StateId) {
        self.terminals.insert(state);
    }

    pub fn is_terminal(&self, state: StateId) -> bool {
        self.terminals.contains(&state)
    }

    pub fn terminals(&self) -> impl Iterator<Item = StateId> + '_ {
        self.terminals.iter().copied()
    }

    pub fn state_count(&self) -> usize {
        self.provenance.len()
    }

    pub fn provenance(&self, state: StateId) -> Option<NodeId> {
        self.provenance[state.index()]
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn outgoing(&self, state: StateId) -> impl Iterator<Item = &Transition> + '_ {
        self.outgoing[state.index()]
            .iter()
            .map(move |&index| &self.transitions[index])
    }

    /// A silent state has at least one transition and only τ transitions.
    pub fn is_silent_state(&self, state: StateId) -> bool {
        let mut any = false;
        for transition in self.outgoing(state) {
            if transition.action.is_observable() {
                return false;
            }
            any = true;
        }
        any
    }

    /// τ-closure advances only through states whose single transition is τ.
    /// A τ that competes with another transition is a commitment; the weak
    /// semantics resolves it at the moment an observable fires, so
    /// collapsing it here would lose behavior.
    pub fn deterministic_tau_target(&self, state: StateId) -> Option<StateId> {
        let mut transitions = self.outgoing(state);
        let first = transitions.next()?;
        if transitions.next().is_some() || first.action.is_observable() {
            return None;
        }
        Some(first.to)
    }

    /// States reachable from `state` through τ transitions alone, in BFS
    /// order and including `state` itself. A weak transition fires an
    /// observable from any of these.
    pub fn tau_reachable(&self, state: StateId) -> Vec<StateId> {
        let mut seen = vec![false; self.state_count()];
        let mut order = vec![state];
        seen[state.index()] = true;
        let mut next = 0;
        while next < order.len() {
            let current = order[next];
            next += 1;
            for transition in self.outgoing(current) {
                if transition.action.is_tau() && !seen[transition.to.index()] {
                    seen[transition.to.index()] = true;
                    order.push(transition.to);
                }
            }
        }
        order
    }

    pub fn has_mixed_tau(&self, state: StateId) -> bool {
        let mut tau = false;
        let mut observable = false;
        for transition in self.outgoing(state) {
            if transition.action.is_tau() {
                tau = true;
            } else {
                observable = true;
            }
        }
        tau && observable
    }

    /// States reachable from the initial state.
    pub fn reachable_states(&self) -> Vec<StateId> {
        let mut seen = vec![false; self.state_count()];
        let mut order = Vec::new();
        let mut stack = vec![self.initial];
        seen[self.initial.index()] = true;
        while let Some(state) = stack.pop() {
            order.push(state);
            for transition in self.outgoing(state) {
                if !seen[transition.to.index()] {
                    seen[transition.to.index()] = true;
                    stack.push(transition.to);
                }
            }
        }
        order
    }

    /// Every observable label reachable from the initial state; used by
    /// projection completeness checks and tests.
    pub fn reachable_observables(&self) -> BTreeSet<ActionLabel> {
        let mut out = BTreeSet::new();
        for state in self.reachable_states() {
            for transition in self.outgoing(state) {
                if transition.action.is_observable() {
                    out.insert(transition.action.clone());
                }
            }
        }
        out
    }

    /// Graphviz rendering for the CLI.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph {} {{", self.role);
        let _ = writeln!(out, "    rankdir=LR;");
        for index in 0..self.state_count() {
            let state = StateId(index as u32);
            let shape = if self.is_terminal(state) {
                "doublecircle"
            } else {
                "circle"
            };
            let _ = writeln!(out, "    {state} [shape={shape}];");
        }
        for transition in &self.transitions {
            let _ = writeln!(
                out,
                "    {} -> {} [label=\"{}\"];",
                transition.from, transition.to, transition.action
            );
        }
        let _ = writeln!(out, "}}");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_state_classification() {
        let mut cfsm = Cfsm::new(Role::new("A"));
        let q0 = cfsm.initial;
        let q1 = cfsm.add_state(None);
        let q2 = cfsm.add_state(None);
        cfsm.add_transition(q0, ActionLabel::Tau, q1);
        cfsm.add_transition(
            q1,
            ActionLabel::Receive {
                peer: Role::new("B"),
                label: "M".to_string(),
            },
            q2,
        );
        cfsm.add_transition(q1, ActionLabel::Tau, q2);

        assert!(cfsm.is_silent_state(q0));
        assert_eq!(cfsm.deterministic_tau_target(q0), Some(q1));
        assert!(!cfsm.is_silent_state(q1), "mixed states are not silent");
        assert!(cfsm.has_mixed_tau(q1));
        assert_eq!(
            cfsm.deterministic_tau_target(q1),
            None,
            "a committing τ is not closed over"
        );
        assert!(!cfsm.is_silent_state(q2), "states without transitions are not silent");
    }

    #[test]
    fn test_tau_reachability_follows_branching_silence() {
        let mut cfsm = Cfsm::new(Role::new("A"));
        let q1 = cfsm.add_state(None);
        let q2 = cfsm.add_state(None);
        let q3 = cfsm.add_state(None);
        cfsm.add_transition(cfsm.initial, ActionLabel::Tau, q1);
        cfsm.add_transition(cfsm.initial, ActionLabel::Tau, q2);
        cfsm.add_transition(
            q1,
            ActionLabel::Receive {
                peer: Role::new("B"),
                label: "M".to_string(),
            },
            q3,
        );
        cfsm.add_transition(q2, ActionLabel::Tau, cfsm.initial);

        let reachable = cfsm.tau_reachable(cfsm.initial);
        assert_eq!(reachable, vec![cfsm.initial, q1, q2]);
        assert_eq!(cfsm.tau_reachable(q3), vec![q3]);
    }

    #[test]
    fn test_duplicate_transitions_collapse() {
        let mut cfsm = Cfsm::new(Role::new("A"));
        let q1 = cfsm.add_state(None);
        let send = ActionLabel::Send {
            peer: Role::new("B"),
            label: "M".to_string(),
        };
        cfsm.add_transition(cfsm.initial, send.clone(), q1);
        cfsm.add_transition(cfsm.initial, send, q1);
        assert_eq!(cfsm.transitions().len(), 1);
    }

    #[test]
    fn test_reachable_observables_ignore_disconnected_states() {
        let mut cfsm = Cfsm::new(Role::new("A"));
        let q1 = cfsm.add_state(None);
        let orphan = cfsm.add_state(None);
        cfsm.add_transition(
            cfsm.initial,
            ActionLabel::Send {
                peer: Role::new("B"),
                label: "Used".to_string(),
            },
            q1,
        );
        let q3 = cfsm.add_state(None);
        cfsm.add_transition(
            orphan,
            ActionLabel::Send {
                peer: Role::new("B"),
                label: "Orphan".to_string(),
            },
            q3,
        );
        let labels: Vec<String> = cfsm
            .reachable_observables()
            .into_iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(labels, vec!["!B<Used>".to_string()]);
    }
}

use crate::analyzer::cfsm::{ActionLabel, Cfsm, StateId};
use crate::config::AnalyzerConfig;
use crate::protocol::ast::Role;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::debug;

pub mod property;

pub use property::{SafetyProperty, Violation, property_for};

/// The composed system under analysis: one machine per role.
pub type CfsmSystem = BTreeMap<Role, Cfsm>;

/// The typing context Γ: a current state per role plus one FIFO buffer per
/// ordered pair of roles. Value-like and canonically ordered so it can key
/// the visited set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypingContext {
    states: BTreeMap<Role, StateId>,
    buffers: BTreeMap<(Role, Role), VecDeque<String>>,
}

impl TypingContext {
    pub fn initial(system: &CfsmSystem) -> Self {
        Self {
            states: system
                .iter()
                .map(|(role, cfsm)| (role.clone(), cfsm.initial))
                .collect(),
            buffers: BTreeMap::new(),
        }
    }

    pub fn state_of(&self, role: &Role) -> StateId {
        self.states[role]
    }

    pub fn set_state(&mut self, role: &Role, state: StateId) {
        self.states.insert(role.clone(), state);
    }

    pub fn buffer_len(&self, from: &Role, to: &Role) -> usize {
        self.buffers
            .get(&(from.clone(), to.clone()))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn buffer_head(&self, from: &Role, to: &Role) -> Option<&str> {
        self.buffers
            .get(&(from.clone(), to.clone()))
            .and_then(|q| q.front())
            .map(String::as_str)
    }

    pub fn push_message(&mut self, from: &Role, to: &Role, label: String) {
        self.buffers
            .entry((from.clone(), to.clone()))
            .or_default()
            .push_back(label);
    }

    pub fn pop_message(&mut self, from: &Role, to: &Role) -> Option<String> {
        let key = (from.clone(), to.clone());
        let label = self.buffers.get_mut(&key).and_then(VecDeque::pop_front);
        if let Some(queue) = self.buffers.get(&key) {
            if queue.is_empty() {
                self.buffers.remove(&key);
            }
        }
        label
    }

    pub fn nonempty_buffers(&self) -> impl Iterator<Item = (&(Role, Role), &VecDeque<String>)> {
        self.buffers.iter().filter(|(_, q)| !q.is_empty())
    }

    /// Terminal: every buffer has been drained and every role can rest in
    /// a terminal state, silently finishing any pending τ alternatives.
    /// A role that could only terminate by skipping an observable it has
    /// already performed never gets here, because the observable moved it
    /// past the silent alternative.
    pub fn is_terminal(&self, system: &CfsmSystem) -> bool {
        self.buffers.values().all(VecDeque::is_empty)
            && self.states.iter().all(|(role, state)| {
                let cfsm = &system[role];
                cfsm.tau_reachable(*state)
                    .into_iter()
                    .any(|reachable| cfsm.is_terminal(reachable))
            })
    }

    /// Serializable view of the buffers for traces and witnesses.
    pub fn buffer_snapshot(&self) -> Vec<BufferView> {
        self.nonempty_buffers()
            .map(|((from, to), queue)| BufferView {
                from: from.to_string(),
                to: to.to_string(),
                labels: queue.iter().cloned().collect(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferView {
    pub from: String,
    pub to: String,
    pub labels: Vec<String>,
}

/// One step of the composed system. The checker only ever fires the
/// observable variants (silent prefixes commit with them); `Tau` completes
/// the vocabulary for callers that label silent moves themselves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StepLabel {
    Send {
        from: Role,
        to: Role,
        label: String,
    },
    Receive {
        from: Role,
        to: Role,
        label: String,
    },
    Tau {
        role: Role,
    },
}

impl std::fmt::Display for StepLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepLabel::Send { from, to, label } => write!(f, "{from} -> {to}!{label}"),
            StepLabel::Receive { from, to, label } => write!(f, "{to} ? {from}<{label}>"),
            StepLabel::Tau { role } => write!(f, "{role}: tau"),
        }
    }
}

/// Advance every role across deterministic τ chains until a fixed point,
/// with a cycle guard for silent loops. Buffers are untouched: τ neither
/// enqueues nor dequeues.
pub fn apply_tau_closure(system: &CfsmSystem, mut ctx: TypingContext) -> TypingContext {
    for (role, cfsm) in system {
        let mut state = ctx.state_of(role);
        let mut seen: HashSet<StateId> = HashSet::new();
        while let Some(next) = cfsm.deterministic_tau_target(state) {
            if !seen.insert(state) {
                break;
            }
            state = next;
        }
        ctx.set_state(role, state);
    }
    ctx
}

/// Weakly enabled steps of Γ: for each role, the sends below the buffer
/// bound and the receives whose label matches the buffer head, fired from
/// any τ-reachable state. The silent prefix commits together with the
/// observable (a τ*·a weak transition), so a pending silent alternative is
/// never foreclosed by exploring τ on its own.
pub fn enabled_steps(
    system: &CfsmSystem,
    ctx: &TypingContext,
    buffer_bound: u32,
) -> Vec<(StepLabel, TypingContext)> {
    let mut steps = Vec::new();
    for (role, cfsm) in system {
        for state in cfsm.tau_reachable(ctx.state_of(role)) {
            for transition in cfsm.outgoing(state) {
                match &transition.action {
                    ActionLabel::Send { peer, label } => {
                        if ctx.buffer_len(role, peer) < buffer_bound as usize {
                            let mut next = ctx.clone();
                            next.push_message(role, peer, label.clone());
                            next.set_state(role, transition.to);
                            steps.push((
                                StepLabel::Send {
                                    from: role.clone(),
                                    to: peer.clone(),
                                    label: label.clone(),
                                },
                                next,
                            ));
                        }
                    }
                    ActionLabel::Receive { peer, label } => {
                        if ctx.buffer_head(peer, role) == Some(label.as_str()) {
                            let mut next = ctx.clone();
                            next.pop_message(peer, role);
                            next.set_state(role, transition.to);
                            steps.push((
                                StepLabel::Receive {
                                    from: peer.clone(),
                                    to: role.clone(),
                                    label: label.clone(),
                                },
                                next,
                            ));
                        }
                    }
                    ActionLabel::Tau => {}
                }
            }
        }
    }
    steps
}

/// Result of one safety analysis.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "verdict", rename_all = "camelCase")]
pub enum SafetyVerdict {
    Safe {
        property: String,
        explored: usize,
    },
    Unsafe {
        property: String,
        explored: usize,
        violation: Violation,
        /// Shortest step sequence from the initial Γ to the violating one.
        trace: Vec<StepLabel>,
        buffers_at_violation: Vec<BufferView>,
    },
}

impl SafetyVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, SafetyVerdict::Safe { .. })
    }
}

/// Decide φ for the composed system by breadth-first exploration of the
/// reachable typing contexts under weak-transition semantics. BFS keeps
/// counterexample traces shortest.
pub fn check_safety(system: &CfsmSystem, config: &AnalyzerConfig) -> SafetyVerdict {
    let property = property_for(config.safety_property);
    check_with(system, property.as_ref(), config)
}

pub fn check_with(
    system: &CfsmSystem,
    property: &dyn SafetyProperty,
    config: &AnalyzerConfig,
) -> SafetyVerdict {
    let initial = apply_tau_closure(system, TypingContext::initial(system));

    let mut nodes: Vec<TypingContext> = vec![initial.clone()];
    let mut parents: Vec<Option<(usize, StepLabel)>> = vec![None];
    let mut edges: Vec<Vec<(StepLabel, usize)>> = vec![Vec::new()];
    let mut index: HashMap<TypingContext, usize> = HashMap::from([(initial, 0)]);
    let mut queue: VecDeque<usize> = VecDeque::from([0]);

    while let Some(current) = queue.pop_front() {
        let ctx = nodes[current].clone();
        let steps = enabled_steps(system, &ctx, config.buffer_bound);
        let labels: Vec<StepLabel> = steps.iter().map(|(label, _)| label.clone()).collect();

        if let Some(violation) = property.check_at(system, &ctx, &labels) {
            debug!(explored = nodes.len(), rule = %violation.rule, "violation found");
            return SafetyVerdict::Unsafe {
                property: property.name().to_string(),
                explored: nodes.len(),
                violation,
                trace: trace_to(&parents, current),
                buffers_at_violation: ctx.buffer_snapshot(),
            };
        }

        for (label, next) in steps {
            let closed = apply_tau_closure(system, next);
            let next_index = match index.get(&closed) {
                Some(existing) => *existing,
                None => {
                    let fresh = nodes.len();
                    nodes.push(closed.clone());
                    parents.push(Some((current, label.clone())));
                    edges.push(Vec::new());
                    index.insert(closed, fresh);
                    queue.push_back(fresh);
                    fresh
                }
            };
            edges[current].push((label, next_index));
        }
    }

    let exploration = Exploration {
        system,
        nodes: &nodes,
        edges: &edges,
    };
    if let Some((at, violation)) = property.finalize(&exploration) {
        return SafetyVerdict::Unsafe {
            property: property.name().to_string(),
            explored: nodes.len(),
            violation,
            trace: trace_to(&parents, at),
            buffers_at_violation: nodes[at].buffer_snapshot(),
        };
    }

    debug!(explored = nodes.len(), property = property.name(), "safe");
    SafetyVerdict::Safe {
        property: property.name().to_string(),
        explored: nodes.len(),
    }
}

fn trace_to(parents: &[Option<(usize, StepLabel)>], mut node: usize) -> Vec<StepLabel> {
    let mut trace = Vec::new();
    while let Some((parent, label)) = &parents[node] {
        trace.push(label.clone());
        node = *parent;
    }
    trace.reverse();
    trace
}

/// The full reachability graph, handed to global properties (liveness and
/// friends) after exploration.
pub struct Exploration<'a> {
    pub system: &'a CfsmSystem,
    pub nodes: &'a [TypingContext],
    pub edges: &'a [Vec<(StepLabel, usize)>],
}

impl Exploration<'_> {
    pub fn terminal_nodes(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].is_terminal(self.system))
            .collect()
    }

    /// Nodes from which some terminal node is reachable.
    pub fn can_reach_terminal(&self) -> Vec<bool> {
        let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (from, outgoing) in self.edges.iter().enumerate() {
            for (_, to) in outgoing {
                reverse[*to].push(from);
            }
        }
        let mut can = vec![false; self.nodes.len()];
        let mut stack = self.terminal_nodes();
        for &t in &stack {
            can[t] = true;
        }
        while let Some(node) = stack.pop() {
            for &previous in &reverse[node] {
                if !can[previous] {
                    can[previous] = true;
                    stack.push(previous);
                }
            }
        }
        can
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::cfsm::ActionLabel;

    fn two_role_system(
        a_actions: Vec<ActionLabel>,
        b_actions: Vec<ActionLabel>,
    ) -> CfsmSystem {
        let mut system = BTreeMap::new();
        for (name, actions) in [("A", a_actions), ("B", b_actions)] {
            let mut cfsm = Cfsm::new(Role::new(name));
            let mut state = cfsm.initial;
            for action in actions {
                let next = cfsm.add_state(None);
                cfsm.add_transition(state, action, next);
                state = next;
            }
            cfsm.mark_terminal(state);
            system.insert(Role::new(name), cfsm);
        }
        system
    }

    fn send(peer: &str, label: &str) -> ActionLabel {
        ActionLabel::Send {
            peer: Role::new(peer),
            label: label.to_string(),
        }
    }

    fn receive(peer: &str, label: &str) -> ActionLabel {
        ActionLabel::Receive {
            peer: Role::new(peer),
            label: label.to_string(),
        }
    }

    #[test]
    fn test_tau_closure_collapses_deterministic_chains_only() {
        let mut system = BTreeMap::new();
        let mut a = Cfsm::new(Role::new("A"));
        let q1 = a.add_state(None);
        let q2 = a.add_state(None);
        a.add_transition(a.initial, ActionLabel::Tau, q1);
        a.add_transition(q1, ActionLabel::Tau, q2);
        a.add_transition(q1, receive("B", "M"), q2);
        a.mark_terminal(q2);
        system.insert(Role::new("A"), a);

        let ctx = TypingContext::initial(&system);
        let closed = apply_tau_closure(&system, ctx);
        // q0 -> q1 is deterministic; q1 commits, so closure stops there.
        assert_eq!(closed.state_of(&Role::new("A")), q1);
    }

    #[test]
    fn test_closure_exposes_weakly_enabled_observables() {
        // P5: closure moves A across its τ prefix so the send it could
        // only reach weakly becomes directly enabled, and closing again
        // changes nothing.
        let system = two_role_system(
            vec![ActionLabel::Tau, send("B", "M")],
            vec![receive("A", "M")],
        );
        let before = TypingContext::initial(&system);
        let after = apply_tau_closure(&system, before.clone());
        assert_ne!(
            after.state_of(&Role::new("A")),
            before.state_of(&Role::new("A"))
        );
        let observables: Vec<String> = enabled_steps(&system, &after, 16)
            .into_iter()
            .filter(|(l, _)| !matches!(l, StepLabel::Tau { .. }))
            .map(|(l, _)| l.to_string())
            .collect();
        assert_eq!(observables, vec!["A -> B!M".to_string()]);
        let idempotent = apply_tau_closure(&system, after.clone());
        assert_eq!(idempotent, after);
    }

    #[test]
    fn test_fifo_buffer_order() {
        let mut ctx = TypingContext {
            states: BTreeMap::new(),
            buffers: BTreeMap::new(),
        };
        let a = Role::new("A");
        let b = Role::new("B");
        ctx.push_message(&a, &b, "first".to_string());
        ctx.push_message(&a, &b, "second".to_string());
        assert_eq!(ctx.buffer_head(&a, &b), Some("first"));
        assert_eq!(ctx.pop_message(&a, &b).as_deref(), Some("first"));
        assert_eq!(ctx.pop_message(&a, &b).as_deref(), Some("second"));
        assert_eq!(ctx.buffer_len(&a, &b), 0);
    }

    #[test]
    fn test_send_disabled_at_buffer_bound() {
        let system = two_role_system(vec![send("B", "M")], vec![receive("A", "M")]);
        let mut ctx = TypingContext::initial(&system);
        ctx.push_message(&Role::new("A"), &Role::new("B"), "M".to_string());
        let steps = enabled_steps(&system, &ctx, 1);
        assert!(
            steps
                .iter()
                .all(|(label, _)| !matches!(label, StepLabel::Send { .. })),
            "a full channel disables further sends"
        );
    }
}

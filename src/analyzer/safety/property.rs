use super::{CfsmSystem, Exploration, StepLabel, TypingContext};
use crate::analyzer::cfsm::ActionLabel;
use crate::config::SafetyPropertyKind;
use crate::protocol::ast::Role;
use serde::Serialize;

/// A safety violation: the failed rule plus a human-readable account and,
/// when the rule concerns a specific step, the offending step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub rule: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offender: Option<StepLabel>,
}

impl Violation {
    fn new(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            message: message.into(),
            offender: None,
        }
    }

    fn with_offender(mut self, offender: StepLabel) -> Self {
        self.offender = Some(offender);
        self
    }
}

/// The parametric predicate φ. `check_at` runs on every explored Γ;
/// `finalize` runs once over the whole reachability graph for properties
/// that cannot be decided state-locally.
pub trait SafetyProperty {
    fn name(&self) -> &'static str;

    fn check_at(
        &self,
        system: &CfsmSystem,
        ctx: &TypingContext,
        enabled: &[StepLabel],
    ) -> Option<Violation>;

    fn finalize(&self, _exploration: &Exploration<'_>) -> Option<(usize, Violation)> {
        None
    }
}

pub fn property_for(kind: SafetyPropertyKind) -> Box<dyn SafetyProperty> {
    match kind {
        SafetyPropertyKind::Basic => Box::new(BasicSafety),
        SafetyPropertyKind::DeadlockFree => Box::new(DeadlockFreedom),
        SafetyPropertyKind::Live => Box::new(Liveness),
        SafetyPropertyKind::LivePlus => Box::new(LivePlus),
        SafetyPropertyKind::Consistency => Box::new(Consistency),
    }
}

/// Labels a role can weakly receive from a given peer: receives offered
/// anywhere in the τ-reachable set of its current state.
fn weak_receive_labels(
    system: &CfsmSystem,
    ctx: &TypingContext,
    role: &Role,
    peer: &Role,
) -> Vec<String> {
    let cfsm = &system[role];
    let mut labels = Vec::new();
    for state in cfsm.tau_reachable(ctx.state_of(role)) {
        for transition in cfsm.outgoing(state) {
            if let ActionLabel::Receive { peer: p, label } = &transition.action {
                if p == peer && !labels.contains(label) {
                    labels.push(label.clone());
                }
            }
        }
    }
    labels
}

/// Labels a role can receive from a given peer at its current state, with
/// no silent help; classical duality is decided against these.
fn immediate_receive_labels(
    system: &CfsmSystem,
    ctx: &TypingContext,
    role: &Role,
    peer: &Role,
) -> Vec<String> {
    system[role]
        .outgoing(ctx.state_of(role))
        .filter_map(|t| match &t.action {
            ActionLabel::Receive { peer: p, label } if p == peer => Some(label.clone()),
            _ => None,
        })
        .collect()
}

/// Whether every observable the role can weakly perform is a receive from
/// `peer`, i.e. it is committed to that channel (τ glue is ignored).
fn committed_to_receives_from(
    system: &CfsmSystem,
    ctx: &TypingContext,
    role: &Role,
    peer: &Role,
) -> bool {
    let cfsm = &system[role];
    let mut any = false;
    for state in cfsm.tau_reachable(ctx.state_of(role)) {
        for transition in cfsm.outgoing(state) {
            match &transition.action {
                ActionLabel::Receive { peer: p, .. } if p == peer => any = true,
                ActionLabel::Tau => {}
                _ => return false,
            }
        }
    }
    any
}

/// [S-⊕&] send-receive matching: a buffered message must be acceptable to
/// a receiver that is listening on its channel, and an enabled send toward
/// a receiver committed to that channel must have a dual receive.
/// [S-μ] needs no code of its own: recursion unfolds through the machine's
/// cycles and τ-closure exposes the first observable.
/// [S-→] is the exploration itself: the rules re-run at every reachable Γ.
struct BasicSafety;

impl SafetyProperty for BasicSafety {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn check_at(
        &self,
        system: &CfsmSystem,
        ctx: &TypingContext,
        _enabled: &[StepLabel],
    ) -> Option<Violation> {
        // Reception errors at buffer heads, against the receiver's weakly
        // available receives.
        for ((from, to), queue) in ctx.nonempty_buffers() {
            let head = queue.front().expect("nonempty buffer has a head");
            let expected = weak_receive_labels(system, ctx, to, from);
            if !expected.is_empty() && !expected.iter().any(|l| l == head) {
                return Some(
                    Violation::new(
                        "S-\u{2295}&",
                        format!(
                            "role {to} expects one of {expected:?} from {from} but the buffer head is {head}"
                        ),
                    )
                    .with_offender(StepLabel::Send {
                        from: from.clone(),
                        to: to.clone(),
                        label: head.clone(),
                    }),
                );
            }
        }

        // Weakly enabled sends against committed receivers on an empty
        // channel.
        for (role, cfsm) in system {
            for state in cfsm.tau_reachable(ctx.state_of(role)) {
                for transition in cfsm.outgoing(state) {
                    let ActionLabel::Send { peer, label } = &transition.action else {
                        continue;
                    };
                    if ctx.buffer_len(role, peer) > 0 {
                        continue;
                    }
                    if committed_to_receives_from(system, ctx, peer, role) {
                        let expected = weak_receive_labels(system, ctx, peer, role);
                        if !expected.iter().any(|l| l == label) {
                            return Some(
                                Violation::new(
                                    "S-\u{2295}&",
                                    format!(
                                        "enabled send !{peer}<{label}> by {role} has no matching receive; {peer} expects one of {expected:?}"
                                    ),
                                )
                                .with_offender(StepLabel::Send {
                                    from: role.clone(),
                                    to: peer.clone(),
                                    label: label.clone(),
                                }),
                            );
                        }
                    }
                }
            }
        }
        None
    }
}

/// Basic safety plus: no reachable Γ is stuck (non-terminal with no
/// weakly enabled step).
struct DeadlockFreedom;

impl SafetyProperty for DeadlockFreedom {
    fn name(&self) -> &'static str {
        "deadlock-free"
    }

    fn check_at(
        &self,
        system: &CfsmSystem,
        ctx: &TypingContext,
        enabled: &[StepLabel],
    ) -> Option<Violation> {
        if let Some(violation) = BasicSafety.check_at(system, ctx, enabled) {
            return Some(violation);
        }
        if enabled.is_empty() && !ctx.is_terminal(system) {
            let blocked: Vec<String> = ctx
                .nonempty_buffers()
                .map(|((from, to), queue)| format!("({from}, {to}): {queue:?}"))
                .collect();
            return Some(Violation::new(
                "stuck",
                if blocked.is_empty() {
                    "configuration is stuck: no step is enabled and some role has not terminated"
                        .to_string()
                } else {
                    format!("configuration is stuck with undelivered messages {blocked:?}")
                },
            ));
        }
        None
    }
}

/// Deadlock freedom plus: every reachable Γ can still reach a terminal Γ.
struct Liveness;

impl SafetyProperty for Liveness {
    fn name(&self) -> &'static str {
        "live"
    }

    fn check_at(
        &self,
        system: &CfsmSystem,
        ctx: &TypingContext,
        enabled: &[StepLabel],
    ) -> Option<Violation> {
        DeadlockFreedom.check_at(system, ctx, enabled)
    }

    fn finalize(&self, exploration: &Exploration<'_>) -> Option<(usize, Violation)> {
        finalize_liveness(exploration)
    }
}

fn finalize_liveness(exploration: &Exploration<'_>) -> Option<(usize, Violation)> {
    let can = exploration.can_reach_terminal();
    can.iter().position(|reaches| !reaches).map(|node| {
        (
            node,
            Violation::new(
                "live",
                "configuration can no longer reach a terminal configuration",
            ),
        )
    })
}

/// Liveness plus: no cycle of the reachability graph carries a message
/// that stays buffered through the entire cycle (a message the system can
/// loop forever without consuming).
struct LivePlus;

impl SafetyProperty for LivePlus {
    fn name(&self) -> &'static str {
        "live-plus"
    }

    fn check_at(
        &self,
        system: &CfsmSystem,
        ctx: &TypingContext,
        enabled: &[StepLabel],
    ) -> Option<Violation> {
        DeadlockFreedom.check_at(system, ctx, enabled)
    }

    fn finalize(&self, exploration: &Exploration<'_>) -> Option<(usize, Violation)> {
        if let Some(result) = finalize_liveness(exploration) {
            return Some(result);
        }

        for component in strongly_connected_components(exploration.edges) {
            let cyclic = component.len() > 1
                || exploration.edges[component[0]]
                    .iter()
                    .any(|(_, to)| *to == component[0]);
            if !cyclic {
                continue;
            }
            // Channels non-empty in every node of the cycle.
            let mut persistent: Option<Vec<(Role, Role)>> = None;
            for &node in &component {
                let here: Vec<(Role, Role)> = exploration.nodes[node]
                    .nonempty_buffers()
                    .map(|(channel, _)| channel.clone())
                    .collect();
                persistent = Some(match persistent {
                    None => here,
                    Some(previous) => previous
                        .into_iter()
                        .filter(|c| here.contains(c))
                        .collect(),
                });
            }
            if let Some(channels) = persistent {
                if let Some((from, to)) = channels.first() {
                    return Some((
                        component[0],
                        Violation::new(
                            "live-plus",
                            format!(
                                "the system can loop forever while a message on ({from}, {to}) stays buffered"
                            ),
                        ),
                    ));
                }
            }
        }
        None
    }
}

/// Classical consistency by duality: every enabled send must meet an
/// immediate dual receive and no role may sit on a state that mixes τ
/// with observables or offers several τ commitments (asymmetric choice).
/// Strictly stronger than basic safety.
struct Consistency;

impl SafetyProperty for Consistency {
    fn name(&self) -> &'static str {
        "consistency"
    }

    fn check_at(
        &self,
        system: &CfsmSystem,
        ctx: &TypingContext,
        enabled: &[StepLabel],
    ) -> Option<Violation> {
        if let Some(violation) = BasicSafety.check_at(system, ctx, enabled) {
            return Some(violation);
        }

        for (role, cfsm) in system {
            let state = ctx.state_of(role);
            let taus = cfsm
                .outgoing(state)
                .filter(|t| t.action.is_tau())
                .count();
            if cfsm.has_mixed_tau(state) || taus > 1 {
                return Some(Violation::new(
                    "duality",
                    format!(
                        "role {role} reaches an asymmetric choice point; classical duality rejects it"
                    ),
                ));
            }
        }

        for (role, cfsm) in system {
            for transition in cfsm.outgoing(ctx.state_of(role)) {
                let ActionLabel::Send { peer, label } = &transition.action else {
                    continue;
                };
                let expected = immediate_receive_labels(system, ctx, peer, role);
                if !expected.iter().any(|l| l == label) {
                    return Some(
                        Violation::new(
                            "duality",
                            format!(
                                "send !{peer}<{label}> by {role} has no immediate dual receive at {peer}"
                            ),
                        )
                        .with_offender(StepLabel::Send {
                            from: role.clone(),
                            to: peer.clone(),
                            label: label.clone(),
                        }),
                    );
                }
            }
        }
        None
    }
}

/// Iterative Tarjan over the step graph.
fn strongly_connected_components(edges: &[Vec<(StepLabel, usize)>]) -> Vec<Vec<usize>> {
    let n = edges.len();
    let mut index = vec![usize::MAX; n];
    let mut low = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut components = Vec::new();
    let mut counter = 0usize;

    enum Frame {
        Enter(usize),
        Resume(usize, usize),
    }

    for start in 0..n {
        if index[start] != usize::MAX {
            continue;
        }
        let mut work = vec![Frame::Enter(start)];
        while let Some(frame) = work.pop() {
            match frame {
                Frame::Enter(node) => {
                    index[node] = counter;
                    low[node] = counter;
                    counter += 1;
                    stack.push(node);
                    on_stack[node] = true;
                    work.push(Frame::Resume(node, 0));
                }
                Frame::Resume(node, mut edge_index) => {
                    let mut descended = false;
                    while edge_index < edges[node].len() {
                        let next = edges[node][edge_index].1;
                        edge_index += 1;
                        if index[next] == usize::MAX {
                            work.push(Frame::Resume(node, edge_index));
                            work.push(Frame::Enter(next));
                            descended = true;
                            break;
                        } else if on_stack[next] {
                            low[node] = low[node].min(index[next]);
                        }
                    }
                    if descended {
                        continue;
                    }
                    if low[node] == index[node] {
                        let mut component = Vec::new();
                        loop {
                            let member = stack.pop().expect("tarjan stack is nonempty");
                            on_stack[member] = false;
                            component.push(member);
                            if member == node {
                                break;
                            }
                        }
                        components.push(component);
                    }
                    // Propagate the low link to the parent frame.
                    if let Some(Frame::Resume(parent, _)) = work.last() {
                        let parent = *parent;
                        low[parent] = low[parent].min(low[node]);
                    }
                }
            }
        }
    }
    components
}

use crate::analyzer::cfg::{Cfg, CfgNode, EdgeLabel, NodeId};
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::protocol::ast::Role;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

mod tests;

/// Verdict of the well-formedness pass over one CFG. Warnings never block;
/// the three flags are independent so one run can report every failure.
#[derive(Debug, Clone, Serialize)]
pub struct WellFormedness {
    pub connected: bool,
    pub deterministic: bool,
    pub race_free: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl WellFormedness {
    pub fn holds(&self) -> bool {
        self.connected && self.deterministic && self.race_free
    }
}

/// Verify connectedness, determinism of choice and absence of parallel
/// races. Progress follows from the three under buffered asynchronous
/// semantics and is not separately decided.
pub fn verify(cfg: &Cfg) -> WellFormedness {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let connected = check_connectedness(cfg, &mut errors, &mut warnings);
    let deterministic = check_choice_determinism(cfg, &mut errors);
    let race_free = check_races(cfg, &mut errors);

    WellFormedness {
        connected,
        deterministic,
        race_free,
        errors,
        warnings,
    }
}

fn check_connectedness(
    cfg: &Cfg,
    errors: &mut Vec<Diagnostic>,
    warnings: &mut Vec<Diagnostic>,
) -> bool {
    let reachable = cfg.reachable();
    let mut used: BTreeSet<&Role> = BTreeSet::new();
    // Undirected adjacency of the communication graph over roles.
    let mut adjacency: BTreeMap<&Role, BTreeSet<&Role>> = BTreeMap::new();

    for id in cfg.node_ids() {
        if !reachable[id.index()] {
            continue;
        }
        match cfg.node(id) {
            CfgNode::Message { from, to, .. } => {
                used.insert(from);
                used.insert(to);
                adjacency.entry(from).or_default().insert(to);
                adjacency.entry(to).or_default().insert(from);
            }
            CfgNode::SubInvoke { role_args, .. } => {
                // The invocation couples its arguments; the callee's own
                // actions are checked when the callee is verified.
                for role in role_args {
                    used.insert(role);
                }
                if let Some((first, rest)) = role_args.split_first() {
                    for role in rest {
                        adjacency.entry(first).or_default().insert(role);
                        adjacency.entry(role).or_default().insert(first);
                    }
                }
            }
            _ => {}
        }
    }

    for role in &cfg.roles {
        if !used.contains(role) {
            warnings.push(
                Diagnostic::warning(
                    DiagnosticKind::UnusedRole,
                    format!("role {role} is declared but appears in no reachable action"),
                )
                .entity(role.as_str()),
            );
        }
    }

    // Component count over the roles that do communicate.
    let mut remaining: BTreeSet<&Role> = used.clone();
    let mut components = 0usize;
    while let Some(seed) = remaining.iter().next().copied() {
        components += 1;
        let mut stack = vec![seed];
        remaining.remove(seed);
        while let Some(role) = stack.pop() {
            if let Some(peers) = adjacency.get(role) {
                for peer in peers {
                    if remaining.remove(*peer) {
                        stack.push(*peer);
                    }
                }
            }
        }
    }

    if components > 1 {
        errors.push(
            Diagnostic::error(
                DiagnosticKind::DisconnectedRoles,
                format!(
                    "protocol {} splits its roles into {components} independent groups",
                    cfg.protocol
                ),
            )
            .entity(cfg.protocol.clone()),
        );
        return false;
    }
    true
}

/// A branch's first observables: every `(sender, receiver, label)` that can
/// be the first action seen when that branch is taken.
fn first_observables(cfg: &Cfg, start: NodeId) -> BTreeSet<(Role, Role, String)> {
    let mut out = BTreeSet::new();
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        match cfg.node(id) {
            CfgNode::Message { from, to, message } => {
                out.insert((from.clone(), to.clone(), message.label.clone()));
            }
            _ => {
                for (next, _) in cfg.successors(id) {
                    stack.push(*next);
                }
            }
        }
    }
    out
}

fn check_choice_determinism(cfg: &Cfg, errors: &mut Vec<Diagnostic>) -> bool {
    let reachable = cfg.reachable();
    let mut deterministic = true;

    for id in cfg.node_ids() {
        if !reachable[id.index()] {
            continue;
        }
        let CfgNode::Branch { at } = cfg.node(id) else {
            continue;
        };
        // (channel, label) pairs already claimed by an earlier branch.
        let mut claimed: BTreeSet<(Role, Role, String)> = BTreeSet::new();
        for (target, edge) in cfg.successors(id) {
            if !matches!(edge, EdgeLabel::Branch { .. }) {
                continue;
            }
            for observable in first_observables(cfg, *target) {
                if !claimed.insert(observable.clone()) {
                    let (from, to, label) = observable;
                    deterministic = false;
                    errors.push(
                        Diagnostic::error(
                            DiagnosticKind::AmbiguousChoice,
                            format!(
                                "choice at {at}: two branches start with {label} on channel ({from}, {to})"
                            ),
                        )
                        .at_opt(cfg.loc(id))
                        .entity(label),
                    );
                }
            }
        }
    }
    deterministic
}

/// Nodes of one parallel branch: everything reachable from the branch edge
/// without passing through the construct's join.
fn branch_region(cfg: &Cfg, start: NodeId, join: NodeId) -> Vec<NodeId> {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        if id == join || !seen.insert(id) {
            continue;
        }
        for (next, _) in cfg.successors(id) {
            stack.push(*next);
        }
    }
    seen.into_iter().collect()
}

fn check_races(cfg: &Cfg, errors: &mut Vec<Diagnostic>) -> bool {
    let reachable = cfg.reachable();
    let mut race_free = true;

    for id in cfg.node_ids() {
        if !reachable[id.index()] {
            continue;
        }
        if !matches!(cfg.node(id), CfgNode::Fork { .. }) {
            continue;
        }
        let Some(join) = cfg.join_of(id) else {
            continue;
        };
        let mut per_branch: Vec<BTreeSet<(Role, Role)>> = Vec::new();
        for (target, edge) in cfg.successors(id) {
            if !matches!(edge, EdgeLabel::Par { .. }) {
                continue;
            }
            let mut channels = BTreeSet::new();
            for node in branch_region(cfg, *target, join) {
                if let CfgNode::Message { from, to, .. } = cfg.node(node) {
                    channels.insert((from.clone(), to.clone()));
                }
            }
            per_branch.push(channels);
        }
        for i in 0..per_branch.len() {
            for j in (i + 1)..per_branch.len() {
                for (from, to) in per_branch[i].intersection(&per_branch[j]) {
                    race_free = false;
                    errors.push(
                        Diagnostic::error(
                            DiagnosticKind::Race,
                            format!(
                                "parallel branches {i} and {j} both use channel ({from}, {to})"
                            ),
                        )
                        .at_opt(cfg.loc(id))
                        .entity(format!("({from}, {to})")),
                    );
                }
            }
        }
    }
    race_free
}

use crate::analyzer::cfg::{Cfg, CfgNode, EdgeLabel, NodeId};
use crate::analyzer::cfsm::{ActionLabel, Cfsm, StateId};
use crate::config::AnalyzerConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::protocol::ast::Role;
use crate::protocol::registry::ProtocolRegistry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Project a global CFG onto every declared role.
///
/// τ transitions are preserved, never eliminated: observer roles get a τ
/// per skipped action, merge and join points bridge branch tails onto one
/// state with τ edges, and sub-protocol splices get τ boundaries on entry
/// and exit.
pub fn project_all(
    cfg: &Cfg,
    registry: &ProtocolRegistry,
    config: &AnalyzerConfig,
) -> Result<BTreeMap<Role, Cfsm>, Vec<Diagnostic>> {
    let mut machines = BTreeMap::new();
    let mut errors = Vec::new();
    for role in &cfg.roles {
        match project_role(cfg, registry, role, config) {
            Ok(cfsm) => {
                machines.insert(role.clone(), cfsm);
            }
            Err(error) => errors.push(error),
        }
    }
    if errors.is_empty() {
        Ok(machines)
    } else {
        Err(errors)
    }
}

/// Project a global CFG onto one role.
pub fn project_role(
    cfg: &Cfg,
    registry: &ProtocolRegistry,
    role: &Role,
    config: &AnalyzerConfig,
) -> Result<Cfsm, Diagnostic> {
    let mut projector = Projector {
        registry,
        role: role.clone(),
        cfsm: Cfsm::new(role.clone()),
        max_depth: config.call_stack_max,
    };
    let ctx = WalkCtx {
        cfg,
        mapping: BTreeMap::new(),
        depth: 0,
    };
    let initial = projector.cfsm.initial;
    let mut rec_env = HashMap::new();
    let tail = projector.project_region(&ctx, cfg.entry, cfg.exit, initial, &mut rec_env)?;
    if let Some(state) = tail {
        projector.cfsm.mark_terminal(state);
    }
    Ok(projector.cfsm)
}

/// One walk over one CFG: the graph plus the role substitution in effect
/// (identity at the top level) and the current splice depth.
struct WalkCtx<'c> {
    cfg: &'c Cfg,
    mapping: BTreeMap<Role, Role>,
    depth: u32,
}

impl WalkCtx<'_> {
    fn actual(&self, role: &Role) -> Role {
        self.mapping.get(role).cloned().unwrap_or_else(|| role.clone())
    }
}

/// The role's first involvement along one branch of a choice, used to
/// decide whether branches can be merged for a non-deciding role.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Involve {
    /// The branch can complete without involving the role.
    Observer,
    Recv(Role, String),
    Send(Role, String),
}

struct Projector<'a> {
    registry: &'a ProtocolRegistry,
    role: Role,
    cfsm: Cfsm,
    max_depth: u32,
}

impl Projector<'_> {
    /// Walk the region `[node, stop)` from `state`. Returns the state at
    /// `stop`, or `None` when every path diverges through a `continue`.
    fn project_region(
        &mut self,
        ctx: &WalkCtx<'_>,
        node: NodeId,
        stop: NodeId,
        state: StateId,
        rec_env: &mut HashMap<NodeId, StateId>,
    ) -> Result<Option<StateId>, Diagnostic> {
        let cfg = ctx.cfg;
        let mut current = node;
        let mut state = state;
        loop {
            if current == stop {
                return Ok(Some(state));
            }
            match cfg.node(current) {
                CfgNode::Entry | CfgNode::Merge | CfgNode::Join { .. } => {
                    current = forward_successor(cfg, current)
                        .expect("structural nodes have a forward successor");
                }
                CfgNode::Exit => return Ok(Some(state)),
                CfgNode::Message { from, to, message } => {
                    let from = ctx.actual(from);
                    let to = ctx.actual(to);
                    let action = if from == self.role {
                        ActionLabel::Send {
                            peer: to,
                            label: message.label.clone(),
                        }
                    } else if to == self.role {
                        ActionLabel::Receive {
                            peer: from,
                            label: message.label.clone(),
                        }
                    } else {
                        ActionLabel::Tau
                    };
                    let next = self.cfsm.add_state(Some(current));
                    self.cfsm.add_transition(state, action, next);
                    state = next;
                    current = forward_successor(cfg, current)
                        .expect("action nodes have a forward successor");
                }
                CfgNode::SubInvoke {
                    protocol,
                    role_args,
                    ..
                } => {
                    match self.splice_sub_protocol(ctx, current, protocol, role_args, state)? {
                        Some(resumed) => {
                            state = resumed;
                            current = forward_successor(cfg, current)
                                .expect("sub-invoke nodes have a forward successor");
                        }
                        None => return Ok(None),
                    }
                }
                CfgNode::Branch { at } => {
                    let merge = cfg
                        .merge_of(current)
                        .expect("builder pairs every branch with a merge");
                    let decider = ctx.actual(at) == self.role;
                    if !decider {
                        self.check_mergeable(ctx, current, merge)?;
                    }
                    let mut tails: Vec<StateId> = Vec::new();
                    for (target, edge) in cfg.successors(current).to_vec() {
                        if !matches!(edge, EdgeLabel::Branch { .. }) {
                            continue;
                        }
                        if let Some(tail) =
                            self.project_region(ctx, target, merge, state, rec_env)?
                        {
                            tails.push(tail);
                        }
                    }
                    tails.sort();
                    tails.dedup();
                    let merged = match tails.as_slice() {
                        [] => return Ok(None),
                        [single] => *single,
                        many => {
                            let merged = self.cfsm.add_state(Some(merge));
                            for tail in many {
                                self.cfsm.add_transition(*tail, ActionLabel::Tau, merged);
                            }
                            merged
                        }
                    };
                    state = merged;
                    current = merge;
                }
                CfgNode::Fork { .. } => {
                    let join = cfg
                        .join_of(current)
                        .expect("builder pairs every fork with a join");
                    match self.project_fork(ctx, current, join, state)? {
                        Some(after) => {
                            state = after;
                            current = join;
                        }
                        None => return Ok(None),
                    }
                }
                CfgNode::RecEntry { .. } => {
                    rec_env.insert(current, state);
                    current = forward_successor(cfg, current)
                        .expect("recursion entries have a forward successor");
                }
                CfgNode::Continue { .. } => {
                    let rec = cfg
                        .recursion_entry_of(current)
                        .expect("builder resolves every continue");
                    let back = rec_env
                        .get(&rec)
                        .copied()
                        .expect("continue targets an entry seen on this walk");
                    self.cfsm.add_transition(state, ActionLabel::Tau, back);
                    return Ok(None);
                }
            }
        }
    }

    /// Resolve a `do` node, substitute role arguments and splice the
    /// callee's projection between τ boundaries. A fresh recursion
    /// environment enforces lexical scoping of the callee's labels.
    fn splice_sub_protocol(
        &mut self,
        ctx: &WalkCtx<'_>,
        node: NodeId,
        protocol: &str,
        role_args: &[Role],
        state: StateId,
    ) -> Result<Option<StateId>, Diagnostic> {
        let loc = ctx.cfg.loc(node);
        let actual_args: Vec<Role> = role_args.iter().map(|r| ctx.actual(r)).collect();
        let mapping = self.registry.substitution(protocol, &actual_args, loc)?;
        let entry = self
            .registry
            .get(protocol)
            .expect("substitution already resolved the protocol");
        if ctx.depth + 1 > self.max_depth {
            return Err(Diagnostic::error(
                DiagnosticKind::CallStackOverflow,
                format!(
                    "projecting do {protocol} exceeds the nesting bound of {}",
                    self.max_depth
                ),
            )
            .at_opt(loc)
            .entity(protocol));
        }
        let sub_ctx = WalkCtx {
            cfg: &entry.cfg,
            mapping,
            depth: ctx.depth + 1,
        };
        let enter = self.cfsm.add_state(Some(node));
        self.cfsm.add_transition(state, ActionLabel::Tau, enter);
        let mut sub_env = HashMap::new();
        let sub_tail = self.project_region(
            &sub_ctx,
            sub_ctx.cfg.entry,
            sub_ctx.cfg.exit,
            enter,
            &mut sub_env,
        )?;
        match sub_tail {
            Some(tail) => {
                let resume = self.cfsm.add_state(Some(node));
                self.cfsm.add_transition(tail, ActionLabel::Tau, resume);
                Ok(Some(resume))
            }
            // The callee never reaches its exit; the caller never resumes.
            None => Ok(None),
        }
    }

    /// Fork projection: sequential composition in branch order when the
    /// role participates in at most one branch, explicit interleaving
    /// product otherwise.
    fn project_fork(
        &mut self,
        ctx: &WalkCtx<'_>,
        fork: NodeId,
        join: NodeId,
        state: StateId,
    ) -> Result<Option<StateId>, Diagnostic> {
        let cfg = ctx.cfg;
        let mut targets: Vec<NodeId> = Vec::new();
        for (target, edge) in cfg.successors(fork) {
            if matches!(edge, EdgeLabel::Par { .. }) {
                targets.push(*target);
            }
        }
        let participating = targets
            .iter()
            .filter(|t| self.region_mentions_role(ctx, **t, join))
            .count();

        if participating <= 1 {
            let mut state = state;
            for target in targets {
                // Continues cannot escape a parallel branch, so a fresh
                // environment per branch is sound here too.
                let mut env = HashMap::new();
                match self.project_region(ctx, target, join, state, &mut env)? {
                    Some(tail) => state = tail,
                    None => return Ok(None),
                }
            }
            return Ok(Some(state));
        }

        // Interleaving product over independently projected fragments.
        let mut fragments: Vec<(Cfsm, Option<StateId>)> = Vec::new();
        for target in targets {
            let mut fragment = Projector {
                registry: self.registry,
                role: self.role.clone(),
                cfsm: Cfsm::new(self.role.clone()),
                max_depth: self.max_depth,
            };
            let mut env = HashMap::new();
            let initial = fragment.cfsm.initial;
            let end = fragment.project_region(ctx, target, join, initial, &mut env)?;
            fragments.push((fragment.cfsm, end));
        }
        Ok(self.interleave(&fragments, state, join))
    }

    fn interleave(
        &mut self,
        fragments: &[(Cfsm, Option<StateId>)],
        entry_state: StateId,
        join: NodeId,
    ) -> Option<StateId> {
        let start: Vec<StateId> = fragments.iter().map(|(f, _)| f.initial).collect();
        let mut mapped: HashMap<Vec<StateId>, StateId> = HashMap::new();
        mapped.insert(start.clone(), entry_state);
        let mut queue = VecDeque::from([start]);
        while let Some(tuple) = queue.pop_front() {
            let from = mapped[&tuple];
            for (index, (fragment, _)) in fragments.iter().enumerate() {
                for transition in fragment.outgoing(tuple[index]) {
                    let mut next = tuple.clone();
                    next[index] = transition.to;
                    let to = match mapped.get(&next) {
                        Some(to) => *to,
                        None => {
                            let fresh = self.cfsm.add_state(Some(join));
                            mapped.insert(next.clone(), fresh);
                            queue.push_back(next);
                            fresh
                        }
                    };
                    self.cfsm.add_transition(from, transition.action.clone(), to);
                }
            }
        }
        let ends: Option<Vec<StateId>> = fragments.iter().map(|(_, end)| *end).collect();
        ends.and_then(|tuple| mapped.get(&tuple).copied())
    }

    fn region_mentions_role(&self, ctx: &WalkCtx<'_>, start: NodeId, stop: NodeId) -> bool {
        let cfg = ctx.cfg;
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if id == stop || !seen.insert(id) {
                continue;
            }
            match cfg.node(id) {
                CfgNode::Message { from, to, .. } => {
                    if ctx.actual(from) == self.role || ctx.actual(to) == self.role {
                        return true;
                    }
                }
                CfgNode::SubInvoke { role_args, .. } => {
                    if role_args.iter().any(|r| ctx.actual(r) == self.role) {
                        return true;
                    }
                }
                _ => {}
            }
            for (next, _) in cfg.successors(id) {
                stack.push(*next);
            }
        }
        false
    }

    /// Merge rule for a non-deciding role: branches are mergeable when
    /// their first involvements are identical in every branch, or when no
    /// branch starts with a send by this role (receives and silent
    /// observation mix freely; the safety checker arbitrates the mixed
    /// state). A send this role cannot correlate with the decision is an
    /// `UnprojectableMerge`.
    fn check_mergeable(
        &self,
        ctx: &WalkCtx<'_>,
        branch: NodeId,
        merge: NodeId,
    ) -> Result<(), Diagnostic> {
        let cfg = ctx.cfg;
        let mut per_branch: Vec<BTreeSet<Involve>> = Vec::new();
        for (target, edge) in cfg.successors(branch) {
            if !matches!(edge, EdgeLabel::Branch { .. }) {
                continue;
            }
            let mut involvements = BTreeSet::new();
            self.first_involvements(ctx, *target, merge, &mut involvements)?;
            per_branch.push(involvements);
        }

        let identical = per_branch.windows(2).all(|w| w[0] == w[1]);
        if identical {
            return Ok(());
        }
        let union: BTreeSet<&Involve> = per_branch.iter().flatten().collect();
        let has_send = union.iter().any(|i| matches!(i, Involve::Send(..)));
        if !has_send {
            return Ok(());
        }

        let at = match cfg.node(branch) {
            CfgNode::Branch { at } => ctx.actual(at),
            _ => unreachable!("check_mergeable runs on branch nodes"),
        };
        Err(Diagnostic::error(
            DiagnosticKind::UnprojectableMerge,
            format!(
                "role {} cannot be projected through the choice at {at}: it sends in some branches without learning which branch was taken",
                self.role
            ),
        )
        .at_opt(cfg.loc(branch))
        .entity(self.role.as_str()))
    }

    /// Collect the role's possible first involvements between `start` and
    /// `stop`, looking through sub-protocol invocations.
    fn first_involvements(
        &self,
        ctx: &WalkCtx<'_>,
        start: NodeId,
        stop: NodeId,
        out: &mut BTreeSet<Involve>,
    ) -> Result<(), Diagnostic> {
        let cfg = ctx.cfg;
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if id == stop {
                out.insert(Involve::Observer);
                continue;
            }
            if !seen.insert(id) {
                continue;
            }
            match cfg.node(id) {
                CfgNode::Message { from, to, message } => {
                    let from = ctx.actual(from);
                    let to = ctx.actual(to);
                    if from == self.role {
                        out.insert(Involve::Send(to, message.label.clone()));
                    } else if to == self.role {
                        out.insert(Involve::Recv(from, message.label.clone()));
                    } else {
                        for (next, _) in cfg.successors(id) {
                            stack.push(*next);
                        }
                    }
                }
                CfgNode::SubInvoke {
                    protocol,
                    role_args,
                    ..
                } => {
                    let actual_args: Vec<Role> =
                        role_args.iter().map(|r| ctx.actual(r)).collect();
                    if actual_args.contains(&self.role) {
                        let mapping =
                            self.registry
                                .substitution(protocol, &actual_args, cfg.loc(id))?;
                        if ctx.depth + 1 > self.max_depth {
                            return Err(Diagnostic::error(
                                DiagnosticKind::CallStackOverflow,
                                format!(
                                    "analyzing do {protocol} exceeds the nesting bound of {}",
                                    self.max_depth
                                ),
                            )
                            .at_opt(cfg.loc(id))
                            .entity(protocol));
                        }
                        let entry = self
                            .registry
                            .get(protocol)
                            .expect("substitution already resolved the protocol");
                        let sub_ctx = WalkCtx {
                            cfg: &entry.cfg,
                            mapping,
                            depth: ctx.depth + 1,
                        };
                        let mut sub_out = BTreeSet::new();
                        self.first_involvements(
                            &sub_ctx,
                            sub_ctx.cfg.entry,
                            sub_ctx.cfg.exit,
                            &mut sub_out,
                        )?;
                        let passes_through = sub_out.remove(&Involve::Observer);
                        out.extend(sub_out);
                        if passes_through {
                            for (next, _) in cfg.successors(id) {
                                stack.push(*next);
                            }
                        }
                    } else {
                        for (next, _) in cfg.successors(id) {
                            stack.push(*next);
                        }
                    }
                }
                _ => {
                    for (next, _) in cfg.successors(id) {
                        stack.push(*next);
                    }
                }
            }
        }
        Ok(())
    }
}

fn forward_successor(cfg: &Cfg, node: NodeId) -> Option<NodeId> {
    cfg.successors(node)
        .iter()
        .find(|(_, edge)| !matches!(edge, EdgeLabel::Back))
        .map(|(next, _)| *next)
}

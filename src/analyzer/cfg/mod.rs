use crate::diagnostics::SourceLoc;
use crate::protocol::ast::{Message, Role, TypeExpr};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;

pub mod builder;

pub use builder::build_cfg;

/// Stable index of a node inside one CFG arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Node kinds of the global control-flow graph. A `Message` node is the
/// synchronous pairing of the send and the matching receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CfgNode {
    Entry,
    Exit,
    Message {
        from: Role,
        to: Role,
        message: Message,
    },
    SubInvoke {
        protocol: String,
        type_args: Vec<TypeExpr>,
        role_args: Vec<Role>,
    },
    Branch {
        at: Role,
    },
    Merge,
    Fork {
        par_id: u32,
    },
    Join {
        par_id: u32,
    },
    RecEntry {
        label: String,
    },
    Continue {
        label: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EdgeLabel {
    /// Plain sequencing.
    Seq,
    /// Out of a branch node; carries the discriminating first-action label.
    Branch { label: String },
    /// Out of a fork node; carries the branch index.
    Par { index: u32 },
    /// Back-edge from a continue to its recursion entry.
    Back,
}

/// Node-labeled control-flow graph of one global protocol. Nodes and edges
/// live in arenas addressed by `NodeId`; back-edges close recursion without
/// owning pointer cycles.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub protocol: String,
    pub roles: Vec<Role>,
    nodes: Vec<CfgNode>,
    locs: Vec<Option<SourceLoc>>,
    succs: Vec<Vec<(NodeId, EdgeLabel)>>,
    preds: Vec<Vec<NodeId>>,
    pub entry: NodeId,
    pub exit: NodeId,
    branch_merge: HashMap<NodeId, NodeId>,
    fork_join: HashMap<NodeId, NodeId>,
    continue_target: HashMap<NodeId, NodeId>,
}

impl Cfg {
    pub fn new(protocol: impl Into<String>, roles: Vec<Role>) -> Self {
        let mut cfg = Self {
            protocol: protocol.into(),
            roles,
            nodes: Vec::new(),
            locs: Vec::new(),
            succs: Vec::new(),
            preds: Vec::new(),
            entry: NodeId(0),
            exit: NodeId(0),
            branch_merge: HashMap::new(),
            fork_join: HashMap::new(),
            continue_target: HashMap::new(),
        };
        cfg.entry = cfg.add_node(CfgNode::Entry, None);
        cfg.exit = cfg.add_node(CfgNode::Exit, None);
        cfg
    }

    pub fn add_node(&mut self, node: CfgNode, loc: Option<SourceLoc>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.locs.push(loc);
        self.succs.push(Vec::new());
        self.preds.push(Vec::new());
        id
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId, label: EdgeLabel) {
        self.succs[from.index()].push((to, label));
        self.preds[to.index()].push(from);
    }

    pub fn node(&self, id: NodeId) -> &CfgNode {
        &self.nodes[id.index()]
    }

    pub fn loc(&self, id: NodeId) -> Option<SourceLoc> {
        self.locs[id.index()]
    }

    pub fn successors(&self, id: NodeId) -> &[(NodeId, EdgeLabel)] {
        &self.succs[id.index()]
    }

    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        &self.preds[id.index()]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// The unique sequential successor of a node, if there is exactly one.
    pub fn seq_successor(&self, id: NodeId) -> Option<NodeId> {
        match self.successors(id) {
            [(next, _)] => Some(*next),
            _ => None,
        }
    }

    pub fn merge_of(&self, branch: NodeId) -> Option<NodeId> {
        self.branch_merge.get(&branch).copied()
    }

    pub fn join_of(&self, fork: NodeId) -> Option<NodeId> {
        self.fork_join.get(&fork).copied()
    }

    pub fn recursion_entry_of(&self, continue_node: NodeId) -> Option<NodeId> {
        self.continue_target.get(&continue_node).copied()
    }

    pub(crate) fn pair_branch_merge(&mut self, branch: NodeId, merge: NodeId) {
        self.branch_merge.insert(branch, merge);
    }

    pub(crate) fn pair_fork_join(&mut self, fork: NodeId, join: NodeId) {
        self.fork_join.insert(fork, join);
    }

    pub(crate) fn pair_continue(&mut self, continue_node: NodeId, rec_entry: NodeId) {
        self.continue_target.insert(continue_node, rec_entry);
    }

    /// Nodes reachable from the entry, following all edges including
    /// back-edges.
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![self.entry];
        seen[self.entry.index()] = true;
        while let Some(id) = stack.pop() {
            for (next, _) in self.successors(id) {
                if !seen[next.index()] {
                    seen[next.index()] = true;
                    stack.push(*next);
                }
            }
        }
        seen
    }

    /// Structural invariant check: violations are returned as sentences.
    /// An empty result means the graph satisfies the CFG invariants.
    pub fn structural_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if !self.predecessors(self.entry).is_empty() {
            violations.push("entry node has incoming edges".to_string());
        }
        if !self.successors(self.exit).is_empty() {
            violations.push("exit node has outgoing edges".to_string());
        }

        for id in self.node_ids() {
            match self.node(id) {
                CfgNode::Fork { par_id } => match self.join_of(id) {
                    Some(join) => {
                        if !matches!(self.node(join), CfgNode::Join { par_id: j } if j == par_id) {
                            violations.push(format!("fork {id} is paired with a non-join node"));
                        }
                    }
                    None => violations.push(format!("fork {id} has no matching join")),
                },
                CfgNode::Branch { .. } => {
                    match self.merge_of(id) {
                        Some(merge) => {
                            if !matches!(self.node(merge), CfgNode::Merge) {
                                violations
                                    .push(format!("branch {id} is paired with a non-merge node"));
                            }
                        }
                        None => violations.push(format!("branch {id} has no merge")),
                    }
                }
                CfgNode::Continue { label } => match self.recursion_entry_of(id) {
                    Some(rec) => {
                        let ok = matches!(
                            self.node(rec),
                            CfgNode::RecEntry { label: l } if l == label
                        );
                        if !ok {
                            violations.push(format!(
                                "continue {id} targets a node that is not rec {label}"
                            ));
                        }
                        if !self
                            .successors(id)
                            .iter()
                            .any(|(next, edge)| *next == rec && *edge == EdgeLabel::Back)
                        {
                            violations.push(format!("continue {id} has no back-edge"));
                        }
                    }
                    None => violations.push(format!("continue {id} is unresolved")),
                },
                _ => {}
            }
        }
        violations
    }

    /// Graphviz rendering used by the CLI; provenance only, not semantics.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph {} {{", self.protocol);
        for id in self.node_ids() {
            let label = match self.node(id) {
                CfgNode::Entry => "entry".to_string(),
                CfgNode::Exit => "exit".to_string(),
                CfgNode::Message { from, to, message } => {
                    format!("{from} -> {to}: {}", message.label)
                }
                CfgNode::SubInvoke { protocol, .. } => format!("do {protocol}"),
                CfgNode::Branch { at } => format!("choice at {at}"),
                CfgNode::Merge => "merge".to_string(),
                CfgNode::Fork { par_id } => format!("fork {par_id}"),
                CfgNode::Join { par_id } => format!("join {par_id}"),
                CfgNode::RecEntry { label } => format!("rec {label}"),
                CfgNode::Continue { label } => format!("continue {label}"),
            };
            let _ = writeln!(out, "    {id} [label=\"{label}\"];");
        }
        for id in self.node_ids() {
            for (next, edge) in self.successors(id) {
                match edge {
                    EdgeLabel::Seq => {
                        let _ = writeln!(out, "    {id} -> {next};");
                    }
                    EdgeLabel::Branch { label } => {
                        let _ = writeln!(out, "    {id} -> {next} [label=\"{label}\"];");
                    }
                    EdgeLabel::Par { index } => {
                        let _ = writeln!(out, "    {id} -> {next} [label=\"par {index}\"];");
                    }
                    EdgeLabel::Back => {
                        let _ = writeln!(out, "    {id} -> {next} [style=dashed];");
                    }
                }
            }
        }
        let _ = writeln!(out, "}}");
        out
    }

    /// Directed channels `(sender, receiver)` of all reachable actions.
    pub fn reachable_channels(&self) -> Vec<(Role, Role)> {
        let reachable = self.reachable();
        let mut channels = Vec::new();
        for id in self.node_ids() {
            if !reachable[id.index()] {
                continue;
            }
            if let CfgNode::Message { from, to, .. } = self.node(id) {
                let channel = (from.clone(), to.clone());
                if !channels.contains(&channel) {
                    channels.push(channel);
                }
            }
        }
        channels
    }
}

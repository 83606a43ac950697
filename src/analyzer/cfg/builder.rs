use super::{Cfg, CfgNode, EdgeLabel, NodeId};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics, SourceLoc};
use crate::protocol::ast::{Interaction, ProtocolDecl, Role};

/// Lower one global protocol declaration into a CFG.
///
/// Preconditions checked here rather than deferred: mentioned roles are
/// declared, continue labels resolve lexically, choice and parallel carry
/// at least two branches, duplicate roles and rebound recursion labels are
/// rejected. Arity of `do` invocations is checked later against the
/// registry.
pub fn build_cfg(decl: &ProtocolDecl) -> Result<Cfg, Vec<Diagnostic>> {
    let mut builder = CfgBuilder::new(decl);
    builder.check_declared_roles();
    let entry_link = Link {
        from: builder.cfg.entry,
        label: EdgeLabel::Seq,
    };
    let tail = builder.lower_body(&decl.body, entry_link);
    if let Some(link) = tail {
        let exit = builder.cfg.exit;
        builder.cfg.add_edge(link.from, exit, link.label);
    }
    if builder.diagnostics.has_errors() {
        Err(builder.diagnostics.into_vec())
    } else {
        Ok(builder.cfg)
    }
}

/// A pending edge: the next created node is attached to `from` with
/// `label`.
#[derive(Debug, Clone)]
struct Link {
    from: NodeId,
    label: EdgeLabel,
}

enum Scope {
    Rec { label: String, entry: NodeId },
    /// Continues may not escape a parallel branch.
    ParBoundary,
}

struct CfgBuilder<'a> {
    decl: &'a ProtocolDecl,
    cfg: Cfg,
    diagnostics: Diagnostics,
    scopes: Vec<Scope>,
    next_par_id: u32,
}

impl<'a> CfgBuilder<'a> {
    fn new(decl: &'a ProtocolDecl) -> Self {
        Self {
            decl,
            cfg: Cfg::new(decl.name.clone(), decl.roles.clone()),
            diagnostics: Diagnostics::new(),
            scopes: Vec::new(),
            next_par_id: 0,
        }
    }

    fn check_declared_roles(&mut self) {
        let mut seen: Vec<&Role> = Vec::new();
        for role in &self.decl.roles {
            if seen.contains(&role) {
                self.diagnostics.push(
                    Diagnostic::error(
                        DiagnosticKind::DuplicateRole,
                        format!("role {role} is declared twice in {}", self.decl.name),
                    )
                    .at(self.decl.loc)
                    .entity(role.as_str()),
                );
            }
            seen.push(role);
        }
    }

    fn check_role(&mut self, role: &Role, loc: SourceLoc) {
        if !self.decl.declares_role(role) {
            self.diagnostics.push(
                Diagnostic::error(
                    DiagnosticKind::UndeclaredRole,
                    format!("role {role} is not declared in {}", self.decl.name),
                )
                .at(loc)
                .entity(role.as_str()),
            );
        }
    }

    /// Lower a statement sequence. Returns the pending link out of the last
    /// statement, or `None` when control diverged through a `continue`.
    fn lower_body(&mut self, body: &[Interaction], mut link: Link) -> Option<Link> {
        for interaction in body {
            link = self.lower_interaction(interaction, link)?;
        }
        Some(link)
    }

    fn lower_interaction(&mut self, interaction: &Interaction, link: Link) -> Option<Link> {
        match interaction {
            Interaction::Message {
                from,
                to,
                message,
                loc,
            } => {
                self.check_role(from, *loc);
                // Multicast lowers to one action node per receiver, in
                // declaration order.
                let mut link = link;
                for receiver in to {
                    self.check_role(receiver, *loc);
                    let node = self.cfg.add_node(
                        CfgNode::Message {
                            from: from.clone(),
                            to: receiver.clone(),
                            message: message.clone(),
                        },
                        Some(*loc),
                    );
                    self.cfg.add_edge(link.from, node, link.label.clone());
                    link = Link {
                        from: node,
                        label: EdgeLabel::Seq,
                    };
                }
                Some(link)
            }
            Interaction::Choice { at, branches, loc } => {
                self.check_role(at, *loc);
                if branches.len() < 2 {
                    self.diagnostics.push(
                        Diagnostic::error(
                            DiagnosticKind::EmptyChoice,
                            format!("choice at {at} needs at least two branches"),
                        )
                        .at(*loc)
                        .entity(at.as_str()),
                    );
                }
                let branch_node = self
                    .cfg
                    .add_node(CfgNode::Branch { at: at.clone() }, Some(*loc));
                self.cfg.add_edge(link.from, branch_node, link.label);
                let merge_node = self.cfg.add_node(CfgNode::Merge, Some(*loc));
                self.cfg.pair_branch_merge(branch_node, merge_node);

                for (index, branch) in branches.iter().enumerate() {
                    let label = first_action_label(branch)
                        .unwrap_or_else(|| format!("branch{index}"));
                    let branch_link = Link {
                        from: branch_node,
                        label: EdgeLabel::Branch { label },
                    };
                    if let Some(tail) = self.lower_body(branch, branch_link) {
                        self.cfg.add_edge(tail.from, merge_node, tail.label);
                    }
                }
                Some(Link {
                    from: merge_node,
                    label: EdgeLabel::Seq,
                })
            }
            Interaction::Parallel { branches, loc } => {
                if branches.len() < 2 {
                    self.diagnostics.push(
                        Diagnostic::error(
                            DiagnosticKind::EmptyParallel,
                            "par needs at least two branches".to_string(),
                        )
                        .at(*loc),
                    );
                }
                let par_id = self.next_par_id;
                self.next_par_id += 1;
                let fork = self.cfg.add_node(CfgNode::Fork { par_id }, Some(*loc));
                self.cfg.add_edge(link.from, fork, link.label);
                let join = self.cfg.add_node(CfgNode::Join { par_id }, Some(*loc));
                self.cfg.pair_fork_join(fork, join);

                for (index, branch) in branches.iter().enumerate() {
                    let branch_link = Link {
                        from: fork,
                        label: EdgeLabel::Par {
                            index: index as u32,
                        },
                    };
                    self.scopes.push(Scope::ParBoundary);
                    let tail = self.lower_body(branch, branch_link);
                    self.scopes.pop();
                    if let Some(tail) = tail {
                        self.cfg.add_edge(tail.from, join, tail.label);
                    }
                }
                Some(Link {
                    from: join,
                    label: EdgeLabel::Seq,
                })
            }
            Interaction::Rec { label, body, loc } => {
                if self.rec_in_scope(label) {
                    self.diagnostics.push(
                        Diagnostic::error(
                            DiagnosticKind::DuplicateRecursionLabel,
                            format!("recursion label {label} is already bound in an enclosing rec"),
                        )
                        .at(*loc)
                        .entity(label),
                    );
                }
                let rec_node = self.cfg.add_node(
                    CfgNode::RecEntry {
                        label: label.clone(),
                    },
                    Some(*loc),
                );
                self.cfg.add_edge(link.from, rec_node, link.label);
                self.scopes.push(Scope::Rec {
                    label: label.clone(),
                    entry: rec_node,
                });
                let tail = self.lower_body(
                    body,
                    Link {
                        from: rec_node,
                        label: EdgeLabel::Seq,
                    },
                );
                self.scopes.pop();
                tail
            }
            Interaction::Continue { label, loc } => {
                let node = self.cfg.add_node(
                    CfgNode::Continue {
                        label: label.clone(),
                    },
                    Some(*loc),
                );
                self.cfg.add_edge(link.from, node, link.label);
                match self.resolve_rec(label) {
                    Some(rec_entry) => {
                        self.cfg.add_edge(node, rec_entry, EdgeLabel::Back);
                        self.cfg.pair_continue(node, rec_entry);
                    }
                    None => {
                        self.diagnostics.push(
                            Diagnostic::error(
                                DiagnosticKind::DanglingContinue,
                                format!("continue {label} has no enclosing rec {label}"),
                            )
                            .at(*loc)
                            .entity(label),
                        );
                    }
                }
                None
            }
            Interaction::Do {
                protocol,
                type_args,
                roles,
                loc,
            } => {
                for role in roles {
                    self.check_role(role, *loc);
                }
                let node = self.cfg.add_node(
                    CfgNode::SubInvoke {
                        protocol: protocol.clone(),
                        type_args: type_args.clone(),
                        role_args: roles.clone(),
                    },
                    Some(*loc),
                );
                self.cfg.add_edge(link.from, node, link.label);
                Some(Link {
                    from: node,
                    label: EdgeLabel::Seq,
                })
            }
            Interaction::Unsupported { construct, loc } => {
                self.diagnostics.push(
                    Diagnostic::error(
                        DiagnosticKind::UnsupportedConstruct,
                        format!("{construct} is recognized but cannot be lowered"),
                    )
                    .at(*loc)
                    .entity(construct),
                );
                Some(link)
            }
        }
    }

    fn rec_in_scope(&self, label: &str) -> bool {
        self.scopes
            .iter()
            .any(|s| matches!(s, Scope::Rec { label: l, .. } if l == label))
    }

    /// Lexically nearest enclosing rec with the label, not crossing a
    /// parallel boundary.
    fn resolve_rec(&self, label: &str) -> Option<NodeId> {
        for scope in self.scopes.iter().rev() {
            match scope {
                Scope::Rec { label: l, entry } if l == label => return Some(*entry),
                Scope::Rec { .. } => {}
                Scope::ParBoundary => return None,
            }
        }
        None
    }
}

/// The discriminating label of a branch: the label of the first message
/// transfer on its spine.
fn first_action_label(body: &[Interaction]) -> Option<String> {
    match body.first()? {
        Interaction::Message { message, .. } => Some(message.label.clone()),
        Interaction::Rec { body, .. } => first_action_label(body),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::parser::parse_source;

    fn build_first(source: &str) -> Result<Cfg, Vec<Diagnostic>> {
        let outcome = parse_source(source);
        assert!(outcome.is_clean(), "parse failed: {:?}", outcome.diagnostics);
        let decl = outcome.module.global_protocols().next().unwrap().clone();
        build_cfg(&decl)
    }

    #[test]
    fn test_ping_pong_has_two_action_nodes() {
        let cfg = build_first(
            "protocol PingPong(role A, role B) { A -> B: Ping(); B -> A: Pong(); }",
        )
        .unwrap();
        let actions = cfg
            .node_ids()
            .filter(|id| matches!(cfg.node(*id), CfgNode::Message { .. }))
            .count();
        assert_eq!(actions, 2);
        assert!(cfg.structural_violations().is_empty());
    }

    #[test]
    fn test_multicast_lowers_sequentially_in_declaration_order() {
        let cfg = build_first(
            "protocol P(role A, role B, role C) { A -> B, C: Notify(); }",
        )
        .unwrap();
        let receivers: Vec<String> = cfg
            .node_ids()
            .filter_map(|id| match cfg.node(id) {
                CfgNode::Message { to, .. } => Some(to.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(receivers, vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn test_choice_pairs_branch_with_merge() {
        let cfg = build_first(
            r#"
protocol P(role A, role B) {
    choice at A {
        A -> B: Left();
    } or {
        A -> B: Right();
    }
}
            "#,
        )
        .unwrap();
        let branch = cfg
            .node_ids()
            .find(|id| matches!(cfg.node(*id), CfgNode::Branch { .. }))
            .unwrap();
        let merge = cfg.merge_of(branch).unwrap();
        assert!(matches!(cfg.node(merge), CfgNode::Merge));
        let labels: Vec<String> = cfg
            .successors(branch)
            .iter()
            .filter_map(|(_, e)| match e {
                EdgeLabel::Branch { label } => Some(label.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(labels, vec!["Left".to_string(), "Right".to_string()]);
        assert!(cfg.structural_violations().is_empty());
    }

    #[test]
    fn test_parallel_pairs_fork_with_join() {
        let cfg = build_first(
            r#"
protocol P(role A, role B, role C) {
    par {
        A -> B: M1();
    } and {
        A -> C: M2();
    }
}
            "#,
        )
        .unwrap();
        let fork = cfg
            .node_ids()
            .find(|id| matches!(cfg.node(*id), CfgNode::Fork { .. }))
            .unwrap();
        let join = cfg.join_of(fork).unwrap();
        assert!(matches!(cfg.node(join), CfgNode::Join { par_id: 0 }));
        assert!(cfg.structural_violations().is_empty());
    }

    #[test]
    fn test_continue_gets_back_edge_to_enclosing_rec() {
        let cfg = build_first(
            "protocol P(role A, role B) { rec L { A -> B: M(); continue L; } }",
        )
        .unwrap();
        let continue_node = cfg
            .node_ids()
            .find(|id| matches!(cfg.node(*id), CfgNode::Continue { .. }))
            .unwrap();
        let rec = cfg.recursion_entry_of(continue_node).unwrap();
        assert!(matches!(cfg.node(rec), CfgNode::RecEntry { label } if label == "L"));
        assert!(cfg.structural_violations().is_empty());
    }

    #[test]
    fn test_dangling_continue_is_rejected() {
        let result = build_first("protocol P(role A, role B) { rec L { continue M; } }");
        let diagnostics = result.unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::DanglingContinue));
        let diag = diagnostics
            .iter()
            .find(|d| d.kind == DiagnosticKind::DanglingContinue)
            .unwrap();
        assert!(diag.location.is_some());
        assert_eq!(diag.offending_entity.as_deref(), Some("M"));
    }

    #[test]
    fn test_undeclared_role_is_rejected() {
        let result = build_first("protocol P(role A, role B) { A -> C: M(); }");
        let diagnostics = result.unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::UndeclaredRole
                && d.offending_entity.as_deref() == Some("C")));
    }

    #[test]
    fn test_duplicate_role_is_rejected() {
        let result = build_first("protocol P(role A, role A) { A -> A: M(); }");
        let diagnostics = result.unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::DuplicateRole));
    }

    #[test]
    fn test_rebound_recursion_label_is_rejected() {
        let result = build_first(
            "protocol P(role A, role B) { rec L { rec L { A -> B: M(); } } }",
        );
        let diagnostics = result.unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::DuplicateRecursionLabel));
    }

    #[test]
    fn test_continue_may_not_escape_parallel_branch() {
        let result = build_first(
            r#"
protocol P(role A, role B) {
    rec L {
        par {
            continue L;
        } and {
            A -> B: M();
        }
    }
}
            "#,
        );
        let diagnostics = result.unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::DanglingContinue));
    }

    #[test]
    fn test_unsupported_construct_is_reported_not_dropped() {
        let result = build_first("protocol P(role A, role B) { A calls Sub(A, B); }");
        let diagnostics = result.unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::UnsupportedConstruct));
    }

    #[test]
    fn test_sub_invoke_is_not_inlined() {
        let cfg = build_first("protocol P(role A, role B) { do Child(A, B); }").unwrap();
        let sub = cfg
            .node_ids()
            .find(|id| matches!(cfg.node(*id), CfgNode::SubInvoke { .. }))
            .unwrap();
        match cfg.node(sub) {
            CfgNode::SubInvoke {
                protocol,
                role_args,
                ..
            } => {
                assert_eq!(protocol, "Child");
                assert_eq!(role_args.len(), 2);
            }
            _ => unreachable!(),
        }
    }
}

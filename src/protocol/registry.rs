use crate::analyzer::cfg::{Cfg, build_cfg};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics, SourceLoc};
use crate::protocol::ast::{Module, ProtocolDecl, Role};
use std::collections::{BTreeMap, HashMap};

/// A registered global protocol: its declaration and its built CFG.
#[derive(Debug, Clone)]
pub struct ProtocolEntry {
    pub decl: ProtocolDecl,
    pub cfg: Cfg,
}

/// Owns every global protocol of a module and hands out read-only access
/// to their CFGs. Read-only after construction; `do P(...)` resolution in
/// the projector and the simulators goes through here.
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<String, ProtocolEntry>,
    order: Vec<String>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, decl: ProtocolDecl, cfg: Cfg) {
        if !self.protocols.contains_key(&decl.name) {
            self.order.push(decl.name.clone());
        }
        self.protocols.insert(decl.name.clone(), ProtocolEntry { decl, cfg });
    }

    /// Build a registry from a parsed module. Declarations whose CFG fails
    /// to build are skipped and their diagnostics reported; the rest stay
    /// usable.
    pub fn from_module(module: &Module) -> (Self, Diagnostics) {
        let mut registry = Self::new();
        let mut diagnostics = Diagnostics::new();
        for decl in module.global_protocols() {
            if registry.has_protocol(&decl.name) {
                diagnostics.push(
                    Diagnostic::error(
                        DiagnosticKind::ParseError,
                        format!("protocol {} is declared twice", decl.name),
                    )
                    .at(decl.loc)
                    .entity(decl.name.clone()),
                );
                continue;
            }
            match build_cfg(decl) {
                Ok(cfg) => registry.register(decl.clone(), cfg),
                Err(errors) => {
                    for error in errors {
                        diagnostics.push(error);
                    }
                }
            }
        }
        (registry, diagnostics)
    }

    pub fn get(&self, name: &str) -> Option<&ProtocolEntry> {
        self.protocols.get(name)
    }

    pub fn has_protocol(&self, name: &str) -> bool {
        self.protocols.contains_key(name)
    }

    /// Registration order, which follows declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// The formal-to-actual role substitution for invoking `name` with
    /// `args`. Fails with `UnresolvedSubProtocol` or `RoleArityMismatch`.
    pub fn substitution(
        &self,
        name: &str,
        args: &[Role],
        loc: Option<SourceLoc>,
    ) -> Result<BTreeMap<Role, Role>, Diagnostic> {
        let entry = self.get(name).ok_or_else(|| {
            Diagnostic::error(
                DiagnosticKind::UnresolvedSubProtocol,
                format!("protocol {name} is not defined"),
            )
            .at_opt(loc)
            .entity(name)
        })?;
        if entry.decl.roles.len() != args.len() {
            return Err(Diagnostic::error(
                DiagnosticKind::RoleArityMismatch,
                format!(
                    "protocol {name} takes {} roles but {} were supplied",
                    entry.decl.roles.len(),
                    args.len()
                ),
            )
            .at_opt(loc)
            .entity(name));
        }
        Ok(entry
            .decl
            .roles
            .iter()
            .cloned()
            .zip(args.iter().cloned())
            .collect())
    }
}

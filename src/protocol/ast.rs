use crate::diagnostics::SourceLoc;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult, Write as _};

/// A named protocol endpoint. Roles are immutable within a declaration and
/// compare by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(pub String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Payload sort: an identifier with optional type arguments, arbitrarily
/// nested (`Map<String, List<Int>>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeExpr {
    pub name: String,
    pub args: Vec<TypeExpr>,
}

impl TypeExpr {
    pub fn atomic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }
}

impl Display for TypeExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.name)?;
        if !self.args.is_empty() {
            f.write_char('<')?;
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{arg}")?;
            }
            f.write_char('>')?;
        }
        Ok(())
    }
}

/// A message signature: label plus optional payload. Branch discrimination
/// is by label only, so equality and hashing ignore the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub label: String,
    pub payload: Option<TypeExpr>,
}

impl Message {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            payload: None,
        }
    }

    pub fn with_payload(label: impl Into<String>, payload: TypeExpr) -> Self {
        Self {
            label: label.into(),
            payload: Some(payload),
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
    }
}

impl Eq for Message {}

impl std::hash::Hash for Message {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.label.hash(state);
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.payload {
            Some(payload) => write!(f, "{}({payload})", self.label),
            None => write!(f, "{}()", self.label),
        }
    }
}

/// One protocol statement. Construction order is preserved; the AST is
/// immutable after the parser hands it out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Interaction {
    /// `p -> q1, q2: M();` or `M() from p to q1, q2;`
    Message {
        from: Role,
        to: Vec<Role>,
        message: Message,
        loc: SourceLoc,
    },
    Choice {
        at: Role,
        branches: Vec<Vec<Interaction>>,
        loc: SourceLoc,
    },
    Parallel {
        branches: Vec<Vec<Interaction>>,
        loc: SourceLoc,
    },
    Rec {
        label: String,
        body: Vec<Interaction>,
        loc: SourceLoc,
    },
    Continue {
        label: String,
        loc: SourceLoc,
    },
    Do {
        protocol: String,
        type_args: Vec<TypeExpr>,
        roles: Vec<Role>,
        loc: SourceLoc,
    },
    /// A recognized dynamic-MPST form. Downstream passes must report it
    /// instead of silently dropping it.
    Unsupported {
        construct: String,
        loc: SourceLoc,
    },
}

impl Interaction {
    pub fn loc(&self) -> SourceLoc {
        match self {
            Interaction::Message { loc, .. }
            | Interaction::Choice { loc, .. }
            | Interaction::Parallel { loc, .. }
            | Interaction::Rec { loc, .. }
            | Interaction::Continue { loc, .. }
            | Interaction::Do { loc, .. }
            | Interaction::Unsupported { loc, .. } => *loc,
        }
    }

    pub fn mentions_role(&self, role: &Role) -> bool {
        match self {
            Interaction::Message { from, to, .. } => from == role || to.contains(role),
            Interaction::Choice { at, branches, .. } => {
                at == role
                    || branches
                        .iter()
                        .any(|b| b.iter().any(|i| i.mentions_role(role)))
            }
            Interaction::Parallel { branches, .. } => branches
                .iter()
                .any(|b| b.iter().any(|i| i.mentions_role(role))),
            Interaction::Rec { body, .. } => body.iter().any(|i| i.mentions_role(role)),
            Interaction::Do { roles, .. } => roles.contains(role),
            Interaction::Continue { .. } | Interaction::Unsupported { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Global,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolDecl {
    pub kind: ProtocolKind,
    pub name: String,
    /// Projection target of a local declaration; `None` for global ones.
    pub at: Option<Role>,
    pub type_params: Vec<String>,
    pub roles: Vec<Role>,
    pub body: Vec<Interaction>,
    pub loc: SourceLoc,
}

impl ProtocolDecl {
    pub fn is_global(&self) -> bool {
        self.kind == ProtocolKind::Global
    }

    pub fn declares_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportDecl {
    pub module: String,
    pub alias: Option<String>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    pub definition: Option<TypeExpr>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Declaration {
    Import(ImportDecl),
    Type(TypeDecl),
    Protocol(ProtocolDecl),
}

/// An ordered sequence of declarations, as parsed from one source text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    pub declarations: Vec<Declaration>,
}

impl Module {
    pub fn protocols(&self) -> impl Iterator<Item = &ProtocolDecl> {
        self.declarations.iter().filter_map(|d| match d {
            Declaration::Protocol(p) => Some(p),
            _ => None,
        })
    }

    pub fn global_protocols(&self) -> impl Iterator<Item = &ProtocolDecl> {
        self.protocols().filter(|p| p.is_global())
    }

    pub fn find_protocol(&self, name: &str) -> Option<&ProtocolDecl> {
        self.protocols().find(|p| p.name == name)
    }
}

// Canonical pretty-printer. Re-parsing the printed form yields an
// isomorphic module; transfers always print in arrow form.

fn pad(f: &mut Formatter<'_>, indent: usize) -> FmtResult {
    for _ in 0..indent {
        f.write_str("    ")?;
    }
    Ok(())
}

fn write_body(f: &mut Formatter<'_>, body: &[Interaction], indent: usize) -> FmtResult {
    for interaction in body {
        write_interaction(f, interaction, indent)?;
    }
    Ok(())
}

fn write_interaction(f: &mut Formatter<'_>, interaction: &Interaction, indent: usize) -> FmtResult {
    pad(f, indent)?;
    match interaction {
        Interaction::Message {
            from, to, message, ..
        } => {
            let receivers: Vec<&str> = to.iter().map(Role::as_str).collect();
            writeln!(f, "{from} -> {}: {message};", receivers.join(", "))
        }
        Interaction::Choice { at, branches, .. } => {
            writeln!(f, "choice at {at} {{")?;
            for (i, branch) in branches.iter().enumerate() {
                if i > 0 {
                    pad(f, indent)?;
                    writeln!(f, "}} or {{")?;
                }
                write_body(f, branch, indent + 1)?;
            }
            pad(f, indent)?;
            writeln!(f, "}}")
        }
        Interaction::Parallel { branches, .. } => {
            writeln!(f, "par {{")?;
            for (i, branch) in branches.iter().enumerate() {
                if i > 0 {
                    pad(f, indent)?;
                    writeln!(f, "}} and {{")?;
                }
                write_body(f, branch, indent + 1)?;
            }
            pad(f, indent)?;
            writeln!(f, "}}")
        }
        Interaction::Rec { label, body, .. } => {
            writeln!(f, "rec {label} {{")?;
            write_body(f, body, indent + 1)?;
            pad(f, indent)?;
            writeln!(f, "}}")
        }
        Interaction::Continue { label, .. } => writeln!(f, "continue {label};"),
        Interaction::Do {
            protocol,
            type_args,
            roles,
            ..
        } => {
            f.write_str("do ")?;
            f.write_str(protocol)?;
            if !type_args.is_empty() {
                let args: Vec<String> = type_args.iter().map(|t| t.to_string()).collect();
                write!(f, "<{}>", args.join(", "))?;
            }
            let names: Vec<&str> = roles.iter().map(Role::as_str).collect();
            writeln!(f, "({});", names.join(", "))
        }
        Interaction::Unsupported { construct, .. } => {
            writeln!(f, "// unsupported: {construct}")
        }
    }
}

impl Display for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        for (i, declaration) in self.declarations.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match declaration {
                Declaration::Import(import) => match &import.alias {
                    Some(alias) => writeln!(f, "import {} as {alias};", import.module)?,
                    None => writeln!(f, "import {};", import.module)?,
                },
                Declaration::Type(ty) => match &ty.definition {
                    Some(def) => writeln!(f, "type {} = {def};", ty.name)?,
                    None => writeln!(f, "type {};", ty.name)?,
                },
                Declaration::Protocol(protocol) => {
                    match protocol.kind {
                        ProtocolKind::Global => write!(f, "global protocol {}", protocol.name)?,
                        ProtocolKind::Local => write!(f, "local protocol {}", protocol.name)?,
                    }
                    if !protocol.type_params.is_empty() {
                        write!(f, "<{}>", protocol.type_params.join(", "))?;
                    }
                    if let Some(at) = &protocol.at {
                        write!(f, " at {at}")?;
                    }
                    let roles: Vec<String> =
                        protocol.roles.iter().map(|r| format!("role {r}")).collect();
                    writeln!(f, "({}) {{", roles.join(", "))?;
                    write_body(f, &protocol.body, 1)?;
                    writeln!(f, "}}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_equality_ignores_payload() {
        let bare = Message::new("Ping");
        let typed = Message::with_payload("Ping", TypeExpr::atomic("Int"));
        assert_eq!(bare, typed);
        assert_ne!(bare, Message::new("Pong"));
    }

    #[test]
    fn test_type_expr_display_nests() {
        let ty = TypeExpr {
            name: "Map".to_string(),
            args: vec![
                TypeExpr::atomic("String"),
                TypeExpr {
                    name: "List".to_string(),
                    args: vec![TypeExpr::atomic("Int")],
                },
            ],
        };
        assert_eq!(ty.to_string(), "Map<String, List<Int>>");
    }

    #[test]
    fn test_mentions_role_sees_through_nesting() {
        let loc = SourceLoc::default();
        let inner = Interaction::Message {
            from: Role::new("A"),
            to: vec![Role::new("B")],
            message: Message::new("M"),
            loc,
        };
        let rec = Interaction::Rec {
            label: "L".to_string(),
            body: vec![inner],
            loc,
        };
        assert!(rec.mentions_role(&Role::new("A")));
        assert!(rec.mentions_role(&Role::new("B")));
        assert!(!rec.mentions_role(&Role::new("C")));
    }

    #[test]
    fn test_pretty_printer_emits_arrow_form() {
        let loc = SourceLoc::default();
        let module = Module {
            declarations: vec![Declaration::Protocol(ProtocolDecl {
                kind: ProtocolKind::Global,
                name: "PingPong".to_string(),
                at: None,
                type_params: Vec::new(),
                roles: vec![Role::new("A"), Role::new("B")],
                body: vec![
                    Interaction::Message {
                        from: Role::new("A"),
                        to: vec![Role::new("B")],
                        message: Message::new("Ping"),
                        loc,
                    },
                    Interaction::Message {
                        from: Role::new("B"),
                        to: vec![Role::new("A")],
                        message: Message::new("Pong"),
                        loc,
                    },
                ],
                loc,
            })],
        };
        let printed = module.to_string();
        assert!(printed.contains("global protocol PingPong(role A, role B) {"));
        assert!(printed.contains("    A -> B: Ping();"));
        assert!(printed.contains("    B -> A: Pong();"));
    }
}

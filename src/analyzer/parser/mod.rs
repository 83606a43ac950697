use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics, SourceLoc};
use crate::protocol::ast::{
    Declaration, ImportDecl, Interaction, Message, Module, ProtocolDecl, ProtocolKind, Role,
    TypeDecl, TypeExpr,
};
use once_cell::sync::Lazy;
use pest::Parser;
use pest::error::{InputLocation, LineColLocation};
use pest::iterators::Pair;
use pest_derive::Parser;
use std::collections::HashSet;


#[derive(Parser)]
#[grammar = "grammars/v1/scribble.pest"]
pub struct ScribbleParser;

/// Words the language reserves; identifiers may not collide with them.
/// Mirrors the `Keyword` rule in the grammar and backs the parser's
/// diagnostics when a reserved word is used as an identifier.
static RESERVED_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "protocol", "global", "local", "role", "choice", "at", "or", "par",
        "and", "rec", "continue", "do", "from", "to", "import", "type",
        "as", "new", "calls", "creates", "invites", "within", "with",
        "try", "catch", "throw", "timeout", "extends",
    ]
    .into_iter()
    .collect()
});

pub fn is_reserved(word: &str) -> bool {
    RESERVED_KEYWORDS.contains(word)
}

/// Result of parsing one source text: every declaration that parsed, plus
/// one diagnostic per declaration that did not. Callers must consult
/// `diagnostics` before trusting `module` to be complete.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub module: Module,
    pub diagnostics: Diagnostics,
}

impl ParseOutcome {
    pub fn is_clean(&self) -> bool {
        !self.diagnostics.has_errors()
    }
}

/// Parse a whole module. On a syntax error the parser resynchronizes at the
/// next top-level declaration and keeps going, so a single bad declaration
/// does not hide the rest of the file.
pub fn parse_source(source: &str) -> ParseOutcome {
    match ScribbleParser::parse(Rule::Module, source) {
        Ok(mut pairs) => {
            let module_pair = pairs.next().expect("pest yields the matched Module");
            let mut diagnostics = Diagnostics::new();
            let module = lower_module(module_pair, &mut diagnostics);
            ParseOutcome {
                module,
                diagnostics,
            }
        }
        Err(_) => parse_with_recovery(source),
    }
}

fn parse_with_recovery(source: &str) -> ParseOutcome {
    let mut module = Module::default();
    let mut diagnostics = Diagnostics::new();

    for chunk in split_declarations(source) {
        match ScribbleParser::parse(Rule::Declaration, chunk.text) {
            Ok(mut pairs) => {
                let declaration_pair = pairs.next().expect("pest yields the matched Declaration");
                let base = chunk.base(source);
                if let Some(declaration) = lower_declaration(declaration_pair, &mut diagnostics, base)
                {
                    module.declarations.push(declaration);
                }
            }
            Err(error) => diagnostics.push(pest_error_to_diagnostic(&error, source, &chunk)),
        }
    }
    if module.declarations.is_empty() && diagnostics.is_empty() {
        // Nothing recognizable at all; report the original failure site.
        if let Err(error) = ScribbleParser::parse(Rule::Module, source) {
            let chunk = Chunk {
                start: 0,
                text: source,
            };
            diagnostics.push(pest_error_to_diagnostic(&error, source, &chunk));
        }
    }
    ParseOutcome {
        module,
        diagnostics,
    }
}

struct Chunk<'a> {
    start: usize,
    text: &'a str,
}

/// Coordinate base of a chunk inside the whole source, used to map
/// chunk-relative positions back to file positions.
#[derive(Debug, Clone, Copy, Default)]
struct ChunkBase {
    offset: usize,
    /// Newlines before the chunk start.
    lines_before: usize,
    /// Characters before the chunk start on its own line.
    column_before: usize,
}

impl Chunk<'_> {
    fn base(&self, source: &str) -> ChunkBase {
        let prefix = &source[..self.start];
        ChunkBase {
            offset: self.start,
            lines_before: prefix.matches('\n').count(),
            column_before: prefix.len() - prefix.rfind('\n').map(|p| p + 1).unwrap_or(0),
        }
    }
}

/// Split the source at top-level declaration keywords, tracking brace depth
/// and skipping comments, so each declaration can be re-parsed on its own.
fn split_declarations(source: &str) -> Vec<Chunk<'_>> {
    let bytes = source.as_bytes();
    let mut starts: Vec<usize> = Vec::new();
    let mut depth: i32 = 0;
    let mut i = 0;
    let mut previous_word: Option<&str> = None;

    while i < bytes.len() {
        let c = bytes[i];
        if c == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        match c {
            b'{' => {
                depth += 1;
                i += 1;
            }
            b'}' => {
                depth -= 1;
                i += 1;
            }
            _ if c.is_ascii_alphabetic() => {
                let word_start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = &source[word_start..i];
                if depth == 0 {
                    let starts_declaration = match word {
                        "import" | "type" | "global" | "local" => true,
                        "protocol" => !matches!(previous_word, Some("global") | Some("local")),
                        _ => false,
                    };
                    if starts_declaration {
                        starts.push(word_start);
                    }
                    previous_word = Some(word);
                }
            }
            _ => i += 1,
        }
    }

    if starts.is_empty() {
        if source.trim().is_empty() {
            return Vec::new();
        }
        return vec![Chunk {
            start: 0,
            text: source,
        }];
    }
    let mut chunks = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(source.len());
        chunks.push(Chunk {
            start,
            text: &source[start..end],
        });
    }
    chunks
}

fn pest_error_to_diagnostic(
    error: &pest::error::Error<Rule>,
    source: &str,
    chunk: &Chunk<'_>,
) -> Diagnostic {
    let (rel_line, rel_column) = match error.line_col {
        LineColLocation::Pos((line, column)) | LineColLocation::Span((line, column), _) => {
            (line, column)
        }
    };
    let rel_offset = match error.location {
        InputLocation::Pos(offset) | InputLocation::Span((offset, _)) => offset,
    };
    let offset = chunk.start + rel_offset;
    let prefix = &source[..chunk.start];
    let lines_before = prefix.matches('\n').count();
    let line = lines_before + rel_line;
    let column = if rel_line == 1 {
        let column_base = prefix.len() - prefix.rfind('\n').map(|p| p + 1).unwrap_or(0);
        column_base + rel_column
    } else {
        rel_column
    };

    let kind = match source.as_bytes().get(offset) {
        Some(byte) if !byte.is_ascii_graphic() && !byte.is_ascii_whitespace() => {
            DiagnosticKind::LexError
        }
        _ => DiagnosticKind::ParseError,
    };
    if let Some(word) = word_at(source, offset) {
        if is_reserved(word) {
            return Diagnostic::error(
                kind,
                format!("syntax error: {word} is a reserved keyword and cannot be used as an identifier"),
            )
            .at(SourceLoc::new(line, column, offset).with_length(word.len()))
            .entity(word);
        }
    }
    let detail = match &error.variant {
        pest::error::ErrorVariant::ParsingError { positives, .. } if !positives.is_empty() => {
            format!("expected one of {positives:?}")
        }
        other => other.message().to_string(),
    };
    Diagnostic::error(kind, format!("syntax error: {detail}"))
        .at(SourceLoc::new(line, column, offset).with_length(1))
}

/// The identifier-shaped word starting at `offset`, if any.
fn word_at(source: &str, offset: usize) -> Option<&str> {
    let bytes = source.as_bytes();
    if !bytes.get(offset)?.is_ascii_alphabetic() {
        return None;
    }
    let mut end = offset;
    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
        end += 1;
    }
    Some(&source[offset..end])
}

fn loc_of(pair: &Pair<Rule>) -> SourceLoc {
    let span = pair.as_span();
    let (line, column) = span.start_pos().line_col();
    SourceLoc::new(line, column, span.start()).with_length(span.end() - span.start())
}

/// Shift a location produced while parsing an isolated chunk back into
/// whole-source coordinates.
fn shift(loc: SourceLoc, base: ChunkBase) -> SourceLoc {
    SourceLoc {
        line: base.lines_before + loc.line,
        column: if loc.line == 1 {
            base.column_before + loc.column
        } else {
            loc.column
        },
        offset: loc.offset + base.offset,
        length: loc.length,
    }
}

fn lower_module(pair: Pair<Rule>, diagnostics: &mut Diagnostics) -> Module {
    let mut module = Module::default();
    for child in pair.into_inner() {
        match child.as_rule() {
            Rule::Declaration => {
                if let Some(declaration) =
                    lower_declaration(child, diagnostics, ChunkBase::default())
                {
                    module.declarations.push(declaration);
                }
            }
            Rule::EOI => {}
            _ => {}
        }
    }
    module
}

fn lower_declaration(
    pair: Pair<Rule>,
    diagnostics: &mut Diagnostics,
    base: ChunkBase,
) -> Option<Declaration> {
    let inner = pair.into_inner().next()?;
    let mut ctx = LowerCtx { diagnostics, base };
    match inner.as_rule() {
        Rule::ImportDecl => Some(Declaration::Import(ctx.lower_import(inner))),
        Rule::TypeDecl => Some(Declaration::Type(ctx.lower_type_decl(inner))),
        Rule::GlobalProtocolDecl => Some(Declaration::Protocol(
            ctx.lower_protocol(inner, ProtocolKind::Global),
        )),
        Rule::LocalProtocolDecl => Some(Declaration::Protocol(
            ctx.lower_protocol(inner, ProtocolKind::Local),
        )),
        _ => None,
    }
}

struct LowerCtx<'d> {
    diagnostics: &'d mut Diagnostics,
    base: ChunkBase,
}

impl LowerCtx<'_> {
    fn loc(&self, pair: &Pair<Rule>) -> SourceLoc {
        shift(loc_of(pair), self.base)
    }

    fn lower_import(&mut self, pair: Pair<Rule>) -> ImportDecl {
        let loc = self.loc(&pair);
        let mut inner = pair.into_inner();
        let module = inner.next().map(|p| p.as_str().to_string()).unwrap_or_default();
        let alias = inner.next().map(|p| p.as_str().to_string());
        ImportDecl { module, alias, loc }
    }

    fn lower_type_decl(&mut self, pair: Pair<Rule>) -> TypeDecl {
        let loc = self.loc(&pair);
        let mut inner = pair.into_inner();
        let name = inner.next().map(|p| p.as_str().to_string()).unwrap_or_default();
        let definition = inner.next().map(|p| self.lower_type_expr(p));
        TypeDecl {
            name,
            definition,
            loc,
        }
    }

    fn lower_protocol(&mut self, pair: Pair<Rule>, kind: ProtocolKind) -> ProtocolDecl {
        let loc = self.loc(&pair);
        let mut name = String::new();
        let mut at = None;
        let mut type_params = Vec::new();
        let mut roles = Vec::new();
        let mut body = Vec::new();
        let mut saw_name = false;

        for child in pair.into_inner() {
            match child.as_rule() {
                Rule::Identifier => {
                    if !saw_name {
                        name = child.as_str().to_string();
                        saw_name = true;
                    } else {
                        // Only a local declaration has a second bare
                        // identifier: the `at` role.
                        at = Some(Role::new(child.as_str()));
                    }
                }
                Rule::TypeParams => {
                    type_params = child
                        .into_inner()
                        .map(|p| p.as_str().to_string())
                        .collect();
                }
                Rule::RoleList => {
                    for role_decl in child.into_inner() {
                        if role_decl.as_rule() == Rule::RoleDecl {
                            let ident = role_decl
                                .into_inner()
                                .next()
                                .expect("RoleDecl contains its identifier");
                            roles.push(Role::new(ident.as_str()));
                        }
                    }
                }
                Rule::Block => body = self.lower_block(child),
                _ => {}
            }
        }

        ProtocolDecl {
            kind,
            name,
            at,
            type_params,
            roles,
            body,
            loc,
        }
    }

    fn lower_block(&mut self, pair: Pair<Rule>) -> Vec<Interaction> {
        pair.into_inner()
            .filter(|p| p.as_rule() == Rule::Interaction)
            .filter_map(|p| self.lower_interaction(p))
            .collect()
    }

    fn lower_interaction(&mut self, pair: Pair<Rule>) -> Option<Interaction> {
        let inner = pair.into_inner().next()?;
        let loc = self.loc(&inner);
        match inner.as_rule() {
            Rule::ArrowTransfer => {
                let mut parts = inner.into_inner();
                let from = Role::new(parts.next()?.as_str());
                let to = self.lower_receiver_list(parts.next()?);
                let message = self.lower_message_sig(parts.next()?);
                Some(Interaction::Message {
                    from,
                    to,
                    message,
                    loc,
                })
            }
            Rule::StandardTransfer => {
                let mut parts = inner.into_inner();
                let message = self.lower_message_sig(parts.next()?);
                let from = Role::new(parts.next()?.as_str());
                let to = self.lower_receiver_list(parts.next()?);
                Some(Interaction::Message {
                    from,
                    to,
                    message,
                    loc,
                })
            }
            Rule::ChoiceStmt => {
                let mut parts = inner.into_inner();
                let at = Role::new(parts.next()?.as_str());
                let mut branches = vec![self.lower_block(parts.next()?)];
                for or_branch in parts {
                    if or_branch.as_rule() == Rule::OrBranch {
                        let block = or_branch
                            .into_inner()
                            .next()
                            .expect("OrBranch contains its block");
                        branches.push(self.lower_block(block));
                    }
                }
                if branches.len() < 2 {
                    self.diagnostics.push(
                        Diagnostic::error(
                            DiagnosticKind::EmptyChoice,
                            format!("choice at {at} has {} branch; at least two are required", branches.len()),
                        )
                        .at(loc)
                        .entity(at.as_str()),
                    );
                }
                Some(Interaction::Choice { at, branches, loc })
            }
            Rule::ParallelStmt => {
                let mut parts = inner.into_inner();
                let mut branches = vec![self.lower_block(parts.next()?)];
                for and_branch in parts {
                    if and_branch.as_rule() == Rule::AndBranch {
                        let block = and_branch
                            .into_inner()
                            .next()
                            .expect("AndBranch contains its block");
                        branches.push(self.lower_block(block));
                    }
                }
                if branches.len() < 2 {
                    self.diagnostics.push(
                        Diagnostic::error(
                            DiagnosticKind::EmptyParallel,
                            format!("par has {} branch; at least two are required", branches.len()),
                        )
                        .at(loc),
                    );
                }
                Some(Interaction::Parallel { branches, loc })
            }
            Rule::RecStmt => {
                let mut parts = inner.into_inner();
                let label = parts.next()?.as_str().to_string();
                let body = self.lower_block(parts.next()?);
                Some(Interaction::Rec { label, body, loc })
            }
            Rule::ContinueStmt => {
                let mut parts = inner.into_inner();
                let label = parts.next()?.as_str().to_string();
                if parts.next().is_some() {
                    // `continue L with X;` is the updatable-recursion form.
                    return Some(Interaction::Unsupported {
                        construct: "updatable recursion (continue-with)".to_string(),
                        loc,
                    });
                }
                Some(Interaction::Continue { label, loc })
            }
            Rule::DoStmt => {
                let mut protocol = String::new();
                let mut type_args = Vec::new();
                let mut roles = Vec::new();
                for part in inner.into_inner() {
                    match part.as_rule() {
                        Rule::Identifier => protocol = part.as_str().to_string(),
                        Rule::TypeArgs => {
                            type_args = part
                                .into_inner()
                                .map(|t| self.lower_type_expr(t))
                                .collect();
                        }
                        Rule::RoleArgs => {
                            roles = part
                                .into_inner()
                                .map(|r| Role::new(r.as_str()))
                                .collect();
                        }
                        _ => {}
                    }
                }
                Some(Interaction::Do {
                    protocol,
                    type_args,
                    roles,
                    loc,
                })
            }
            Rule::DynRoleStmt => Some(Interaction::Unsupported {
                construct: "dynamic role declaration".to_string(),
                loc,
            }),
            Rule::CallsStmt => Some(Interaction::Unsupported {
                construct: "protocol call".to_string(),
                loc,
            }),
            Rule::CreatesStmt => Some(Interaction::Unsupported {
                construct: "participant creation".to_string(),
                loc,
            }),
            Rule::InvitesStmt => Some(Interaction::Unsupported {
                construct: "invitation".to_string(),
                loc,
            }),
            _ => None,
        }
    }

    fn lower_receiver_list(&mut self, pair: Pair<Rule>) -> Vec<Role> {
        pair.into_inner()
            .filter(|p| p.as_rule() == Rule::Identifier)
            .map(|p| Role::new(p.as_str()))
            .collect()
    }

    fn lower_message_sig(&mut self, pair: Pair<Rule>) -> Message {
        let mut inner = pair.into_inner();
        let label = inner
            .next()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default();
        let payload = inner.next().map(|p| self.lower_type_expr(p));
        Message { label, payload }
    }

    fn lower_type_expr(&mut self, pair: Pair<Rule>) -> TypeExpr {
        let mut inner = pair.into_inner();
        let name = inner
            .next()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default();
        let args = inner
            .next()
            .map(|type_args| {
                type_args
                    .into_inner()
                    .map(|t| self.lower_type_expr(t))
                    .collect()
            })
            .unwrap_or_default();
        TypeExpr { name, args }
    }
}

//! The analysis pipeline: parser → CFG → well-formedness → projection →
//! safety → simulation. Each pass is a pure function from inputs to a
//! result value carrying structured diagnostics; nothing here blocks,
//! panics across boundaries or keeps process-wide state.

pub mod cfg;
pub mod cfsm;
pub mod parser;
pub mod projection;
pub mod safety;
pub mod simulator;
pub mod wellformed;

use crate::config::AnalyzerConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::protocol::ast::Role;
use crate::protocol::registry::ProtocolRegistry;
use std::collections::BTreeMap;

pub use cfg::{Cfg, build_cfg};
pub use cfsm::Cfsm;
pub use parser::{ParseOutcome, parse_source};
pub use projection::{project_all, project_role};
pub use safety::{CfsmSystem, SafetyVerdict, check_safety};
pub use simulator::{AsyncReport, GlobalReport, simulate_async, simulate_global};
pub use wellformed::{WellFormedness, verify};

/// Everything the pipeline can derive from one source text and one chosen
/// protocol, short-circuiting per stage on error-severity diagnostics.
#[derive(Debug)]
pub struct Analysis {
    pub registry: ProtocolRegistry,
    pub protocol: String,
    pub wellformed: WellFormedness,
    pub machines: BTreeMap<Role, Cfsm>,
    pub diagnostics: Diagnostics,
}

/// Run parse → registry → verify → project for `protocol` (or the first
/// global protocol when `None`). Returns `Err` with everything collected
/// when any stage reports an error.
pub fn analyze(
    source: &str,
    protocol: Option<&str>,
    config: &AnalyzerConfig,
) -> Result<Analysis, Diagnostics> {
    let outcome = parse_source(source);
    let mut diagnostics = outcome.diagnostics;
    if diagnostics.has_errors() {
        return Err(diagnostics);
    }

    let (registry, registry_diagnostics) = ProtocolRegistry::from_module(&outcome.module);
    diagnostics.extend(registry_diagnostics);
    if diagnostics.has_errors() {
        return Err(diagnostics);
    }

    let name = match protocol {
        Some(name) => name.to_string(),
        None => match registry.names().next() {
            Some(first) => first.to_string(),
            None => {
                diagnostics.push(Diagnostic::error(
                    DiagnosticKind::ParseError,
                    "source contains no global protocol declaration",
                ));
                return Err(diagnostics);
            }
        },
    };
    let Some(entry) = registry.get(&name) else {
        diagnostics.push(
            Diagnostic::error(
                DiagnosticKind::UnresolvedSubProtocol,
                format!("protocol {name} is not defined in this module"),
            )
            .entity(name),
        );
        return Err(diagnostics);
    };

    let wellformed = verify(&entry.cfg);
    for warning in &wellformed.warnings {
        diagnostics.push(warning.clone());
    }
    if !wellformed.errors.is_empty() {
        for error in &wellformed.errors {
            diagnostics.push(error.clone());
        }
        return Err(diagnostics);
    }

    let machines = match project_all(&entry.cfg, &registry, config) {
        Ok(machines) => machines,
        Err(errors) => {
            for error in errors {
                diagnostics.push(error);
            }
            return Err(diagnostics);
        }
    };

    Ok(Analysis {
        protocol: name,
        wellformed,
        machines,
        registry,
        diagnostics,
    })
}

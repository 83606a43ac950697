use crate::analyzer::{analyze, check_safety, simulate_async, simulate_global};
use crate::analyzer::parser::parse_source;
use crate::analyzer::safety::SafetyVerdict;
use crate::cli::args::{Cli, Commands, PropertyArg, SimulationMode, StrategyArg};
use crate::analyzer::simulator::SimStatus;
use crate::config::{AnalyzerConfig, ChoiceStrategy, SafetyPropertyKind};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use anyhow::{Result, anyhow};
use clap::Parser;
use std::fs;
use std::path::Path;

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        println!("scribble-analyzer v{}", env!("CARGO_PKG_VERSION"));
    }

    match cli.command {
        Commands::Parse { input, ast, json } => parse_command(&input, ast, json, cli.verbose),
        Commands::Verify { input, protocol } => {
            verify_command(&input, protocol.as_deref(), cli.verbose)
        }
        Commands::Project {
            input,
            protocol,
            json,
        } => project_command(&input, protocol.as_deref(), json, cli.verbose),
        Commands::Check {
            input,
            protocol,
            property,
            buffer_bound,
        } => check_command(&input, protocol.as_deref(), property, buffer_bound, cli.verbose),
        Commands::Simulate {
            input,
            protocol,
            mode,
            strategy,
            seed,
            max_steps,
            json,
        } => simulate_command(
            &input,
            protocol.as_deref(),
            mode,
            strategy,
            seed,
            max_steps,
            json,
            cli.verbose,
        ),
        Commands::Init { name, output } => init_command(&name, output.as_deref()),
    }
}

fn read_source(input: &Path) -> Result<String> {
    fs::read_to_string(input).map_err(|e| anyhow!("failed to read {}: {e}", input.display()))
}

fn print_diagnostics(diagnostics: &Diagnostics, source: &str) {
    for diagnostic in diagnostics.iter() {
        println!("{}", diagnostic.render(Some(source)));
    }
}

fn fail_with(diagnostics: &Diagnostics, source: &str) -> anyhow::Error {
    print_diagnostics(diagnostics, source);
    anyhow!("{} error(s) reported", diagnostics.errors().count())
}

fn parse_command(input: &Path, ast: bool, json: bool, verbose: bool) -> Result<()> {
    if verbose {
        println!("🔍 Parsing protocol file: {}", input.display());
    }
    let source = read_source(input)?;
    let outcome = parse_source(&source);
    print_diagnostics(&outcome.diagnostics, &source);
    if !outcome.is_clean() {
        return Err(anyhow!(
            "{} error(s) reported",
            outcome.diagnostics.errors().count()
        ));
    }

    println!("✅ Parsed {} declaration(s)", outcome.module.declarations.len());
    for protocol in outcome.module.protocols() {
        println!(
            "📋 {} protocol {} with {} role(s), {} statement(s)",
            if protocol.is_global() { "global" } else { "local" },
            protocol.name,
            protocol.roles.len(),
            protocol.body.len()
        );
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.module)?);
    } else if ast {
        print!("{}", outcome.module);
    }
    Ok(())
}

fn verify_command(input: &Path, protocol: Option<&str>, verbose: bool) -> Result<()> {
    if verbose {
        println!("🔍 Verifying protocol file: {}", input.display());
    }
    let source = read_source(input)?;
    let config = AnalyzerConfig::default();
    let analysis =
        analyze(&source, protocol, &config).map_err(|diagnostics| fail_with(&diagnostics, &source))?;

    print_diagnostics(&analysis.diagnostics, &source);
    let report = &analysis.wellformed;
    println!(
        "{} connected, {} deterministic choice, {} race-free",
        tick(report.connected),
        tick(report.deterministic),
        tick(report.race_free)
    );
    if report.holds() {
        println!("🎉 {} is well-formed", analysis.protocol);
        Ok(())
    } else {
        Err(anyhow!("{} is not well-formed", analysis.protocol))
    }
}

fn tick(ok: bool) -> &'static str {
    if ok { "✅" } else { "❌" }
}

fn project_command(input: &Path, protocol: Option<&str>, json: bool, verbose: bool) -> Result<()> {
    if verbose {
        println!("🔍 Projecting protocol file: {}", input.display());
    }
    let source = read_source(input)?;
    let config = AnalyzerConfig::default();
    let analysis =
        analyze(&source, protocol, &config).map_err(|diagnostics| fail_with(&diagnostics, &source))?;

    println!(
        "✅ Projected {} onto {} role(s)",
        analysis.protocol,
        analysis.machines.len()
    );
    if json {
        println!("{}", serde_json::to_string_pretty(&analysis.machines)?);
    } else {
        for (role, machine) in &analysis.machines {
            println!("// machine for role {role}");
            print!("{}", machine.to_dot());
        }
    }
    Ok(())
}

fn check_command(
    input: &Path,
    protocol: Option<&str>,
    property: PropertyArg,
    buffer_bound: Option<u32>,
    verbose: bool,
) -> Result<()> {
    if verbose {
        println!("🔍 Checking protocol file: {}", input.display());
    }
    let source = read_source(input)?;
    let mut config = AnalyzerConfig::default();
    config.safety_property = match property {
        PropertyArg::Basic => SafetyPropertyKind::Basic,
        PropertyArg::DeadlockFree => SafetyPropertyKind::DeadlockFree,
        PropertyArg::Live => SafetyPropertyKind::Live,
        PropertyArg::LivePlus => SafetyPropertyKind::LivePlus,
        PropertyArg::Consistency => SafetyPropertyKind::Consistency,
    };
    if let Some(bound) = buffer_bound {
        config.buffer_bound = bound;
    }

    let analysis =
        analyze(&source, protocol, &config).map_err(|diagnostics| fail_with(&diagnostics, &source))?;

    match check_safety(&analysis.machines, &config) {
        SafetyVerdict::Safe { property, explored } => {
            println!(
                "🎉 {} is SAFE under {property} ({explored} configuration(s) explored)",
                analysis.protocol
            );
            Ok(())
        }
        SafetyVerdict::Unsafe {
            property,
            violation,
            trace,
            explored,
            ..
        } => {
            println!(
                "❌ {} is UNSAFE under {property} ({explored} configuration(s) explored)",
                analysis.protocol
            );
            let diagnostic = Diagnostic::error(
                DiagnosticKind::SafetyViolation,
                format!("rule {}: {}", violation.rule, violation.message),
            )
            .entity(analysis.protocol.clone());
            println!("{}", diagnostic.render(Some(&source)));
            if trace.is_empty() {
                println!("violated at the initial configuration");
            } else {
                println!("shortest witness trace:");
                for (index, step) in trace.iter().enumerate() {
                    println!("  {index}: {step}");
                }
            }
            Err(anyhow!("safety violation in {}", analysis.protocol))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn simulate_command(
    input: &Path,
    protocol: Option<&str>,
    mode: SimulationMode,
    strategy: StrategyArg,
    seed: Option<u64>,
    max_steps: Option<u32>,
    json: bool,
    verbose: bool,
) -> Result<()> {
    if verbose {
        println!("🔍 Simulating protocol file: {}", input.display());
    }
    let source = read_source(input)?;
    let mut config = AnalyzerConfig::default();
    config.choice_strategy = match strategy {
        StrategyArg::Deterministic => ChoiceStrategy::Deterministic,
        StrategyArg::Random => ChoiceStrategy::Random,
    };
    config.random_seed = seed;
    if let Some(steps) = max_steps {
        config.max_steps = steps;
    }

    let analysis =
        analyze(&source, protocol, &config).map_err(|diagnostics| fail_with(&diagnostics, &source))?;

    let status = match mode {
        SimulationMode::Global => {
            let entry = analysis
                .registry
                .get(&analysis.protocol)
                .expect("analyzed protocol is registered");
            let report = simulate_global(&entry.cfg, &analysis.registry, &config);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for event in &report.trace {
                    println!("[{:>4}] {:?}", event.timestamp, event.kind);
                }
                println!("status: {:?} after {} step(s)", report.status, report.steps);
            }
            report.status
        }
        SimulationMode::Async => {
            let report = simulate_async(&analysis.machines, &config);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for event in &report.trace {
                    println!("[{:>4}] {:?}", event.timestamp, event.kind);
                }
                println!("status: {:?} after {} step(s)", report.status, report.steps);
                for buffer in &report.final_buffers {
                    println!(
                        "undelivered ({} -> {}): {:?}",
                        buffer.from, buffer.to, buffer.labels
                    );
                }
            }
            report.status
        }
    };
    match status {
        // Budget exhaustion is reported, never fatal.
        SimStatus::MaxSteps => {
            let diagnostic = Diagnostic::warning(
                DiagnosticKind::MaxSteps,
                format!("simulation stopped after {} step(s)", config.max_steps),
            );
            println!("{}", diagnostic.render(None));
            Ok(())
        }
        SimStatus::Failed { diagnostic } => {
            println!("{}", diagnostic.render(Some(&source)));
            Err(anyhow!("simulation failed"))
        }
        _ => Ok(()),
    }
}

fn init_command(name: &str, output: Option<&Path>) -> Result<()> {
    let template = format!(
        r#"// {name}: a two-party request/response protocol to start from.
global protocol {name}(role Client, role Server) {{
    Client -> Server: Request();
    choice at Server {{
        Server -> Client: Accept();
    }} or {{
        Server -> Client: Reject();
    }}
}}
"#
    );
    match output {
        Some(path) => {
            fs::write(path, template)
                .map_err(|e| anyhow!("failed to write {}: {e}", path.display()))?;
            println!("✅ Wrote template protocol {name} to {}", path.display());
        }
        None => print!("{template}"),
    }
    Ok(())
}

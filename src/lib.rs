pub mod analyzer;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod protocol;

// Re-export commonly used types
pub use analyzer::{Analysis, analyze, check_safety, simulate_async, simulate_global};
pub use config::{AnalyzerConfig, ChoiceStrategy, SafetyPropertyKind};
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics, Severity, SourceLoc};
pub use protocol::ast::{Module, Role};
pub use protocol::registry::ProtocolRegistry;

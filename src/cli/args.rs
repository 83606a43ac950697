use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "scribble",
    about = "Static analyzer and interactive simulator for multiparty session protocols",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SimulationMode {
    /// Synchronous orchestration over the global CFG.
    Global,
    /// Asynchronous stepping over the projected machines with FIFO buffers.
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    Deterministic,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PropertyArg {
    Basic,
    DeadlockFree,
    Live,
    LivePlus,
    Consistency,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse a protocol file and report diagnostics
    Parse {
        /// Input protocol file to parse
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Print the parsed module in canonical form
        #[arg(long)]
        ast: bool,

        /// Emit the module as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check well-formedness of a global protocol
    Verify {
        /// Input protocol file to verify
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Protocol to verify; defaults to the first global declaration
        #[arg(short, long)]
        protocol: Option<String>,
    },

    /// Project a global protocol to one machine per role
    Project {
        /// Input protocol file to project
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Protocol to project; defaults to the first global declaration
        #[arg(short, long)]
        protocol: Option<String>,

        /// Emit the machines as JSON instead of Graphviz
        #[arg(long)]
        json: bool,
    },

    /// Decide a safety property over the composed machines
    Check {
        /// Input protocol file to check
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Protocol to check; defaults to the first global declaration
        #[arg(short, long)]
        protocol: Option<String>,

        /// Safety predicate to decide
        #[arg(long, value_enum, default_value_t = PropertyArg::Basic)]
        property: PropertyArg,

        /// Per-channel FIFO bound during exploration
        #[arg(long)]
        buffer_bound: Option<u32>,
    },

    /// Run a protocol step by step and print the trace
    Simulate {
        /// Input protocol file to simulate
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Protocol to simulate; defaults to the first global declaration
        #[arg(short, long)]
        protocol: Option<String>,

        /// Interpreter to drive
        #[arg(long, value_enum, default_value_t = SimulationMode::Global)]
        mode: SimulationMode,

        /// How branch points are resolved
        #[arg(long, value_enum, default_value_t = StrategyArg::Deterministic)]
        strategy: StrategyArg,

        /// Seed for the random strategy
        #[arg(long)]
        seed: Option<u64>,

        /// Step budget
        #[arg(long)]
        max_steps: Option<u32>,

        /// Emit the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a protocol template to get started
    Init {
        /// Name of the protocol
        #[arg(value_name = "PROTOCOL_NAME")]
        name: String,

        /// Output file for the template
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "weave", version, about = "Multi-agent LLM task fabric")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one task and stream its progress
    Run {
        /// The task text
        #[arg(short, long)]
        task: String,

        #[command(flatten)]
        options: FabricArgs,
    },
    /// Run one task through the fabric, then through a single model, and
    /// print both summaries
    Compare {
        /// The task text
        #[arg(short, long)]
        task: String,

        #[command(flatten)]
        options: FabricArgs,
    },
    /// Read tasks from stdin until `quit`; `forget [N]` keeps only the last N memories
    Interactive {
        #[command(flatten)]
        options: FabricArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct FabricArgs {
    /// Model for every agent without its own `[agents.<id>] model`
    #[arg(short, long)]
    pub model: Option<String>,

    /// Task timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Path to config file (overrides ./weave.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Skip the critique pass
    #[arg(long)]
    pub no_critique: bool,

    /// Ask the coordinator for a plan before delegating
    #[arg(long)]
    pub decompose: bool,

    /// Print stream events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Write a JSONL transcript of each task
    #[arg(long)]
    pub transcript: bool,

    /// Use canned echo replies instead of a real provider
    #[arg(long)]
    pub offline: bool,
}

impl Cli {
    pub fn options(&self) -> &FabricArgs {
        match &self.command {
            Commands::Run { options, .. }
            | Commands::Compare { options, .. }
            | Commands::Interactive { options } => options,
        }
    }
}

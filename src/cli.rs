use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "handover",
    about = "Run supervised automation tasks with human takeover",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one task until it completes or fails
    Run {
        /// Config file (TOML, or YAML by extension)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Task description; overrides the config file
        #[arg(long)]
        task: Option<String>,

        /// Desired end state
        #[arg(long)]
        goal: Option<String>,

        /// Planner provider (scripted, command)
        #[arg(long)]
        planner: Option<String>,

        /// Seconds to wait for the user during an intervention
        #[arg(long)]
        timeout: Option<f64>,

        /// Maximum number of notes kept in memory
        #[arg(long)]
        memory_max: Option<usize>,

        /// Directory for per-task artifacts
        #[arg(long)]
        artifacts: Option<PathBuf>,

        /// Print the final task record as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show the effective configuration
    Config {
        /// Config file (TOML, or YAML by extension)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Emit machine-readable JSON output
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Parse a planner reply and print the normalized directive
    ParseDirective {
        /// File holding the reply; reads stdin when omitted
        file: Option<PathBuf>,
    },
}

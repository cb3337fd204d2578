use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "replica", version, about = "Hierarchical multi-agent orchestration")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the root agent and chat with it on stdin
    Run {
        /// Path to config file (overrides default search)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum number of live child agents across the whole tree
        #[arg(long)]
        max_children: Option<usize>,

        /// Maximum recursion depth (root = 0)
        #[arg(long)]
        max_depth: Option<usize>,

        /// Timeout in seconds for tool calls and child start-up
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Validate the configuration and print the resolved agents
    Check {
        /// Path to config file (overrides default search)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Write a default config file if none exists
    Init {
        /// Where to write the file (defaults to the global config path)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use threadpilot::config::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(
    name = "threadpilot",
    about = "Run one Claude Code process per chat thread, with questions answered through chat controls",
    version
)]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve platform events read as JSON lines from stdin.
    Serve,
    /// Map a thread to a working directory.
    MapThread {
        /// Thread timestamp.
        thread: String,
        /// Absolute path to an existing directory.
        directory: PathBuf,
        /// Project name (defaults to the directory name).
        #[arg(long)]
        project: Option<String>,
        /// Channel the thread lives in.
        #[arg(long)]
        channel: Option<String>,
        /// Offer "Interrupt & send" when a message arrives while claude is busy.
        #[arg(long)]
        autopilot: bool,
    },
    /// Map a channel to a working directory; its threads inherit the mapping.
    MapChannel {
        channel: String,
        /// Absolute path to an existing directory.
        directory: PathBuf,
        /// Project name (defaults to the directory name).
        #[arg(long)]
        project: Option<String>,
        /// Offer "Interrupt & send" when a message arrives while claude is busy.
        #[arg(long)]
        autopilot: bool,
    },
    /// Show whether the server is running and what is mapped.
    Status,
}

//! Command-line arguments

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// MIDI Directory - list MIDI endpoints and monitor decoded traffic
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (defaults to the user config directory)
    #[arg(short, long, env = "MIDI_DIRECTORY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides the config
    #[arg(short, long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List known sources and destinations
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Open sources and print decoded messages until Ctrl+C
    Monitor {
        /// Only open sources whose name contains this text
        #[arg(short, long)]
        filter: Option<String>,
    },
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Quiz-gated app access
///
/// Blocks chosen apps behind a full-screen overlay until a quiz is passed,
/// then unlocks them for a timed window, a limited number of times per day.
#[derive(Parser, Debug)]
#[command(name = "quizlock")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example configuration file
    Init {
        /// Where to write it (defaults to --config or the per-user path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Start gating an app
    AddApp {
        /// Package / bundle identifier
        id: String,

        /// Display name
        #[arg(long)]
        name: Option<String>,

        /// Unlocks allowed per day
        #[arg(long, default_value = "3")]
        quota: u32,

        /// Length of each unlock in minutes
        #[arg(long, default_value = "15")]
        minutes: u32,
    },
    /// Stop gating an app and forget its usage
    RemoveApp { id: String },
    /// Turn gating on for an app
    Enable { id: String },
    /// Turn gating off for an app
    Disable { id: String },
    /// Change the daily unlock quota of an app
    SetQuota { id: String, quota: u32 },
    /// Change the unlock window of an app
    SetDuration { id: String, minutes: u32 },
    /// Show gated apps, today's usage and live sessions
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget today's usage and live sessions
    ResetState,
    /// Run the gate in the foreground
    Run {
        /// Read foreground app ids from stdin instead of polling the desktop
        #[arg(long)]
        stdin: bool,
    },
}

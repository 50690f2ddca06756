use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Roam – send chat messages and report command outcomes as a Roam bot
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Activate verbose output (-v, -vv, etc.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Bot profile from the config file
    #[arg(short, long, default_value = "default", global = true)]
    pub profile: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a message
    Send {
        /// Message text
        message: String,

        /// Target channel id (repeatable); replaces the profile's default channels
        #[arg(short = 'C', long = "channel")]
        channels: Vec<String>,
    },
    /// List the channels visible to the bot
    Channels {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check that the API accepts the bot's token
    Ping,
    /// Run a command and report its outcome
    Run {
        /// Message sent when the command fails (required)
        #[arg(short, long)]
        message: Option<String>,

        /// Message sent when the command succeeds
        #[arg(short = 's', long)]
        message_success: Option<String>,

        /// Target channel id (repeatable); replaces the profile's default channels
        #[arg(short = 'C', long = "channel")]
        channels: Vec<String>,

        /// Name bound to {func_name} (defaults to the program name)
        #[arg(long)]
        name: Option<String>,

        /// Command line to run
        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
    /// Print build information
    Version {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Server address (host:port), overrides the configuration file
    #[arg(short, long)]
    pub server: Option<String>,

    /// Username attached to outgoing messages
    #[arg(short, long)]
    pub username: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start interactive chat mode
    Chat,
    /// Send a single message and exit
    Send {
        /// Message text
        message: String,
    },
    /// Print inbound messages until the connection closes
    Listen {
        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Run a local development relay
    Relay {
        /// Address to listen on, overrides the configuration file
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Write the effective configuration to a TOML file
    InitConfig {
        /// Destination, defaults to ~/.socketchat/config.toml
        #[arg(short, long)]
        output: Option<String>,
    },
}

//! socketchat CLI library
//!
//! Components of the `socketchat` command-line client: argument parsing,
//! configuration loading, the terminal chat front end and a local
//! development relay.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod relay;

pub use app::{ChatApp, ConsolePrinter, OutputFormat};
pub use cli::{Cli, Commands};
pub use config::{AppConfig, CliConfig, RelayConfig};
pub use error::{CliError, Result};
pub use relay::Relay;

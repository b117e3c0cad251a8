//! Command handlers for the socketchat CLI

use std::path::PathBuf;

use tracing::info;

use crate::app::ChatApp;
use crate::cli::Commands;
use crate::config::AppConfig;
use crate::error::{CliError, Result};
use crate::relay::Relay;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(command: Commands, config: AppConfig) -> Result<()> {
        match command {
            Commands::Chat => ChatApp::new(config)?.run_chat().await,
            Commands::Send { message } => ChatApp::new(config)?.send_once(message).await,
            Commands::Listen { json } => ChatApp::new(config)?.listen(json).await,
            Commands::Relay { bind } => Self::handle_relay_command(config, bind).await,
            Commands::InitConfig { output } => Self::handle_init_config_command(&config, output),
        }
    }

    /// Handle the relay command
    async fn handle_relay_command(mut config: AppConfig, bind: Option<String>) -> Result<()> {
        if let Some(bind) = bind {
            config.relay.bind_addr = bind;
        }
        let relay = Relay::bind(&config.relay).await?;

        tokio::select! {
            result = relay.run() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Relay shutting down");
                Ok(())
            }
        }
    }

    /// Handle the init-config command
    fn handle_init_config_command(config: &AppConfig, output: Option<String>) -> Result<()> {
        let path: PathBuf = match output {
            Some(path) => path.into(),
            None => AppConfig::default_config_path().ok_or_else(|| {
                CliError::Config("No home directory, pass --output".to_string())
            })?,
        };

        config.save_to_file(&path)?;
        println!("Configuration written to {}", path.display());
        Ok(())
    }
}

//! Process-wide client access
//!
//! Every screen of an application talks to the same connection. The first
//! call to `get_client` creates it, from the configuration passed to
//! `init_client` if that ran first, otherwise from `ClientConfig::from_env`.

use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use socketchat_core::{ChatError, Result};

use crate::config::ClientConfig;
use crate::connection::SocketClient;

static CLIENT: OnceLock<Arc<SocketClient>> = OnceLock::new();

/// Create the process-wide client from an explicit configuration
///
/// Fails with `AlreadyInitialized` once a client exists, whether it came
/// from an earlier `init_client` or from `get_client`.
pub fn init_client(config: ClientConfig) -> Result<Arc<SocketClient>> {
    if CLIENT.get().is_some() {
        return Err(ChatError::AlreadyInitialized);
    }

    let client = Arc::new(SocketClient::new(config)?);
    match CLIENT.set(client.clone()) {
        Ok(()) => {
            info!("Initialized client for {}", client.config().server_addr);
            Ok(client)
        }
        Err(_) => Err(ChatError::AlreadyInitialized),
    }
}

/// The process-wide client, created on first access
///
/// Concurrent first callers all receive the same instance.
pub fn get_client() -> Arc<SocketClient> {
    CLIENT.get_or_init(|| Arc::new(client_from_env())).clone()
}

/// The process-wide client if one has been created
pub fn try_get_client() -> Option<Arc<SocketClient>> {
    CLIENT.get().cloned()
}

fn client_from_env() -> SocketClient {
    SocketClient::new(ClientConfig::from_env()).unwrap_or_else(|e| {
        warn!("Invalid environment configuration ({}), using defaults", e);
        SocketClient::from_config(ClientConfig::default())
    })
}

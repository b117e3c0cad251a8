//! socketchat Client
//!
//! Connection management and message dispatch on top of `socketchat-core`.
//! `SocketClient` keeps one TCP connection to a chat server, writes
//! `ClientSendMessage` frames and delivers every decoded inbound message to a
//! primary listener and any channel subscribers. `get_client` exposes one
//! shared instance per process.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod facade;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{ClientConfig, ENV_SERVER_ADDR, ENV_USERNAME};
pub use connection::{ConnectionStats, SocketClient};
pub use dispatch::{DispatchRegistry, MessageListener, Subscription, SubscriptionId};
pub use facade::{get_client, init_client, try_get_client};

pub use socketchat_core::{
    ChatError, ClientSendMessage, ConnectionState, ErrorMessage, Message, MessageType,
    RecallMessage, Result, ServerSendMessage, Timestamp, Uuid,
};

//! Error types for the socketchat protocol
//!
//! Decode errors are single-frame faults the receive loop recovers from,
//! transport errors are fatal to the connection, and `ChatError` unifies them
//! for the public API. Server-reported failures arrive as `ErrorMessage`
//! values and never appear here.

use crate::connection_state::ConnectionState;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures while turning bytes back into a message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Frame too short: {length} bytes cannot hold a frame header")]
    FrameTooShort { length: usize },
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: u8 },
    #[error("Unknown message type: {tag}")]
    UnknownMessageType { tag: u8 },
    #[error("Malformed message body: {reason}")]
    Malformed { reason: String },
    #[error("Message body has {count} trailing bytes")]
    TrailingBytes { count: usize },
}

impl DecodeError {
    /// Whether the stream can continue after this error
    ///
    /// Everything except an oversized length prefix is confined to a single
    /// frame. An oversized prefix cannot be skipped without trusting it.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DecodeError::FrameTooLarge { .. })
    }
}

impl From<bincode::Error> for DecodeError {
    fn from(err: bincode::Error) -> Self {
        DecodeError::Malformed {
            reason: err.to_string(),
        }
    }
}

/// Failures while turning a message into a frame
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Encoded frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Socket-level failures, fatal to the connection
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not connected: call start_listening first")]
    NotConnected,
    #[error("Connection closed: {}", .reason.as_deref().unwrap_or("disconnected"))]
    ConnectionClosed { reason: Option<String> },
}

/// Rejected connection state machine transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid transition from {from} on {event}")]
pub struct StateTransitionError {
    pub from: &'static str,
    pub event: String,
}

impl StateTransitionError {
    pub(crate) fn new(from: &ConnectionState, event: String) -> Self {
        Self {
            from: from.state_name(),
            event,
        }
    }
}

/// Failures registering a message subscriber
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Subscriber limit reached ({max})")]
    LimitReached { max: usize },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for the socketchat protocol
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// The process-wide client was already created
    #[error("Client already initialized")]
    AlreadyInitialized,
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl ChatError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        ChatError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a connection closed error, optionally carrying the fault reason
    pub fn connection_closed(reason: Option<String>) -> Self {
        ChatError::Transport(TransportError::ConnectionClosed { reason })
    }

    /// Create a not connected error
    pub fn not_connected() -> Self {
        ChatError::Transport(TransportError::NotConnected)
    }

    /// Whether this error means the connection is unusable until restarted
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, ChatError::Transport(_))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, ChatError>;

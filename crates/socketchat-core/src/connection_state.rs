//! Connection State Machine
//!
//! Lifecycle of the single client connection:
//!
//! ```text
//! Disconnected ──Connect──▶ Connecting ──Established──▶ Active
//!                               │                          │
//!                  ConnectFailed│Disconnect   TransportFault│Disconnect
//!                               ▼                          ▼
//!                             Closed ◀─────────────────────┘
//!                               │
//!                               └──Connect──▶ Connecting
//! ```
//!
//! Transitions consume the current state and either yield the next one or a
//! `StateTransitionError`. The machine does no I/O.

use core::fmt;

use crate::errors::StateTransitionError;

// ----------------------------------------------------------------------------
// Connection State Types
// ----------------------------------------------------------------------------

/// Lifecycle state of a connection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected
    #[default]
    Disconnected,
    /// Socket is being opened
    Connecting,
    /// Socket open and receive loop running
    Active,
    /// Socket released; `reason` is set when a fault rather than a caller closed it
    Closed { reason: Option<String> },
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Caller asked to open the socket
    Connect,
    /// Socket opened
    Established,
    /// Socket could not be opened
    ConnectFailed { reason: String },
    /// Read or write failed, or the peer closed the stream
    TransportFault { reason: String },
    /// Caller asked to close
    Disconnect,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connect => write!(f, "Connect"),
            ConnectionEvent::Established => write!(f, "Established"),
            ConnectionEvent::ConnectFailed { reason } => write!(f, "ConnectFailed({})", reason),
            ConnectionEvent::TransportFault { reason } => {
                write!(f, "TransportFault({})", reason)
            }
            ConnectionEvent::Disconnect => write!(f, "Disconnect"),
        }
    }
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

impl ConnectionState {
    /// Get current state name for logging
    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Active => "Active",
            ConnectionState::Closed { .. } => "Closed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed { .. })
    }

    /// Fault that closed the connection, if any
    pub fn close_reason(&self) -> Option<&str> {
        match self {
            ConnectionState::Closed { reason } => reason.as_deref(),
            _ => None,
        }
    }

    /// Process an event and transition to the new state (consumes self)
    pub fn transition(self, event: ConnectionEvent) -> Result<Self, StateTransitionError> {
        match (self, event) {
            (ConnectionState::Disconnected, ConnectionEvent::Connect)
            | (ConnectionState::Closed { .. }, ConnectionEvent::Connect) => {
                Ok(ConnectionState::Connecting)
            }

            (ConnectionState::Connecting, ConnectionEvent::Established) => {
                Ok(ConnectionState::Active)
            }

            (ConnectionState::Connecting, ConnectionEvent::ConnectFailed { reason })
            | (ConnectionState::Active, ConnectionEvent::TransportFault { reason }) => {
                Ok(ConnectionState::Closed {
                    reason: Some(reason),
                })
            }

            (ConnectionState::Disconnected, ConnectionEvent::Disconnect)
            | (ConnectionState::Connecting, ConnectionEvent::Disconnect)
            | (ConnectionState::Active, ConnectionEvent::Disconnect) => {
                Ok(ConnectionState::Closed { reason: None })
            }

            // Closing twice keeps the original reason
            (closed @ ConnectionState::Closed { .. }, ConnectionEvent::Disconnect) => Ok(closed),

            (state, event) => Err(StateTransitionError::new(&state, event.to_string())),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed {
                reason: Some(reason),
            } => write!(f, "Closed ({})", reason),
            other => write!(f, "{}", other.state_name()),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

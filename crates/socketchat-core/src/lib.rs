//! socketchat Core Protocol Implementation
//!
//! This crate provides the message model, the binary wire codec and the
//! connection lifecycle state machine shared by the socketchat client and the
//! development relay. It performs no I/O of its own.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod connection_state;
pub mod errors;
pub mod message;
pub mod types;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use connection_state::{ConnectionEvent, ConnectionState};
pub use errors::{
    ChatError, DecodeError, EncodeError, Result, StateTransitionError, SubscriptionError,
    TransportError,
};
pub use message::{
    ClientSendMessage, ErrorMessage, Message, MessageType, RecallMessage, ServerSendMessage,
};
pub use types::{MonotonicTimeSource, SystemTimeSource, TimeSource, Timestamp};
pub use wire::{DecodeStatus, FrameBuffer, WireFormat};

pub use uuid::Uuid;

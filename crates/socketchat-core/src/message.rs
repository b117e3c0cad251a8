//! Application layer message structures
//!
//! `Message` is the closed set of variants exchanged with the server. Each
//! variant is immutable once constructed; fields are exposed through accessors
//! only.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Message Types
// ----------------------------------------------------------------------------

/// Wire discriminant carried by every frame
///
/// Values `0x05..=0xFF` are reserved for future variants; older decoders
/// report them as unknown rather than failing the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client to server chat message
    ClientSend = 0x01,
    /// Server broadcast of a chat message
    ServerSend = 0x02,
    /// Server-reported application error
    Error = 0x03,
    /// Recall of an earlier message by id
    Recall = 0x04,
}

impl MessageType {
    /// Convert from u8, returning None for unknown values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ClientSend),
            0x02 => Some(Self::ServerSend),
            0x03 => Some(Self::Error),
            0x04 => Some(Self::Recall),
            _ => None,
        }
    }

    /// Raw tag byte
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ----------------------------------------------------------------------------
// Message Variants
// ----------------------------------------------------------------------------

/// Chat message composed by this client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSendMessage {
    id: Uuid,
    timestamp: Timestamp,
    text: String,
}

impl ClientSendMessage {
    /// Compose a message with a fresh id, stamped with the current time
    pub fn new(text: impl Into<String>) -> Self {
        Self::from_parts(Uuid::new_v4(), Timestamp::now(), text)
    }

    /// Compose a message with a fresh id, stamped by the given time source
    pub fn with_time_source(text: impl Into<String>, time_source: &dyn TimeSource) -> Self {
        Self::from_parts(Uuid::new_v4(), time_source.now(), text)
    }

    /// Rebuild a message from known parts
    pub fn from_parts(id: Uuid, timestamp: Timestamp, text: impl Into<String>) -> Self {
        Self {
            id,
            timestamp,
            text: text.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Chat message broadcast by the server
///
/// May be an echo of a message this client sent, in which case the id matches
/// the original `ClientSendMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSendMessage {
    id: Uuid,
    timestamp: Timestamp,
    text: String,
    sender_username: String,
}

impl ServerSendMessage {
    pub fn new(
        id: Uuid,
        timestamp: Timestamp,
        text: impl Into<String>,
        sender_username: impl Into<String>,
    ) -> Self {
        Self {
            id,
            timestamp,
            text: text.into(),
            sender_username: sender_username.into(),
        }
    }

    /// Broadcast form of a client message, keeping its identity
    pub fn echo_of(message: &ClientSendMessage, sender_username: impl Into<String>) -> Self {
        Self::new(
            message.id(),
            message.timestamp(),
            message.text(),
            sender_username,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sender_username(&self) -> &str {
        &self.sender_username
    }
}

/// Application-level error reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    error_message: String,
}

impl ErrorMessage {
    pub fn new(error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
        }
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }
}

/// Request to recall an earlier message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallMessage {
    id: Uuid,
}

impl RecallMessage {
    pub fn new(id: Uuid) -> Self {
        Self { id }
    }

    /// Id of the message being recalled
    pub fn id(&self) -> Uuid {
        self.id
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// Any message that can travel over a socketchat connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    ClientSend(ClientSendMessage),
    ServerSend(ServerSendMessage),
    Error(ErrorMessage),
    Recall(RecallMessage),
}

impl Message {
    /// Wire discriminant for this variant
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ClientSend(_) => MessageType::ClientSend,
            Message::ServerSend(_) => MessageType::ServerSend,
            Message::Error(_) => MessageType::Error,
            Message::Recall(_) => MessageType::Recall,
        }
    }

    /// Id of the message, for variants that carry one
    pub fn id(&self) -> Option<Uuid> {
        match self {
            Message::ClientSend(m) => Some(m.id()),
            Message::ServerSend(m) => Some(m.id()),
            Message::Recall(m) => Some(m.id()),
            Message::Error(_) => None,
        }
    }
}

impl From<ClientSendMessage> for Message {
    fn from(message: ClientSendMessage) -> Self {
        Message::ClientSend(message)
    }
}

impl From<ServerSendMessage> for Message {
    fn from(message: ServerSendMessage) -> Self {
        Message::ServerSend(message)
    }
}

impl From<ErrorMessage> for Message {
    fn from(message: ErrorMessage) -> Self {
        Message::Error(message)
    }
}

impl From<RecallMessage> for Message {
    fn from(message: RecallMessage) -> Self {
        Message::Recall(message)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

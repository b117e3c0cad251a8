//! Wire format for socketchat frames
//!
//! Every message travels as one self-delimiting frame:
//!
//! ```text
//! ┌──────────────────┬─────────────┬──────────┬───────────────────────────┐
//! │ Length (4 bytes) │ Version (1) │ Tag (1)  │ Body (variable)           │
//! │ Big-endian u32   │ currently 1 │ variant  │ bincode, fixint, big-end. │
//! └──────────────────┴─────────────┴──────────┴───────────────────────────┘
//! ```
//!
//! - **Length**: number of bytes following the prefix (version + tag + body)
//! - **Tag**: `MessageType` discriminant; unknown tags are a per-frame error
//! - **Body**: the variant's fields; strings are u64-length-prefixed UTF-8
//!
//! A decode failure inside a complete frame spoils only that frame. An
//! oversized length prefix is the one failure the stream cannot recover from.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::errors::{DecodeError, EncodeError};
use crate::message::{Message, MessageType};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Current protocol version written into every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the version and tag bytes that start every frame
pub const FRAME_HEADER_SIZE: usize = 2;

/// Default upper bound for the length prefix (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

// ----------------------------------------------------------------------------
// Decode Status
// ----------------------------------------------------------------------------

/// Outcome of decoding the front of a byte buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStatus {
    /// A full frame was decoded
    Complete {
        message: Message,
        /// Bytes occupied by the frame, prefix included
        consumed: usize,
    },
    /// The buffer holds only part of a frame
    Incomplete {
        /// Minimum number of additional bytes before another attempt can succeed
        needed: usize,
    },
}

// ----------------------------------------------------------------------------
// Wire Format Codec
// ----------------------------------------------------------------------------

/// Binary wire format encoder/decoder for messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    max_frame_size: usize,
}

impl Default for WireFormat {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl WireFormat {
    /// Create a codec accepting frames up to `max_frame_size` bytes after the prefix
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.max(FRAME_HEADER_SIZE),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a message into a complete frame
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, EncodeError> {
        let body = match message {
            Message::ClientSend(m) => self.serialize_body(m)?,
            Message::ServerSend(m) => self.serialize_body(m)?,
            Message::Error(m) => self.serialize_body(m)?,
            Message::Recall(m) => self.serialize_body(m)?,
        };

        let length = FRAME_HEADER_SIZE + body.len();
        if length > self.max_frame_size || length > u32::MAX as usize {
            return Err(EncodeError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + length);
        frame.extend_from_slice(&(length as u32).to_be_bytes());
        frame.push(PROTOCOL_VERSION);
        frame.push(message.message_type().as_u8());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode the frame at the front of `bytes`
    ///
    /// Never treats a partial frame as complete: anything short of a whole
    /// frame yields `DecodeStatus::Incomplete`.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodeStatus, DecodeError> {
        let total = match self.peek_frame_len(bytes)? {
            Some(total) => total,
            None => {
                return Ok(DecodeStatus::Incomplete {
                    needed: LENGTH_PREFIX_SIZE - bytes.len(),
                })
            }
        };

        if bytes.len() < total {
            return Ok(DecodeStatus::Incomplete {
                needed: total - bytes.len(),
            });
        }

        let message = self.decode_frame(&bytes[LENGTH_PREFIX_SIZE..total])?;
        Ok(DecodeStatus::Complete {
            message,
            consumed: total,
        })
    }

    /// Total size of the frame at the front of `bytes`, once the prefix is readable
    pub fn peek_frame_len(&self, bytes: &[u8]) -> Result<Option<usize>, DecodeError> {
        if bytes.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&bytes[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_be_bytes(prefix) as usize;

        if length > self.max_frame_size {
            return Err(DecodeError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        Ok(Some(LENGTH_PREFIX_SIZE + length))
    }

    /// Decode a frame with its length prefix already stripped
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Message, DecodeError> {
        if frame.len() < FRAME_HEADER_SIZE {
            return Err(DecodeError::FrameTooShort {
                length: frame.len(),
            });
        }

        let version = frame[0];
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion { version });
        }

        let tag = frame[1];
        let message_type =
            MessageType::from_u8(tag).ok_or(DecodeError::UnknownMessageType { tag })?;

        let body = &frame[FRAME_HEADER_SIZE..];
        let message = match message_type {
            MessageType::ClientSend => Message::ClientSend(self.deserialize_body(body)?),
            MessageType::ServerSend => Message::ServerSend(self.deserialize_body(body)?),
            MessageType::Error => Message::Error(self.deserialize_body(body)?),
            MessageType::Recall => Message::Recall(self.deserialize_body(body)?),
        };

        Ok(message)
    }

    fn base_options() -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_big_endian()
    }

    fn options(&self) -> impl Options {
        Self::base_options().with_limit(self.max_frame_size as u64)
    }

    fn serialize_body<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
        match self.options().serialize(value) {
            Ok(body) => Ok(body),
            Err(err) => match *err {
                bincode::ErrorKind::SizeLimit => {
                    let body_size = Self::base_options().serialized_size(value)?;
                    Err(EncodeError::FrameTooLarge {
                        size: FRAME_HEADER_SIZE + body_size as usize,
                        max: self.max_frame_size,
                    })
                }
                _ => Err(EncodeError::Serialization(err)),
            },
        }
    }

    fn deserialize_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, DecodeError> {
        let mut reader = body;
        let value = self.options().deserialize_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(DecodeError::TrailingBytes {
                count: reader.len(),
            });
        }
        Ok(value)
    }
}

// ----------------------------------------------------------------------------
// Streaming Frame Buffer
// ----------------------------------------------------------------------------

/// Accumulates socket reads and yields whole messages
///
/// A recoverable decode error drops exactly the offending frame; the next call
/// continues with the frame after it.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    wire: WireFormat,
    buffer: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(wire: WireFormat) -> Self {
        Self {
            wire,
            buffer: Vec::new(),
        }
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Take the next complete message, if one is buffered
    pub fn next_message(&mut self) -> Result<Option<Message>, DecodeError> {
        let total = match self.wire.peek_frame_len(&self.buffer)? {
            Some(total) if self.buffer.len() >= total => total,
            _ => return Ok(None),
        };

        let frame: Vec<u8> = self.buffer.drain(..total).collect();
        let result = self.wire.decode_frame(&frame[LENGTH_PREFIX_SIZE..]);
        if let Err(ref err) = result {
            debug!("Dropped {} byte frame: {}", total, err);
        }
        result.map(Some)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(WireFormat::default())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

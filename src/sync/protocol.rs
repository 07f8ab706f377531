//! JSON wire protocol between clients and the hub.
//!
//! Every frame is a JSON object with a numeric `fileId` and a numeric `type`
//! discriminant. Chunk messages (`type: 0`) carry an edit script in `chunks`;
//! lifecycle messages (`type: 1|2|3`) carry nothing else.
//!
//! Decoding is a single typed pass: the discriminant is validated first and
//! the payload is checked against it, so anything that gets past
//! [`Envelope::decode`] is well formed.

use serde::{Deserialize, Serialize};

use super::diff::{EditOp, EditScript};
use super::FileId;

/// Message type identifiers as they appear in the `type` field.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Chunk = 0,
    Create = 1,
    Rename = 2,
    Delete = 3,
}

impl TryFrom<i64> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, <Self as TryFrom<i64>>::Error> {
        match value {
            0 => Ok(MessageType::Chunk),
            1 => Ok(MessageType::Create),
            2 => Ok(MessageType::Rename),
            3 => Ok(MessageType::Delete),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Reasons a frame is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Invalid file id: {0}")]
    InvalidFileId(i64),

    #[error("Chunk message without chunks")]
    MissingChunks,

    #[error("Lifecycle message must not carry chunks")]
    UnexpectedChunks,

    #[error("Chunk {index} declares len {declared} but its text has {actual} chars")]
    LengthMismatch {
        index: usize,
        declared: usize,
        actual: usize,
    },

    #[error("Unsupported frame: {0}")]
    UnsupportedFrame(&'static str),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::InvalidFormat(err.to_string())
    }
}

/// Kind of lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Create,
    Rename,
    Delete,
}

impl FileEvent {
    fn message_type(self) -> MessageType {
        match self {
            FileEvent::Create => MessageType::Create,
            FileEvent::Rename => MessageType::Rename,
            FileEvent::Delete => MessageType::Delete,
        }
    }
}

/// Typed payload of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Chunk(EditScript),
    Event(FileEvent),
}

/// A decoded message. The sender is never part of the envelope: the hub
/// tracks it alongside, from the connection the frame arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub file_id: FileId,
    pub payload: Payload,
}

/// Raw frame shape, shared by decode and encode.
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "fileId")]
    file_id: i64,
    #[serde(rename = "type")]
    msg_type: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunks: Option<Vec<EditOp>>,
}

impl Envelope {
    pub fn chunk(file_id: FileId, chunks: EditScript) -> Self {
        Self {
            file_id,
            payload: Payload::Chunk(chunks),
        }
    }

    pub fn event(file_id: FileId, event: FileEvent) -> Self {
        Self {
            file_id,
            payload: Payload::Event(event),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match &self.payload {
            Payload::Chunk(_) => MessageType::Chunk,
            Payload::Event(event) => event.message_type(),
        }
    }

    /// Decode and validate a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireMessage = serde_json::from_str(text)?;
        let msg_type = MessageType::try_from(wire.msg_type)?;

        if wire.file_id <= 0 {
            return Err(ProtocolError::InvalidFileId(wire.file_id));
        }

        let payload = match (msg_type, wire.chunks) {
            (MessageType::Chunk, None) => return Err(ProtocolError::MissingChunks),
            (MessageType::Chunk, Some(chunks)) => {
                for (index, op) in chunks.iter().enumerate() {
                    if !op.is_consistent() {
                        return Err(ProtocolError::LengthMismatch {
                            index,
                            declared: op.len,
                            actual: op.text.chars().count(),
                        });
                    }
                }
                Payload::Chunk(chunks)
            }
            (_, Some(chunks)) if !chunks.is_empty() => {
                return Err(ProtocolError::UnexpectedChunks)
            }
            (MessageType::Create, _) => Payload::Event(FileEvent::Create),
            (MessageType::Rename, _) => Payload::Event(FileEvent::Rename),
            (MessageType::Delete, _) => Payload::Event(FileEvent::Delete),
        };

        Ok(Envelope {
            file_id: wire.file_id,
            payload,
        })
    }

    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let chunks = match &self.payload {
            Payload::Chunk(chunks) => Some(chunks.clone()),
            Payload::Event(_) => None,
        };
        let wire = WireMessage {
            file_id: self.file_id,
            msg_type: self.message_type() as i64,
            chunks,
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

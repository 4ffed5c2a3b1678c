//! Wire protocol shared between the connection handler and its clients.
//!
//! Binary frames carry a one-byte tag followed by an opaque payload; text
//! frames carry JSON, except for the bare `"ping"` keepalive.

mod awareness;

pub use awareness::{PresenceDecodeError, PresenceEntry, PresenceUpdate, REMOVED_STATE};

use serde::{Deserialize, Serialize};

use crate::UserIdentity;

/// Binary frame tag: CRDT update bytes.
pub const FRAME_SYNC: u8 = 0;
/// Binary frame tag: presence update bytes.
pub const FRAME_AWARENESS: u8 = 1;

/// Close code for rejected origin, missing/invalid token, malformed room id.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code for room initialization failure.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Close code for server shutdown.
pub const CLOSE_SERVICE_RESTART: u16 = 1012;

/// Bare-string keepalive exchanged as text frames.
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFrame<'a> {
    Sync(&'a [u8]),
    Awareness(&'a [u8]),
}

/// Splits a binary frame into tag and payload. Unknown tags and empty
/// frames yield `None` and are dropped by the caller.
#[must_use]
pub fn parse_binary_frame(frame: &[u8]) -> Option<BinaryFrame<'_>> {
    let (tag, payload) = frame.split_first()?;
    match *tag {
        FRAME_SYNC => Some(BinaryFrame::Sync(payload)),
        FRAME_AWARENESS => Some(BinaryFrame::Awareness(payload)),
        _ => None,
    }
}

#[must_use]
pub fn sync_frame(update: &[u8]) -> Vec<u8> {
    frame(FRAME_SYNC, update)
}

#[must_use]
pub fn awareness_frame(payload: &[u8]) -> Vec<u8> {
    frame(FRAME_AWARENESS, payload)
}

fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(tag);
    buf.extend_from_slice(payload);
    buf
}

/// JSON messages a client may send. Unknown `type` tags fail to parse and
/// are ignored by the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Chat { text: String },
}

#[must_use]
pub fn parse_client_message(text: &str) -> Option<ClientMessage> {
    serde_json::from_str(text).ok()
}

/// JSON messages the server sends on the text channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Welcome {
        message: String,
        #[serde(rename = "roomId")]
        room_id: String,
        user: UserIdentity,
    },
    Chat {
        id: String,
        #[serde(rename = "userId")]
        user_id: String,
        username: String,
        text: String,
        #[serde(rename = "sentAt")]
        sent_at: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Encodes to the JSON text carried by the frame. Serialization of
    /// these shapes cannot fail.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// REST error body, mirrored on every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

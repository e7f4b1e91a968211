//! Wire format of real-time channel frames.
//!
//! Every frame is a JSON text message. `payload` carries raw bytes as
//! standard base64.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Frame type. Unknown types deserialize to [`MessageKind::Unknown`] so the
/// channel loop can log and drop them without tearing the connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    YjsUpdate,
    StructureUpdate,
    BinaryUpdate,
    Ping,
    Pong,
    SyncRequest,
    SyncResponse,
    Error,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::YjsUpdate => "yjs-update",
            MessageKind::StructureUpdate => "structure-update",
            MessageKind::BinaryUpdate => "binary-update",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::SyncRequest => "sync-request",
            MessageKind::SyncResponse => "sync-response",
            MessageKind::Error => "error",
            MessageKind::Unknown => "unknown",
        }
    }

    fn from_wire(s: &str) -> Self {
        match s {
            "yjs-update" => MessageKind::YjsUpdate,
            "structure-update" => MessageKind::StructureUpdate,
            "binary-update" => MessageKind::BinaryUpdate,
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "sync-request" => MessageKind::SyncRequest,
            "sync-response" => MessageKind::SyncResponse,
            "error" => MessageKind::Error,
            _ => MessageKind::Unknown,
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MessageKind::from_wire(&s))
    }
}

/// One channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub vault_name: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Base64 of raw bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ChannelMessage {
    fn base(kind: MessageKind, vault: &str, device: &str) -> Self {
        Self {
            kind,
            vault_name: vault.to_string(),
            device_id: device.to_string(),
            file_id: None,
            payload: None,
            timestamp: now_millis(),
            error: None,
        }
    }

    pub fn ping(vault: &str, device: &str) -> Self {
        Self::base(MessageKind::Ping, vault, device)
    }

    pub fn pong(vault: &str, device: &str) -> Self {
        Self::base(MessageKind::Pong, vault, device)
    }

    pub fn error(vault: &str, device: &str, message: impl Into<String>) -> Self {
        let mut msg = Self::base(MessageKind::Error, vault, device);
        msg.error = Some(message.into());
        msg
    }

    pub fn sync_response(
        vault: &str,
        device: &str,
        file_id: Option<String>,
        state: &[u8],
    ) -> Self {
        let mut msg = Self::base(MessageKind::SyncResponse, vault, device);
        msg.file_id = file_id;
        msg.payload = Some(BASE64.encode(state));
        msg
    }

    pub fn update(
        kind: MessageKind,
        vault: &str,
        device: &str,
        file_id: Option<String>,
        bytes: &[u8],
    ) -> Self {
        let mut msg = Self::base(kind, vault, device);
        msg.file_id = file_id;
        msg.payload = Some(BASE64.encode(bytes));
        msg
    }

    /// Decoded payload bytes, or `None` when absent/invalid.
    pub fn decoded_payload(&self) -> Option<Vec<u8>> {
        self.payload
            .as_deref()
            .and_then(|p| BASE64.decode(p).ok())
    }
}

//! Wire protocol for peer sync exchanges.
//!
//! One envelope covers every transport: `{type, data, fromPeerId}` with the
//! sync payload carried as base64 so the same shape works over text and
//! binary channels. Binary transports use the bincode encoding; text
//! transports use the JSON form.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireKind {
    Sync,
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: WireKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "fromPeerId", default, skip_serializing_if = "Option::is_none")]
    pub from_peer: Option<Uuid>,
}

impl WireMessage {
    pub fn sync(from: Uuid, payload: &[u8]) -> Self {
        WireMessage {
            kind: WireKind::Sync,
            data: Some(BASE64.encode(payload)),
            from_peer: Some(from),
        }
    }

    pub fn join(from: Uuid) -> Self {
        WireMessage { kind: WireKind::Join, data: None, from_peer: Some(from) }
    }

    pub fn leave(from: Uuid) -> Self {
        WireMessage { kind: WireKind::Leave, data: None, from_peer: Some(from) }
    }

    /// Validate a sync envelope and extract its payload and sender. Anything
    /// missing makes the whole message invalid.
    pub fn sync_payload(&self) -> SyncResult<(Vec<u8>, Uuid)> {
        if self.kind != WireKind::Sync {
            return Err(SyncError::Malformed(format!("expected sync, got {:?}", self.kind)));
        }
        let from = self
            .from_peer
            .ok_or_else(|| SyncError::Malformed("sync message has no fromPeerId".into()))?;
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| SyncError::Malformed("sync message has no data".into()))?;
        Ok((BASE64.decode(data)?, from))
    }

    /// Binary encoding for binary transports.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(message, _)| message)
            .map_err(|e| SyncError::Codec(e.to_string()))
    }

    /// JSON form for text transports.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

//! Replicated document schema and the in-memory state structs hydrated from it.
//!
//! Field names are fixed by the interchange format (`stackIds`, `tokenSnapshot`,
//! `faceUp`, …) so JSON snapshots stay compatible across implementations.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::token::Token;

/// Milliseconds since the epoch, used for placement and lock timestamps.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One token placed in a zone. Owned by exactly one zone at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: String,
    #[serde(rename = "tokenId")]
    pub token_id: String,
    #[serde(rename = "tokenSnapshot")]
    pub token_snapshot: Token,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(rename = "faceUp", default)]
    pub face_up: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub ts: i64,
    #[serde(default)]
    pub reversed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Placement {
    /// Snapshot a token into a new placement at the given position.
    pub fn of(token: &Token, x: f64, y: f64, face_up: bool) -> Self {
        Placement {
            id: uuid::Uuid::new_v4().to_string(),
            token_id: token.id.clone(),
            token_snapshot: token.sanitized(),
            x,
            y,
            face_up,
            label: token.label.clone(),
            ts: now_millis(),
            reversed: token.reversed.unwrap_or(false),
            tags: Vec::new(),
        }
    }
}

/// Draw pile. The **tail** of `stack` is the top of the pile; `drawn` and
/// `discards` are append-only histories in draw order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PileState {
    #[serde(default)]
    pub stack: Vec<Token>,
    #[serde(default)]
    pub drawn: Vec<Token>,
    #[serde(default)]
    pub discards: Vec<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReshuffleMode {
    #[default]
    Auto,
    Manual,
}

/// When a source's live sequence drops to `threshold` or fewer tokens in
/// `Auto` mode, the remaining tokens are re-permuted inside the same change
/// that performed the triggering draw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReshufflePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
    #[serde(default)]
    pub mode: ReshuffleMode,
}

/// A source blends several piles' tokens into one draw sequence. After
/// composition it is independent of the piles; `stack_ids` only records
/// which piles contributed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    #[serde(rename = "stackIds", default)]
    pub pile_ids: Vec<String>,
    #[serde(default)]
    pub tokens: Vec<Token>,
    #[serde(default)]
    pub burned: Vec<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
    #[serde(rename = "reshufflePolicy", default)]
    pub reshuffle_policy: ReshufflePolicy,
}

/// Zone name → placements, bottom-to-top (tail renders on top).
pub type Zones = HashMap<String, Vec<Placement>>;

/// Everything hydrated from the replicated document. `extra` preserves
/// sections written by other subsystems; the core round-trips them untouched
/// and never interprets them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableState {
    #[serde(default)]
    pub zones: Zones,
    #[serde(default)]
    pub pile: PileState,
    #[serde(default)]
    pub source: SourceState,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Advisory zone lock. Process-local: held in `ZoneMap`, never written into
/// the replicated document. It does travel inside the accelerated backend's
/// zone snapshot interchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneLock {
    #[serde(default)]
    pub locked: bool,
    #[serde(rename = "lockedAt", default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<i64>,
    #[serde(rename = "lockedBy", default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
}

/// Accelerated-backend interchange for the zone map: placements plus the
/// advisory lock per zone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZonesSnapshot {
    pub zones: HashMap<String, ZoneSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    #[serde(default)]
    pub placements: Vec<Placement>,
    #[serde(default)]
    pub lock: ZoneLock,
}

impl ZonesSnapshot {
    pub fn from_parts(zones: &Zones, locks: &HashMap<String, ZoneLock>) -> Self {
        let zones = zones
            .iter()
            .map(|(name, placements)| {
                (
                    name.clone(),
                    ZoneSnapshot {
                        placements: placements.clone(),
                        lock: locks.get(name).cloned().unwrap_or_default(),
                    },
                )
            })
            .collect();
        ZonesSnapshot { zones }
    }

    pub fn into_zones(self) -> Zones {
        self.zones
            .into_iter()
            .map(|(name, zone)| (name, zone.placements))
            .collect()
    }
}

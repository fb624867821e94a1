//! The replicated document store.
//!
//! `ReplicatedStore` wraps one conflict-free document and is the only place
//! that touches the engine directly. Collections express every mutation as a
//! [`ReplicatedStore::change`]: hydrate a typed draft of the document, run the
//! mutator, and write back only the sections the mutator actually touched.
//! Writing per section keeps concurrent edits to different sections merge-safe.
//!
//! Every committed change fans out a [`StateChanged`] carrying the new
//! document and an [`Origin`] tag. The tag exists solely so the sync layer
//! can avoid echoing a change back to the peer it came from; it is never
//! persisted into the document.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use automerge::transaction::Transactable;
use automerge::{Automerge, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::state::{
    Placement, PileState, ReshuffleMode, ReshufflePolicy, SourceState, TableState, Zones,
};
use crate::token::Token;

const CHANGE_CAPACITY: usize = 64;

/// Document sections owned by this crate; everything else at the root is a
/// foreign section, preserved but never interpreted.
const SECTION_KEYS: [&str; 3] = ["pile", "zones", "source"];

/// Where a committed document version came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A collection operation in this process.
    Local,
    /// Applied from a sync exchange with the given peer.
    Peer(Uuid),
    /// A whole-document merge.
    Merge,
    /// Loaded from serialized bytes.
    Load,
    /// Flushed from the accelerated backend's snapshot.
    Accel,
}

impl Origin {
    pub fn is_peer(&self, id: Uuid) -> bool {
        matches!(self, Origin::Peer(p) if *p == id)
    }
}

/// One committed document version plus its origin tag.
#[derive(Clone)]
pub struct StateChanged {
    pub doc: Automerge,
    pub source: Origin,
}

pub struct ReplicatedStore {
    doc: Mutex<Automerge>,
    changes: broadcast::Sender<StateChanged>,
}

impl ReplicatedStore {
    pub fn new() -> Self {
        Self::with_doc(Automerge::new())
    }

    pub fn with_doc(doc: Automerge) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        ReplicatedStore { doc: Mutex::new(doc), changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChanged> {
        self.changes.subscribe()
    }

    /// Run one atomic mutation against a typed draft of the document.
    ///
    /// If the mutator returns an error nothing is committed. A mutator that
    /// leaves the draft untouched commits nothing and emits nothing. On
    /// success exactly one new version exists and one `StateChanged` with
    /// origin `Local` is emitted.
    pub fn change<T>(
        &self,
        label: &str,
        mutator: impl FnOnce(&mut TableState) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.change_tagged(label, Origin::Local, mutator)
    }

    /// Like [`change`](Self::change) but with an explicit origin tag.
    pub fn change_tagged<T>(
        &self,
        label: &str,
        origin: Origin,
        mutator: impl FnOnce(&mut TableState) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut doc = self.lock_doc();
        let before = read_table_state(&*doc)?;
        let mut draft = before.clone();
        let out = mutator(&mut draft)?;
        if draft != before {
            write_dirty_sections(&mut doc, &before, &draft)?;
            log::debug!("committed change '{}'", label);
            self.emit(&doc, origin);
        }
        Ok(out)
    }

    /// Replace the document wholesale and notify with the given origin.
    pub fn update(&self, doc: Automerge, origin: Origin) {
        let mut guard = self.lock_doc();
        *guard = doc;
        self.emit(&guard, origin);
    }

    /// Merge another replica's document into this one.
    pub fn merge(&self, other: &Automerge) -> CoreResult<()> {
        let mut incoming = other.clone();
        let mut doc = self.lock_doc();
        doc.merge(&mut incoming)?;
        self.emit(&doc, Origin::Merge);
        Ok(())
    }

    pub fn merge_bytes(&self, bytes: &[u8]) -> CoreResult<()> {
        let incoming = Automerge::load(bytes)?;
        self.merge(&incoming)
    }

    /// Serialize the full document, history included.
    pub fn save(&self) -> Vec<u8> {
        self.lock_doc().save()
    }

    pub fn load(&self, bytes: &[u8]) -> CoreResult<()> {
        let doc = Automerge::load(bytes)?;
        self.update(doc, Origin::Load);
        Ok(())
    }

    pub fn save_base64(&self) -> String {
        BASE64.encode(self.save())
    }

    pub fn load_base64(&self, encoded: &str) -> CoreResult<()> {
        let bytes = BASE64.decode(encoded)?;
        self.load(&bytes)
    }

    /// Lossy JSON export of the current state. Carries no history, so it
    /// cannot seed a merge-able replica; it exists for snapshot interchange
    /// and for callers that only need the values.
    pub fn snapshot_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(&self.state()?)?)
    }

    /// Hydrate the current state. Every call produces fresh deep copies.
    pub fn state(&self) -> CoreResult<TableState> {
        read_table_state(&*self.lock_doc())
    }

    /// A clone of the current document, for sync exchanges.
    pub fn doc(&self) -> Automerge {
        self.lock_doc().clone()
    }

    fn emit(&self, doc: &Automerge, origin: Origin) {
        let _ = self.changes.send(StateChanged { doc: doc.clone(), source: origin });
    }

    fn lock_doc(&self) -> MutexGuard<'_, Automerge> {
        // Poisoning only marks that another thread panicked mid-panic-unwind;
        // the doc itself is only mutated through committed transactions.
        self.doc.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ReplicatedStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Typed hydration: document -> TableState
// ---------------------------------------------------------------------------

fn read_table_state<D: ReadDoc>(doc: &D) -> CoreResult<TableState> {
    let mut state = TableState::default();

    if let Some((_, pile_obj)) = doc.get(ROOT, "pile")? {
        state.pile = read_pile(doc, &pile_obj)?;
    }
    if let Some((_, source_obj)) = doc.get(ROOT, "source")? {
        state.source = read_source(doc, &source_obj)?;
    }
    if let Some((_, zones_obj)) = doc.get(ROOT, "zones")? {
        state.zones = read_zones(doc, &zones_obj)?;
    }

    // Foreign sections: anything else at the root survives hydration as
    // plain JSON values.
    let foreign: Vec<String> = doc
        .map_range(ROOT, ..)
        .map(|item| item.key.to_string())
        .filter(|key| !SECTION_KEYS.contains(&key.as_str()))
        .collect();
    for key in foreign {
        if let Some((value, id)) = doc.get(ROOT, key.as_str())? {
            let json = match &value {
                Value::Scalar(s) => match s.as_ref() {
                    ScalarValue::Str(raw) => serde_json::from_str(raw.as_str())
                        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
                    other => scalar_to_json(other),
                },
                Value::Object(_) => read_json_value(doc, &value, &id)?,
            };
            state.extra.insert(key, json);
        }
    }

    Ok(state)
}

fn read_pile<D: ReadDoc>(doc: &D, obj: &ObjId) -> CoreResult<PileState> {
    let mut pile = PileState::default();
    if let Some((_, arr)) = doc.get(obj, "stack")? {
        pile.stack = read_token_list(doc, &arr)?;
    }
    if let Some((_, arr)) = doc.get(obj, "drawn")? {
        pile.drawn = read_token_list(doc, &arr)?;
    }
    if let Some((_, arr)) = doc.get(obj, "discards")? {
        pile.discards = read_token_list(doc, &arr)?;
    }
    pile.seed = read_string(doc, obj, "seed")?;
    Ok(pile)
}

fn read_source<D: ReadDoc>(doc: &D, obj: &ObjId) -> CoreResult<SourceState> {
    let mut source = SourceState::default();
    if let Some((_, arr)) = doc.get(obj, "stackIds")? {
        let len = doc.length(&arr);
        for i in 0..len {
            if let Some((Value::Scalar(s), _)) = doc.get(&arr, i)? {
                if let ScalarValue::Str(id) = s.as_ref() {
                    source.pile_ids.push(id.to_string());
                }
            }
        }
    }
    if let Some((_, arr)) = doc.get(obj, "tokens")? {
        source.tokens = read_token_list(doc, &arr)?;
    }
    if let Some((_, arr)) = doc.get(obj, "burned")? {
        source.burned = read_token_list(doc, &arr)?;
    }
    source.seed = read_string(doc, obj, "seed")?;
    if let Some((_, policy_obj)) = doc.get(obj, "reshufflePolicy")? {
        let threshold = read_i64(doc, &policy_obj, "threshold")?.map(|v| v.max(0) as u32);
        let mode = match read_string(doc, &policy_obj, "mode")?.as_deref() {
            Some("manual") => ReshuffleMode::Manual,
            _ => ReshuffleMode::Auto,
        };
        source.reshuffle_policy = ReshufflePolicy { threshold, mode };
    }
    Ok(source)
}

fn read_zones<D: ReadDoc>(doc: &D, obj: &ObjId) -> CoreResult<Zones> {
    let mut zones = Zones::new();
    let names: Vec<String> = doc.map_range(obj, ..).map(|item| item.key.to_string()).collect();
    for name in names {
        if let Some((_, arr)) = doc.get(obj, name.as_str())? {
            let len = doc.length(&arr);
            let mut placements = Vec::with_capacity(len);
            for i in 0..len {
                if let Some((_, p_obj)) = doc.get(&arr, i)? {
                    placements.push(read_placement(doc, &p_obj)?);
                }
            }
            zones.insert(name, placements);
        }
    }
    Ok(zones)
}

fn read_placement<D: ReadDoc>(doc: &D, obj: &ObjId) -> CoreResult<Placement> {
    let token_snapshot = match doc.get(obj, "tokenSnapshot")? {
        Some((_, snapshot_obj)) => read_token(doc, &snapshot_obj)?,
        None => Token::default(),
    };
    let tags = match read_string(doc, obj, "tags")? {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    Ok(Placement {
        id: read_string(doc, obj, "id")?.unwrap_or_default(),
        token_id: read_string(doc, obj, "tokenId")?.unwrap_or_default(),
        token_snapshot,
        x: read_f64(doc, obj, "x")?.unwrap_or(0.0),
        y: read_f64(doc, obj, "y")?.unwrap_or(0.0),
        face_up: read_bool(doc, obj, "faceUp")?.unwrap_or(false),
        label: read_string(doc, obj, "label")?,
        ts: read_i64(doc, obj, "ts")?.unwrap_or(0),
        reversed: read_bool(doc, obj, "reversed")?.unwrap_or(false),
        tags,
    })
}

fn read_token_list<D: ReadDoc>(doc: &D, arr: &ObjId) -> CoreResult<Vec<Token>> {
    let len = doc.length(arr);
    let mut tokens = Vec::with_capacity(len);
    for i in 0..len {
        if let Some((_, token_obj)) = doc.get(arr, i)? {
            tokens.push(read_token(doc, &token_obj)?);
        }
    }
    Ok(tokens)
}

fn read_token<D: ReadDoc>(doc: &D, obj: &ObjId) -> CoreResult<Token> {
    let meta = match read_string(doc, obj, "meta")? {
        Some(json) => serde_json::from_str(&json)?,
        None => HashMap::new(),
    };
    let tags = match read_string(doc, obj, "tags")? {
        Some(json) => Some(serde_json::from_str::<Vec<String>>(&json)?.into_iter().collect()),
        None => None,
    };
    let merged_from = match read_string(doc, obj, "mergedFrom")? {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };
    let split_into = match read_string(doc, obj, "splitInto")? {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    };
    Ok(Token {
        id: read_string(doc, obj, "id")?.unwrap_or_default(),
        label: read_string(doc, obj, "label")?,
        group: read_string(doc, obj, "group")?,
        text: read_string(doc, obj, "text")?.unwrap_or_default(),
        meta,
        kind: read_string(doc, obj, "kind")?.unwrap_or_else(|| "token".to_string()),
        index: read_i64(doc, obj, "index")?.unwrap_or(0),
        reversed: read_bool(doc, obj, "reversed")?,
        tags,
        attached_to: read_string(doc, obj, "attachedTo")?,
        attachment_type: read_string(doc, obj, "attachmentType")?,
        merged_into: read_string(doc, obj, "mergedInto")?,
        merged_from,
        split_into,
        split_from: read_string(doc, obj, "splitFrom")?,
    })
}

fn read_string<D: ReadDoc>(doc: &D, obj: &ObjId, key: &str) -> CoreResult<Option<String>> {
    match doc.get(obj, key)? {
        Some((Value::Scalar(s), _)) => match s.as_ref() {
            ScalarValue::Str(v) => Ok(Some(v.to_string())),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

fn read_i64<D: ReadDoc>(doc: &D, obj: &ObjId, key: &str) -> CoreResult<Option<i64>> {
    match doc.get(obj, key)? {
        Some((Value::Scalar(s), _)) => match s.as_ref() {
            ScalarValue::Int(v) => Ok(Some(*v)),
            ScalarValue::Uint(v) => Ok(Some(*v as i64)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

fn read_f64<D: ReadDoc>(doc: &D, obj: &ObjId, key: &str) -> CoreResult<Option<f64>> {
    match doc.get(obj, key)? {
        Some((Value::Scalar(s), _)) => match s.as_ref() {
            ScalarValue::F64(v) => Ok(Some(*v)),
            ScalarValue::Int(v) => Ok(Some(*v as f64)),
            ScalarValue::Uint(v) => Ok(Some(*v as f64)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

fn read_bool<D: ReadDoc>(doc: &D, obj: &ObjId, key: &str) -> CoreResult<Option<bool>> {
    match doc.get(obj, key)? {
        Some((Value::Scalar(s), _)) => match s.as_ref() {
            ScalarValue::Boolean(v) => Ok(Some(*v)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

/// Generic hydration of a foreign document value into JSON.
fn read_json_value<D: ReadDoc>(doc: &D, value: &Value<'_>, id: &ObjId) -> CoreResult<serde_json::Value> {
    match value {
        Value::Object(ObjType::Map) | Value::Object(ObjType::Table) => {
            let keys: Vec<String> = doc.map_range(id, ..).map(|item| item.key.to_string()).collect();
            let mut map = serde_json::Map::new();
            for key in keys {
                if let Some((v, vid)) = doc.get(id, key.as_str())? {
                    map.insert(key, read_json_value(doc, &v, &vid)?);
                }
            }
            Ok(serde_json::Value::Object(map))
        }
        Value::Object(ObjType::List) => {
            let len = doc.length(id);
            let mut list = Vec::with_capacity(len);
            for i in 0..len {
                if let Some((v, vid)) = doc.get(id, i)? {
                    list.push(read_json_value(doc, &v, &vid)?);
                }
            }
            Ok(serde_json::Value::Array(list))
        }
        Value::Object(ObjType::Text) => Ok(serde_json::Value::String(doc.text(id)?)),
        Value::Scalar(s) => Ok(scalar_to_json(s.as_ref())),
    }
}

fn scalar_to_json(scalar: &ScalarValue) -> serde_json::Value {
    match scalar {
        ScalarValue::Str(v) => serde_json::Value::String(v.to_string()),
        ScalarValue::Int(v) => serde_json::json!(*v),
        ScalarValue::Uint(v) => serde_json::json!(*v),
        ScalarValue::F64(v) => serde_json::json!(*v),
        ScalarValue::Boolean(v) => serde_json::Value::Bool(*v),
        ScalarValue::Timestamp(v) => serde_json::json!(*v),
        ScalarValue::Null => serde_json::Value::Null,
        _ => serde_json::Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Write-back: TableState -> document, dirty sections only
// ---------------------------------------------------------------------------

/// Commit the differences between `before` and `after` in one transaction.
/// Only sections that changed are rewritten, and zones are diffed per zone,
/// so concurrent changes to different sections merge without clobbering.
fn write_dirty_sections(
    doc: &mut Automerge,
    before: &TableState,
    after: &TableState,
) -> CoreResult<()> {
    doc.transact::<_, _, CoreError>(|tx| {
        if after.pile != before.pile {
            let obj = tx.put_object(ROOT, "pile", ObjType::Map)?;
            write_token_list(tx, &obj, "stack", &after.pile.stack)?;
            write_token_list(tx, &obj, "drawn", &after.pile.drawn)?;
            write_token_list(tx, &obj, "discards", &after.pile.discards)?;
            if let Some(seed) = &after.pile.seed {
                tx.put(&obj, "seed", seed.as_str())?;
            }
        }
        if after.source != before.source {
            write_source(tx, &after.source)?;
        }
        if after.zones != before.zones {
            write_zones_diff(tx, &before.zones, &after.zones)?;
        }
        for (key, value) in &after.extra {
            if before.extra.get(key) != Some(value) {
                tx.put(ROOT, key.as_str(), serde_json::to_string(value)?)?;
            }
        }
        for key in before.extra.keys() {
            if !after.extra.contains_key(key) {
                tx.delete(ROOT, key.as_str())?;
            }
        }
        Ok(())
    })
    .map_err(|e| CoreError::Crdt(format!("transaction failed: {:?}", e)))?;
    Ok(())
}

fn write_source<T: Transactable>(tx: &mut T, source: &SourceState) -> CoreResult<()> {
    let obj = tx.put_object(ROOT, "source", ObjType::Map)?;
    let ids = tx.put_object(&obj, "stackIds", ObjType::List)?;
    for (i, id) in source.pile_ids.iter().enumerate() {
        tx.insert(&ids, i, id.as_str())?;
    }
    write_token_list(tx, &obj, "tokens", &source.tokens)?;
    write_token_list(tx, &obj, "burned", &source.burned)?;
    if let Some(seed) = &source.seed {
        tx.put(&obj, "seed", seed.as_str())?;
    }
    let policy = tx.put_object(&obj, "reshufflePolicy", ObjType::Map)?;
    if let Some(threshold) = source.reshuffle_policy.threshold {
        tx.put(&policy, "threshold", threshold as i64)?;
    }
    let mode = match source.reshuffle_policy.mode {
        ReshuffleMode::Auto => "auto",
        ReshuffleMode::Manual => "manual",
    };
    tx.put(&policy, "mode", mode)?;
    Ok(())
}

fn write_zones_diff<T: Transactable + ReadDoc>(
    tx: &mut T,
    before: &Zones,
    after: &Zones,
) -> CoreResult<()> {
    let zones_obj = match tx.get(ROOT, "zones")? {
        Some((Value::Object(ObjType::Map), id)) => id,
        _ => tx.put_object(ROOT, "zones", ObjType::Map)?,
    };
    for (name, placements) in after {
        if before.get(name) != Some(placements) {
            let arr = tx.put_object(&zones_obj, name.as_str(), ObjType::List)?;
            for (i, placement) in placements.iter().enumerate() {
                let p_obj = tx.insert_object(&arr, i, ObjType::Map)?;
                write_placement(tx, &p_obj, placement)?;
            }
        }
    }
    for name in before.keys() {
        if !after.contains_key(name) {
            tx.delete(&zones_obj, name.as_str())?;
        }
    }
    Ok(())
}

fn write_placement<T: Transactable>(tx: &mut T, obj: &ObjId, placement: &Placement) -> CoreResult<()> {
    tx.put(obj, "id", placement.id.as_str())?;
    tx.put(obj, "tokenId", placement.token_id.as_str())?;
    let snapshot_obj = tx.put_object(obj, "tokenSnapshot", ObjType::Map)?;
    write_token(tx, &snapshot_obj, &placement.token_snapshot)?;
    tx.put(obj, "x", placement.x)?;
    tx.put(obj, "y", placement.y)?;
    tx.put(obj, "faceUp", placement.face_up)?;
    if let Some(label) = &placement.label {
        tx.put(obj, "label", label.as_str())?;
    }
    tx.put(obj, "ts", placement.ts)?;
    tx.put(obj, "reversed", placement.reversed)?;
    if !placement.tags.is_empty() {
        tx.put(obj, "tags", serde_json::to_string(&placement.tags)?)?;
    }
    Ok(())
}

fn write_token_list<T: Transactable>(
    tx: &mut T,
    obj: &ObjId,
    key: &str,
    tokens: &[Token],
) -> CoreResult<()> {
    let arr = tx.put_object(obj, key, ObjType::List)?;
    for (i, token) in tokens.iter().enumerate() {
        let token_obj = tx.insert_object(&arr, i, ObjType::Map)?;
        write_token(tx, &token_obj, token)?;
    }
    Ok(())
}

fn write_token<T: Transactable>(tx: &mut T, obj: &ObjId, token: &Token) -> CoreResult<()> {
    tx.put(obj, "id", token.id.as_str())?;
    if let Some(label) = &token.label {
        tx.put(obj, "label", label.as_str())?;
    }
    if let Some(group) = &token.group {
        tx.put(obj, "group", group.as_str())?;
    }
    tx.put(obj, "text", token.text.as_str())?;
    tx.put(obj, "kind", token.kind.as_str())?;
    tx.put(obj, "index", token.index)?;
    if !token.meta.is_empty() {
        tx.put(obj, "meta", serde_json::to_string(&token.meta)?)?;
    }
    if let Some(reversed) = token.reversed {
        tx.put(obj, "reversed", reversed)?;
    }
    if let Some(tags) = &token.tags {
        // Canonical form: sorted, de-duplicated by the set itself.
        let mut list: Vec<&String> = tags.iter().collect();
        list.sort();
        tx.put(obj, "tags", serde_json::to_string(&list)?)?;
    }
    if let Some(v) = &token.attached_to {
        tx.put(obj, "attachedTo", v.as_str())?;
    }
    if let Some(v) = &token.attachment_type {
        tx.put(obj, "attachmentType", v.as_str())?;
    }
    if let Some(v) = &token.merged_into {
        tx.put(obj, "mergedInto", v.as_str())?;
    }
    if let Some(v) = &token.merged_from {
        tx.put(obj, "mergedFrom", serde_json::to_string(v)?)?;
    }
    if let Some(v) = &token.split_into {
        tx.put(obj, "splitInto", serde_json::to_string(v)?)?;
    }
    if let Some(v) = &token.split_from {
        tx.put(obj, "splitFrom", v.as_str())?;
    }
    Ok(())
}

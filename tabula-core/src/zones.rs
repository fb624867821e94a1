//! Named spatial zones holding token placements.
//!
//! Placement order within a zone is the z-order (tail on top). Zone locks are
//! advisory, process-local, and never replicated: a locked zone refuses
//! mutations softly (`Ok(None)` / `Ok(false)` plus a `LockRefused` event)
//! rather than erroring, since a peer may race a lock it cannot see.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{Backend, BackendKind, SnapshotEngine};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, TableEvent};
use crate::ops;
use crate::ops::zone::SpreadLayout;
use crate::pile::DrawSource;
use crate::state::{now_millis, Placement, ZoneLock, ZoneSnapshot, Zones, ZonesSnapshot};
use crate::store::{Origin, ReplicatedStore};
use crate::token::Token;

pub struct ZoneMap {
    store: Arc<ReplicatedStore>,
    events: EventBus,
    locks: HashMap<String, ZoneLock>,
    backend: Backend,
}

impl ZoneMap {
    pub fn new(store: Arc<ReplicatedStore>, events: EventBus) -> CoreResult<Self> {
        Self::with_backend(store, events, BackendKind::Reference)
    }

    pub fn with_backend(
        store: Arc<ReplicatedStore>,
        events: EventBus,
        kind: BackendKind,
    ) -> CoreResult<Self> {
        let locks = HashMap::new();
        let backend = match kind {
            BackendKind::Reference => Backend::Reference,
            BackendKind::Accelerated => {
                let snapshot = ZonesSnapshot::from_parts(&store.state()?.zones, &locks);
                Backend::Accelerated(SnapshotEngine::new(serde_json::to_string(&snapshot)?))
            }
        };
        Ok(ZoneMap { store, events, locks, backend })
    }

    // -- zone lifecycle -----------------------------------------------------

    /// Idempotent: creating an existing zone is a no-op that returns `false`.
    pub fn create_zone(&mut self, name: &str) -> CoreResult<bool> {
        let zone = name.to_string();
        let created = self.execute("zone:create", move |zones| {
            if zones.contains_key(&zone) {
                Ok(false)
            } else {
                zones.insert(zone.clone(), Vec::new());
                Ok(true)
            }
        })?;
        if created {
            self.events.emit(TableEvent::ZoneCreated { zone: name.to_string() });
        }
        Ok(created)
    }

    /// Idempotent: deleting an absent zone returns `false`. Drops the local
    /// lock entry as well.
    pub fn delete_zone(&mut self, name: &str) -> CoreResult<bool> {
        let zone = name.to_string();
        let deleted =
            self.execute("zone:delete", move |zones| Ok(zones.remove(&zone).is_some()))?;
        self.locks.remove(name);
        if deleted {
            self.events.emit(TableEvent::ZoneDeleted { zone: name.to_string() });
        }
        Ok(deleted)
    }

    /// Remove every placement from a zone, keeping the zone itself.
    pub fn clear_zone(&mut self, name: &str) -> CoreResult<bool> {
        if self.refuse_if_locked(name) {
            return Ok(false);
        }
        let zone = name.to_string();
        let cleared = self.execute("zone:clear", move |zones| match zones.get_mut(&zone) {
            Some(placements) if !placements.is_empty() => {
                placements.clear();
                Ok(true)
            }
            _ => Ok(false),
        })?;
        if cleared {
            self.events.emit(TableEvent::ZoneCleared { zone: name.to_string() });
        }
        Ok(cleared)
    }

    /// Clear every zone. Refused as a whole if any zone is locked.
    pub fn clear_all(&mut self) -> CoreResult<bool> {
        if let Some(locked) = self.locks.iter().find(|(_, lock)| lock.locked) {
            let zone = locked.0.clone();
            self.events.emit(TableEvent::LockRefused { zone });
            return Ok(false);
        }
        let cleared_zones = self.execute("zone:clear-all", |zones| {
            let mut cleared = Vec::new();
            for (name, placements) in zones.iter_mut() {
                if !placements.is_empty() {
                    placements.clear();
                    cleared.push(name.clone());
                }
            }
            Ok(cleared)
        })?;
        for zone in &cleared_zones {
            self.events.emit(TableEvent::ZoneCleared { zone: zone.clone() });
        }
        Ok(!cleared_zones.is_empty())
    }

    // -- locks (process-local) ----------------------------------------------

    pub fn lock_zone(&mut self, name: &str, by: Option<&str>) {
        let lock = self.locks.entry(name.to_string()).or_default();
        lock.locked = true;
        lock.locked_at = Some(now_millis());
        lock.locked_by = by.map(str::to_string);
        self.events.emit(TableEvent::ZoneLocked { zone: name.to_string() });
    }

    pub fn unlock_zone(&mut self, name: &str) {
        if let Some(lock) = self.locks.get_mut(name) {
            *lock = ZoneLock::default();
        }
        self.events.emit(TableEvent::ZoneUnlocked { zone: name.to_string() });
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.locks.get(name).is_some_and(|lock| lock.locked)
    }

    // -- placements ---------------------------------------------------------

    /// Place a token snapshot into a zone. A token without an id is a
    /// pre-condition error; a locked zone is a soft refusal.
    pub fn place(
        &mut self,
        zone: &str,
        token: &Token,
        x: f64,
        y: f64,
        face_up: bool,
    ) -> CoreResult<Option<Placement>> {
        if token.id.is_empty() {
            return Err(CoreError::MissingTokenId);
        }
        if self.refuse_if_locked(zone) {
            return Ok(None);
        }
        let placement = Placement::of(token, x, y, face_up);
        let stored = placement.clone();
        let zone_name = zone.to_string();
        self.execute("zone:place", move |zones| {
            ops::zone::place(zones, &zone_name, stored.clone());
            Ok(())
        })?;
        self.events.emit(TableEvent::Place {
            zone: zone.to_string(),
            placement_id: placement.id.clone(),
        });
        Ok(Some(placement))
    }

    /// Remove a placement by id. Missing placements are soft (`Ok(None)`).
    pub fn take(&mut self, zone: &str, placement_id: &str) -> CoreResult<Option<Placement>> {
        if self.refuse_if_locked(zone) {
            return Ok(None);
        }
        let zone_name = zone.to_string();
        let id = placement_id.to_string();
        let taken =
            self.execute("zone:take", move |zones| Ok(ops::zone::take(zones, &zone_name, &id)))?;
        match &taken {
            Some(placement) => self.events.emit(TableEvent::Remove {
                zone: zone.to_string(),
                placement_id: placement.id.clone(),
            }),
            None => self.events.emit(TableEvent::PlacementMissing {
                zone: zone.to_string(),
                placement_id: placement_id.to_string(),
            }),
        }
        Ok(taken)
    }

    /// Move a placement between zones as one atomic change: no committed
    /// version ever shows the placement in both zones or neither.
    pub fn move_placement(
        &mut self,
        placement_id: &str,
        from: &str,
        to: &str,
        position: Option<(f64, f64)>,
    ) -> CoreResult<Option<Placement>> {
        if self.refuse_if_locked(from) || self.refuse_if_locked(to) {
            return Ok(None);
        }
        let id = placement_id.to_string();
        let from_zone = from.to_string();
        let to_zone = to.to_string();
        let moved = self.execute("zone:move", move |zones| {
            let mut placement = match ops::zone::take(zones, &from_zone, &id) {
                Some(placement) => placement,
                None => return Ok(None),
            };
            if let Some((x, y)) = position {
                placement.x = x;
                placement.y = y;
            }
            ops::zone::place(zones, &to_zone, placement.clone());
            Ok(Some(placement))
        })?;
        match &moved {
            Some(placement) => self.events.emit(TableEvent::Move {
                placement_id: placement.id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            }),
            None => self.events.emit(TableEvent::PlacementMissing {
                zone: from.to_string(),
                placement_id: placement_id.to_string(),
            }),
        }
        Ok(moved)
    }

    /// Set or toggle a placement's face. Returns the new face.
    pub fn flip(
        &mut self,
        zone: &str,
        placement_id: &str,
        face_up: Option<bool>,
    ) -> CoreResult<Option<bool>> {
        if self.refuse_if_locked(zone) {
            return Ok(None);
        }
        let zone_name = zone.to_string();
        let id = placement_id.to_string();
        let flipped = self.execute("zone:flip", move |zones| {
            Ok(ops::zone::flip(zones, &zone_name, &id, face_up))
        })?;
        match flipped {
            Some(face_up) => self.events.emit(TableEvent::Flip {
                zone: zone.to_string(),
                placement_id: placement_id.to_string(),
                face_up,
            }),
            None => self.events.emit(TableEvent::PlacementMissing {
                zone: zone.to_string(),
                placement_id: placement_id.to_string(),
            }),
        }
        Ok(flipped)
    }

    /// Move every placement from one zone to another, preserving order.
    pub fn transfer_zone(&mut self, from: &str, to: &str) -> CoreResult<usize> {
        if self.refuse_if_locked(from) || self.refuse_if_locked(to) {
            return Ok(0);
        }
        let from_zone = from.to_string();
        let to_zone = to.to_string();
        let count = self.execute("zone:transfer", move |zones| {
            Ok(ops::zone::transfer(zones, &from_zone, &to_zone))
        })?;
        if count > 0 {
            self.events.emit(TableEvent::Transfer {
                from: from.to_string(),
                to: to.to_string(),
                count,
            });
        }
        Ok(count)
    }

    pub fn shuffle_zone(&mut self, zone: &str, seed: Option<&str>) -> CoreResult<bool> {
        if self.refuse_if_locked(zone) {
            return Ok(false);
        }
        let zone_name = zone.to_string();
        let seed_owned = seed.map(str::to_string);
        let shuffled = self.execute("zone:shuffle", move |zones| {
            Ok(ops::zone::shuffle(zones, &zone_name, seed_owned.as_deref()))
        })?;
        if shuffled {
            self.events.emit(TableEvent::Shuffle { seed: seed.map(str::to_string) });
        }
        Ok(shuffled)
    }

    /// Lay the zone's placements out along a line or an arc.
    pub fn spread_zone(&mut self, zone: &str, layout: &SpreadLayout) -> CoreResult<bool> {
        if self.refuse_if_locked(zone) {
            return Ok(false);
        }
        let zone_name = zone.to_string();
        let layout = layout.clone();
        self.execute("zone:spread", move |zones| Ok(ops::zone::spread(zones, &zone_name, &layout)))
    }

    /// Collapse the zone onto `(x, y)` with a per-index nudge of `(dx, dy)`.
    pub fn stack_zone(&mut self, zone: &str, x: f64, y: f64, dx: f64, dy: f64) -> CoreResult<bool> {
        if self.refuse_if_locked(zone) {
            return Ok(false);
        }
        let zone_name = zone.to_string();
        self.execute("zone:stack", move |zones| {
            Ok(ops::zone::stack_at(zones, &zone_name, x, y, dx, dy))
        })
    }

    /// Draw `count` tokens from any draw source and place them into a zone
    /// laid out along `layout`. The draw is the source's own atomic change;
    /// the placements land in one change here.
    pub fn deal_spread(
        &mut self,
        src: &mut dyn DrawSource,
        zone: &str,
        count: usize,
        layout: &SpreadLayout,
    ) -> CoreResult<Vec<Placement>> {
        if self.refuse_if_locked(zone) {
            return Ok(Vec::new());
        }
        let tokens = src.draw(count)?;
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let mut placements: Vec<Placement> =
            tokens.iter().map(|token| Placement::of(token, 0.0, 0.0, true)).collect();
        ops::zone::apply_layout(&mut placements, layout);

        let zone_name = zone.to_string();
        let stored = placements.clone();
        self.execute("zone:deal", move |zones| {
            for placement in &stored {
                ops::zone::place(zones, &zone_name, placement.clone());
            }
            Ok(())
        })?;
        for placement in &placements {
            self.events.emit(TableEvent::Place {
                zone: zone.to_string(),
                placement_id: placement.id.clone(),
            });
        }
        Ok(placements)
    }

    // -- reads --------------------------------------------------------------

    pub fn placements(&mut self, zone: &str) -> CoreResult<Vec<Placement>> {
        Ok(self.zones()?.remove(zone).unwrap_or_default())
    }

    pub fn count(&mut self, zone: &str) -> CoreResult<usize> {
        Ok(self.zones()?.get(zone).map_or(0, Vec::len))
    }

    pub fn has_zone(&mut self, zone: &str) -> CoreResult<bool> {
        Ok(self.zones()?.contains_key(zone))
    }

    pub fn zone_names(&mut self) -> CoreResult<Vec<String>> {
        let mut names: Vec<String> = self.zones()?.into_keys().collect();
        names.sort();
        Ok(names)
    }

    /// Current zones plus local lock info, in the snapshot interchange shape.
    pub fn zones_snapshot(&mut self) -> CoreResult<ZonesSnapshot> {
        let zones = self.zones()?;
        Ok(ZonesSnapshot::from_parts(&zones, &self.locks))
    }

    fn zones(&mut self) -> CoreResult<Zones> {
        self.sync_backend()?;
        Ok(self.store.state()?.zones)
    }

    // -- backend plumbing ---------------------------------------------------

    fn execute<T>(
        &mut self,
        label: &str,
        op: impl Fn(&mut Zones) -> CoreResult<T>,
    ) -> CoreResult<T> {
        match &mut self.backend {
            Backend::Reference => self.store.change(label, |state| op(&mut state.zones)),
            Backend::Accelerated(engine) => {
                let wrapped = |snapshot: &mut ZonesSnapshot| {
                    let mut kept_locks: HashMap<String, ZoneLock> = snapshot
                        .zones
                        .iter()
                        .map(|(name, zone)| (name.clone(), zone.lock.clone()))
                        .collect();
                    let mut zones: Zones = std::mem::take(&mut snapshot.zones)
                        .into_iter()
                        .map(|(name, zone)| (name, zone.placements))
                        .collect();
                    let out = op(&mut zones)?;
                    snapshot.zones = zones
                        .into_iter()
                        .map(|(name, placements)| {
                            let lock = kept_locks.remove(&name).unwrap_or_default();
                            (name, ZoneSnapshot { placements, lock })
                        })
                        .collect();
                    Ok(out)
                };
                match engine.run(&wrapped) {
                    Ok(out) => Ok(out),
                    Err(err) if err.is_backend_fault() => {
                        log::warn!(
                            "accelerated backend failed on '{}': {}; retrying on reference path",
                            label,
                            err
                        );
                        let restored: Result<ZonesSnapshot, _> =
                            serde_json::from_str(engine.snapshot());
                        let out = match restored {
                            Ok(snapshot) => self.store.change(label, |state| {
                                state.zones = snapshot.clone().into_zones();
                                op(&mut state.zones)
                            })?,
                            Err(_) => self.store.change(label, |state| op(&mut state.zones))?,
                        };
                        let fresh = ZonesSnapshot::from_parts(&self.store.state()?.zones, &self.locks);
                        engine.replace(serde_json::to_string(&fresh)?);
                        Ok(out)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    fn sync_backend(&mut self) -> CoreResult<()> {
        if let Backend::Accelerated(engine) = &mut self.backend {
            if engine.is_dirty() {
                let snapshot: ZonesSnapshot = serde_json::from_str(engine.snapshot())
                    .map_err(|e| CoreError::Snapshot(e.to_string()))?;
                let zones = snapshot.into_zones();
                self.store.change_tagged("zone:flush", Origin::Accel, move |state| {
                    state.zones = zones;
                    Ok(())
                })?;
                engine.mark_clean();
            }
        }
        Ok(())
    }

    fn refuse_if_locked(&self, zone: &str) -> bool {
        if self.is_locked(zone) {
            self.events.emit(TableEvent::LockRefused { zone: zone.to_string() });
            return true;
        }
        false
    }
}

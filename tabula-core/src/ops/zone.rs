//! Zone-map transformations. Lock policy lives in the `ZoneMap` component;
//! these functions only reshape placements.

use crate::rng::shuffle_slice;
use crate::state::{Placement, Zones};

/// How `spread` lays a zone's placements out.
#[derive(Debug, Clone, PartialEq)]
pub enum SpreadLayout {
    /// Evenly spaced along one axis from `(x, y)`.
    Linear { x: f64, y: f64, spacing: f64, horizontal: bool },
    /// Along a circle of `radius` around `(x, y)`, `step_deg` apart.
    Arc { x: f64, y: f64, radius: f64, start_deg: f64, step_deg: f64 },
}

/// Append a placement, creating the zone if needed.
pub fn place(zones: &mut Zones, zone: &str, placement: Placement) {
    zones.entry(zone.to_string()).or_default().push(placement);
}

/// Remove a placement by id. `None` when the zone or the id is absent.
pub fn take(zones: &mut Zones, zone: &str, placement_id: &str) -> Option<Placement> {
    let placements = zones.get_mut(zone)?;
    let pos = placements.iter().position(|p| p.id == placement_id)?;
    Some(placements.remove(pos))
}

/// Set or toggle a placement's face. Returns the new face, `None` if absent.
pub fn flip(zones: &mut Zones, zone: &str, placement_id: &str, face_up: Option<bool>) -> Option<bool> {
    let placement = zones
        .get_mut(zone)?
        .iter_mut()
        .find(|p| p.id == placement_id)?;
    placement.face_up = face_up.unwrap_or(!placement.face_up);
    Some(placement.face_up)
}

/// Permute a zone's placement order (z-order).
pub fn shuffle(zones: &mut Zones, zone: &str, seed: Option<&str>) -> bool {
    match zones.get_mut(zone) {
        Some(placements) => {
            shuffle_slice(placements, seed);
            true
        }
        None => false,
    }
}

/// Move every placement from one zone to another, preserving order. Returns
/// how many moved.
pub fn transfer(zones: &mut Zones, from: &str, to: &str) -> usize {
    if from == to {
        return 0;
    }
    let moved = match zones.get_mut(from) {
        Some(placements) => std::mem::take(placements),
        None => return 0,
    };
    let n = moved.len();
    zones.entry(to.to_string()).or_default().extend(moved);
    n
}

/// Reposition a zone's placements along a layout, in sequence order.
pub fn spread(zones: &mut Zones, zone: &str, layout: &SpreadLayout) -> bool {
    match zones.get_mut(zone) {
        Some(placements) => {
            apply_layout(placements, layout);
            true
        }
        None => false,
    }
}

/// Collapse a zone onto `(x, y)`, nudging each placement by its index times
/// `(dx, dy)` so the pile reads as stacked.
pub fn stack_at(zones: &mut Zones, zone: &str, x: f64, y: f64, dx: f64, dy: f64) -> bool {
    match zones.get_mut(zone) {
        Some(placements) => {
            for (i, placement) in placements.iter_mut().enumerate() {
                placement.x = x + dx * i as f64;
                placement.y = y + dy * i as f64;
            }
            true
        }
        None => false,
    }
}

pub fn apply_layout(placements: &mut [Placement], layout: &SpreadLayout) {
    match *layout {
        SpreadLayout::Linear { x, y, spacing, horizontal } => {
            for (i, placement) in placements.iter_mut().enumerate() {
                if horizontal {
                    placement.x = x + spacing * i as f64;
                    placement.y = y;
                } else {
                    placement.x = x;
                    placement.y = y + spacing * i as f64;
                }
            }
        }
        SpreadLayout::Arc { x, y, radius, start_deg, step_deg } => {
            for (i, placement) in placements.iter_mut().enumerate() {
                let theta = (start_deg + step_deg * i as f64).to_radians();
                placement.x = x + radius * theta.cos();
                placement.y = y + radius * theta.sin();
            }
        }
    }
}

//! Notification bus for collection operations.
//!
//! Events are advisory. Correctness never depends on them, so sending into a
//! bus with no subscribers is fine and the send result is discarded.

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    /// Tokens left the top of a pile or source.
    Draw { count: usize },
    /// A draw found nothing to take.
    PileEmpty,
    Shuffle { seed: Option<String> },
    Burn { count: usize },
    Cut { position: usize },
    /// A positional op received an index outside the live sequence.
    InvalidIndex { index: i64 },
    Reset,
    Place { zone: String, placement_id: String },
    Move { placement_id: String, from: String, to: String },
    Flip { zone: String, placement_id: String, face_up: bool },
    Remove { zone: String, placement_id: String },
    /// A zone op referenced a placement id that is not present.
    PlacementMissing { zone: String, placement_id: String },
    ZoneCreated { zone: String },
    ZoneDeleted { zone: String },
    ZoneCleared { zone: String },
    ZoneLocked { zone: String },
    ZoneUnlocked { zone: String },
    /// An op was refused because the zone is locked. Soft refusal, not an error.
    LockRefused { zone: String },
    Transfer { from: String, to: String, count: usize },
    /// A source's auto-reshuffle policy fired.
    SourceReshuffled { remaining: usize },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TableEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TableEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TableEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(TableEvent::PileEmpty);
    }

    #[test]
    fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(TableEvent::Draw { count: 3 });
        bus.emit(TableEvent::PileEmpty);
        assert_eq!(rx.try_recv().unwrap(), TableEvent::Draw { count: 3 });
        assert_eq!(rx.try_recv().unwrap(), TableEvent::PileEmpty);
    }
}

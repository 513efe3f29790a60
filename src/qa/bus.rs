//! Per-room broadcast fan-out.
//!
//! Each room gets its own `tokio::sync::broadcast` channel, so one busy room
//! never backs up another. Delivery reaches whoever is subscribed at publish
//! time and nobody else; durability is the question log's job, replayed via
//! the snapshot on connect.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};

use super::events::RoomEvent;

/// Slow subscribers that fall this far behind start skipping events
/// (`RecvError::Lagged`).
const ROOM_CAPACITY: usize = 256;

#[derive(Clone, Default)]
pub struct RoomBus {
    rooms: Arc<RwLock<HashMap<String, broadcast::Sender<RoomEvent>>>>,
}

impl RoomBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a room. The subscription ends when the returned receiver is
    /// dropped; call [`RoomBus::prune`] afterwards to release the room entry.
    pub async fn subscribe(&self, room: &str) -> broadcast::Receiver<RoomEvent> {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_owned())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    /// Deliver an event to every current subscriber of `room`. Returns how
    /// many subscribers received it; an unknown or empty room is a no-op.
    pub async fn publish(&self, room: &str, event: RoomEvent) -> usize {
        let rooms = self.rooms.read().await;
        match rooms.get(room) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop a room's channel once its last subscriber is gone. Harmless
    /// while subscribers remain.
    pub async fn prune(&self, room: &str) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room).is_some_and(|tx| tx.receiver_count() == 0) {
            rooms.remove(room);
        }
    }

    #[cfg(test)]
    pub(crate) async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

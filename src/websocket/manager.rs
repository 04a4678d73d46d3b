use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::models::websocket::ServerEvent;

pub type Outbox = UnboundedSender<Utf8Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Live connections and the chat rooms they are subscribed to. Rooms are
/// local to this process.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    // room key -> (connection -> outbox)
    rooms: Arc<DashMap<String, DashMap<ConnectionId, Outbox>>>,
    // connection -> outbox, plus the rooms it joined
    connections: Arc<DashMap<ConnectionId, (Outbox, HashSet<String>)>>,
    next_id: Arc<AtomicU64>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_key(chat_id: Uuid) -> String {
        format!("chat:{}", chat_id)
    }

    pub fn register(&self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(id, (outbox, HashSet::new()));
        id
    }

    /// Drops the connection from every room it joined.
    pub fn unregister(&self, connection: ConnectionId) {
        if let Some((_, (_, rooms))) = self.connections.remove(&connection) {
            for room in rooms {
                self.remove_from_room(&room, connection);
            }
        }
        tracing::debug!(%connection, "connection unregistered");
    }

    pub fn join(&self, connection: ConnectionId, chat_id: Uuid) -> bool {
        let room = Self::room_key(chat_id);
        let Some(mut entry) = self.connections.get_mut(&connection) else {
            return false;
        };
        let outbox = entry.0.clone();
        entry.1.insert(room.clone());
        drop(entry);

        self.rooms.entry(room).or_default().insert(connection, outbox);
        true
    }

    pub fn leave(&self, connection: ConnectionId, chat_id: Uuid) {
        let room = Self::room_key(chat_id);
        if let Some(mut entry) = self.connections.get_mut(&connection) {
            entry.1.remove(&room);
        }
        self.remove_from_room(&room, connection);
    }

    fn remove_from_room(&self, room: &str, connection: ConnectionId) {
        if let Some(members) = self.rooms.get(room) {
            members.remove(&connection);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    pub fn is_member(&self, connection: ConnectionId, chat_id: Uuid) -> bool {
        self.rooms
            .get(&Self::room_key(chat_id))
            .is_some_and(|members| members.contains_key(&connection))
    }

    pub fn room_size(&self, chat_id: Uuid) -> usize {
        self.rooms
            .get(&Self::room_key(chat_id))
            .map_or(0, |members| members.len())
    }

    /// Serializes `event` once and queues it for every connection in the
    /// chat's room except `exclude`. Returns how many connections it reached.
    pub fn broadcast(&self, chat_id: Uuid, event: &ServerEvent, exclude: Option<ConnectionId>) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let room = Self::room_key(chat_id);
        let mut dead = Vec::new();
        let mut delivered = 0;
        if let Some(members) = self.rooms.get(&room) {
            for member in members.iter() {
                if Some(*member.key()) == exclude {
                    continue;
                }
                if member.value().send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*member.key());
                }
            }
        }

        for connection in dead {
            // Writer task is gone; the reader will unregister it shortly.
            self.remove_from_room(&room, connection);
        }
        delivered
    }

    pub fn send_to(&self, connection: ConnectionId, event: &ServerEvent) -> bool {
        let Some(frame) = encode(event) else {
            return false;
        };
        self.connections
            .get(&connection)
            .is_some_and(|entry| entry.0.send(frame).is_ok())
    }
}

fn encode(event: &ServerEvent) -> Option<Utf8Bytes> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Utf8Bytes::from(json)),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn connect(registry: &RoomRegistry) -> (ConnectionId, UnboundedReceiver<Utf8Bytes>) {
        let (tx, rx) = unbounded_channel();
        (registry.register(tx), rx)
    }

    fn joined(user_id: Uuid) -> ServerEvent {
        ServerEvent::UserJoined { user_id }
    }

    #[test]
    fn broadcast_reaches_room_members_only() {
        let registry = RoomRegistry::new();
        let chat = Uuid::new_v4();
        let (a, mut rx_a) = connect(&registry);
        let (b, mut rx_b) = connect(&registry);
        let (_c, mut rx_c) = connect(&registry);
        registry.join(a, chat);
        registry.join(b, chat);

        assert_eq!(registry.broadcast(chat, &joined(Uuid::nil()), None), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn broadcast_can_skip_the_sender() {
        let registry = RoomRegistry::new();
        let chat = Uuid::new_v4();
        let (a, mut rx_a) = connect(&registry);
        let (b, mut rx_b) = connect(&registry);
        registry.join(a, chat);
        registry.join(b, chat);

        assert_eq!(registry.broadcast(chat, &joined(Uuid::nil()), Some(a)), 1);
        assert!(rx_a.try_recv().is_err());
        let frame = rx_b.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.as_str()).unwrap();
        assert_eq!(value["event"], "chat:join");
    }

    #[test]
    fn unregister_leaves_every_room() {
        let registry = RoomRegistry::new();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, _rx) = connect(&registry);
        registry.join(a, first);
        registry.join(a, second);
        assert!(registry.is_member(a, first));

        registry.unregister(a);
        assert_eq!(registry.room_size(first), 0);
        assert_eq!(registry.room_size(second), 0);
        assert!(!registry.join(a, first));
    }

    #[test]
    fn leave_keeps_other_rooms() {
        let registry = RoomRegistry::new();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, _rx) = connect(&registry);
        registry.join(a, first);
        registry.join(a, second);

        registry.leave(a, first);
        assert!(!registry.is_member(a, first));
        assert!(registry.is_member(a, second));
    }

    #[test]
    fn dead_connections_are_pruned() {
        let registry = RoomRegistry::new();
        let chat = Uuid::new_v4();
        let (a, rx_a) = connect(&registry);
        registry.join(a, chat);
        drop(rx_a);

        assert_eq!(registry.broadcast(chat, &joined(Uuid::nil()), None), 0);
        assert_eq!(registry.room_size(chat), 0);
    }
}

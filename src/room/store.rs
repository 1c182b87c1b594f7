//! Storage seam for room state. The registry only ever talks to a
//! `RoomStore`, so a persistent backend can replace the in-memory map
//! without touching protocol logic.

use std::collections::HashMap;

use super::state::Room;

pub trait RoomStore: Send {
    fn get(&self, room_id: &str) -> Option<Room>;
    fn create(&mut self, room: Room);
    /// Replace an existing room. Returns false if it does not exist.
    fn update(&mut self, room: Room) -> bool;
    fn delete(&mut self, room_id: &str) -> Option<Room>;
    fn list(&self) -> Vec<Room>;
}

#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    rooms: HashMap<String, Room>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoomStore for MemoryRoomStore {
    fn get(&self, room_id: &str) -> Option<Room> {
        self.rooms.get(room_id).cloned()
    }

    fn create(&mut self, room: Room) {
        self.rooms.insert(room.id.clone(), room);
    }

    fn update(&mut self, room: Room) -> bool {
        match self.rooms.get_mut(&room.id) {
            Some(slot) => {
                *slot = room;
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, room_id: &str) -> Option<Room> {
        self.rooms.remove(room_id)
    }

    fn list(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rooms
    }
}

impl<S: RoomStore + ?Sized> RoomStore for Box<S> {
    fn get(&self, room_id: &str) -> Option<Room> {
        (**self).get(room_id)
    }

    fn create(&mut self, room: Room) {
        (**self).create(room)
    }

    fn update(&mut self, room: Room) -> bool {
        (**self).update(room)
    }

    fn delete(&mut self, room_id: &str) -> Option<Room> {
        (**self).delete(room_id)
    }

    fn list(&self) -> Vec<Room> {
        (**self).list()
    }
}

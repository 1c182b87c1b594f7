//! Room registry: join / leave / settings rules over a [`RoomStore`].
//!
//! Every operation is synchronous and returns the events it caused, in the
//! order they must reach clients. The caller (the server hub) owns the only
//! instance and turns events into frames.

use serde_json::Value;
use tracing::{debug, info};

use crate::error::RoomError;

use super::password::PasswordHash;
use super::state::{CreationOptions, Room, RoomInfo, RoomSummary, SettingsPatch};
use super::store::{MemoryRoomStore, RoomStore};

/// Observable side effect of a registry operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// System line posted into the room.
    Notice { room_id: String, text: String },
    /// Fresh `roomInfo` for every member of the room.
    Snapshot {
        room_id: String,
        info: RoomInfo,
        update_id: Option<Value>,
    },
    /// The global room list changed; every connection gets `rooms`.
    ListChanged,
}

#[derive(Debug, Clone)]
pub struct RegistryLimits {
    pub max_username_chars: usize,
    pub max_room_id_chars: usize,
    pub max_name_chars: usize,
    pub default_capacity: usize,
    pub max_capacity: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_username_chars: 20,
            max_room_id_chars: 40,
            max_name_chars: 60,
            default_capacity: super::DEFAULT_CAPACITY,
            max_capacity: 50,
        }
    }
}

pub struct RoomRegistry<S: RoomStore = MemoryRoomStore> {
    store: S,
    limits: RegistryLimits,
}

impl RoomRegistry<MemoryRoomStore> {
    pub fn in_memory(limits: RegistryLimits) -> Self {
        Self::new(MemoryRoomStore::new(), limits)
    }
}

impl<S: RoomStore> RoomRegistry<S> {
    pub fn new(store: S, limits: RegistryLimits) -> Self {
        Self { store, limits }
    }

    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        self.store.list().iter().map(Room::summary).collect()
    }

    pub fn room_info(&self, room_id: &str) -> RoomInfo {
        self.store
            .get(room_id)
            .map(|r| r.info())
            .unwrap_or_else(|| RoomInfo::missing(room_id))
    }

    pub fn is_member(&self, room_id: &str, username: &str) -> bool {
        self.store
            .get(room_id)
            .is_some_and(|r| r.has_member(username))
    }

    pub fn join_room(
        &mut self,
        room_id: &str,
        identity: &str,
        password: Option<&str>,
        options: CreationOptions,
    ) -> Result<Vec<RoomEvent>, RoomError> {
        let room_id = validate_len(room_id, "Room id", self.limits.max_room_id_chars)?;
        let identity = validate_len(identity, "Username", self.limits.max_username_chars)?;

        let room = match self.store.get(&room_id) {
            Some(mut room) => {
                if room.has_member(&identity) {
                    return Err(RoomError::DuplicateIdentity { username: identity });
                }
                if room.is_full() {
                    return Err(RoomError::RoomFull {
                        capacity: room.max_participants,
                    });
                }
                if room.locked && !password_matches(room.password.as_ref(), password) {
                    return Err(RoomError::Auth("Incorrect room password".into()));
                }
                room.add_member(&identity)?;
                self.store.update(room.clone());
                room
            }
            None => {
                let options = self.creation_options(options)?;
                let hash = options
                    .password
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .map(PasswordHash::new);
                let mut room = Room::new(room_id.clone(), identity.clone(), options, hash);
                room.add_member(&identity)?;
                self.store.create(room.clone());
                info!(room = %room_id, owner = %identity, capacity = room.max_participants, "Room created");
                room
            }
        };

        info!(room = %room_id, user = %identity, count = room.members.len(), "User joined room");
        Ok(vec![
            RoomEvent::Notice {
                room_id: room_id.clone(),
                text: format!("{identity} joined the room"),
            },
            RoomEvent::Snapshot {
                room_id,
                info: room.info(),
                update_id: None,
            },
            RoomEvent::ListChanged,
        ])
    }

    /// Remove `identity` from the room. Unknown rooms or members are a no-op.
    pub fn leave_room(&mut self, room_id: &str, identity: &str) -> Vec<RoomEvent> {
        let Some(mut room) = self.store.get(room_id) else {
            return Vec::new();
        };
        if !room.remove_member(identity) {
            return Vec::new();
        }

        if room.members.is_empty() {
            self.store.delete(room_id);
            info!(room = %room_id, "Room deleted (empty)");
            return vec![RoomEvent::ListChanged];
        }

        self.store.update(room.clone());
        info!(room = %room_id, user = %identity, count = room.members.len(), "User left room");
        vec![
            RoomEvent::Notice {
                room_id: room_id.to_string(),
                text: format!("{identity} left the room"),
            },
            RoomEvent::Snapshot {
                room_id: room_id.to_string(),
                info: room.info(),
                update_id: None,
            },
            RoomEvent::ListChanged,
        ]
    }

    pub fn update_settings(
        &mut self,
        room_id: &str,
        identity: &str,
        patch: SettingsPatch,
        update_id: Option<Value>,
    ) -> Result<Vec<RoomEvent>, RoomError> {
        let mut room = self.store.get(room_id).ok_or_else(|| RoomError::NotFound {
            room_id: room_id.to_string(),
        })?;
        if room.owner != identity {
            return Err(RoomError::Auth(
                "Only the room owner can change settings".into(),
            ));
        }

        // Validate everything first so a rejected patch never half-applies.
        let name = patch
            .name
            .as_deref()
            .map(|n| validate_len(n, "Room name", self.limits.max_name_chars))
            .transpose()?;
        if let Some(capacity) = patch.max_participants {
            self.check_capacity(capacity)?;
            if capacity < room.members.len() {
                return Err(RoomError::InvalidOperation(format!(
                    "Cannot reduce capacity to {capacity}: {} participants are present",
                    room.members.len()
                )));
            }
        }
        let password = match patch.password.as_deref() {
            Some("") => Some(None),
            Some(p) => Some(Some(PasswordHash::new(p))),
            None => None,
        };
        let has_password = match &password {
            Some(next) => next.is_some(),
            None => room.password.is_some(),
        };
        if patch.locked == Some(true) && !has_password {
            return Err(RoomError::InvalidOperation(
                "Cannot lock a room without a password".into(),
            ));
        }

        if let Some(name) = name {
            room.name = name;
        }
        if let Some(capacity) = patch.max_participants {
            room.max_participants = capacity;
        }
        if let Some(visibility) = patch.visibility {
            room.visibility = visibility;
        }
        if let Some(next) = password {
            room.locked = next.is_some();
            room.password = next;
        }
        if let Some(locked) = patch.locked {
            room.locked = locked;
        }

        self.store.update(room.clone());
        debug!(room = %room_id, locked = room.locked, capacity = room.max_participants, "Room settings updated");
        Ok(vec![
            RoomEvent::Snapshot {
                room_id: room_id.to_string(),
                info: room.info(),
                update_id,
            },
            RoomEvent::ListChanged,
        ])
    }

    fn creation_options(&self, mut options: CreationOptions) -> Result<CreationOptions, RoomError> {
        let capacity = options.max_participants.unwrap_or(self.limits.default_capacity);
        self.check_capacity(capacity)?;
        options.max_participants = Some(capacity);
        if let Some(name) = options.display_name.as_deref() {
            if !name.trim().is_empty() {
                options.display_name =
                    Some(validate_len(name, "Room name", self.limits.max_name_chars)?);
            }
        }
        Ok(options)
    }

    fn check_capacity(&self, capacity: usize) -> Result<(), RoomError> {
        if capacity == 0 || capacity > self.limits.max_capacity {
            return Err(RoomError::Validation(format!(
                "Capacity must be between 1 and {}",
                self.limits.max_capacity
            )));
        }
        Ok(())
    }
}

fn validate_len(value: &str, label: &str, max: usize) -> Result<String, RoomError> {
    let trimmed = value.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > max {
        return Err(RoomError::Validation(format!(
            "{label} must be between 1 and {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn password_matches(stored: Option<&PasswordHash>, supplied: Option<&str>) -> bool {
    match (stored, supplied) {
        (Some(hash), Some(candidate)) => hash.verify(candidate),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RoomRegistry {
        RoomRegistry::in_memory(RegistryLimits::default())
    }

    fn create(reg: &mut RoomRegistry, room: &str, owner: &str, capacity: usize, password: Option<&str>) {
        reg.join_room(
            room,
            owner,
            None,
            CreationOptions {
                max_participants: Some(capacity),
                password: password.map(str::to_string),
                ..Default::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn join_emits_notice_snapshot_and_list_in_order() {
        let mut reg = registry();
        let events = reg.join_room("r1", "A", None, CreationOptions::default()).unwrap();
        assert!(matches!(&events[0], RoomEvent::Notice { text, .. } if text == "A joined the room"));
        match &events[1] {
            RoomEvent::Snapshot { info, .. } => {
                assert_eq!(info.owner.as_deref(), Some("A"));
                assert_eq!(info.users, vec!["A"]);
                assert_eq!(info.max_participants, 10);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert_eq!(events[2], RoomEvent::ListChanged);
    }

    #[test]
    fn validation_bounds() {
        let mut reg = registry();
        let long_name = "x".repeat(21);
        let long_room = "r".repeat(41);
        for (room, user) in [("r1", ""), ("r1", long_name.as_str()), ("", "A"), (long_room.as_str(), "A")] {
            assert!(matches!(
                reg.join_room(room, user, None, CreationOptions::default()),
                Err(RoomError::Validation(_))
            ));
        }
        assert!(reg.join_room(&"r".repeat(40), &"u".repeat(20), None, CreationOptions::default()).is_ok());
    }

    #[test]
    fn full_room_rejects_without_mutation() {
        let mut reg = registry();
        create(&mut reg, "r1", "A", 2, None);
        reg.join_room("r1", "B", None, CreationOptions::default()).unwrap();
        assert_eq!(
            reg.join_room("r1", "C", None, CreationOptions::default()),
            Err(RoomError::RoomFull { capacity: 2 })
        );
        assert_eq!(reg.room_info("r1").users, vec!["A", "B"]);
    }

    #[test]
    fn duplicate_identity_rejected_without_side_effects() {
        let mut reg = registry();
        create(&mut reg, "r1", "A", 3, None);
        assert!(matches!(
            reg.join_room("r1", "A", None, CreationOptions::default()),
            Err(RoomError::DuplicateIdentity { .. })
        ));
        assert_eq!(reg.room_info("r1").count, 1);
    }

    #[test]
    fn last_leave_deletes_room() {
        let mut reg = registry();
        create(&mut reg, "r1", "A", 3, None);
        assert_eq!(reg.leave_room("r1", "A"), vec![RoomEvent::ListChanged]);
        assert!(reg.list_rooms().is_empty());
        assert!(!reg.room_info("r1").exists);
        assert!(reg.leave_room("r1", "A").is_empty());
    }

    #[test]
    fn recreated_room_forgets_previous_owner() {
        let mut reg = registry();
        create(&mut reg, "r1", "A", 3, Some("pw"));
        reg.leave_room("r1", "A");
        create(&mut reg, "r1", "B", 3, None);
        let info = reg.room_info("r1");
        assert_eq!(info.owner.as_deref(), Some("B"));
        assert!(!info.locked);
    }

    #[test]
    fn non_owner_cannot_update_settings() {
        let mut reg = registry();
        create(&mut reg, "r1", "A", 3, None);
        reg.join_room("r1", "B", None, CreationOptions::default()).unwrap();
        let before = reg.room_info("r1");
        let err = reg
            .update_settings(
                "r1",
                "B",
                SettingsPatch {
                    name: Some("mine".into()),
                    max_participants: Some(5),
                    ..Default::default()
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, RoomError::Auth(_)));
        assert_eq!(reg.room_info("r1"), before);
    }

    #[test]
    fn capacity_cannot_drop_below_occupancy() {
        let mut reg = registry();
        create(&mut reg, "r1", "A", 3, None);
        reg.join_room("r1", "B", None, CreationOptions::default()).unwrap();
        let patch = SettingsPatch {
            max_participants: Some(1),
            name: Some("renamed".into()),
            ..Default::default()
        };
        assert!(matches!(
            reg.update_settings("r1", "A", patch, None),
            Err(RoomError::InvalidOperation(_))
        ));
        let info = reg.room_info("r1");
        assert_eq!(info.max_participants, 3);
        assert_eq!(info.name, "r1");
    }

    #[test]
    fn password_round_trip_and_unlock() {
        let mut reg = registry();
        create(&mut reg, "r1", "A", 5, Some("secret"));
        assert!(reg.room_info("r1").locked);
        assert!(matches!(
            reg.join_room("r1", "B", Some("wrong"), CreationOptions::default()),
            Err(RoomError::Auth(_))
        ));
        assert!(matches!(
            reg.join_room("r1", "B", None, CreationOptions::default()),
            Err(RoomError::Auth(_))
        ));
        reg.join_room("r1", "B", Some("secret"), CreationOptions::default())
            .unwrap();

        let events = reg
            .update_settings(
                "r1",
                "A",
                SettingsPatch {
                    password: Some(String::new()),
                    ..Default::default()
                },
                Some(Value::from(7)),
            )
            .unwrap();
        match &events[0] {
            RoomEvent::Snapshot { info, update_id, .. } => {
                assert!(!info.locked);
                assert_eq!(update_id, &Some(Value::from(7)));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        reg.join_room("r1", "C", None, CreationOptions::default()).unwrap();
    }

    #[test]
    fn locking_requires_a_password() {
        let mut reg = registry();
        create(&mut reg, "r1", "A", 5, None);
        let lock = SettingsPatch {
            locked: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            reg.update_settings("r1", "A", lock, None),
            Err(RoomError::InvalidOperation(_))
        ));
        let lock_with_password = SettingsPatch {
            locked: Some(true),
            password: Some("pw".into()),
            ..Default::default()
        };
        reg.update_settings("r1", "A", lock_with_password, None).unwrap();
        assert!(reg.room_info("r1").locked);
    }

    #[test]
    fn settings_on_missing_room_redirect() {
        let mut reg = registry();
        let err = reg
            .update_settings("nope", "A", SettingsPatch::default(), None)
            .unwrap_err();
        assert_eq!(err.redirect(), Some("/"));
    }
}

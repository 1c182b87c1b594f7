use serde::{Deserialize, Serialize};

use crate::error::RoomError;
use crate::protocol::Visibility;
use crate::room::password::PasswordHash;

/// Authoritative state of one chat room.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub name: String,
    /// Members in join order. Unique, case-sensitive.
    pub members: Vec<String>,
    pub max_participants: usize,
    pub locked: bool,
    pub password: Option<PasswordHash>,
    pub visibility: Visibility,
    pub owner: String,
    pub created_at: i64,
}

/// Options applied when a join creates the room.
#[derive(Debug, Clone, Default)]
pub struct CreationOptions {
    pub display_name: Option<String>,
    pub max_participants: Option<usize>,
    pub visibility: Option<Visibility>,
    pub password: Option<String>,
}

/// Partial settings update. `None` leaves a field untouched; an empty
/// password clears the lock.
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub name: Option<String>,
    pub max_participants: Option<usize>,
    pub locked: Option<bool>,
    pub visibility: Option<Visibility>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    pub count: usize,
    pub max_participants: usize,
    pub locked: bool,
    pub visibility: Visibility,
}

/// Full snapshot sent as `roomInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    pub count: usize,
    pub max_participants: usize,
    pub locked: bool,
    pub visibility: Visibility,
    pub exists: bool,
    pub owner: Option<String>,
    pub users: Vec<String>,
}

impl RoomInfo {
    /// Placeholder describing a room id that is not (or no longer) present.
    pub fn missing(room_id: &str) -> Self {
        Self {
            id: room_id.to_string(),
            name: room_id.to_string(),
            count: 0,
            max_participants: 0,
            locked: false,
            visibility: Visibility::Public,
            exists: false,
            owner: None,
            users: Vec::new(),
        }
    }
}

impl Room {
    pub fn new(id: String, owner: String, options: CreationOptions, password: Option<PasswordHash>) -> Self {
        let name = options
            .display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| id.clone());
        Self {
            locked: password.is_some(),
            id,
            name,
            members: Vec::new(),
            max_participants: options.max_participants.unwrap_or(super::DEFAULT_CAPACITY),
            password,
            visibility: options.visibility.unwrap_or_default(),
            owner,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_participants
    }

    pub fn has_member(&self, username: &str) -> bool {
        self.members.iter().any(|m| m == username)
    }

    pub fn add_member(&mut self, username: &str) -> Result<(), RoomError> {
        if self.has_member(username) {
            return Err(RoomError::DuplicateIdentity {
                username: username.to_string(),
            });
        }
        if self.is_full() {
            return Err(RoomError::RoomFull {
                capacity: self.max_participants,
            });
        }
        self.members.push(username.to_string());
        Ok(())
    }

    /// Remove a member. Returns false if they were not present.
    pub fn remove_member(&mut self, username: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != username);
        if self.members.len() == before {
            return false;
        }
        // Ownership passes to whoever has been here longest.
        if self.owner == username {
            if let Some(next) = self.members.first() {
                self.owner = next.clone();
            }
        }
        true
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            count: self.members.len(),
            max_participants: self.max_participants,
            locked: self.locked,
            visibility: self.visibility,
        }
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            count: self.members.len(),
            max_participants: self.max_participants,
            locked: self.locked,
            visibility: self.visibility,
            exists: true,
            owner: Some(self.owner.clone()),
            users: self.members.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(capacity: usize) -> Room {
        Room::new(
            "r1".into(),
            "alice".into(),
            CreationOptions {
                max_participants: Some(capacity),
                ..Default::default()
            },
            None,
        )
    }

    #[test]
    fn add_member_enforces_capacity_and_uniqueness() {
        let mut r = room(2);
        r.add_member("alice").unwrap();
        assert_eq!(
            r.add_member("alice"),
            Err(RoomError::DuplicateIdentity {
                username: "alice".into()
            })
        );
        r.add_member("Alice").unwrap();
        assert_eq!(r.add_member("bob"), Err(RoomError::RoomFull { capacity: 2 }));
        assert_eq!(r.members, vec!["alice", "Alice"]);
    }

    #[test]
    fn owner_leaving_hands_off_to_oldest_member() {
        let mut r = room(5);
        for m in ["alice", "bob", "carol"] {
            r.add_member(m).unwrap();
        }
        assert!(r.remove_member("alice"));
        assert_eq!(r.owner, "bob");
        assert!(!r.remove_member("alice"));
    }

    #[test]
    fn name_defaults_to_id() {
        let r = Room::new(
            "lobby".into(),
            "a".into(),
            CreationOptions {
                display_name: Some("   ".into()),
                ..Default::default()
            },
            None,
        );
        assert_eq!(r.name, "lobby");
        assert_eq!(r.max_participants, 10);
        assert!(!r.locked);
    }
}

//! Call-room membership for signaling relay. Holds no negotiation state;
//! it only knows which connection answers for which username.

use std::collections::{BTreeMap, HashMap};

use super::clients::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallMember {
    pub conn: ConnId,
    pub listener: bool,
}

/// A participant removed from a call room, and who should hear about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: String,
    pub username: String,
    pub remaining: Vec<ConnId>,
}

#[derive(Debug, Default)]
pub struct JoinOutcome {
    /// Existing participants to notify with `call-new-peer`.
    pub notify: Vec<ConnId>,
    /// Set when the connection was in a different call before.
    pub left: Option<Departure>,
    /// Set when a newer connection took over this username; the other
    /// participants must drop their connection to the old one.
    pub replaced: Option<Departure>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayReject {
    #[error("sender is not {from} in call {room_id}")]
    NotInCall { room_id: String, from: String },

    #[error("{to} is not in call {room_id}")]
    UnknownTarget { room_id: String, to: String },
}

#[derive(Debug, Default)]
pub struct CallRooms {
    rooms: HashMap<String, BTreeMap<String, CallMember>>,
    by_conn: HashMap<ConnId, (String, String)>,
}

impl CallRooms {
    pub fn join(&mut self, room_id: &str, username: &str, conn: ConnId, listener: bool) -> JoinOutcome {
        let mut outcome = JoinOutcome::default();
        if let Some((prev_room, prev_user)) = self.by_conn.get(&conn).cloned() {
            if prev_room != room_id || prev_user != username {
                outcome.left = self.leave(&prev_room, &prev_user, conn);
            }
        }

        let members = self.rooms.entry(room_id.to_string()).or_default();
        let stale = members.insert(username.to_string(), CallMember { conn, listener });
        outcome.notify = members
            .iter()
            .filter(|(name, _)| name.as_str() != username)
            .map(|(_, m)| m.conn)
            .collect();
        // A reconnecting participant replaces its stale entry.
        if let Some(stale) = stale.filter(|stale| stale.conn != conn) {
            self.by_conn.remove(&stale.conn);
            outcome.replaced = Some(Departure {
                room_id: room_id.to_string(),
                username: username.to_string(),
                remaining: outcome.notify.clone(),
            });
        }
        self.by_conn
            .insert(conn, (room_id.to_string(), username.to_string()));
        outcome
    }

    /// Resolve the target connection of a point-to-point signal.
    pub fn route(&self, room_id: &str, from: &str, to: &str, sender: ConnId) -> Result<ConnId, RelayReject> {
        match self.by_conn.get(&sender) {
            Some((room, user)) if room == room_id && user == from => {}
            _ => {
                return Err(RelayReject::NotInCall {
                    room_id: room_id.to_string(),
                    from: from.to_string(),
                })
            }
        }
        self.rooms
            .get(room_id)
            .and_then(|members| members.get(to))
            .map(|m| m.conn)
            .ok_or_else(|| RelayReject::UnknownTarget {
                room_id: room_id.to_string(),
                to: to.to_string(),
            })
    }

    /// Remove `username` if `conn` is the connection holding it.
    pub fn leave(&mut self, room_id: &str, username: &str, conn: ConnId) -> Option<Departure> {
        let members = self.rooms.get_mut(room_id)?;
        if members.get(username).map(|m| m.conn) != Some(conn) {
            return None;
        }
        members.remove(username);
        self.by_conn.remove(&conn);
        let remaining: Vec<ConnId> = members.values().map(|m| m.conn).collect();
        if members.is_empty() {
            self.rooms.remove(room_id);
        }
        Some(Departure {
            room_id: room_id.to_string(),
            username: username.to_string(),
            remaining,
        })
    }

    pub fn leave_conn(&mut self, conn: ConnId) -> Option<Departure> {
        let (room_id, username) = self.by_conn.get(&conn).cloned()?;
        self.leave(&room_id, &username, conn)
    }

    pub fn call_of(&self, conn: ConnId) -> Option<(&str, &str)> {
        self.by_conn
            .get(&conn)
            .map(|(room, user)| (room.as_str(), user.as_str()))
    }

    pub fn participants(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }
}

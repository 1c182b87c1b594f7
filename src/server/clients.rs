//! Live connections and their room bindings.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

pub type ConnId = u64;

/// Frames queued for one connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

/// Sending half of a connection. Never blocks: a full or closed queue
/// counts as a failed delivery.
#[derive(Debug, Clone)]
pub struct ClientSink {
    conn: ConnId,
    tx: mpsc::Sender<Outbound>,
}

impl ClientSink {
    pub fn new(conn: ConnId, tx: mpsc::Sender<Outbound>) -> Self {
        Self { conn, tx }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send_text(&self, text: &str) -> bool {
        self.push(Outbound::Text(text.to_string()))
    }

    pub fn ping(&self) -> bool {
        self.push(Outbound::Ping)
    }

    pub fn close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }

    fn push(&self, frame: Outbound) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn = self.conn, "Outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// The `(roomId, username)` a connection has joined as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub room_id: String,
    pub username: String,
}

impl Binding {
    pub fn new(room_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            username: username.into(),
        }
    }

    pub fn matches(&self, room_id: &str, username: &str) -> bool {
        self.room_id == room_id && self.username == username
    }
}

#[derive(Debug)]
struct ClientEntry {
    sink: ClientSink,
    binding: Option<Binding>,
    awaiting_pong: bool,
}

#[derive(Debug, Default)]
pub struct ClientDirectory {
    entries: HashMap<ConnId, ClientEntry>,
}

pub type SharedDirectory = Arc<RwLock<ClientDirectory>>;

/// Result of one liveness sweep.
#[derive(Debug, Default)]
pub struct Sweep {
    pub pinged: usize,
    /// Connections that never answered the previous ping.
    pub stale: Vec<ConnId>,
}

impl ClientDirectory {
    pub fn shared() -> SharedDirectory {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn insert(&mut self, sink: ClientSink) {
        self.entries.insert(
            sink.conn(),
            ClientEntry {
                sink,
                binding: None,
                awaiting_pong: false,
            },
        );
    }

    /// Forget a connection, returning its binding if it had one.
    pub fn remove(&mut self, conn: ConnId) -> Option<Option<Binding>> {
        self.entries.remove(&conn).map(|e| e.binding)
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.entries.contains_key(&conn)
    }

    pub fn sink(&self, conn: ConnId) -> Option<ClientSink> {
        self.entries.get(&conn).map(|e| e.sink.clone())
    }

    pub fn binding(&self, conn: ConnId) -> Option<Binding> {
        self.entries.get(&conn).and_then(|e| e.binding.clone())
    }

    /// Bind a connection to a room identity, returning the previous binding.
    pub fn bind(&mut self, conn: ConnId, binding: Binding) -> Option<Binding> {
        self.entries
            .get_mut(&conn)
            .and_then(|e| e.binding.replace(binding))
    }

    pub fn unbind(&mut self, conn: ConnId) -> Option<Binding> {
        self.entries.get_mut(&conn).and_then(|e| e.binding.take())
    }

    /// Open sinks of every connection bound to `room_id`.
    pub fn room_sinks(&self, room_id: &str) -> Vec<ClientSink> {
        self.entries
            .values()
            .filter(|e| e.binding.as_ref().is_some_and(|b| b.room_id == room_id))
            .filter(|e| e.sink.is_open())
            .map(|e| e.sink.clone())
            .collect()
    }

    pub fn all_sinks(&self) -> Vec<ClientSink> {
        self.entries
            .values()
            .filter(|e| e.sink.is_open())
            .map(|e| e.sink.clone())
            .collect()
    }

    pub fn mark_pong(&mut self, conn: ConnId) {
        if let Some(entry) = self.entries.get_mut(&conn) {
            entry.awaiting_pong = false;
        }
    }

    /// Ping every bound connection and report the ones that missed the last
    /// round.
    pub fn sweep(&mut self) -> Sweep {
        let mut sweep = Sweep::default();
        for (conn, entry) in self.entries.iter_mut() {
            if entry.binding.is_none() {
                continue;
            }
            if entry.awaiting_pong {
                sweep.stale.push(*conn);
                continue;
            }
            entry.awaiting_pong = true;
            if entry.sink.ping() {
                sweep.pinged += 1;
            }
        }
        sweep
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! The hub task: sole owner of the room registry and call tables.
//!
//! Connection tasks forward parsed frames as [`HubCommand`]s over one mpsc
//! channel; the hub handles them strictly in arrival order. Handlers never
//! await a socket, so one slow client cannot stall the rest.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::RoomError;
use crate::protocol::{ChatMessage, ClientMessage, FileAttachment, PeerSignal, ServerMessage};
use crate::room::{
    CreationOptions, MemoryRoomStore, RoomEvent, RoomRegistry, RoomStore, SettingsPatch,
};

use super::broadcast::{Broadcaster, RetryPolicy};
use super::clients::{Binding, ClientDirectory, ClientSink, ConnId, SharedDirectory};
use super::relay::{CallRooms, Departure};

#[derive(Debug)]
pub enum HubCommand {
    Connected { conn: ConnId, sink: ClientSink },
    Frame { conn: ConnId, text: String },
    /// The connection sent a frame beyond the configured size limit.
    Oversized { conn: ConnId },
    Pong { conn: ConnId },
    Disconnected { conn: ConnId },
}

pub struct Hub<S: RoomStore = MemoryRoomStore> {
    config: ServerConfig,
    registry: RoomRegistry<S>,
    calls: CallRooms,
    clients: SharedDirectory,
    broadcaster: Broadcaster<parking_lot::RwLock<ClientDirectory>>,
}

impl Hub<MemoryRoomStore> {
    pub fn new(config: ServerConfig) -> Self {
        let registry = RoomRegistry::in_memory(config.registry_limits());
        Self::with_registry(config, registry)
    }
}

impl<S: RoomStore> Hub<S> {
    pub fn with_registry(config: ServerConfig, registry: RoomRegistry<S>) -> Self {
        let clients = ClientDirectory::shared();
        let broadcaster = Broadcaster::new(Arc::clone(&clients), RetryPolicy::default());
        Self {
            config,
            registry,
            calls: CallRooms::default(),
            clients,
            broadcaster,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>, shutdown: CancellationToken) {
        let mut heartbeat = self.config.heartbeat().map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = async {
                    match heartbeat.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => self.heartbeat(),
            }
        }

        for sink in self.clients.read().all_sinks() {
            sink.close();
        }
        info!("Hub stopped");
    }

    pub fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connected { conn, sink } => {
                self.clients.write().insert(sink);
                debug!(conn, "Connection registered");
            }
            HubCommand::Frame { conn, text } => self.on_frame(conn, &text),
            HubCommand::Oversized { conn } => self.on_oversized(conn),
            HubCommand::Pong { conn } => self.clients.write().mark_pong(conn),
            HubCommand::Disconnected { conn } => self.on_disconnect(conn),
        }
    }

    fn heartbeat(&mut self) {
        let sweep = self.clients.write().sweep();
        debug!(pinged = sweep.pinged, stale = sweep.stale.len(), "Heartbeat");
        for conn in sweep.stale {
            warn!(conn, "Connection missed heartbeat, closing");
            if let Some(sink) = self.clients.read().sink(conn) {
                sink.close();
            }
            self.on_disconnect(conn);
        }
    }

    fn on_frame(&mut self, conn: ConnId, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(conn, error = %e, "Malformed message");
                self.reply(conn, &ServerMessage::error("Malformed message"));
                return;
            }
        };
        debug!(conn, kind = message.kind(), "Frame");

        let result = match message {
            ClientMessage::GetRooms => {
                let rooms = self.registry.list_rooms();
                self.reply(conn, &ServerMessage::Rooms { rooms });
                Ok(())
            }
            ClientMessage::JoinRoom {
                room_id,
                username,
                password,
                display_name,
                visibility,
                max_participants,
            } => self.on_join(
                conn,
                &room_id,
                &username,
                password.as_deref(),
                CreationOptions {
                    display_name,
                    max_participants,
                    visibility,
                    password: password.clone(),
                },
            ),
            ClientMessage::LeaveRoom { room_id, username } => self.on_leave(conn, &room_id, &username),
            ClientMessage::UpdateRoomSettings {
                room_id,
                username,
                update_id,
                name,
                max_participants,
                locked,
                visibility,
                password,
            } => self.require_binding(conn, &room_id, &username).and_then(|()| {
                let patch = SettingsPatch {
                    name,
                    max_participants,
                    locked,
                    visibility,
                    password,
                };
                let events = self.registry.update_settings(&room_id, &username, patch, update_id)?;
                self.emit(events);
                Ok(())
            }),
            ClientMessage::SendMessage {
                room_id,
                username,
                text,
            } => self.on_chat(conn, &room_id, &username, &text),
            ClientMessage::SendFile {
                room_id,
                username,
                file_name,
                file_type,
                file_data,
                timestamp,
                as_audio,
            } => self.require_binding(conn, &room_id, &username).map(|()| {
                if file_data.len() > self.config.max_file_bytes {
                    warn!(conn, room = %room_id, size = file_data.len(), "File too large");
                    self.reply(
                        conn,
                        &ServerMessage::error(format!(
                            "File exceeds maximum size of {} bytes",
                            self.config.max_file_bytes
                        )),
                    );
                    self.notice(&room_id, format!("{username} tried to send a file that was too large"));
                    return;
                }
                let mut message = ChatMessage::user(&username, &file_name);
                if timestamp > 0 {
                    message.timestamp = timestamp;
                }
                message.file = Some(FileAttachment {
                    file_name,
                    file_type,
                    file_data,
                    as_audio,
                });
                self.broadcast(&room_id, &ServerMessage::NewMessage { message });
            }),
            ClientMessage::CallJoin {
                room_id,
                username,
                is_listener,
            } => {
                self.on_call_join(conn, &room_id, &username, is_listener);
                Ok(())
            }
            ClientMessage::CallOffer(signal) => {
                self.relay(conn, signal, ServerMessage::CallOffer);
                Ok(())
            }
            ClientMessage::CallAnswer(signal) => {
                self.relay(conn, signal, ServerMessage::CallAnswer);
                Ok(())
            }
            ClientMessage::CallIce(signal) => {
                self.relay(conn, signal, ServerMessage::CallIce);
                Ok(())
            }
            ClientMessage::CallPeerLeft { room_id, username } => {
                if let Some(departure) = self.calls.leave(&room_id, &username, conn) {
                    self.announce_departure(departure);
                }
                Ok(())
            }
        };

        if let Err(err) = result {
            debug!(conn, error = %err, "Request rejected");
            self.reply(conn, &ServerMessage::from(&err));
        }
    }

    fn on_join(
        &mut self,
        conn: ConnId,
        room_id: &str,
        username: &str,
        password: Option<&str>,
        options: CreationOptions,
    ) -> Result<(), RoomError> {
        let previous = self.clients.read().binding(conn);
        if let Some(prev) = &previous {
            if prev.matches(room_id.trim(), username.trim()) {
                // Re-join from the same connection: resend the snapshot only.
                let info = self.registry.room_info(&prev.room_id);
                self.reply(conn, &ServerMessage::RoomInfo { room: info, update_id: None });
                return Ok(());
            }
        }

        let events = self.registry.join_room(room_id, username, password, options)?;
        if let Some(prev) = previous {
            let left = self.registry.leave_room(&prev.room_id, &prev.username);
            self.emit(left);
        }
        self.clients
            .write()
            .bind(conn, Binding::new(room_id.trim(), username.trim()));
        self.emit(events);
        Ok(())
    }

    fn on_leave(&mut self, conn: ConnId, room_id: &str, username: &str) -> Result<(), RoomError> {
        self.require_binding(conn, room_id, username)?;
        self.clients.write().unbind(conn);
        if let Some(departure) = self.calls.leave(room_id, username, conn) {
            self.announce_departure(departure);
        }
        let events = self.registry.leave_room(room_id, username);
        self.emit(events);
        Ok(())
    }

    fn on_chat(&mut self, conn: ConnId, room_id: &str, username: &str, text: &str) -> Result<(), RoomError> {
        self.require_binding(conn, room_id, username)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(RoomError::Validation("Message cannot be empty".into()));
        }
        let message = ChatMessage::user(username, text);
        self.broadcast(room_id, &ServerMessage::NewMessage { message });
        Ok(())
    }

    fn on_call_join(&mut self, conn: ConnId, room_id: &str, username: &str, listener: bool) {
        if room_id.trim().is_empty() || username.trim().is_empty() {
            self.reply(conn, &ServerMessage::error("call-join requires roomId and username"));
            return;
        }
        let outcome = self.calls.join(room_id, username, conn, listener);
        if let Some(departure) = outcome.left {
            self.announce_departure(departure);
        }
        if let Some(stale) = outcome.replaced {
            debug!(conn, room = %room_id, user = %username, "Call identity taken over by a new connection");
            self.announce_departure(stale);
        }
        info!(conn, room = %room_id, user = %username, listener, peers = outcome.notify.len(), "Joined call");
        let announce = ServerMessage::CallNewPeer {
            room_id: room_id.to_string(),
            username: username.to_string(),
            is_listener: listener,
        };
        for peer in outcome.notify {
            self.reply(peer, &announce);
        }
    }

    fn relay(&mut self, conn: ConnId, signal: PeerSignal, wrap: fn(PeerSignal) -> ServerMessage) {
        match self.calls.route(&signal.room_id, &signal.from, &signal.to, conn) {
            Ok(target) => {
                debug!(room = %signal.room_id, from = %signal.from, to = %signal.to, "Relaying signal");
                self.reply(target, &wrap(signal));
            }
            Err(reject) => warn!(conn, reason = %reject, "Dropping call signal"),
        }
    }

    fn announce_departure(&mut self, departure: Departure) {
        info!(room = %departure.room_id, user = %departure.username, "Left call");
        let message = ServerMessage::CallPeerLeft {
            room_id: departure.room_id,
            username: departure.username,
        };
        for peer in departure.remaining {
            self.reply(peer, &message);
        }
    }

    fn on_oversized(&mut self, conn: ConnId) {
        warn!(conn, limit = self.config.max_message_bytes, "Oversized message");
        self.reply(
            conn,
            &ServerMessage::error(format!(
                "Message exceeds maximum size of {} bytes",
                self.config.max_message_bytes
            )),
        );
        let binding = self.clients.read().binding(conn);
        if let Some(binding) = binding {
            self.notice(
                &binding.room_id,
                format!("{} tried to send a message that was too large", binding.username),
            );
        }
    }

    fn on_disconnect(&mut self, conn: ConnId) {
        let Some(binding) = self.clients.write().remove(conn) else {
            return;
        };
        if let Some(departure) = self.calls.leave_conn(conn) {
            self.announce_departure(departure);
        }
        if let Some(binding) = binding {
            let events = self.registry.leave_room(&binding.room_id, &binding.username);
            self.emit(events);
        }
        debug!(conn, "Connection removed");
    }

    fn require_binding(&self, conn: ConnId, room_id: &str, username: &str) -> Result<(), RoomError> {
        match self.clients.read().binding(conn) {
            Some(binding) if binding.matches(room_id, username) => Ok(()),
            _ if !self.registry.room_info(room_id).exists => Err(RoomError::NotFound {
                room_id: room_id.to_string(),
            }),
            _ => Err(RoomError::Validation("You are not a member of this room".into())),
        }
    }

    fn emit(&self, events: Vec<RoomEvent>) {
        for event in events {
            match event {
                RoomEvent::Notice { room_id, text } => self.notice(&room_id, text),
                RoomEvent::Snapshot {
                    room_id,
                    info,
                    update_id,
                } => self.broadcast(&room_id, &ServerMessage::RoomInfo { room: info, update_id }),
                RoomEvent::ListChanged => {
                    let text = ServerMessage::Rooms {
                        rooms: self.registry.list_rooms(),
                    }
                    .to_json();
                    for sink in self.clients.read().all_sinks() {
                        sink.send_text(&text);
                    }
                }
            }
        }
    }

    fn notice(&self, room_id: &str, text: String) {
        let message = ChatMessage::system(text);
        self.broadcast(room_id, &ServerMessage::NewMessage { message });
    }

    fn broadcast(&self, room_id: &str, message: &ServerMessage) {
        self.broadcaster.dispatch(room_id, message.to_json());
    }

    fn reply(&self, conn: ConnId, message: &ServerMessage) {
        if let Some(sink) = self.clients.read().sink(conn) {
            sink.send_text(&message.to_json());
        }
    }
}

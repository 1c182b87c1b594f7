//! A joined call: room membership, local media, peer negotiation and health
//! supervision wired to one signaling connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CallConfig, CallTimings};
use crate::error::{AppError, Result};
use crate::protocol::{ClientMessage, ServerMessage};

use super::health::HealthMonitor;
use super::media::{DeviceProvider, MediaFoundation, MediaOptions};
use super::negotiator::{Negotiator, NegotiatorConfig};
use super::signaling::SignalingClient;
use super::track::LocalTrack;
use super::transport::{MediaKind, TransportEventKind, TransportFactory};
use super::CallEvent;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub room_id: String,
    pub username: String,
    pub password: Option<String>,
    pub listener: bool,
    pub mixing: bool,
    pub timings: CallTimings,
}

impl SessionOptions {
    pub fn from_config(config: &CallConfig) -> Self {
        Self {
            room_id: config.room.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            listener: config.listener,
            mixing: !config.no_mixing,
            timings: CallTimings {
                device_timeout: Duration::from_millis(config.device_timeout_ms),
                ..CallTimings::default()
            },
        }
    }
}

pub struct CallSession {
    room_id: String,
    username: String,
    negotiator: Arc<Negotiator>,
    media: Arc<MediaFoundation>,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CallSession {
    /// Join the chat room, acquire media and enter the call.
    pub async fn start(
        mut signaling: SignalingClient,
        factory: Arc<dyn TransportFactory>,
        devices: Arc<dyn DeviceProvider>,
        options: SessionOptions,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Result<Self> {
        signaling.send(ClientMessage::JoinRoom {
            room_id: options.room_id.clone(),
            username: options.username.clone(),
            password: options.password.clone(),
            display_name: None,
            visibility: None,
            max_participants: None,
        })?;
        tokio::time::timeout(JOIN_TIMEOUT, wait_for_room(&mut signaling, &events))
            .await
            .map_err(|_| AppError::Signaling("no reply to joinRoom".into()))??;
        info!(room = %options.room_id, user = %options.username, "Joined room");

        let (media, notices) = MediaFoundation::establish(
            devices,
            MediaOptions {
                listener: options.listener,
                mixing: options.mixing,
                device_timeout: options.timings.device_timeout,
            },
        )
        .await;
        for notice in notices {
            let _ = events.send(CallEvent::Notice(notice));
        }
        let media = Arc::new(media);

        let shutdown = CancellationToken::new();
        let outbox = signaling.outbox();
        let (negotiator, transport_events) = Negotiator::new(
            NegotiatorConfig {
                room_id: options.room_id.clone(),
                local: options.username.clone(),
                timings: options.timings.clone(),
            },
            factory,
            Arc::clone(&media),
            outbox.clone(),
            events.clone(),
            shutdown.child_token(),
        );
        let health = HealthMonitor::new(Arc::clone(&negotiator));

        let tasks = vec![
            tokio::spawn(run_transport_events(
                Arc::clone(&negotiator),
                Arc::clone(&health),
                transport_events,
            )),
            tokio::spawn(Arc::clone(&health).run(shutdown.child_token())),
            tokio::spawn(run_signaling(
                signaling,
                Arc::clone(&negotiator),
                options.room_id.clone(),
                events,
                shutdown.clone(),
            )),
        ];

        let _ = outbox.send(ClientMessage::CallJoin {
            room_id: options.room_id.clone(),
            username: options.username.clone(),
            is_listener: options.listener,
        });
        info!(room = %options.room_id, listener = options.listener, "Joined call");

        Ok(Self {
            room_id: options.room_id,
            username: options.username,
            negotiator,
            media,
            outbox,
            shutdown,
            tasks,
        })
    }

    pub fn negotiator(&self) -> &Arc<Negotiator> {
        &self.negotiator
    }

    pub fn media(&self) -> &Arc<MediaFoundation> {
        &self.media
    }

    /// Resolves once the session has ended, either by [`leave`](Self::leave)
    /// or because the server connection dropped.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Swap the synthetic microphone for a real one.
    pub async fn upgrade_microphone(&self) -> Result<()> {
        let renegotiate = self
            .media
            .upgrade_microphone(&self.negotiator.transports())
            .await?;
        self.renegotiate(renegotiate).await;
        Ok(())
    }

    pub async fn upgrade_camera(&self) -> Result<()> {
        let renegotiate = self.media.upgrade_camera(&self.negotiator.transports()).await?;
        self.renegotiate(renegotiate).await;
        Ok(())
    }

    /// Mute or unmute. Unmuting a synthetic track retries the real device.
    pub async fn set_muted(&self, kind: MediaKind, muted: bool) {
        let renegotiate = self
            .media
            .set_muted(kind, muted, &self.negotiator.transports())
            .await;
        self.renegotiate(renegotiate).await;
    }

    pub async fn start_screen_share(&self, video: LocalTrack, system_audio: Option<LocalTrack>) {
        let renegotiate = self
            .media
            .start_screen_share(video, system_audio, &self.negotiator.transports())
            .await;
        self.renegotiate(renegotiate).await;
    }

    pub async fn stop_screen_share(&self) {
        let renegotiate = self
            .media
            .stop_screen_share(&self.negotiator.transports())
            .await;
        self.renegotiate(renegotiate).await;
    }

    async fn renegotiate(&self, peers: Vec<String>) {
        for peer in peers {
            if let Err(e) = self.negotiator.offer(&peer, false).await {
                warn!(peer = %peer, error = %e, "Renegotiation failed");
            }
        }
    }

    /// Leave the call and the room, closing every connection.
    pub async fn leave(self) {
        let _ = self.outbox.send(ClientMessage::CallPeerLeft {
            room_id: self.room_id.clone(),
            username: self.username.clone(),
        });
        let _ = self.outbox.send(ClientMessage::LeaveRoom {
            room_id: self.room_id.clone(),
            username: self.username.clone(),
        });
        self.negotiator.leave().await;
        self.media.shutdown();
        self.shutdown.cancel();
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn wait_for_room(signaling: &mut SignalingClient, events: &mpsc::UnboundedSender<CallEvent>) -> Result<()> {
    loop {
        match signaling.receive().await {
            Some(ServerMessage::RoomInfo { .. }) => return Ok(()),
            Some(ServerMessage::Error { error, .. }) => return Err(AppError::Signaling(error)),
            Some(ServerMessage::NewMessage { message }) => {
                let _ = events.send(CallEvent::Chat(message));
            }
            Some(other) => debug!(?other, "Ignored while joining"),
            None => return Err(AppError::Signaling("connection closed while joining".into())),
        }
    }
}

async fn run_transport_events(
    negotiator: Arc<Negotiator>,
    health: Arc<HealthMonitor>,
    mut events: mpsc::UnboundedReceiver<crate::client::transport::TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event.kind {
            TransportEventKind::StateChanged(state) => {
                health.on_state_change(&event.remote, event.generation, state).await
            }
            _ => negotiator.on_transport_event(event).await,
        }
    }
}

async fn run_signaling(
    mut signaling: SignalingClient,
    negotiator: Arc<Negotiator>,
    room_id: String,
    events: mpsc::UnboundedSender<CallEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = signaling.receive() => message,
        };
        let Some(message) = message else {
            warn!("Signaling connection lost");
            let _ = events.send(CallEvent::Error {
                username: None,
                message: "Disconnected from server".into(),
            });
            negotiator.leave().await;
            shutdown.cancel();
            break;
        };
        handle_server_message(&negotiator, &room_id, &events, message).await;
    }
}

/// Dispatch one server message to the call.
pub async fn handle_server_message(
    negotiator: &Arc<Negotiator>,
    room_id: &str,
    events: &mpsc::UnboundedSender<CallEvent>,
    message: ServerMessage,
) {
    match message {
        ServerMessage::CallNewPeer {
            room_id: room,
            username,
            is_listener,
        } if room == room_id => negotiator.on_peer_discovered(&username, is_listener).await,
        ServerMessage::CallOffer(signal) if signal.room_id == room_id => {
            negotiator.handle_offer(&signal.from, signal.payload).await
        }
        ServerMessage::CallAnswer(signal) if signal.room_id == room_id => {
            negotiator.handle_answer(&signal.from, signal.payload).await
        }
        ServerMessage::CallIce(signal) if signal.room_id == room_id => {
            negotiator.handle_candidate(&signal.from, signal.payload).await
        }
        ServerMessage::CallPeerLeft { room_id: room, username } if room == room_id => {
            negotiator.remove_peer(&username).await
        }
        ServerMessage::NewMessage { message } => {
            let _ = events.send(CallEvent::Chat(message));
        }
        ServerMessage::Error { error, .. } => {
            warn!(error = %error, "Server error");
            let _ = events.send(CallEvent::Error {
                username: None,
                message: error,
            });
        }
        other => debug!(?other, "Ignored server message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::media::NoDevices;
    use crate::client::testing::FakeFactory;
    use crate::client::transport::TransportState;
    use crate::config::ServerConfig;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn start_server() -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(crate::server::serve(listener, ServerConfig::default(), shutdown.clone()));
        (url, shutdown)
    }

    fn options(username: &str) -> SessionOptions {
        SessionOptions {
            room_id: "standup".into(),
            username: username.into(),
            password: None,
            listener: false,
            mixing: true,
            timings: CallTimings::default(),
        }
    }

    async fn join(url: &str, username: &str, factory: Arc<FakeFactory>) -> (CallSession, mpsc::UnboundedReceiver<CallEvent>) {
        let signaling = SignalingClient::connect(url).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = CallSession::start(signaling, factory, Arc::new(NoDevices), options(username), tx)
            .await
            .unwrap();
        (session, rx)
    }

    fn connected(session: &CallSession, remote: &str) -> bool {
        session
            .negotiator()
            .peer(remote)
            .is_some_and(|r| r.transport().connection_state() == TransportState::Connected)
    }

    #[tokio::test]
    async fn existing_participant_offers_and_both_connect() {
        let (url, server) = start_server().await;
        let factory_bob = Arc::new(FakeFactory::default());
        let factory_alice = Arc::new(FakeFactory::default());

        // bob sorts after alice, so bob is the impolite side and offers first.
        let (bob, mut bob_events) = join(&url, "bob", factory_bob.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (alice, _alice_events) = join(&url, "alice", factory_alice.clone()).await;

        tokio::time::timeout(Duration::from_secs(10), async {
            while !(connected(&bob, "alice") && connected(&alice, "bob")) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("peers never connected");

        assert_eq!(factory_bob.created("alice"), 1);
        assert_eq!(factory_alice.created("bob"), 1);
        assert_eq!(factory_bob.latest("alice").unwrap().offers_created(), 1);
        assert_eq!(factory_alice.latest("bob").unwrap().offers_created(), 0);

        let seen: Vec<CallEvent> = std::iter::from_fn(|| bob_events.try_recv().ok()).collect();
        assert!(seen
            .iter()
            .any(|e| matches!(e, CallEvent::PeerJoined { username, .. } if username == "alice")));

        alice.leave().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while bob.negotiator().peer("alice").is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("departure never reached bob");

        bob.leave().await;
        server.cancel();
    }

    #[tokio::test]
    async fn rejected_join_is_reported() {
        let (url, server) = start_server().await;
        let signaling = SignalingClient::connect(&url).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let bad = options("   ");
        let result = CallSession::start(signaling, Arc::new(FakeFactory::default()), Arc::new(NoDevices), bad, tx).await;
        assert!(matches!(result, Err(AppError::Signaling(_))));
        server.cancel();
    }

    #[tokio::test]
    async fn signals_for_other_rooms_are_ignored() {
        let factory = Arc::new(FakeFactory::default());
        let (media, _) = MediaFoundation::establish(Arc::new(NoDevices), MediaOptions::default()).await;
        let (outbox, _out_rx) = mpsc::unbounded_channel();
        let (events, _ev_rx) = mpsc::unbounded_channel();
        let (negotiator, _) = Negotiator::new(
            NegotiatorConfig {
                room_id: "r1".into(),
                local: "A".into(),
                timings: CallTimings::default(),
            },
            factory.clone(),
            Arc::new(media),
            outbox,
            events.clone(),
            CancellationToken::new(),
        );

        let stray = ServerMessage::CallNewPeer {
            room_id: "r2".into(),
            username: "B".into(),
            is_listener: false,
        };
        handle_server_message(&negotiator, "r1", &events, stray).await;
        assert!(negotiator.peer("B").is_none());

        let offer = ServerMessage::CallOffer(crate::protocol::PeerSignal {
            room_id: "r1".into(),
            from: "B".into(),
            to: "A".into(),
            payload: json!({"type": "offer", "sdp": "v=0\n"}),
        });
        handle_server_message(&negotiator, "r1", &events, offer).await;
        assert!(negotiator.peer("B").is_some());
        assert_eq!(factory.created("B"), 1);
    }
}

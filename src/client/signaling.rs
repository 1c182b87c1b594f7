//! WebSocket link to the room server.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::protocol::{ClientMessage, ServerMessage};

const INBOX: usize = 100;

pub struct SignalingClient {
    tx: mpsc::UnboundedSender<ClientMessage>,
    rx: mpsc::Receiver<ServerMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::channel(INBOX);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();

        // Outgoing
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(kind = msg.kind(), error = %e, "Could not encode message");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Incoming
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "Signaling connection error");
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Unrecognized server message"),
                }
            }
        });

        Ok(Self {
            tx: outgoing_tx,
            rx,
        })
    }

    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|e| AppError::Signaling(format!("Failed to send message: {}", e.0.kind())))
    }

    /// A handle for queueing messages from other tasks.
    pub fn outbox(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.tx.clone()
    }

    /// Next message from the server; `None` once the connection is gone.
    pub async fn receive(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }
}

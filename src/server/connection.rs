//! Per-connection task: forward frames to the hub, write queued output.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::clients::{ClientSink, ConnId, Outbound};
use super::hub::HubCommand;

const OUTBOUND_CAPACITY: usize = 256;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn handle_connection(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    conn: ConnId,
    hub: mpsc::Sender<HubCommand>,
) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);

    if hub
        .send(HubCommand::Connected {
            conn,
            sink: ClientSink::new(conn, tx),
        })
        .await
        .is_err()
    {
        return;
    }
    tracing::info!(peer = %addr, conn, "Client connected");

    let mut oversized = false;
    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Ping) => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if hub.send(HubCommand::Frame { conn, text }).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    let _ = hub.send(HubCommand::Pong { conn }).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(WsError::Capacity(e))) => {
                    tracing::warn!(peer = %addr, conn, error = %e, "Frame over size limit");
                    let _ = hub.send(HubCommand::Oversized { conn }).await;
                    oversized = true;
                    break;
                }
                Some(Err(e)) => {
                    tracing::debug!(peer = %addr, error = %e, "WS error");
                    break;
                }
                _ => {}
            },
        }
    }

    let _ = hub.send(HubCommand::Disconnected { conn }).await;

    // The hub answers an oversized frame before it drops our sink; push that
    // reply out before closing.
    if oversized {
        let flush = async {
            while let Some(out) = rx.recv().await {
                if let Outbound::Text(text) = out {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        };
        let _ = tokio::time::timeout(FLUSH_TIMEOUT, flush).await;
        let _ = sink.send(Message::Close(None)).await;
    }

    tracing::info!(peer = %addr, conn, "Client disconnected");
}

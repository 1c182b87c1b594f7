//! WebSocket chat and call-signaling server.
//!
//! Accepts WebSocket connections on one port and hands every frame to the
//! hub task, which owns all room and call state.

pub mod broadcast;
pub mod clients;
pub mod connection;
pub mod hub;
pub mod relay;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::Result;

use self::clients::ConnId;
use self::connection::handle_connection;
use self::hub::Hub;

const HUB_QUEUE: usize = 1024;

/// Run the server on an already-bound listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let local = listener.local_addr()?;
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_bytes);
    ws_config.max_frame_size = Some(config.max_message_bytes);

    let (hub_tx, hub_rx) = mpsc::channel(HUB_QUEUE);
    let hub = Hub::new(config);
    let hub_task = tokio::spawn(hub.run(hub_rx, shutdown.clone()));

    tracing::info!(addr = %local, "Listening");

    let mut next_conn: ConnId = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    next_conn += 1;
                    let conn = next_conn;
                    let hub_tx = hub_tx.clone();
                    tokio::spawn(async move {
                        match accept_async_with_config(stream, Some(ws_config)).await {
                            Ok(ws) => handle_connection(ws, addr, conn, hub_tx).await,
                            Err(e) => {
                                tracing::warn!(peer = %addr, error = %e, "WS handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            },
        }
    }

    drop(hub_tx);
    let _ = hub_task.await;
    Ok(())
}

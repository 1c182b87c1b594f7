use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use roomcall::client::capture::{CpalDevices, Playback};
use roomcall::client::media::{DeviceProvider, NoDevices};
use roomcall::client::rtc::RtcFactory;
use roomcall::client::session::{CallSession, SessionOptions};
use roomcall::client::signaling::SignalingClient;
use roomcall::client::transport::MediaKind;
use roomcall::client::CallEvent;
use roomcall::config::{CallConfig, ServerConfig};

#[derive(Parser)]
#[command(name = "roomcall", version, about = "Ephemeral group chat and calls")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the room and signaling server.
    Serve(ServerConfig),
    /// Join a room's call from the terminal.
    Call(CallConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roomcall=info")),
        )
        .init();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            signal.cancel();
        }
    });

    match Cli::parse().command {
        Command::Serve(config) => {
            let listener = TcpListener::bind(("0.0.0.0", config.port))
                .await
                .with_context(|| format!("binding port {}", config.port))?;
            roomcall::server::serve(listener, config, shutdown).await?;
        }
        Command::Call(config) => call(config, shutdown).await?,
    }
    Ok(())
}

async fn call(config: CallConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let signaling = SignalingClient::connect(&config.url)
        .await
        .with_context(|| format!("connecting to {}", config.url))?;

    let playback = match Playback::start() {
        Ok(playback) => Some(playback),
        Err(e) => {
            warn!(error = %e, "No audio output, remote audio will not play");
            None
        }
    };
    let factory = Arc::new(RtcFactory::new(config.ice_servers.clone(), playback.clone())?);
    let devices: Arc<dyn DeviceProvider> = if config.listener {
        Arc::new(NoDevices)
    } else {
        Arc::new(CpalDevices)
    };

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let session = CallSession::start(
        signaling,
        factory,
        devices,
        SessionOptions::from_config(&config),
        events_tx,
    )
    .await?;

    info!("Commands: mute, unmute, video off, video on, leave");
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = session.closed() => break,
            Some(event) = events.recv() => report(event),
            line = commands.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Some(Control::Leave) => break,
                    Some(Control::Mute(kind, muted)) => session.set_muted(kind, muted).await,
                    None if line.trim().is_empty() => {}
                    None => warn!(command = %line.trim(), "Unknown command"),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }

    session.leave().await;
    if let Some(playback) = playback {
        playback.stop();
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Control {
    Mute(MediaKind, bool),
    Leave,
}

fn parse_command(line: &str) -> Option<Control> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["mute"] => Some(Control::Mute(MediaKind::Audio, true)),
        ["unmute"] => Some(Control::Mute(MediaKind::Audio, false)),
        ["video", "off"] => Some(Control::Mute(MediaKind::Video, true)),
        ["video", "on"] => Some(Control::Mute(MediaKind::Video, false)),
        ["leave"] | ["quit"] => Some(Control::Leave),
        _ => None,
    }
}

fn report(event: CallEvent) {
    match event {
        CallEvent::PeerJoined { username, listener } => info!(peer = %username, listener, "Peer joined"),
        CallEvent::PeerLeft { username } => info!(peer = %username, "Peer left"),
        CallEvent::RemoteTrack { username, purpose, track } => {
            info!(peer = %username, ?purpose, track = %track.id, "Receiving track")
        }
        CallEvent::Health { username, health } => info!(peer = %username, %health, "Connection health"),
        CallEvent::Chat(message) => info!(from = %message.username, "{}", message.text),
        CallEvent::Notice(text) => warn!("{text}"),
        CallEvent::Error { username, message } => error!(peer = ?username, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_commands() {
        assert_eq!(parse_command("unmute"), Some(Control::Mute(MediaKind::Audio, false)));
        assert_eq!(parse_command("  video on "), Some(Control::Mute(MediaKind::Video, false)));
        assert_eq!(parse_command("video off"), Some(Control::Mute(MediaKind::Video, true)));
        assert_eq!(parse_command("quit"), Some(Control::Leave));
        assert_eq!(parse_command("video"), None);
    }
}

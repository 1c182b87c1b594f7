use std::time::Duration;

use clap::Args;

use crate::room::RegistryLimits;

/// Settings for `roomcall serve`.
#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Largest accepted WebSocket message, in bytes.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    pub max_message_bytes: usize,

    /// Largest accepted file payload (encoded `fileData`), in bytes.
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_file_bytes: usize,

    /// Seconds between liveness pings. 0 disables probing.
    #[arg(long, default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Capacity of rooms created without `maxParticipants`.
    #[arg(long, default_value_t = crate::room::DEFAULT_CAPACITY)]
    pub default_capacity: usize,

    /// Upper bound for any room capacity.
    #[arg(long, default_value_t = 50)]
    pub max_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_message_bytes: 16 * 1024 * 1024,
            max_file_bytes: 10 * 1024 * 1024,
            heartbeat_secs: 30,
            default_capacity: crate::room::DEFAULT_CAPACITY,
            max_capacity: 50,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }

    pub fn registry_limits(&self) -> RegistryLimits {
        RegistryLimits {
            default_capacity: self.default_capacity,
            max_capacity: self.max_capacity,
            ..RegistryLimits::default()
        }
    }
}

/// Settings for `roomcall call`, the headless call participant.
#[derive(Debug, Clone, Args)]
pub struct CallConfig {
    /// Signaling server URL.
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    pub url: String,

    /// Room to join (created if missing).
    #[arg(long)]
    pub room: String,

    /// Name shown to other participants.
    #[arg(long)]
    pub username: String,

    #[arg(long)]
    pub password: Option<String>,

    /// Join muted with synthetic media only.
    #[arg(long)]
    pub listener: bool,

    /// STUN/TURN server URLs.
    #[arg(long = "stun", default_value = "stun:stun.l.google.com:19302")]
    pub ice_servers: Vec<String>,

    /// Attach system audio as its own sender instead of mixing it into the
    /// microphone track.
    #[arg(long)]
    pub no_mixing: bool,

    /// How long to wait for a capture device before falling back, in ms.
    #[arg(long, default_value_t = 1500)]
    pub device_timeout_ms: u64,
}

/// Negotiation and health timings used by the call client.
#[derive(Debug, Clone)]
pub struct CallTimings {
    /// Delay before the impolite side sends its first offer.
    pub initial_offer: Duration,
    /// Delay before the polite side sends a backup offer.
    pub backup_offer: Duration,
    /// Grace period before an ICE restart on `disconnected`.
    pub restart_delay: Duration,
    pub health_interval: Duration,
    pub connect_timeout: Duration,
    pub max_recreate_attempts: u32,
    pub device_timeout: Duration,
}

impl Default for CallTimings {
    fn default() -> Self {
        Self {
            initial_offer: Duration::from_millis(100),
            backup_offer: Duration::from_millis(500),
            restart_delay: Duration::from_secs(1),
            health_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            max_recreate_attempts: 3,
            device_timeout: Duration::from_millis(1500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_heartbeat_disables_probing() {
        let config = ServerConfig {
            heartbeat_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.heartbeat(), None);
        assert_eq!(
            ServerConfig::default().heartbeat(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn registry_limits_follow_server_config() {
        let limits = ServerConfig {
            default_capacity: 4,
            max_capacity: 8,
            ..Default::default()
        }
        .registry_limits();
        assert_eq!(limits.default_capacity, 4);
        assert_eq!(limits.max_capacity, 8);
        assert_eq!(limits.max_username_chars, 20);
    }
}

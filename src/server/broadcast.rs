//! Room broadcast with bounded retry.
//!
//! An attempt snapshots the room's connections, sends to every open sink and
//! counts deliveries. Only an attempt that reached nobody is retried; partial
//! success is final so no client ever sees an event twice.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::clients::{ClientDirectory, ClientSink};

/// Source of the current recipients of a room.
pub trait Recipients: Send + Sync + 'static {
    fn room_sinks(&self, room_id: &str) -> Vec<ClientSink>;
}

impl Recipients for RwLock<ClientDirectory> {
    fn room_sinks(&self, room_id: &str) -> Vec<ClientSink> {
        self.read().room_sinks(room_id)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub extra_attempts: u32,
    /// Backoff before attempt `n` is `backoff_step * n`.
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            extra_attempts: 2,
            backoff_step: Duration::from_millis(100),
        }
    }
}

pub struct Broadcaster<R: Recipients> {
    recipients: Arc<R>,
    policy: RetryPolicy,
}

impl<R: Recipients> Clone for Broadcaster<R> {
    fn clone(&self) -> Self {
        Self {
            recipients: Arc::clone(&self.recipients),
            policy: self.policy,
        }
    }
}

impl<R: Recipients> Broadcaster<R> {
    pub fn new(recipients: Arc<R>, policy: RetryPolicy) -> Self {
        Self { recipients, policy }
    }

    /// One delivery attempt over a fresh snapshot. Returns the number of
    /// clients that accepted the frame.
    pub fn attempt(&self, room_id: &str, text: &str) -> usize {
        self.recipients
            .room_sinks(room_id)
            .iter()
            .filter(|sink| sink.send_text(text))
            .count()
    }

    /// Deliver with retries, awaiting the backoff between attempts.
    pub async fn broadcast(&self, room_id: &str, text: &str) -> bool {
        if self.attempt(room_id, text) > 0 {
            return true;
        }
        self.retry(room_id, text).await
    }

    /// First attempt inline, retries on a spawned task. Must be called from
    /// within a tokio runtime.
    pub fn dispatch(&self, room_id: &str, text: String) -> bool {
        let delivered = self.attempt(room_id, &text);
        if delivered > 0 {
            debug!(room = %room_id, delivered, "Broadcast delivered");
            return true;
        }
        if self.policy.extra_attempts > 0 {
            let this = self.clone();
            let room_id = room_id.to_string();
            tokio::spawn(async move {
                this.retry(&room_id, &text).await;
            });
        }
        false
    }

    async fn retry(&self, room_id: &str, text: &str) -> bool {
        for attempt in 1..=self.policy.extra_attempts {
            tokio::time::sleep(self.policy.backoff_step * attempt).await;
            let delivered = self.attempt(room_id, text);
            if delivered > 0 {
                debug!(room = %room_id, attempt, delivered, "Broadcast delivered on retry");
                return true;
            }
        }
        warn!(room = %room_id, attempts = self.policy.extra_attempts + 1, "Broadcast reached no clients");
        false
    }
}

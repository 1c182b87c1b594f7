//! Connection health supervision.
//!
//! Reacts to transport state reports as they arrive and also sweeps all
//! peers on a fixed interval, since some failure modes never produce an
//! event (a connection that stays `connecting` forever, a participant whose
//! connection was never created).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CallTimings;

use super::negotiator::{Negotiator, PeerRecord};
use super::transport::{SignalingState, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Nothing,
    RestartIce,
    Recreate,
}

/// What the periodic check should do for a connection in this state.
pub fn assess(state: TransportState, signaling: SignalingState, age: Duration, interval: Duration) -> HealthAction {
    let stable = signaling == SignalingState::Stable;
    match state {
        TransportState::Failed => HealthAction::Recreate,
        TransportState::Disconnected if stable => HealthAction::RestartIce,
        TransportState::New | TransportState::Connecting if stable && age > interval * 2 => HealthAction::RestartIce,
        // An exchange in flight gets longer to settle before the connection is thrown away.
        TransportState::New | TransportState::Connecting if age > interval * 4 => HealthAction::Recreate,
        _ => HealthAction::Nothing,
    }
}

pub struct HealthMonitor {
    negotiator: Arc<Negotiator>,
    timings: CallTimings,
}

impl HealthMonitor {
    pub fn new(negotiator: Arc<Negotiator>) -> Arc<Self> {
        let timings = negotiator.timings().clone();
        Arc::new(Self { negotiator, timings })
    }

    /// Handle a transport state report.
    pub async fn on_state_change(self: &Arc<Self>, remote: &str, generation: u64, state: TransportState) {
        let Some(record) = self.negotiator.note_transport_state(remote, generation, state) else {
            return;
        };
        match state {
            TransportState::Failed => {
                info!(peer = %remote, "Connection failed, rebuilding");
                self.negotiator.recreate(remote).await;
            }
            TransportState::Disconnected => self.schedule_restart(record),
            _ => {}
        }
    }

    /// Restart ICE after a grace period if the connection has not recovered
    /// on its own.
    fn schedule_restart(self: &Arc<Self>, record: Arc<PeerRecord>) {
        let this = Arc::clone(self);
        let delay = self.timings.restart_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = record.timers().cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let transport = record.transport();
            let state = transport.connection_state();
            if matches!(state, TransportState::Disconnected | TransportState::New | TransportState::Connecting)
                && transport.signaling_state() == SignalingState::Stable
            {
                this.negotiator.restart_ice(record.remote()).await;
            } else {
                debug!(peer = %record.remote(), ?state, "Connection recovered without restart");
            }
        });
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.timings.health_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.check().await,
            }
        }
        debug!("Health monitor stopped");
    }

    /// One sweep over every peer plus participants with no connection.
    pub async fn check(self: &Arc<Self>) {
        let period = self.timings.health_interval;
        for record in self.negotiator.peers() {
            let transport = record.transport();
            let state = transport.connection_state();
            // Catch up the label with any transition we missed.
            self.negotiator
                .note_transport_state(record.remote(), record.generation(), state);

            match assess(state, transport.signaling_state(), record.age(), period) {
                HealthAction::Nothing => {}
                HealthAction::Recreate => self.negotiator.recreate(record.remote()).await,
                HealthAction::RestartIce => self.schedule_restart(record),
            }
        }

        for name in self.negotiator.missing_participants() {
            info!(peer = %name, "Participant has no connection, creating one");
            if self.negotiator.ensure_peer(&name, false).await.is_ok() {
                if let Err(e) = self.negotiator.offer(&name, false).await {
                    debug!(peer = %name, error = %e, "Offer to missing participant failed");
                }
            }
        }
    }
}

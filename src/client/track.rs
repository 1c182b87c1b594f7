//! Local media tracks: a broadcast stream of encoded frames with an
//! enable switch and a stop signal.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::g711;
use super::transport::MediaKind;

const FRAME_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Device,
    Synthetic,
    Mixed,
    /// Supplied by the embedding application (screen capture, files).
    External,
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    stop: CancellationToken,
    frames: broadcast::Sender<MediaFrame>,
}

/// Cheap to clone; all clones share the same stream and switches.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, source: TrackSource, label: impl Into<String>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                stop: CancellationToken::new(),
                frames,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_synthetic(&self) -> bool {
        self.inner.source == TrackSource::Synthetic
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.inner.stop.cancelled()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.inner.frames.subscribe()
    }

    /// Publish a frame from the producer side. A disabled audio track sends
    /// silence of the same length; a disabled video track sends nothing.
    pub fn push(&self, frame: MediaFrame) {
        if self.is_stopped() {
            return;
        }
        let frame = if self.is_enabled() {
            frame
        } else {
            match self.inner.kind {
                MediaKind::Audio => MediaFrame {
                    data: Bytes::from(vec![g711::SILENCE; frame.data.len()]),
                    duration: frame.duration,
                },
                MediaKind::Video => return,
            }
        };
        // No subscribers is fine: nobody is sending this track yet.
        let _ = self.inner.frames.send(frame);
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

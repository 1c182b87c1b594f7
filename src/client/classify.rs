//! Decide what an incoming track is for.
//!
//! The sender's declared `tracks` map is authoritative. Without it we fall
//! back to the stream-id marker and finally to label heuristics, which can
//! misclassify a track whose label happens to contain a keyword.

use std::collections::HashMap;

use super::transport::{MediaKind, RemoteTrackInfo, TrackPurpose};

const SCREEN_HINTS: [&str; 5] = ["system audio", "screen", "monitor", "display", "desktop"];

pub fn classify(info: &RemoteTrackInfo, declared: &HashMap<String, TrackPurpose>) -> TrackPurpose {
    if let Some(purpose) = declared.get(&info.id) {
        if purpose.kind() == info.kind {
            return *purpose;
        }
    }
    if let Some(purpose) = TrackPurpose::from_marker(&info.stream_id) {
        if purpose.kind() == info.kind {
            return purpose;
        }
    }

    let label = info.label.to_lowercase();
    let looks_shared = SCREEN_HINTS.iter().any(|hint| label.contains(hint))
        || (info.kind == MediaKind::Video && info.display_surface.is_some());
    match (info.kind, looks_shared) {
        (MediaKind::Audio, true) => TrackPurpose::SystemAudio,
        (MediaKind::Audio, false) => TrackPurpose::Microphone,
        (MediaKind::Video, true) => TrackPurpose::Screen,
        (MediaKind::Video, false) => TrackPurpose::Camera,
    }
}

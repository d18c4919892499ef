//! Playback Events
//!
//! Event-based communication for UI synchronization during playback.
//! Events are emitted at key points:
//! - State changes (play/pause/transition)
//! - Track changes (when fade-in begins, or immediately for hard switches)
//! - Crossfade start/completion/cancellation
//! - Errors surfaced to the user

use crate::error::{ErrorKind, PlaybackError};
use crate::types::{SessionState, TrackId};
use serde::{Deserialize, Serialize};

/// Events emitted by the playback controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlaybackEvent {
    /// Session state changed
    StateChanged { state: SessionState },

    /// The track the user perceives as current changed
    ///
    /// For crossfades this fires as soon as the incoming track starts fading in.
    TrackChanged {
        track_id: TrackId,
        previous_track_id: Option<TrackId>,
    },

    /// Crossfade started between two tracks
    CrossfadeStarted {
        from_track_id: TrackId,
        to_track_id: TrackId,
        duration_ms: u64,
    },

    /// Crossfade finished and channel roles swapped
    CrossfadeCompleted { track_id: TrackId },

    /// Crossfade aborted before completion
    CrossfadeCancelled,

    /// Track finished playing naturally
    TrackEnded { track_id: TrackId },

    /// Next track resolved and queued for caching
    NextTrackPrepared { track_id: TrackId },

    /// Error surfaced to the user
    Error { kind: ErrorKind, message: String },
}

impl PlaybackEvent {
    pub fn error(err: &PlaybackError) -> Self {
        PlaybackEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PlaybackEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_event_carries_kind() {
        let event = PlaybackEvent::error(&PlaybackError::SourceUnavailable("t1".to_string()));
        assert!(event.is_error());
        match event {
            PlaybackEvent::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::SourceUnavailable);
                assert!(message.contains("t1"));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn events_serialize() {
        let event = PlaybackEvent::TrackChanged {
            track_id: "b".to_string(),
            previous_track_id: Some("a".to_string()),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: PlaybackEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}

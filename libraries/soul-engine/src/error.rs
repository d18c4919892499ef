//! Error types for the playback engine

use std::time::Duration;
use thiserror::Error;

use crate::types::TrackId;

/// Playback errors
#[derive(Debug, Clone, Error)]
pub enum PlaybackError {
    /// Track has no locator and nothing is stored locally
    #[error("Source unavailable for track {0}")]
    SourceUnavailable(TrackId),

    /// Fetching or materializing a track failed (non-fatal, caller falls back to the locator)
    #[error("Cache failure for track {track_id}: {reason}")]
    CacheFailure { track_id: TrackId, reason: String },

    /// Incoming channel did not become ready in time
    #[error("Crossfade load timed out after {0:?}")]
    CrossfadeLoadTimeout(Duration),

    /// Platform refused to start playback (e.g. autoplay policy)
    #[error("Playback rejected: {0}")]
    PlaybackRejected(String),

    /// Operation was cancelled before it finished
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No track is currently loaded
    #[error("No track loaded")]
    NoTrackLoaded,

    /// Persistent store error
    #[error("Store error: {0}")]
    Store(String),

    /// Remote fetch error
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl PlaybackError {
    /// Stable kind name, used when surfacing errors to observers
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlaybackError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            PlaybackError::CacheFailure { .. } => ErrorKind::CacheFailure,
            PlaybackError::CrossfadeLoadTimeout(_) => ErrorKind::CrossfadeLoadTimeout,
            PlaybackError::PlaybackRejected(_) => ErrorKind::PlaybackRejected,
            _ => ErrorKind::Internal,
        }
    }
}

/// Coarse error classification for UI surfacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    SourceUnavailable,
    CacheFailure,
    CrossfadeLoadTimeout,
    PlaybackRejected,
    Internal,
}

impl From<std::io::Error> for PlaybackError {
    fn from(err: std::io::Error) -> Self {
        PlaybackError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for PlaybackError {
    fn from(err: config::ConfigError) -> Self {
        PlaybackError::Config(err.to_string())
    }
}

/// Result type for playback operations
pub type Result<T> = std::result::Result<T, PlaybackError>;

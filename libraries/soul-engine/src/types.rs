//! Core types for the playback engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique track identifier from the library
pub type TrackId = String;

/// Unique playlist identifier from the library
pub type PlaylistId = String;

/// One playable song
///
/// Supplied by the library collaborator and never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Unique track identifier
    pub id: TrackId,

    /// Track title
    pub title: String,

    /// Artist name
    pub artist: String,

    /// Album name (optional)
    pub album: Option<String>,

    /// Track duration
    pub duration: Duration,

    /// Where the audio bytes can be fetched from (URL or path)
    pub locator: Option<String>,

    /// Embedded artwork, if the importer extracted one
    pub artwork: Option<Artwork>,

    /// Encoder delay/padding to skip for gapless playback
    pub gapless: Option<GaplessTrim>,

    /// Bytes are available in the persistent blob store
    pub stored_locally: bool,
}

impl Track {
    /// Create a track with only the required fields set
    pub fn new(id: impl Into<TrackId>, title: impl Into<String>, duration: Duration) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: String::new(),
            album: None,
            duration,
            locator: None,
            artwork: None,
            gapless: None,
            stored_locally: false,
        }
    }

    /// Set the locator
    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    /// Set the artist
    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = artist.into();
        self
    }

    /// Mark the track as stored in the local blob store
    pub fn stored_locally(mut self) -> Self {
        self.stored_locally = true;
        self
    }

    /// Set gapless trim offsets
    pub fn with_gapless(mut self, trim: GaplessTrim) -> Self {
        self.gapless = Some(trim);
        self
    }

    /// Where playback of this track starts (after leading encoder delay)
    pub fn start_offset(&self) -> Duration {
        self.gapless.map(|g| g.start).unwrap_or(Duration::ZERO)
    }

    /// Where playback of this track should be considered finished
    ///
    /// `duration` is the measured media duration if known, otherwise the library value.
    pub fn effective_end(&self, duration: Duration) -> Duration {
        let end_trim = self.gapless.map(|g| g.end).unwrap_or(Duration::ZERO);
        duration.saturating_sub(end_trim)
    }
}

/// Embedded artwork
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artwork {
    /// Raw image bytes
    pub data: Vec<u8>,

    /// MIME type (e.g. "image/jpeg")
    pub mime_type: String,
}

/// Gapless trim offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaplessTrim {
    /// Leading silence to skip
    pub start: Duration,

    /// Trailing padding to ignore
    pub end: Duration,
}

/// Ordered set of tracks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    /// Playlist identity
    pub id: PlaylistId,

    /// Display name
    pub name: String,

    /// Tracks in play order
    pub tracks: Vec<Track>,
}

impl Playlist {
    /// Create a playlist
    pub fn new(id: impl Into<PlaylistId>, name: impl Into<String>, tracks: Vec<Track>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tracks,
        }
    }

    /// Position of a track in this playlist
    pub fn index_of(&self, track_id: &str) -> Option<usize> {
        self.tracks.iter().position(|t| t.id == track_id)
    }

    /// Number of tracks
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Whether the playlist has no tracks
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Repeat mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    /// Stop when playlist ends
    #[default]
    Off,

    /// Loop entire playlist
    All,

    /// Loop current track only
    One,
}

/// Shuffle mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShuffleMode {
    /// Sequential playlist order
    #[default]
    Off,

    /// Uniform random pick
    Random,

    /// Random pick weighted against recently/frequently played tracks
    Smart,
}

/// Direction for `advance`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Next,
    Previous,
}

/// Controller session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing loaded
    #[default]
    Idle,

    /// A track is selected but no source is loaded into a channel
    Loaded,

    /// Currently playing
    Playing,

    /// Paused mid-track
    Paused,

    /// Crossfade or hard switch in progress
    Transitioning,
}

/// Snapshot of the playback session, published to observers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSession {
    /// Controller state
    pub state: SessionState,

    /// Track the user perceives as current
    pub current_track: Option<Track>,

    /// Playlist the current track is played from
    pub current_playlist: Option<Playlist>,

    /// Audio is audible
    pub playing: bool,

    /// Position in the current track
    pub position: Duration,

    /// Duration of the current track
    pub duration: Duration,

    /// Shuffle mode
    pub shuffle: ShuffleMode,

    /// Repeat mode
    pub repeat: RepeatMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_builder_defaults() {
        let track = Track::new("t1", "Song", Duration::from_secs(180));
        assert_eq!(track.id, "t1");
        assert!(track.locator.is_none());
        assert!(!track.stored_locally);
        assert_eq!(track.start_offset(), Duration::ZERO);
    }

    #[test]
    fn gapless_trim_offsets() {
        let track = Track::new("t1", "Song", Duration::from_secs(180)).with_gapless(GaplessTrim {
            start: Duration::from_millis(26),
            end: Duration::from_millis(40),
        });

        assert_eq!(track.start_offset(), Duration::from_millis(26));
        assert_eq!(
            track.effective_end(Duration::from_secs(180)),
            Duration::from_millis(179_960)
        );
    }

    #[test]
    fn playlist_index_of() {
        let playlist = Playlist::new(
            "p1",
            "Mix",
            vec![
                Track::new("a", "A", Duration::from_secs(1)),
                Track::new("b", "B", Duration::from_secs(1)),
            ],
        );
        assert_eq!(playlist.index_of("b"), Some(1));
        assert_eq!(playlist.index_of("zzz"), None);
        assert_eq!(playlist.len(), 2);
    }

    #[test]
    fn default_session_is_idle() {
        let session = PlaybackSession::default();
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.current_track.is_none());
        assert_eq!(session.repeat, RepeatMode::Off);
    }
}

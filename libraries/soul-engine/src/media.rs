//! OS media-control surface
//!
//! Inbound transport commands and the now-playing metadata handed to the
//! platform's media session.

use crate::types::{Artwork, PlaybackSession, TrackId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Command from the OS media controls
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MediaCommand {
    Play,
    Pause,
    PlayPause,
    Next,
    Previous,
    Stop,
    SeekTo(Duration),
}

/// Metadata for the OS now-playing display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NowPlaying {
    pub track_id: TrackId,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub artwork: Option<Artwork>,
    pub duration: Duration,
    pub position: Duration,
    pub playing: bool,
}

impl NowPlaying {
    /// Metadata for the session's current track, if any
    pub fn from_session(session: &PlaybackSession) -> Option<Self> {
        let track = session.current_track.as_ref()?;
        Some(Self {
            track_id: track.id.clone(),
            title: track.title.clone(),
            artist: track.artist.clone(),
            album: track.album.clone(),
            artwork: track.artwork.clone(),
            duration: if session.duration.is_zero() {
                track.duration
            } else {
                session.duration
            },
            position: session.position,
            playing: session.playing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Track;

    #[test]
    fn now_playing_from_session() {
        assert!(NowPlaying::from_session(&PlaybackSession::default()).is_none());

        let session = PlaybackSession {
            current_track: Some(
                Track::new("t1", "Song", Duration::from_secs(200)).with_artist("Band"),
            ),
            playing: true,
            position: Duration::from_secs(12),
            ..Default::default()
        };

        let now = NowPlaying::from_session(&session).unwrap();
        assert_eq!(now.title, "Song");
        assert_eq!(now.artist, "Band");
        assert_eq!(now.duration, Duration::from_secs(200));
        assert!(now.playing);
    }
}

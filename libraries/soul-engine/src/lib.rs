//! Soul Player - Playback Engine
//!
//! Playback engine for the browser-hosted Soul player.
//!
//! This crate provides:
//! - Song cache (bounded window of playable sources around the current track)
//! - Next-song resolution (sequential, shuffle, smart shuffle, pinned decisions)
//! - Crossfades (two channels, gain envelopes on the audio clock)
//! - Playback controller (state machine reconciling all of the above)
//! - Repeat modes (Off, All, One)
//! - Gapless playback and playback-rate tempo adjustment
//!
//! # Architecture
//!
//! `soul-engine` is platform-agnostic:
//! - No dependency on a particular audio output or media element
//! - No dependency on the library database
//!
//! Platform-specific pieces (channels, audio clock, byte fetching, object
//! URLs, persistent storage) are provided via traits.
//!
//! # Example: Basic Playback
//!
//! The host supplies the platform pieces: a [`SongCache`] over its blob
//! store, fetcher and object-URL factory, and a [`CrossfadeScheduler`] over
//! two media channels sharing the audio clock.
//!
//! ```rust,no_run
//! use soul_engine::{
//!     CrossfadeScheduler, Direction, PlaybackController, PlaybackSettings, Playlist, SongCache,
//!     Track,
//! };
//! use std::time::Duration;
//!
//! # async fn run(cache: SongCache, scheduler: CrossfadeScheduler) -> soul_engine::Result<()> {
//! let songs = vec![
//!     Track::new("1", "Intro", Duration::from_secs(180)).with_locator("https://music.example/1.mp3"),
//!     Track::new("2", "Outro", Duration::from_secs(200)).with_locator("https://music.example/2.mp3"),
//! ];
//! let controller = PlaybackController::new(PlaybackSettings::default(), cache, scheduler);
//!
//! controller
//!     .play(songs[0].clone(), Some(Playlist::new("mix", "Mix", songs.clone())))
//!     .await?;
//! controller.spawn_driver(Duration::from_millis(250));
//!
//! controller.advance(Direction::Next).await?;
//! controller.toggle_play_pause().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Crossfade settings
//!
//! ```rust
//! use soul_engine::{FadeCurve, PlaybackSettings};
//!
//! let settings = PlaybackSettings::from_toml(
//!     r#"
//!     crossfade_secs = 5.0
//!     crossfade_curve = "equal_power"
//!     shuffle = "smart"
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(settings.crossfade_curve, FadeCurve::EqualPower);
//! ```

pub mod automation;
pub mod cache;
pub mod channel;
pub mod clock;
mod controller;
pub mod crossfade;
mod error;
pub mod events;
pub mod fetch;
pub mod history;
pub mod media;
pub mod resolver;
pub mod settings;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;

// Public exports
pub use cache::{CacheEntry, PlayableFactory, PlayableHandle, SongCache};
pub use channel::{AudioChannel, MediaSource};
pub use clock::{AudioClock, TokioClock};
pub use controller::PlaybackController;
pub use crossfade::{CrossfadeScheduler, CrossfadeState, FadeCurve, FadeHandle, FadeOutcome};
pub use error::{ErrorKind, PlaybackError, Result};
pub use events::PlaybackEvent;
pub use fetch::{FetchedAudio, SourceFetcher};
pub use history::{PlayHistory, PlayRecord};
pub use media::{MediaCommand, NowPlaying};
pub use resolver::{NextSongResolver, PinContext};
pub use settings::PlaybackSettings;
pub use store::{BlobStore, FsBlobStore, MemoryBlobStore, StoredBlob};
pub use types::{
    Direction, PlaybackSession, Playlist, RepeatMode, SessionState, ShuffleMode, Track, TrackId,
};

#[cfg(feature = "http")]
pub use fetch::HttpFetcher;

//! Audio channels
//!
//! A channel is one independently playable source plus its gain control (a
//! media element routed through a gain node, in the browser). The engine owns
//! exactly two: the active one and the standby one used for crossfades.

use crate::automation::GainEvent;
use crate::cache::PlayableHandle;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// What a channel plays: a cached handle or the track's raw locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Handle(PlayableHandle),
    Locator(String),
}

impl MediaSource {
    /// Address the channel loads from
    pub fn url(&self) -> &str {
        match self {
            MediaSource::Handle(handle) => &handle.url,
            MediaSource::Locator(url) => url,
        }
    }

    /// Whether this source bypasses the cache
    pub fn is_fallback(&self) -> bool {
        matches!(self, MediaSource::Locator(_))
    }
}

/// One playable audio channel
///
/// Gain methods take times on the engine's [`AudioClock`](crate::clock::AudioClock).
#[async_trait]
pub trait AudioChannel: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Replace the source; the channel is not ready until [`wait_ready`](Self::wait_ready) resolves
    async fn load(&self, source: MediaSource) -> Result<()>;

    /// Resolve once the loaded source can play through
    async fn wait_ready(&self) -> Result<()>;

    /// Start or resume playback. Fails with `PlaybackRejected` if the platform refuses.
    async fn play(&self) -> Result<()>;

    fn pause(&self);

    /// Pause and drop the source
    fn stop(&self);

    fn seek(&self, position: Duration);

    fn position(&self) -> Duration;

    /// Media duration, once known
    fn duration(&self) -> Option<Duration>;

    fn is_playing(&self) -> bool;

    /// Loaded source, if any
    fn source(&self) -> Option<MediaSource>;

    /// Whether playback reached the end of the media
    fn has_ended(&self) -> bool;

    /// Resolve when playback reaches the end of the media
    async fn wait_ended(&self);

    fn set_playback_rate(&self, rate: f64);

    /// Current gain (evaluated at the clock's now)
    fn gain(&self) -> f32;

    /// Set gain immediately, dropping scheduled automation
    fn set_gain(&self, value: f32);

    /// Append automation events
    fn schedule_gain(&self, events: &[GainEvent]);

    /// Drop scheduled automation, holding the value reached at `at`
    fn cancel_scheduled_gain(&self, at: Duration);
}

//! Simulated platform for tests
//!
//! `SimChannel` plays "media" on the tokio clock, so paused-time tests can
//! fast-forward through whole tracks. `SimFactory` tracks every handle it
//! creates to verify release-exactly-once.

use crate::automation::{GainAutomation, GainEvent};
use crate::cache::{PlayableFactory, PlayableHandle, SongCache};
use crate::channel::{AudioChannel, MediaSource};
use crate::clock::{AudioClock, TokioClock};
use crate::controller::PlaybackController;
use crate::crossfade::CrossfadeScheduler;
use crate::error::{PlaybackError, Result};
use crate::fetch::{guess_mime_type, FetchedAudio, SourceFetcher};
use crate::resolver::NextSongResolver;
use crate::settings::PlaybackSettings;
use crate::store::MemoryBlobStore;
use crate::types::{Playlist, Track, TrackId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Track with a test locator
pub fn track(id: &str, secs: u64) -> Track {
    Track::new(id, format!("Song {}", id), Duration::from_secs(secs))
        .with_locator(format!("https://music.test/{}.mp3", id))
}

/// Playlist over `tracks`
pub fn playlist(id: &str, tracks: &[Track]) -> Playlist {
    Playlist::new(id, format!("Playlist {}", id), tracks.to_vec())
}

/// Media durations known to the simulated platform, by URL
#[derive(Debug, Clone, Default)]
pub struct SimMedia {
    inner: Arc<Mutex<SimMediaInner>>,
}

#[derive(Debug, Default)]
struct SimMediaInner {
    by_track: HashMap<TrackId, Duration>,
    by_url: HashMap<String, Duration>,
}

impl SimMedia {
    pub fn register(&self, track: &Track) {
        let mut inner = lock(&self.inner);
        inner.by_track.insert(track.id.clone(), track.duration);
        if let Some(locator) = &track.locator {
            inner.by_url.insert(locator.clone(), track.duration);
        }
    }

    fn register_handle(&self, handle: &PlayableHandle) {
        let mut inner = lock(&self.inner);
        if let Some(duration) = inner.by_track.get(&handle.track_id).copied() {
            inner.by_url.insert(handle.url.clone(), duration);
        }
    }

    fn duration_of(&self, url: &str) -> Option<Duration> {
        lock(&self.inner).by_url.get(url).copied()
    }
}

// ===== Channel =====

struct SimState {
    source: Option<MediaSource>,
    media_duration: Option<Duration>,
    ready_at: Duration,
    playing: bool,
    anchor_position: Duration,
    anchor_at: Duration,
    rate: f64,
    gain: GainAutomation,
    ready_delay: Duration,
    never_ready: bool,
    reject_play: bool,
    loads: Vec<String>,
}

impl SimState {
    fn position(&self, now: Duration) -> Duration {
        if !self.playing {
            return self.anchor_position;
        }
        let elapsed = now.saturating_sub(self.anchor_at).mul_f64(self.rate);
        let position = self.anchor_position + elapsed;
        match self.media_duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    fn has_ended(&self, now: Duration) -> bool {
        match (&self.source, self.media_duration) {
            (Some(_), Some(duration)) => {
                self.position(now) + Duration::from_millis(1) >= duration
            }
            _ => false,
        }
    }

    fn reanchor(&mut self, now: Duration) {
        self.anchor_position = self.position(now);
        self.anchor_at = now.max(self.ready_at);
    }
}

/// Audio channel simulated on the audio clock
pub struct SimChannel {
    name: String,
    clock: Arc<dyn AudioClock>,
    media: SimMedia,
    state: Mutex<SimState>,
    changed: watch::Sender<u64>,
}

impl SimChannel {
    pub fn new(name: &str, clock: Arc<dyn AudioClock>, media: SimMedia) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            name: name.to_string(),
            clock,
            media,
            state: Mutex::new(SimState {
                source: None,
                media_duration: None,
                ready_at: Duration::ZERO,
                playing: false,
                anchor_position: Duration::ZERO,
                anchor_at: Duration::ZERO,
                rate: 1.0,
                gain: GainAutomation::new(1.0),
                ready_delay: Duration::ZERO,
                never_ready: false,
                reject_play: false,
                loads: Vec::new(),
            }),
            changed,
        }
    }

    /// Delay between `load` and readiness
    pub fn set_ready_delay(&self, delay: Duration) {
        lock(&self.state).ready_delay = delay;
    }

    /// Loaded sources never become ready
    pub fn set_never_ready(&self, never: bool) {
        lock(&self.state).never_ready = never;
    }

    /// `play` fails with `PlaybackRejected`
    pub fn set_reject_play(&self, reject: bool) {
        lock(&self.state).reject_play = reject;
    }

    /// URLs loaded so far, in order
    pub fn loads(&self) -> Vec<String> {
        lock(&self.state).loads.clone()
    }

    pub fn source_url(&self) -> Option<String> {
        lock(&self.state).source.as_ref().map(|s| s.url().to_string())
    }

    pub fn playback_rate(&self) -> f64 {
        lock(&self.state).rate
    }

    /// Gain at an arbitrary clock time
    pub fn gain_at(&self, at: Duration) -> f32 {
        lock(&self.state).gain.value_at(at)
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version += 1);
    }
}

#[async_trait]
impl AudioChannel for SimChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, source: MediaSource) -> Result<()> {
        {
            let now = self.clock.now();
            let mut state = lock(&self.state);
            state.loads.push(source.url().to_string());
            state.media_duration = self.media.duration_of(source.url());
            state.source = Some(source);
            state.ready_at = now + state.ready_delay;
            state.playing = false;
            state.anchor_position = Duration::ZERO;
            state.anchor_at = now;
        }
        self.notify();
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        let (ready_at, never_ready, known) = {
            let state = lock(&self.state);
            if state.source.is_none() {
                return Err(PlaybackError::InvalidState("no source loaded".to_string()));
            }
            (state.ready_at, state.never_ready, state.media_duration.is_some())
        };

        if never_ready {
            std::future::pending::<()>().await;
        }
        self.clock.sleep_until(ready_at).await;

        if known {
            Ok(())
        } else {
            Err(PlaybackError::Fetch(format!("{}: unplayable media", self.name)))
        }
    }

    async fn play(&self) -> Result<()> {
        {
            let now = self.clock.now();
            let mut state = lock(&self.state);
            if state.reject_play {
                return Err(PlaybackError::PlaybackRejected(
                    "play() is not allowed without user interaction".to_string(),
                ));
            }
            if state.source.is_none() {
                return Err(PlaybackError::InvalidState("no source loaded".to_string()));
            }
            if state.has_ended(now) {
                state.anchor_position = Duration::ZERO;
                state.playing = false;
            }
            if !state.playing {
                state.anchor_at = now.max(state.ready_at);
                state.playing = true;
            }
        }
        self.notify();
        Ok(())
    }

    fn pause(&self) {
        {
            let now = self.clock.now();
            let mut state = lock(&self.state);
            state.anchor_position = state.position(now);
            state.anchor_at = now;
            state.playing = false;
        }
        self.notify();
    }

    fn stop(&self) {
        {
            let mut state = lock(&self.state);
            state.playing = false;
            state.source = None;
            state.media_duration = None;
            state.anchor_position = Duration::ZERO;
        }
        self.notify();
    }

    fn seek(&self, position: Duration) {
        {
            let now = self.clock.now();
            let mut state = lock(&self.state);
            let target = match state.media_duration {
                Some(duration) => position.min(duration),
                None => position,
            };
            state.anchor_position = target;
            state.anchor_at = now.max(state.ready_at);
        }
        self.notify();
    }

    fn position(&self) -> Duration {
        lock(&self.state).position(self.clock.now())
    }

    fn duration(&self) -> Option<Duration> {
        lock(&self.state).media_duration
    }

    fn is_playing(&self) -> bool {
        let now = self.clock.now();
        let state = lock(&self.state);
        state.playing && !state.has_ended(now)
    }

    fn source(&self) -> Option<MediaSource> {
        lock(&self.state).source.clone()
    }

    fn has_ended(&self) -> bool {
        lock(&self.state).has_ended(self.clock.now())
    }

    async fn wait_ended(&self) {
        let mut changed = self.changed.subscribe();
        loop {
            let until_end = {
                let now = self.clock.now();
                let state = lock(&self.state);
                if state.has_ended(now) {
                    return;
                }
                match (state.playing, state.media_duration) {
                    (true, Some(duration)) => {
                        let start = state.anchor_at.saturating_sub(now);
                        let left = duration.saturating_sub(state.position(now));
                        Some(start + left.div_f64(state.rate))
                    }
                    _ => None,
                }
            };

            match until_end {
                Some(wait) => {
                    tokio::select! {
                        _ = changed.changed() => {}
                        _ = self.clock.sleep(wait) => {}
                    }
                }
                None => {
                    if changed.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }

    fn set_playback_rate(&self, rate: f64) {
        {
            let now = self.clock.now();
            let mut state = lock(&self.state);
            state.reanchor(now);
            state.rate = rate;
        }
        self.notify();
    }

    fn gain(&self) -> f32 {
        lock(&self.state).gain.value_at(self.clock.now())
    }

    fn set_gain(&self, value: f32) {
        lock(&self.state).gain.set_value(value);
    }

    fn schedule_gain(&self, events: &[GainEvent]) {
        let mut state = lock(&self.state);
        for event in events {
            match *event {
                GainEvent::SetValueAtTime { value, at } => state.gain.set_value_at_time(value, at),
                GainEvent::LinearRampTo { value, end } => state.gain.linear_ramp_to(value, end),
                GainEvent::ExponentialRampTo { value, end } => {
                    state.gain.exponential_ramp_to(value, end)
                }
            }
        }
    }

    fn cancel_scheduled_gain(&self, at: Duration) {
        lock(&self.state).gain.cancel_and_hold(at);
    }
}

// ===== Factory =====

#[derive(Debug, Default)]
struct FactoryState {
    next_id: u64,
    live: HashSet<String>,
    created: usize,
    released: Vec<PlayableHandle>,
    double_releases: usize,
    failing: HashSet<TrackId>,
}

/// Playable factory that tracks every handle it hands out
#[derive(Debug, Default)]
pub struct SimFactory {
    media: SimMedia,
    state: Mutex<FactoryState>,
}

impl SimFactory {
    pub fn new(media: SimMedia) -> Self {
        Self {
            media,
            state: Mutex::default(),
        }
    }

    /// Make `create` fail for a track
    pub fn fail_for(&self, track_id: &str) {
        lock(&self.state).failing.insert(track_id.to_string());
    }

    pub fn created(&self) -> usize {
        lock(&self.state).created
    }

    pub fn released(&self) -> Vec<PlayableHandle> {
        lock(&self.state).released.clone()
    }

    /// Handles created and not yet released
    pub fn live(&self) -> usize {
        lock(&self.state).live.len()
    }

    /// Releases of handles that were never created or already released
    pub fn double_releases(&self) -> usize {
        lock(&self.state).double_releases
    }
}

impl PlayableFactory for SimFactory {
    fn create(&self, track_id: &str, bytes: &Bytes, mime_type: &str) -> Result<PlayableHandle> {
        let handle = {
            let mut state = lock(&self.state);
            if state.failing.contains(track_id) {
                return Err(PlaybackError::CacheFailure {
                    track_id: track_id.to_string(),
                    reason: format!("cannot decode {} bytes", bytes.len()),
                });
            }

            state.next_id += 1;
            state.created += 1;
            let handle = PlayableHandle {
                track_id: track_id.to_string(),
                url: format!("blob:sim/{}/{}", track_id, state.next_id),
                mime_type: mime_type.to_string(),
            };
            state.live.insert(handle.url.clone());
            handle
        };

        self.media.register_handle(&handle);
        Ok(handle)
    }

    fn release(&self, handle: PlayableHandle) {
        let mut state = lock(&self.state);
        if !state.live.remove(&handle.url) {
            state.double_releases += 1;
        }
        state.released.push(handle);
    }
}

// ===== Fetcher =====

#[derive(Debug, Default)]
struct FetcherState {
    bodies: HashMap<String, Bytes>,
    counts: HashMap<String, usize>,
    failing: HashSet<String>,
    delay: Duration,
}

/// Fetcher serving fixed bodies, with per-locator call counts
#[derive(Debug, Default)]
pub struct StaticFetcher {
    state: Mutex<FetcherState>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, locator: &str, body: Bytes) {
        lock(&self.state).bodies.insert(locator.to_string(), body);
    }

    /// Make every fetch of `locator` fail
    pub fn fail(&self, locator: &str) {
        lock(&self.state).failing.insert(locator.to_string());
    }

    /// Latency added to every fetch
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    pub fn fetch_count(&self, locator: &str) -> usize {
        lock(&self.state).counts.get(locator).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, locator: &str) -> Result<FetchedAudio> {
        let delay = {
            let mut state = lock(&self.state);
            *state.counts.entry(locator.to_string()).or_insert(0) += 1;
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = lock(&self.state);
        if state.failing.contains(locator) {
            return Err(PlaybackError::Fetch(format!("HTTP 503 for {}", locator)));
        }
        let bytes = state
            .bodies
            .get(locator)
            .cloned()
            .ok_or_else(|| PlaybackError::Fetch(format!("HTTP 404 for {}", locator)))?;

        Ok(FetchedAudio {
            bytes,
            mime_type: guess_mime_type(locator).to_string(),
        })
    }
}

// ===== Backend =====

/// Everything a controller needs, simulated
pub struct SimBackend {
    pub clock: Arc<TokioClock>,
    pub media: SimMedia,
    pub store: Arc<MemoryBlobStore>,
    pub fetcher: Arc<StaticFetcher>,
    pub factory: Arc<SimFactory>,
    pub first: Arc<SimChannel>,
    pub second: Arc<SimChannel>,
}

impl SimBackend {
    /// Backend that can serve every track in `tracks`
    pub fn new(tracks: &[Track]) -> Self {
        let clock = Arc::new(TokioClock::new());
        let media = SimMedia::default();
        let fetcher = Arc::new(StaticFetcher::new());

        for track in tracks {
            media.register(track);
            if let Some(locator) = &track.locator {
                fetcher.insert(locator, Bytes::from(format!("audio:{}", track.id)));
            }
        }

        let audio_clock: Arc<dyn AudioClock> = clock.clone();
        Self {
            first: Arc::new(SimChannel::new("A", audio_clock.clone(), media.clone())),
            second: Arc::new(SimChannel::new("B", audio_clock, media.clone())),
            factory: Arc::new(SimFactory::new(media.clone())),
            store: Arc::new(MemoryBlobStore::new()),
            clock,
            media,
            fetcher,
        }
    }

    pub fn cache(&self, capacity: usize) -> SongCache {
        SongCache::new(
            self.store.clone(),
            self.fetcher.clone(),
            self.factory.clone(),
            capacity,
        )
    }

    pub fn scheduler(&self) -> CrossfadeScheduler {
        CrossfadeScheduler::new(self.first.clone(), self.second.clone(), self.clock.clone())
    }

    /// Controller over this backend with a seeded resolver
    pub fn controller(&self, settings: PlaybackSettings) -> PlaybackController {
        let cache = self.cache(settings.cache_capacity);
        PlaybackController::with_resolver(
            settings,
            cache,
            self.scheduler(),
            NextSongResolver::with_seed(7),
        )
    }

    /// Channel currently holding `url`, if any
    pub fn channel_playing(&self, url_prefix: &str) -> Option<Arc<SimChannel>> {
        [&self.first, &self.second]
            .into_iter()
            .find(|c| c.source_url().is_some_and(|u| u.starts_with(url_prefix)))
            .cloned()
    }
}

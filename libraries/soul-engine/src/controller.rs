//! Playback controller
//!
//! Top-level state machine composing the song cache, the next-song resolver
//! and the crossfade scheduler.
//!
//! ```text
//! Idle ──load──> Loaded ──play──> Playing ⇄ Paused
//!                                   │  ▲
//!                    crossfade/switch  │ commit, cancel or timeout
//!                                   ▼  │
//!                              Transitioning
//! ```
//!
//! All mutable state sits behind one async mutex, so public operations are
//! linearizable. Background work (crossfade driver, deferred preload, delayed
//! advance) re-checks a generation counter after re-acquiring the lock and
//! discards itself when superseded.

use crate::cache::SongCache;
use crate::channel::MediaSource;
use crate::crossfade::{CrossfadeScheduler, FadeCurve, FadeOutcome};
use crate::error::{PlaybackError, Result};
use crate::events::PlaybackEvent;
use crate::history::PlayHistory;
use crate::media::{MediaCommand, NowPlaying};
use crate::resolver::{NextSongResolver, PinContext};
use crate::settings::{PlaybackSettings, MAX_PLAYBACK_RATE, MIN_PLAYBACK_RATE};
use crate::types::{
    Direction, PlaybackSession, Playlist, RepeatMode, SessionState, ShuffleMode, Track,
};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

const EVENT_CAPACITY: usize = 64;

/// A crossfade in flight
#[derive(Debug, Clone)]
struct Transition {
    outgoing: Track,
    incoming: Track,
    /// Fade-in started; observers already see `incoming` as current
    began: bool,
}

struct ControllerState {
    settings: PlaybackSettings,
    resolver: NextSongResolver,
    history: PlayHistory,

    /// What observers see
    session: PlaybackSession,

    /// Track whose source sits in the active channel
    committed: Option<Track>,
    source_loaded: bool,

    playlist: Option<Playlist>,
    transition: Option<Transition>,

    /// Bumped on every hard switch, commit and cancel
    generation: u64,
    /// Bumped whenever a pending delayed advance must be dropped
    advance_epoch: u64,

    /// Natural end of the current source was already handled
    ended_handled: bool,
    /// Crossfade failed; switch abruptly at the natural end
    abrupt_fallback: bool,
}

impl ControllerState {
    fn resolver_repeat(&self) -> RepeatMode {
        // Manual skips under repeat-one wrap like repeat-all
        match self.session.repeat {
            RepeatMode::One => RepeatMode::All,
            other => other,
        }
    }

    /// Record history for the track leaving the active channel
    fn leave_committed(&mut self) {
        if self.source_loaded {
            if let Some(track) = &self.committed {
                NextSongResolver::record_played(&mut self.history, &track.id);
            }
        }
    }
}

struct ControllerInner {
    cache: SongCache,
    scheduler: CrossfadeScheduler,
    state: Mutex<ControllerState>,
    session_tx: watch::Sender<PlaybackSession>,
    events_tx: broadcast::Sender<PlaybackEvent>,
    driver: StdMutex<Option<AbortHandle>>,
}

/// Playback controller
///
/// Cheap to clone; clones control the same session.
#[derive(Clone)]
pub struct PlaybackController {
    inner: Arc<ControllerInner>,
}

impl PlaybackController {
    /// Create a controller with an entropy-seeded resolver
    pub fn new(settings: PlaybackSettings, cache: SongCache, scheduler: CrossfadeScheduler) -> Self {
        Self::with_resolver(settings, cache, scheduler, NextSongResolver::new())
    }

    /// Create a controller with a specific resolver (e.g. a seeded one)
    pub fn with_resolver(
        settings: PlaybackSettings,
        cache: SongCache,
        scheduler: CrossfadeScheduler,
        resolver: NextSongResolver,
    ) -> Self {
        scheduler.set_load_timeout(settings.load_timeout());

        let session = PlaybackSession {
            shuffle: settings.shuffle,
            repeat: settings.repeat,
            ..Default::default()
        };
        let (session_tx, _) = watch::channel(session.clone());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(ControllerInner {
                cache,
                scheduler,
                state: Mutex::new(ControllerState {
                    settings,
                    resolver,
                    history: PlayHistory::new(),
                    session,
                    committed: None,
                    source_loaded: false,
                    playlist: None,
                    transition: None,
                    generation: 0,
                    advance_epoch: 0,
                    ended_handled: false,
                    abrupt_fallback: false,
                }),
                session_tx,
                events_tx,
                driver: StdMutex::new(None),
            }),
        }
    }

    // ===== Observation =====

    /// Latest published session
    pub fn session(&self) -> PlaybackSession {
        self.inner.session_tx.borrow().clone()
    }

    /// Session updates
    pub fn subscribe(&self) -> watch::Receiver<PlaybackSession> {
        self.inner.session_tx.subscribe()
    }

    /// Event stream
    pub fn events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Metadata for the OS media session
    pub fn now_playing(&self) -> Option<NowPlaying> {
        NowPlaying::from_session(&self.inner.session_tx.borrow())
    }

    pub fn cache(&self) -> &SongCache {
        &self.inner.cache
    }

    pub fn scheduler(&self) -> &CrossfadeScheduler {
        &self.inner.scheduler
    }

    /// Snapshot of the play history
    pub async fn history(&self) -> PlayHistory {
        self.lock().await.history.clone()
    }

    /// Replace the play history (e.g. restored from storage)
    pub async fn set_history(&self, history: PlayHistory) {
        let mut st = self.lock().await;
        st.history = history;
        st.resolver.invalidate_pin();
    }

    pub async fn settings(&self) -> PlaybackSettings {
        self.lock().await.settings.clone()
    }

    // ===== Operations =====

    /// Select a track without starting playback
    pub async fn load(&self, track: Track, playlist: Option<Playlist>) {
        let mut st = self.lock().await;
        self.cancel_transition(&mut st);
        st.generation += 1;
        st.advance_epoch += 1;

        st.leave_committed();
        self.inner.scheduler.active_channel().stop();
        self.set_playlist(&mut st, playlist);

        let previous = st.session.current_track.as_ref().map(|t| t.id.clone());
        st.committed = Some(track.clone());
        st.source_loaded = false;
        st.session.current_track = Some(track.clone());
        st.session.playing = false;
        st.session.position = track.start_offset();
        st.session.duration = track.duration;
        self.protect_playing(&st);
        self.track_changed(previous, &track);
        self.set_state(&mut st, SessionState::Loaded);
        self.publish(&st);
    }

    /// Play `track`, optionally switching playlists
    #[instrument(skip_all, fields(track_id = %track.id))]
    pub async fn play(&self, track: Track, playlist: Option<Playlist>) -> Result<()> {
        let mut st = self.lock().await;
        self.play_locked(&mut st, track, playlist).await
    }

    /// Playing ⇄ Paused; starts the loaded (or first) track if nothing is loaded
    pub async fn toggle_play_pause(&self) -> Result<()> {
        let mut st = self.lock().await;

        if Self::is_playing(&st) {
            self.pause_locked(&mut st);
            Ok(())
        } else {
            self.start_locked(&mut st).await
        }
    }

    /// Skip to the next or previous track
    ///
    /// Returns the track now playing, or `None` if there is nothing to skip to.
    #[instrument(skip(self))]
    pub async fn advance(&self, direction: Direction) -> Result<Option<Track>> {
        let mut st = self.lock().await;
        self.advance_locked(&mut st, direction).await
    }

    /// Position report from the active channel
    pub async fn on_time_update(&self, position: Duration, duration: Duration) {
        let mut st = self.lock().await;
        self.time_update_locked(&mut st, position, duration);
    }

    /// Natural end of the active channel's media
    pub async fn on_track_ended(&self) {
        let mut st = self.lock().await;
        self.track_ended_locked(&mut st).await;
    }

    /// Seek within the current track
    pub async fn seek(&self, position: Duration) -> Result<()> {
        let mut st = self.lock().await;
        if !st.source_loaded {
            return Err(PlaybackError::NoTrackLoaded);
        }

        self.settle_transition(&mut st);
        st.advance_epoch += 1;

        let channel = self.inner.scheduler.active_channel();
        let duration = channel.duration().unwrap_or(st.session.duration);
        let target = position.min(duration);
        channel.seek(target);

        st.ended_handled = false;
        st.session.position = target;
        self.publish(&st);
        Ok(())
    }

    /// Stop playback, keeping the current track selected
    pub async fn stop(&self) {
        let mut st = self.lock().await;
        self.cancel_transition(&mut st);
        st.generation += 1;
        st.advance_epoch += 1;

        self.inner.scheduler.active_channel().stop();
        st.source_loaded = false;
        st.session.playing = false;
        st.session.position = Duration::ZERO;

        let state = if st.session.current_track.is_some() {
            SessionState::Loaded
        } else {
            SessionState::Idle
        };
        self.set_state(&mut st, state);
        self.publish(&st);
    }

    pub async fn set_shuffle(&self, mode: ShuffleMode) {
        let mut st = self.lock().await;
        if st.session.shuffle == mode {
            return;
        }
        st.session.shuffle = mode;
        st.settings.shuffle = mode;
        st.resolver.invalidate_pin();
        self.publish(&st);
        self.schedule_preload(&st, Duration::ZERO);
    }

    pub async fn set_repeat(&self, mode: RepeatMode) {
        let mut st = self.lock().await;
        if st.session.repeat == mode {
            return;
        }
        st.session.repeat = mode;
        st.settings.repeat = mode;
        st.resolver.invalidate_pin();
        self.publish(&st);
        self.schedule_preload(&st, Duration::ZERO);
    }

    /// Apply new settings
    pub async fn set_settings(&self, settings: PlaybackSettings) -> Result<()> {
        settings.validate()?;

        let mut st = self.lock().await;
        self.inner.scheduler.set_load_timeout(settings.load_timeout());

        if settings.playback_rate != st.settings.playback_rate {
            self.apply_rate(&st, settings.playback_rate);
        }
        if settings.shuffle != st.session.shuffle || settings.repeat != st.session.repeat {
            st.session.shuffle = settings.shuffle;
            st.session.repeat = settings.repeat;
            st.resolver.invalidate_pin();
        }

        st.settings = settings;
        self.publish(&st);
        Ok(())
    }

    /// Set the tempo multiplier (clamped to 0.5–2.0); returns the applied rate
    pub async fn set_playback_rate(&self, rate: f64) -> f64 {
        let rate = if rate.is_finite() {
            rate.clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE)
        } else {
            1.0
        };

        let mut st = self.lock().await;
        st.settings.playback_rate = rate;
        self.apply_rate(&st, rate);
        rate
    }

    /// Dispatch a command from the OS media controls
    pub async fn handle_media_command(&self, command: MediaCommand) -> Result<()> {
        debug!(?command, "Media command");

        match command {
            MediaCommand::Play => {
                let mut st = self.lock().await;
                if !Self::is_playing(&st) {
                    self.start_locked(&mut st).await?;
                }
            }
            MediaCommand::Pause => {
                let mut st = self.lock().await;
                if Self::is_playing(&st) {
                    self.pause_locked(&mut st);
                }
            }
            MediaCommand::PlayPause => self.toggle_play_pause().await?,
            MediaCommand::Next => {
                self.advance(Direction::Next).await?;
            }
            MediaCommand::Previous => {
                self.advance(Direction::Previous).await?;
            }
            MediaCommand::Stop => self.stop().await,
            MediaCommand::SeekTo(position) => self.seek(position).await?,
        }
        Ok(())
    }

    /// Poll the active channel every `period`, feeding time updates and track ends
    ///
    /// Replaces any previously spawned driver.
    pub fn spawn_driver(&self, period: Duration) -> JoinHandle<()> {
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                controller.poll().await;
            }
        });

        let mut driver = self.inner.driver.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = driver.replace(handle.abort_handle()) {
            previous.abort();
        }
        handle
    }

    /// Stop everything and release every cached resource
    pub async fn shutdown(&self) {
        if let Some(driver) = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            driver.abort();
        }

        let mut st = self.lock().await;
        self.cancel_transition(&mut st);
        st.generation += 1;
        st.advance_epoch += 1;

        self.inner.scheduler.teardown();
        self.inner.cache.evict_all();

        st.source_loaded = false;
        st.session.playing = false;
        self.set_state(&mut st, SessionState::Idle);
        self.publish(&st);
        info!("Playback controller shut down");
    }

    // ===== Internals =====

    async fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.state.lock().await
    }

    async fn play_locked(
        &self,
        st: &mut ControllerState,
        track: Track,
        playlist: Option<Playlist>,
    ) -> Result<()> {
        self.cancel_transition(st);
        st.generation += 1;
        st.advance_epoch += 1;
        self.set_playlist(st, playlist);

        let previous = st.session.current_track.as_ref().map(|t| t.id.clone());
        self.set_state(st, SessionState::Transitioning);

        // Both the outgoing and the incoming track stay cached during the switch
        let outgoing = st.committed.as_ref().map(|t| t.id.as_str());
        self.inner
            .cache
            .protect(outgoing.into_iter().chain([track.id.as_str()]));

        let source = match self.source_for(&track, st.settings.load_timeout()).await {
            Ok(source) => source,
            Err(e) => return Err(self.abort_switch(st, e)),
        };

        let channel = self.inner.scheduler.active_channel();
        channel.pause();
        channel.set_gain(1.0);
        channel.set_playback_rate(st.settings.playback_rate);
        if let Err(e) = channel.load(source).await {
            return Err(self.abort_switch(st, e));
        }
        channel.seek(track.start_offset());

        st.leave_committed();
        st.committed = Some(track.clone());
        st.source_loaded = true;
        st.ended_handled = false;
        st.abrupt_fallback = false;
        st.session.current_track = Some(track.clone());
        st.session.position = track.start_offset();
        st.session.duration = track.duration;
        self.protect_playing(st);
        self.track_changed(previous, &track);

        let started = channel.play().await;
        match &started {
            Ok(()) => {
                info!(track_id = %track.id, "Playing");
                st.session.playing = true;
                self.set_state(st, SessionState::Playing);
            }
            Err(e) => {
                warn!(track_id = %track.id, error = %e, "Playback rejected");
                st.session.playing = false;
                self.set_state(st, SessionState::Paused);
                self.emit(PlaybackEvent::error(e));
            }
        }

        self.publish(st);
        let delay = st.settings.preload_delay();
        self.schedule_preload(st, delay);
        started
    }

    /// Undo a failed hard switch; returns the error for propagation
    fn abort_switch(&self, st: &mut ControllerState, err: PlaybackError) -> PlaybackError {
        error!(error = %err, "Failed to switch track");
        self.emit(PlaybackEvent::error(&err));

        self.inner.scheduler.active_channel().pause();
        self.protect_playing(st);
        st.session.playing = false;
        let state = if st.source_loaded {
            SessionState::Paused
        } else if st.session.current_track.is_some() {
            SessionState::Loaded
        } else {
            SessionState::Idle
        };
        self.set_state(st, state);
        self.publish(st);
        err
    }

    fn is_playing(st: &ControllerState) -> bool {
        st.source_loaded && st.session.playing
    }

    /// Resume the loaded track, or start the selected (or first) one
    async fn start_locked(&self, st: &mut ControllerState) -> Result<()> {
        if st.source_loaded {
            return self.resume_locked(st).await;
        }

        let track = st
            .session
            .current_track
            .clone()
            .or_else(|| st.playlist.as_ref().and_then(|p| p.tracks.first().cloned()))
            .ok_or(PlaybackError::NoTrackLoaded)?;
        self.play_locked(st, track, None).await
    }

    fn pause_locked(&self, st: &mut ControllerState) {
        self.settle_transition(st);
        st.advance_epoch += 1;

        let channel = self.inner.scheduler.active_channel();
        channel.pause();
        st.session.playing = false;
        st.session.position = channel.position();
        self.set_state(st, SessionState::Paused);
        self.publish(st);
    }

    async fn resume_locked(&self, st: &mut ControllerState) -> Result<()> {
        let channel = self.inner.scheduler.active_channel();

        if channel.has_ended() {
            if let Some(track) = st.committed.clone() {
                return self.play_locked(st, track, None).await;
            }
        }

        match channel.play().await {
            Ok(()) => {
                st.session.playing = true;
                self.set_state(st, SessionState::Playing);
                self.publish(st);
                Ok(())
            }
            Err(e) => {
                self.emit(PlaybackEvent::error(&e));
                self.set_state(st, SessionState::Paused);
                self.publish(st);
                Err(e)
            }
        }
    }

    async fn advance_locked(
        &self,
        st: &mut ControllerState,
        direction: Direction,
    ) -> Result<Option<Track>> {
        // Resolve relative to what the user perceives as current
        let base = st.session.current_track.clone();
        self.cancel_transition(st);

        let Some(playlist) = st.playlist.clone() else {
            debug!("Advance without a playlist");
            return Ok(None);
        };

        let shuffle = st.session.shuffle;
        let repeat = st.resolver_repeat();

        let next = match direction {
            Direction::Next => {
                let context = PinContext::new(&playlist, base.as_ref(), shuffle, st.session.repeat);
                match st.resolver.take_pin(&context) {
                    Some(pinned) => Some(pinned),
                    None => st.resolver.resolve_next(
                        &playlist,
                        base.as_ref(),
                        shuffle,
                        repeat,
                        &st.history,
                    ),
                }
            }
            Direction::Previous => {
                st.resolver.invalidate_pin();
                st.resolver.resolve_previous(
                    &playlist,
                    base.as_ref(),
                    shuffle,
                    repeat,
                    &st.history,
                )
            }
        };

        let Some(next) = next else {
            debug!(?direction, "Nothing to advance to");
            self.publish(st);
            return Ok(None);
        };

        self.play_locked(st, next.clone(), None).await?;
        Ok(Some(next))
    }

    fn time_update_locked(&self, st: &mut ControllerState, position: Duration, duration: Duration) {
        if st.transition.is_none() {
            st.session.position = position;
            st.session.duration = duration;
            self.publish(st);
        }

        if st.transition.is_some() || st.abrupt_fallback || !st.session.playing {
            return;
        }
        let Some(fade) = st.settings.crossfade_duration() else {
            return;
        };
        if st.session.repeat == RepeatMode::One || !st.settings.autoplay {
            return;
        }
        let (Some(current), Some(playlist)) = (st.committed.clone(), st.playlist.clone()) else {
            return;
        };

        let rate = st.settings.playback_rate;
        let end = current.effective_end(duration);
        let remaining = end.saturating_sub(position).div_f64(rate);
        if remaining > fade || remaining.is_zero() {
            return;
        }

        let shuffle = st.session.shuffle;
        let repeat = st.session.repeat;
        let Some(incoming) =
            st.resolver
                .pin_next(&playlist, Some(&current), shuffle, repeat, &st.history)
        else {
            return;
        };

        info!(
            from = %current.id,
            to = %incoming.id,
            remaining_ms = remaining.as_millis() as u64,
            "Starting crossfade"
        );

        st.transition = Some(Transition {
            outgoing: current.clone(),
            incoming: incoming.clone(),
            began: false,
        });
        self.protect_playing(st);
        self.set_state(st, SessionState::Transitioning);
        self.publish(st);

        let job = CrossfadeJob {
            generation: st.generation,
            outgoing: current,
            incoming,
            duration: fade.min(remaining),
            curve: st.settings.crossfade_curve,
            rate,
            load_timeout: st.settings.load_timeout(),
        };
        let controller = self.clone();
        tokio::spawn(async move { controller.run_crossfade(job).await });
    }

    async fn track_ended_locked(&self, st: &mut ControllerState) {
        match st.transition.as_ref().map(|t| t.began) {
            Some(true) => {
                debug!("Track end handled by crossfade");
                return;
            }
            Some(false) => {
                warn!("Track ended before the crossfade could begin, switching abruptly");
                self.cancel_transition(st);
            }
            None => {}
        }
        let Some(current) = st.committed.clone() else {
            return;
        };
        if !st.source_loaded {
            return;
        }

        self.emit(PlaybackEvent::TrackEnded {
            track_id: current.id.clone(),
        });

        if st.session.repeat == RepeatMode::One {
            st.leave_committed();
            st.ended_handled = false;
            let channel = self.inner.scheduler.active_channel();
            channel.seek(current.start_offset());
            st.session.position = current.start_offset();
            if let Err(e) = channel.play().await {
                self.emit(PlaybackEvent::error(&e));
                st.session.playing = false;
                self.set_state(st, SessionState::Paused);
            }
            self.publish(st);
            return;
        }

        if !st.settings.autoplay {
            st.session.playing = false;
            st.session.position = st.session.duration;
            self.set_state(st, SessionState::Paused);
            self.publish(st);
            return;
        }

        if st.settings.gapless {
            self.advance_or_finish(st).await;
            return;
        }

        st.advance_epoch += 1;
        let epoch = st.advance_epoch;
        let gap = st.settings.track_gap();
        debug!(gap_ms = gap.as_millis() as u64, "Delaying advance");

        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(gap).await;
            let mut st = controller.lock().await;
            if st.advance_epoch == epoch {
                controller.advance_or_finish(&mut st).await;
            }
        });
    }

    async fn advance_or_finish(&self, st: &mut ControllerState) {
        match self.advance_locked(st, Direction::Next).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!("Reached end of playlist");
                st.session.playing = false;
                st.session.position = st.session.duration;
                self.set_state(st, SessionState::Paused);
                self.publish(st);
            }
            // Already surfaced by play_locked
            Err(e) => debug!(error = %e, "Auto-advance failed"),
        }
    }

    async fn poll(&self) {
        let mut st = self.lock().await;

        if let Some(began) = st.transition.as_ref().map(|t| t.began) {
            if began {
                // Roles may already have swapped while the commit waits for the lock
                let incoming = if self.inner.scheduler.is_active() {
                    self.inner.scheduler.standby_channel()
                } else {
                    self.inner.scheduler.active_channel()
                };
                st.session.position = incoming.position();
                self.publish(&st);
                return;
            }

            // Incoming still loading; the outgoing track may run out first
            if !st.ended_handled && self.inner.scheduler.active_channel().has_ended() {
                st.ended_handled = true;
                self.track_ended_locked(&mut st).await;
            }
            return;
        }
        if !st.source_loaded || !st.session.playing {
            return;
        }
        let Some(track) = st.committed.clone() else {
            return;
        };

        let channel = self.inner.scheduler.active_channel();
        let position = channel.position();
        let duration = channel.duration().unwrap_or(track.duration);
        let trimmed_end = track.gapless.is_some_and(|g| !g.end.is_zero())
            && position >= track.effective_end(duration);

        if channel.has_ended() || trimmed_end {
            if !st.ended_handled {
                st.ended_handled = true;
                self.track_ended_locked(&mut st).await;
            }
        } else {
            self.time_update_locked(&mut st, position, duration);
        }
    }

    async fn run_crossfade(&self, job: CrossfadeJob) {
        // Materializing and loading the incoming track share one deadline
        let timeout = job.load_timeout;
        let prepared: Result<()> = tokio::time::timeout(timeout, async {
            let source = self.source_for(&job.incoming, timeout).await?;
            self.inner
                .scheduler
                .prepare_incoming(source, job.incoming.start_offset(), job.rate)
                .await
        })
        .await
        .unwrap_or(Err(PlaybackError::CrossfadeLoadTimeout(timeout)));

        if let Err(e) = prepared {
            return self.crossfade_failed(job.generation, e).await;
        }

        let handle = {
            let mut st = self.lock().await;
            if st.generation != job.generation || st.transition.is_none() {
                return;
            }

            let handle = match self.inner.scheduler.begin(job.duration, job.curve).await {
                Ok(handle) => handle,
                Err(e) => {
                    drop(st);
                    return self.crossfade_failed(job.generation, e).await;
                }
            };

            if let Some(transition) = st.transition.as_mut() {
                transition.began = true;
            }
            st.session.current_track = Some(job.incoming.clone());
            st.session.position = job.incoming.start_offset();
            st.session.duration = job.incoming.duration;
            self.track_changed(Some(job.outgoing.id.clone()), &job.incoming);
            self.emit(PlaybackEvent::CrossfadeStarted {
                from_track_id: job.outgoing.id.clone(),
                to_track_id: job.incoming.id.clone(),
                duration_ms: job.duration.as_millis() as u64,
            });
            self.publish(&st);
            handle
        };

        let outcome = handle.wait().await;

        let mut st = self.lock().await;
        if st.generation != job.generation {
            return;
        }
        match outcome {
            FadeOutcome::Completed { .. } => self.commit_crossfade(&mut st),
            FadeOutcome::Cancelled => {
                st.transition = None;
                self.set_state(&mut st, SessionState::Playing);
                self.publish(&st);
            }
        }
    }

    async fn crossfade_failed(&self, generation: u64, err: PlaybackError) {
        let mut st = self.lock().await;
        if st.generation != generation || matches!(err, PlaybackError::Cancelled) {
            return;
        }

        warn!(error = %err, "Crossfade failed, switching abruptly at track end");
        if matches!(err, PlaybackError::SourceUnavailable(_)) {
            self.emit(PlaybackEvent::error(&err));
        }

        self.inner.scheduler.cancel();
        st.transition = None;
        st.abrupt_fallback = true;
        self.protect_playing(&st);
        let state = if st.session.playing {
            SessionState::Playing
        } else {
            SessionState::Paused
        };
        self.set_state(&mut st, state);
        self.publish(&st);
    }

    /// Incoming track becomes the committed one
    fn commit_crossfade(&self, st: &mut ControllerState) {
        let Some(transition) = st.transition.take() else {
            return;
        };

        st.leave_committed();
        st.committed = Some(transition.incoming.clone());
        st.session.current_track = Some(transition.incoming.clone());
        st.session.duration = transition.incoming.duration;
        st.source_loaded = true;
        st.ended_handled = false;
        st.abrupt_fallback = false;
        self.protect_playing(st);
        st.resolver.invalidate_pin();
        st.generation += 1;
        st.advance_epoch += 1;

        self.emit(PlaybackEvent::CrossfadeCompleted {
            track_id: transition.incoming.id.clone(),
        });
        self.set_state(st, SessionState::Playing);
        self.publish(st);

        let delay = st.settings.preload_delay();
        self.schedule_preload(st, delay);
    }

    /// Drop any crossfade, restoring the outgoing track as current
    fn cancel_transition(&self, st: &mut ControllerState) {
        self.inner.scheduler.cancel();

        let Some(transition) = st.transition.take() else {
            return;
        };
        st.generation += 1;
        self.protect_playing(st);

        if transition.began {
            st.session.current_track = Some(transition.outgoing.clone());
            st.session.duration = transition.outgoing.duration;
        }
        debug!(incoming = %transition.incoming.id, "Crossfade cancelled");
        self.emit(PlaybackEvent::CrossfadeCancelled);

        let state = if st.session.playing {
            SessionState::Playing
        } else {
            SessionState::Paused
        };
        self.set_state(st, state);
    }

    /// Finish a running fade now, or drop one that has not started yet
    fn settle_transition(&self, st: &mut ControllerState) {
        let began = st.transition.as_ref().is_some_and(|t| t.began);
        if began && self.inner.scheduler.complete_now() {
            self.commit_crossfade(st);
        } else {
            self.cancel_transition(st);
        }
    }

    /// Cached handle for `track`, or its locator if the cache fails or is too slow
    async fn source_for(&self, track: &Track, timeout: Duration) -> Result<MediaSource> {
        let cached = tokio::time::timeout(timeout, self.inner.cache.ensure_cached(track))
            .await
            .unwrap_or_else(|_| {
                Err(PlaybackError::CacheFailure {
                    track_id: track.id.clone(),
                    reason: format!("not materialized within {}ms", timeout.as_millis()),
                })
            });

        match cached {
            Ok(handle) => Ok(MediaSource::Handle(handle)),
            Err(PlaybackError::SourceUnavailable(id)) => Err(PlaybackError::SourceUnavailable(id)),
            Err(e) => {
                warn!(track_id = %track.id, error = %e, "Cache failed, falling back to locator");
                track
                    .locator
                    .clone()
                    .map(MediaSource::Locator)
                    .ok_or_else(|| PlaybackError::SourceUnavailable(track.id.clone()))
            }
        }
    }

    /// Keep the committed track and any fading-in track out of eviction
    fn protect_playing(&self, st: &ControllerState) {
        let committed = st.committed.iter();
        let incoming = st.transition.iter().map(|t| &t.incoming);
        self.inner
            .cache
            .protect(committed.chain(incoming).map(|t| t.id.as_str()));
    }

    /// Resolve and pin the next track after `delay`, then slide the cache window
    fn schedule_preload(&self, st: &ControllerState, delay: Duration) {
        let generation = st.generation;
        let controller = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut st = controller.lock().await;
            if st.generation != generation {
                return;
            }
            let Some(current) = st.committed.clone() else {
                return;
            };
            let playlist = st
                .playlist
                .clone()
                .unwrap_or_else(|| Playlist::new(current.id.clone(), "", vec![current.clone()]));

            let next = if st.session.repeat == RepeatMode::One {
                None
            } else {
                let shuffle = st.session.shuffle;
                let repeat = st.session.repeat;
                let ControllerState {
                    resolver, history, ..
                } = &mut *st;
                resolver.pin_next(&playlist, Some(&current), shuffle, repeat, history)
            };

            let settings = &st.settings;
            controller.inner.cache.update_window(
                &current,
                &playlist,
                settings.window_behind,
                settings.window_ahead,
                next.as_ref(),
            );

            if let Some(next) = next {
                debug!(track_id = %next.id, "Next track prepared");
                controller.emit(PlaybackEvent::NextTrackPrepared { track_id: next.id });
            }
        });
    }

    fn set_playlist(&self, st: &mut ControllerState, playlist: Option<Playlist>) {
        let Some(playlist) = playlist else {
            return;
        };
        if st.playlist.as_ref().map(|p| &p.id) != Some(&playlist.id) {
            st.resolver.invalidate_pin();
        }
        st.session.current_playlist = Some(playlist.clone());
        st.playlist = Some(playlist);
    }

    fn apply_rate(&self, st: &ControllerState, rate: f64) {
        self.inner.scheduler.active_channel().set_playback_rate(rate);
        if st.transition.is_some() {
            self.inner.scheduler.standby_channel().set_playback_rate(rate);
        }
    }

    fn set_state(&self, st: &mut ControllerState, state: SessionState) {
        if st.session.state != state {
            st.session.state = state;
            self.emit(PlaybackEvent::StateChanged { state });
        }
    }

    fn track_changed(&self, previous: Option<String>, track: &Track) {
        if previous.as_deref() != Some(track.id.as_str()) {
            self.emit(PlaybackEvent::TrackChanged {
                track_id: track.id.clone(),
                previous_track_id: previous,
            });
        }
    }

    fn publish(&self, st: &ControllerState) {
        self.inner.session_tx.send_replace(st.session.clone());
    }

    fn emit(&self, event: PlaybackEvent) {
        // No subscribers is fine
        let _ = self.inner.events_tx.send(event);
    }
}

struct CrossfadeJob {
    generation: u64,
    outgoing: Track,
    incoming: Track,
    duration: Duration,
    curve: FadeCurve,
    rate: f64,
    load_timeout: Duration,
}

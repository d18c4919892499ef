//! Next/previous track resolution
//!
//! Implements sequential order, uniform shuffle, and smart shuffle
//! (weighted against recently and frequently played tracks), plus the
//! pinned decision shared by the preload and commit call sites.

use crate::history::PlayHistory;
use crate::types::{PlaylistId, Playlist, RepeatMode, ShuffleMode, Track, TrackId};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

/// Everything a pinned decision depends on
///
/// A pin is only reused while all of these still match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinContext {
    pub playlist_id: PlaylistId,
    pub current_id: Option<TrackId>,
    pub shuffle: ShuffleMode,
    pub repeat: RepeatMode,
}

impl PinContext {
    pub fn new(
        playlist: &Playlist,
        current: Option<&Track>,
        shuffle: ShuffleMode,
        repeat: RepeatMode,
    ) -> Self {
        Self {
            playlist_id: playlist.id.clone(),
            current_id: current.map(|t| t.id.clone()),
            shuffle,
            repeat,
        }
    }
}

#[derive(Debug, Clone)]
struct PinnedDecision {
    context: PinContext,
    track: Track,
}

/// Chooses the next or previous track
pub struct NextSongResolver {
    rng: StdRng,
    pin: Option<PinnedDecision>,
}

impl NextSongResolver {
    /// Create a resolver seeded from OS entropy
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            pin: None,
        }
    }

    /// Create a deterministic resolver
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            pin: None,
        }
    }

    /// Resolve the track that follows `current`
    ///
    /// `RepeatMode::One` is handled by the controller; here it behaves like `Off`.
    pub fn resolve_next(
        &mut self,
        playlist: &Playlist,
        current: Option<&Track>,
        mode: ShuffleMode,
        repeat: RepeatMode,
        history: &PlayHistory,
    ) -> Option<Track> {
        self.resolve_next_at(playlist, current, mode, repeat, history, Utc::now())
    }

    /// `resolve_next` with an explicit clock for smart-shuffle scoring
    pub fn resolve_next_at(
        &mut self,
        playlist: &Playlist,
        current: Option<&Track>,
        mode: ShuffleMode,
        repeat: RepeatMode,
        history: &PlayHistory,
        now: DateTime<Utc>,
    ) -> Option<Track> {
        if playlist.is_empty() {
            return None;
        }

        match mode {
            ShuffleMode::Off => sequential_next(playlist, current, repeat),
            ShuffleMode::Random => self.pick_random(playlist, current),
            ShuffleMode::Smart => self.pick_smart(playlist, current, history, now),
        }
    }

    /// Resolve the track that precedes `current`
    ///
    /// Shuffle modes draw a fresh candidate instead of walking back through history.
    pub fn resolve_previous(
        &mut self,
        playlist: &Playlist,
        current: Option<&Track>,
        mode: ShuffleMode,
        repeat: RepeatMode,
        history: &PlayHistory,
    ) -> Option<Track> {
        if playlist.is_empty() {
            return None;
        }

        match mode {
            ShuffleMode::Off => sequential_previous(playlist, current, repeat),
            ShuffleMode::Random => self.pick_random(playlist, current),
            ShuffleMode::Smart => self.pick_smart(playlist, current, history, Utc::now()),
        }
    }

    /// Record a committed play
    pub fn record_played(history: &mut PlayHistory, track_id: &str) {
        Self::record_played_at(history, track_id, Utc::now());
    }

    /// Record a committed play at an explicit time
    pub fn record_played_at(history: &mut PlayHistory, track_id: &str, now: DateTime<Utc>) {
        history.record_at(track_id, now);
    }

    // ===== Pinned decision =====

    /// Return the pinned next track, resolving and pinning a fresh one if the
    /// current pin is missing or stale
    pub fn pin_next(
        &mut self,
        playlist: &Playlist,
        current: Option<&Track>,
        mode: ShuffleMode,
        repeat: RepeatMode,
        history: &PlayHistory,
    ) -> Option<Track> {
        let context = PinContext::new(playlist, current, mode, repeat);

        if let Some(pin) = &self.pin {
            if pin.context == context {
                return Some(pin.track.clone());
            }
        }

        let track = self.resolve_next(playlist, current, mode, repeat, history)?;
        debug!(track_id = %track.id, "Pinned next track");
        self.pin = Some(PinnedDecision {
            context,
            track: track.clone(),
        });
        Some(track)
    }

    /// Peek at the pin without consuming it (only if still valid)
    pub fn pinned(&self, context: &PinContext) -> Option<&Track> {
        self.pin
            .as_ref()
            .filter(|pin| &pin.context == context)
            .map(|pin| &pin.track)
    }

    /// Consume the pin if it is still valid for `context`
    pub fn take_pin(&mut self, context: &PinContext) -> Option<Track> {
        match self.pin.take() {
            Some(pin) if &pin.context == context => Some(pin.track),
            _ => None,
        }
    }

    /// Drop the pin
    pub fn invalidate_pin(&mut self) {
        self.pin = None;
    }

    /// Whether a pin is held (valid or not)
    pub fn has_pin(&self) -> bool {
        self.pin.is_some()
    }

    // ===== Selection =====

    fn pick_random(&mut self, playlist: &Playlist, current: Option<&Track>) -> Option<Track> {
        let pool = candidates(playlist, current);
        pool.choose(&mut self.rng).map(|t| (*t).clone())
    }

    fn pick_smart(
        &mut self,
        playlist: &Playlist,
        current: Option<&Track>,
        history: &PlayHistory,
        now: DateTime<Utc>,
    ) -> Option<Track> {
        let pool = candidates(playlist, current);
        pool.choose_weighted(&mut self.rng, |t| smart_weight(history.score(&t.id, now)))
            .ok()
            .map(|t| (*t).clone())
    }
}

impl Default for NextSongResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Selection weight for a smart-shuffle score: `1 / (1 + score)^2`
///
/// Never-played tracks (score 0) get the maximal weight of 1.
pub fn smart_weight(score: f64) -> f64 {
    let denom = 1.0 + score.max(0.0);
    1.0 / (denom * denom)
}

/// Tracks eligible for a random pick: everything but `current` when there is a choice
fn candidates<'a>(playlist: &'a Playlist, current: Option<&Track>) -> Vec<&'a Track> {
    let all: Vec<&Track> = playlist.tracks.iter().collect();
    let Some(current) = current else {
        return all;
    };

    let others: Vec<&Track> = all.iter().copied().filter(|t| t.id != current.id).collect();
    if others.is_empty() {
        all
    } else {
        others
    }
}

fn sequential_next(playlist: &Playlist, current: Option<&Track>, repeat: RepeatMode) -> Option<Track> {
    let Some(index) = current.and_then(|t| playlist.index_of(&t.id)) else {
        return playlist.tracks.first().cloned();
    };

    if index + 1 < playlist.len() {
        Some(playlist.tracks[index + 1].clone())
    } else if repeat == RepeatMode::All {
        playlist.tracks.first().cloned()
    } else {
        None
    }
}

fn sequential_previous(
    playlist: &Playlist,
    current: Option<&Track>,
    repeat: RepeatMode,
) -> Option<Track> {
    let Some(index) = current.and_then(|t| playlist.index_of(&t.id)) else {
        return playlist.tracks.first().cloned();
    };

    if index > 0 {
        Some(playlist.tracks[index - 1].clone())
    } else if repeat == RepeatMode::All {
        playlist.tracks.last().cloned()
    } else {
        None
    }
}

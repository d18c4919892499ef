//! Play history tracking
//!
//! Recency and frequency per track, read by smart shuffle.

use crate::types::TrackId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Recency/frequency record for one track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayRecord {
    /// When the track was last played
    pub last_played_at: DateTime<Utc>,

    /// How many times the track was played
    pub play_count: u32,
}

/// Play history keyed by track id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayHistory {
    records: HashMap<TrackId, PlayRecord>,
}

impl PlayHistory {
    /// Create empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for a track, `None` if never played
    pub fn get(&self, track_id: &str) -> Option<&PlayRecord> {
        self.records.get(track_id)
    }

    /// Record a play at an explicit time
    pub fn record_at(&mut self, track_id: &str, now: DateTime<Utc>) -> PlayRecord {
        let record = self
            .records
            .entry(track_id.to_string())
            .and_modify(|r| {
                r.last_played_at = now;
                r.play_count = r.play_count.saturating_add(1);
            })
            .or_insert(PlayRecord {
                last_played_at: now,
                play_count: 1,
            });
        *record
    }

    /// Insert or replace a record (used when restoring persisted history)
    pub fn insert(&mut self, track_id: impl Into<TrackId>, record: PlayRecord) {
        self.records.insert(track_id.into(), record);
    }

    /// Smart-shuffle score: `play_count / (1 + hours since last played)`
    ///
    /// Lower is preferred. Never-played tracks score 0.
    pub fn score(&self, track_id: &str, now: DateTime<Utc>) -> f64 {
        match self.records.get(track_id) {
            None => 0.0,
            Some(record) => {
                let elapsed = now.signed_duration_since(record.last_played_at);
                let hours = (elapsed.num_seconds().max(0) as f64) / 3600.0;
                f64::from(record.play_count) / (1.0 + hours)
            }
        }
    }

    /// Number of tracks with a record
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was played yet
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

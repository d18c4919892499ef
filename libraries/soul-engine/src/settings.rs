//! Playback settings
//!
//! Supplied by the settings collaborator. Can be loaded from a TOML file with
//! `SOUL_PLAYBACK_*` environment overrides.

use crate::crossfade::FadeCurve;
use crate::error::{PlaybackError, Result};
use crate::types::{RepeatMode, ShuffleMode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Slowest allowed tempo
pub const MIN_PLAYBACK_RATE: f64 = 0.5;

/// Fastest allowed tempo
pub const MAX_PLAYBACK_RATE: f64 = 2.0;

/// Longest allowed crossfade (seconds)
pub const MAX_CROSSFADE_SECS: f64 = 12.0;

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSettings {
    /// Crossfade duration in seconds (0 disables crossfading)
    #[serde(default = "default_crossfade_secs")]
    pub crossfade_secs: f64,

    /// Gain curve used for crossfades
    #[serde(default)]
    pub crossfade_curve: FadeCurve,

    /// Initial shuffle mode
    #[serde(default)]
    pub shuffle: ShuffleMode,

    /// Initial repeat mode
    #[serde(default)]
    pub repeat: RepeatMode,

    /// Automatically continue with the next track
    #[serde(default = "default_true")]
    pub autoplay: bool,

    /// Start the next track immediately when the current one ends
    #[serde(default = "default_true")]
    pub gapless: bool,

    /// Pause between tracks when gapless is off (ms)
    #[serde(default = "default_track_gap_ms")]
    pub track_gap_ms: u64,

    /// Delay before warming the cache after a track starts (ms)
    #[serde(default = "default_preload_delay_ms")]
    pub preload_delay_ms: u64,

    /// Tracks behind the current one kept cached
    #[serde(default = "default_window_behind")]
    pub window_behind: usize,

    /// Tracks ahead of the current one kept cached
    #[serde(default = "default_window_ahead")]
    pub window_ahead: usize,

    /// Hard upper bound on cached entries
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// How long a channel may take to become playable (ms)
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,

    /// Tempo multiplier applied to both channels
    #[serde(default = "default_playback_rate")]
    pub playback_rate: f64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            crossfade_secs: default_crossfade_secs(),
            crossfade_curve: FadeCurve::default(),
            shuffle: ShuffleMode::Off,
            repeat: RepeatMode::Off,
            autoplay: true,
            gapless: true,
            track_gap_ms: default_track_gap_ms(),
            preload_delay_ms: default_preload_delay_ms(),
            window_behind: default_window_behind(),
            window_ahead: default_window_ahead(),
            cache_capacity: default_cache_capacity(),
            load_timeout_ms: default_load_timeout_ms(),
            playback_rate: default_playback_rate(),
        }
    }
}

impl PlaybackSettings {
    /// Load settings from an optional TOML file, then environment (`SOUL_PLAYBACK_*`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SOUL_PLAYBACK").try_parsing(true),
        );

        let settings: Self = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string
    pub fn from_toml(source: &str) -> Result<Self> {
        let settings: Self = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if !self.crossfade_secs.is_finite()
            || self.crossfade_secs < 0.0
            || self.crossfade_secs > MAX_CROSSFADE_SECS
        {
            return Err(PlaybackError::Config(format!(
                "crossfade_secs must be between 0 and {}, got {}",
                MAX_CROSSFADE_SECS, self.crossfade_secs
            )));
        }

        if !(MIN_PLAYBACK_RATE..=MAX_PLAYBACK_RATE).contains(&self.playback_rate) {
            return Err(PlaybackError::Config(format!(
                "playback_rate must be between {} and {}, got {}",
                MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE, self.playback_rate
            )));
        }

        if self.cache_capacity == 0 {
            return Err(PlaybackError::Config(
                "cache_capacity must be at least 1".to_string(),
            ));
        }

        if self.load_timeout_ms == 0 {
            return Err(PlaybackError::Config(
                "load_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Crossfade duration, `None` when crossfading is disabled
    pub fn crossfade_duration(&self) -> Option<Duration> {
        if self.crossfade_secs > 0.0 {
            Some(Duration::from_secs_f64(self.crossfade_secs))
        } else {
            None
        }
    }

    pub fn track_gap(&self) -> Duration {
        Duration::from_millis(self.track_gap_ms)
    }

    pub fn preload_delay(&self) -> Duration {
        Duration::from_millis(self.preload_delay_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

fn default_crossfade_secs() -> f64 {
    0.0
}

fn default_true() -> bool {
    true
}

fn default_track_gap_ms() -> u64 {
    500
}

fn default_preload_delay_ms() -> u64 {
    1000
}

fn default_window_behind() -> usize {
    1
}

fn default_window_ahead() -> usize {
    2
}

fn default_cache_capacity() -> usize {
    8
}

fn default_load_timeout_ms() -> u64 {
    5000
}

fn default_playback_rate() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_settings() {
        let settings = PlaybackSettings::default();
        assert!(settings.crossfade_duration().is_none());
        assert!(settings.autoplay);
        assert!(settings.gapless);
        assert_eq!(settings.load_timeout(), Duration::from_secs(5));
        assert_eq!(settings.crossfade_curve, FadeCurve::EqualPower);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn parse_from_toml() {
        let settings = PlaybackSettings::from_toml(
            r#"
            crossfade_secs = 5.0
            crossfade_curve = "exponential"
            shuffle = "smart"
            repeat = "all"
            gapless = false
            "#,
        )
        .unwrap();

        assert_eq!(settings.crossfade_duration(), Some(Duration::from_secs(5)));
        assert_eq!(settings.crossfade_curve, FadeCurve::Exponential);
        assert_eq!(settings.shuffle, ShuffleMode::Smart);
        assert_eq!(settings.repeat, RepeatMode::All);
        assert!(!settings.gapless);
        // Untouched fields keep defaults
        assert_eq!(settings.track_gap_ms, 500);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(PlaybackSettings::from_toml("crossfade_secs = -1.0").is_err());
        assert!(PlaybackSettings::from_toml("playback_rate = 3.0").is_err());
        assert!(PlaybackSettings::from_toml("cache_capacity = 0").is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "crossfade_secs = 3.0").unwrap();
        writeln!(file, "window_ahead = 4").unwrap();

        let settings = PlaybackSettings::load(Some(file.path())).unwrap();
        assert_eq!(settings.crossfade_duration(), Some(Duration::from_secs(3)));
        assert_eq!(settings.window_ahead, 4);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let settings =
            PlaybackSettings::load(Some(Path::new("/nonexistent/soul-playback.toml"))).unwrap();
        assert_eq!(settings.window_behind, 1);
    }
}

//! Crossfade scheduler for smooth track transitions
//!
//! Drives two audio channels through a timed gain handoff. Envelopes are
//! scheduled on the audio clock up front, so the fade does not drift with
//! task scheduling.
//!
//! Curves:
//! - Linear: straight ramps (has a 3dB dip at the midpoint)
//! - Exponential: exponential ramps, never reaching exactly 0
//! - Equal Power: constant perceived loudness (best for music, default)
//!
//! State machine:
//!
//! ```text
//! Idle ──prepare_incoming──> Preparing ──begin──> Fading ──> Completing ──> Idle
//!   ▲                            │                  │
//!   └──────── cancel() ──────────┴──── Cancelled ───┘
//! ```

use crate::automation::{GainEvent, MIN_EXPONENTIAL_GAIN};
use crate::channel::{AudioChannel, MediaSource};
use crate::clock::AudioClock;
use crate::error::{PlaybackError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Number of linear segments approximating the equal-power curve
pub const EQUAL_POWER_STEPS: u32 = 20;

/// Default bound on incoming-channel readiness
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Crossfade curve type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// Linear fade: simple and predictable
    Linear,

    /// Exponential fade, floored at [`MIN_EXPONENTIAL_GAIN`]
    Exponential,

    /// Equal power fade: maintains perceived loudness
    /// This is the default and best choice for music crossfades
    #[default]
    EqualPower,
}

impl FadeCurve {
    /// Ideal gain at a normalized position in the fade
    ///
    /// # Arguments
    /// * `position` - Normalized position in the fade (0.0 to 1.0)
    /// * `fade_out` - If true, calculates fade-out gain; if false, fade-in gain
    #[inline]
    pub fn calculate_gain(&self, position: f32, fade_out: bool) -> f32 {
        let x = position.clamp(0.0, 1.0);

        match self {
            FadeCurve::Linear => {
                if fade_out {
                    1.0 - x
                } else {
                    x
                }
            }

            FadeCurve::Exponential => {
                let floor = MIN_EXPONENTIAL_GAIN;
                if fade_out {
                    floor.powf(x)
                } else {
                    floor.powf(1.0 - x)
                }
            }

            FadeCurve::EqualPower => {
                // sqrt(x)^2 + sqrt(1-x)^2 = 1
                if fade_out {
                    (1.0 - x).sqrt()
                } else {
                    x.sqrt()
                }
            }
        }
    }

    /// Automation events for one side of a fade starting at `start`
    pub fn envelope(&self, start: Duration, duration: Duration, fade_out: bool) -> Vec<GainEvent> {
        let end = start + duration;

        match self {
            FadeCurve::Linear => vec![
                GainEvent::SetValueAtTime {
                    value: self.calculate_gain(0.0, fade_out),
                    at: start,
                },
                GainEvent::LinearRampTo {
                    value: self.calculate_gain(1.0, fade_out),
                    end,
                },
            ],

            FadeCurve::Exponential => vec![
                GainEvent::SetValueAtTime {
                    value: self.calculate_gain(0.0, fade_out),
                    at: start,
                },
                GainEvent::ExponentialRampTo {
                    value: self.calculate_gain(1.0, fade_out),
                    end,
                },
            ],

            FadeCurve::EqualPower => {
                let mut events = Vec::with_capacity(EQUAL_POWER_STEPS as usize + 1);
                events.push(GainEvent::SetValueAtTime {
                    value: self.calculate_gain(0.0, fade_out),
                    at: start,
                });
                for step in 1..=EQUAL_POWER_STEPS {
                    let x = step as f64 / EQUAL_POWER_STEPS as f64;
                    events.push(GainEvent::LinearRampTo {
                        value: self.calculate_gain(x as f32, fade_out),
                        end: start + duration.mul_f64(x),
                    });
                }
                events
            }
        }
    }

    /// Human-readable name for the curve
    pub fn display_name(&self) -> &'static str {
        match self {
            FadeCurve::Linear => "Linear",
            FadeCurve::Exponential => "Exponential",
            FadeCurve::EqualPower => "Equal Power",
        }
    }
}

/// Crossfade state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CrossfadeState {
    /// No crossfade, normal playback
    #[default]
    Idle,

    /// Incoming channel is loading
    Preparing,

    /// Gain envelopes are running
    Fading,

    /// Envelope finished, roles are being swapped
    Completing,

    /// Being torn down by `cancel()`
    Cancelled,
}

impl CrossfadeState {
    /// Whether a crossfade is in progress
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CrossfadeState::Preparing | CrossfadeState::Fading | CrossfadeState::Completing
        )
    }
}

/// How a fade ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeOutcome {
    /// Roles swapped. `early` when the outgoing track ended before the envelope did.
    Completed { early: bool },

    /// Cancelled or superseded before completion
    Cancelled,
}

struct SchedulerState {
    phase: CrossfadeState,
    /// Index of the active (outgoing) channel
    active: usize,
    generation: u64,
    token: CancellationToken,
    load_timeout: Duration,
}

struct Shared {
    channels: [Arc<dyn AudioChannel>; 2],
    clock: Arc<dyn AudioClock>,
    state: Mutex<SchedulerState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap roles if `generation` is still the running fade
    fn finish(&self, generation: u64) -> bool {
        let mut state = self.state();
        if state.generation != generation || state.phase != CrossfadeState::Fading {
            return false;
        }

        state.phase = CrossfadeState::Completing;
        let outgoing = &self.channels[state.active];
        let incoming = &self.channels[1 - state.active];

        outgoing.stop();
        outgoing.set_gain(0.0);
        incoming.set_gain(1.0);

        state.active = 1 - state.active;
        state.phase = CrossfadeState::Idle;
        true
    }
}

/// Two-channel crossfade scheduler
///
/// Cheap to clone; clones drive the same channels.
#[derive(Clone)]
pub struct CrossfadeScheduler {
    shared: Arc<Shared>,
}

impl CrossfadeScheduler {
    /// Create a scheduler over two channels; `first` starts as the active one
    pub fn new(
        first: Arc<dyn AudioChannel>,
        second: Arc<dyn AudioChannel>,
        clock: Arc<dyn AudioClock>,
    ) -> Self {
        first.set_gain(1.0);
        second.set_gain(0.0);

        Self {
            shared: Arc::new(Shared {
                channels: [first, second],
                clock,
                state: Mutex::new(SchedulerState {
                    phase: CrossfadeState::Idle,
                    active: 0,
                    generation: 0,
                    token: CancellationToken::new(),
                    load_timeout: DEFAULT_LOAD_TIMEOUT,
                }),
            }),
        }
    }

    /// Bound on incoming-channel readiness
    pub fn set_load_timeout(&self, timeout: Duration) {
        self.shared.state().load_timeout = timeout;
    }

    pub fn state(&self) -> CrossfadeState {
        self.shared.state().phase
    }

    /// True while preparing, fading or completing
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Channel the user currently hears as the main one
    pub fn active_channel(&self) -> Arc<dyn AudioChannel> {
        let state = self.shared.state();
        self.shared.channels[state.active].clone()
    }

    /// Channel used for the next incoming track
    pub fn standby_channel(&self) -> Arc<dyn AudioChannel> {
        let state = self.shared.state();
        self.shared.channels[1 - state.active].clone()
    }

    /// Load `source` into the standby channel, primed at `start_offset` with gain 0
    ///
    /// Bounded by the load timeout; fails with `CrossfadeLoadTimeout` and
    /// returns to idle if the channel never becomes ready.
    pub async fn prepare_incoming(
        &self,
        source: MediaSource,
        start_offset: Duration,
        rate: f64,
    ) -> Result<()> {
        let (standby, token, generation, timeout) = {
            let mut state = self.shared.state();
            if state.phase.is_active() {
                return Err(PlaybackError::InvalidState(
                    "crossfade already in progress".to_string(),
                ));
            }

            state.generation += 1;
            state.token = CancellationToken::new();
            state.phase = CrossfadeState::Preparing;

            (
                self.shared.channels[1 - state.active].clone(),
                state.token.clone(),
                state.generation,
                state.load_timeout,
            )
        };

        debug!(channel = standby.name(), url = source.url(), "Preparing incoming channel");

        standby.cancel_scheduled_gain(self.shared.clock.now());
        standby.set_gain(0.0);
        standby.set_playback_rate(rate);

        let ready = async {
            standby.load(source).await?;
            standby.wait_ready().await
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(PlaybackError::Cancelled),
            outcome = tokio::time::timeout(timeout, ready) => match outcome {
                Ok(ready) => ready,
                Err(_) => Err(PlaybackError::CrossfadeLoadTimeout(timeout)),
            },
        };

        let mut state = self.shared.state();
        let current = state.generation == generation && state.phase == CrossfadeState::Preparing;

        match result {
            Ok(()) if current => {
                standby.seek(start_offset);
                Ok(())
            }
            Ok(()) => Err(PlaybackError::Cancelled),
            Err(e) => {
                if current {
                    warn!(error = %e, "Incoming channel failed to load");
                    state.phase = CrossfadeState::Idle;
                    standby.stop();
                }
                Err(e)
            }
        }
    }

    /// Start the prepared fade; returns a handle that resolves when it ends
    ///
    /// Requires a ready incoming channel (see [`prepare_incoming`](Self::prepare_incoming)).
    pub async fn begin(&self, duration: Duration, curve: FadeCurve) -> Result<FadeHandle> {
        let (outgoing, incoming, token, generation, end) = {
            let mut state = self.shared.state();
            if state.phase != CrossfadeState::Preparing {
                return Err(PlaybackError::InvalidState(format!(
                    "cannot begin crossfade from {:?}",
                    state.phase
                )));
            }

            let outgoing = self.shared.channels[state.active].clone();
            let incoming = self.shared.channels[1 - state.active].clone();

            let now = self.shared.clock.now();
            outgoing.cancel_scheduled_gain(now);
            outgoing.schedule_gain(&curve.envelope(now, duration, true));
            incoming.cancel_scheduled_gain(now);
            incoming.schedule_gain(&curve.envelope(now, duration, false));

            state.phase = CrossfadeState::Fading;
            (outgoing, incoming, state.token.clone(), state.generation, now + duration)
        };

        if let Err(e) = incoming.play().await {
            let mut state = self.shared.state();
            if state.generation == generation {
                state.generation += 1;
                state.phase = CrossfadeState::Idle;
                self.reset_gains(&outgoing, &incoming);
            }
            return Err(e);
        }

        if self.shared.state().generation != generation {
            incoming.stop();
            return Err(PlaybackError::Cancelled);
        }

        info!(
            duration_ms = duration.as_millis() as u64,
            curve = curve.display_name(),
            "Crossfade started"
        );

        Ok(FadeHandle {
            shared: self.shared.clone(),
            outgoing,
            token,
            generation,
            end,
        })
    }

    /// `begin` followed by `wait`
    pub async fn start(&self, duration: Duration, curve: FadeCurve) -> Result<FadeOutcome> {
        let handle = self.begin(duration, curve).await?;
        Ok(handle.wait().await)
    }

    /// Abort any crossfade. Idempotent and safe from any state.
    ///
    /// Outgoing gain returns to 1, incoming to 0, and the incoming channel stops.
    /// Returns whether a crossfade was in progress.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state();
        if !state.phase.is_active() {
            return false;
        }

        state.phase = CrossfadeState::Cancelled;
        state.generation += 1;
        state.token.cancel();

        let outgoing = &self.shared.channels[state.active];
        let incoming = &self.shared.channels[1 - state.active];
        self.reset_gains(outgoing, incoming);

        state.phase = CrossfadeState::Idle;
        info!("Crossfade cancelled");
        true
    }

    /// Finish a running fade immediately: incoming at full gain, outgoing stopped
    ///
    /// A fade still preparing is cancelled instead. Returns whether roles swapped.
    /// The pending [`FadeHandle`] resolves as `Cancelled`.
    pub fn complete_now(&self) -> bool {
        let generation = {
            let mut state = self.shared.state();
            let phase = state.phase;
            match phase {
                CrossfadeState::Fading => {}
                CrossfadeState::Preparing => {
                    drop(state);
                    self.cancel();
                    return false;
                }
                _ => return false,
            }

            // Detach the waiting handle, then finish under the new generation
            state.generation += 1;
            state.token.cancel();
            let now = self.shared.clock.now();
            for channel in &self.shared.channels {
                channel.cancel_scheduled_gain(now);
            }
            state.generation
        };

        let swapped = self.shared.finish(generation);
        if swapped {
            info!("Crossfade completed early");
        }
        swapped
    }

    /// Stop both channels and drop any crossfade
    pub fn teardown(&self) {
        self.cancel();
        for channel in &self.shared.channels {
            channel.stop();
        }
    }

    fn reset_gains(&self, outgoing: &Arc<dyn AudioChannel>, incoming: &Arc<dyn AudioChannel>) {
        let now = self.shared.clock.now();
        outgoing.cancel_scheduled_gain(now);
        outgoing.set_gain(1.0);
        incoming.cancel_scheduled_gain(now);
        incoming.set_gain(0.0);
        incoming.stop();
    }
}

/// A running fade
pub struct FadeHandle {
    shared: Arc<Shared>,
    outgoing: Arc<dyn AudioChannel>,
    token: CancellationToken,
    generation: u64,
    end: Duration,
}

impl std::fmt::Debug for FadeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FadeHandle")
            .field("generation", &self.generation)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

impl FadeHandle {
    /// Clock time at which the envelope ends
    pub fn end(&self) -> Duration {
        self.end
    }

    /// Resolve when the envelope completes, the outgoing track ends, or the fade is cancelled
    pub async fn wait(self) -> FadeOutcome {
        let early = tokio::select! {
            biased;
            _ = self.token.cancelled() => return FadeOutcome::Cancelled,
            _ = self.shared.clock.sleep_until(self.end) => false,
            _ = self.outgoing.wait_ended() => true,
        };

        if self.shared.finish(self.generation) {
            if early {
                debug!("Outgoing track ended before the envelope");
            }
            info!("Crossfade completed");
            FadeOutcome::Completed { early }
        } else {
            FadeOutcome::Cancelled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_endpoints() {
        for curve in [FadeCurve::Linear, FadeCurve::EqualPower] {
            assert_eq!(curve.calculate_gain(0.0, true), 1.0);
            assert_eq!(curve.calculate_gain(1.0, true), 0.0);
            assert_eq!(curve.calculate_gain(0.0, false), 0.0);
            assert_eq!(curve.calculate_gain(1.0, false), 1.0);
        }

        let exp = FadeCurve::Exponential;
        assert_eq!(exp.calculate_gain(0.0, true), 1.0);
        assert!((exp.calculate_gain(1.0, true) - MIN_EXPONENTIAL_GAIN).abs() < 1e-6);
        assert!((exp.calculate_gain(0.0, false) - MIN_EXPONENTIAL_GAIN).abs() < 1e-6);
    }

    #[test]
    fn equal_power_keeps_power_constant() {
        let curve = FadeCurve::EqualPower;
        for i in 0..=10 {
            let x = i as f32 / 10.0;
            let out = curve.calculate_gain(x, true);
            let inc = curve.calculate_gain(x, false);
            assert!((out * out + inc * inc - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn equal_power_envelope_has_micro_ramps() {
        let start = Duration::from_secs(10);
        let events = FadeCurve::EqualPower.envelope(start, Duration::from_secs(5), false);

        assert_eq!(events.len(), EQUAL_POWER_STEPS as usize + 1);
        assert_eq!(events[0], GainEvent::SetValueAtTime { value: 0.0, at: start });
        assert_eq!(events.last().map(GainEvent::time), Some(Duration::from_secs(15)));
        assert!(events[1..]
            .iter()
            .all(|e| matches!(e, GainEvent::LinearRampTo { .. })));
    }

    #[test]
    fn exponential_envelope_avoids_zero() {
        let events = FadeCurve::Exponential.envelope(Duration::ZERO, Duration::from_secs(2), true);
        match events[1] {
            GainEvent::ExponentialRampTo { value, .. } => assert!(value > 0.0),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn curve_serde_names() {
        let parsed: FadeCurve = serde_json::from_str("\"equal_power\"").unwrap();
        assert_eq!(parsed, FadeCurve::EqualPower);
        assert_eq!(serde_json::to_string(&FadeCurve::Exponential).unwrap(), "\"exponential\"");
        assert_eq!(FadeCurve::default(), FadeCurve::EqualPower);
    }

    #[test]
    fn state_activity() {
        assert!(!CrossfadeState::Idle.is_active());
        assert!(!CrossfadeState::Cancelled.is_active());
        assert!(CrossfadeState::Preparing.is_active());
        assert!(CrossfadeState::Fading.is_active());
        assert!(CrossfadeState::Completing.is_active());
    }
}

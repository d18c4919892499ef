//! Gain automation timeline
//!
//! A per-channel list of scheduled gain events evaluated against the audio
//! clock, modelled on audio-param automation: set-at-time, linear ramps and
//! exponential ramps. Ramps start from the previous event's time and value.

use std::time::Duration;

/// Smallest gain an exponential ramp may reach (it can never hit 0)
pub const MIN_EXPONENTIAL_GAIN: f32 = 0.001;

/// One scheduled automation event
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GainEvent {
    /// Jump to `value` at `at`
    SetValueAtTime { value: f32, at: Duration },

    /// Linear ramp to `value`, arriving at `end`
    LinearRampTo { value: f32, end: Duration },

    /// Exponential ramp to `value`, arriving at `end`
    ExponentialRampTo { value: f32, end: Duration },
}

impl GainEvent {
    /// Time at which the event's target value is reached
    pub fn time(&self) -> Duration {
        match *self {
            GainEvent::SetValueAtTime { at, .. } => at,
            GainEvent::LinearRampTo { end, .. } | GainEvent::ExponentialRampTo { end, .. } => end,
        }
    }
}

/// Gain timeline for one channel
#[derive(Debug, Clone, PartialEq)]
pub struct GainAutomation {
    base: f32,
    events: Vec<GainEvent>,
}

impl GainAutomation {
    pub fn new(initial: f32) -> Self {
        Self {
            base: initial.clamp(0.0, 1.0),
            events: Vec::new(),
        }
    }

    /// Set the gain immediately, dropping any scheduled events
    pub fn set_value(&mut self, value: f32) {
        self.base = value.clamp(0.0, 1.0);
        self.events.clear();
    }

    pub fn set_value_at_time(&mut self, value: f32, at: Duration) {
        self.push(GainEvent::SetValueAtTime {
            value: value.clamp(0.0, 1.0),
            at,
        });
    }

    pub fn linear_ramp_to(&mut self, value: f32, end: Duration) {
        self.push(GainEvent::LinearRampTo {
            value: value.clamp(0.0, 1.0),
            end,
        });
    }

    /// Exponential ramp; the target is floored at [`MIN_EXPONENTIAL_GAIN`]
    pub fn exponential_ramp_to(&mut self, value: f32, end: Duration) {
        self.push(GainEvent::ExponentialRampTo {
            value: value.clamp(MIN_EXPONENTIAL_GAIN, 1.0),
            end,
        });
    }

    /// Drop every scheduled event and hold the value the timeline had at `at`
    pub fn cancel_and_hold(&mut self, at: Duration) {
        self.base = self.value_at(at);
        self.events.clear();
    }

    /// Scheduled events, in time order
    pub fn events(&self) -> &[GainEvent] {
        &self.events
    }

    /// Time of the last scheduled event
    pub fn end_time(&self) -> Option<Duration> {
        self.events.last().map(GainEvent::time)
    }

    /// Gain at clock time `t`
    pub fn value_at(&self, t: Duration) -> f32 {
        let mut value = self.base;
        let mut since = Duration::ZERO;

        for event in &self.events {
            match *event {
                GainEvent::SetValueAtTime { value: target, at } => {
                    if at > t {
                        break;
                    }
                    value = target;
                    since = at;
                }
                GainEvent::LinearRampTo { value: target, end } => {
                    if end <= t {
                        value = target;
                        since = end;
                        continue;
                    }
                    let frac = progress(since, end, t);
                    return value + (target - value) * frac;
                }
                GainEvent::ExponentialRampTo { value: target, end } => {
                    if end <= t {
                        value = target;
                        since = end;
                        continue;
                    }
                    // Undefined from zero; hold the start value until the ramp ends
                    if value <= 0.0 {
                        return value;
                    }
                    let frac = progress(since, end, t);
                    return value * (target / value).powf(frac);
                }
            }
        }

        value
    }

    fn push(&mut self, event: GainEvent) {
        // Keep events ordered; a later insert with an earlier time goes before
        let at = event.time();
        let index = self.events.partition_point(|e| e.time() <= at);
        self.events.insert(index, event);
    }
}

impl Default for GainAutomation {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn progress(start: Duration, end: Duration, t: Duration) -> f32 {
    if end <= start || t <= start {
        return if t >= end { 1.0 } else { 0.0 };
    }
    let span = (end - start).as_secs_f64();
    (((t - start).as_secs_f64()) / span).clamp(0.0, 1.0) as f32
}

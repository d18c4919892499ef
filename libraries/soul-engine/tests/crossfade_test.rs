//! Crossfade scheduler on simulated channels
//!
//! All tests run on paused tokio time, so gain envelopes can be sampled at
//! exact clock instants.

use soul_engine::test_utils::{track, SimBackend};
use soul_engine::{
    AudioChannel, AudioClock, CrossfadeScheduler, CrossfadeState, FadeCurve, FadeOutcome,
    MediaSource, PlaybackError, Track,
};
use std::time::Duration;

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
}

fn source(track: &Track) -> MediaSource {
    MediaSource::Locator(track.locator.clone().unwrap())
}

fn assert_close(actual: f32, expected: f32, tolerance: f32) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {} ± {}, got {}",
        expected,
        tolerance,
        actual
    );
}

/// Backend with song 1 playing on the first channel
async fn playing(songs: &[Track]) -> (SimBackend, CrossfadeScheduler) {
    let backend = SimBackend::new(songs);
    let scheduler = backend.scheduler();

    backend.first.load(source(&songs[0])).await.unwrap();
    backend.first.wait_ready().await.unwrap();
    backend.first.play().await.unwrap();

    (backend, scheduler)
}

#[tokio::test(start_paused = true)]
async fn fade_completes_at_envelope_end() {
    let songs = [track("1", 30), track("2", 30)];
    let (backend, scheduler) = playing(&songs).await;
    backend.clock.sleep(secs(10.0)).await;

    scheduler.prepare_incoming(source(&songs[1]), Duration::ZERO, 1.0).await.unwrap();
    assert_eq!(scheduler.state(), CrossfadeState::Preparing);

    let handle = scheduler.begin(secs(4.0), FadeCurve::EqualPower).await.unwrap();
    assert_eq!(scheduler.state(), CrossfadeState::Fading);
    assert_eq!(handle.end(), secs(14.0));

    let outcome = handle.wait().await;
    assert_eq!(outcome, FadeOutcome::Completed { early: false });
    assert_eq!(backend.clock.now(), secs(14.0));

    // Roles swapped: the old active channel is stopped and muted
    assert_eq!(scheduler.state(), CrossfadeState::Idle);
    assert_eq!(scheduler.active_channel().name(), "B");
    assert!(backend.first.source_url().is_none());
    assert_eq!(backend.first.gain(), 0.0);
    assert_eq!(backend.second.gain(), 1.0);
    assert!(backend.second.is_playing());
    assert_eq!(backend.second.position(), secs(4.0));
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_fade_restores_gains() {
    let songs = [track("1", 30), track("2", 30)];
    let (backend, scheduler) = playing(&songs).await;
    backend.clock.sleep(secs(10.0)).await;

    scheduler.prepare_incoming(source(&songs[1]), Duration::ZERO, 1.0).await.unwrap();
    let handle = scheduler.begin(secs(4.0), FadeCurve::Linear).await.unwrap();

    backend.clock.sleep(secs(2.0)).await;
    assert_close(backend.first.gain(), 0.5, 1e-4);
    assert_close(backend.second.gain(), 0.5, 1e-4);

    assert!(scheduler.cancel());
    assert!(!scheduler.is_active());
    assert_eq!(backend.first.gain(), 1.0);
    assert_eq!(backend.second.gain(), 0.0);
    assert!(backend.second.source_url().is_none());
    assert!(backend.first.is_playing());
    assert_eq!(scheduler.active_channel().name(), "A");

    assert_eq!(handle.wait().await, FadeOutcome::Cancelled);

    // Idempotent
    assert!(!scheduler.cancel());
    assert_eq!(backend.first.gain(), 1.0);
}

#[tokio::test(start_paused = true)]
async fn outgoing_end_completes_early() {
    let songs = [track("1", 10), track("2", 30)];
    let (backend, scheduler) = playing(&songs).await;
    backend.clock.sleep(secs(8.0)).await;

    scheduler.prepare_incoming(source(&songs[1]), Duration::ZERO, 1.0).await.unwrap();
    let outcome = scheduler.start(secs(5.0), FadeCurve::Linear).await.unwrap();

    assert_eq!(outcome, FadeOutcome::Completed { early: true });
    assert_eq!(backend.clock.now(), secs(10.0));
    assert_eq!(scheduler.active_channel().name(), "B");
    assert_eq!(backend.second.gain(), 1.0);
}

#[tokio::test(start_paused = true)]
async fn incoming_that_never_loads_times_out() {
    let songs = [track("1", 30), track("2", 30)];
    let (backend, scheduler) = playing(&songs).await;
    backend.second.set_never_ready(true);

    let err = scheduler
        .prepare_incoming(source(&songs[1]), Duration::ZERO, 1.0)
        .await
        .unwrap_err();

    assert!(matches!(err, PlaybackError::CrossfadeLoadTimeout(t) if t == secs(5.0)));
    assert_eq!(backend.clock.now(), secs(5.0));
    assert_eq!(scheduler.state(), CrossfadeState::Idle);
    assert!(backend.second.source_url().is_none());
    assert!(backend.first.is_playing());
    assert_eq!(backend.first.gain(), 1.0);
}

#[tokio::test(start_paused = true)]
async fn load_timeout_is_configurable() {
    let songs = [track("1", 30), track("2", 30)];
    let (backend, scheduler) = playing(&songs).await;
    backend.second.set_never_ready(true);
    scheduler.set_load_timeout(secs(1.5));

    let err = scheduler
        .prepare_incoming(source(&songs[1]), Duration::ZERO, 1.0)
        .await
        .unwrap_err();

    assert!(matches!(err, PlaybackError::CrossfadeLoadTimeout(_)));
    assert_eq!(backend.clock.now(), secs(1.5));
}

#[tokio::test(start_paused = true)]
async fn begin_requires_prepared_incoming() {
    let songs = [track("1", 30), track("2", 30)];
    let (_backend, scheduler) = playing(&songs).await;

    let err = scheduler.begin(secs(3.0), FadeCurve::Linear).await.unwrap_err();
    assert!(matches!(err, PlaybackError::InvalidState(_)));

    scheduler.prepare_incoming(source(&songs[1]), Duration::ZERO, 1.0).await.unwrap();
    let again = scheduler
        .prepare_incoming(source(&songs[1]), Duration::ZERO, 1.0)
        .await
        .unwrap_err();
    assert!(matches!(again, PlaybackError::InvalidState(_)));

    assert!(scheduler.cancel());
    assert_eq!(scheduler.state(), CrossfadeState::Idle);
}

#[tokio::test(start_paused = true)]
async fn prepare_primes_offset_and_rate() {
    let songs = [track("1", 30), track("2", 30)];
    let (backend, scheduler) = playing(&songs).await;

    scheduler.prepare_incoming(source(&songs[1]), secs(3.0), 1.25).await.unwrap();

    assert_eq!(backend.second.position(), secs(3.0));
    assert_eq!(backend.second.playback_rate(), 1.25);
    assert_eq!(backend.second.gain(), 0.0);
    assert!(!backend.second.is_playing());
}

#[tokio::test(start_paused = true)]
async fn equal_power_keeps_loudness_through_the_fade() {
    let songs = [track("1", 30), track("2", 30)];
    let (backend, scheduler) = playing(&songs).await;
    backend.clock.sleep(secs(10.0)).await;

    scheduler.prepare_incoming(source(&songs[1]), Duration::ZERO, 1.0).await.unwrap();
    let _handle = scheduler.begin(secs(4.0), FadeCurve::EqualPower).await.unwrap();

    // Midpoint lands on a ramp boundary: both gains are exactly sqrt(0.5)
    backend.clock.sleep(secs(2.0)).await;
    let (out, inc) = (backend.first.gain(), backend.second.gain());
    assert_close(out, 0.5_f32.sqrt(), 1e-3);
    assert_close(inc, 0.5_f32.sqrt(), 1e-3);
    assert_close(out * out + inc * inc, 1.0, 1e-3);

    // Between ramp points the interpolated power stays close to 1
    for step in 1..20 {
        let at = secs(10.0 + f64::from(step) * 0.19);
        let (out, inc) = (backend.first.gain_at(at), backend.second.gain_at(at));
        assert_close(out * out + inc * inc, 1.0, 0.02);
    }
}

#[tokio::test(start_paused = true)]
async fn complete_now_swaps_immediately() {
    let songs = [track("1", 30), track("2", 30)];
    let (backend, scheduler) = playing(&songs).await;
    backend.clock.sleep(secs(10.0)).await;

    scheduler.prepare_incoming(source(&songs[1]), Duration::ZERO, 1.0).await.unwrap();
    let handle = scheduler.begin(secs(4.0), FadeCurve::Linear).await.unwrap();
    backend.clock.sleep(secs(1.0)).await;

    assert!(scheduler.complete_now());
    assert_eq!(scheduler.state(), CrossfadeState::Idle);
    assert_eq!(scheduler.active_channel().name(), "B");
    assert_eq!(backend.second.gain(), 1.0);
    assert!(backend.first.source_url().is_none());

    // Gains hold after the old envelope would have ended
    backend.clock.sleep(secs(5.0)).await;
    assert_eq!(backend.second.gain(), 1.0);

    assert_eq!(handle.wait().await, FadeOutcome::Cancelled);
    assert!(!scheduler.complete_now());
}

#[tokio::test(start_paused = true)]
async fn complete_now_while_preparing_cancels() {
    let songs = [track("1", 30), track("2", 30)];
    let (backend, scheduler) = playing(&songs).await;
    backend.second.set_never_ready(true);

    let preparing = {
        let scheduler = scheduler.clone();
        let incoming = source(&songs[1]);
        tokio::spawn(async move { scheduler.prepare_incoming(incoming, Duration::ZERO, 1.0).await })
    };

    backend.clock.sleep(secs(1.0)).await;
    assert_eq!(scheduler.state(), CrossfadeState::Preparing);

    assert!(!scheduler.complete_now());
    assert_eq!(scheduler.state(), CrossfadeState::Idle);
    assert_eq!(scheduler.active_channel().name(), "A");

    let result = preparing.await.unwrap();
    assert!(matches!(result, Err(PlaybackError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn rejected_play_resets_gains() {
    let songs = [track("1", 30), track("2", 30)];
    let (backend, scheduler) = playing(&songs).await;
    backend.second.set_reject_play(true);

    scheduler.prepare_incoming(source(&songs[1]), Duration::ZERO, 1.0).await.unwrap();
    let err = scheduler.begin(secs(4.0), FadeCurve::Linear).await.unwrap_err();

    assert!(matches!(err, PlaybackError::PlaybackRejected(_)));
    assert_eq!(scheduler.state(), CrossfadeState::Idle);
    assert_eq!(backend.first.gain(), 1.0);
    assert_eq!(backend.second.gain(), 0.0);
    assert_eq!(scheduler.active_channel().name(), "A");
}

#[tokio::test(start_paused = true)]
async fn teardown_stops_both_channels() {
    let songs = [track("1", 30), track("2", 30)];
    let (backend, scheduler) = playing(&songs).await;

    scheduler.prepare_incoming(source(&songs[1]), Duration::ZERO, 1.0).await.unwrap();
    scheduler.teardown();

    assert_eq!(scheduler.state(), CrossfadeState::Idle);
    assert!(backend.first.source_url().is_none());
    assert!(backend.second.source_url().is_none());
}

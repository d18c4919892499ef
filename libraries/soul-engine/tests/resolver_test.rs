//! Next-song resolution: shuffle properties, smart weighting, pinning

use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use soul_engine::test_utils::{playlist, track};
use soul_engine::{NextSongResolver, PinContext, PlayHistory, Playlist, RepeatMode, ShuffleMode};

fn numbered(n: usize) -> Playlist {
    let tracks: Vec<_> = (0..n).map(|i| track(&format!("t{}", i), 180)).collect();
    playlist("p", &tracks)
}

proptest! {
    /// Property: shuffle never repeats the current track when there is a choice
    #[test]
    fn shuffle_never_returns_current(
        size in 2usize..30,
        current in 0usize..30,
        seed in any::<u64>(),
        smart in any::<bool>(),
    ) {
        let list = numbered(size);
        let current = &list.tracks[current % size];
        let mode = if smart { ShuffleMode::Smart } else { ShuffleMode::Random };
        let mut resolver = NextSongResolver::with_seed(seed);
        let history = PlayHistory::new();

        for _ in 0..10 {
            let next = resolver
                .resolve_next(&list, Some(current), mode, RepeatMode::Off, &history)
                .expect("non-empty playlist always resolves under shuffle");
            prop_assert_ne!(&next.id, &current.id);
            prop_assert!(list.index_of(&next.id).is_some());
        }
    }

    /// Property: sequential order walks the playlist one step at a time
    #[test]
    fn sequential_steps_by_one(size in 1usize..30, index in 0usize..30) {
        let list = numbered(size);
        let index = index % size;
        let mut resolver = NextSongResolver::with_seed(0);
        let history = PlayHistory::new();

        let next = resolver.resolve_next(
            &list,
            Some(&list.tracks[index]),
            ShuffleMode::Off,
            RepeatMode::Off,
            &history,
        );

        if index + 1 < size {
            prop_assert_eq!(next.map(|t| t.id), Some(list.tracks[index + 1].id.clone()));
        } else {
            prop_assert!(next.is_none());
        }

        let wrapped = resolver.resolve_next(
            &list,
            Some(&list.tracks[size - 1]),
            ShuffleMode::Off,
            RepeatMode::All,
            &history,
        );
        prop_assert_eq!(wrapped.map(|t| t.id), Some(list.tracks[0].id.clone()));
    }
}

#[test]
fn smart_shuffle_favors_never_played() {
    let list = playlist("p", &[track("A", 1), track("B", 1), track("C", 1)]);
    let now = Utc::now();

    let mut history = PlayHistory::new();
    for minutes in 0..5 {
        history.record_at("A", now - ChronoDuration::minutes(minutes));
    }

    let current = &list.tracks[2];
    let mut resolver = NextSongResolver::with_seed(2024);
    let (mut a, mut b) = (0, 0);

    for _ in 0..1000 {
        let next = resolver
            .resolve_next_at(&list, Some(current), ShuffleMode::Smart, RepeatMode::Off, &history, now)
            .unwrap();
        match next.id.as_str() {
            "A" => a += 1,
            "B" => b += 1,
            other => panic!("current track {} was picked", other),
        }
    }

    assert!(b > a * 5, "never-played B should dominate: A={} B={}", a, b);
}

#[test]
fn smart_shuffle_forgives_old_plays() {
    let list = playlist("p", &[track("A", 1), track("B", 1)]);
    let now = Utc::now();

    let mut history = PlayHistory::new();
    history.record_at("A", now - ChronoDuration::days(30));
    history.record_at("B", now);

    // A was played a month ago, B just now: A scores lower and wins more often
    assert!(history.score("A", now) < history.score("B", now));

    let mut resolver = NextSongResolver::with_seed(9);
    let picks_a = (0..500)
        .filter_map(|_| {
            resolver.resolve_next_at(&list, None, ShuffleMode::Smart, RepeatMode::Off, &history, now)
        })
        .filter(|t| t.id == "A")
        .count();
    assert!(picks_a > 250, "A picked {} times", picks_a);
}

#[test]
fn shuffle_previous_draws_a_fresh_pick() {
    let list = numbered(5);
    let current = &list.tracks[2];
    let mut resolver = NextSongResolver::with_seed(5);

    for _ in 0..20 {
        let prev = resolver
            .resolve_previous(&list, Some(current), ShuffleMode::Random, RepeatMode::Off, &PlayHistory::new())
            .unwrap();
        assert_ne!(prev.id, current.id);
    }
}

#[test]
fn preload_and_commit_agree_through_the_pin() {
    let list = numbered(10);
    let current = &list.tracks[0];
    let history = PlayHistory::new();
    let mut resolver = NextSongResolver::with_seed(77);

    // Preload call site
    let preloaded = resolver
        .pin_next(&list, Some(current), ShuffleMode::Random, RepeatMode::Off, &history)
        .unwrap();

    // Commit call site
    let context = PinContext::new(&list, Some(current), ShuffleMode::Random, RepeatMode::Off);
    assert_eq!(resolver.pinned(&context).map(|t| t.id.clone()), Some(preloaded.id.clone()));
    let committed = resolver.take_pin(&context).unwrap();
    assert_eq!(committed.id, preloaded.id);
}

#[test]
fn pin_invalidated_by_mode_changes() {
    let list = numbered(10);
    let current = &list.tracks[0];
    let history = PlayHistory::new();
    let mut resolver = NextSongResolver::with_seed(77);

    resolver.pin_next(&list, Some(current), ShuffleMode::Off, RepeatMode::Off, &history);

    let shuffled = PinContext::new(&list, Some(current), ShuffleMode::Random, RepeatMode::Off);
    assert!(resolver.pinned(&shuffled).is_none());

    let repeating = PinContext::new(&list, Some(current), ShuffleMode::Off, RepeatMode::All);
    assert!(resolver.pinned(&repeating).is_none());

    let other_list = Playlist::new("other", "Other", list.tracks.clone());
    let moved = PinContext::new(&other_list, Some(current), ShuffleMode::Off, RepeatMode::Off);
    assert!(resolver.pinned(&moved).is_none());

    resolver.invalidate_pin();
    assert!(!resolver.has_pin());
}

#[test]
fn record_played_bumps_history() {
    let mut history = PlayHistory::new();
    NextSongResolver::record_played(&mut history, "A");
    NextSongResolver::record_played(&mut history, "A");
    assert_eq!(history.get("A").map(|r| r.play_count), Some(2));
}

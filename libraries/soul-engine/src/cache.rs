//! Song cache
//!
//! Materializes playable sources for a bounded window of tracks around the
//! current one and releases them when they fall out of the window.
//!
//! ## Ownership
//!
//! ```text
//! SongCache ──owns──> LruCache<TrackId, CacheEntry> ──owns──> PlayableHandle resource
//!     │                                  ▲
//!     │ ensure_cached(track)             │ stored once the shared load completes
//!     └──> in_flight: TrackId -> Shared<load future>
//! ```
//!
//! Entries are always moved out of the map before their handle is released,
//! so every resource is released exactly once.

use crate::error::{PlaybackError, Result};
use crate::fetch::{FetchedAudio, SourceFetcher};
use crate::store::BlobStore;
use crate::types::{Playlist, Track, TrackId};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Opaque reference to materialized audio, usable as a channel source
///
/// In the browser this is an object URL; any backend can mint its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlayableHandle {
    pub track_id: TrackId,
    pub url: String,
    pub mime_type: String,
}

/// Creates and releases playable handles (object URL create/revoke)
pub trait PlayableFactory: Send + Sync {
    /// Wrap raw bytes into a playable handle
    fn create(&self, track_id: &str, bytes: &Bytes, mime_type: &str) -> Result<PlayableHandle>;

    /// Release the resource behind a handle. Called exactly once per created handle.
    fn release(&self, handle: PlayableHandle);
}

/// A materialized playable source
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub track_id: TrackId,
    pub handle: PlayableHandle,
    pub raw: Bytes,
    pub loaded_at: Instant,
}

type InFlight = Shared<BoxFuture<'static, Result<PlayableHandle>>>;

struct CacheState {
    entries: LruCache<TrackId, CacheEntry>,
    in_flight: HashMap<TrackId, InFlight>,
    /// Playing or fading-in tracks, never evicted by window or capacity pressure
    protected: HashSet<TrackId>,
    capacity: usize,
    /// Bumped by `evict_all`; loads started in an older epoch release their result
    epoch: u64,
}

impl CacheState {
    /// Evict least-recently-used entries (never the protected one) until within capacity
    fn enforce_capacity(&mut self) -> Vec<CacheEntry> {
        let mut evicted = Vec::new();

        while self.entries.len() > self.capacity {
            // iter() runs most- to least-recently used
            let keys: Vec<TrackId> = self.entries.iter().map(|(k, _)| k.clone()).collect();
            let victim = keys
                .into_iter()
                .rev()
                .find(|k| !self.protected.contains(k));

            match victim.and_then(|k| self.entries.pop(&k)) {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }

        evicted
    }
}

struct CacheInner {
    store: Arc<dyn BlobStore>,
    fetcher: Arc<dyn SourceFetcher>,
    factory: Arc<dyn PlayableFactory>,
    state: Mutex<CacheState>,
}

impl CacheInner {
    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        while let Some((_, entry)) = state.entries.pop_lru() {
            self.factory.release(entry.handle);
        }
    }
}

/// Bounded cache of playable sources
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct SongCache {
    inner: Arc<CacheInner>,
}

impl SongCache {
    /// Create a cache holding at most `capacity` entries
    pub fn new(
        store: Arc<dyn BlobStore>,
        fetcher: Arc<dyn SourceFetcher>,
        factory: Arc<dyn PlayableFactory>,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                fetcher,
                factory,
                state: Mutex::new(CacheState {
                    entries: LruCache::unbounded(),
                    in_flight: HashMap::new(),
                    protected: HashSet::new(),
                    capacity: capacity.max(1),
                    epoch: 0,
                }),
            }),
        }
    }

    /// Return a playable handle for `track`, materializing it if needed
    ///
    /// Concurrent calls for the same track share one load.
    #[instrument(skip(self, track), fields(track_id = %track.id))]
    pub async fn ensure_cached(&self, track: &Track) -> Result<PlayableHandle> {
        let load = {
            let mut state = self.inner.state();

            if let Some(entry) = state.entries.get(&track.id) {
                return Ok(entry.handle.clone());
            }

            match state.in_flight.get(&track.id) {
                Some(load) => {
                    debug!("Joining in-flight load");
                    load.clone()
                }
                None => {
                    let cache = self.clone();
                    let owned = track.clone();
                    let epoch = state.epoch;
                    let load = async move { cache.load(owned, epoch).await }
                        .boxed()
                        .shared();
                    state.in_flight.insert(track.id.clone(), load.clone());
                    load
                }
            }
        };

        load.await
    }

    /// Handle for a cached track, without side effects
    pub fn get_cached(&self, track_id: &str) -> Option<PlayableHandle> {
        self.inner
            .state()
            .entries
            .peek(track_id)
            .map(|entry| entry.handle.clone())
    }

    /// Whether a track is cached
    pub fn contains(&self, track_id: &str) -> bool {
        self.inner.state().entries.contains(track_id)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.inner.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all cached tracks, most recently used first
    pub fn cached_ids(&self) -> Vec<TrackId> {
        self.inner
            .state()
            .entries
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Mark the tracks that are playing or about to play
    ///
    /// Replaces the protected set, then trims unprotected entries back to
    /// capacity. Protected entries may push the cache over capacity until
    /// they are unprotected.
    pub fn protect<'a>(&self, track_ids: impl IntoIterator<Item = &'a str>) {
        let evicted = {
            let mut state = self.inner.state();
            state.protected = track_ids.into_iter().map(str::to_string).collect();
            state.enforce_capacity()
        };

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicting tracks over capacity");
        }
        self.release_all(evicted);
    }

    /// Whether a track is currently protected from eviction
    pub fn is_protected(&self, track_id: &str) -> bool {
        self.inner.state().protected.contains(track_id)
    }

    /// Slide the cache window
    ///
    /// Evicts everything outside `[current - behind, current + ahead] ∪ {extra} ∪ {current}`,
    /// then warms the window in the background. Protection outside the new
    /// window is dropped and `current` becomes protected. The returned handle
    /// may be awaited but never has to be.
    #[instrument(skip_all, fields(current = %current.id))]
    pub fn update_window(
        &self,
        current: &Track,
        playlist: &Playlist,
        behind: usize,
        ahead: usize,
        extra: Option<&Track>,
    ) -> JoinHandle<()> {
        let mut wanted: Vec<Track> = vec![current.clone()];

        if let Some(index) = playlist.index_of(&current.id) {
            let after = playlist.tracks.iter().skip(index + 1).take(ahead);
            let before = playlist.tracks[..index].iter().rev().take(behind);
            wanted.extend(after.cloned());
            if let Some(extra) = extra {
                wanted.push(extra.clone());
            }
            wanted.extend(before.cloned());
        } else if let Some(extra) = extra {
            wanted.push(extra.clone());
        }

        let mut seen = HashSet::new();
        wanted.retain(|t| seen.insert(t.id.clone()));

        let evicted = {
            let mut state = self.inner.state();
            state.protected.retain(|k| seen.contains(k));
            state.protected.insert(current.id.clone());

            let stale: Vec<TrackId> = state
                .entries
                .iter()
                .map(|(k, _)| k.clone())
                .filter(|k| !seen.contains(k))
                .collect();

            stale
                .iter()
                .filter_map(|k| state.entries.pop(k))
                .collect::<Vec<_>>()
        };

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicting tracks outside window");
        }
        self.release_all(evicted);

        let cache = self.clone();
        tokio::spawn(async move {
            for track in wanted {
                if let Err(e) = cache.ensure_cached(&track).await {
                    debug!(track_id = %track.id, error = %e, "Window prefetch failed");
                }
            }
        })
    }

    /// Release every cached resource
    pub fn evict_all(&self) {
        let evicted = {
            let mut state = self.inner.state();
            state.epoch += 1;
            state.in_flight.clear();
            state.protected.clear();

            let mut evicted = Vec::with_capacity(state.entries.len());
            while let Some((_, entry)) = state.entries.pop_lru() {
                evicted.push(entry);
            }
            evicted
        };

        info!(count = evicted.len(), "Evicting all cached tracks");
        self.release_all(evicted);
    }

    /// Download a track into the persistent store for offline playback
    #[instrument(skip(self, track), fields(track_id = %track.id))]
    pub async fn store_offline(&self, track: &Track) -> Result<()> {
        let locator = track
            .locator
            .as_deref()
            .ok_or_else(|| PlaybackError::SourceUnavailable(track.id.clone()))?;

        let fetched = self.inner.fetcher.fetch(locator).await?;
        self.inner
            .store
            .put(&track.id, fetched.bytes, &fetched.mime_type)
            .await?;

        info!("Stored track for offline playback");
        Ok(())
    }

    /// Remove a track from the persistent store
    pub async fn remove_offline(&self, track_id: &str) -> Result<()> {
        self.inner.store.delete(track_id).await
    }

    // ===== Internals =====

    async fn load(self, track: Track, epoch: u64) -> Result<PlayableHandle> {
        let result = self.materialize(&track).await;

        let (handle, evicted) = {
            let mut state = self.inner.state();
            if state.epoch == epoch {
                state.in_flight.remove(&track.id);
            }

            let (handle, raw) = match result {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(track_id = %track.id, error = %e, "Failed to cache track");
                    return Err(e);
                }
            };

            if state.epoch != epoch {
                drop(state);
                self.inner.factory.release(handle);
                return Err(PlaybackError::CacheFailure {
                    track_id: track.id,
                    reason: "cache was cleared while loading".to_string(),
                });
            }

            let entry = CacheEntry {
                track_id: track.id.clone(),
                handle: handle.clone(),
                raw,
                loaded_at: Instant::now(),
            };

            let mut evicted: Vec<CacheEntry> = state
                .entries
                .put(track.id.clone(), entry)
                .into_iter()
                .collect();
            evicted.extend(state.enforce_capacity());
            (handle, evicted)
        };

        debug!(track_id = %track.id, "Cached track");
        self.release_all(evicted);
        Ok(handle)
    }

    async fn materialize(&self, track: &Track) -> Result<(PlayableHandle, Bytes)> {
        let mut fetched: Option<FetchedAudio> = None;

        if track.stored_locally {
            match self.inner.store.get(&track.id).await {
                Ok(Some(blob)) => {
                    fetched = Some(FetchedAudio {
                        bytes: blob.bytes,
                        mime_type: blob.mime_type,
                    });
                }
                Ok(None) => debug!(track_id = %track.id, "Track flagged local but not in store"),
                Err(e) => warn!(track_id = %track.id, error = %e, "Blob store read failed"),
            }
        }

        let fetched = match fetched {
            Some(fetched) => fetched,
            None => {
                let locator = track
                    .locator
                    .as_deref()
                    .ok_or_else(|| PlaybackError::SourceUnavailable(track.id.clone()))?;

                self.inner
                    .fetcher
                    .fetch(locator)
                    .await
                    .map_err(|e| PlaybackError::CacheFailure {
                        track_id: track.id.clone(),
                        reason: e.to_string(),
                    })?
            }
        };

        let handle = self
            .inner
            .factory
            .create(&track.id, &fetched.bytes, &fetched.mime_type)
            .map_err(|e| PlaybackError::CacheFailure {
                track_id: track.id.clone(),
                reason: e.to_string(),
            })?;

        Ok((handle, fetched.bytes))
    }

    fn release_all(&self, entries: Vec<CacheEntry>) {
        for entry in entries {
            self.inner.factory.release(entry.handle);
        }
    }
}

//! Persistent blob store
//!
//! Opaque key-value store holding audio bytes for tracks flagged as
//! stored locally. The engine only reads through it during playback; writes
//! happen through `SongCache::store_offline`.

use crate::error::{PlaybackError, Result};
use crate::types::TrackId;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Bytes plus their MIME type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub bytes: Bytes,
    pub mime_type: String,
}

/// Key-value blob store keyed by track id
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch stored bytes, `None` if nothing is stored
    async fn get(&self, track_id: &str) -> Result<Option<StoredBlob>>;

    /// Store bytes, replacing any previous value
    async fn put(&self, track_id: &str, bytes: Bytes, mime_type: &str) -> Result<()>;

    /// Remove stored bytes (no-op if absent)
    async fn delete(&self, track_id: &str) -> Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<TrackId, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<TrackId, StoredBlob>>> {
        self.blobs
            .lock()
            .map_err(|_| PlaybackError::Store("blob map poisoned".to_string()))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, track_id: &str) -> Result<Option<StoredBlob>> {
        Ok(self.lock()?.get(track_id).cloned())
    }

    async fn put(&self, track_id: &str, bytes: Bytes, mime_type: &str) -> Result<()> {
        self.lock()?.insert(
            track_id.to_string(),
            StoredBlob {
                bytes,
                mime_type: mime_type.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&self, track_id: &str) -> Result<()> {
        self.lock()?.remove(track_id);
        Ok(())
    }
}

/// Directory-backed store: `<root>/<id>.bin` holds the bytes, `<root>/<id>.mime` the type
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Use `root` as the storage directory (created on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, track_id: &str) -> Result<(PathBuf, PathBuf)> {
        // Ids become file names; refuse anything that could escape the root
        if track_id.is_empty()
            || track_id.contains('/')
            || track_id.contains('\\')
            || track_id == "."
            || track_id == ".."
        {
            return Err(PlaybackError::Store(format!(
                "invalid track id for file store: {:?}",
                track_id
            )));
        }
        Ok((
            self.root.join(format!("{}.bin", track_id)),
            self.root.join(format!("{}.mime", track_id)),
        ))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, track_id: &str) -> Result<Option<StoredBlob>> {
        let (data_path, mime_path) = self.paths(track_id)?;

        let bytes = match tokio::fs::read(&data_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mime_type = match tokio::fs::read_to_string(&mime_path).await {
            Ok(mime) => mime.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                "application/octet-stream".to_string()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some(StoredBlob {
            bytes: Bytes::from(bytes),
            mime_type,
        }))
    }

    async fn put(&self, track_id: &str, bytes: Bytes, mime_type: &str) -> Result<()> {
        let (data_path, mime_path) = self.paths(track_id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&data_path, &bytes).await?;
        tokio::fs::write(&mime_path, mime_type.as_bytes()).await?;
        Ok(())
    }

    async fn delete(&self, track_id: &str) -> Result<()> {
        let (data_path, mime_path) = self.paths(track_id)?;
        for path in [data_path, mime_path] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryBlobStore::new();
        assert!(store.get("a").await.unwrap().is_none());

        store.put("a", Bytes::from_static(b"abc"), "audio/mpeg").await.unwrap();
        let blob = store.get("a").await.unwrap().unwrap();
        assert_eq!(blob.bytes, Bytes::from_static(b"abc"));
        assert_eq!(blob.mime_type, "audio/mpeg");

        store.delete("a").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn fs_store_persists_bytes_and_mime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs"));

        store.put("t1", Bytes::from_static(b"flac!"), "audio/flac").await.unwrap();

        // A fresh store over the same directory sees the data
        let reopened = FsBlobStore::new(store.root().to_path_buf());
        let blob = reopened.get("t1").await.unwrap().unwrap();
        assert_eq!(&blob.bytes[..], b"flac!");
        assert_eq!(blob.mime_type, "audio/flac");

        reopened.delete("t1").await.unwrap();
        assert!(reopened.get("t1").await.unwrap().is_none());
        // Deleting twice is fine
        reopened.delete("t1").await.unwrap();
    }

    #[tokio::test]
    async fn fs_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.put("..", Bytes::new(), "x").await.is_err());
    }
}

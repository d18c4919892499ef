//! Remote byte fetching
//!
//! Fetches the raw bytes behind a track locator. The engine never decodes;
//! bytes are handed to a `PlayableFactory` as-is.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Raw audio bytes with their MIME type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAudio {
    pub bytes: Bytes,
    pub mime_type: String,
}

/// Fetches bytes for a locator (URL, path, ...)
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<FetchedAudio>;
}

/// Best-effort MIME type from a locator's extension
pub fn guess_mime_type(locator: &str) -> &'static str {
    let path = locator.split(|c| c == '?' || c == '#').next().unwrap_or(locator);
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" | "oga" => "audio/ogg",
        "opus" => "audio/opus",
        "wav" => "audio/wav",
        "m4a" | "aac" => "audio/mp4",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(feature = "http")]
pub use http::HttpFetcher;

#[cfg(feature = "http")]
mod http {
    use super::{guess_mime_type, FetchedAudio, SourceFetcher};
    use crate::error::{PlaybackError, Result};
    use async_trait::async_trait;
    use reqwest::Client;
    use tracing::debug;

    /// Fetches locators over HTTP(S)
    #[derive(Debug, Clone, Default)]
    pub struct HttpFetcher {
        http: Client,
    }

    impl HttpFetcher {
        pub fn new(http: Client) -> Self {
            Self { http }
        }
    }

    #[async_trait]
    impl SourceFetcher for HttpFetcher {
        async fn fetch(&self, locator: &str) -> Result<FetchedAudio> {
            debug!(url = %locator, "Fetching track bytes");

            let response = self
                .http
                .get(locator)
                .send()
                .await
                .map_err(|e| PlaybackError::Fetch(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(PlaybackError::Fetch(format!(
                    "HTTP {} for {}",
                    status.as_u16(),
                    locator
                )));
            }

            let mime_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
                .unwrap_or_else(|| guess_mime_type(locator).to_string());

            let bytes = response
                .bytes()
                .await
                .map_err(|e| PlaybackError::Fetch(e.to_string()))?;

            Ok(FetchedAudio { bytes, mime_type })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_from_extension() {
        assert_eq!(guess_mime_type("https://cdn/x/song.MP3"), "audio/mpeg");
        assert_eq!(guess_mime_type("/music/a.flac?sig=abc"), "audio/flac");
        assert_eq!(guess_mime_type("blob:whatever"), "application/octet-stream");
    }
}

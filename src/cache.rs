// src/cache.rs
//! Content fingerprint cache for uploaded videos.
//!
//! A single process-wide slot mapping the SHA-256 digest of the last
//! uploaded video to its remote Files API handle, so re-submitting the same
//! bytes skips the upload stage entirely. Last write wins; a failed
//! liveness check clears the slot.

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

/// Remote handle for the most recently uploaded video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedVideo {
    /// Files API resource name, e.g. `files/abc-123`.
    pub remote_name: String,
    pub original_filename: String,
    pub mime_type: String,
    /// Hex-encoded SHA-256 digest of the raw bytes.
    pub content_hash: String,
}

/// One-slot store; injected via `AppState`, never a module global.
#[derive(Debug, Default)]
pub struct VideoCache {
    slot: RwLock<Option<CachedVideo>>,
}

/// Hex-encoded SHA-256 digest of raw video bytes.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl VideoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<CachedVideo> {
        self.slot.read().await.clone()
    }

    /// Returns the cached handle when both digest and filename match the
    /// current slot. Callers still have to confirm remote liveness before
    /// reusing it.
    pub async fn lookup(&self, digest: &str, filename: &str) -> Option<CachedVideo> {
        let slot = self.slot.read().await;
        slot.as_ref()
            .filter(|v| v.content_hash == digest && v.original_filename == filename)
            .cloned()
    }

    /// Unconditionally replace the slot with a freshly uploaded video.
    pub async fn store(&self, video: CachedVideo) {
        let mut slot = self.slot.write().await;
        tracing::debug!(
            "💾 Cached remote video {} (hash {})",
            video.remote_name,
            &video.content_hash[..12.min(video.content_hash.len())]
        );
        *slot = Some(video);
    }

    /// Drop the slot, e.g. after the remote asset turned out to be dead.
    pub async fn clear(&self) {
        let mut slot = self.slot.write().await;
        if slot.take().is_some() {
            tracing::debug!("🗑️ Cleared cached remote video");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(hash: &str) -> CachedVideo {
        CachedVideo {
            remote_name: "files/abc".to_string(),
            original_filename: "clip.mp4".to_string(),
            mime_type: "video/mp4".to_string(),
            content_hash: hash.to_string(),
        }
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = content_digest(b"same bytes");
        let b = content_digest(b"same bytes");
        let c = content_digest(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn lookup_requires_digest_and_filename_match() {
        let cache = VideoCache::new();
        let digest = content_digest(b"video");
        cache.store(sample(&digest)).await;

        assert!(cache.lookup(&digest, "clip.mp4").await.is_some());
        assert!(cache.lookup(&digest, "other.mp4").await.is_none());
        assert!(cache.lookup("deadbeef", "clip.mp4").await.is_none());
    }

    #[tokio::test]
    async fn store_replaces_and_clear_empties() {
        let cache = VideoCache::new();
        cache.store(sample("hash-1")).await;
        cache.store(sample("hash-2")).await;

        let cached = cache.get().await.unwrap();
        assert_eq!(cached.content_hash, "hash-2");

        cache.clear().await;
        assert!(cache.get().await.is_none());
    }
}

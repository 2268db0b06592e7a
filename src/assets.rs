// src/assets.rs
//! Resolving the video asset a task should run against: fingerprint-cache
//! hit, fresh upload, or reuse of the previously uploaded file.
//!
//! Fresh bytes are staged to a temp file for the duration of the Files API
//! upload; the `NamedTempFile` guard releases the staging storage on every
//! exit path. PROCESSING-state polling runs on a fixed interval with a hard
//! upper bound so a stuck remote file cannot pin the worker forever.

use std::time::Instant;
use tempfile::NamedTempFile;

use crate::cache::{content_digest, CachedVideo, VideoCache};
use crate::error::TaskError;
use crate::gemini_client::{FileInfo, GeminiClient};
use crate::settings::Settings;
use crate::tasks::{TaskStage, TaskStore};

/// Raw video captured at submission time, before the worker starts.
#[derive(Debug, Clone)]
pub struct UploadedVideo {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
}

/// Remote asset the generation request references by URI.
#[derive(Debug, Clone)]
pub struct ResolvedAsset {
    pub uri: String,
    pub mime_type: String,
    /// Logical filename embedded in the instruction prompt.
    pub display_filename: String,
}

/// Work out which remote file this task should use, uploading if needed.
/// Progress is reported through the task store as stages advance.
pub async fn resolve_video_asset(
    gemini: &GeminiClient,
    cache: &VideoCache,
    tasks: &dyn TaskStore,
    task_id: &str,
    settings: &Settings,
    fresh: Option<UploadedVideo>,
) -> Result<ResolvedAsset, TaskError> {
    if let Some(video) = fresh {
        let digest = content_digest(&video.bytes);

        if let Some(cached) = cache.lookup(&digest, &video.filename).await {
            tracing::info!(
                "⚡ Fingerprint cache hit for '{}', checking remote liveness",
                video.filename
            );
            tasks
                .update_progress(
                    task_id,
                    TaskStage::GoogleProcessing,
                    50,
                    "Video unchanged since last upload, re-using remote file",
                )
                .await;

            match confirm_usable(gemini, tasks, task_id, settings, &cached.remote_name).await {
                Ok(info) => {
                    return Ok(ResolvedAsset {
                        uri: info.uri,
                        mime_type: info.mime_type.unwrap_or(cached.mime_type),
                        display_filename: cached.original_filename,
                    });
                }
                Err(e) => {
                    // Remote side dropped the file; forget it and re-upload.
                    tracing::warn!("Cached remote file unusable ({}), re-uploading", e);
                    cache.clear().await;
                }
            }
        }

        return upload_fresh(gemini, cache, tasks, task_id, settings, video, digest).await;
    }

    // No fresh bytes: fall back to whatever was uploaded last, if anything.
    let Some(cached) = cache.get().await else {
        return Err(TaskError::NoAssetAvailable);
    };

    tracing::info!(
        "No new video file. Using last uploaded: {} (original: {})",
        cached.remote_name,
        cached.original_filename
    );
    tasks
        .update_progress(
            task_id,
            TaskStage::GoogleProcessing,
            45,
            "Re-using previously uploaded video",
        )
        .await;

    match confirm_usable(gemini, tasks, task_id, settings, &cached.remote_name).await {
        Ok(info) => Ok(ResolvedAsset {
            uri: info.uri,
            mime_type: info.mime_type.unwrap_or(cached.mime_type),
            display_filename: cached.original_filename,
        }),
        Err(e) => {
            cache.clear().await;
            Err(TaskError::UploadFailed(format!(
                "Previously uploaded file {} is no longer usable ({}). Please re-upload.",
                cached.remote_name, e
            )))
        }
    }
}

async fn upload_fresh(
    gemini: &GeminiClient,
    cache: &VideoCache,
    tasks: &dyn TaskStore,
    task_id: &str,
    settings: &Settings,
    video: UploadedVideo,
    digest: String,
) -> Result<ResolvedAsset, TaskError> {
    tasks
        .update_progress(
            task_id,
            TaskStage::Uploading,
            10,
            "Uploading video to Google...",
        )
        .await;

    let staged = stage_to_tempfile(&video.bytes, &video.filename).await?;
    tracing::info!(
        "Staged {} bytes of '{}' at {}",
        video.bytes.len(),
        video.filename,
        staged.path().display()
    );

    let upload_started = Instant::now();
    let uploaded = gemini
        .upload_file(staged.path(), &video.mime_type, &video.filename)
        .await
        .map_err(|e| TaskError::UploadFailed(e.to_string()))?;
    tracing::info!(
        "PERF: Files API upload took {:.2}s",
        upload_started.elapsed().as_secs_f64()
    );

    tasks
        .update_progress(
            task_id,
            TaskStage::GoogleProcessing,
            40,
            "Waiting for Google to process the video...",
        )
        .await;

    let active = wait_until_active(gemini, tasks, task_id, settings, uploaded).await?;

    cache
        .store(CachedVideo {
            remote_name: active.name.clone(),
            original_filename: video.filename.clone(),
            mime_type: video.mime_type.clone(),
            content_hash: digest,
        })
        .await;

    Ok(ResolvedAsset {
        uri: active.uri,
        mime_type: active.mime_type.unwrap_or(video.mime_type),
        display_filename: video.filename,
    })
    // `staged` drops here, deleting the temp file.
}

/// Re-query an already-known remote file and wait for it to be ACTIVE.
async fn confirm_usable(
    gemini: &GeminiClient,
    tasks: &dyn TaskStore,
    task_id: &str,
    settings: &Settings,
    remote_name: &str,
) -> Result<FileInfo, TaskError> {
    let info = gemini
        .get_file(remote_name)
        .await
        .map_err(|e| TaskError::RemoteQuery(e.to_string()))?;
    wait_until_active(gemini, tasks, task_id, settings, info).await
}

/// Poll the Files API on a fixed interval until the file leaves PROCESSING,
/// reporting swelling progress, bounded by `upload_max_wait`. Transient
/// probe failures are logged and retried by the next tick.
async fn wait_until_active(
    gemini: &GeminiClient,
    tasks: &dyn TaskStore,
    task_id: &str,
    settings: &Settings,
    mut info: FileInfo,
) -> Result<FileInfo, TaskError> {
    let started = Instant::now();
    let mut percentage: u8 = 45;

    while info.is_processing() {
        if started.elapsed() >= settings.upload_max_wait {
            return Err(TaskError::UploadFailed(format!(
                "File {} was still PROCESSING after {}s",
                info.name,
                settings.upload_max_wait.as_secs()
            )));
        }

        tracing::debug!("File {} is still PROCESSING, waiting...", info.name);
        tasks
            .update_progress(
                task_id,
                TaskStage::GoogleProcessing,
                percentage,
                "Google is processing the video...",
            )
            .await;
        percentage = (percentage + 2).min(60);

        tokio::time::sleep(settings.upload_poll_interval).await;

        match gemini.get_file(&info.name).await {
            Ok(fresh) => info = fresh,
            Err(e) => {
                // Transient probe failure; the next tick retries.
                tracing::warn!("Status probe for {} failed: {}", info.name, e);
            }
        }
    }

    if info.is_active() {
        tracing::info!("File {} is ACTIVE", info.name);
        Ok(info)
    } else {
        Err(TaskError::UploadFailed(format!(
            "Uploaded file {} did not become ACTIVE (state: {:?})",
            info.name, info.state
        )))
    }
}

/// Write raw bytes to a named temp file, preserving the original extension
/// so the remote side sees a sensible suffix.
async fn stage_to_tempfile(bytes: &[u8], filename: &str) -> Result<NamedTempFile, TaskError> {
    let suffix = std::path::Path::new(filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let staged = tempfile::Builder::new().suffix(&suffix).tempfile()?;
    tokio::fs::write(staged.path(), bytes).await?;
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{TaskManager, TaskStore};

    #[tokio::test]
    async fn no_bytes_and_empty_cache_is_no_asset_available() {
        let gemini = GeminiClient::new("test-key".to_string());
        let cache = VideoCache::new();
        let tasks = TaskManager::new();
        let task_id = tasks.create_task().await;

        let err = resolve_video_asset(
            &gemini,
            &cache,
            &tasks,
            &task_id,
            &Settings::default(),
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TaskError::NoAssetAvailable));
    }

    #[tokio::test]
    async fn staging_preserves_extension_and_cleans_up() {
        let path = {
            let staged = stage_to_tempfile(b"fake video bytes", "clip.mp4").await.unwrap();
            let path = staged.path().to_path_buf();
            assert!(path.extension().is_some_and(|ext| ext == "mp4"));
            assert_eq!(std::fs::read(&path).unwrap(), b"fake video bytes");
            path
        };
        // Guard dropped above; staging storage must be gone.
        assert!(!path.exists());
    }
}

// src/handlers/processing.rs
//! HTTP surface of the processing pipeline: task submission, one-shot
//! progress snapshots, and the SSE update stream.
//!
//! Submission reads the uploaded bytes fully before it returns, so the
//! background worker never depends on the request body outliving the
//! response. The two read endpoints only ever touch the in-memory task
//! record and never block on remote calls.

use axum::{
    extract::{multipart::Multipart, DefaultBodyLimit, Extension, Path},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::assets::UploadedVideo;
use crate::tasks::{worker, TaskStage, TaskStore};
use crate::AppState;

pub fn processing_routes() -> Router {
    Router::new()
        .route("/api/start-processing", post(start_processing))
        .route("/api/progress/:task_id", get(get_progress))
        .route("/api/stream/:task_id", get(stream_progress))
        .layer(DefaultBodyLimit::max(500 * 1024 * 1024)) // 500MB for video uploads
}

/// POST /api/start-processing - accept a prompt plus an optional video and
/// hand the work to a background task. Returns the task id immediately.
async fn start_processing(
    Extension(state): Extension<Arc<AppState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut prompt: Option<String> = None;
    let mut video: Option<UploadedVideo> = None;
    let mut video_read_error: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to parse multipart field: {}", e);
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("invalid multipart body: {}", e)})),
                )
                    .into_response();
            }
        };

        match field.name().unwrap_or_default() {
            "prompt" => match field.text().await {
                Ok(text) => prompt = Some(text),
                Err(e) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": format!("failed to read prompt: {}", e)})),
                    )
                        .into_response();
                }
            },
            "video_file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                // A file input submitted without a selection shows up as an
                // empty field with no filename.
                if filename.is_empty() {
                    continue;
                }
                match field.bytes().await {
                    Ok(bytes) => {
                        tracing::info!(
                            "Received video '{}' ({} bytes, {})",
                            filename,
                            bytes.len(),
                            mime_type
                        );
                        video = Some(UploadedVideo {
                            bytes: bytes.to_vec(),
                            mime_type,
                            filename,
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to read video bytes for '{}': {}", filename, e);
                        video_read_error = Some(format!("failed to read uploaded video: {}", e));
                    }
                }
            }
            other => {
                tracing::debug!("Ignoring unexpected form field: {}", other);
            }
        }
    }

    let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "prompt is required"})),
        )
            .into_response();
    };

    let task_id = state.tasks.create_task().await;

    // A failed body read still yields a task id; the caller discovers the
    // failure by polling.
    if let Some(reason) = video_read_error {
        state.tasks.fail(&task_id, &reason).await;
        return Json(json!({"task_id": task_id})).into_response();
    }

    tracing::info!(
        "Received prompt for video processing: {:?}, video: {}",
        prompt,
        video
            .as_ref()
            .map(|v| v.filename.as_str())
            .unwrap_or("none (will attempt to use previous)")
    );

    let request = worker::ProcessingRequest { prompt, video };
    tokio::spawn(worker::run(state.clone(), task_id.clone(), request));

    Json(json!({"task_id": task_id})).into_response()
}

/// GET /api/progress/:task_id - one-shot snapshot of the task record.
async fn get_progress(
    Path(task_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    match state.tasks.snapshot(&task_id).await {
        Some(progress) => (StatusCode::OK, Json(progress)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Task not found"})),
        )
            .into_response(),
    }
}

/// GET /api/stream/:task_id - SSE stream of progress deltas: an initial
/// snapshot event, `chunk` events for newly streamed text, then exactly one
/// `complete` or `error` event before the channel closes. Keep-alive
/// comment lines go out every 15s so idle waits don't drop the connection.
async fn stream_progress(
    Path(task_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if state.tasks.snapshot(&task_id).await.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Task not found"})),
        ));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(drive_stream(state, task_id, tx));

    let events = UnboundedReceiverStream::new(rx)
        .map(|value: serde_json::Value| Ok::<Event, Infallible>(Event::default().data(value.to_string())));

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}

/// Poll the task record at a short fixed interval and push event payloads
/// to one SSE connection. Exits when a terminal event is delivered or the
/// client goes away; an abandoned connection never stops the worker.
async fn drive_stream(
    state: Arc<AppState>,
    task_id: String,
    tx: mpsc::UnboundedSender<serde_json::Value>,
) {
    let mut sent_len = 0usize;

    // Initial event so late subscribers see where the task already is.
    if let Some(progress) = state.tasks.snapshot(&task_id).await {
        let initial = json!({
            "type": "progress",
            "stage": progress.stage,
            "percentage": progress.percentage,
            "message": progress.message,
        });
        if tx.send(initial).is_err() {
            return;
        }
    }

    loop {
        let Some(progress) = state.tasks.snapshot(&task_id).await else {
            // Record purged mid-stream; nothing more will ever arrive.
            let _ = tx.send(json!({
                "type": "error",
                "message": "Task not found",
            }));
            return;
        };

        if progress.streaming_text.len() > sent_len {
            let delta = progress.streaming_text[sent_len..].to_string();
            sent_len = progress.streaming_text.len();
            let chunk = json!({
                "type": "chunk",
                "text": delta,
                "full_text": progress.streaming_text,
            });
            if tx.send(chunk).is_err() {
                return;
            }
        }

        match progress.stage {
            TaskStage::Complete => {
                let _ = tx.send(json!({
                    "type": "complete",
                    "result": progress.result,
                    "full_text": progress.streaming_text,
                }));
                return;
            }
            TaskStage::Error => {
                let _ = tx.send(json!({
                    "type": "error",
                    "message": progress.error_message.unwrap_or_else(|| progress.message.clone()),
                }));
                return;
            }
            _ => {}
        }

        tokio::time::sleep(state.settings.stream_poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::VideoCache;
    use crate::settings::Settings;
    use crate::tasks::{TaskManager, TaskResult};

    fn test_state() -> Arc<AppState> {
        let settings = Settings {
            stream_poll_interval: Duration::from_millis(5),
            ..Settings::default()
        };
        Arc::new(AppState {
            gemini: None,
            video_cache: VideoCache::new(),
            tasks: Arc::new(TaskManager::new()),
            settings,
        })
    }

    async fn collect_events(
        mut rx: mpsc::UnboundedReceiver<serde_json::Value>,
    ) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn stream_delivers_chunks_then_terminal_complete() {
        let state = test_state();
        let task_id = state.tasks.create_task().await;
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(drive_stream(state.clone(), task_id.clone(), tx));

        state.tasks.set_streaming(&task_id, true).await;
        state.tasks.append_streaming_text(&task_id, "Hello").await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        state.tasks.append_streaming_text(&task_id, " world").await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        state
            .tasks
            .complete(&task_id, TaskResult::TextResponse("Hello world".to_string()))
            .await;

        driver.await.unwrap();
        let events = collect_events(rx).await;

        assert_eq!(events.first().unwrap()["type"], "progress");
        let chunk_text: String = events
            .iter()
            .filter(|e| e["type"] == "chunk")
            .map(|e| e["text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(chunk_text, "Hello world");

        let last = events.last().unwrap();
        assert_eq!(last["type"], "complete");
        assert_eq!(last["result"]["text_response"], "Hello world");
        assert_eq!(last["full_text"], "Hello world");
    }

    #[tokio::test]
    async fn stream_on_finished_task_sends_terminal_once_and_closes() {
        let state = test_state();
        let task_id = state.tasks.create_task().await;
        state.tasks.fail(&task_id, "upload failed: boom").await;

        let (tx, rx) = mpsc::unbounded_channel();
        drive_stream(state.clone(), task_id, tx).await;

        let events = collect_events(rx).await;
        assert_eq!(events[0]["type"], "progress");
        assert_eq!(events[0]["stage"], "error");
        let terminal: Vec<_> = events.iter().filter(|e| e["type"] == "error").collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0]["message"], "upload failed: boom");
    }

    #[tokio::test]
    async fn stream_reports_purged_record_as_error() {
        let state = test_state();
        let task_id = state.tasks.create_task().await;
        state
            .tasks
            .complete(&task_id, TaskResult::TextResponse("done".to_string()))
            .await;
        state.tasks.purge_terminal(Duration::ZERO).await;

        let (tx, rx) = mpsc::unbounded_channel();
        drive_stream(state.clone(), task_id, tx).await;

        let events = collect_events(rx).await;
        let last = events.last().unwrap();
        assert_eq!(last["type"], "error");
        assert_eq!(last["message"], "Task not found");
    }
}

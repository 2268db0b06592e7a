// src/tasks/mod.rs
//! Task registry and per-task progress records.
//!
//! Each submission gets a `TaskProgress` record keyed by task id. The
//! background worker is the only writer; the progress and stream endpoints
//! only read. Records that reach `complete` or `error` never change again,
//! and are purged by a periodic sweep once they outlive the configured TTL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod worker;

pub type TaskId = String;

/// Coarse phase of a task's trip through the pipeline. `uploading` and
/// `google_processing` are skipped on a fingerprint-cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Idle,
    Starting,
    Initializing,
    Uploading,
    GoogleProcessing,
    AiGenerating,
    Streaming,
    Complete,
    Error,
}

impl TaskStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStage::Complete | TaskStage::Error)
    }
}

/// Arguments of the single action invocation the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInvocation {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Final payload of a completed task. Externally tagged so the wire shape
/// is `{"tool_call": {...}}`, `{"subtitle_generation": {...}}` or
/// `{"text_response": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskResult {
    #[serde(rename = "tool_call")]
    ToolCall(ActionInvocation),
    #[serde(rename = "subtitle_generation")]
    SubtitleGeneration(ActionInvocation),
    #[serde(rename = "text_response")]
    TextResponse(String),
}

/// Mutable progress state for one task. Single writer (the worker),
/// many readers (poll and stream endpoints).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub stage: TaskStage,
    /// 0-100, monotonically non-decreasing except reset to 0 on error.
    pub percentage: u8,
    /// Current human-readable status, replaced on each update.
    pub message: String,
    /// Text streamed from the model so far; append-only.
    pub streaming_text: String,
    pub is_streaming: bool,
    pub stream_complete: bool,
    /// Set exactly once; non-null iff stage == complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Set exactly once; non-empty iff stage == error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// When the record went terminal; drives TTL purging.
    #[serde(skip)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskProgress {
    pub fn new() -> Self {
        Self {
            stage: TaskStage::Starting,
            percentage: 0,
            message: "Task accepted".to_string(),
            streaming_text: String::new(),
            is_streaming: false,
            stream_complete: false,
            result: None,
            error_message: None,
            updated_at: Utc::now(),
            finished_at: None,
        }
    }
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            stage: TaskStage::Idle,
            ..Self::new()
        }
    }
}

/// Interface over the task registry, so endpoints and the worker receive an
/// injected store rather than reaching for process globals.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Allocate a fresh task id with a record at `starting`/0.
    async fn create_task(&self) -> TaskId;

    /// Consistent clone of the record, or `None` for an unknown id.
    async fn snapshot(&self, task_id: &str) -> Option<TaskProgress>;

    /// Advance stage/percentage/message. Percentage never moves backwards;
    /// updates against a terminal record are ignored.
    async fn update_progress(&self, task_id: &str, stage: TaskStage, percentage: u8, message: &str);

    async fn append_streaming_text(&self, task_id: &str, delta: &str);

    async fn set_streaming(&self, task_id: &str, active: bool);

    async fn mark_stream_complete(&self, task_id: &str);

    /// Terminal success: stage `complete`, percentage 100, result set once.
    async fn complete(&self, task_id: &str, result: TaskResult);

    /// Terminal failure: stage `error`, percentage reset to 0.
    async fn fail(&self, task_id: &str, message: &str);

    /// Drop terminal records older than `ttl`; returns how many went.
    async fn purge_terminal(&self, ttl: Duration) -> usize;
}

pub type SharedTaskStore = Arc<dyn TaskStore>;

/// In-memory registry: task id -> progress record.
#[derive(Default)]
pub struct TaskManager {
    tasks: RwLock<HashMap<TaskId, Arc<RwLock<TaskProgress>>>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn record(&self, task_id: &str) -> Option<Arc<RwLock<TaskProgress>>> {
        self.tasks.read().await.get(task_id).cloned()
    }
}

#[async_trait]
impl TaskStore for TaskManager {
    async fn create_task(&self) -> TaskId {
        let task_id = Uuid::new_v4().to_string();
        let mut tasks = self.tasks.write().await;
        tasks.insert(task_id.clone(), Arc::new(RwLock::new(TaskProgress::new())));
        tracing::info!("🎬 Created task: {}", task_id);
        task_id
    }

    async fn snapshot(&self, task_id: &str) -> Option<TaskProgress> {
        let record = self.record(task_id).await?;
        let progress = record.read().await;
        Some(progress.clone())
    }

    async fn update_progress(&self, task_id: &str, stage: TaskStage, percentage: u8, message: &str) {
        let Some(record) = self.record(task_id).await else {
            return;
        };
        let mut progress = record.write().await;
        if progress.stage.is_terminal() {
            return;
        }
        progress.stage = stage;
        progress.percentage = progress.percentage.max(percentage.min(100));
        progress.message = message.to_string();
        progress.updated_at = Utc::now();
        tracing::debug!(
            "📊 Task {}: {:?} {}% - {}",
            task_id,
            stage,
            progress.percentage,
            message
        );
    }

    async fn append_streaming_text(&self, task_id: &str, delta: &str) {
        let Some(record) = self.record(task_id).await else {
            return;
        };
        let mut progress = record.write().await;
        if progress.stage.is_terminal() {
            return;
        }
        progress.streaming_text.push_str(delta);
        progress.updated_at = Utc::now();
    }

    async fn set_streaming(&self, task_id: &str, active: bool) {
        let Some(record) = self.record(task_id).await else {
            return;
        };
        let mut progress = record.write().await;
        if progress.stage.is_terminal() {
            return;
        }
        progress.is_streaming = active;
        progress.updated_at = Utc::now();
    }

    async fn mark_stream_complete(&self, task_id: &str) {
        let Some(record) = self.record(task_id).await else {
            return;
        };
        let mut progress = record.write().await;
        if progress.stage.is_terminal() {
            return;
        }
        progress.stream_complete = true;
        progress.is_streaming = false;
        progress.updated_at = Utc::now();
    }

    async fn complete(&self, task_id: &str, result: TaskResult) {
        let Some(record) = self.record(task_id).await else {
            return;
        };
        let mut progress = record.write().await;
        if progress.stage.is_terminal() {
            return;
        }
        progress.stage = TaskStage::Complete;
        progress.percentage = 100;
        progress.message = "Processing complete".to_string();
        progress.result = Some(result);
        progress.is_streaming = false;
        progress.stream_complete = true;
        let now = Utc::now();
        progress.updated_at = now;
        progress.finished_at = Some(now);
        tracing::info!("✅ Task {} complete", task_id);
    }

    async fn fail(&self, task_id: &str, message: &str) {
        let Some(record) = self.record(task_id).await else {
            return;
        };
        let mut progress = record.write().await;
        if progress.stage.is_terminal() {
            return;
        }
        progress.stage = TaskStage::Error;
        progress.percentage = 0;
        progress.message = message.to_string();
        progress.error_message = Some(message.to_string());
        progress.is_streaming = false;
        let now = Utc::now();
        progress.updated_at = now;
        progress.finished_at = Some(now);
        tracing::error!("❌ Task {} failed: {}", task_id, message);
    }

    async fn purge_terminal(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_default();
        let mut tasks = self.tasks.write().await;

        let mut to_remove = Vec::new();
        for (task_id, record) in tasks.iter() {
            let progress = record.read().await;
            if let Some(finished_at) = progress.finished_at {
                if finished_at <= cutoff {
                    to_remove.push(task_id.clone());
                }
            }
        }

        for task_id in &to_remove {
            tasks.remove(task_id);
            tracing::debug!("🗑️ Purged terminal task: {}", task_id);
        }
        to_remove.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_snapshot_starts_at_starting() {
        let manager = TaskManager::new();
        let task_id = manager.create_task().await;

        let progress = manager.snapshot(&task_id).await.unwrap();
        assert_eq!(progress.stage, TaskStage::Starting);
        assert_eq!(progress.percentage, 0);
        assert!(progress.result.is_none());
    }

    #[tokio::test]
    async fn snapshot_of_unknown_id_is_none() {
        let manager = TaskManager::new();
        assert!(manager.snapshot("nope").await.is_none());
    }

    #[tokio::test]
    async fn percentage_never_moves_backwards() {
        let manager = TaskManager::new();
        let task_id = manager.create_task().await;

        manager
            .update_progress(&task_id, TaskStage::AiGenerating, 70, "generating")
            .await;
        manager
            .update_progress(&task_id, TaskStage::Streaming, 40, "streaming")
            .await;

        let progress = manager.snapshot(&task_id).await.unwrap();
        assert_eq!(progress.stage, TaskStage::Streaming);
        assert_eq!(progress.percentage, 70);
    }

    #[tokio::test]
    async fn terminal_records_never_transition_again() {
        let manager = TaskManager::new();
        let task_id = manager.create_task().await;

        manager
            .complete(&task_id, TaskResult::TextResponse("done".to_string()))
            .await;
        manager.fail(&task_id, "too late").await;
        manager
            .update_progress(&task_id, TaskStage::Uploading, 10, "ignored")
            .await;

        let progress = manager.snapshot(&task_id).await.unwrap();
        assert_eq!(progress.stage, TaskStage::Complete);
        assert_eq!(progress.percentage, 100);
        assert!(progress.error_message.is_none());
        assert_eq!(
            progress.result,
            Some(TaskResult::TextResponse("done".to_string()))
        );
    }

    #[tokio::test]
    async fn fail_resets_percentage_and_records_message() {
        let manager = TaskManager::new();
        let task_id = manager.create_task().await;

        manager
            .update_progress(&task_id, TaskStage::Uploading, 30, "uploading")
            .await;
        manager.fail(&task_id, "upload failed: boom").await;

        let progress = manager.snapshot(&task_id).await.unwrap();
        assert_eq!(progress.stage, TaskStage::Error);
        assert_eq!(progress.percentage, 0);
        assert_eq!(progress.error_message.as_deref(), Some("upload failed: boom"));
    }

    #[tokio::test]
    async fn streaming_text_is_append_only() {
        let manager = TaskManager::new();
        let task_id = manager.create_task().await;

        manager.set_streaming(&task_id, true).await;
        manager.append_streaming_text(&task_id, "Hello").await;
        manager.append_streaming_text(&task_id, ", world").await;
        manager.mark_stream_complete(&task_id).await;

        let progress = manager.snapshot(&task_id).await.unwrap();
        assert_eq!(progress.streaming_text, "Hello, world");
        assert!(progress.stream_complete);
        assert!(!progress.is_streaming);
    }

    #[tokio::test]
    async fn purge_drops_only_expired_terminal_records() {
        let manager = TaskManager::new();
        let live = manager.create_task().await;
        let done = manager.create_task().await;
        manager
            .complete(&done, TaskResult::TextResponse("ok".to_string()))
            .await;

        // Nothing is old enough yet with a generous TTL.
        assert_eq!(manager.purge_terminal(Duration::from_secs(3600)).await, 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.purge_terminal(Duration::ZERO).await, 1);
        assert!(manager.snapshot(&done).await.is_none());
        assert!(manager.snapshot(&live).await.is_some());
    }

    #[test]
    fn result_wire_shapes_are_externally_tagged() {
        let text = TaskResult::TextResponse("an answer".to_string());
        assert_eq!(
            serde_json::to_value(&text).unwrap(),
            serde_json::json!({"text_response": "an answer"})
        );

        let call = TaskResult::ToolCall(ActionInvocation {
            name: "execute_ffmpeg_with_optional_subtitles".to_string(),
            arguments: serde_json::json!({"command_array": ["-i", "input.mp4", "out.gif"], "output_filename": "out.gif"}),
        });
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(
            value["tool_call"]["name"],
            "execute_ffmpeg_with_optional_subtitles"
        );
        assert_eq!(value["tool_call"]["arguments"]["output_filename"], "out.gif");
    }

    #[test]
    fn stage_serializes_to_frontend_strings() {
        assert_eq!(
            serde_json::to_string(&TaskStage::GoogleProcessing).unwrap(),
            "\"google_processing\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStage::AiGenerating).unwrap(),
            "\"ai_generating\""
        );
        assert!(TaskStage::Complete.is_terminal());
        assert!(TaskStage::Error.is_terminal());
        assert!(!TaskStage::Streaming.is_terminal());
    }
}

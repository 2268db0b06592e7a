// src/tasks/worker.rs
//! Background orchestration worker: drives one task from submission to a
//! terminal stage. Runs detached from the submitting request; every failure
//! is caught at the outermost scope and turned into a terminal `error`
//! record so pollers always reach `complete` or `error`.

use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;

use super::{ActionInvocation, TaskId, TaskResult, TaskStage, TaskStore};
use crate::assets::{resolve_video_asset, UploadedVideo};
use crate::error::TaskError;
use crate::gemini_client::{
    create_video_actions, Content, FileData, FunctionCall, GenerateContentRequest,
    GenerationConfig, Part, Tool, FFMPEG_ACTION, SUBTITLE_ACTION,
};
use crate::AppState;

/// Inputs captured at submission time, before the HTTP request body goes
/// away.
#[derive(Debug)]
pub struct ProcessingRequest {
    pub prompt: String,
    pub video: Option<UploadedVideo>,
}

/// Entry point for the spawned worker task. Never returns an error; the
/// terminal record is the only output channel.
pub async fn run(state: Arc<AppState>, task_id: TaskId, request: ProcessingRequest) {
    tracing::info!("🎬 Worker starting for task {}", task_id);
    match run_pipeline(&state, &task_id, request).await {
        Ok(result) => state.tasks.complete(&task_id, result).await,
        Err(e) => state.tasks.fail(&task_id, &e.to_string()).await,
    }
}

async fn run_pipeline(
    state: &AppState,
    task_id: &str,
    request: ProcessingRequest,
) -> Result<TaskResult, TaskError> {
    let tasks = state.tasks.as_ref();
    tasks
        .update_progress(task_id, TaskStage::Initializing, 5, "Validating request...")
        .await;

    if request.prompt.trim().is_empty() {
        return Err(TaskError::InvalidInput("prompt must not be empty".to_string()));
    }
    if let Some(video) = &request.video {
        if video.bytes.is_empty() || video.filename.is_empty() {
            return Err(TaskError::InvalidInput(
                "video upload was empty or carried no filename".to_string(),
            ));
        }
    }

    let gemini = state.gemini.as_ref().ok_or(TaskError::ClientUnavailable)?;

    let asset = resolve_video_asset(
        gemini,
        &state.video_cache,
        tasks,
        task_id,
        &state.settings,
        request.video,
    )
    .await?;

    tasks
        .update_progress(
            task_id,
            TaskStage::AiGenerating,
            70,
            "Sending request to Gemini...",
        )
        .await;

    let generate_request = GenerateContentRequest {
        contents: vec![Content {
            parts: vec![
                Part::Text {
                    text: build_instruction(&request.prompt, &asset.display_filename),
                },
                Part::FileData {
                    file_data: FileData {
                        mime_type: asset.mime_type.clone(),
                        file_uri: asset.uri.clone(),
                    },
                },
            ],
            role: Some("user".to_string()),
        }],
        tools: Some(vec![Tool {
            function_declarations: create_video_actions(),
        }]),
        generation_config: Some(GenerationConfig {
            temperature: 0.3,
            max_output_tokens: None,
        }),
    };

    let mut stream = gemini
        .generate_content_stream(&state.settings.gemini_model, generate_request)
        .await
        .map_err(|e| TaskError::RemoteQuery(e.to_string()))?;

    tasks
        .update_progress(
            task_id,
            TaskStage::Streaming,
            80,
            "Receiving response from Gemini...",
        )
        .await;
    tasks.set_streaming(task_id, true).await;

    let mut accumulated = String::new();
    let mut pending_action: Option<FunctionCall> = None;
    let mut finish_reason: Option<String> = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TaskError::RemoteQuery(e.to_string()))?;
        let Some(candidate) = chunk.candidates.into_iter().next() else {
            continue;
        };
        if let Some(reason) = candidate.finish_reason {
            finish_reason = Some(reason);
        }
        let Some(content) = candidate.content else {
            continue;
        };

        for part in content.parts {
            match part {
                Part::Text { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    accumulated.push_str(&text);
                    tasks.append_streaming_text(task_id, &text).await;
                    if !state.settings.stream_pacing.is_zero() {
                        tokio::time::sleep(state.settings.stream_pacing).await;
                    }
                }
                Part::FunctionCall { function_call } => {
                    // Only one invocation is honored; keep the first.
                    if pending_action.is_none() {
                        tracing::info!(
                            "🔧 Gemini wants to call '{}' for task {}",
                            function_call.name,
                            task_id
                        );
                        pending_action = Some(function_call);
                    }
                }
                Part::FileData { .. } => {}
            }
        }
    }

    tasks.mark_stream_complete(task_id).await;
    tasks
        .update_progress(task_id, TaskStage::Streaming, 95, "Finalizing response...")
        .await;

    finalize(pending_action, &accumulated, finish_reason.as_deref())
}

/// Instruction block sent alongside the video reference: embeds the user's
/// request and the decision rule between a direct answer and a tool call.
fn build_instruction(user_prompt: &str, video_filename: &str) -> String {
    format!(
        "You are a helpful AI assistant. The user has provided a video file named '{video_filename}'.\n\
        The user's instruction is: '{user_prompt}'.\n\n\
        IMPORTANT: Analyze the user's request carefully and choose the appropriate response type:\n\n\
        **TYPE 1 - Content Analysis (NO TOOLS)**: If the user wants to understand, analyze, or get information about the video content:\n\
        - Examples: 'summarize this video', 'what is in this video?', 'describe the content', 'what happens in the video?'\n\
        - Action: Provide a direct text response by analyzing the video. DO NOT use any tools.\n\n\
        **TYPE 2 - Video Processing (USE TOOL)**: If the user wants to transform, edit, or modify the video file:\n\
        - Examples: 'convert to GIF', 'trim the video', 'extract audio', 'add subtitles', 'change format', 'resize video'\n\
        - Action: Call the '{FFMPEG_ACTION}' tool, or the '{SUBTITLE_ACTION}' tool when the user asks only for a subtitle file.\n\n\
        **Current Request Analysis**: The instruction '{user_prompt}' is asking for:\n\
        - If it's about understanding/analyzing content → Provide direct text answer in Chinese\n\
        - If it's about editing/converting video → Use the tool\n\n\
        **Tool Usage Details** (only if TYPE 2):\n\
        - The user's video is available as '{video_filename}'. This MUST be the input file in your FFmpeg command.\n\
        - Generate the `command_array` (the arguments for FFmpeg, without 'ffmpeg' itself), the `output_filename`, and subtitle information if needed.\n\
        - **Subtitles**: If the instruction is about generating or burning in subtitles, create the content for 'subtitles_content' and a 'subtitles_filename'. \
        When burning subtitles, your `command_array` MUST include the filter `subtitles=<subtitles_filename>:fontsdir=/customfonts:force_style='Fontname=Source Han Sans SC'`. \
        The font 'SourceHanSansSC-Regular.otf' is available in '/customfonts'. \
        If no subtitles are needed, provide empty strings for 'subtitles_content' and 'subtitles_filename'.\n\n\
        Now respond appropriately based on the request type."
    )
}

/// Turn whatever the stream produced into the task's final payload, in
/// precedence order: recognized action invocation, accumulated text,
/// abnormal stop reason, then "no usable response".
fn finalize(
    action: Option<FunctionCall>,
    text: &str,
    finish_reason: Option<&str>,
) -> Result<TaskResult, TaskError> {
    if let Some(call) = action {
        match call.name.as_str() {
            FFMPEG_ACTION => {
                if let Some(arguments) = normalize_ffmpeg_args(&call.args) {
                    return Ok(TaskResult::ToolCall(ActionInvocation {
                        name: call.name,
                        arguments,
                    }));
                }
                tracing::warn!("FFmpeg tool call missing required arguments: {:?}", call.args);
                let fallback = text.trim();
                if !fallback.is_empty() {
                    return Ok(TaskResult::TextResponse(fallback.to_string()));
                }
                return Ok(TaskResult::TextResponse(
                    "Gemini tool call was missing required arguments (command_array or output_filename)."
                        .to_string(),
                ));
            }
            SUBTITLE_ACTION => {
                if let Some(arguments) = normalize_subtitle_args(&call.args) {
                    return Ok(TaskResult::SubtitleGeneration(ActionInvocation {
                        name: call.name,
                        arguments,
                    }));
                }
                tracing::warn!("Subtitle tool call missing content: {:?}", call.args);
            }
            other => {
                tracing::warn!("Gemini called an unexpected function: {}", other);
                let fallback = text.trim();
                if !fallback.is_empty() {
                    return Ok(TaskResult::TextResponse(fallback.to_string()));
                }
                return Ok(TaskResult::TextResponse(format!(
                    "Gemini called an unexpected function: {}",
                    other
                )));
            }
        }
    }

    let trimmed = text.trim();
    if !trimmed.is_empty() {
        return Ok(TaskResult::TextResponse(trimmed.to_string()));
    }

    match finish_reason {
        Some(reason) if reason != "STOP" => Err(TaskError::GenerationStopped(reason.to_string())),
        _ => Err(TaskError::NoUsableResponse),
    }
}

/// Validate and normalize FFmpeg action arguments. `command_array` must be
/// a non-empty array and `output_filename` a non-empty string; the optional
/// subtitle fields default to empty strings.
fn normalize_ffmpeg_args(args: &std::collections::HashMap<String, Value>) -> Option<Value> {
    let command_array = args.get("command_array")?.as_array()?;
    if command_array.is_empty() {
        return None;
    }
    let output_filename = args.get("output_filename")?.as_str()?;
    if output_filename.is_empty() {
        return None;
    }

    Some(serde_json::json!({
        "command_array": command_array,
        "output_filename": output_filename,
        "subtitles_content": args.get("subtitles_content").and_then(Value::as_str).unwrap_or(""),
        "subtitles_filename": args.get("subtitles_filename").and_then(Value::as_str).unwrap_or(""),
    }))
}

fn normalize_subtitle_args(args: &std::collections::HashMap<String, Value>) -> Option<Value> {
    let content = args.get("subtitles_content")?.as_str()?;
    if content.is_empty() {
        return None;
    }

    Some(serde_json::json!({
        "subtitles_content": content,
        "subtitles_filename": args
            .get("subtitles_filename")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("subtitles.srt"),
        "description": args.get("description").and_then(Value::as_str).unwrap_or(""),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::VideoCache;
    use crate::settings::Settings;
    use crate::tasks::{TaskManager, TaskStore};
    use std::collections::HashMap;

    fn offline_state() -> Arc<AppState> {
        Arc::new(AppState {
            gemini: None,
            video_cache: VideoCache::new(),
            tasks: Arc::new(TaskManager::new()),
            settings: Settings::default(),
        })
    }

    #[tokio::test]
    async fn run_without_client_reaches_terminal_error() {
        let state = offline_state();
        let task_id = state.tasks.create_task().await;

        run(
            state.clone(),
            task_id.clone(),
            ProcessingRequest {
                prompt: "convert this to a GIF".to_string(),
                video: None,
            },
        )
        .await;

        let progress = state.tasks.snapshot(&task_id).await.unwrap();
        assert_eq!(progress.stage, TaskStage::Error);
        assert_eq!(progress.percentage, 0);
        assert!(progress
            .error_message
            .as_deref()
            .is_some_and(|m| !m.is_empty()));
    }

    #[tokio::test]
    async fn run_with_empty_prompt_fails_validation() {
        let state = offline_state();
        let task_id = state.tasks.create_task().await;

        run(
            state.clone(),
            task_id.clone(),
            ProcessingRequest {
                prompt: "   ".to_string(),
                video: None,
            },
        )
        .await;

        let progress = state.tasks.snapshot(&task_id).await.unwrap();
        assert_eq!(progress.stage, TaskStage::Error);
        assert!(progress
            .error_message
            .is_some_and(|m| m.contains("prompt must not be empty")));
    }

    fn ffmpeg_call(args: serde_json::Value) -> FunctionCall {
        FunctionCall {
            name: FFMPEG_ACTION.to_string(),
            args: serde_json::from_value(args).unwrap(),
        }
    }

    #[test]
    fn valid_ffmpeg_call_becomes_tool_call_result() {
        let call = ffmpeg_call(serde_json::json!({
            "command_array": ["-i", "input.mp4", "-t", "5", "out.gif"],
            "output_filename": "out.gif",
        }));

        let result = finalize(Some(call), "", None).unwrap();
        match result {
            TaskResult::ToolCall(invocation) => {
                assert_eq!(invocation.name, FFMPEG_ACTION);
                assert_eq!(invocation.arguments["output_filename"], "out.gif");
                assert_eq!(invocation.arguments["subtitles_content"], "");
                assert_eq!(
                    invocation.arguments["command_array"].as_array().unwrap().len(),
                    5
                );
            }
            other => panic!("expected tool_call, got {:?}", other),
        }
    }

    #[test]
    fn action_wins_over_preceding_text() {
        let call = ffmpeg_call(serde_json::json!({
            "command_array": ["-i", "input.mp4", "out.mp4"],
            "output_filename": "out.mp4",
        }));

        let result = finalize(Some(call), "Sure, I'll trim that for you. ", None).unwrap();
        assert!(matches!(result, TaskResult::ToolCall(_)));
    }

    #[test]
    fn ffmpeg_call_without_required_args_falls_back_to_text() {
        let call = ffmpeg_call(serde_json::json!({ "output_filename": "out.mp4" }));
        let result = finalize(Some(call), "  Here is what I would do.  ", None).unwrap();
        assert_eq!(
            result,
            TaskResult::TextResponse("Here is what I would do.".to_string())
        );
    }

    #[test]
    fn subtitle_call_surfaces_subtitle_generation() {
        let call = FunctionCall {
            name: SUBTITLE_ACTION.to_string(),
            args: serde_json::from_value(serde_json::json!({
                "subtitles_content": "1\n00:00:00,000 --> 00:00:02,000\nHello\n",
                "description": "Greeting subtitles",
            }))
            .unwrap(),
        };

        let result = finalize(Some(call), "", None).unwrap();
        match result {
            TaskResult::SubtitleGeneration(invocation) => {
                assert_eq!(invocation.arguments["subtitles_filename"], "subtitles.srt");
                assert_eq!(invocation.arguments["description"], "Greeting subtitles");
            }
            other => panic!("expected subtitle_generation, got {:?}", other),
        }
    }

    #[test]
    fn unrecognized_action_degrades_to_plain_text() {
        let call = FunctionCall {
            name: "launch_rocket".to_string(),
            args: HashMap::new(),
        };

        let result = finalize(Some(call), "", None).unwrap();
        assert_eq!(
            result,
            TaskResult::TextResponse("Gemini called an unexpected function: launch_rocket".to_string())
        );
    }

    #[test]
    fn text_only_response_is_trimmed() {
        let result = finalize(None, "  The video shows a cat.  \n", Some("STOP")).unwrap();
        assert_eq!(
            result,
            TaskResult::TextResponse("The video shows a cat.".to_string())
        );
    }

    #[test]
    fn abnormal_stop_reason_is_surfaced() {
        let err = finalize(None, "", Some("SAFETY")).unwrap_err();
        match err {
            TaskError::GenerationStopped(reason) => assert_eq!(reason, "SAFETY"),
            other => panic!("expected GenerationStopped, got {:?}", other),
        }
    }

    #[test]
    fn empty_normal_completion_is_no_usable_response() {
        let err = finalize(None, "", Some("STOP")).unwrap_err();
        assert!(matches!(err, TaskError::NoUsableResponse));

        let err = finalize(None, "   ", None).unwrap_err();
        assert!(matches!(err, TaskError::NoUsableResponse));
    }

    #[test]
    fn instruction_embeds_prompt_and_filename() {
        let prompt = build_instruction("convert this to a GIF", "holiday.mp4");
        assert!(prompt.contains("'holiday.mp4'"));
        assert!(prompt.contains("'convert this to a GIF'"));
        assert!(prompt.contains(FFMPEG_ACTION));
        assert!(prompt.contains(SUBTITLE_ACTION));
        assert!(prompt.contains("/customfonts"));
    }

    #[test]
    fn instruction_keeps_chinese_answer_rule_for_analysis_requests() {
        let prompt = build_instruction("summarize this video", "clip.mp4");
        assert!(prompt.contains("**Current Request Analysis**"));
        assert!(prompt.contains("Provide direct text answer in Chinese"));
    }
}

// src/gemini_client.rs
//! Typed client for the Gemini REST API: multimodal streaming generation
//! plus the Files API used to stage uploaded videos remotely.

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// Name of the declared action that emits a browser-side FFmpeg invocation.
pub const FFMPEG_ACTION: &str = "execute_ffmpeg_with_optional_subtitles";
/// Name of the declared action that emits a standalone subtitle track.
pub const SUBTITLE_ACTION: &str = "generate_subtitles";

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    upload_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub tools: Option<Vec<Tool>>,
    #[serde(rename = "generationConfig")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
    pub role: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum Part {
    Text { text: String },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FileData {
        #[serde(rename = "fileData")]
        file_data: FileData,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FileData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(rename = "fileUri")]
    pub file_uri: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FunctionCall {
    pub name: String,
    pub args: HashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "functionDeclarations")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Parameters,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Parameters {
    #[serde(rename = "type")]
    pub param_type: String,
    pub properties: HashMap<String, PropertyDefinition>,
    pub required: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PropertyDefinition {
    #[serde(rename = "type")]
    pub prop_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertyDefinition>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback")]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Candidate {
    pub content: Option<Content>,
    #[serde(rename = "finishReason")]
    pub finish_reason: Option<String>,
    #[serde(rename = "safetyRatings")]
    pub safety_ratings: Option<Vec<SafetyRating>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromptFeedback {
    #[serde(rename = "blockReason")]
    pub block_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SafetyRating {
    pub category: String,
    pub probability: String,
}

/// Lifecycle state of a file stored by the Files API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    StateUnspecified,
    Processing,
    Active,
    Failed,
}

/// Handle for a file held by the Files API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// Opaque resource name, e.g. `files/abc-123`.
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub uri: String,
    pub state: Option<FileState>,
}

impl FileInfo {
    pub fn is_active(&self) -> bool {
        self.state == Some(FileState::Active)
    }

    pub fn is_processing(&self) -> bool {
        self.state == Some(FileState::Processing)
    }
}

#[derive(Debug, Deserialize)]
struct UploadFileResponse {
    file: FileInfo,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            upload_url: "https://generativelanguage.googleapis.com/upload/v1beta".to_string(),
        }
    }

    /// Upload a staged file through the Files API resumable protocol and
    /// return its handle. The returned state is usually PROCESSING; callers
    /// poll [`get_file`](Self::get_file) until it reaches ACTIVE.
    pub async fn upload_file(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<FileInfo, ClientError> {
        let num_bytes = tokio::fs::metadata(path).await?.len();

        let start_url = format!("{}/files?key={}", self.upload_url, self.api_key);
        let start_response = self
            .client
            .post(&start_url)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", num_bytes)
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "file": { "display_name": display_name } }))
            .send()
            .await?;

        if !start_response.status().is_success() {
            let error_text = start_response.text().await?;
            return Err(format!("Files API upload start failed: {}", error_text).into());
        }

        let session_url = start_response
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .ok_or("Files API did not return an upload session URL")?
            .to_string();

        let file = tokio::fs::File::open(path).await?;
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));

        let finalize_response = self
            .client
            .post(&session_url)
            .header("Content-Length", num_bytes)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(body)
            .send()
            .await?;

        if !finalize_response.status().is_success() {
            let error_text = finalize_response.text().await?;
            return Err(format!("Files API upload failed: {}", error_text).into());
        }

        let uploaded: UploadFileResponse = finalize_response.json().await?;
        tracing::info!(
            "📁 Uploaded file to Gemini: name={}, state={:?}",
            uploaded.file.name,
            uploaded.file.state
        );
        Ok(uploaded.file)
    }

    /// Fetch the current handle for a stored file, by resource name.
    pub async fn get_file(&self, name: &str) -> Result<FileInfo, ClientError> {
        let url = format!("{}/{}?key={}", self.base_url, name, self.api_key);
        let response = self.client.get(&url).send().await?;

        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            let error_text = response.text().await?;
            Err(format!("Files API get failed: {}", error_text).into())
        }
    }

    /// Invoke `streamGenerateContent` and forward each SSE chunk as it
    /// arrives. The receiver side sees parsed [`GenerateContentResponse`]
    /// values in network order; the channel closes when the remote stream
    /// ends or errors.
    pub async fn generate_content_stream(
        &self,
        model: &str,
        request: GenerateContentRequest,
    ) -> Result<UnboundedReceiverStream<Result<GenerateContentResponse, ClientError>>, ClientError>
    {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Gemini API error: {}", error_text).into());
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(next) = byte_stream.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(format!("Gemini stream read error: {}", e).into()));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                for payload in drain_sse_events(&mut buffer) {
                    match serde_json::from_str::<GenerateContentResponse>(&payload) {
                        Ok(chunk) => {
                            if tx.send(Ok(chunk)).is_err() {
                                // Consumer went away, stop reading.
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Skipping unparseable stream chunk: {}", e);
                        }
                    }
                }
            }
        });

        Ok(UnboundedReceiverStream::new(rx))
    }
}

/// Pull complete SSE events out of `buffer`, returning the concatenated
/// `data:` payload of each. Incomplete trailing events stay buffered until
/// more bytes arrive.
fn drain_sse_events(buffer: &mut String) -> Vec<String> {
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }

    let mut payloads = Vec::new();
    while let Some(boundary) = buffer.find("\n\n") {
        let event: String = buffer.drain(..boundary + 2).collect();
        let mut data = String::new();
        for line in event.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.trim_start());
            }
        }
        if !data.is_empty() && data != "[DONE]" {
            payloads.push(data);
        }
    }
    payloads
}

/// The two callable actions declared to the model: a browser-side FFmpeg
/// invocation (optionally burning subtitles) and standalone subtitle-track
/// generation.
pub fn create_video_actions() -> Vec<FunctionDeclaration> {
    vec![
        FunctionDeclaration {
            name: FFMPEG_ACTION.to_string(),
            description: "Executes an FFmpeg command in the user's web browser using FFmpeg.wasm and can optionally include subtitles. \
                Use this tool when the user asks to perform video manipulations like trimming, converting, adding subtitles, etc. \
                Provide the full FFmpeg command arguments, the desired output filename for the video, \
                the content of the subtitles (if requested, in SRT or VTT format), and a filename for the subtitles."
                .to_string(),
            parameters: Parameters {
                param_type: "object".to_string(),
                properties: HashMap::from([
                    (
                        "command_array".to_string(),
                        PropertyDefinition {
                            prop_type: "array".to_string(),
                            description: "The FFmpeg command arguments as an array of strings (without 'ffmpeg' at the beginning). \
                                Example: ['-i', 'input.mp4', '-vf', 'subtitles=subs.srt', 'output.mp4']"
                                .to_string(),
                            items: Some(Box::new(PropertyDefinition {
                                prop_type: "string".to_string(),
                                description: "A single FFmpeg argument".to_string(),
                                items: None,
                            })),
                        },
                    ),
                    (
                        "output_filename".to_string(),
                        PropertyDefinition {
                            prop_type: "string".to_string(),
                            description: "The desired name for the output video file, e.g. 'trimmed_video.mp4'."
                                .to_string(),
                            items: None,
                        },
                    ),
                    (
                        "subtitles_content".to_string(),
                        PropertyDefinition {
                            prop_type: "string".to_string(),
                            description: "The actual content of the subtitles (SRT or VTT format). Omit or leave empty if no subtitles are generated."
                                .to_string(),
                            items: None,
                        },
                    ),
                    (
                        "subtitles_filename".to_string(),
                        PropertyDefinition {
                            prop_type: "string".to_string(),
                            description: "The filename for the subtitles (e.g. 'subs.srt'). Omit or leave empty if no subtitles are generated."
                                .to_string(),
                            items: None,
                        },
                    ),
                ]),
                required: vec!["command_array".to_string(), "output_filename".to_string()],
            },
        },
        FunctionDeclaration {
            name: SUBTITLE_ACTION.to_string(),
            description: "Generates a standalone subtitle track for the video without transforming the video itself. \
                Use this tool when the user asks only for subtitles or a transcript file."
                .to_string(),
            parameters: Parameters {
                param_type: "object".to_string(),
                properties: HashMap::from([
                    (
                        "subtitles_content".to_string(),
                        PropertyDefinition {
                            prop_type: "string".to_string(),
                            description: "The subtitle content in SRT or VTT format.".to_string(),
                            items: None,
                        },
                    ),
                    (
                        "subtitles_filename".to_string(),
                        PropertyDefinition {
                            prop_type: "string".to_string(),
                            description: "The filename for the subtitles, e.g. 'subtitles.srt'."
                                .to_string(),
                            items: None,
                        },
                    ),
                    (
                        "description".to_string(),
                        PropertyDefinition {
                            prop_type: "string".to_string(),
                            description: "A short human-readable description of the generated subtitles."
                                .to_string(),
                            items: None,
                        },
                    ),
                ]),
                required: vec![
                    "subtitles_content".to_string(),
                    "subtitles_filename".to_string(),
                    "description".to_string(),
                ],
            },
        },
    ]
}

// src/error.rs
//! Error taxonomy for the processing pipeline and its endpoints.
//!
//! Everything raised inside the background worker is converted into a
//! terminal `error` progress update by the worker's outermost scope; these
//! variants exist so the conversion produces a message that names what
//! actually went wrong instead of a generic failure string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// Submission carried an inconsistent or unusable input shape.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No fresh video bytes were supplied and no previously uploaded video
    /// is available to fall back on.
    #[error("No video file provided and no previous video found to process.")]
    NoAssetAvailable,

    /// The remote file never reached the ACTIVE state.
    #[error("upload failed: {0}")]
    UploadFailed(String),

    /// A status probe or API call against the remote service failed.
    #[error("remote query failed: {0}")]
    RemoteQuery(String),

    /// Generation ended for a reason other than normal completion
    /// (safety filtering, quota, etc.).
    #[error("Gemini generation stopped: {0}")]
    GenerationStopped(String),

    /// Generation completed but produced neither text nor a recognized
    /// function call.
    #[error("Gemini did not return a usable function call or text response.")]
    NoUsableResponse,

    #[error("Gemini client is not configured (GEMINI_API_KEY missing)")]
    ClientUnavailable,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

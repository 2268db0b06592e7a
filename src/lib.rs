// lib.rs - Main library file that exports all modules
pub mod assets;
pub mod cache;
pub mod error;
pub mod gemini_client;
pub mod handlers;
pub mod middleware;
pub mod settings;
pub mod tasks;

/// Shared application state, built once at startup and injected into
/// handlers and workers. Holds the Gemini client, the task registry, the
/// one-slot video fingerprint cache, and runtime settings.
pub struct AppState {
    pub gemini: Option<gemini_client::GeminiClient>,
    pub video_cache: cache::VideoCache,
    pub tasks: tasks::SharedTaskStore,
    pub settings: settings::Settings,
}

// src/settings.rs
//! Environment-driven runtime configuration with production defaults.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Gemini model used for multimodal generation.
    pub gemini_model: String,
    /// Interval between Files API status probes while a fresh upload is
    /// still PROCESSING.
    pub upload_poll_interval: Duration,
    /// Upper bound on the total PROCESSING wait before the upload is
    /// declared failed.
    pub upload_max_wait: Duration,
    /// Interval at which a stream connection re-reads its task record.
    pub stream_poll_interval: Duration,
    /// Optional pacing delay applied after each streamed chunk is appended.
    /// Zero disables pacing entirely.
    pub stream_pacing: Duration,
    /// Age at which terminal (complete/error) task records are purged.
    pub task_ttl: Duration,
    /// How often the registry sweep runs.
    pub task_sweep_interval: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8002".to_string()),
            gemini_model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            upload_poll_interval: Duration::from_secs(env_u64("UPLOAD_POLL_INTERVAL_SECS", 1)),
            upload_max_wait: Duration::from_secs(env_u64("UPLOAD_MAX_WAIT_SECS", 120)),
            stream_poll_interval: Duration::from_millis(env_u64("STREAM_POLL_INTERVAL_MS", 150)),
            stream_pacing: Duration::from_millis(env_u64("STREAM_PACING_MS", 0)),
            task_ttl: Duration::from_secs(env_u64("TASK_TTL_SECS", 3600)),
            task_sweep_interval: Duration::from_secs(env_u64("TASK_SWEEP_INTERVAL_SECS", 600)),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8002".to_string(),
            gemini_model: "gemini-2.5-flash".to_string(),
            upload_poll_interval: Duration::from_secs(1),
            upload_max_wait: Duration::from_secs(120),
            stream_poll_interval: Duration::from_millis(150),
            stream_pacing: Duration::ZERO,
            task_ttl: Duration::from_secs(3600),
            task_sweep_interval: Duration::from_secs(600),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid value for {} ({}), using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.gemini_model, "gemini-2.5-flash");
        assert_eq!(settings.upload_poll_interval, Duration::from_secs(1));
        assert!(settings.upload_max_wait > settings.upload_poll_interval);
        assert_eq!(settings.stream_pacing, Duration::ZERO);
    }

    #[test]
    fn env_u64_falls_back_on_garbage() {
        std::env::set_var("VIDEO_COPILOT_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_u64("VIDEO_COPILOT_TEST_GARBAGE", 7), 7);
        std::env::remove_var("VIDEO_COPILOT_TEST_GARBAGE");
    }
}

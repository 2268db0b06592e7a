use axum::{Extension, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use video_copilot::handlers;
use video_copilot::middleware;
use video_copilot::tasks::{TaskManager, TaskStore};
use video_copilot::{cache::VideoCache, gemini_client::GeminiClient, settings::Settings, AppState};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging().expect("Failed to initialize logging");

    let settings = Settings::from_env();

    // Initialize Gemini client if API key is provided
    let gemini = match std::env::var("GEMINI_API_KEY").ok() {
        Some(api_key) if !api_key.is_empty() => {
            tracing::info!("Initializing Gemini AI client ({})...", settings.gemini_model);
            Some(GeminiClient::new(api_key))
        }
        _ => {
            tracing::warn!("GEMINI_API_KEY not found. Processing tasks will fail until it is set.");
            None
        }
    };

    let tasks: Arc<TaskManager> = Arc::new(TaskManager::new());
    tracing::info!("🎬 Task registry initialized");

    let shared_state = Arc::new(AppState {
        gemini,
        video_cache: VideoCache::new(),
        tasks: tasks.clone(),
        settings: settings.clone(),
    });

    // Periodic sweep of terminal task records past their TTL.
    {
        let sweep_state = shared_state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_state.settings.task_sweep_interval);
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                ticker.tick().await;
                let purged = sweep_state
                    .tasks
                    .purge_terminal(sweep_state.settings.task_ttl)
                    .await;
                if purged > 0 {
                    tracing::info!("🗑️ Purged {} finished task(s)", purged);
                }
            }
        });
    }

    let app = Router::new()
        .route("/", axum::routing::get(root))
        .merge(handlers::processing::processing_routes())
        .layer(axum::middleware::from_fn(
            middleware::logging::request_logging_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(Extension(shared_state));

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .expect("Failed to bind server address");
    tracing::info!("listening on {}", listener.local_addr().expect("local addr"));
    axum::serve(listener, app).await.expect("server error");
}

async fn root() -> axum::response::Json<serde_json::Value> {
    axum::response::Json(serde_json::json!({"message": "Video AI Backend is running"}))
}

// Production-grade logging configuration
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,video_copilot=trace,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,video_copilot=info,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    // JSON logging for production log aggregation, human-readable otherwise
    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("🎬 Video Copilot backend starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Build mode: {}",
        if cfg!(debug_assertions) { "development" } else { "production" }
    );
    tracing::info!("Log level: {}", log_level);

    Ok(())
}

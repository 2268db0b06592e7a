use axum::{
    extract::{MatchedPath, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use uuid::Uuid;

/// Structured request/response logging for every HTTP request.
pub async fn request_logging_middleware(req: Request, next: Next) -> Result<Response, StatusCode> {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().clone();
    let matched_path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %matched_path,
        "incoming request"
    );

    let response = next.run(req).await;

    let status = response.status();
    let duration = start.elapsed();

    match status.as_u16() {
        500..=599 => tracing::error!(
            request_id = %request_id,
            method = %method,
            path = %matched_path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "request completed (server error)"
        ),
        400..=499 => tracing::warn!(
            request_id = %request_id,
            method = %method,
            path = %matched_path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "request completed (client error)"
        ),
        _ => tracing::info!(
            request_id = %request_id,
            method = %method,
            path = %matched_path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "request completed"
        ),
    }

    Ok(response)
}

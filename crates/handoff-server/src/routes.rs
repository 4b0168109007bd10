//! HTTP routes served by every generation.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use handoff::Coordinator;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

/// State shared by the handlers of one generation.
pub struct AppState {
    pub coordinator: Coordinator,
    /// Inherited its listeners from a previous generation.
    pub warm: bool,
    /// Default delay for `/sleep`.
    pub sleep: Duration,
}

impl AppState {
    pub fn new(coordinator: Coordinator, warm: bool, sleep: Duration) -> Self {
        Self {
            coordinator,
            warm,
            sleep,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(hello_handler))
        .route("/restart", get(restart_handler).post(restart_handler))
        .route("/sleep", get(sleep_handler))
        .route("/health", get(health_handler))
        .fallback(hello_handler)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Names the generation that answered, so a client can watch the pid change
/// across restarts while its requests keep succeeding.
async fn hello_handler(uri: Uri) -> String {
    format!(
        "Hello, pid:{}, path:{}, time:{}\n",
        std::process::id(),
        uri.path(),
        now()
    )
}

async fn restart_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.coordinator.is_supervised() {
        warn!("Restart requested, but no supervisor will start a new generation");
        return (
            StatusCode::CONFLICT,
            format!("pid:{} has no supervisor to restart it\n", std::process::id()),
        );
    }

    info!(pid = std::process::id(), "Restart requested over HTTP");
    // The drain waits for this response to complete, so it runs detached.
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = coordinator.request_restart().await {
            warn!(error = %e, "Restart finished with errors");
        }
    });

    (
        StatusCode::ACCEPTED,
        format!("Restarting pid:{}, time:{}\n", std::process::id(), now()),
    )
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    secs: Option<u64>,
}

/// Holds the request open, for observing drains of in-flight requests.
async fn sleep_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SleepParams>,
) -> String {
    let delay = params.secs.map(Duration::from_secs).unwrap_or(state.sleep);
    let started = now();
    tokio::time::sleep(delay).await;
    format!(
        "Slept {}s, pid:{}, started:{}, finished:{}\n",
        delay.as_secs(),
        std::process::id(),
        started,
        now()
    )
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let servers: Vec<_> = coordinator
        .servers()
        .into_iter()
        .map(|s| {
            json!({
                "name": s.name,
                "addr": s.addr.map(|a| a.to_string()),
                "state": s.state.to_string(),
            })
        })
        .collect();

    let (status_code, status) = if coordinator.is_stopping() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "service": "handoff-server",
            "version": env!("CARGO_PKG_VERSION"),
            "pid": std::process::id(),
            "generation": if state.warm { "warm" } else { "cold" },
            "supervised": coordinator.is_supervised(),
            "servers": servers,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn create_test_state(supervised: bool) -> Arc<AppState> {
        let coordinator = Coordinator::new(Duration::from_secs(1), supervised);
        Arc::new(AppState::new(coordinator, supervised, Duration::from_millis(10)))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_hello_names_pid_and_path() {
        let (status, body) = get(router(create_test_state(false)), "/some/where").await;
        assert_eq!(status, StatusCode::OK);

        let body = String::from_utf8(body).unwrap();
        assert!(body.starts_with(&format!("Hello, pid:{}, path:/some/where,", std::process::id())));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, body) = get(router(create_test_state(false)), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "handoff-server");
        assert_eq!(json["generation"], "cold");
        assert_eq!(json["pid"], std::process::id());
        assert_eq!(json["servers"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_health_reports_draining() {
        let state = create_test_state(false);
        state.coordinator.request_stop().await.unwrap();

        let (status, body) = get(router(state), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "draining");
    }

    #[tokio::test]
    async fn test_restart_without_supervisor_is_refused() {
        let state = create_test_state(false);
        let (status, _) = get(router(state.clone()), "/restart").await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!state.coordinator.is_stopping());
    }

    #[tokio::test]
    async fn test_restart_under_supervisor_stops_generation() {
        let state = create_test_state(true);
        let (status, body) = get(router(state.clone()), "/restart").await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(String::from_utf8(body).unwrap().starts_with("Restarting pid:"));

        tokio::time::timeout(Duration::from_secs(5), state.coordinator.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(state.coordinator.is_stopping());
    }

    #[tokio::test]
    async fn test_sleep_uses_query_delay() {
        let (status, body) = get(router(create_test_state(false)), "/sleep?secs=0").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().starts_with("Slept 0s,"));
    }
}

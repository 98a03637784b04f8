//! Axum-based WebSocket and HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use gatehouse_core::config::GatewayAuthConfig;
use gatehouse_core::protocol::{ErrorShape, error_codes};
use gatehouse_core::secret::{constant_time_eq, sha256_hex};
use gatehouse_core::token_store::TokenStore;

use crate::admission::AdmissionError;
use crate::connection::{Identity, handle_ws_connection};
use crate::methods::{Caller, RunParams, run_task};
use crate::rate_limit::TrafficClass;
use crate::scheduler::Priority;
use crate::state::GatewayState;
use crate::tasks::QueuedTask;

/// Subject used for HTTP callers when auth mode is `none` or a shared secret is used.
const HTTP_SUBJECT: &str = "http";

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/v1/tasks", post(tasks_handler))
        .route("/hooks/{name}", post(webhook_handler));

    #[cfg(feature = "metrics")]
    let app = match crate::metrics::install_prometheus_recorder() {
        Ok(handle) => app.route("/metrics", get(move || std::future::ready(handle.render()))),
        Err(e) => {
            warn!(%e, "Prometheus recorder unavailable; /metrics disabled");
            app
        }
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Start the gateway server and its background tasks, and run until shutdown.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr();
    let background = state.start_background().await?;

    let app = router(state.clone());
    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.clone()))
    .await?;

    state.begin_shutdown("server stopped", None);
    for handle in background {
        if let Err(e) = handle.await {
            warn!(%e, "Background task ended abnormally");
        }
    }
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal(state: Arc<GatewayState>) {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => warn!(%e, "Failed to listen for Ctrl-C"),
            }
            state.begin_shutdown("signal", None);
        }
        _ = state.shutdown.cancelled() => {}
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let ip = peer.ip().to_string();
    if let Err(denied) = state.admission.check_rate(TrafficClass::Http, &ip) {
        warn!(%ip, "WebSocket upgrade rate limited");
        return too_many_requests(&denied);
    }
    ws.max_message_size(state.config.policy().max_payload.saturating_mul(2))
        .on_upgrade(move |socket| handle_ws_connection(state, socket))
}

async fn health_handler(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    if let Err(denied) = state.admission.check_rate(TrafficClass::Static, &peer.ip().to_string()) {
        return too_many_requests(&denied);
    }
    let connections = state.connections.read().await.len();
    Json(json!({
        "status": if state.shutdown.is_cancelled() { "stopping" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_ms": state.uptime_ms(),
        "connections": connections,
        "queue_depth": state.admission.queue_depth(),
    }))
    .into_response()
}

async fn tasks_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(params): Json<RunParams>,
) -> Response {
    let identity = match authenticate_bearer(&state.config.auth(), &state.tokens, bearer(&headers)).await {
        Ok(identity) => identity,
        Err(reason) => {
            warn!(reason = %reason, "HTTP task request rejected");
            #[cfg(feature = "metrics")]
            crate::metrics::record_auth_failure();
            return error_response(
                StatusCode::UNAUTHORIZED,
                &ErrorShape::new(error_codes::AUTH_FAILED, "authentication failed"),
            );
        }
    };
    let caller = Caller {
        conn_id: None,
        subject: identity.subject,
        role: identity.role,
        scopes: identity.scopes,
        device_id: None,
    };
    if let Err(denied) = state.admission.check_rate(TrafficClass::Agent, caller.rate_key()) {
        return too_many_requests(&denied);
    }

    match run_task(&state, &caller, params).await {
        Ok(payload) => {
            let status = if payload["status"] == "pending" {
                StatusCode::ACCEPTED
            } else {
                StatusCode::OK
            };
            (status, Json(payload)).into_response()
        }
        Err(error) => shape_response(&error),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WebhookBody {
    task: String,
    #[serde(default)]
    params: serde_json::Value,
}

async fn webhook_handler(
    Path(name): Path<String>,
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<WebhookBody>,
) -> Response {
    let tenant = format!("webhook:{name}");
    if let Err(denied) = state.admission.check_rate(TrafficClass::Webhook, &tenant) {
        return too_many_requests(&denied);
    }
    let id = uuid::Uuid::new_v4().to_string();
    let queued = QueuedTask {
        task: body.task,
        params: body.params,
        submitted_by: tenant.clone(),
        tenant,
        priority: Priority::Normal,
        // Nobody listens for a resume token, so a suspending run fails fast.
        origin: None,
    };
    match state.tasks.submit(&id, queued) {
        Ok(submitted) => {
            info!(hook = %name, id = %id, "Webhook enqueued");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "id": id, "depth": submitted.depth })),
            )
                .into_response()
        }
        Err(e) => too_many_requests(&e),
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Authenticate an HTTP caller from its bearer credential.
pub async fn authenticate_bearer(
    auth: &GatewayAuthConfig,
    tokens: &TokenStore,
    presented: Option<&str>,
) -> Result<Identity, String> {
    let anonymous = || Identity {
        subject: HTTP_SUBJECT.to_string(),
        role: "operator".to_string(),
        scopes: Vec::new(),
        device_id: None,
    };
    match auth.effective_mode() {
        "none" => Ok(anonymous()),
        "token" => {
            let presented = presented.ok_or("bearer token required")?;
            if auth
                .resolve_token()
                .is_some_and(|expected| constant_time_eq(presented, &expected))
            {
                return Ok(anonymous());
            }
            match tokens.verify(presented).await {
                Ok(Some(meta)) => Ok(Identity {
                    subject: meta.subject,
                    role: meta.role,
                    scopes: meta.scopes,
                    device_id: None,
                }),
                Ok(None) => Err("invalid token".into()),
                Err(e) => Err(format!("token store unavailable: {e}")),
            }
        }
        "password" => {
            let expected = auth
                .resolve_password()
                .ok_or("server password not configured")?;
            let presented = presented.ok_or("bearer password required")?;
            if constant_time_eq(&sha256_hex(presented), &sha256_hex(&expected)) {
                Ok(anonymous())
            } else {
                Err("invalid password".into())
            }
        }
        other => Err(format!("unknown auth mode: {other}")),
    }
}

fn too_many_requests(denied: &AdmissionError) -> Response {
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(denied.http_body())).into_response();
    if let Ok(value) = HeaderValue::from_str(&denied.retry_after_secs().to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

/// Map a method error to an HTTP response; admission denials become 429.
fn shape_response(error: &ErrorShape) -> Response {
    match error.code.as_str() {
        error_codes::RATE_LIMITED
        | error_codes::QUEUE_FULL
        | error_codes::QUEUE_TIMEOUT
        | error_codes::GOVERNOR_SATURATED => {
            let retry_after_ms = error.retry_after_ms.unwrap_or(1_000);
            let body = json!({
                "error": {
                    "type": "rate_limit_error",
                    "message": error.message,
                    "retry_after_ms": retry_after_ms,
                }
            });
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            let secs = retry_after_ms.div_ceil(1_000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
        error_codes::NOT_FOUND => error_response(StatusCode::NOT_FOUND, error),
        error_codes::INVALID_PARAMS | error_codes::TASK_FAILED => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, error)
        }
        error_codes::UNAVAILABLE | error_codes::STORE_ERROR => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, error)
        }
        _ => error_response(StatusCode::BAD_REQUEST, error),
    }
}

fn error_response(status: StatusCode, error: &ErrorShape) -> Response {
    (
        status,
        Json(json!({ "error": { "type": error.code, "message": error.message } })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::clock::SystemClock;
    use gatehouse_core::file_store::LockOptions;

    fn store(dir: &tempfile::TempDir) -> TokenStore {
        TokenStore::new(dir.path().join("tokens.json"), LockOptions::default(), SystemClock::shared())
    }

    fn token_mode() -> GatewayAuthConfig {
        GatewayAuthConfig {
            mode: Some("token".into()),
            token: Some("shared-secret".into()),
            ..GatewayAuthConfig::default()
        }
    }

    #[test]
    fn test_bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc "));
        assert_eq!(bearer(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer(&headers), None);
    }

    #[tokio::test]
    async fn test_bearer_auth_modes() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = store(&dir);

        let none = GatewayAuthConfig::default();
        assert_eq!(authenticate_bearer(&none, &tokens, None).await.unwrap().subject, "http");

        let auth = token_mode();
        assert!(authenticate_bearer(&auth, &tokens, None).await.is_err());
        assert!(authenticate_bearer(&auth, &tokens, Some("wrong")).await.is_err());
        assert!(authenticate_bearer(&auth, &tokens, Some("shared-secret")).await.is_ok());

        let issued = tokens.issue("ci-bot", "automation", vec!["tasks".into()], None).await.unwrap();
        let identity = authenticate_bearer(&auth, &tokens, Some(&issued.token)).await.unwrap();
        assert_eq!(identity.subject, "ci-bot");
        assert_eq!(identity.scopes, vec!["tasks".to_string()]);
    }

    #[test]
    fn test_denial_sets_retry_after() {
        let denied = AdmissionError::RateLimited {
            class: "agent",
            retry_after_ms: 1_500,
        };
        let response = too_many_requests(&denied);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn test_governor_timeout_maps_to_429() {
        let error = ErrorShape::new(error_codes::QUEUE_TIMEOUT, "timed out").with_retry_after(200);
        let response = shape_response(&error);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");

        let missing = ErrorShape::new(error_codes::NOT_FOUND, "unknown task 'x'");
        assert_eq!(shape_response(&missing).status(), StatusCode::NOT_FOUND);
    }
}

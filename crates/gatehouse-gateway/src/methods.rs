//! Gateway method handlers.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use gatehouse_core::error::GatehouseError;
use gatehouse_core::protocol::{ErrorShape, GatewayFrame, InterruptBinding, InterruptStatus, error_codes};

use crate::events::Replay;
use crate::executor::{RunStart, TaskContext, flatten, start_run};
use crate::rate_limit::TrafficClass;
use crate::scheduler::Priority;
use crate::state::GatewayState;
use crate::tasks::{CancelRefused, DetachedRun, QueuedTask, publish};

/// Methods advertised in `hello-ok`.
pub const METHODS: &[&str] = &[
    "health",
    "snapshot.get",
    "events.replay",
    "admission.status",
    "task.run",
    "task.submit",
    "task.cancel",
    "agents.spawn",
    "interrupt.resume",
    "interrupt.get",
    "interrupt.list",
    "tokens.issue",
    "tokens.revoke",
    "tokens.list",
];

const ADMIN_SCOPE: &str = "admin";

/// The authenticated party behind a request.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Set for WebSocket callers; HTTP callers have no connection.
    pub conn_id: Option<String>,
    pub subject: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub device_id: Option<String>,
}

impl Caller {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Key used for per-caller rate limiting.
    pub fn rate_key(&self) -> &str {
        &self.subject
    }
}

/// Limiter class a method draws from.
pub fn method_class(method: &str) -> TrafficClass {
    match method {
        "task.run" | "task.submit" | "task.cancel" | "agents.spawn" => TrafficClass::Agent,
        m if m.starts_with("interrupt.") => TrafficClass::Tool,
        _ => TrafficClass::Http,
    }
}

/// Dispatch a method request and return the response frame.
pub async fn dispatch_method(
    state: &Arc<GatewayState>,
    caller: &Caller,
    request_id: &str,
    method: &str,
    params: Option<serde_json::Value>,
) -> GatewayFrame {
    debug!(method, subject = %caller.subject, "Dispatching method");

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let response = match state.admission.check_rate(method_class(method), caller.rate_key()) {
        Ok(()) => match dispatch_method_inner(state, caller, method, params).await {
            Ok(payload) => GatewayFrame::ok(request_id, payload),
            Err(error) => GatewayFrame::err(request_id, error),
        },
        Err(denied) => GatewayFrame::err(request_id, denied.to_error_shape()),
    };

    #[cfg(feature = "metrics")]
    crate::metrics::record_request(method, start.elapsed().as_secs_f64());

    response
}

type MethodResult = Result<serde_json::Value, ErrorShape>;

async fn dispatch_method_inner(
    state: &Arc<GatewayState>,
    caller: &Caller,
    method: &str,
    params: Option<serde_json::Value>,
) -> MethodResult {
    match method {
        "health" => Ok(handle_health(state).await),
        "snapshot.get" => to_payload(&state.snapshot().await),
        "events.replay" => handle_events_replay(state, params).await,
        "admission.status" => Ok(handle_admission_status(state)),
        "task.run" => run_task(state, caller, parse_params(params)?).await,
        "task.submit" => handle_task_submit(state, caller, params),
        "task.cancel" => handle_task_cancel(state, caller, params),
        "agents.spawn" => handle_agents_spawn(state, caller, params).await,
        "interrupt.resume" => handle_interrupt_resume(state, caller, params).await,
        "interrupt.get" => handle_interrupt_get(state, params).await,
        "interrupt.list" => handle_interrupt_list(state, params).await,
        "tokens.issue" => handle_tokens_issue(state, caller, params).await,
        "tokens.revoke" => handle_tokens_revoke(state, caller, params).await,
        "tokens.list" => handle_tokens_list(state, caller).await,
        "hello" => Err(ErrorShape::new(error_codes::INVALID_REQUEST, "already connected")),
        _ => Err(ErrorShape::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Unknown method: {method}"),
        )),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<serde_json::Value>) -> Result<T, ErrorShape> {
    let value = params.unwrap_or_else(|| json!({}));
    serde_json::from_value(value).map_err(|e| ErrorShape::new(error_codes::INVALID_PARAMS, e.to_string()))
}

fn to_payload<T: serde::Serialize>(value: &T) -> MethodResult {
    serde_json::to_value(value).map_err(|e| {
        warn!(%e, "Failed to serialize method payload");
        ErrorShape::new(error_codes::UNAVAILABLE, "internal error")
    })
}

/// Store details stay server-side.
fn store_error(e: GatehouseError) -> ErrorShape {
    warn!(error = %e, "Store operation failed");
    ErrorShape::new(error_codes::STORE_ERROR, "store unavailable").with_retry_after(1_000)
}

fn require_admin(caller: &Caller) -> Result<(), ErrorShape> {
    if caller.has_scope(ADMIN_SCOPE) {
        Ok(())
    } else {
        Err(ErrorShape::new(error_codes::FORBIDDEN, "admin scope required"))
    }
}

// ============================================================
// State methods
// ============================================================

async fn handle_health(state: &Arc<GatewayState>) -> serde_json::Value {
    let connections = state.connections.read().await.len();
    json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_ms": state.uptime_ms(),
        "connections": connections,
        "tasks": state.executor.tasks(),
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReplayParams {
    since_seq: u64,
}

async fn handle_events_replay(state: &Arc<GatewayState>, params: Option<serde_json::Value>) -> MethodResult {
    let params: ReplayParams = parse_params(params)?;
    match state.events.replay_since(params.since_seq) {
        Replay::Events(events) => Ok(json!({ "mode": "replay", "events": events })),
        Replay::SnapshotRequired => {
            let snapshot = state.snapshot().await;
            Ok(json!({ "mode": "snapshot", "snapshot": snapshot }))
        }
    }
}

fn handle_admission_status(state: &Arc<GatewayState>) -> serde_json::Value {
    let snapshot = state.admission.snapshot();
    let depth = state.admission.scheduler().depth_by_priority();
    let by_priority: serde_json::Map<String, serde_json::Value> = Priority::ALL
        .iter()
        .map(|p| (p.as_str().to_string(), json!(depth[p.index()])))
        .collect();
    json!({
        "governors": snapshot.governors,
        "queue_depth": snapshot.queue_depth,
        "queue_by_priority": by_priority,
        "rate_limit_keys": state.admission.limiters.key_counts(),
    })
}

// ============================================================
// Task methods
// ============================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunParams {
    pub task: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Fairness key; defaults to the caller's subject.
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Take a governor permit for the tenant, then run. Shared by `task.run`
/// and `POST /v1/tasks`.
pub async fn run_task(state: &Arc<GatewayState>, caller: &Caller, params: RunParams) -> MethodResult {
    let tenant = params.tenant.unwrap_or_else(|| caller.subject.clone());
    let permit = state
        .admission
        .acquire(&tenant)
        .await
        .map_err(|e| e.to_error_shape())?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let session_id = params.session_id.unwrap_or_else(|| run_id.clone());
    info!(run_id = %run_id, task = %params.task, tenant = %tenant, "Task run started");

    let ctx = TaskContext::new(run_id.clone(), session_id, tenant.clone(), state.interrupts.clone());
    match start_run(state.executor.clone(), ctx, params.task, params.params, permit).await {
        RunStart::Finished(Ok(result)) => Ok(json!({
            "run_id": run_id,
            "status": "completed",
            "result": result,
        })),
        RunStart::Finished(Err(e)) => {
            warn!(run_id = %run_id, code = e.code(), "Task run failed");
            Err(e.to_error_shape())
        }
        RunStart::Suspended {
            suspension,
            completion,
        } => {
            let events = state.events.clone();
            let id = run_id.clone();
            tokio::spawn(async move {
                let result = flatten(completion.await);
                publish(events.as_ref(), &id, &tenant, result);
            });
            Ok(json!({
                "run_id": run_id,
                "status": "pending",
                "approval_request_id": suspension.approval_request_id,
                "resume_token": suspension.resume_token,
                "expires_at_ms": suspension.expires_at_ms,
            }))
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitParams {
    task: String,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    tenant: Option<String>,
}

fn handle_task_submit(state: &Arc<GatewayState>, caller: &Caller, params: Option<serde_json::Value>) -> MethodResult {
    let params: SubmitParams = parse_params(params)?;
    let priority = match params.priority.as_deref() {
        Some(p) => p
            .parse::<Priority>()
            .map_err(|e| ErrorShape::new(error_codes::INVALID_PARAMS, e.to_string()))?,
        None => Priority::Normal,
    };
    let id = uuid::Uuid::new_v4().to_string();
    let submitted = state
        .tasks
        .submit(
            &id,
            QueuedTask {
                task: params.task,
                params: params.params,
                tenant: params.tenant.unwrap_or_else(|| caller.subject.clone()),
                priority,
                submitted_by: caller.subject.clone(),
                origin: caller.conn_id.clone(),
            },
        )
        .map_err(|e| e.to_error_shape())?;
    Ok(json!({ "id": id, "depth": submitted.depth }))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CancelParams {
    id: String,
}

fn handle_task_cancel(state: &Arc<GatewayState>, caller: &Caller, params: Option<serde_json::Value>) -> MethodResult {
    let params: CancelParams = parse_params(params)?;
    match state
        .tasks
        .cancel_as(&params.id, &caller.subject, caller.has_scope(ADMIN_SCOPE))
    {
        Ok(()) => Ok(json!({ "id": params.id, "cancelled": true })),
        Err(CancelRefused::NotQueued) => {
            Err(ErrorShape::new(error_codes::NOT_FOUND, "no queued task with that id"))
        }
        Err(CancelRefused::NotOwner) => Err(ErrorShape::new(
            error_codes::FORBIDDEN,
            "only the submitter or an admin may cancel this task",
        )),
    }
}

async fn handle_agents_spawn(
    state: &Arc<GatewayState>,
    caller: &Caller,
    params: Option<serde_json::Value>,
) -> MethodResult {
    let params: RunParams = parse_params(params)?;
    let tenant = params.tenant.unwrap_or_else(|| caller.subject.clone());
    let permit = state
        .admission
        .acquire_spawn(&tenant)
        .await
        .map_err(|e| e.to_error_shape())?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let session_id = params.session_id.unwrap_or_else(|| run_id.clone());
    info!(run_id = %run_id, task = %params.task, tenant = %tenant, "Agent spawned");

    let ctx = TaskContext::new(run_id.clone(), session_id, tenant.clone(), state.interrupts.clone());
    let executor = state.executor.clone();
    let events = state.events.clone();
    let interrupts = state.interrupts.clone();
    let origin = caller.conn_id.clone();
    let id = run_id.clone();
    tokio::spawn(async move {
        let result = match start_run(executor, ctx, params.task, params.params, permit).await {
            RunStart::Finished(result) => result,
            RunStart::Suspended {
                suspension,
                completion,
            } => {
                let detached = DetachedRun {
                    id: &id,
                    tenant: &tenant,
                    origin: origin.as_deref(),
                };
                detached
                    .follow(events.as_ref(), &interrupts, suspension, completion)
                    .await
            }
        };
        publish(events.as_ref(), &id, &tenant, result);
    });

    Ok(json!({ "run_id": run_id }))
}

// ============================================================
// Interrupt methods
// ============================================================

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ResumeParams {
    approval_request_id: String,
    run_id: String,
    session_id: String,
    tool_call_id: String,
    resume_token: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

async fn handle_interrupt_resume(
    state: &Arc<GatewayState>,
    caller: &Caller,
    params: Option<serde_json::Value>,
) -> MethodResult {
    let params: ResumeParams = parse_params(params)?;
    let binding = InterruptBinding {
        run_id: params.run_id,
        session_id: params.session_id,
        tool_call_id: params.tool_call_id,
    };
    let resolution = state
        .interrupts
        .resume(
            &params.approval_request_id,
            &binding,
            &params.resume_token,
            params.result,
            &caller.subject,
        )
        .await
        .map_err(|e| e.to_error_shape())?;
    to_payload(&resolution)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct InterruptIdParams {
    approval_request_id: String,
}

async fn handle_interrupt_get(state: &Arc<GatewayState>, params: Option<serde_json::Value>) -> MethodResult {
    let params: InterruptIdParams = parse_params(params)?;
    match state
        .interrupts
        .get(&params.approval_request_id)
        .await
        .map_err(|e| e.to_error_shape())?
    {
        Some(summary) => to_payload(&summary),
        None => Err(ErrorShape::new(error_codes::NOT_FOUND, "interrupt not found")),
    }
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct InterruptListParams {
    #[serde(default)]
    status: Option<InterruptStatus>,
}

async fn handle_interrupt_list(state: &Arc<GatewayState>, params: Option<serde_json::Value>) -> MethodResult {
    let params: InterruptListParams = parse_params(params)?;
    let mut interrupts = state.interrupts.list().await.map_err(|e| e.to_error_shape())?;
    if let Some(status) = params.status {
        interrupts.retain(|i| i.status == status);
    }
    Ok(json!({ "interrupts": interrupts }))
}

// ============================================================
// Token methods
// ============================================================

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct IssueParams {
    subject: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    ttl_ms: Option<u64>,
}

async fn handle_tokens_issue(
    state: &Arc<GatewayState>,
    caller: &Caller,
    params: Option<serde_json::Value>,
) -> MethodResult {
    require_admin(caller)?;
    let params: IssueParams = parse_params(params)?;
    let role = params.role.unwrap_or_else(|| "operator".into());
    let issued = state
        .tokens
        .issue(&params.subject, &role, params.scopes, params.ttl_ms)
        .await
        .map_err(store_error)?;
    info!(jti = %issued.metadata.jti, subject = %params.subject, issuer = %caller.subject, "Token issued");
    Ok(json!({
        "token": issued.token,
        "metadata": issued.metadata.redacted(),
    }))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RevokeParams {
    jti: String,
}

async fn handle_tokens_revoke(
    state: &Arc<GatewayState>,
    caller: &Caller,
    params: Option<serde_json::Value>,
) -> MethodResult {
    require_admin(caller)?;
    let params: RevokeParams = parse_params(params)?;
    match state.tokens.revoke(&params.jti).await.map_err(store_error)? {
        Some(metadata) => {
            info!(jti = %params.jti, issuer = %caller.subject, "Token revoked");
            to_payload(&metadata.redacted())
        }
        None => Err(ErrorShape::new(error_codes::NOT_FOUND, "token not found")),
    }
}

async fn handle_tokens_list(state: &Arc<GatewayState>, caller: &Caller) -> MethodResult {
    require_admin(caller)?;
    let tokens: Vec<_> = state
        .tokens
        .list()
        .await
        .map_err(store_error)?
        .iter()
        .map(|t| t.redacted())
        .collect();
    Ok(json!({ "tokens": tokens }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::BuiltinExecutor;
    use crate::hooks::HookRegistry;
    use gatehouse_core::clock::SystemClock;
    use gatehouse_core::config::{Config, InterruptsConfig, TokensConfig};

    fn test_state(dir: &tempfile::TempDir) -> Arc<GatewayState> {
        let config = Config {
            interrupts: Some(InterruptsConfig {
                path: Some(dir.path().join("interrupts.json").display().to_string()),
                ..InterruptsConfig::default()
            }),
            tokens: Some(TokensConfig {
                path: Some(dir.path().join("tokens.json").display().to_string()),
            }),
            ..Config::default()
        };
        GatewayState::new(
            config,
            Arc::new(BuiltinExecutor),
            Arc::new(HookRegistry::new()),
            SystemClock::shared(),
        )
    }

    fn caller(scopes: &[&str]) -> Caller {
        Caller {
            conn_id: Some("conn-1".into()),
            subject: "tester".into(),
            role: "operator".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            device_id: None,
        }
    }

    fn response(frame: GatewayFrame) -> (bool, serde_json::Value) {
        match frame {
            GatewayFrame::Response(res) => {
                let body = if res.ok {
                    res.payload.unwrap_or_default()
                } else {
                    serde_json::to_value(res.error.unwrap()).unwrap()
                };
                (res.ok, body)
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    async fn call(state: &Arc<GatewayState>, caller: &Caller, method: &str, params: serde_json::Value) -> (bool, serde_json::Value) {
        response(dispatch_method(state, caller, "r1", method, Some(params)).await)
    }

    #[test]
    fn test_method_classes() {
        assert_eq!(method_class("task.run"), TrafficClass::Agent);
        assert_eq!(method_class("agents.spawn"), TrafficClass::Agent);
        assert_eq!(method_class("interrupt.resume"), TrafficClass::Tool);
        assert_eq!(method_class("health"), TrafficClass::Http);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (ok, body) = call(&state, &caller(&[]), "nonexistent.method", json!({})).await;
        assert!(!ok);
        assert_eq!(body["code"], "method_not_found");
    }

    #[tokio::test]
    async fn test_health_reports_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (ok, body) = call(&state, &caller(&[]), "health", json!({})).await;
        assert!(ok);
        assert_eq!(body["status"], "ok");
        assert!(body["tasks"].as_array().unwrap().iter().any(|t| t == "approval"));
    }

    #[tokio::test]
    async fn test_task_run_completes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (ok, body) = call(
            &state,
            &caller(&[]),
            "task.run",
            json!({"task": "echo", "params": {"hi": 1}}),
        )
        .await;
        assert!(ok);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["result"]["hi"], 1);
    }

    #[tokio::test]
    async fn test_task_run_rejects_unknown_params() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (ok, body) = call(&state, &caller(&[]), "task.run", json!({"task": "echo", "bogus": 1})).await;
        assert!(!ok);
        assert_eq!(body["code"], "invalid_params");
    }

    #[tokio::test]
    async fn test_pending_run_resumes_through_methods() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let me = caller(&[]);

        let (ok, pending) = call(
            &state,
            &me,
            "task.run",
            json!({"task": "approval", "session_id": "s1", "params": {"tool_call_id": "tc1"}}),
        )
        .await;
        assert!(ok);
        assert_eq!(pending["status"], "pending");
        let run_id = pending["run_id"].as_str().unwrap().to_string();
        let approval_id = pending["approval_request_id"].as_str().unwrap().to_string();
        let token = pending["resume_token"].as_str().unwrap().to_string();

        let (_, listed) = call(&state, &me, "interrupt.list", json!({"status": "pending"})).await;
        assert_eq!(listed["interrupts"].as_array().unwrap().len(), 1);
        assert!(!listed.to_string().contains(&token));

        let resume = |tool_call_id: &str| {
            json!({
                "approval_request_id": approval_id,
                "run_id": run_id,
                "session_id": "s1",
                "tool_call_id": tool_call_id,
                "resume_token": token,
                "result": {"approved": true},
            })
        };
        let (ok, body) = call(&state, &me, "interrupt.resume", resume("other")).await;
        assert!(!ok);
        assert_eq!(body["code"], "binding_mismatch");

        let (ok, body) = call(&state, &me, "interrupt.resume", resume("tc1")).await;
        assert!(ok);
        assert_eq!(body["status"], "resumed");
        assert_eq!(body["resolved_by"], "tester");

        let (ok, body) = call(&state, &me, "interrupt.resume", resume("tc1")).await;
        assert!(!ok);
        assert_eq!(body["code"], "already_resolved");
    }

    #[tokio::test]
    async fn test_task_submit_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let me = caller(&[]);

        let (ok, body) = call(&state, &me, "task.submit", json!({"task": "echo", "priority": "urgent"})).await;
        assert!(!ok);
        assert_eq!(body["code"], "invalid_params");

        let (ok, body) = call(&state, &me, "task.submit", json!({"task": "echo", "priority": "high"})).await;
        assert!(ok);
        assert_eq!(body["depth"], 1);
        let id = body["id"].as_str().unwrap().to_string();

        let (_, status) = call(&state, &me, "admission.status", json!({})).await;
        assert_eq!(status["queue_by_priority"]["high"], 1);

        let mut other = caller(&[]);
        other.subject = "someone-else".into();
        let (ok, body) = call(&state, &other, "task.cancel", json!({"id": id})).await;
        assert!(!ok);
        assert_eq!(body["code"], "forbidden");

        let (ok, _) = call(&state, &me, "task.cancel", json!({"id": id})).await;
        assert!(ok);
        let (ok, body) = call(&state, &me, "task.cancel", json!({"id": id})).await;
        assert!(!ok);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_spawned_run_without_listener_expires_its_interrupt() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        // "conn-1" never attached to the bus, so the token has nowhere to go.
        let (ok, body) = call(
            &state,
            &caller(&[]),
            "agents.spawn",
            json!({"task": "approval", "params": {"tool_call_id": "tc1"}}),
        )
        .await;
        assert!(ok);
        let run_id = body["run_id"].as_str().unwrap().to_string();

        let settled = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let all = state.interrupts.list().await.unwrap();
                let spawn_active = state.admission.snapshot().governors[1].active;
                if all.iter().any(|i| i.binding.run_id == run_id && i.status == InterruptStatus::Expired)
                    && spawn_active == 0
                {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok(), "spawned run kept its interrupt and permit");
    }

    #[tokio::test]
    async fn test_tokens_require_admin() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let (ok, body) = call(&state, &caller(&[]), "tokens.list", json!({})).await;
        assert!(!ok);
        assert_eq!(body["code"], "forbidden");

        let admin = caller(&["admin"]);
        let (ok, issued) = call(&state, &admin, "tokens.issue", json!({"subject": "bot", "scopes": ["tasks"]})).await;
        assert!(ok);
        assert!(issued["token"].as_str().unwrap().starts_with("gh_"));
        assert!(issued["metadata"].get("secret_hash").is_none());

        let jti = issued["metadata"]["jti"].as_str().unwrap().to_string();
        let (ok, revoked) = call(&state, &admin, "tokens.revoke", json!({"jti": jti})).await;
        assert!(ok);
        assert!(revoked["revoked_at_ms"].is_u64());

        let (_, listed) = call(&state, &admin, "tokens.list", json!({})).await;
        assert_eq!(listed["tokens"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_replay_falls_back_to_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let (ok, body) = call(&state, &caller(&[]), "events.replay", json!({"since_seq": 0})).await;
        assert!(ok);
        assert_eq!(body["mode"], "replay");

        let (ok, body) = call(&state, &caller(&[]), "events.replay", json!({"since_seq": 42})).await;
        assert!(ok);
        assert_eq!(body["mode"], "snapshot");
        assert!(body["snapshot"]["admission"]["governors"].is_array());
    }
}

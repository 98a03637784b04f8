//! The seam between the gateway and whatever actually runs tasks.
//!
//! A [`TaskExecutor`] runs a named task. When a task needs an outside
//! decision it calls [`TaskContext::suspend`], which registers a durable
//! interrupt and blocks until the interrupt is resumed or expires.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use gatehouse_core::protocol::{ErrorShape, InterruptBinding, InterruptStatus, error_codes};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::governor::Permit;
use crate::interrupts::{InterruptError, Resolution, ToolInterruptManager};

/// Longest `sleep` the built-in executor will honor.
const MAX_SLEEP_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("task failed: {0}")]
    Failed(String),

    #[error("interrupt was abandoned")]
    Abandoned,

    #[error(transparent)]
    Interrupt(#[from] InterruptError),
}

impl TaskError {
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::UnknownTask(_) => error_codes::NOT_FOUND,
            TaskError::InvalidParams(_) => error_codes::INVALID_PARAMS,
            TaskError::Failed(_) | TaskError::Abandoned => error_codes::TASK_FAILED,
            TaskError::Interrupt(e) => e.code(),
        }
    }

    pub fn to_error_shape(&self) -> ErrorShape {
        match self {
            TaskError::Interrupt(e) => e.to_error_shape(),
            _ => ErrorShape::new(self.code(), self.to_string()),
        }
    }
}

/// Handed to the caller the first time a run suspends.
#[derive(Debug, Clone, Serialize)]
pub struct Suspension {
    pub approval_request_id: String,
    /// What `interrupt.resume` must present alongside the token.
    pub binding: InterruptBinding,
    pub resume_token: String,
    pub expires_at_ms: u64,
}

/// Identity of one run plus the hooks it needs to suspend.
pub struct TaskContext {
    pub run_id: String,
    pub session_id: String,
    pub tenant: String,
    interrupts: Arc<ToolInterruptManager>,
    suspended: Mutex<Option<oneshot::Sender<Suspension>>>,
}

impl TaskContext {
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        tenant: impl Into<String>,
        interrupts: Arc<ToolInterruptManager>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            tenant: tenant.into(),
            interrupts,
            suspended: Mutex::new(None),
        }
    }

    fn with_listener(mut self, tx: oneshot::Sender<Suspension>) -> Self {
        self.suspended = Mutex::new(Some(tx));
        self
    }

    /// Pause until an external party resumes `tool_call_id`, or the interrupt expires.
    ///
    /// The resume token is passed to whoever started the run (only for the
    /// first suspension); it is never logged or broadcast.
    pub async fn suspend(
        &self,
        tool_call_id: &str,
        interrupt: serde_json::Value,
        timeout_ms: Option<u64>,
    ) -> Result<Resolution, TaskError> {
        let approval_request_id = uuid::Uuid::new_v4().to_string();
        let binding = InterruptBinding {
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            tool_call_id: tool_call_id.to_string(),
        };
        let emitted = self
            .interrupts
            .emit(&approval_request_id, binding.clone(), Some(interrupt), timeout_ms)
            .await?;

        let listener = self
            .suspended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = listener {
            let _ = tx.send(Suspension {
                approval_request_id: approval_request_id.clone(),
                binding,
                resume_token: emitted.resume_token,
                expires_at_ms: emitted.expires_at_ms,
            });
        }

        debug!(run_id = %self.run_id, approval_request_id, "Run suspended");
        emitted.wait.resolved().await.ok_or(TaskError::Abandoned)
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Task names this executor accepts, reported by `health`.
    fn tasks(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError>;
}

/// How a run looked once it either finished or first suspended.
pub enum RunStart {
    Finished(Result<serde_json::Value, TaskError>),
    Suspended {
        suspension: Suspension,
        completion: JoinHandle<Result<serde_json::Value, TaskError>>,
    },
}

/// Run `task` on a background task that owns `permit` until it finishes.
///
/// Returns as soon as the run completes or suspends, whichever comes first.
pub async fn start_run(
    executor: Arc<dyn TaskExecutor>,
    ctx: TaskContext,
    task: String,
    params: serde_json::Value,
    permit: Permit,
) -> RunStart {
    let (tx, mut rx) = oneshot::channel();
    let ctx = ctx.with_listener(tx);
    let mut completion = tokio::spawn(async move {
        let _permit = permit;
        executor.execute(&ctx, &task, params).await
    });

    tokio::select! {
        biased;
        joined = &mut completion => RunStart::Finished(flatten(joined)),
        Ok(suspension) = &mut rx => RunStart::Suspended { suspension, completion },
    }
}

/// Collapse a join result into the task result.
pub fn flatten(
    joined: Result<Result<serde_json::Value, TaskError>, tokio::task::JoinError>,
) -> Result<serde_json::Value, TaskError> {
    joined.unwrap_or_else(|e| {
        warn!(error = %e, "Task panicked or was aborted");
        Err(TaskError::Failed("task aborted".into()))
    })
}

/// A small executor used by the CLI and tests.
///
/// - `echo` returns its params.
/// - `sleep {ms}` waits, then returns `{slept_ms}`.
/// - `fail {message}` always errors.
/// - `approval {tool_call_id?, prompt?, timeout_ms?}` suspends for a decision.
#[derive(Debug, Default)]
pub struct BuiltinExecutor;

#[async_trait]
impl TaskExecutor for BuiltinExecutor {
    fn tasks(&self) -> Vec<String> {
        ["echo", "sleep", "fail", "approval"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        match task {
            "echo" => Ok(params),
            "sleep" => {
                let ms = params
                    .get("ms")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| TaskError::InvalidParams("missing 'ms'".into()))?;
                let ms = ms.min(MAX_SLEEP_MS);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept_ms": ms }))
            }
            "fail" => {
                let message = params
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("requested failure");
                Err(TaskError::Failed(message.to_string()))
            }
            "approval" => {
                let tool_call_id = params
                    .get("tool_call_id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| format!("call-{}", uuid::Uuid::new_v4().simple()));
                let timeout_ms = params.get("timeout_ms").and_then(|v| v.as_u64());
                let prompt = params.get("prompt").cloned().unwrap_or(json!("approve?"));

                let resolution = ctx
                    .suspend(&tool_call_id, json!({ "prompt": prompt }), timeout_ms)
                    .await?;
                match resolution.status {
                    InterruptStatus::Resumed => Ok(json!({
                        "approval_request_id": resolution.approval_request_id,
                        "resolved_by": resolution.resolved_by,
                        "result": resolution.result,
                    })),
                    _ => Err(TaskError::Interrupt(InterruptError::Expired)),
                }
            }
            other => Err(TaskError::UnknownTask(other.to_string())),
        }
    }
}

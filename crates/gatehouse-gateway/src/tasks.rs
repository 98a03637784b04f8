//! Queued task execution.
//!
//! `task.submit` and inbound webhooks put work in the Priority Scheduler.
//! A fixed pool of workers drains it: expired entries fail with
//! `queue_timeout`, live ones take a governor permit and run.
//!
//! Nobody awaits a queued run, so when one suspends its resume token goes
//! to the submitting connection as a targeted `task.suspended` event. With
//! no connection to receive it the interrupt is expired at once and the
//! run's permit comes back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionError, AdmissionState};
use crate::events::{
    EVENT_TASK_COMPLETED, EVENT_TASK_FAILED, EVENT_TASK_QUEUED, EVENT_TASK_SUSPENDED, EventSink,
};
use crate::executor::{RunStart, Suspension, TaskContext, TaskError, TaskExecutor, flatten, start_run};
use crate::interrupts::ToolInterruptManager;
use crate::scheduler::{Priority, QueueEntry};

/// Idle workers re-check the queue this often to fail expired entries.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// A submission waiting in the scheduler.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: String,
    pub params: serde_json::Value,
    pub tenant: String,
    pub priority: Priority,
    /// Subject that submitted it; only they (or an admin) may cancel it.
    pub submitted_by: String,
    /// Connection that submitted it; cancelled when that connection closes
    /// and told the resume token if the run suspends.
    pub origin: Option<String>,
}

/// Why a cancellation did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRefused {
    NotQueued,
    NotOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub depth: usize,
}

pub struct TaskQueue {
    admission: Arc<AdmissionState>,
    executor: Arc<dyn TaskExecutor>,
    interrupts: Arc<ToolInterruptManager>,
    events: Arc<dyn EventSink>,
    pending: Mutex<HashMap<String, QueuedTask>>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(
        admission: Arc<AdmissionState>,
        executor: Arc<dyn TaskExecutor>,
        interrupts: Arc<ToolInterruptManager>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            admission,
            executor,
            interrupts,
            events,
            pending: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, QueuedTask>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue under `id`. Fails fast when the scheduler is full.
    pub fn submit(&self, id: &str, task: QueuedTask) -> Result<Submitted, AdmissionError> {
        let now = self.admission.clock().now_ms();
        let entry = QueueEntry {
            id: id.to_string(),
            tenant_id: task.tenant.clone(),
            priority: task.priority,
            enqueued_at_ms: now,
            deadline_ms: self.admission.queue_deadline(now),
        };

        let depth = {
            // Scheduler first: a rejected entry must not leave a payload behind.
            let mut scheduler = self.admission.scheduler();
            let depth = scheduler.enqueue(entry)?;
            self.pending().insert(id.to_string(), task.clone());
            depth
        };

        info!(id, tenant = %task.tenant, priority = %task.priority, depth, "Task queued");
        self.events.emit(
            EVENT_TASK_QUEUED,
            json!({
                "id": id,
                "task": task.task,
                "tenant": task.tenant,
                "priority": task.priority,
                "depth": depth,
            }),
        );
        self.notify.notify_one();
        Ok(Submitted { depth })
    }

    /// Remove a queued entry before a worker picks it up.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.admission.scheduler().remove(id).is_some();
        if removed {
            self.pending().remove(id);
            debug!(id, "Queued task cancelled");
        }
        removed
    }

    /// Cancel on behalf of `subject`, who must have submitted the entry
    /// unless `admin` is set.
    pub fn cancel_as(&self, id: &str, subject: &str, admin: bool) -> Result<(), CancelRefused> {
        let owner = self
            .pending()
            .get(id)
            .map(|t| t.submitted_by.clone())
            .ok_or(CancelRefused::NotQueued)?;
        if !admin && owner != subject {
            warn!(id, subject, "Refused to cancel another submitter's task");
            return Err(CancelRefused::NotOwner);
        }
        if self.cancel(id) {
            Ok(())
        } else {
            Err(CancelRefused::NotQueued)
        }
    }

    /// Cancel everything a closing connection left in the queue.
    pub fn cancel_for_connection(&self, conn_id: &str) -> usize {
        let ids: Vec<String> = self
            .pending()
            .iter()
            .filter(|(_, t)| t.origin.as_deref() == Some(conn_id))
            .map(|(id, _)| id.clone())
            .collect();
        let cancelled = ids.iter().filter(|id| self.cancel(id)).count();
        if cancelled > 0 {
            info!(conn_id, cancelled, "Cancelled queued tasks for closed connection");
        }
        cancelled
    }

    pub fn spawn_workers(self: &Arc<Self>, count: usize, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let queue = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { queue.worker_loop(worker, cancel).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        debug!(worker, "Task worker started");
        loop {
            self.fail_expired();
            let next = self.admission.scheduler().dequeue();
            match next {
                Some(entry) => {
                    let task = self.pending().remove(&entry.id);
                    if let Some(task) = task {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.run(entry, task) => {}
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
            }
        }
        debug!(worker, "Task worker stopped");
    }

    /// Fail queued entries whose deadline has passed.
    pub fn fail_expired(&self) -> usize {
        let now = self.admission.clock().now_ms();
        let expired = self.admission.scheduler().drain_expired(now);
        for entry in &expired {
            self.pending().remove(&entry.id);
            warn!(id = %entry.id, tenant = %entry.tenant_id, "Queued task timed out");
            let waited_ms = now.saturating_sub(entry.enqueued_at_ms);
            let err = AdmissionError::QueueTimeout {
                governor: "scheduler".into(),
                waited_ms,
            };
            self.publish_failure(&entry.id, &entry.tenant_id, err.to_error_shape());
        }
        expired.len()
    }

    async fn run(&self, entry: QueueEntry, task: QueuedTask) {
        let permit = match self.admission.acquire(&task.tenant).await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(id = %entry.id, tenant = %task.tenant, code = e.code(), "Queued task not admitted");
                self.publish_failure(&entry.id, &task.tenant, e.to_error_shape());
                return;
            }
        };

        let ctx = TaskContext::new(
            entry.id.clone(),
            entry.id.clone(),
            task.tenant.clone(),
            self.interrupts.clone(),
        );
        let start = start_run(
            self.executor.clone(),
            ctx,
            task.task.clone(),
            task.params,
            permit,
        )
        .await;

        match start {
            RunStart::Finished(result) => self.publish_result(&entry.id, &task.tenant, result),
            RunStart::Suspended {
                suspension,
                completion,
            } => {
                // The run continues on its own task; free this worker.
                debug!(id = %entry.id, "Queued task suspended");
                let events = self.events.clone();
                let interrupts = self.interrupts.clone();
                let id = entry.id.clone();
                let tenant = task.tenant.clone();
                let origin = task.origin.clone();
                tokio::spawn(async move {
                    let detached = DetachedRun {
                        id: &id,
                        tenant: &tenant,
                        origin: origin.as_deref(),
                    };
                    let result = detached
                        .follow(events.as_ref(), &interrupts, suspension, completion)
                        .await;
                    publish(events.as_ref(), &id, &tenant, result);
                });
            }
        }
    }

    fn publish_result(&self, id: &str, tenant: &str, result: Result<serde_json::Value, TaskError>) {
        publish(self.events.as_ref(), id, tenant, result);
    }

    fn publish_failure(&self, id: &str, tenant: &str, error: gatehouse_core::protocol::ErrorShape) {
        self.events.emit(
            EVENT_TASK_FAILED,
            json!({ "id": id, "tenant": tenant, "error": error }),
        );
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A suspended run whose starter is not waiting on a response.
pub struct DetachedRun<'a> {
    pub id: &'a str,
    pub tenant: &'a str,
    /// Connection to hand the resume token to.
    pub origin: Option<&'a str>,
}

impl DetachedRun<'_> {
    /// Pass the resume token on, then wait for the run to finish.
    ///
    /// If the token cannot be delivered the interrupt is expired right away,
    /// so the run ends instead of holding its permit until the deadline.
    pub async fn follow(
        &self,
        events: &dyn EventSink,
        interrupts: &ToolInterruptManager,
        suspension: Suspension,
        completion: JoinHandle<Result<serde_json::Value, TaskError>>,
    ) -> Result<serde_json::Value, TaskError> {
        let approval_request_id = suspension.approval_request_id.clone();
        let delivered = self.origin.is_some_and(|conn_id| {
            events.send_to(
                conn_id,
                EVENT_TASK_SUSPENDED,
                json!({
                    "id": self.id,
                    "tenant": self.tenant,
                    "approval_request_id": suspension.approval_request_id,
                    "binding": suspension.binding,
                    "resume_token": suspension.resume_token,
                    "expires_at_ms": suspension.expires_at_ms,
                }),
            )
        });

        if delivered {
            debug!(id = self.id, approval_request_id = %approval_request_id, "Resume token sent to submitter");
        } else {
            warn!(
                id = self.id,
                approval_request_id = %approval_request_id,
                "No connection to receive the resume token; expiring interrupt"
            );
            if let Err(e) = interrupts.expire_now(&approval_request_id).await {
                warn!(id = self.id, error = %e, "Failed to expire undeliverable interrupt");
            }
        }
        flatten(completion.await)
    }
}

/// Publish `task.completed` or `task.failed` for a finished run.
pub fn publish(events: &dyn EventSink, id: &str, tenant: &str, result: Result<serde_json::Value, TaskError>) {
    match result {
        Ok(value) => {
            info!(id, tenant, "Task completed");
            events.emit(
                EVENT_TASK_COMPLETED,
                json!({ "id": id, "tenant": tenant, "result": value }),
            );
        }
        Err(e) => {
            warn!(id, tenant, code = e.code(), "Task failed");
            events.emit(
                EVENT_TASK_FAILED,
                json!({ "id": id, "tenant": tenant, "error": e.to_error_shape() }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::BuiltinExecutor;
    use gatehouse_core::clock::{ManualClock, SharedClock};
    use gatehouse_core::config::{AdmissionConfig, InterruptsConfig};
    use gatehouse_core::file_store::LockOptions;
    use gatehouse_core::protocol::InterruptBinding;
    use tokio::sync::mpsc;

    /// Records broadcasts, plus targeted events for the connections it knows.
    struct ChannelSink {
        tx: mpsc::UnboundedSender<(String, serde_json::Value)>,
        connected: Vec<String>,
    }

    impl EventSink for ChannelSink {
        fn emit(&self, event: &str, payload: serde_json::Value) {
            let _ = self.tx.send((event.to_string(), payload));
        }

        fn send_to(&self, conn_id: &str, event: &str, payload: serde_json::Value) -> bool {
            if !self.connected.iter().any(|c| c == conn_id) {
                return false;
            }
            self.tx.send((event.to_string(), payload)).is_ok()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        queue: Arc<TaskQueue>,
        rx: mpsc::UnboundedReceiver<(String, serde_json::Value)>,
    }

    fn fixture(max_queued: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let shared: SharedClock = clock.clone();
        let mut config = AdmissionConfig::default();
        config.scheduler.max_queued = max_queued;
        config.scheduler.queue_timeout_ms = 5_000;

        let (tx, rx) = mpsc::unbounded_channel();
        let events: Arc<dyn EventSink> = Arc::new(ChannelSink {
            tx,
            connected: vec!["conn-1".into()],
        });
        let interrupts = ToolInterruptManager::new(
            dir.path().join("interrupts.json"),
            InterruptsConfig::default(),
            LockOptions::default(),
            shared.clone(),
            events.clone(),
        );
        let admission = Arc::new(AdmissionState::new(&config, shared));
        let queue = TaskQueue::new(admission, Arc::new(BuiltinExecutor), interrupts, events);
        Fixture {
            _dir: dir,
            clock,
            queue,
            rx,
        }
    }

    fn echo(tenant: &str, origin: Option<&str>) -> QueuedTask {
        QueuedTask {
            task: "echo".into(),
            params: json!({"tenant": tenant}),
            tenant: tenant.into(),
            priority: Priority::Normal,
            submitted_by: tenant.into(),
            origin: origin.map(String::from),
        }
    }

    fn approval(tenant: &str, origin: Option<&str>) -> QueuedTask {
        QueuedTask {
            task: "approval".into(),
            params: json!({"tool_call_id": "call-1"}),
            ..echo(tenant, origin)
        }
    }

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<(String, serde_json::Value)>,
        wanted: &str,
    ) -> serde_json::Value {
        while let Some((event, payload)) = rx.recv().await {
            if event == wanted {
                return payload;
            }
        }
        panic!("event stream closed before {wanted}");
    }

    #[tokio::test]
    async fn test_submit_publishes_queued_and_respects_capacity() {
        let mut f = fixture(1);
        let submitted = f.queue.submit("t1", echo("a", None)).unwrap();
        assert_eq!(submitted.depth, 1);
        let (event, payload) = f.rx.recv().await.unwrap();
        assert_eq!(event, EVENT_TASK_QUEUED);
        assert_eq!(payload["priority"], "normal");

        let err = f.queue.submit("t2", echo("a", None)).unwrap_err();
        assert_eq!(err.code(), "queue_full");
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_for_connection() {
        let f = fixture(10);
        f.queue.submit("t1", echo("a", Some("conn-1"))).unwrap();
        f.queue.submit("t2", echo("b", Some("conn-2"))).unwrap();
        f.queue.submit("t3", echo("a", Some("conn-1"))).unwrap();

        assert_eq!(f.queue.cancel_for_connection("conn-1"), 2);
        assert_eq!(f.queue.len(), 1);
        assert!(!f.queue.cancel("t1"));
        assert!(f.queue.cancel("t2"));
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_only_submitter_or_admin_may_cancel() {
        let f = fixture(10);
        f.queue.submit("t1", echo("alice", None)).unwrap();
        f.queue.submit("t2", echo("alice", None)).unwrap();

        assert_eq!(f.queue.cancel_as("t1", "mallory", false), Err(CancelRefused::NotOwner));
        assert_eq!(f.queue.len(), 2);
        assert_eq!(f.queue.cancel_as("t1", "alice", false), Ok(()));
        assert_eq!(f.queue.cancel_as("t2", "ops", true), Ok(()));
        assert_eq!(f.queue.cancel_as("t2", "alice", false), Err(CancelRefused::NotQueued));
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_fail_with_queue_timeout() {
        let mut f = fixture(10);
        f.queue.submit("t1", echo("a", None)).unwrap();
        let _ = f.rx.recv().await;

        f.clock.advance(5_000);
        assert_eq!(f.queue.fail_expired(), 1);
        let (event, payload) = f.rx.recv().await.unwrap();
        assert_eq!(event, EVENT_TASK_FAILED);
        assert_eq!(payload["error"]["code"], "queue_timeout");
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_workers_run_queued_tasks() {
        let mut f = fixture(10);
        let cancel = CancellationToken::new();
        let workers = f.queue.spawn_workers(2, cancel.clone());

        f.queue.submit("t1", echo("a", None)).unwrap();
        let payload = next_event(&mut f.rx, EVENT_TASK_COMPLETED).await;
        assert_eq!(payload["id"], "t1");
        assert_eq!(payload["result"]["tenant"], "a");

        cancel.cancel();
        for w in workers {
            w.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_suspended_task_hands_resume_token_to_submitter() {
        let mut f = fixture(10);
        let cancel = CancellationToken::new();
        let _workers = f.queue.spawn_workers(1, cancel.clone());

        f.queue.submit("t1", approval("a", Some("conn-1"))).unwrap();
        let suspended = next_event(&mut f.rx, EVENT_TASK_SUSPENDED).await;
        assert_eq!(suspended["id"], "t1");
        let binding: InterruptBinding = serde_json::from_value(suspended["binding"].clone()).unwrap();
        assert_eq!(binding.run_id, "t1");
        assert_eq!(binding.tool_call_id, "call-1");

        f.queue
            .interrupts
            .resume(
                suspended["approval_request_id"].as_str().unwrap(),
                &binding,
                suspended["resume_token"].as_str().unwrap(),
                Some(json!({"approved": true})),
                "alice",
            )
            .await
            .unwrap();

        let completed = next_event(&mut f.rx, EVENT_TASK_COMPLETED).await;
        assert_eq!(completed["id"], "t1");
        assert_eq!(completed["result"]["resolved_by"], "alice");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_suspension_nobody_can_resume_fails_and_frees_permit() {
        let mut f = fixture(10);
        let cancel = CancellationToken::new();
        let _workers = f.queue.spawn_workers(1, cancel.clone());

        // No origin (a webhook), and an origin that has since disconnected.
        f.queue.submit("t1", approval("webhook:ci", None)).unwrap();
        let failed = next_event(&mut f.rx, EVENT_TASK_FAILED).await;
        assert_eq!(failed["id"], "t1");
        assert_eq!(failed["error"]["code"], "expired");

        f.queue.submit("t2", approval("b", Some("conn-gone"))).unwrap();
        let failed = next_event(&mut f.rx, EVENT_TASK_FAILED).await;
        assert_eq!(failed["id"], "t2");
        assert_eq!(failed["error"]["code"], "expired");

        let admission = f.queue.admission.snapshot();
        assert!(admission.governors.iter().all(|g| g.active == 0));
        assert!(f.queue.interrupts.list_pending().is_empty());
        cancel.cancel();
    }
}

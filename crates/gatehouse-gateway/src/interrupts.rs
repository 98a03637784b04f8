//! Durable suspend/resume for tasks awaiting an external decision.
//!
//! Each interrupt moves `pending -> resumed | expired` exactly once. The
//! transition is decided inside a locked read-modify-write of the store
//! file, so concurrent resumers (in this process or another) cannot both
//! win. Only the SHA-256 of the resume token is persisted.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use gatehouse_core::clock::SharedClock;
use gatehouse_core::config::InterruptsConfig;
use gatehouse_core::error::GatehouseError;
use gatehouse_core::file_store::{JsonFileStore, LockOptions};
use gatehouse_core::protocol::{
    ErrorShape, InterruptBinding, InterruptStatus, InterruptSummary, error_codes,
};
use gatehouse_core::secret::{random_token, sha256_hex, verify_hash};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{
    EVENT_INTERRUPT_EXPIRED, EVENT_INTERRUPT_REQUESTED, EVENT_INTERRUPT_RESUMED, EventSink,
};

const RESUME_TOKEN_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum InterruptError {
    #[error("interrupt '{0}' not found")]
    NotFound(String),

    #[error("resume binding does not match the suspended call")]
    BindingMismatch,

    #[error("interrupt has expired")]
    Expired,

    #[error("interrupt was already resolved")]
    AlreadyResolved,

    #[error("resume token does not match")]
    TokenMismatch,

    #[error("interrupt '{0}' is already pending")]
    Duplicate(String),

    #[error("interrupt store failed: {0}")]
    Store(#[from] GatehouseError),
}

impl InterruptError {
    pub fn code(&self) -> &'static str {
        match self {
            InterruptError::NotFound(_) => error_codes::NOT_FOUND,
            InterruptError::BindingMismatch => error_codes::BINDING_MISMATCH,
            InterruptError::Expired => error_codes::EXPIRED,
            InterruptError::AlreadyResolved => error_codes::ALREADY_RESOLVED,
            InterruptError::TokenMismatch => error_codes::TOKEN_MISMATCH,
            InterruptError::Duplicate(_) => error_codes::DUPLICATE_INTERRUPT,
            InterruptError::Store(_) => error_codes::STORE_ERROR,
        }
    }

    pub fn to_error_shape(&self) -> ErrorShape {
        match self {
            // Store internals stay server-side.
            InterruptError::Store(_) => ErrorShape::new(self.code(), "interrupt store unavailable"),
            _ => ErrorShape::new(self.code(), self.to_string()),
        }
    }
}

/// Persisted interrupt. Holds the token hash, never the token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptRecord {
    pub approval_request_id: String,
    pub binding: InterruptBinding,
    pub resume_token_hash: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub status: InterruptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl InterruptRecord {
    pub fn summary(&self) -> InterruptSummary {
        InterruptSummary {
            approval_request_id: self.approval_request_id.clone(),
            binding: self.binding.clone(),
            status: self.status,
            created_at_ms: self.created_at_ms,
            expires_at_ms: self.expires_at_ms,
            interrupt: self.interrupt.clone(),
            resolved_by: self.resolved_by.clone(),
            resolved_at_ms: self.resolved_at_ms,
        }
    }

    fn resolution(&self) -> Resolution {
        Resolution {
            approval_request_id: self.approval_request_id.clone(),
            status: self.status,
            resolved_by: self.resolved_by.clone(),
            result: self.result.clone(),
        }
    }

    fn expire(&mut self, now_ms: u64) {
        self.status = InterruptStatus::Expired;
        self.resolved_at_ms = Some(now_ms);
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InterruptFile {
    #[serde(default)]
    interrupts: BTreeMap<String, InterruptRecord>,
}

/// Terminal state delivered to whoever is waiting on an interrupt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub approval_request_id: String,
    pub status: InterruptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Resolves once when the interrupt reaches a terminal state.
#[derive(Debug)]
pub struct InterruptWait {
    rx: oneshot::Receiver<Resolution>,
}

impl InterruptWait {
    /// `None` if the manager went away first.
    pub async fn resolved(self) -> Option<Resolution> {
        self.rx.await.ok()
    }
}

#[derive(Debug)]
pub struct EmitOutcome {
    /// The only copy of the plaintext token.
    pub resume_token: String,
    pub expires_at_ms: u64,
    pub wait: InterruptWait,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub removed: usize,
}

enum Transition {
    Resumed(InterruptRecord),
    Expired(InterruptRecord),
}

#[derive(Default)]
struct Live {
    records: HashMap<String, InterruptRecord>,
    waiters: HashMap<String, oneshot::Sender<Resolution>>,
    timers: HashMap<String, AbortHandle>,
}

pub struct ToolInterruptManager {
    store: JsonFileStore,
    clock: SharedClock,
    events: Arc<dyn EventSink>,
    config: InterruptsConfig,
    live: Mutex<Live>,
}

impl ToolInterruptManager {
    pub fn new(
        path: impl Into<PathBuf>,
        config: InterruptsConfig,
        lock: LockOptions,
        clock: SharedClock,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: JsonFileStore::new(path, lock, clock.clone()),
            clock,
            events,
            config,
            live: Mutex::new(Live::default()),
        })
    }

    fn live(&self) -> MutexGuard<'_, Live> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload after a restart: expire overdue records and re-arm timers for the rest.
    ///
    /// Futures from before the restart are gone; callers re-discover pending
    /// interrupts through the snapshot.
    pub async fn load(self: &Arc<Self>) -> Result<SweepReport, InterruptError> {
        let report = self.sweep().await?;
        let file: InterruptFile = self.store.read().await?;
        let mut pending = Vec::new();
        {
            let mut live = self.live();
            for (id, record) in file.interrupts {
                if record.status == InterruptStatus::Pending {
                    pending.push((id.clone(), record.expires_at_ms));
                }
                live.records.insert(id, record);
            }
        }
        for (id, expires_at_ms) in &pending {
            self.arm_timer(id, *expires_at_ms);
        }
        info!(pending = pending.len(), expired = report.expired, "Loaded interrupts");
        Ok(report)
    }

    /// Suspend: persist a pending interrupt and hand back its one-time resume token.
    pub async fn emit(
        self: &Arc<Self>,
        approval_request_id: &str,
        binding: InterruptBinding,
        interrupt: Option<serde_json::Value>,
        timeout_ms: Option<u64>,
    ) -> Result<EmitOutcome, InterruptError> {
        let now = self.clock.now_ms();
        let timeout_ms = timeout_ms
            .unwrap_or(self.config.default_timeout_ms)
            .min(self.config.max_timeout_ms);
        let resume_token = random_token(RESUME_TOKEN_BYTES);
        let record = InterruptRecord {
            approval_request_id: approval_request_id.to_string(),
            binding,
            resume_token_hash: sha256_hex(&resume_token),
            created_at_ms: now,
            expires_at_ms: now.saturating_add(timeout_ms),
            status: InterruptStatus::Pending,
            interrupt,
            resolved_by: None,
            resolved_at_ms: None,
            result: None,
        };

        // The waiter goes in before the record is durable, so a sweep that
        // expires the record right away still has someone to tell.
        let (tx, rx) = oneshot::channel();
        {
            let mut live = self.live();
            if live.waiters.contains_key(approval_request_id) {
                return Err(InterruptError::Duplicate(approval_request_id.to_string()));
            }
            live.waiters.insert(approval_request_id.to_string(), tx);
        }

        let stored = record.clone();
        let persisted = self
            .store
            .update(move |file: &mut InterruptFile| {
                let open = file
                    .interrupts
                    .get(&stored.approval_request_id)
                    .is_some_and(|r| r.status == InterruptStatus::Pending);
                if open {
                    return Ok(Err(InterruptError::Duplicate(
                        stored.approval_request_id.clone(),
                    )));
                }
                file.interrupts
                    .insert(stored.approval_request_id.clone(), stored);
                Ok(Ok(()))
            })
            .await
            .map_err(InterruptError::from)
            .and_then(|inner| inner);
        if let Err(e) = persisted {
            self.live().waiters.remove(approval_request_id);
            return Err(e);
        }

        let still_pending = {
            let mut live = self.live();
            let waiting = live.waiters.contains_key(approval_request_id);
            if waiting {
                live.records
                    .insert(approval_request_id.to_string(), record.clone());
            }
            waiting
        };
        if !still_pending {
            // Settled by a sweep before we got here; the waiter already has the outcome.
            debug!(approval_request_id, "Interrupt resolved while being requested");
            return Ok(EmitOutcome {
                resume_token,
                expires_at_ms: record.expires_at_ms,
                wait: InterruptWait { rx },
            });
        }
        self.arm_timer(approval_request_id, record.expires_at_ms);

        info!(
            approval_request_id,
            run_id = %record.binding.run_id,
            expires_at_ms = record.expires_at_ms,
            "Interrupt requested"
        );
        #[cfg(feature = "metrics")]
        crate::metrics::record_interrupt(EVENT_INTERRUPT_REQUESTED);
        self.events.emit(
            EVENT_INTERRUPT_REQUESTED,
            json!({
                "approval_request_id": approval_request_id,
                "binding": record.binding,
                "interrupt": record.interrupt,
                "expires_at_ms": record.expires_at_ms,
            }),
        );

        Ok(EmitOutcome {
            resume_token,
            expires_at_ms: record.expires_at_ms,
            wait: InterruptWait { rx },
        })
    }

    /// Resolve a pending interrupt.
    ///
    /// Checks run in a fixed order: binding, then expiry, then token.
    pub async fn resume(
        &self,
        approval_request_id: &str,
        binding: &InterruptBinding,
        resume_token: &str,
        result: Option<serde_json::Value>,
        resolved_by: &str,
    ) -> Result<Resolution, InterruptError> {
        let now = self.clock.now_ms();
        let id = approval_request_id.to_string();
        let binding = binding.clone();
        let token = resume_token.to_string();
        let resolver = resolved_by.to_string();

        let transition = self
            .store
            .update(move |file: &mut InterruptFile| {
                let Some(record) = file.interrupts.get_mut(&id) else {
                    return Ok(Err(InterruptError::NotFound(id)));
                };
                if record.binding != binding {
                    return Ok(Err(InterruptError::BindingMismatch));
                }
                match record.status {
                    InterruptStatus::Expired => return Ok(Err(InterruptError::Expired)),
                    InterruptStatus::Resumed => return Ok(Err(InterruptError::AlreadyResolved)),
                    InterruptStatus::Pending => {}
                }
                if now >= record.expires_at_ms {
                    record.expire(now);
                    return Ok(Ok(Transition::Expired(record.clone())));
                }
                if !verify_hash(&token, &record.resume_token_hash) {
                    return Ok(Err(InterruptError::TokenMismatch));
                }
                record.status = InterruptStatus::Resumed;
                record.resolved_by = Some(resolver);
                record.resolved_at_ms = Some(now);
                record.result = result;
                Ok(Ok(Transition::Resumed(record.clone())))
            })
            .await?;

        match transition {
            Ok(Transition::Resumed(record)) => {
                info!(approval_request_id, resolved_by, "Interrupt resumed");
                Ok(self.settle(record, EVENT_INTERRUPT_RESUMED))
            }
            Ok(Transition::Expired(record)) => {
                info!(approval_request_id, "Interrupt expired on resume attempt");
                self.settle(record, EVENT_INTERRUPT_EXPIRED);
                Err(InterruptError::Expired)
            }
            Err(e) => {
                warn!(approval_request_id, code = e.code(), "Interrupt resume rejected");
                Err(e)
            }
        }
    }

    /// Expire one interrupt if it is pending and overdue.
    pub async fn expire_if_due(&self, approval_request_id: &str) -> Result<bool, InterruptError> {
        self.expire_pending(approval_request_id, false).await
    }

    /// Expire a pending interrupt now, deadline or not. Used when nobody
    /// holds the resume token, so waiting out the deadline gains nothing.
    pub async fn expire_now(&self, approval_request_id: &str) -> Result<bool, InterruptError> {
        self.expire_pending(approval_request_id, true).await
    }

    async fn expire_pending(&self, approval_request_id: &str, force: bool) -> Result<bool, InterruptError> {
        let now = self.clock.now_ms();
        let id = approval_request_id.to_string();
        let expired = self
            .store
            .update(move |file: &mut InterruptFile| {
                Ok(file.interrupts.get_mut(&id).and_then(|record| {
                    (record.status == InterruptStatus::Pending
                        && (force || now >= record.expires_at_ms))
                        .then(|| {
                            record.expire(now);
                            record.clone()
                        })
                }))
            })
            .await?;

        match expired {
            Some(record) => {
                info!(approval_request_id, "Interrupt expired");
                self.settle(record, EVENT_INTERRUPT_EXPIRED);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Expire overdue interrupts and drop resolved ones past the retention window.
    pub async fn sweep(&self) -> Result<SweepReport, InterruptError> {
        let now = self.clock.now_ms();
        let retention = self.config.retention_ms;
        let (expired, removed) = self
            .store
            .update(move |file: &mut InterruptFile| {
                let mut expired = Vec::new();
                for record in file.interrupts.values_mut() {
                    if record.status == InterruptStatus::Pending && now >= record.expires_at_ms {
                        record.expire(now);
                        expired.push(record.clone());
                    }
                }
                let mut removed = Vec::new();
                file.interrupts.retain(|id, record| {
                    let stale = record.status.is_terminal()
                        && record
                            .resolved_at_ms
                            .is_some_and(|at| now.saturating_sub(at) >= retention);
                    if stale {
                        removed.push(id.clone());
                    }
                    !stale
                });
                Ok((expired, removed))
            })
            .await?;

        let report = SweepReport {
            expired: expired.len(),
            removed: removed.len(),
        };
        for record in expired {
            self.settle(record, EVENT_INTERRUPT_EXPIRED);
        }
        if !removed.is_empty() {
            let mut live = self.live();
            for id in &removed {
                live.records.remove(id);
            }
        }
        if report != SweepReport::default() {
            debug!(expired = report.expired, removed = report.removed, "Interrupt sweep");
        }
        Ok(report)
    }

    /// Apply a durable transition to memory, publish it, then wake the waiter.
    fn settle(&self, record: InterruptRecord, event: &str) -> Resolution {
        let resolution = record.resolution();
        let waiter = {
            let mut live = self.live();
            if let Some(timer) = live.timers.remove(&record.approval_request_id) {
                timer.abort();
            }
            live.records
                .insert(record.approval_request_id.clone(), record);
            live.waiters.remove(&resolution.approval_request_id)
        };
        #[cfg(feature = "metrics")]
        crate::metrics::record_interrupt(event);
        self.events.emit(
            event,
            serde_json::to_value(&resolution).unwrap_or(serde_json::Value::Null),
        );
        if let Some(tx) = waiter {
            let _ = tx.send(resolution.clone());
        }
        resolution
    }

    fn arm_timer(self: &Arc<Self>, approval_request_id: &str, expires_at_ms: u64) {
        let delay = expires_at_ms.saturating_sub(self.clock.now_ms());
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = approval_request_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if let Err(e) = manager.expire_if_due(&id).await {
                warn!(approval_request_id = %id, error = %e, "Failed to expire interrupt");
            }
        });
        let previous = self
            .live()
            .timers
            .insert(approval_request_id.to_string(), task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Authoritative read from the store.
    pub async fn get(&self, approval_request_id: &str) -> Result<Option<InterruptSummary>, InterruptError> {
        let file: InterruptFile = self.store.read().await?;
        Ok(file
            .interrupts
            .get(approval_request_id)
            .map(InterruptRecord::summary))
    }

    /// All records in the store, newest first.
    pub async fn list(&self) -> Result<Vec<InterruptSummary>, InterruptError> {
        let file: InterruptFile = self.store.read().await?;
        let mut all: Vec<_> = file.interrupts.values().map(InterruptRecord::summary).collect();
        all.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        Ok(all)
    }

    /// Pending interrupts known to this process, for snapshots.
    pub fn list_pending(&self) -> Vec<InterruptSummary> {
        let live = self.live();
        let mut pending: Vec<_> = live
            .records
            .values()
            .filter(|r| r.status == InterruptStatus::Pending)
            .map(InterruptRecord::summary)
            .collect();
        pending.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        pending
    }

    /// Periodically sweep until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "Interrupt sweep failed");
                        }
                    }
                }
            }
        })
    }
}

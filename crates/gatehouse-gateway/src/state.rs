//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gatehouse_core::clock::SharedClock;
use gatehouse_core::config::Config;
use gatehouse_core::file_store::LockOptions;
use gatehouse_core::protocol::{
    Features, Policy, PresenceEntry, ShutdownEvent, Snapshot, TickEvent,
};
use gatehouse_core::token_store::TokenStore;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admission::AdmissionState;
use crate::events::{EVENT_PRESENCE, EVENT_SHUTDOWN, EVENT_TICK, EVENTS, EventBus, EventSink};
use crate::executor::TaskExecutor;
use crate::hooks::HookRegistry;
use crate::interrupts::ToolInterruptManager;
use crate::methods::METHODS;
use crate::tasks::TaskQueue;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub clock: SharedClock,
    pub admission: Arc<AdmissionState>,
    pub interrupts: Arc<ToolInterruptManager>,
    pub tokens: Arc<TokenStore>,
    pub events: Arc<EventBus>,
    pub executor: Arc<dyn TaskExecutor>,
    pub tasks: Arc<TaskQueue>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    /// Fires when the gateway begins shutting down.
    pub shutdown: CancellationToken,
    started_at_ms: u64,
}

/// Per-connection state, registered once the handshake succeeds.
pub struct ConnectionState {
    pub conn_id: String,
    pub client_id: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub device_id: Option<String>,
    pub connected_at_ms: u64,
}

impl ConnectionState {
    fn presence(&self) -> PresenceEntry {
        PresenceEntry {
            conn_id: self.conn_id.clone(),
            client_id: self.client_id.clone(),
            role: self.role.clone(),
            device_id: self.device_id.clone(),
            connected_at_ms: self.connected_at_ms,
        }
    }
}

impl GatewayState {
    pub fn new(
        config: Config,
        executor: Arc<dyn TaskExecutor>,
        hooks: Arc<HookRegistry>,
        clock: SharedClock,
    ) -> Arc<Self> {
        let lock = LockOptions::from_config(&config.store());
        let policy = config.policy();
        let events = Arc::new(EventBus::new(policy.backlog_size, hooks));
        let sink: Arc<dyn EventSink> = events.clone();

        let admission = Arc::new(AdmissionState::new(&config.admission(), clock.clone()));
        let interrupts = ToolInterruptManager::new(
            config.interrupts_path(),
            config.interrupts(),
            lock,
            clock.clone(),
            sink.clone(),
        );
        let tokens = Arc::new(TokenStore::new(config.tokens_path(), lock, clock.clone()));
        let tasks = TaskQueue::new(
            admission.clone(),
            executor.clone(),
            interrupts.clone(),
            sink,
        );

        Arc::new(Self {
            started_at_ms: clock.now_ms(),
            config: Arc::new(config),
            clock,
            admission,
            interrupts,
            tokens,
            events,
            executor,
            tasks,
            connections: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn uptime_ms(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.started_at_ms)
    }

    pub fn policy(&self) -> Policy {
        let policy = self.config.policy();
        Policy {
            max_payload: policy.max_payload,
            max_buffered_bytes: policy.max_buffered_bytes,
            tick_interval_ms: policy.tick_interval_ms,
        }
    }

    pub fn features(&self) -> Features {
        Features {
            methods: METHODS.iter().map(|m| m.to_string()).collect(),
            events: EVENTS.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub async fn presence(&self) -> Vec<PresenceEntry> {
        let connections = self.connections.read().await;
        let mut presence: Vec<_> = connections.values().map(ConnectionState::presence).collect();
        presence.sort_by(|a, b| a.connected_at_ms.cmp(&b.connected_at_ms));
        presence
    }

    /// Current state, plus the event sequence it reflects.
    pub async fn snapshot(&self) -> Snapshot {
        let seq = self.events.last_seq();
        Snapshot {
            state_version: self.events.state_version(),
            seq,
            auth_mode: self.config.auth_mode(),
            uptime_ms: self.uptime_ms(),
            presence: self.presence().await,
            pending_interrupts: self.interrupts.list_pending(),
            admission: self.admission.snapshot(),
        }
    }

    pub async fn broadcast_presence(&self) {
        let presence = self.presence().await;
        self.events.broadcast(
            EVENT_PRESENCE,
            Some(serde_json::json!({ "presence": presence })),
        );
    }

    /// Reload durable state and start the periodic tasks: queue workers,
    /// limiter and interrupt sweepers, and the tick.
    pub async fn start_background(self: &Arc<Self>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let report = self.interrupts.load().await?;
        if report.expired > 0 {
            info!(expired = report.expired, "Expired overdue interrupts on startup");
        }

        let admission = self.config.admission();
        let mut handles = self
            .tasks
            .spawn_workers(admission.scheduler.workers, self.shutdown.clone());
        handles.push(self.admission.limiters.clone().spawn_sweeper(
            Duration::from_millis(admission.rate_limits.idle_sweep_ms.max(1)),
            self.shutdown.clone(),
        ));
        handles.push(self.interrupts.clone().spawn_sweeper(self.shutdown.clone()));
        handles.push(self.spawn_tick());
        Ok(handles)
    }

    fn spawn_tick(self: &Arc<Self>) -> JoinHandle<()> {
        let state = self.clone();
        let interval = Duration::from_millis(self.config.policy().tick_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let tick = TickEvent { ts: state.clock.now_ms() };
                        state.events.broadcast(EVENT_TICK, serde_json::to_value(tick).ok());
                    }
                }
            }
        })
    }

    /// Tell clients we are going away, then stop background work.
    pub fn begin_shutdown(&self, reason: &str, restart_expected_ms: Option<u64>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let event = ShutdownEvent {
            reason: reason.to_string(),
            restart_expected_ms,
        };
        match serde_json::to_value(event) {
            Ok(payload) => {
                self.events.broadcast(EVENT_SHUTDOWN, Some(payload));
            }
            Err(e) => warn!(%e, "Failed to serialize shutdown event"),
        }
        info!(reason, "Gateway shutting down");
        self.shutdown.cancel();
    }
}

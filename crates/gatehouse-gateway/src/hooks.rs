//! Hook system: async observers for broadcast events.
//!
//! Hooks run detached from the code that emitted the event. A failing or
//! slow handler never delays admission or interrupt handling.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Context passed to every hook handler invocation.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub event: String,
    pub seq: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Async hook handler function type.
pub type HookHandler = Box<
    dyn Fn(HookContext, serde_json::Value) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Registry of hook handlers, keyed by event name. `"*"` matches every event.
pub struct HookRegistry {
    handlers: RwLock<HashMap<String, Vec<HookHandler>>>,
    registered: AtomicUsize,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            registered: AtomicUsize::new(0),
        }
    }

    /// Register a handler for an event name.
    pub async fn register(&self, event: &str, handler: HookHandler) {
        let mut handlers = self.handlers.write().await;
        handlers.entry(event.to_string()).or_default().push(handler);
        self.registered.fetch_add(1, Ordering::SeqCst);
    }

    /// Run every matching handler in registration order. Errors are logged.
    pub async fn fire(&self, ctx: HookContext, data: serde_json::Value) {
        let handlers = self.handlers.read().await;
        let chains = [handlers.get(&ctx.event), handlers.get("*")];
        for handler in chains.into_iter().flatten().flatten() {
            if let Err(e) = handler(ctx.clone(), data.clone()).await {
                tracing::warn!(event = %ctx.event, error = %e, "Hook handler error, continuing");
            }
        }
    }

    /// Fire on a background task and return immediately.
    pub fn fire_detached(self: &Arc<Self>, event: &str, seq: Option<u64>, data: serde_json::Value) {
        if self.registered.load(Ordering::SeqCst) == 0 {
            return;
        }
        let registry = self.clone();
        let ctx = HookContext {
            event: event.to_string(),
            seq,
            timestamp: Utc::now(),
        };
        tokio::spawn(async move {
            registry.fire(ctx, data).await;
        });
    }

    /// Return the number of handlers registered for a given event.
    pub async fn count(&self, event: &str) -> usize {
        let handlers = self.handlers.read().await;
        handlers.get(event).map_or(0, |v| v.len())
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Token-bucket rate limiting, one limiter per traffic class.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gatehouse_core::clock::SharedClock;
use gatehouse_core::config::{BucketConfig, RateLimitsConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Traffic classes get independent limiters so one noisy class cannot starve another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    Http,
    Agent,
    Webhook,
    Static,
    Tool,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 5] = [
        TrafficClass::Http,
        TrafficClass::Agent,
        TrafficClass::Webhook,
        TrafficClass::Static,
        TrafficClass::Tool,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrafficClass::Http => "http",
            TrafficClass::Agent => "agent",
            TrafficClass::Webhook => "webhook",
            TrafficClass::Static => "static",
            TrafficClass::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed { remaining: f64 },
    Denied { retry_after_ms: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
}

impl Bucket {
    fn refill(&mut self, now_ms: u64, config: &BucketConfig) {
        // A clock that steps backwards adds nothing.
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed == 0 {
            return;
        }
        let added = config.refill_rate * elapsed as f64 / config.interval_ms as f64;
        self.tokens = (self.tokens + added).min(config.capacity);
        self.last_refill_ms = now_ms;
    }
}

/// Token bucket keyed by an arbitrary string (IP, caller identity, tenant).
pub struct RateLimiter {
    config: BucketConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(config: BucketConfig, clock: SharedClock) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Take one token for `key` if available.
    pub fn check(&self, key: &str) -> RateDecision {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.config.capacity,
            last_refill_ms: now,
        });
        bucket.refill(now, &self.config);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return RateDecision::Allowed {
                remaining: bucket.tokens,
            };
        }

        let missing = 1.0 - bucket.tokens;
        let ms = (missing * self.config.interval_ms as f64 / self.config.refill_rate).ceil();
        RateDecision::Denied {
            retry_after_ms: (ms as u64).max(1),
        }
    }

    /// Current balance for `key` without refilling or consuming.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets.get(key).map(|b| b.tokens)
    }

    pub fn key_count(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop buckets that have refilled to capacity; they are indistinguishable from new ones.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket.refill(now, &self.config);
            bucket.tokens < self.config.capacity
        });
        before - buckets.len()
    }
}

/// The per-class limiter set.
pub struct RateLimiters {
    http: RateLimiter,
    agent: RateLimiter,
    webhook: RateLimiter,
    static_assets: RateLimiter,
    tool: RateLimiter,
}

impl RateLimiters {
    pub fn from_config(config: &RateLimitsConfig, clock: SharedClock) -> Self {
        Self {
            http: RateLimiter::new(config.http, clock.clone()),
            agent: RateLimiter::new(config.agent, clock.clone()),
            webhook: RateLimiter::new(config.webhook, clock.clone()),
            static_assets: RateLimiter::new(config.static_assets, clock.clone()),
            tool: RateLimiter::new(config.tool, clock),
        }
    }

    pub fn for_class(&self, class: TrafficClass) -> &RateLimiter {
        match class {
            TrafficClass::Http => &self.http,
            TrafficClass::Agent => &self.agent,
            TrafficClass::Webhook => &self.webhook,
            TrafficClass::Static => &self.static_assets,
            TrafficClass::Tool => &self.tool,
        }
    }

    pub fn check(&self, class: TrafficClass, key: &str) -> RateDecision {
        let decision = self.for_class(class).check(key);
        if let RateDecision::Denied { retry_after_ms } = decision {
            warn!(class = class.as_str(), key, retry_after_ms, "Rate limited");
        }
        decision
    }

    pub fn key_counts(&self) -> BTreeMap<&'static str, usize> {
        TrafficClass::ALL
            .iter()
            .map(|c| (c.as_str(), self.for_class(*c).key_count()))
            .collect()
    }

    pub fn sweep_idle(&self) -> usize {
        TrafficClass::ALL
            .iter()
            .map(|c| self.for_class(*c).sweep_idle())
            .sum()
    }

    /// Periodically drop idle buckets until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let removed = self.sweep_idle();
                        debug!(removed, keys = ?self.key_counts(), "Rate limiter cleanup");
                    }
                }
            }
        })
    }
}

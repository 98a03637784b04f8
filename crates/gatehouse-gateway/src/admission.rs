//! The admission stack: rate limiters, the priority queue, and both governors.
//!
//! One `AdmissionState` is built at startup and shared by every connection
//! and HTTP handler.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gatehouse_core::clock::SharedClock;
use gatehouse_core::config::AdmissionConfig;
use gatehouse_core::protocol::{AdmissionSnapshot, ErrorShape, error_codes};
use serde_json::json;
use thiserror::Error;

use crate::governor::{Governor, GovernorError, Permit};
use crate::rate_limit::{RateDecision, RateLimiters, TrafficClass};
use crate::scheduler::{PriorityScheduler, SchedulerError};

/// Retry hint for denials that carry no better estimate.
const DEFAULT_RETRY_HINT_MS: u64 = 1_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("rate limit exceeded for {class} traffic")]
    RateLimited { class: &'static str, retry_after_ms: u64 },

    #[error("task queue is full ({max} entries)")]
    QueueFull { max: usize },

    #[error("timed out after {waited_ms}ms waiting for {governor} capacity")]
    QueueTimeout { governor: String, waited_ms: u64 },

    #[error("{governor} is saturated")]
    GovernorSaturated { governor: String },

    #[error("{0} is shutting down")]
    Unavailable(String),
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::RateLimited { .. } => error_codes::RATE_LIMITED,
            AdmissionError::QueueFull { .. } => error_codes::QUEUE_FULL,
            AdmissionError::QueueTimeout { .. } => error_codes::QUEUE_TIMEOUT,
            AdmissionError::GovernorSaturated { .. } => error_codes::GOVERNOR_SATURATED,
            AdmissionError::Unavailable(_) => error_codes::UNAVAILABLE,
        }
    }

    pub fn retry_after_ms(&self) -> u64 {
        match self {
            AdmissionError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => DEFAULT_RETRY_HINT_MS,
        }
    }

    /// Whole seconds for a `Retry-After` header, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms().div_ceil(1_000).max(1)
    }

    pub fn to_error_shape(&self) -> ErrorShape {
        ErrorShape::new(self.code(), self.to_string())
            .with_retry_after(self.retry_after_ms())
            .with_details(json!({ "type": "rate_limit_error" }))
    }

    /// Body for HTTP 429 responses.
    pub fn http_body(&self) -> serde_json::Value {
        json!({
            "error": {
                "type": "rate_limit_error",
                "message": self.to_string(),
                "retry_after_ms": self.retry_after_ms(),
            }
        })
    }
}

impl From<GovernorError> for AdmissionError {
    fn from(e: GovernorError) -> Self {
        match e {
            GovernorError::QueueTimeout {
                governor,
                waited_ms,
            } => AdmissionError::QueueTimeout {
                governor,
                waited_ms,
            },
            GovernorError::Saturated { governor, .. } => {
                AdmissionError::GovernorSaturated { governor }
            }
            GovernorError::Closed(governor) => AdmissionError::Unavailable(governor),
        }
    }
}

pub struct AdmissionState {
    pub limiters: Arc<RateLimiters>,
    /// Gates concurrent task execution.
    pub governor: Arc<Governor>,
    /// Gates concurrent subagent spawns.
    pub spawn_governor: Arc<Governor>,
    scheduler: Mutex<PriorityScheduler>,
    queue_timeout_ms: u64,
    clock: SharedClock,
}

impl AdmissionState {
    pub fn new(config: &AdmissionConfig, clock: SharedClock) -> Self {
        Self {
            limiters: Arc::new(RateLimiters::from_config(&config.rate_limits, clock.clone())),
            governor: Governor::new("governor", config.governor.clone(), clock.clone()),
            spawn_governor: Governor::new(
                "spawn_governor",
                config.spawn_governor.clone(),
                clock.clone(),
            ),
            scheduler: Mutex::new(PriorityScheduler::new(config.scheduler.max_queued)),
            queue_timeout_ms: config.scheduler.queue_timeout_ms,
            clock,
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Take a token from `class`'s limiter for `key`.
    pub fn check_rate(&self, class: TrafficClass, key: &str) -> Result<(), AdmissionError> {
        match self.limiters.check(class, key) {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Denied { retry_after_ms } => {
                #[cfg(feature = "metrics")]
                crate::metrics::record_denial(class.as_str());
                Err(AdmissionError::RateLimited {
                    class: class.as_str(),
                    retry_after_ms,
                })
            }
        }
    }

    pub async fn acquire(&self, holder: &str) -> Result<Permit, AdmissionError> {
        Self::acquire_from(&self.governor, holder).await
    }

    pub async fn acquire_spawn(&self, holder: &str) -> Result<Permit, AdmissionError> {
        Self::acquire_from(&self.spawn_governor, holder).await
    }

    async fn acquire_from(governor: &Arc<Governor>, holder: &str) -> Result<Permit, AdmissionError> {
        let outcome = governor.acquire(holder).await;
        #[cfg(feature = "metrics")]
        crate::metrics::record_governor_outcome(governor.name(), &outcome);
        Ok(outcome?)
    }

    pub fn scheduler(&self) -> MutexGuard<'_, PriorityScheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Absolute deadline for an entry queued now.
    pub fn queue_deadline(&self, now_ms: u64) -> u64 {
        now_ms.saturating_add(self.queue_timeout_ms)
    }

    pub fn queue_depth(&self) -> usize {
        self.scheduler().queue_depth()
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            governors: vec![self.governor.status(), self.spawn_governor.status()],
            queue_depth: self.queue_depth(),
        }
    }
}

impl From<SchedulerError> for AdmissionError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::QueueFull { max } => AdmissionError::QueueFull { max },
            other => AdmissionError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::clock::ManualClock;
    use gatehouse_core::config::BucketConfig;

    #[test]
    fn test_rate_limited_error_shape() {
        let err = AdmissionError::RateLimited {
            class: "agent",
            retry_after_ms: 1_500,
        };
        let shape = err.to_error_shape();
        assert_eq!(shape.code, "rate_limited");
        assert_eq!(shape.retry_after_ms, Some(1_500));
        assert_eq!(shape.details.unwrap()["type"], "rate_limit_error");
        assert_eq!(err.retry_after_secs(), 2);
    }

    #[test]
    fn test_http_body() {
        let err = AdmissionError::QueueFull { max: 3 };
        let body = err.http_body();
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["retry_after_ms"], 1_000);
        assert_eq!(err.retry_after_secs(), 1);
    }

    #[test]
    fn test_governor_errors_map_to_admission() {
        let err: AdmissionError = GovernorError::Saturated {
            governor: "spawn_governor".into(),
            max_waiters: 4,
        }
        .into();
        assert_eq!(err.code(), "governor_saturated");
    }

    #[test]
    fn test_check_rate_denies_after_capacity() {
        let mut config = AdmissionConfig::default();
        config.rate_limits.tool = BucketConfig {
            capacity: 1.0,
            refill_rate: 1.0,
            interval_ms: 2_000,
        };
        let admission = AdmissionState::new(&config, Arc::new(ManualClock::new(0)));

        assert!(admission.check_rate(TrafficClass::Tool, "caller").is_ok());
        let err = admission
            .check_rate(TrafficClass::Tool, "caller")
            .unwrap_err();
        assert_eq!(err.retry_after_ms(), 2_000);
    }

    #[tokio::test]
    async fn test_snapshot_lists_both_governors() {
        let admission =
            AdmissionState::new(&AdmissionConfig::default(), Arc::new(ManualClock::new(0)));
        let _permit = admission.acquire("tenant-a").await.unwrap();

        let snapshot = admission.snapshot();
        assert_eq!(snapshot.governors.len(), 2);
        assert_eq!(snapshot.governors[0].active, 1);
        assert_eq!(snapshot.governors[1].name, "spawn_governor");
        assert_eq!(snapshot.queue_depth, 0);
    }
}

//! Concurrency gate with per-holder fair share.
//!
//! A holder may hold at most `max(1, max_slots / contenders)` permits, where
//! contenders are the distinct holders that currently hold or wait for a
//! permit. Waiters are served FIFO among those the gate would admit; when a
//! slot frees and every waiter is over share, the oldest waiter gets it.
//! Expired permits and timed-out waiters are swept on every acquire and release.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gatehouse_core::clock::SharedClock;
use gatehouse_core::config::GovernorConfig;
use gatehouse_core::protocol::GovernorSnapshot;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GovernorError {
    #[error("timed out after {waited_ms}ms waiting for a {governor} permit")]
    QueueTimeout { governor: String, waited_ms: u64 },

    #[error("{governor} has {max_waiters} waiters already")]
    Saturated { governor: String, max_waiters: usize },

    #[error("{0} stopped before granting a permit")]
    Closed(String),
}

type Grant = Result<u64, GovernorError>;

#[derive(Debug)]
struct PermitRecord {
    holder: String,
    acquired_at_ms: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    holder: String,
    enqueued_at_ms: u64,
    deadline_ms: u64,
    tx: oneshot::Sender<Grant>,
}

#[derive(Debug, Default)]
struct GovernorState {
    next_id: u64,
    permits: HashMap<u64, PermitRecord>,
    active_by_holder: HashMap<String, usize>,
    waiters: VecDeque<Waiter>,
}

impl GovernorState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn active(&self, holder: &str) -> usize {
        self.active_by_holder.get(holder).copied().unwrap_or(0)
    }

    /// Distinct holders that hold or wait for a permit, plus `extra` if given.
    fn contenders(&self, extra: Option<&str>) -> usize {
        let mut holders: HashSet<&str> = self.active_by_holder.keys().map(String::as_str).collect();
        holders.extend(self.waiters.iter().map(|w| w.holder.as_str()));
        if let Some(h) = extra {
            holders.insert(h);
        }
        holders.len()
    }

    fn grant(&mut self, holder: &str, now_ms: u64) -> u64 {
        let id = self.next_id();
        self.permits.insert(
            id,
            PermitRecord {
                holder: holder.to_string(),
                acquired_at_ms: now_ms,
            },
        );
        *self.active_by_holder.entry(holder.to_string()).or_insert(0) += 1;
        id
    }

    fn remove_permit(&mut self, id: u64) -> Option<PermitRecord> {
        let record = self.permits.remove(&id)?;
        if let Some(count) = self.active_by_holder.get_mut(&record.holder) {
            *count -= 1;
            if *count == 0 {
                self.active_by_holder.remove(&record.holder);
            }
        }
        Some(record)
    }
}

enum Withdrawn {
    Removed,
    Granted(u64),
    Rejected(GovernorError),
}

pub struct Governor {
    name: String,
    config: GovernorConfig,
    clock: SharedClock,
    state: Mutex<GovernorState>,
}

impl Governor {
    pub fn new(name: impl Into<String>, config: GovernorConfig, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(GovernorState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fair_share(&self, contenders: usize) -> usize {
        (self.config.max_slots / contenders.max(1)).max(1)
    }

    fn can_grant(&self, state: &GovernorState, holder: &str) -> bool {
        state.permits.len() < self.config.max_slots
            && state.active(holder) < self.fair_share(state.contenders(Some(holder)))
    }

    /// Wait for a permit for `holder`. A disabled governor grants a no-op permit.
    ///
    /// Dropping the returned future withdraws the waiter; a permit granted
    /// in the meantime is released.
    pub async fn acquire(self: &Arc<Self>, holder: &str) -> Result<Permit, GovernorError> {
        if !self.config.enabled {
            return Ok(Permit::noop(holder));
        }

        let (waiter_id, rx) = {
            let mut state = self.lock();
            let now = self.clock.now_ms();
            self.sweep_locked(&mut state, now, false);

            if self.can_grant(&state, holder) {
                let id = state.grant(holder, now);
                debug!(governor = %self.name, holder, active = state.permits.len(), "Permit granted");
                return Ok(Permit::new(self.clone(), id, holder));
            }

            if state.waiters.len() >= self.config.max_waiters {
                warn!(governor = %self.name, holder, "Governor saturated");
                return Err(GovernorError::Saturated {
                    governor: self.name.clone(),
                    max_waiters: self.config.max_waiters,
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_id();
            state.waiters.push_back(Waiter {
                id,
                holder: holder.to_string(),
                enqueued_at_ms: now,
                deadline_ms: now.saturating_add(self.config.queue_timeout_ms),
                tx,
            });
            debug!(governor = %self.name, holder, waiting = state.waiters.len(), "Queued for permit");
            (id, rx)
        };

        let mut pending = PendingWait {
            governor: self.clone(),
            waiter_id,
            rx,
            settled: false,
        };
        let wait = Duration::from_millis(self.config.queue_timeout_ms);
        let outcome = tokio::time::timeout(wait, &mut pending.rx).await;
        pending.settled = true;

        match outcome {
            Ok(Ok(Ok(id))) => Ok(Permit::new(self.clone(), id, holder)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(GovernorError::Closed(self.name.clone())),
            Err(_) => match self.withdraw(waiter_id, &mut pending.rx) {
                Withdrawn::Granted(id) => Ok(Permit::new(self.clone(), id, holder)),
                Withdrawn::Rejected(e) => Err(e),
                Withdrawn::Removed => {
                    warn!(governor = %self.name, holder, "Permit wait timed out");
                    Err(GovernorError::QueueTimeout {
                        governor: self.name.clone(),
                        waited_ms: self.config.queue_timeout_ms,
                    })
                }
            },
        }
    }

    fn withdraw(&self, waiter_id: u64, rx: &mut oneshot::Receiver<Grant>) -> Withdrawn {
        let mut state = self.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
            state.waiters.remove(pos);
            // Our departure may lower the contender count and free a share.
            let now = self.clock.now_ms();
            self.sweep_locked(&mut state, now, false);
            return Withdrawn::Removed;
        }
        // Grants and rejections are sent under the lock, so the value is already there.
        match rx.try_recv() {
            Ok(Ok(id)) => Withdrawn::Granted(id),
            Ok(Err(e)) => Withdrawn::Rejected(e),
            Err(_) => Withdrawn::Rejected(GovernorError::Closed(self.name.clone())),
        }
    }

    fn release(&self, permit_id: u64) {
        let mut state = self.lock();
        match state.remove_permit(permit_id) {
            Some(record) => {
                debug!(governor = %self.name, holder = %record.holder, "Permit released");
            }
            None => debug!(governor = %self.name, permit_id, "Permit already reclaimed"),
        }
        let now = self.clock.now_ms();
        self.sweep_locked(&mut state, now, true);
    }

    /// Reclaim expired permits, reject overdue waiters, then hand out free slots.
    ///
    /// `released` marks a sweep that follows a freed slot.
    fn sweep_locked(&self, state: &mut GovernorState, now_ms: u64, released: bool) {
        let ttl = self.config.permit_ttl_ms;
        let expired: Vec<u64> = state
            .permits
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.acquired_at_ms) >= ttl)
            .map(|(id, _)| *id)
            .collect();
        let reclaimed = !expired.is_empty();
        for id in expired {
            if let Some(record) = state.remove_permit(id) {
                warn!(governor = %self.name, holder = %record.holder, "Reclaimed permit past TTL");
            }
        }

        let (overdue, live): (Vec<Waiter>, Vec<Waiter>) = state
            .waiters
            .drain(..)
            .partition(|w| w.deadline_ms <= now_ms);
        state.waiters = live.into();
        for waiter in overdue {
            warn!(governor = %self.name, holder = %waiter.holder, "Permit wait timed out");
            let _ = waiter.tx.send(Err(GovernorError::QueueTimeout {
                governor: self.name.clone(),
                waited_ms: now_ms.saturating_sub(waiter.enqueued_at_ms),
            }));
        }

        self.dispatch_locked(state, now_ms, released || reclaimed);
    }

    /// Hand free slots to the oldest under-share waiters. After a slot is
    /// freed, fall back to strict FIFO when every waiter is over share.
    fn dispatch_locked(&self, state: &mut GovernorState, now_ms: u64, fifo_fallback: bool) {
        while state.permits.len() < self.config.max_slots && !state.waiters.is_empty() {
            let pos = {
                let view: &GovernorState = state;
                view.waiters
                    .iter()
                    .position(|w| self.can_grant(view, &w.holder))
            };
            let Some(pos) = pos.or(fifo_fallback.then_some(0)) else {
                break;
            };
            let Some(waiter) = state.waiters.remove(pos) else {
                break;
            };
            let id = state.grant(&waiter.holder, now_ms);
            if let Err(Ok(id)) = waiter.tx.send(Ok(id)) {
                // Receiver already gone; hand the slot back.
                state.remove_permit(id);
                continue;
            }
            info!(governor = %self.name, holder = %waiter.holder, "Permit granted to waiter");
        }
    }

    /// Run a sweep without acquiring or releasing.
    pub fn sweep(&self) {
        let mut state = self.lock();
        let now = self.clock.now_ms();
        self.sweep_locked(&mut state, now, false);
    }

    pub fn status(&self) -> GovernorSnapshot {
        let state = self.lock();
        GovernorSnapshot {
            name: self.name.clone(),
            enabled: self.config.enabled,
            max_slots: self.config.max_slots,
            active: state.permits.len(),
            waiting: state.waiters.len(),
            active_by_holder: state
                .active_by_holder
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

struct PendingWait {
    governor: Arc<Governor>,
    waiter_id: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Withdrawn::Granted(id) = self.governor.withdraw(self.waiter_id, &mut self.rx) {
            self.governor.release(id);
        }
    }
}

/// A granted slot. Released on drop.
#[derive(Debug)]
pub struct Permit {
    governor: Option<Arc<Governor>>,
    id: u64,
    holder: String,
}

impl Permit {
    fn new(governor: Arc<Governor>, id: u64, holder: &str) -> Self {
        Self {
            governor: Some(governor),
            id,
            holder: holder.to_string(),
        }
    }

    fn noop(holder: &str) -> Self {
        Self {
            governor: None,
            id: 0,
            holder: holder.to_string(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn is_noop(&self) -> bool {
        self.governor.is_none()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(governor) = self.governor.take() {
            governor.release(self.id);
        }
    }
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("name", &self.name)
            .field("max_slots", &self.config.max_slots)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::clock::ManualClock;

    fn config(max_slots: usize) -> GovernorConfig {
        GovernorConfig {
            enabled: true,
            max_slots,
            queue_timeout_ms: 5_000,
            permit_ttl_ms: 60_000,
            max_waiters: 16,
        }
    }

    fn check_invariants(gov: &Governor) {
        let s = gov.status();
        let sum: usize = s.active_by_holder.values().sum();
        assert_eq!(sum, s.active);
        assert!(s.active <= s.max_slots);
        let state = gov.lock();
        let contenders = state.contenders(None);
        if contenders >= 2 {
            let share = gov.fair_share(contenders);
            for (holder, active) in &s.active_by_holder {
                if *active >= 2 {
                    assert!(*active <= share, "{holder} holds {active} > share {share}");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_grants_until_ceiling() {
        let gov = Governor::new("tasks", config(2), Arc::new(ManualClock::new(0)));
        let a = gov.acquire("a").await.unwrap();
        let b = gov.acquire("b").await.unwrap();
        assert_eq!(gov.status().active, 2);
        check_invariants(&gov);
        drop(a);
        drop(b);
        assert_eq!(gov.status().active, 0);
    }

    #[tokio::test]
    async fn test_single_holder_may_use_all_slots() {
        let gov = Governor::new("tasks", config(3), Arc::new(ManualClock::new(0)));
        let _p1 = gov.acquire("a").await.unwrap();
        let _p2 = gov.acquire("a").await.unwrap();
        let _p3 = gov.acquire("a").await.unwrap();
        assert_eq!(gov.status().active_by_holder["a"], 3);
    }

    #[tokio::test]
    async fn test_release_prefers_under_share_waiter() {
        let gov = Governor::new("tasks", config(2), Arc::new(ManualClock::new(0)));
        let a1 = gov.acquire("a").await.unwrap();
        let _a2 = gov.acquire("a").await.unwrap();

        // "a" queues first, "b" second; on release "b" is under share and wins.
        let gov_a = gov.clone();
        let wait_a = tokio::spawn(async move { gov_a.acquire("a").await });
        tokio::task::yield_now().await;
        let gov_b = gov.clone();
        let wait_b = tokio::spawn(async move { gov_b.acquire("b").await });
        while gov.status().waiting < 2 {
            tokio::task::yield_now().await;
        }

        drop(a1);
        let permit_b = wait_b.await.unwrap().unwrap();
        assert_eq!(permit_b.holder(), "b");
        assert_eq!(gov.status().waiting, 1);
        check_invariants(&gov);

        drop(permit_b);
        // "a" is alone again and takes the freed slot.
        let permit_a = wait_a.await.unwrap().unwrap();
        assert_eq!(permit_a.holder(), "a");
        check_invariants(&gov);
    }

    #[tokio::test]
    async fn test_release_falls_back_to_fifo_when_all_waiters_over_share() {
        let gov = Governor::new("tasks", config(5), Arc::new(ManualClock::new(0)));
        let a1 = gov.acquire("a").await.unwrap();
        let _a2 = gov.acquire("a").await.unwrap();
        let _b1 = gov.acquire("b").await.unwrap();
        let _c1 = gov.acquire("c").await.unwrap();
        assert_eq!(gov.status().active, 4);

        // Share is now 1 each, so second permits for "b" and "c" queue.
        let gov_b = gov.clone();
        let wait_b = tokio::spawn(async move { gov_b.acquire("b").await });
        while gov.status().waiting < 1 {
            tokio::task::yield_now().await;
        }
        let gov_c = gov.clone();
        let wait_c = tokio::spawn(async move { gov_c.acquire("c").await });
        while gov.status().waiting < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gov.status().active, 4);

        drop(a1);
        let permit_b = wait_b.await.unwrap().unwrap();
        let permit_c = wait_c.await.unwrap().unwrap();
        assert_eq!(permit_b.holder(), "b");
        assert_eq!(permit_c.holder(), "c");

        let s = gov.status();
        assert_eq!(s.active, 5);
        assert_eq!(s.waiting, 0);
        assert_eq!(s.active_by_holder.values().sum::<usize>(), s.active);
    }

    #[tokio::test]
    async fn test_waiter_rejected_by_sweep_on_acquire() {
        let clock = Arc::new(ManualClock::new(0));
        let gov = Governor::new("tasks", config(1), clock.clone());
        let _held = gov.acquire("a").await.unwrap();

        let gov_b = gov.clone();
        let wait_b = tokio::spawn(async move { gov_b.acquire("b").await });
        while gov.status().waiting < 1 {
            tokio::task::yield_now().await;
        }

        clock.advance(5_000);
        // Any new acquisition attempt sweeps the overdue waiter.
        let gov_c = gov.clone();
        let _c = tokio::spawn(async move { gov_c.acquire("c").await });

        let err = wait_b.await.unwrap().unwrap_err();
        assert!(matches!(err, GovernorError::QueueTimeout { .. }));
    }

    #[tokio::test]
    async fn test_expired_permit_is_reclaimed() {
        let clock = Arc::new(ManualClock::new(0));
        let gov = Governor::new("tasks", config(1), clock.clone());
        let stuck = gov.acquire("crashed").await.unwrap();
        std::mem::forget(stuck);

        clock.advance(60_000);
        let p = gov.acquire("b").await.unwrap();
        assert_eq!(p.holder(), "b");
        assert_eq!(gov.status().active, 1);
        assert!(!gov.status().active_by_holder.contains_key("crashed"));
    }

    #[tokio::test]
    async fn test_saturated_when_too_many_waiters() {
        let cfg = GovernorConfig {
            max_waiters: 1,
            ..config(1)
        };
        let gov = Governor::new("spawn", cfg, Arc::new(ManualClock::new(0)));
        let _held = gov.acquire("a").await.unwrap();

        let gov_b = gov.clone();
        let _wait_b = tokio::spawn(async move { gov_b.acquire("b").await });
        while gov.status().waiting < 1 {
            tokio::task::yield_now().await;
        }

        let err = gov.acquire("c").await.unwrap_err();
        assert!(matches!(err, GovernorError::Saturated { max_waiters: 1, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_wait_is_withdrawn() {
        let gov = Governor::new("tasks", config(1), Arc::new(ManualClock::new(0)));
        let held = gov.acquire("a").await.unwrap();

        let gov_b = gov.clone();
        let wait_b = tokio::spawn(async move { gov_b.acquire("b").await });
        while gov.status().waiting < 1 {
            tokio::task::yield_now().await;
        }
        wait_b.abort();
        let _ = wait_b.await;

        assert_eq!(gov.status().waiting, 0);
        drop(held);
        assert_eq!(gov.status().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_turnover() {
        let cfg = GovernorConfig {
            queue_timeout_ms: 100,
            ..config(1)
        };
        let gov = Governor::new("tasks", cfg, Arc::new(ManualClock::new(0)));
        let _held = gov.acquire("a").await.unwrap();

        let err = gov.acquire("b").await.unwrap_err();
        assert!(matches!(err, GovernorError::QueueTimeout { .. }));
        assert_eq!(gov.status().waiting, 0);
    }

    #[tokio::test]
    async fn test_disabled_is_pass_through() {
        let cfg = GovernorConfig {
            enabled: false,
            ..config(1)
        };
        let gov = Governor::new("tasks", cfg, Arc::new(ManualClock::new(0)));
        let permits: Vec<_> = futures::future::join_all((0..10).map(|_| gov.acquire("a")))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(permits.iter().all(Permit::is_noop));
        assert_eq!(gov.status().active, 0);
    }

    #[tokio::test]
    async fn test_fair_share_under_contention() {
        let gov = Governor::new("tasks", config(4), Arc::new(ManualClock::new(0)));
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(gov.acquire("a").await.unwrap());
        }

        let mut waits = Vec::new();
        for holder in ["b", "b", "c"] {
            let g = gov.clone();
            waits.push(tokio::spawn(async move { g.acquire(holder).await }));
            while gov.status().waiting < waits.len() {
                tokio::task::yield_now().await;
            }
        }

        // Three contenders share 4 slots: share is 1 each, "a" drains down.
        drop(held.pop());
        drop(held.pop());
        let status = gov.status();
        assert_eq!(status.active_by_holder.get("b"), Some(&1));
        assert_eq!(status.active_by_holder.get("c"), Some(&1));
        assert_eq!(status.active_by_holder.get("a"), Some(&2));
        assert_eq!(status.waiting, 1);

        // The only waiter is over share; the freed slot still goes to it.
        drop(held.pop());
        let status = gov.status();
        assert_eq!(status.active_by_holder.get("b"), Some(&2));
        assert_eq!(status.active_by_holder.get("a"), Some(&1));
        assert_eq!(status.active, 4);
        assert_eq!(status.waiting, 0);
        let second_b = waits.remove(1).await.unwrap().unwrap();
        assert_eq!(second_b.holder(), "b");
    }
}

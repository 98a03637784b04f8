//! Event broadcasting with a gateway-wide sequence and a replay backlog.
//!
//! Every event gets the next sequence number, so each connection sees a
//! strictly increasing (not necessarily contiguous) sequence. Events other
//! than `tick` are retained in a bounded backlog for reconnecting clients.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gatehouse_core::protocol::{
    EventFrame, GatewayFrame, HelloOk, ResumeMode, ResumeOutcome, StateVersion,
};
use tracing::{debug, error, info};

use crate::connection::Outbox;
use crate::hooks::HookRegistry;

pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";
pub const EVENT_TICK: &str = "tick";
pub const EVENT_SHUTDOWN: &str = "shutdown";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_INTERRUPT_REQUESTED: &str = "interrupt.requested";
pub const EVENT_INTERRUPT_RESUMED: &str = "interrupt.resumed";
pub const EVENT_INTERRUPT_EXPIRED: &str = "interrupt.expired";
pub const EVENT_TASK_QUEUED: &str = "task.queued";
pub const EVENT_TASK_COMPLETED: &str = "task.completed";
pub const EVENT_TASK_FAILED: &str = "task.failed";
pub const EVENT_TASK_SUSPENDED: &str = "task.suspended";

/// Events advertised in `hello-ok`.
pub const EVENTS: &[&str] = &[
    EVENT_CONNECT_CHALLENGE,
    EVENT_TICK,
    EVENT_SHUTDOWN,
    EVENT_PRESENCE,
    EVENT_INTERRUPT_REQUESTED,
    EVENT_INTERRUPT_RESUMED,
    EVENT_INTERRUPT_EXPIRED,
    EVENT_TASK_QUEUED,
    EVENT_TASK_COMPLETED,
    EVENT_TASK_FAILED,
    EVENT_TASK_SUSPENDED,
];

/// Where components publish events without knowing about connections.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: serde_json::Value);

    /// Deliver to one connection only. Returns whether it was handed off.
    fn send_to(&self, _conn_id: &str, _event: &str, _payload: serde_json::Value) -> bool {
        false
    }
}

/// Outcome of a replay request.
#[derive(Debug, Clone, PartialEq)]
pub enum Replay {
    Events(Vec<EventFrame>),
    /// The requested position is outside the backlog; a full snapshot is needed.
    SnapshotRequired,
}

struct BusInner {
    last_seq: u64,
    backlog: VecDeque<EventFrame>,
    capacity: usize,
    /// Highest sequence dropped from the backlog.
    evicted_through: u64,
    versions: StateVersion,
    subscribers: HashMap<String, Outbox>,
}

impl BusInner {
    fn replay_since(&self, last_seq: u64) -> Replay {
        if last_seq < self.evicted_through || last_seq > self.last_seq {
            return Replay::SnapshotRequired;
        }
        Replay::Events(
            self.backlog
                .iter()
                .filter(|e| e.seq.is_some_and(|s| s > last_seq))
                .cloned()
                .collect(),
        )
    }

    fn events_after(&self, seq: u64) -> Vec<EventFrame> {
        self.backlog
            .iter()
            .filter(|e| e.seq.is_some_and(|s| s > seq))
            .cloned()
            .collect()
    }
}

pub struct EventBus {
    inner: Mutex<BusInner>,
    hooks: Arc<HookRegistry>,
}

impl EventBus {
    pub fn new(capacity: usize, hooks: Arc<HookRegistry>) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                last_seq: 0,
                backlog: VecDeque::with_capacity(capacity),
                capacity,
                evicted_through: 0,
                versions: StateVersion::default(),
                subscribers: HashMap::new(),
            }),
            hooks,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Broadcast an event to all subscribed connections. Returns its sequence number.
    pub fn broadcast(&self, event: &str, payload: Option<serde_json::Value>) -> u64 {
        let (seq, sent) = {
            let mut inner = self.lock();
            if event == EVENT_PRESENCE {
                inner.versions.presence += 1;
            } else if event.starts_with("interrupt.") {
                inner.versions.interrupts += 1;
            }
            inner.last_seq += 1;
            let seq = inner.last_seq;

            let frame = EventFrame {
                event: event.to_string(),
                payload: payload.clone(),
                seq: Some(seq),
                state_version: Some(inner.versions),
            };
            let msg = match serde_json::to_string(&GatewayFrame::Event(frame.clone())) {
                Ok(m) => m,
                Err(e) => {
                    error!(%e, event, "Failed to serialize event");
                    return seq;
                }
            };

            if event != EVENT_TICK {
                inner.backlog.push_back(frame);
                while inner.backlog.len() > inner.capacity {
                    if let Some(evicted) = inner.backlog.pop_front() {
                        inner.evicted_through = evicted.seq.unwrap_or(inner.evicted_through);
                    }
                }
            }

            let sent = inner
                .subscribers
                .values()
                .filter(|outbox| outbox.send(msg.clone()))
                .count();
            (seq, sent)
        };

        debug!(event, seq, sent, "Broadcast event");
        if event != EVENT_TICK {
            self.hooks
                .fire_detached(event, Some(seq), payload.unwrap_or(serde_json::Value::Null));
        }
        seq
    }

    /// Subscribe a freshly authenticated connection.
    ///
    /// Sends the `hello-ok` response, then any events the client missed,
    /// then registers it for live delivery, all under the bus lock so nothing
    /// is lost or duplicated in between. `snapshot_seq` is the sequence
    /// observed when `hello.snapshot` was built.
    pub fn attach(
        &self,
        conn_id: &str,
        outbox: Outbox,
        request_id: &str,
        mut hello: HelloOk,
        resume_from: Option<u64>,
        snapshot_seq: u64,
    ) -> ResumeOutcome {
        let mut inner = self.lock();

        let (mode, missed) = match resume_from {
            Some(last_seq) => match inner.replay_since(last_seq) {
                Replay::Events(events) => (ResumeMode::Replay, events),
                Replay::SnapshotRequired => {
                    (ResumeMode::Snapshot, inner.events_after(snapshot_seq))
                }
            },
            None => (ResumeMode::Fresh, inner.events_after(snapshot_seq)),
        };
        let outcome = ResumeOutcome {
            mode,
            replayed: missed.len(),
        };

        hello.snapshot.seq = snapshot_seq;
        hello.resume = outcome.clone();
        let response = match serde_json::to_value(&hello) {
            Ok(payload) => GatewayFrame::ok(request_id, payload),
            Err(e) => {
                error!(%e, "Failed to serialize hello-ok");
                return outcome;
            }
        };
        if !outbox.send_frame(&response) {
            return outcome;
        }
        for frame in missed {
            outbox.send_frame(&GatewayFrame::Event(frame));
        }
        inner.subscribers.insert(conn_id.to_string(), outbox);

        info!(conn_id, mode = ?outcome.mode, replayed = outcome.replayed, "Connection subscribed");
        outcome
    }

    /// Send an event to a single subscribed connection.
    ///
    /// Targeted events carry no sequence, are never retained for replay and
    /// do not fire hooks, so they may carry secrets meant for one client.
    pub fn send_direct(&self, conn_id: &str, event: &str, payload: Option<serde_json::Value>) -> bool {
        let frame = GatewayFrame::Event(EventFrame {
            event: event.to_string(),
            payload,
            seq: None,
            state_version: None,
        });
        let inner = self.lock();
        let Some(outbox) = inner.subscribers.get(conn_id) else {
            debug!(conn_id, event, "Targeted event has no subscriber");
            return false;
        };
        outbox.send_frame(&frame)
    }

    pub fn detach(&self, conn_id: &str) {
        self.lock().subscribers.remove(conn_id);
    }

    /// Events after `last_seq`, or `SnapshotRequired` if they are no longer retained.
    pub fn replay_since(&self, last_seq: u64) -> Replay {
        self.lock().replay_since(last_seq)
    }

    pub fn last_seq(&self) -> u64 {
        self.lock().last_seq
    }

    pub fn state_version(&self) -> StateVersion {
        self.lock().versions
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &str, payload: serde_json::Value) {
        self.broadcast(event, Some(payload));
    }

    fn send_to(&self, conn_id: &str, event: &str, payload: serde_json::Value) -> bool {
        self.send_direct(conn_id, event, Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbox;
    use gatehouse_core::protocol::{
        AdmissionSnapshot, Features, HelloAuth, Policy, ServerInfo, Snapshot,
    };
    use serde_json::json;
    use tokio::sync::mpsc;

    fn bus(capacity: usize) -> EventBus {
        EventBus::new(capacity, Arc::new(HookRegistry::new()))
    }

    fn hello() -> HelloOk {
        HelloOk {
            kind: "hello-ok".into(),
            protocol: 1,
            server: ServerInfo {
                version: "test".into(),
                conn_id: "c1".into(),
            },
            features: Features {
                methods: vec![],
                events: vec![],
            },
            policy: Policy {
                max_payload: 1024,
                max_buffered_bytes: 1 << 20,
                tick_interval_ms: 1000,
            },
            snapshot: Snapshot {
                state_version: StateVersion::default(),
                seq: 0,
                auth_mode: "none".into(),
                uptime_ms: 0,
                presence: vec![],
                pending_interrupts: vec![],
                admission: AdmissionSnapshot {
                    governors: vec![],
                    queue_depth: 0,
                },
            },
            auth: HelloAuth {
                role: "operator".into(),
                scopes: vec![],
                device_id: None,
            },
            resume: ResumeOutcome {
                mode: ResumeMode::Fresh,
                replayed: 0,
            },
        }
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<GatewayFrame> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| serde_json::from_str(&m).unwrap())
            .collect()
    }

    fn event_seqs(frames: &[GatewayFrame]) -> Vec<u64> {
        frames
            .iter()
            .filter_map(|f| match f {
                GatewayFrame::Event(e) => e.seq,
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sequence_strictly_increases() {
        let bus = bus(8);
        let a = bus.broadcast("presence", None);
        let b = bus.broadcast(EVENT_TICK, None);
        let c = bus.broadcast("task.completed", Some(json!({})));
        assert!(a < b && b < c);
    }

    #[test]
    fn test_state_version_bumps() {
        let bus = bus(8);
        bus.broadcast(EVENT_PRESENCE, None);
        bus.emit(EVENT_INTERRUPT_REQUESTED, json!({}));
        bus.emit(EVENT_INTERRUPT_RESUMED, json!({}));
        bus.broadcast(EVENT_TASK_QUEUED, None);
        assert_eq!(
            bus.state_version(),
            StateVersion {
                presence: 1,
                interrupts: 2
            }
        );
    }

    #[test]
    fn test_ticks_are_not_retained() {
        let bus = bus(8);
        bus.broadcast(EVENT_TICK, None);
        let seq = bus.broadcast(EVENT_PRESENCE, None);
        match bus.replay_since(0) {
            Replay::Events(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].seq, Some(seq));
            }
            Replay::SnapshotRequired => panic!("expected replay"),
        }
    }

    #[test]
    fn test_replay_window() {
        let bus = bus(3);
        for _ in 0..5 {
            bus.broadcast(EVENT_TASK_QUEUED, None);
        }
        // Retained: 3, 4, 5. Evicted through 2.
        assert_eq!(bus.replay_since(1), Replay::SnapshotRequired);
        match bus.replay_since(2) {
            Replay::Events(events) => assert_eq!(events.len(), 3),
            Replay::SnapshotRequired => panic!("2 is still replayable"),
        }
        match bus.replay_since(4) {
            Replay::Events(events) => assert_eq!(events[0].seq, Some(5)),
            Replay::SnapshotRequired => panic!("4 is replayable"),
        }
        // A position from the future (e.g. another server run) needs a snapshot.
        assert_eq!(bus.replay_since(99), Replay::SnapshotRequired);
    }

    #[test]
    fn test_attach_replays_missed_events_then_live() {
        let bus = bus(16);
        for _ in 0..4 {
            bus.broadcast(EVENT_TASK_QUEUED, None);
        }
        let (outbox, mut rx) = Outbox::for_test();

        let outcome = bus.attach("c1", outbox, "hello-1", hello(), Some(2), bus.last_seq());
        assert_eq!(outcome.mode, ResumeMode::Replay);
        assert_eq!(outcome.replayed, 2);

        bus.broadcast(EVENT_TASK_COMPLETED, None);
        let received = frames(&mut rx);
        assert!(matches!(&received[0], GatewayFrame::Response(r) if r.ok && r.id == "hello-1"));
        assert_eq!(event_seqs(&received), vec![3, 4, 5]);
    }

    #[test]
    fn test_attach_with_stale_seq_gets_snapshot() {
        let bus = bus(2);
        for _ in 0..5 {
            bus.broadcast(EVENT_TASK_QUEUED, None);
        }
        let (outbox, mut rx) = Outbox::for_test();

        let outcome = bus.attach("c1", outbox, "h", hello(), Some(1), bus.last_seq());
        assert_eq!(outcome.mode, ResumeMode::Snapshot);
        assert_eq!(outcome.replayed, 0);

        let received = frames(&mut rx);
        assert_eq!(received.len(), 1);
        let GatewayFrame::Response(res) = &received[0] else {
            panic!("expected hello-ok response");
        };
        let payload = res.payload.as_ref().unwrap();
        assert_eq!(payload["type"], "hello-ok");
        assert_eq!(payload["resume"]["mode"], "snapshot");
        assert_eq!(payload["snapshot"]["seq"], 5);
    }

    #[test]
    fn test_fresh_attach_covers_events_since_snapshot() {
        let bus = bus(16);
        bus.broadcast(EVENT_PRESENCE, None);
        let snapshot_seq = bus.last_seq();
        // Raced in between building the snapshot and subscribing.
        bus.broadcast(EVENT_PRESENCE, None);

        let (outbox, mut rx) = Outbox::for_test();
        let outcome = bus.attach("c1", outbox, "h", hello(), None, snapshot_seq);
        assert_eq!(outcome.mode, ResumeMode::Fresh);
        assert_eq!(event_seqs(&frames(&mut rx)), vec![2]);

        bus.detach("c1");
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_targeted_event_reaches_one_connection_only() {
        let bus = bus(16);
        let (first, mut first_rx) = Outbox::for_test();
        let (second, mut second_rx) = Outbox::for_test();
        bus.attach("c1", first, "h1", hello(), None, bus.last_seq());
        bus.attach("c2", second, "h2", hello(), None, bus.last_seq());
        frames(&mut first_rx);
        frames(&mut second_rx);

        assert!(bus.send_to("c1", EVENT_TASK_SUSPENDED, json!({"resume_token": "secret"})));
        assert!(!bus.send_to("gone", EVENT_TASK_SUSPENDED, json!({})));

        let received = frames(&mut first_rx);
        assert_eq!(received.len(), 1);
        let GatewayFrame::Event(event) = &received[0] else {
            panic!("expected event frame");
        };
        assert_eq!(event.event, EVENT_TASK_SUSPENDED);
        assert_eq!(event.seq, None);
        assert!(frames(&mut second_rx).is_empty());

        // Not sequenced and not replayable.
        assert_eq!(bus.last_seq(), 0);
        assert_eq!(bus.replay_since(0), Replay::Events(vec![]));
    }
}

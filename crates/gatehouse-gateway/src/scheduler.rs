//! Priority queue with per-tenant round robin inside each priority level.
//!
//! Levels are served strictly highest first. Within a level, tenants that
//! currently have entries queued take turns; a tenant's own entries are FIFO.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(SchedulerError::InvalidPriority(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("queue is full ({max} entries)")]
    QueueFull { max: usize },

    #[error("unknown priority '{0}'")]
    InvalidPriority(String),

    #[error("entry '{0}' is already queued")]
    DuplicateId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: String,
    pub tenant_id: String,
    pub priority: Priority,
    pub enqueued_at_ms: u64,
    /// Absolute instant after which the entry is dropped unserved.
    pub deadline_ms: u64,
}

#[derive(Debug, Default)]
struct Level {
    by_tenant: HashMap<String, VecDeque<QueueEntry>>,
    /// Tenants with queued entries, next to be served at the front.
    rotation: VecDeque<String>,
    len: usize,
}

impl Level {
    fn push(&mut self, entry: QueueEntry) {
        let queue = self.by_tenant.entry(entry.tenant_id.clone()).or_default();
        if queue.is_empty() {
            self.rotation.push_back(entry.tenant_id.clone());
        }
        queue.push_back(entry);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<QueueEntry> {
        let tenant = self.rotation.pop_front()?;
        let queue = self.by_tenant.get_mut(&tenant)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.by_tenant.remove(&tenant);
        } else {
            self.rotation.push_back(tenant);
        }
        if entry.is_some() {
            self.len -= 1;
        }
        entry
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&QueueEntry) -> bool) -> Vec<QueueEntry> {
        let mut removed = Vec::new();
        for queue in self.by_tenant.values_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if pred(&entry) {
                    removed.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
        }
        if !removed.is_empty() {
            self.by_tenant.retain(|_, q| !q.is_empty());
            let by_tenant = &self.by_tenant;
            self.rotation.retain(|t| by_tenant.contains_key(t));
            self.len -= removed.len();
        }
        removed
    }
}

#[derive(Debug)]
pub struct PriorityScheduler {
    levels: [Level; 4],
    max_queued: usize,
}

impl PriorityScheduler {
    pub fn new(max_queued: usize) -> Self {
        Self {
            levels: Default::default(),
            max_queued,
        }
    }

    /// Append an entry. Returns the total depth afterwards.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<usize, SchedulerError> {
        if self.queue_depth() >= self.max_queued {
            return Err(SchedulerError::QueueFull {
                max: self.max_queued,
            });
        }
        if self.contains(&entry.id) {
            return Err(SchedulerError::DuplicateId(entry.id));
        }
        self.levels[entry.priority.index()].push(entry);
        Ok(self.queue_depth())
    }

    /// Next entry: highest non-empty level, round robin across its tenants.
    pub fn dequeue(&mut self) -> Option<QueueEntry> {
        self.levels.iter_mut().find_map(Level::pop)
    }

    pub fn remove(&mut self, id: &str) -> Option<QueueEntry> {
        self.levels
            .iter_mut()
            .find_map(|level| level.remove_where(|e| e.id == id).pop())
    }

    /// Remove and return every entry whose deadline is at or before `now_ms`.
    pub fn drain_expired(&mut self, now_ms: u64) -> Vec<QueueEntry> {
        self.levels
            .iter_mut()
            .flat_map(|level| level.remove_where(|e| e.deadline_ms <= now_ms))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.levels
            .iter()
            .flat_map(|l| l.by_tenant.values())
            .any(|q| q.iter().any(|e| e.id == id))
    }

    pub fn queue_depth(&self) -> usize {
        self.levels.iter().map(|l| l.len).sum()
    }

    pub fn depth_by_priority(&self) -> [usize; 4] {
        let mut depths = [0usize; 4];
        for (idx, level) in self.levels.iter().enumerate() {
            depths[idx] = level.len;
        }
        depths
    }
}

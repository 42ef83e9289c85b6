//! Bounded record of task registrations and removals.
//!
//! The scheduler writes one event whenever a task enters or leaves its
//! table; `stats()` reports how many are retained.

use std::collections::VecDeque;

use serde::Serialize;
use uuid::Uuid;

use crate::util::clock::now_ms;

/// Why an event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// New name added to the table.
    Registered,
    /// Existing name overwritten by a new instance.
    Replaced,
    /// Completed task dropped by cleanup.
    RemovedCompleted,
    /// Long-inactive task dropped by cleanup.
    RemovedInactive,
    /// Non-perpetual task still active past the hung threshold, force-stopped.
    RemovedHung,
}

/// One audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Task name.
    pub task: String,
    /// Task variant.
    pub kind: &'static str,
    /// What happened.
    pub action: AuditAction,
    /// Wall-clock milliseconds.
    pub created_at_ms: u128,
}

impl AuditEvent {
    /// Event stamped now.
    #[must_use]
    pub fn new(task: impl Into<String>, kind: &'static str, action: AuditAction) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            task: task.into(),
            kind,
            action,
            created_at_ms: now_ms(),
        }
    }

    /// Whether this event records a removal.
    #[must_use]
    pub const fn is_removal(&self) -> bool {
        matches!(
            self.action,
            AuditAction::RemovedCompleted | AuditAction::RemovedInactive | AuditAction::RemovedHung
        )
    }
}

/// Destination of audit events.
pub trait AuditSink: Send {
    /// Store one event.
    fn record(&mut self, event: AuditEvent);
}

/// Keeps the newest `max_events` events.
#[derive(Debug)]
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Sink retaining at most `max_events`.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Snapshot, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }

    /// Retained removal events.
    #[must_use]
    pub fn removals(&self) -> usize {
        self.events.iter().filter(|e| e.is_removal()).count()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

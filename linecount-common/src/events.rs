//! Event types for the station event system
//!
//! Provides the LineEvent enum and the EventBus shared by the pairing engine,
//! the lifecycle manager, the sync coordinator and any registered listeners.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Station event types
///
/// Events are broadcast via EventBus and are serializable so a UI bridge can
/// forward them unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum LineEvent {
    /// Two halves were reconciled into one completed unit
    UnitCompleted {
        line: String,
        part_no: String,
        unit_id: i64,
        plan_id: Option<i64>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A half was staged and waits for its complementary format
    HalfStaged {
        line: String,
        part_no: String,
        format: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A scan was rejected (reason is the short outcome code)
    ScanRejected {
        line: String,
        part_no: Option<String>,
        reason: String,
        raw: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A work order changed status
    PlanStatusChanged {
        line: String,
        plan_id: i64,
        part_no: String,
        old_status: String,
        new_status: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Remote store reachability changed
    ConnectivityChanged {
        online: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl LineEvent {
    /// Line the event belongs to, if any
    pub fn line(&self) -> Option<&str> {
        match self {
            LineEvent::UnitCompleted { line, .. }
            | LineEvent::HalfStaged { line, .. }
            | LineEvent::ScanRejected { line, .. }
            | LineEvent::PlanStatusChanged { line, .. } => Some(line),
            LineEvent::ConnectivityChanged { .. } => None,
        }
    }
}

/// Broadcast bus for [`LineEvent`]s
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<LineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering `capacity` events before old ones drop
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<LineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: LineEvent) -> Result<usize, broadcast::error::SendError<LineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: LineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

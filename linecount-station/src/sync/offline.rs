//! Offline window
//!
//! After a connection failure all remote I/O is skipped until the window
//! elapses. The next successful call moves the gate back to ONLINE.

use chrono::{DateTime, Duration, Utc};
use linecount_common::Clock;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

#[derive(Debug)]
struct GateState {
    connectivity: Connectivity,
    offline_until: Option<DateTime<Utc>>,
}

pub struct OfflineGate {
    clock: Arc<dyn Clock>,
    window: Duration,
    state: Mutex<GateState>,
}

impl OfflineGate {
    pub fn new(clock: Arc<dyn Clock>, window_secs: u64) -> Self {
        Self {
            clock,
            window: Duration::seconds(window_secs as i64),
            state: Mutex::new(GateState {
                connectivity: Connectivity::Online,
                offline_until: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Remote I/O may be attempted now
    pub fn is_available(&self) -> bool {
        match self.state().offline_until {
            Some(until) => self.clock.now() >= until,
            None => true,
        }
    }

    pub fn connectivity(&self) -> Connectivity {
        self.state().connectivity
    }

    pub fn offline_until(&self) -> Option<DateTime<Utc>> {
        self.state().offline_until
    }

    /// Start (or restart) the offline window; true when this went OFFLINE
    pub fn trip(&self) -> bool {
        let until = self.clock.now() + self.window;
        let mut state = self.state();
        state.offline_until = Some(until);
        let changed = state.connectivity == Connectivity::Online;
        state.connectivity = Connectivity::Offline;
        changed
    }

    /// Record a successful call; true when this went back ONLINE
    pub fn mark_online(&self) -> bool {
        let mut state = self.state();
        state.offline_until = None;
        let changed = state.connectivity == Connectivity::Offline;
        state.connectivity = Connectivity::Online;
        changed
    }
}

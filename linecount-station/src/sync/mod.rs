//! Sync Coordinator
//!
//! Owns every background loop of the station. Each cycle kind runs on its own
//! interval until the shared cancellation token fires:
//!
//! | cycle            | default | remote |
//! |------------------|---------|--------|
//! | unit push        | 4 s     | yes    |
//! | plan pull        | 15 s    | yes    |
//! | increment push   | 15 s    | yes    |
//! | inactivity check | 30 s    | no     |
//! | closures         | 60 s    | no     |
//! | staging cleanup  | 60 s    | no     |
//!
//! Remote calls go through [`SyncCoordinator::call`], which bounds them with
//! the I/O timeout, retries transient failures and trips the offline window on
//! connection errors. Local work never waits on the remote.

mod offline;

pub use offline::{Connectivity, OfflineGate};

use crate::lifecycle::PlanLifecycle;
use crate::pairing::PairingEngine;
use crate::remote::{RemoteError, RemoteStore, StatusUpdate};
use crate::store::LocalStore;
use linecount_common::config::{RemoteConfig, SyncConfig};
use linecount_common::events::{EventBus, LineEvent};
use linecount_common::{Clock, Result, RetryPolicy};
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one shutdown drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub cycles: u32,
    pub units: usize,
    pub increments: i64,
}

pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    lifecycle: Arc<PlanLifecycle>,
    pairing: Arc<PairingEngine>,
    remote: Option<Arc<dyn RemoteStore>>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    gate: OfflineGate,
    lines: Vec<String>,
    config: SyncConfig,
    io_timeout: Duration,
    remote_retry: RetryPolicy,
    /// Serializes increment pushes with plan merges
    plan_counts: AsyncMutex<()>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<LocalStore>,
        lifecycle: Arc<PlanLifecycle>,
        pairing: Arc<PairingEngine>,
        remote: Option<Arc<dyn RemoteStore>>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        lines: Vec<String>,
        config: SyncConfig,
        remote_config: &RemoteConfig,
    ) -> Self {
        Self {
            gate: OfflineGate::new(clock.clone(), config.offline_window_secs),
            store,
            lifecycle,
            pairing,
            remote,
            clock,
            events,
            lines,
            config,
            io_timeout: remote_config.io_timeout(),
            remote_retry: remote_config.retry,
            plan_counts: AsyncMutex::new(()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn connectivity(&self) -> Connectivity {
        self.gate.connectivity()
    }

    pub fn gate(&self) -> &OfflineGate {
        &self.gate
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Remote handle when configured and outside the offline window
    fn reachable_remote(&self) -> Option<Arc<dyn RemoteStore>> {
        let remote = self.remote.as_ref()?;
        if !self.gate.is_available() {
            debug!(offline_until = ?self.gate.offline_until(), "Remote skipped, offline window active");
            return None;
        }
        Some(Arc::clone(remote))
    }

    /// Run one remote call with timeout, transient retry and offline tracking
    async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> std::result::Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let max_attempts = self.remote_retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.io_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Unavailable(format!("{} timed out", operation))),
            };

            match result {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self.remote_retry.backoff_after(attempt);
                    warn!(operation, attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "Transient remote error, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_unavailable() => {
                    self.go_offline(operation, &e);
                    return Err(e);
                }
                other => {
                    self.go_online();
                    return other;
                }
            }
        }
    }

    fn go_offline(&self, operation: &str, err: &RemoteError) {
        if self.gate.trip() {
            warn!(
                operation,
                error = %err,
                window_secs = self.config.offline_window_secs,
                "Remote store unreachable, entering offline window"
            );
            self.events.emit_lossy(LineEvent::ConnectivityChanged {
                online: false,
                timestamp: self.clock.now(),
            });
        }
    }

    fn go_online(&self) {
        if self.gate.mark_online() {
            info!("Remote store reachable again");
            self.events.emit_lossy(LineEvent::ConnectivityChanged {
                online: true,
                timestamp: self.clock.now(),
            });
        }
    }

    /// Startup connectivity check; false when offline or no remote is configured
    pub async fn check_connectivity(&self) -> bool {
        let Some(remote) = self.remote.clone() else {
            return false;
        };
        match self.call("ping", || remote.ping()).await {
            Ok(()) => {
                info!(backend = remote.backend(), "Remote store reachable");
                true
            }
            Err(e) => {
                warn!(backend = remote.backend(), error = %e, "Remote store not reachable at startup");
                false
            }
        }
    }

    /// Push the oldest unsynced units; returns how many are now synced
    pub async fn push_units(&self) -> Result<usize> {
        let Some(remote) = self.reachable_remote() else {
            return Ok(0);
        };

        let batch = self.store.unsynced_units(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut synced = Vec::with_capacity(batch.len());
        for unit in &batch {
            match self.call("insert_unit", || remote.insert_unit(unit)).await {
                Ok(()) => {
                    synced.push(unit.unit_id);
                    if let Err(e) = self
                        .call("add_daily_production", || {
                            remote.add_daily_production(&unit.work_date, &unit.line, &unit.part_no, unit.quantity, 0)
                        })
                        .await
                    {
                        warn!(unit_id = unit.unit_id, error = %e, "Unit pushed but remote daily total not updated");
                        if e.is_unavailable() {
                            break;
                        }
                    }
                }
                Err(RemoteError::Duplicate) => {
                    debug!(unit_id = unit.unit_id, "Unit already present remotely");
                    synced.push(unit.unit_id);
                }
                Err(e) if e.is_unavailable() => break,
                Err(e) => {
                    warn!(unit_id = unit.unit_id, error = %e, "Unit push failed, will retry");
                }
            }
        }

        self.store.mark_units_synced(&synced, self.clock.now_millis()).await?;
        if !synced.is_empty() {
            debug!(count = synced.len(), "Units synced");
        }
        Ok(synced.len())
    }

    /// Push the increment buffer; returns the delta the remote confirmed
    pub async fn push_increments(&self) -> Result<i64> {
        let Some(remote) = self.reachable_remote() else {
            return Ok(0);
        };

        let _counts = self.plan_counts.lock().await;
        let buffer = self.lifecycle.buffer();
        let mut pushed = 0;
        for (plan_id, pending) in buffer.snapshot() {
            match self.call("add_produced", || remote.add_produced(plan_id, pending.delta)).await {
                Ok(found) => {
                    if !found {
                        warn!(plan_id, delta = pending.delta, "Plan missing remotely, dropping its increment");
                    }
                    self.store.mark_increments_pushed(&pending.unit_ids).await?;
                    buffer.confirm(plan_id, &pending);
                    if found {
                        pushed += pending.delta;
                    }
                }
                Err(e) if e.is_unavailable() => break,
                Err(e) => warn!(plan_id, delta = pending.delta, error = %e, "Increment push failed, kept for next cycle"),
            }
        }

        if pushed > 0 {
            debug!(pushed, "Increments pushed");
        }
        Ok(pushed)
    }

    /// Deliver operator status changes recorded locally
    pub async fn push_statuses(&self) -> Result<usize> {
        let Some(remote) = self.reachable_remote() else {
            return Ok(0);
        };

        let mut delivered = 0;
        for plan in self.store.dirty_plans().await? {
            let update = StatusUpdate {
                plan_id: plan.id,
                part_no: plan.part_no.clone(),
                line: plan.line.clone(),
                work_date: plan.work_date.clone(),
                status: plan.status,
                started_at: plan.started_at,
            };
            match self.call("update_plan_status", || remote.update_plan_status(&update)).await {
                Ok(found) => {
                    if found {
                        delivered += 1;
                    } else {
                        warn!(plan_id = plan.id, part_no = %plan.part_no, line = %plan.line, "Plan not found remotely, status kept local only");
                    }
                    self.store
                        .clear_plan_dirty(plan.id, plan.status, self.clock.now_millis())
                        .await?;
                }
                Err(e) if e.is_unavailable() => break,
                Err(e) => warn!(plan_id = plan.id, error = %e, "Status push failed, will retry"),
            }
        }
        Ok(delivered)
    }

    /// Push pending statuses, then pull and merge today's plans for every line
    pub async fn pull_plans(&self) -> Result<usize> {
        self.push_statuses().await?;

        let Some(remote) = self.reachable_remote() else {
            return Ok(0);
        };

        let work_date = self.lifecycle.work_date();
        let mut pulled = 0;
        let counts = self.plan_counts.lock().await;
        for line in &self.lines {
            match self.call("fetch_plans", || remote.fetch_plans(&work_date, line)).await {
                Ok(plans) => {
                    pulled += plans.len();
                    let report = self.lifecycle.merge_remote(line, &plans).await?;
                    debug!(line = %line, ?report, "Plans merged");
                }
                Err(e) if e.is_unavailable() => return Ok(pulled),
                Err(e) => warn!(line = %line, error = %e, "Plan pull failed"),
            }
        }
        drop(counts);

        match self.call("fetch_cross_refs", || remote.fetch_cross_refs()).await {
            Ok(rows) => {
                let rows: Vec<(String, String)> = rows
                    .into_iter()
                    .map(|(part, sub)| (part.trim().to_uppercase(), sub.trim().to_uppercase()))
                    .filter(|(part, sub)| !part.is_empty() && !sub.is_empty())
                    .collect();
                self.store.replace_cross_refs(&rows, self.clock.now_millis()).await?;
            }
            Err(e) => debug!(error = %e, "Cross-reference refresh skipped"),
        }

        Ok(pulled)
    }

    /// Staging cleanup cycle
    pub async fn cleanup(&self) -> Result<u64> {
        self.pairing.purge_stale().await
    }

    /// Inactivity pause cycle
    pub async fn inactivity(&self) -> Result<usize> {
        Ok(self.lifecycle.check_inactivity().await?.len())
    }

    /// Fixed-time closure cycle
    pub async fn closures(&self) -> Result<usize> {
        Ok(self.lifecycle.run_closures().await?.len())
    }

    /// Start every background loop
    pub fn spawn(self: &Arc<Self>) {
        let cfg = &self.config;
        info!(
            unit_push_secs = cfg.unit_push_interval_secs,
            plan_pull_secs = cfg.plan_pull_interval_secs,
            increment_push_secs = cfg.increment_push_interval_secs,
            remote = self.remote.as_ref().map(|r| r.backend()).unwrap_or("none"),
            "Starting sync coordinator"
        );

        let handles = vec![
            self.spawn_loop("unit_push", cfg.unit_push_interval_secs, |c| async move {
                report("unit_push", c.push_units().await)
            }),
            self.spawn_loop("plan_pull", cfg.plan_pull_interval_secs, |c| async move {
                report("plan_pull", c.pull_plans().await)
            }),
            self.spawn_loop("increment_push", cfg.increment_push_interval_secs, |c| async move {
                report("increment_push", c.push_increments().await)
            }),
            self.spawn_loop("inactivity", cfg.inactivity_check_interval_secs, |c| async move {
                report("inactivity", c.inactivity().await)
            }),
            self.spawn_loop("closures", cfg.closure_poll_interval_secs, |c| async move {
                report("closures", c.closures().await)
            }),
            self.spawn_loop("cleanup", cfg.cleanup_interval_secs, |c| async move {
                report("cleanup", c.cleanup().await)
            }),
        ];

        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend(handles),
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, every_secs: u64, cycle: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut timer = interval(Duration::from_secs(every_secs.max(1)));
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately; startup already did that work
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => cycle(Arc::clone(&this)).await,
                }
            }
            debug!(cycle = name, "Sync loop stopped");
        })
    }

    /// Run push cycles back to back until one pushes nothing
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        for _ in 0..self.config.shutdown_drain_cycles {
            report.cycles += 1;
            let units = self.push_units().await.unwrap_or_else(|e| {
                warn!(error = %e, "Drain unit push failed");
                0
            });
            let increments = self.push_increments().await.unwrap_or_else(|e| {
                warn!(error = %e, "Drain increment push failed");
                0
            });
            if let Err(e) = self.push_statuses().await {
                warn!(error = %e, "Drain status push failed");
            }
            report.units += units;
            report.increments += increments;
            if units == 0 && increments == 0 {
                break;
            }
        }
        report
    }

    /// Stop the loops, then drain what is still pending
    pub async fn shutdown(&self) -> DrainReport {
        self.cancel.cancel();
        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Sync loop ended abnormally");
            }
        }

        let report = self.drain().await;
        info!(
            cycles = report.cycles,
            units = report.units,
            increments = report.increments,
            pending = self.lifecycle.buffer().total(),
            "Sync coordinator stopped"
        );
        report
    }
}

fn report<T: Debug>(cycle: &str, result: Result<T>) {
    match result {
        Ok(outcome) => debug!(cycle, ?outcome, "Cycle finished"),
        Err(e) => error!(cycle, error = %e, "Cycle failed"),
    }
}

//! Station facade
//!
//! [`CounterService`] wires the store, lifecycle manager, pairing engine and
//! sync coordinator together once and exposes the operations a scanner front
//! end or UI needs. Nothing here touches the network except the startup
//! connectivity check and plan pull.

use crate::lifecycle::PlanLifecycle;
use crate::locks::LineLocks;
use crate::model::{CompletionKind, DailyTotal, LineMetrics, PlanItem, PlanStatus, ScanOutcome, StagingStatus};
use crate::normalize::ScanNormalizer;
use crate::pairing::{PairingEngine, RepairReport};
use crate::remote::RemoteStore;
use crate::store::LocalStore;
use crate::sync::{DrainReport, SyncCoordinator};
use chrono::Duration;
use linecount_common::config::StationConfig;
use linecount_common::events::{EventBus, LineEvent};
use linecount_common::{Clock, Result, WorkCalendar};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// What the startup sequence found and fixed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub online: bool,
    pub purged_staging: u64,
    pub cached_plans: usize,
    pub repair: RepairReport,
    pub reconciled: usize,
    pub pending_increments: i64,
}

pub struct CounterService {
    config: StationConfig,
    store: Arc<LocalStore>,
    lifecycle: Arc<PlanLifecycle>,
    pairing: Arc<PairingEngine>,
    coordinator: Arc<SyncCoordinator>,
    normalizer: Arc<dyn ScanNormalizer>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    startup: StartupReport,
}

impl CounterService {
    /// Build every component and run the startup sequence, without starting
    /// the background loops
    pub async fn open(
        config: StationConfig,
        remote: Option<Arc<dyn RemoteStore>>,
        normalizer: Arc<dyn ScanNormalizer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let calendar = WorkCalendar::from_offset_minutes(config.utc_offset_minutes)?;
        let db_path = config.local_db_path();
        let store = Arc::new(LocalStore::open(&db_path, &config.local).await?);

        let events = Arc::new(EventBus::new(EVENT_CAPACITY));
        let locks = Arc::new(LineLocks::new());
        let lifecycle = Arc::new(PlanLifecycle::new(
            store.clone(),
            clock.clone(),
            calendar,
            locks.clone(),
            events.clone(),
            &config.lifecycle,
        )?);
        let pairing = Arc::new(PairingEngine::new(
            store.clone(),
            lifecycle.clone(),
            locks,
            clock.clone(),
            calendar,
            events.clone(),
            config.pairing.clone(),
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            lifecycle.clone(),
            pairing.clone(),
            remote,
            clock.clone(),
            events.clone(),
            config.normalized_lines(),
            config.sync.clone(),
            &config.remote,
        ));

        let mut service = Self {
            config,
            store,
            lifecycle,
            pairing,
            coordinator,
            normalizer,
            events,
            clock,
            startup: StartupReport::default(),
        };
        service.startup = service.run_startup().await?;
        info!(db = %db_path.display(), report = ?service.startup, "Station ready");
        Ok(service)
    }

    /// [`open`](Self::open) plus the background sync loops
    pub async fn start(
        config: StationConfig,
        remote: Option<Arc<dyn RemoteStore>>,
        normalizer: Arc<dyn ScanNormalizer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let service = Self::open(config, remote, normalizer, clock).await?;
        service.coordinator.spawn();
        Ok(service)
    }

    /// Startup sequence:
    /// 1. Connectivity check
    /// 2. Purge expired staging halves
    /// 3. Load cached plans and rebuild the increment buffer from unpushed units
    /// 4. Pull fresh plans when online
    /// 5. Repair half-linked units left by a crash
    /// 6. Complete pairs already sitting in staging
    async fn run_startup(&self) -> Result<StartupReport> {
        let online = self.coordinator.check_connectivity().await;
        let purged_staging = self.pairing.purge_stale().await?;

        let mut cached_plans = self.lifecycle.load().await?;
        self.lifecycle.rebuild_buffer().await?;
        if online {
            if let Err(e) = self.coordinator.pull_plans().await {
                warn!(error = %e, "Initial plan pull failed, using cached plans");
            }
            cached_plans = self
                .config
                .normalized_lines()
                .iter()
                .map(|line| self.lifecycle.plan_for_line(line).len())
                .sum();
        }

        let repair = self.pairing.repair_unlinked().await?;
        if !repair.unmatched.is_empty() {
            warn!(count = repair.unmatched.len(), "Unit halves left permanently unmatched");
        }
        let reconciled = self.pairing.reconcile_staging().await?;
        let pending_increments = self.lifecycle.buffer().total();

        Ok(StartupReport {
            online,
            purged_staging,
            cached_plans,
            repair,
            reconciled,
            pending_increments,
        })
    }

    pub fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn pairing(&self) -> &Arc<PairingEngine> {
        &self.pairing
    }

    pub fn lifecycle(&self) -> &Arc<PlanLifecycle> {
        &self.lifecycle
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Normalize and submit one raw scan
    ///
    /// Never fails: unexpected errors are logged and reported as
    /// [`ScanOutcome::Error`].
    pub async fn submit_scan(&self, raw: &str, line: &str) -> ScanOutcome {
        let now = self.clock.now();
        let scan = match self.normalizer.normalize(raw, line, now) {
            Ok(scan) => scan,
            Err(e) => {
                warn!(line, raw, error = %e, "Scan could not be normalized");
                let outcome = ScanOutcome::Error { reason: e.to_string() };
                self.events.emit_lossy(LineEvent::ScanRejected {
                    line: line.trim().to_uppercase(),
                    part_no: None,
                    reason: outcome.reason_code().to_string(),
                    raw: raw.to_string(),
                    timestamp: now,
                });
                return outcome;
            }
        };

        match self.pairing.submit(scan).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(line, raw, error = %e, "Scan processing failed");
                ScanOutcome::Error { reason: e.to_string() }
            }
        }
    }

    /// Today's totals per part for a line
    ///
    /// Parts with a plan but no completions yet are listed with zero produced.
    pub async fn daily_totals(&self, line: &str) -> Result<Vec<DailyTotal>> {
        let line = line.trim().to_uppercase();
        let work_date = self.lifecycle.work_date();
        let mut totals: BTreeMap<String, DailyTotal> = BTreeMap::new();

        for plan in self.lifecycle.plan_for_line(&line) {
            let entry = totals.entry(plan.part_no.clone()).or_insert_with(|| empty_total(&plan.part_no));
            entry.target += plan.target_count;
            if entry.target_rate == 0 {
                entry.target_rate = plan.target_rate;
            }
        }

        for aggregate in self.store.daily_aggregates(&work_date, &line).await? {
            let entry = totals
                .entry(aggregate.part_no.clone())
                .or_insert_with(|| empty_total(&aggregate.part_no));
            entry.produced = aggregate.produced;
            if aggregate.target_rate > 0 {
                entry.target_rate = aggregate.target_rate;
            }
        }

        let since = (self.clock.now() - Duration::hours(1)).timestamp_millis();
        for (part_no, quantity) in self.store.completed_since(&line, since).await? {
            if let Some(entry) = totals.get_mut(&part_no) {
                entry.rate = quantity;
            }
        }

        Ok(totals.into_values().collect())
    }

    /// Line rollup: planned vs produced, efficiency and units per person-hour
    pub async fn line_metrics(&self, line: &str) -> Result<LineMetrics> {
        let line = line.trim().to_uppercase();
        let totals = self.daily_totals(&line).await?;
        let planned: i64 = totals.iter().map(|t| t.target).sum();
        let produced: i64 = totals.iter().map(|t| t.produced).sum();
        let rate: i64 = totals.iter().map(|t| t.rate).sum();
        let headcount = self.config.lifecycle.headcount.get(&line).copied().unwrap_or(0);

        Ok(LineMetrics {
            efficiency_pct: if planned > 0 {
                produced as f64 * 100.0 / planned as f64
            } else {
                0.0
            },
            units_per_person_hour: if headcount > 0 {
                rate as f64 / headcount as f64
            } else {
                0.0
            },
            line,
            planned,
            produced,
            rate,
            headcount,
        })
    }

    /// Today's plans for a line in sequence order
    pub fn plan_for_line(&self, line: &str) -> Vec<PlanItem> {
        self.lifecycle.plan_for_line(&line.trim().to_uppercase())
    }

    /// Operator status change; pushed to the remote by the next plan cycle
    pub async fn set_plan_status(&self, plan_id: i64, status: PlanStatus) -> Result<()> {
        self.lifecycle.set_plan_status(plan_id, status).await
    }

    /// Pending staging halves per line and format
    pub async fn pending_staging_status(&self) -> Result<Vec<StagingStatus>> {
        self.store.staging_status(self.clock.now_millis()).await
    }

    /// Call `listener(line, part_no, kind)` for every completion, staged half
    /// and rejection until the service shuts down
    pub fn register_completion_listener<F>(&self, listener: F) -> JoinHandle<()>
    where
        F: Fn(&str, &str, CompletionKind) + Send + Sync + 'static,
    {
        let mut rx = self.events.subscribe();
        let cancel = self.coordinator.cancel_token();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(LineEvent::UnitCompleted { line, part_no, .. }) => {
                        listener(&line, &part_no, CompletionKind::UnitCompleted)
                    }
                    Ok(LineEvent::HalfStaged { line, part_no, .. }) => {
                        listener(&line, &part_no, CompletionKind::HalfStaged)
                    }
                    Ok(LineEvent::ScanRejected { line, part_no, .. }) => {
                        listener(&line, part_no.as_deref().unwrap_or_default(), CompletionKind::Rejected)
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Completion listener lagging, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Completion listener stopped");
        })
    }

    /// Stop background loops, drain pending pushes and close the store
    pub async fn shutdown(&self) -> DrainReport {
        let report = self.coordinator.shutdown().await;
        self.store.close().await;
        report
    }
}

fn empty_total(part_no: &str) -> DailyTotal {
    DailyTotal {
        part_no: part_no.to_string(),
        produced: 0,
        target: 0,
        target_rate: 0,
        rate: 0,
    }
}

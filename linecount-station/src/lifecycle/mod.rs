//! Work-Order Lifecycle Manager
//!
//! Per-line state machine over cached plans:
//!
//! ```text
//! PLANNED -> ACTIVE -> PAUSED -> ACTIVE -> CLOSED
//! PLANNED -> CLOSED
//! ```
//!
//! At most one plan per line is ACTIVE; activating one closes the line's other
//! ACTIVE/PAUSED plans. The in-memory plan book mirrors the plan cache table
//! and is what UI reads hit. Produced-count deltas collect in the
//! [`IncrementBuffer`] until the sync coordinator pushes them.

mod buffer;
mod selection;

pub use buffer::{IncrementBuffer, PendingIncrement};
pub use selection::{select_plan, Admission};

use crate::locks::LineLocks;
use crate::model::{PlanItem, PlanStatus, RemotePlan};
use crate::store::{LocalStore, MergeReport};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use linecount_common::config::LifecycleConfig;
use linecount_common::events::{EventBus, LineEvent};
use linecount_common::{Clock, Error, Result, WorkCalendar};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub struct PlanLifecycle {
    store: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    calendar: WorkCalendar,
    locks: Arc<LineLocks>,
    events: Arc<EventBus>,
    inactivity: Option<Duration>,
    closure_times: Vec<NaiveTime>,
    require_plan: bool,
    book: Mutex<HashMap<String, Vec<PlanItem>>>,
    buffer: IncrementBuffer,
    last_closure_poll: Mutex<DateTime<Utc>>,
}

impl PlanLifecycle {
    pub fn new(
        store: Arc<LocalStore>,
        clock: Arc<dyn Clock>,
        calendar: WorkCalendar,
        locks: Arc<LineLocks>,
        events: Arc<EventBus>,
        config: &LifecycleConfig,
    ) -> Result<Self> {
        let now = clock.now();
        Ok(Self {
            store,
            calendar,
            locks,
            events,
            inactivity: (config.inactivity_pause_secs > 0)
                .then(|| Duration::seconds(config.inactivity_pause_secs as i64)),
            closure_times: config.closure_times()?,
            require_plan: config.require_plan,
            book: Mutex::new(HashMap::new()),
            buffer: IncrementBuffer::new(),
            last_closure_poll: Mutex::new(now),
            clock,
        })
    }

    pub fn buffer(&self) -> &IncrementBuffer {
        &self.buffer
    }

    /// Working date the plan book is keyed on
    pub fn work_date(&self) -> String {
        self.calendar.work_date_key(self.clock.now())
    }

    fn book(&self) -> MutexGuard<'_, HashMap<String, Vec<PlanItem>>> {
        match self.book.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Load today's cached plans for every line
    pub async fn load(&self) -> Result<usize> {
        let plans = self.store.load_plans(&self.work_date(), None).await?;
        let count = plans.len();
        let mut by_line: HashMap<String, Vec<PlanItem>> = HashMap::new();
        for plan in plans {
            by_line.entry(plan.line.clone()).or_default().push(plan);
        }
        *self.book() = by_line;
        Ok(count)
    }

    pub async fn reload_line(&self, line: &str) -> Result<()> {
        let plans = self.store.load_plans(&self.work_date(), Some(line)).await?;
        let mut book = self.book();
        if plans.is_empty() {
            book.remove(line);
        } else {
            book.insert(line.to_string(), plans);
        }
        Ok(())
    }

    /// Today's plans for a line in sequence order
    pub fn plan_for_line(&self, line: &str) -> Vec<PlanItem> {
        self.book().get(line).cloned().unwrap_or_default()
    }

    fn find(&self, plan_id: i64) -> Option<PlanItem> {
        self.book()
            .values()
            .flat_map(|plans| plans.iter())
            .find(|p| p.id == plan_id)
            .cloned()
    }

    /// Decide which plan a unit of `part_no` on `line` counts toward
    pub fn admit(&self, line: &str, part_no: &str) -> Admission {
        let book = self.book();
        let plans = book.get(line).map(Vec::as_slice).unwrap_or(&[]);
        select_plan(plans, part_no, self.require_plan)
    }

    /// Apply a completion the store already counted. Caller holds the line lock.
    pub async fn record_completion(
        &self,
        line: &str,
        admission: &Admission,
        unit_id: i64,
        quantity: i64,
    ) -> Result<()> {
        let Admission::Plan { plan_id, activate, .. } = admission else {
            return Ok(());
        };

        self.buffer.add(*plan_id, unit_id, quantity);

        if *activate {
            self.activate_locked(line, *plan_id).await?;
            return Ok(());
        }

        let now = self.clock.now();
        let mut book = self.book();
        if let Some(plan) = book
            .get_mut(line)
            .and_then(|plans| plans.iter_mut().find(|p| p.id == *plan_id))
        {
            plan.produced_count += quantity;
            plan.last_completion_at = Some(now);
        }
        Ok(())
    }

    /// Count a unit linked by startup repair against a plan. Caller holds the line lock.
    pub async fn count_repaired_unit(
        &self,
        line: &str,
        part_no: &str,
        unit_id: i64,
        quantity: i64,
    ) -> Result<Option<i64>> {
        let (plan_id, activate) = match self.admit(line, part_no) {
            Admission::Plan { plan_id, activate, .. } => (plan_id, activate),
            other => {
                debug!(line, part_no, unit_id, admission = ?other, "Repaired unit not counted against a plan");
                return Ok(None);
            }
        };

        self.store
            .apply_increment(plan_id, quantity, &[unit_id], self.clock.now_millis())
            .await?;
        self.buffer.add(plan_id, unit_id, quantity);
        if activate {
            self.activate_locked(line, plan_id).await?;
        } else {
            self.reload_line(line).await?;
        }
        Ok(Some(plan_id))
    }

    async fn activate_locked(&self, line: &str, plan_id: i64) -> Result<()> {
        let before = self.plan_for_line(line);
        let part_no = before
            .iter()
            .find(|p| p.id == plan_id)
            .map(|p| p.part_no.clone())
            .ok_or_else(|| Error::NotFound(format!("plan {}", plan_id)))?;

        let closed = self
            .store
            .activate_plan(plan_id, line, self.clock.now_millis())
            .await?;
        self.reload_line(line).await?;

        info!(line, plan_id, part_no = %part_no, closed = ?closed, "Plan activated");
        self.emit_changes(&before, &self.plan_for_line(line));
        Ok(())
    }

    /// Operator status change: applied locally now, pushed to the remote later
    pub async fn set_plan_status(&self, plan_id: i64, status: PlanStatus) -> Result<()> {
        let line = match self.find(plan_id) {
            Some(plan) => plan.line,
            None => self
                .store
                .plan(plan_id)
                .await?
                .map(|p| p.line)
                .ok_or_else(|| Error::NotFound(format!("plan {}", plan_id)))?,
        };

        let _guard = self.locks.lock(&line).await;
        let current = self
            .store
            .plan(plan_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("plan {}", plan_id)))?;

        if current.status == status {
            return Ok(());
        }
        if !current.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                plan_id,
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        if status == PlanStatus::Active {
            self.reload_line(&line).await?;
            return self.activate_locked(&line, plan_id).await;
        }

        let before = self.plan_for_line(&line);
        self.store
            .set_plan_status(plan_id, status, self.clock.now_millis())
            .await?;
        self.reload_line(&line).await?;
        self.emit_changes(&before, &self.plan_for_line(&line));
        Ok(())
    }

    /// Pause ACTIVE plans without completions for the inactivity window
    pub async fn check_inactivity(&self) -> Result<Vec<i64>> {
        let Some(window) = self.inactivity else {
            return Ok(Vec::new());
        };

        let now = self.clock.now();
        let idle: Vec<(String, i64)> = self
            .book()
            .values()
            .flat_map(|plans| plans.iter())
            .filter(|p| p.status == PlanStatus::Active)
            .filter(|p| {
                p.last_completion_at
                    .or(p.started_at)
                    .is_some_and(|last| now - last >= window)
            })
            .map(|p| (p.line.clone(), p.id))
            .collect();

        let mut paused = Vec::new();
        for (line, plan_id) in idle {
            let _guard = self.locks.lock(&line).await;
            let before = self.plan_for_line(&line);
            let still_idle = before.iter().any(|p| {
                p.id == plan_id
                    && p.status == PlanStatus::Active
                    && p.last_completion_at.or(p.started_at).is_some_and(|last| now - last >= window)
            });
            if !still_idle {
                continue;
            }

            self.store
                .set_plan_status(plan_id, PlanStatus::Paused, now.timestamp_millis())
                .await?;
            self.reload_line(&line).await?;
            info!(line = %line, plan_id, "Plan paused after inactivity");
            self.emit_changes(&before, &self.plan_for_line(&line));
            paused.push(plan_id);
        }
        Ok(paused)
    }

    /// Close ACTIVE/PAUSED plans when a closure checkpoint has passed since the last poll
    pub async fn run_closures(&self) -> Result<Vec<i64>> {
        let now = self.clock.now();
        let since = {
            let mut last = match self.last_closure_poll.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *last, now)
        };

        let crossed = self.calendar.checkpoints_crossed(&self.closure_times, since, now);
        if crossed.is_empty() {
            return Ok(Vec::new());
        }

        let lines: Vec<String> = self.book().keys().cloned().collect();
        let mut closed = Vec::new();
        for line in lines {
            let _guard = self.locks.lock(&line).await;
            let before = self.plan_for_line(&line);
            let open: Vec<i64> = before
                .iter()
                .filter(|p| matches!(p.status, PlanStatus::Active | PlanStatus::Paused))
                .map(|p| p.id)
                .collect();
            if open.is_empty() {
                continue;
            }

            for plan_id in &open {
                self.store
                    .set_plan_status(*plan_id, PlanStatus::Closed, now.timestamp_millis())
                    .await?;
            }
            self.reload_line(&line).await?;
            info!(line = %line, plans = ?open, checkpoint = %crossed[0], "Closed plans at checkpoint");
            self.emit_changes(&before, &self.plan_for_line(&line));
            closed.extend(open);
        }
        Ok(closed)
    }

    /// Merge a line's remote plan definitions into the cache
    pub async fn merge_remote(&self, line: &str, remote: &[RemotePlan]) -> Result<MergeReport> {
        let _guard = self.locks.lock(line).await;
        let before = self.plan_for_line(line);
        let pending = self.buffer.pending_deltas();

        let report = self
            .store
            .merge_remote_plans(&self.work_date(), line, remote, &pending, self.clock.now_millis())
            .await?;
        self.reload_line(line).await?;

        if !report.demoted.is_empty() {
            warn!(line, demoted = ?report.demoted, "More than one ACTIVE plan after pull; extras paused");
        }
        self.emit_changes(&before, &self.plan_for_line(line));
        Ok(report)
    }

    /// Rebuild the increment buffer from units whose increment was never pushed
    pub async fn rebuild_buffer(&self) -> Result<i64> {
        let rows = self.store.unpushed_increments().await?;
        self.buffer.rebuild(&rows);
        Ok(self.buffer.total())
    }

    fn emit_changes(&self, before: &[PlanItem], after: &[PlanItem]) {
        let timestamp = self.clock.now();
        for plan in after {
            let old = before.iter().find(|p| p.id == plan.id).map(|p| p.status);
            if old == Some(plan.status) {
                continue;
            }
            self.events.emit_lossy(LineEvent::PlanStatusChanged {
                line: plan.line.clone(),
                plan_id: plan.id,
                part_no: plan.part_no.clone(),
                old_status: old.map(|s| s.to_string()).unwrap_or_default(),
                new_status: plan.status.to_string(),
                timestamp,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use linecount_common::{ManualClock, RetryPolicy};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn lifecycle(config: LifecycleConfig) -> (PlanLifecycle, Arc<ManualClock>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        linecount_common::db::create_schema(&pool).await.unwrap();
        let store = Arc::new(LocalStore::new(pool, RetryPolicy::default()));
        // 12:00 local on 2025-03-10
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 10, 18, 0, 0).unwrap()));
        let lifecycle = PlanLifecycle::new(
            store,
            clock.clone(),
            WorkCalendar::default(),
            Arc::new(LineLocks::new()),
            Arc::new(EventBus::new(64)),
            &config,
        )
        .unwrap();
        (lifecycle, clock)
    }

    fn remote(id: i64, part: &str, seq: i64, status: PlanStatus, produced: i64) -> RemotePlan {
        RemotePlan {
            id,
            work_date: "2025-03-10".into(),
            line: "M1".into(),
            part_no: part.into(),
            lot_no: String::new(),
            model_code: String::new(),
            target_count: 10,
            produced_count: produced,
            status,
            sequence: seq,
            target_rate: 60,
            started_at: None,
            planned_start: None,
            planned_end: None,
            effective_minutes: 480,
        }
    }

    #[tokio::test]
    async fn test_operator_transitions() {
        let (lc, _) = lifecycle(LifecycleConfig::default()).await;
        lc.merge_remote("M1", &[remote(1, "EBR1", 1, PlanStatus::Planned, 0), remote(2, "EBR2", 2, PlanStatus::Planned, 0)])
            .await
            .unwrap();

        lc.set_plan_status(1, PlanStatus::Active).await.unwrap();
        lc.set_plan_status(2, PlanStatus::Active).await.unwrap();

        let plans = lc.plan_for_line("M1");
        assert_eq!(plans[0].status, PlanStatus::Closed);
        assert_eq!(plans[1].status, PlanStatus::Active);

        let err = lc.set_plan_status(1, PlanStatus::Active).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_merge_keeps_local_active_and_max_produced() {
        let (lc, _) = lifecycle(LifecycleConfig::default()).await;
        lc.merge_remote("M1", &[remote(1, "EBR1", 1, PlanStatus::Planned, 4)]).await.unwrap();
        lc.set_plan_status(1, PlanStatus::Active).await.unwrap();
        lc.store.clear_plan_dirty(1, PlanStatus::Active, 0).await.unwrap();

        // Remote lags behind on both count and status
        lc.merge_remote("M1", &[remote(1, "EBR1", 1, PlanStatus::Planned, 2)]).await.unwrap();
        let plan = &lc.plan_for_line("M1")[0];
        assert_eq!(plan.status, PlanStatus::Active);
        assert_eq!(plan.produced_count, 4);
    }

    #[tokio::test]
    async fn test_merge_leaves_one_active_per_line() {
        let (lc, _) = lifecycle(LifecycleConfig::default()).await;
        lc.merge_remote(
            "M1",
            &[remote(1, "EBR1", 2, PlanStatus::Active, 0), remote(2, "EBR2", 1, PlanStatus::Active, 0)],
        )
        .await
        .unwrap();

        let active: Vec<i64> = lc
            .plan_for_line("M1")
            .iter()
            .filter(|p| p.status == PlanStatus::Active)
            .map(|p| p.id)
            .collect();
        assert_eq!(active, vec![2]);
    }

    #[tokio::test]
    async fn test_inactivity_pauses_active_plan() {
        let config = LifecycleConfig {
            inactivity_pause_secs: 300,
            ..LifecycleConfig::default()
        };
        let (lc, clock) = lifecycle(config).await;
        lc.merge_remote("M1", &[remote(1, "EBR1", 1, PlanStatus::Planned, 0)]).await.unwrap();
        lc.set_plan_status(1, PlanStatus::Active).await.unwrap();

        clock.advance(Duration::seconds(120));
        assert!(lc.check_inactivity().await.unwrap().is_empty());

        clock.advance(Duration::seconds(200));
        assert_eq!(lc.check_inactivity().await.unwrap(), vec![1]);
        assert_eq!(lc.plan_for_line("M1")[0].status, PlanStatus::Paused);
    }

    #[tokio::test]
    async fn test_closure_checkpoint_closes_open_plans() {
        let config = LifecycleConfig {
            closure_checkpoints: vec!["12:30".into()],
            ..LifecycleConfig::default()
        };
        let (lc, clock) = lifecycle(config).await;
        lc.merge_remote("M1", &[remote(1, "EBR1", 1, PlanStatus::Planned, 0), remote(2, "EBR2", 2, PlanStatus::Planned, 0)])
            .await
            .unwrap();
        lc.set_plan_status(1, PlanStatus::Active).await.unwrap();

        clock.advance(Duration::minutes(20));
        assert!(lc.run_closures().await.unwrap().is_empty());

        clock.advance(Duration::minutes(20));
        assert_eq!(lc.run_closures().await.unwrap(), vec![1]);
        let plans = lc.plan_for_line("M1");
        assert_eq!(plans[0].status, PlanStatus::Closed);
        // PLANNED items are left for the next shift
        assert_eq!(plans[1].status, PlanStatus::Planned);
    }
}

//! Shared fixtures for station integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use linecount_common::config::StationConfig;
use linecount_common::ManualClock;
use linecount_station::remote::StatusUpdate;
use linecount_station::store::UnitRecord;
use linecount_station::{
    CounterService, JsonNormalizer, PlanStatus, RemoteError, RemotePlan, RemoteStore, SqliteRemote,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

pub const LINE: &str = "L1";
pub const WORK_DATE: &str = "2025-03-10";

/// 12:00 plant time (UTC-6) on the test working day
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 18, 0, 0).unwrap()
}

pub fn qr(code: &str, part: &str, lot: &str) -> String {
    scan_json(code, "QR", part, lot)
}

pub fn barcode(code: &str, part: &str, lot: &str) -> String {
    scan_json(code, "BARCODE", part, lot)
}

fn scan_json(code: &str, format: &str, part: &str, lot: &str) -> String {
    serde_json::json!({
        "code": code,
        "format": format,
        "part_no": part,
        "lot_no": lot,
        "station": "ST1",
    })
    .to_string()
}

pub fn plan(id: i64, part: &str, sequence: i64, status: PlanStatus, produced: i64, target: i64) -> RemotePlan {
    RemotePlan {
        id,
        work_date: WORK_DATE.into(),
        line: LINE.into(),
        part_no: part.into(),
        lot_no: String::new(),
        model_code: String::new(),
        target_count: target,
        produced_count: produced,
        status,
        sequence,
        target_rate: 60,
        started_at: None,
        planned_start: None,
        planned_end: None,
        effective_minutes: 480,
    }
}

/// Remote store that can be switched off to simulate an outage
pub struct FlakyRemote {
    inner: SqliteRemote,
    online: AtomicBool,
    refused: AtomicUsize,
    hold_increments: AtomicBool,
    increment_applied: Notify,
    release_increment: Notify,
}

impl FlakyRemote {
    pub async fn open(path: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteRemote::open(path).await.unwrap(),
            online: AtomicBool::new(true),
            refused: AtomicUsize::new(0),
            hold_increments: AtomicBool::new(false),
            increment_applied: Notify::new(),
            release_increment: Notify::new(),
        })
    }

    /// Make `add_produced` apply its delta, then wait for [`Self::release_increment`]
    pub fn hold_increments(&self, hold: bool) {
        self.hold_increments.store(hold, Ordering::SeqCst);
    }

    /// Resolves once a held `add_produced` has been applied remotely
    pub async fn increment_applied(&self) {
        self.increment_applied.notified().await;
    }

    pub fn release_increment(&self) {
        self.release_increment.notify_one();
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Calls rejected while offline
    pub fn refused_calls(&self) -> usize {
        self.refused.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &SqliteRemote {
        &self.inner
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            self.refused.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Unavailable("connection refused (injected)".into()))
        }
    }

    pub async fn unit_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM units")
            .fetch_one(self.inner.pool())
            .await
            .unwrap()
    }

    pub async fn daily_produced(&self, part: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(
            "SELECT produced FROM daily_production WHERE work_date = ? AND line = ? AND part_no = ?",
        )
        .bind(WORK_DATE)
        .bind(LINE)
        .bind(part)
        .fetch_optional(self.inner.pool())
        .await
        .unwrap()
        .unwrap_or(0)
    }

    pub async fn plan_produced(&self, plan_id: i64) -> i64 {
        sqlx::query_scalar("SELECT produced_count FROM plans WHERE id = ?")
            .bind(plan_id)
            .fetch_one(self.inner.pool())
            .await
            .unwrap()
    }

    pub async fn plan_status_label(&self, plan_id: i64) -> String {
        sqlx::query_scalar("SELECT status FROM plans WHERE id = ?")
            .bind(plan_id)
            .fetch_one(self.inner.pool())
            .await
            .unwrap()
    }
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    fn backend(&self) -> &'static str {
        "flaky-sqlite"
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.check()?;
        self.inner.ping().await
    }

    async fn insert_unit(&self, unit: &UnitRecord) -> Result<(), RemoteError> {
        self.check()?;
        self.inner.insert_unit(unit).await
    }

    async fn add_daily_production(
        &self,
        work_date: &str,
        line: &str,
        part_no: &str,
        quantity: i64,
        target_rate: i64,
    ) -> Result<(), RemoteError> {
        self.check()?;
        self.inner
            .add_daily_production(work_date, line, part_no, quantity, target_rate)
            .await
    }

    async fn fetch_plans(&self, work_date: &str, line: &str) -> Result<Vec<RemotePlan>, RemoteError> {
        self.check()?;
        self.inner.fetch_plans(work_date, line).await
    }

    async fn add_produced(&self, plan_id: i64, delta: i64) -> Result<bool, RemoteError> {
        self.check()?;
        let found = self.inner.add_produced(plan_id, delta).await?;
        if self.hold_increments.load(Ordering::SeqCst) {
            self.increment_applied.notify_one();
            self.release_increment.notified().await;
        }
        Ok(found)
    }

    async fn update_plan_status(&self, update: &StatusUpdate) -> Result<bool, RemoteError> {
        self.check()?;
        self.inner.update_plan_status(update).await
    }

    async fn fetch_cross_refs(&self) -> Result<Vec<(String, String)>, RemoteError> {
        self.check()?;
        self.inner.fetch_cross_refs().await
    }
}

pub fn config(dir: &Path) -> StationConfig {
    let mut config = StationConfig::default();
    config.lines = vec![LINE.to_string()];
    config.local.db_path = Some(dir.join("station.db"));
    config
}

/// A station on a temp dir with a switchable remote and a manual clock
pub struct Station {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub remote: Arc<FlakyRemote>,
    pub service: CounterService,
}

impl Station {
    /// Remote seeded with `plans` before the station starts
    pub async fn with_plans(plans: &[RemotePlan]) -> Self {
        Self::build(plans, |_| {}).await
    }

    pub async fn build(plans: &[RemotePlan], tweak: impl FnOnce(&mut StationConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let remote = FlakyRemote::open(&dir.path().join("remote.db")).await;
        for plan in plans {
            remote.inner().upsert_plan(plan).await.unwrap();
        }
        let clock = Arc::new(ManualClock::new(start_time()));
        let mut cfg = config(dir.path());
        tweak(&mut cfg);
        let service = open_service(cfg, remote.clone(), clock.clone()).await;
        Self {
            dir,
            clock,
            remote,
            service,
        }
    }

    pub async fn scan(&self, raw: &str) -> linecount_station::ScanOutcome {
        self.service.submit_scan(raw, LINE).await
    }

    /// Shut the running service down and open a fresh one on the same files
    pub async fn restart(self) -> Self {
        self.service.shutdown().await;
        let cfg = self.service.config().clone();
        let service = open_service(cfg, self.remote.clone(), self.clock.clone()).await;
        Self { service, ..self }
    }

    pub async fn produced_today(&self, part: &str) -> i64 {
        self.service
            .daily_totals(LINE)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.part_no == part)
            .map(|t| t.produced)
            .unwrap_or(0)
    }

    pub fn local_plan(&self, plan_id: i64) -> linecount_station::PlanItem {
        self.service
            .plan_for_line(LINE)
            .into_iter()
            .find(|p| p.id == plan_id)
            .unwrap()
    }
}

pub async fn open_service(config: StationConfig, remote: Arc<FlakyRemote>, clock: Arc<ManualClock>) -> CounterService {
    CounterService::open(config, Some(remote as Arc<dyn RemoteStore>), Arc::new(JsonNormalizer), clock)
        .await
        .unwrap()
}

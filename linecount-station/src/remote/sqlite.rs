//! SQLite backend
//!
//! Used by single-box deployments and by tests as a stand-in for the shared
//! MySQL server. Creates its schema on connect.

use super::{plans_from_rows, RemoteError, RemotePlanRow, RemoteStore, StatusUpdate, PLAN_COLUMNS};
use crate::model::RemotePlan;
use crate::store::UnitRecord;
use async_trait::async_trait;
use linecount_common::config::RemoteConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub struct SqliteRemote {
    pool: SqlitePool,
}

impl SqliteRemote {
    /// Open from a `sqlite:` URL, creating the database if needed
    pub async fn connect(url: &str, config: &RemoteConfig) -> Result<Self, RemoteError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| RemoteError::Other(format!("invalid remote url: {}", e)))?;
        Self::with_options(options, config.max_connections, config.connect_timeout()).await
    }

    /// Open a database file
    pub async fn open(path: &Path) -> Result<Self, RemoteError> {
        let options = SqliteConnectOptions::new().filename(path);
        Self::with_options(options, 4, Duration::from_secs(5)).await
    }

    async fn with_options(
        options: SqliteConnectOptions,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(2000));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await?;

        let remote = Self { pool };
        remote.ensure_schema().await?;
        Ok(remote)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn ensure_schema(&self) -> Result<(), RemoteError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS units (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                station_unit_id INTEGER NOT NULL,
                line TEXT NOT NULL,
                part_no TEXT NOT NULL,
                lot_no TEXT NOT NULL DEFAULT '',
                work_date TEXT NOT NULL,
                qr_raw TEXT NOT NULL UNIQUE,
                barcode_raw TEXT NOT NULL,
                station TEXT NOT NULL DEFAULT '',
                quantity INTEGER NOT NULL DEFAULT 1,
                plan_id INTEGER,
                completed_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_production (
                work_date TEXT NOT NULL,
                line TEXT NOT NULL,
                part_no TEXT NOT NULL,
                produced INTEGER NOT NULL DEFAULT 0,
                target_rate INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (work_date, line, part_no)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_date TEXT NOT NULL,
                line TEXT NOT NULL,
                part_no TEXT NOT NULL,
                lot_no TEXT NOT NULL DEFAULT '',
                model_code TEXT NOT NULL DEFAULT '',
                target_count INTEGER NOT NULL DEFAULT 0,
                produced_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'PLAN',
                seq_no INTEGER NOT NULL DEFAULT 0,
                target_rate INTEGER NOT NULL DEFAULT 0,
                started_at_ms INTEGER,
                planned_start TEXT,
                planned_end TEXT,
                effective_minutes INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS part_cross_refs (
                part_no TEXT PRIMARY KEY,
                sub_assy TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace a plan row; the status is written as its remote label
    pub async fn upsert_plan(&self, plan: &RemotePlan) -> Result<(), RemoteError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO plans
                (id, work_date, line, part_no, lot_no, model_code, target_count, produced_count,
                 status, seq_no, target_rate, started_at_ms, planned_start, planned_end, effective_minutes)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(plan.id)
        .bind(&plan.work_date)
        .bind(&plan.line)
        .bind(&plan.part_no)
        .bind(&plan.lot_no)
        .bind(&plan.model_code)
        .bind(plan.target_count)
        .bind(plan.produced_count)
        .bind(plan.status.remote_label())
        .bind(plan.sequence)
        .bind(plan.target_rate)
        .bind(plan.started_at.map(|t| t.timestamp_millis()))
        .bind(&plan.planned_start)
        .bind(&plan.planned_end)
        .bind(plan.effective_minutes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn put_cross_ref(&self, part_no: &str, sub_assy: &str) -> Result<(), RemoteError> {
        sqlx::query("INSERT OR REPLACE INTO part_cross_refs (part_no, sub_assy) VALUES (?, ?)")
            .bind(part_no)
            .bind(sub_assy)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for SqliteRemote {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_unit(&self, unit: &UnitRecord) -> Result<(), RemoteError> {
        sqlx::query(
            r#"
            INSERT INTO units
                (station_unit_id, line, part_no, lot_no, work_date, qr_raw, barcode_raw,
                 station, quantity, plan_id, completed_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(unit.unit_id)
        .bind(&unit.line)
        .bind(&unit.part_no)
        .bind(&unit.lot_no)
        .bind(&unit.work_date)
        .bind(&unit.qr_raw)
        .bind(&unit.barcode_raw)
        .bind(&unit.station)
        .bind(unit.quantity)
        .bind(unit.plan_id)
        .bind(unit.completed_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_daily_production(
        &self,
        work_date: &str,
        line: &str,
        part_no: &str,
        quantity: i64,
        target_rate: i64,
    ) -> Result<(), RemoteError> {
        sqlx::query(
            r#"
            INSERT INTO daily_production (work_date, line, part_no, produced, target_rate)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(work_date, line, part_no) DO UPDATE SET
                produced = produced + excluded.produced,
                target_rate = CASE WHEN excluded.target_rate > 0 THEN excluded.target_rate ELSE target_rate END
            "#,
        )
        .bind(work_date)
        .bind(line)
        .bind(part_no)
        .bind(quantity)
        .bind(target_rate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_plans(&self, work_date: &str, line: &str) -> Result<Vec<RemotePlan>, RemoteError> {
        let sql = format!(
            "SELECT {} FROM plans WHERE work_date = ? AND UPPER(TRIM(line)) = ? ORDER BY seq_no, id",
            PLAN_COLUMNS
        );
        let rows: Vec<RemotePlanRow> = sqlx::query_as(&sql)
            .bind(work_date)
            .bind(line)
            .fetch_all(&self.pool)
            .await?;
        Ok(plans_from_rows(rows))
    }

    async fn add_produced(&self, plan_id: i64, delta: i64) -> Result<bool, RemoteError> {
        if delta <= 0 {
            return Ok(true);
        }
        let result = sqlx::query("UPDATE plans SET produced_count = produced_count + ? WHERE id = ?")
            .bind(delta)
            .bind(plan_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_plan_status(&self, update: &StatusUpdate) -> Result<bool, RemoteError> {
        let mut target: Option<i64> = sqlx::query_scalar("SELECT id FROM plans WHERE id = ?")
            .bind(update.plan_id)
            .fetch_optional(&self.pool)
            .await?;

        if target.is_none() {
            target = sqlx::query_scalar(
                r#"
                SELECT id FROM plans
                WHERE UPPER(TRIM(part_no)) = ? AND UPPER(TRIM(line)) = ? AND work_date = ?
                ORDER BY CASE WHEN status IN ('TERMINADO', 'CLOSED') THEN 1 ELSE 0 END, seq_no, id
                LIMIT 1
                "#,
            )
            .bind(&update.part_no)
            .bind(&update.line)
            .bind(&update.work_date)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(id) = target {
                debug!(plan_id = update.plan_id, resolved_id = id, "Status update matched by part and line");
            }
        }

        let Some(id) = target else {
            return Ok(false);
        };

        sqlx::query("UPDATE plans SET status = ?, started_at_ms = COALESCE(started_at_ms, ?) WHERE id = ?")
            .bind(update.status.remote_label())
            .bind(update.started_at.map(|t| t.timestamp_millis()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn fetch_cross_refs(&self) -> Result<Vec<(String, String)>, RemoteError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT part_no, sub_assy FROM part_cross_refs")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlanStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn plan(id: i64, part: &str, status: PlanStatus) -> RemotePlan {
        RemotePlan {
            id,
            work_date: "2025-03-10".into(),
            line: "M1".into(),
            part_no: part.into(),
            lot_no: String::new(),
            model_code: String::new(),
            target_count: 10,
            produced_count: 0,
            status,
            sequence: id,
            target_rate: 60,
            started_at: None,
            planned_start: None,
            planned_end: None,
            effective_minutes: 480,
        }
    }

    fn unit(id: i64, qr: &str) -> UnitRecord {
        UnitRecord {
            unit_id: id,
            line: "M1".into(),
            part_no: "EBR1".into(),
            lot_no: "L1".into(),
            work_date: "2025-03-10".into(),
            qr_raw: qr.into(),
            barcode_raw: format!("B-{}", qr),
            station: "S1".into(),
            quantity: 1,
            plan_id: None,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_unit_is_reported() {
        let dir = TempDir::new().unwrap();
        let remote = SqliteRemote::open(&dir.path().join("remote.db")).await.unwrap();

        remote.insert_unit(&unit(1, "Q1")).await.unwrap();
        let err = remote.insert_unit(&unit(1, "Q1")).await.unwrap_err();
        assert!(matches!(err, RemoteError::Duplicate));
    }

    #[tokio::test]
    async fn test_status_update_falls_back_to_part_and_line() {
        let dir = TempDir::new().unwrap();
        let remote = SqliteRemote::open(&dir.path().join("remote.db")).await.unwrap();
        remote.upsert_plan(&plan(5, "EBR1", PlanStatus::Planned)).await.unwrap();

        let update = StatusUpdate {
            plan_id: 99,
            part_no: "EBR1".into(),
            line: "M1".into(),
            work_date: "2025-03-10".into(),
            status: PlanStatus::Paused,
            started_at: None,
        };
        assert!(remote.update_plan_status(&update).await.unwrap());

        let plans = remote.fetch_plans("2025-03-10", "M1").await.unwrap();
        assert_eq!(plans[0].status, PlanStatus::Paused);

        let unknown = StatusUpdate {
            part_no: "EBR9".into(),
            ..update
        };
        assert!(!remote.update_plan_status(&unknown).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_produced_reports_missing_plan() {
        let dir = TempDir::new().unwrap();
        let remote = SqliteRemote::open(&dir.path().join("remote.db")).await.unwrap();
        remote.upsert_plan(&plan(1, "EBR1", PlanStatus::Active)).await.unwrap();

        assert!(remote.add_produced(1, 3).await.unwrap());
        assert!(!remote.add_produced(2, 3).await.unwrap());
        assert_eq!(remote.fetch_plans("2025-03-10", "M1").await.unwrap()[0].produced_count, 3);
    }
}

//! MySQL / MariaDB backend

use super::{plans_from_rows, RemoteError, RemotePlanRow, RemoteStore, StatusUpdate, PLAN_COLUMNS};
use crate::model::RemotePlan;
use crate::store::UnitRecord;
use async_trait::async_trait;
use linecount_common::config::RemoteConfig;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub struct MySqlRemote {
    pool: MySqlPool,
}

impl MySqlRemote {
    /// Build a pool without connecting; the first query opens a connection
    pub fn connect_lazy(url: &str, config: &RemoteConfig) -> Result<Self, RemoteError> {
        let options = MySqlConnectOptions::from_str(url)
            .map_err(|e| RemoteError::Other(format!("invalid remote url: {}", e)))?;

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Duration::from_secs(120))
            .max_lifetime(Duration::from_secs(300))
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Create the remote tables if they are missing
    pub async fn ensure_schema(&self) -> Result<(), RemoteError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS units (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                station_unit_id BIGINT NOT NULL,
                line VARCHAR(32) NOT NULL,
                part_no VARCHAR(64) NOT NULL,
                lot_no VARCHAR(64) NOT NULL DEFAULT '',
                work_date VARCHAR(10) NOT NULL,
                qr_raw VARCHAR(255) NOT NULL,
                barcode_raw VARCHAR(255) NOT NULL,
                station VARCHAR(64) NOT NULL DEFAULT '',
                quantity BIGINT NOT NULL DEFAULT 1,
                plan_id BIGINT NULL,
                completed_at_ms BIGINT NOT NULL,
                UNIQUE KEY uq_units_qr (qr_raw),
                KEY idx_units_day (work_date, line)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_production (
                work_date VARCHAR(10) NOT NULL,
                line VARCHAR(32) NOT NULL,
                part_no VARCHAR(64) NOT NULL,
                produced BIGINT NOT NULL DEFAULT 0,
                target_rate BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (work_date, line, part_no)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                work_date VARCHAR(10) NOT NULL,
                line VARCHAR(32) NOT NULL,
                part_no VARCHAR(64) NOT NULL,
                lot_no VARCHAR(64) NOT NULL DEFAULT '',
                model_code VARCHAR(64) NOT NULL DEFAULT '',
                target_count BIGINT NOT NULL DEFAULT 0,
                produced_count BIGINT NOT NULL DEFAULT 0,
                status VARCHAR(32) NOT NULL DEFAULT 'PLAN',
                seq_no BIGINT NOT NULL DEFAULT 0,
                target_rate BIGINT NOT NULL DEFAULT 0,
                started_at_ms BIGINT NULL,
                planned_start VARCHAR(8) NULL,
                planned_end VARCHAR(8) NULL,
                effective_minutes BIGINT NOT NULL DEFAULT 0,
                KEY idx_plans_day (work_date, line)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS part_cross_refs (
                part_no VARCHAR(64) PRIMARY KEY,
                sub_assy VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MySqlRemote {
    fn backend(&self) -> &'static str {
        "mysql"
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
            ON DUPLICATE KEY UPDATE
                produced = produced + VALUES(produced),
                target_rate = IF(VALUES(target_rate) > 0, VALUES(target_rate), target_rate)
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

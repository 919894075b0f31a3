//! Remote Store access
//!
//! The remote database is the authoritative backend shared by every station.
//! It may be unreachable for long periods; callers only reach it from sync
//! cycles and treat [`RemoteError::Unavailable`] as a signal to go offline.

mod mysql;
mod sqlite;

pub use mysql::MySqlRemote;
pub use sqlite::SqliteRemote;

use crate::model::{PlanStatus, RemotePlan};
use crate::store::UnitRecord;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use linecount_common::config::RemoteConfig;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Remote store failures, classified for the sync coordinator
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection could not be made or was lost
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// Record already present remotely
    #[error("duplicate record")]
    Duplicate,

    /// Lock wait or deadlock; worth retrying
    #[error("transient remote error: {0}")]
    Transient(String),

    /// Referenced row missing or unreadable
    #[error("remote data integrity: {0}")]
    Integrity(String),

    #[error("remote error: {0}")]
    Other(String),
}

impl RemoteError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

impl From<sqlx::Error> for RemoteError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(e) => RemoteError::Unavailable(e.to_string()),
            sqlx::Error::Tls(e) => RemoteError::Unavailable(e.to_string()),
            sqlx::Error::Protocol(e) => RemoteError::Unavailable(e),
            sqlx::Error::PoolTimedOut => RemoteError::Unavailable("connection pool timed out".into()),
            sqlx::Error::PoolClosed => RemoteError::Unavailable("connection pool closed".into()),
            sqlx::Error::WorkerCrashed => RemoteError::Unavailable("database worker crashed".into()),
            sqlx::Error::Database(db) if db.is_unique_violation() => RemoteError::Duplicate,
            sqlx::Error::Database(db) => {
                // MySQL lock wait timeout / deadlock, SQLite busy / locked
                let transient = matches!(db.code().as_deref(), Some("1205") | Some("1213") | Some("5") | Some("6"))
                    || db.message().contains("database is locked");
                if transient {
                    RemoteError::Transient(db.message().to_string())
                } else {
                    RemoteError::Other(db.message().to_string())
                }
            }
            sqlx::Error::RowNotFound => RemoteError::Integrity("row not found".into()),
            e @ (sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) => {
                RemoteError::Integrity(e.to_string())
            }
            other => RemoteError::Other(other.to_string()),
        }
    }
}

/// Operations the station needs from the remote backend
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<(), RemoteError>;

    /// Insert a completed unit; `Duplicate` when it is already there
    async fn insert_unit(&self, unit: &UnitRecord) -> Result<(), RemoteError>;

    /// Add to the per-day production total of a part on a line
    async fn add_daily_production(
        &self,
        work_date: &str,
        line: &str,
        part_no: &str,
        quantity: i64,
        target_rate: i64,
    ) -> Result<(), RemoteError>;

    /// The day's plans for a line, cancelled rows dropped
    async fn fetch_plans(&self, work_date: &str, line: &str) -> Result<Vec<RemotePlan>, RemoteError>;

    /// Add to a plan's produced_count; false when the plan does not exist
    async fn add_produced(&self, plan_id: i64, delta: i64) -> Result<bool, RemoteError>;

    /// Push a status change; falls back to (part_no, line, work_date) when the
    /// id is unknown. False when neither lookup finds a plan.
    async fn update_plan_status(&self, update: &StatusUpdate) -> Result<bool, RemoteError>;

    /// part_no -> sub-assembly part_no
    async fn fetch_cross_refs(&self) -> Result<Vec<(String, String)>, RemoteError>;
}

/// A local status change to deliver remotely
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub plan_id: i64,
    pub part_no: String,
    pub line: String,
    pub work_date: String,
    pub status: PlanStatus,
    pub started_at: Option<DateTime<Utc>>,
}

/// Build the remote store named by the configured URL
///
/// Returns `None` when no URL is configured. MySQL pools connect lazily so
/// an unreachable backend never blocks startup.
pub async fn connect(config: &RemoteConfig) -> Result<Option<Arc<dyn RemoteStore>>, RemoteError> {
    let Some(url) = config.url.as_deref() else {
        return Ok(None);
    };

    if url.starts_with("mysql://") || url.starts_with("mariadb://") {
        let remote = MySqlRemote::connect_lazy(url, config)?;
        return Ok(Some(Arc::new(remote)));
    }
    if url.starts_with("sqlite:") {
        let remote = SqliteRemote::connect(url, config).await?;
        return Ok(Some(Arc::new(remote)));
    }
    Err(RemoteError::Other(format!("unsupported remote url scheme: {}", url)))
}

/// Plan row as stored remotely; shared by both backends
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RemotePlanRow {
    id: i64,
    work_date: String,
    line: String,
    part_no: String,
    lot_no: String,
    model_code: String,
    target_count: i64,
    produced_count: i64,
    status: String,
    seq_no: i64,
    target_rate: i64,
    started_at_ms: Option<i64>,
    planned_start: Option<String>,
    planned_end: Option<String>,
    effective_minutes: i64,
}

pub(crate) const PLAN_COLUMNS: &str = "id, work_date, line, part_no, lot_no, model_code, target_count, \
     produced_count, status, seq_no, target_rate, started_at_ms, planned_start, planned_end, effective_minutes";

/// Convert fetched rows, dropping cancelled and unreadable statuses
pub(crate) fn plans_from_rows(rows: Vec<RemotePlanRow>) -> Vec<RemotePlan> {
    rows.into_iter()
        .filter_map(|row| {
            if PlanStatus::is_cancelled_label(&row.status) {
                return None;
            }
            let Some(status) = PlanStatus::from_label(&row.status) else {
                warn!(plan_id = row.id, status = %row.status, "Skipping remote plan with unknown status");
                return None;
            };
            Some(RemotePlan {
                id: row.id,
                work_date: row.work_date,
                line: row.line.trim().to_uppercase(),
                part_no: row.part_no.trim().to_uppercase(),
                lot_no: row.lot_no,
                model_code: row.model_code,
                target_count: row.target_count,
                produced_count: row.produced_count,
                status,
                sequence: row.seq_no,
                target_rate: row.target_rate,
                started_at: row.started_at_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                planned_start: row.planned_start,
                planned_end: row.planned_end,
                effective_minutes: row.effective_minutes,
            })
        })
        .collect()
}

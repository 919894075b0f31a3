//! Plan cache: the remote plan table mirrored locally, plus local overrides
//!
//! `produced_count` only ever grows here. `status_dirty` marks a status the
//! remote store has not been told about yet.

use crate::model::{PlanItem, PlanStatus, RemotePlan};
use chrono::{TimeZone, Utc};
use linecount_common::{Error, Result};
use sqlx::{FromRow, SqliteConnection};
use std::collections::HashMap;

#[derive(FromRow)]
struct PlanRow {
    id: i64,
    work_date: String,
    line: String,
    part_no: String,
    lot_no: String,
    model_code: String,
    target_count: i64,
    produced_count: i64,
    status: String,
    sequence: i64,
    target_rate: i64,
    started_at_ms: Option<i64>,
    planned_start: Option<String>,
    planned_end: Option<String>,
    effective_minutes: i64,
    last_completion_ms: Option<i64>,
    status_dirty: bool,
}

fn millis_to_utc(ms: Option<i64>) -> Option<chrono::DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

impl PlanRow {
    fn into_item(self) -> Result<(PlanItem, bool)> {
        let status = PlanStatus::from_label(&self.status)
            .ok_or_else(|| Error::Internal(format!("plan {} has unknown status {}", self.id, self.status)))?;
        Ok((
            PlanItem {
                id: self.id,
                work_date: self.work_date,
                line: self.line,
                part_no: self.part_no,
                lot_no: self.lot_no,
                model_code: self.model_code,
                target_count: self.target_count,
                produced_count: self.produced_count,
                status,
                sequence: self.sequence,
                target_rate: self.target_rate,
                started_at: millis_to_utc(self.started_at_ms),
                planned_start: self.planned_start,
                planned_end: self.planned_end,
                effective_minutes: self.effective_minutes,
                last_completion_at: millis_to_utc(self.last_completion_ms),
            },
            self.status_dirty,
        ))
    }
}

const PLAN_COLUMNS: &str = "id, work_date, line, part_no, lot_no, model_code, target_count, produced_count, \
     status, sequence, target_rate, started_at_ms, planned_start, planned_end, effective_minutes, \
     last_completion_ms, status_dirty";

/// Outcome of merging one line's remote plans into the cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub updated: usize,
    pub removed: u64,
    /// Rows whose local status was kept over the remote one
    pub kept_local_status: usize,
    /// Extra ACTIVE rows demoted to PAUSED
    pub demoted: Vec<i64>,
}

pub(crate) async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Option<(PlanItem, bool)>> {
    let sql = format!("SELECT {PLAN_COLUMNS} FROM plan_cache WHERE id = ?");
    let row: Option<PlanRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.map(PlanRow::into_item).transpose()
}

/// Plans for a working date, optionally one line, in line/sequence order
pub(crate) async fn load(
    conn: &mut SqliteConnection,
    work_date: &str,
    line: Option<&str>,
) -> Result<Vec<PlanItem>> {
    let sql = format!(
        "SELECT {PLAN_COLUMNS} FROM plan_cache WHERE work_date = ? AND (? IS NULL OR line = ?) \
         ORDER BY line, sequence, id"
    );
    let rows: Vec<PlanRow> = sqlx::query_as(&sql)
        .bind(work_date)
        .bind(line)
        .bind(line)
        .fetch_all(&mut *conn)
        .await?;

    rows.into_iter().map(|r| r.into_item().map(|(item, _)| item)).collect()
}

pub(crate) async fn dirty(conn: &mut SqliteConnection) -> Result<Vec<PlanItem>> {
    let sql = format!("SELECT {PLAN_COLUMNS} FROM plan_cache WHERE status_dirty = 1 ORDER BY id");
    let rows: Vec<PlanRow> = sqlx::query_as(&sql).fetch_all(&mut *conn).await?;
    rows.into_iter().map(|r| r.into_item().map(|(item, _)| item)).collect()
}

/// Clear the dirty flag if the status is still the one that was pushed
pub(crate) async fn clear_dirty(
    conn: &mut SqliteConnection,
    id: i64,
    pushed: PlanStatus,
    now_ms: i64,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE plan_cache SET status_dirty = 0, synced_at_ms = ? WHERE id = ? AND status = ?",
    )
    .bind(now_ms)
    .bind(id)
    .bind(pushed.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Add to produced_count; returns the new value
pub(crate) async fn add_produced(
    conn: &mut SqliteConnection,
    id: i64,
    delta: i64,
    completed_at_ms: Option<i64>,
    now_ms: i64,
) -> Result<i64> {
    let produced: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE plan_cache
        SET produced_count = produced_count + ?,
            last_completion_ms = COALESCE(?, last_completion_ms),
            updated_at_ms = ?
        WHERE id = ?
        RETURNING produced_count
        "#,
    )
    .bind(delta.max(0))
    .bind(completed_at_ms)
    .bind(now_ms)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    produced.ok_or_else(|| Error::NotFound(format!("plan {}", id)))
}

/// Set a status locally and flag it for the remote push
pub(crate) async fn set_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: PlanStatus,
    now_ms: i64,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE plan_cache
        SET status = ?,
            started_at_ms = CASE WHEN ? THEN COALESCE(started_at_ms, ?) ELSE started_at_ms END,
            status_dirty = 1,
            updated_at_ms = ?
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(status == PlanStatus::Active)
    .bind(now_ms)
    .bind(now_ms)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("plan {}", id)));
    }
    Ok(())
}

/// Close every ACTIVE/PAUSED plan on the line except `keep_id`
pub(crate) async fn close_open_except(
    conn: &mut SqliteConnection,
    line: &str,
    keep_id: i64,
    now_ms: i64,
) -> Result<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        UPDATE plan_cache
        SET status = 'CLOSED', status_dirty = 1, updated_at_ms = ?
        WHERE line = ? AND id != ? AND status IN ('ACTIVE', 'PAUSED')
        RETURNING id
        "#,
    )
    .bind(now_ms)
    .bind(line)
    .bind(keep_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

/// Merge one line's remote plans for a working date
///
/// - produced_count = max(local, remote + pending local delta)
/// - a dirty local status, or a local ACTIVE the remote disagrees with, is kept
/// - rows gone from the remote (and not dirty) and rows of other dates are dropped
/// - afterwards at most one ACTIVE survives: the previously active one, else the lowest sequence
pub(crate) async fn merge_remote(
    conn: &mut SqliteConnection,
    work_date: &str,
    line: &str,
    remote: &[RemotePlan],
    pending: &HashMap<i64, i64>,
    now_ms: i64,
) -> Result<MergeReport> {
    let mut report = MergeReport::default();

    let previously_active: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM plan_cache WHERE line = ? AND status = 'ACTIVE' ORDER BY sequence, id LIMIT 1",
    )
    .bind(line)
    .fetch_optional(&mut *conn)
    .await?;

    report.removed += sqlx::query("DELETE FROM plan_cache WHERE line = ? AND work_date != ?")
        .bind(line)
        .bind(work_date)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    for plan in remote {
        let pending_delta = pending.get(&plan.id).copied().unwrap_or(0);
        let remote_total = plan.produced_count + pending_delta;

        match get(conn, plan.id).await? {
            None => {
                insert(conn, plan, remote_total, now_ms).await?;
                report.inserted += 1;
            }
            Some((local, dirty)) => {
                let produced = local.produced_count.max(remote_total);
                let keep_local =
                    dirty || (local.status == PlanStatus::Active && plan.status != PlanStatus::Active);
                let status = if keep_local { local.status } else { plan.status };
                if keep_local && local.status != plan.status {
                    report.kept_local_status += 1;
                }

                sqlx::query(
                    r#"
                    UPDATE plan_cache SET
                        work_date = ?, line = ?, part_no = ?, lot_no = ?, model_code = ?,
                        target_count = ?, produced_count = ?, status = ?, sequence = ?,
                        target_rate = ?, started_at_ms = COALESCE(started_at_ms, ?),
                        planned_start = ?, planned_end = ?, effective_minutes = ?,
                        updated_at_ms = ?, synced_at_ms = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&plan.work_date)
                .bind(&plan.line)
                .bind(&plan.part_no)
                .bind(&plan.lot_no)
                .bind(&plan.model_code)
                .bind(plan.target_count)
                .bind(produced)
                .bind(status.as_str())
                .bind(plan.sequence)
                .bind(plan.target_rate)
                .bind(plan.started_at.map(|t| t.timestamp_millis()))
                .bind(&plan.planned_start)
                .bind(&plan.planned_end)
                .bind(plan.effective_minutes)
                .bind(now_ms)
                .bind(now_ms)
                .bind(plan.id)
                .execute(&mut *conn)
                .await?;
                report.updated += 1;
            }
        }
    }

    report.removed += remove_missing(conn, work_date, line, remote).await?;

    let actives: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM plan_cache
        WHERE line = ? AND work_date = ? AND status = 'ACTIVE'
        ORDER BY CASE WHEN id = ? THEN 0 ELSE 1 END, sequence, id
        "#,
    )
    .bind(line)
    .bind(work_date)
    .bind(previously_active.unwrap_or(-1))
    .fetch_all(&mut *conn)
    .await?;

    for id in actives.into_iter().skip(1) {
        set_status(conn, id, PlanStatus::Paused, now_ms).await?;
        report.demoted.push(id);
    }

    Ok(report)
}

async fn insert(conn: &mut SqliteConnection, plan: &RemotePlan, produced: i64, now_ms: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO plan_cache
            (id, work_date, line, part_no, lot_no, model_code, target_count, produced_count,
             status, sequence, target_rate, started_at_ms, planned_start, planned_end,
             effective_minutes, status_dirty, updated_at_ms, synced_at_ms)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(plan.id)
    .bind(&plan.work_date)
    .bind(&plan.line)
    .bind(&plan.part_no)
    .bind(&plan.lot_no)
    .bind(&plan.model_code)
    .bind(plan.target_count)
    .bind(produced)
    .bind(plan.status.as_str())
    .bind(plan.sequence)
    .bind(plan.target_rate)
    .bind(plan.started_at.map(|t| t.timestamp_millis()))
    .bind(&plan.planned_start)
    .bind(&plan.planned_end)
    .bind(plan.effective_minutes)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn remove_missing(
    conn: &mut SqliteConnection,
    work_date: &str,
    line: &str,
    remote: &[RemotePlan],
) -> Result<u64> {
    let mut sql = String::from(
        "DELETE FROM plan_cache WHERE line = ? AND work_date = ? AND status_dirty = 0",
    );
    if !remote.is_empty() {
        let placeholders = vec!["?"; remote.len()].join(", ");
        sql.push_str(&format!(" AND id NOT IN ({})", placeholders));
    }

    let mut query = sqlx::query(&sql).bind(line).bind(work_date);
    for plan in remote {
        query = query.bind(plan.id);
    }
    Ok(query.execute(&mut *conn).await?.rows_affected())
}

//! Staging area: halves waiting for their complementary format

use crate::model::{ScanEvent, ScanFormat, StagingStatus};
use chrono::{TimeZone, Utc};
use linecount_common::{Error, Result};
use sqlx::{FromRow, SqliteConnection};

/// A staged half
#[derive(Debug, Clone, PartialEq)]
pub struct StagingHalf {
    pub id: i64,
    pub raw: String,
    pub format: ScanFormat,
    pub part_no: String,
    pub lot_no: String,
    pub sequence: String,
    pub station: String,
    pub line: String,
    pub quantity: i64,
    pub scanned_at_ms: i64,
    pub created_at_ms: i64,
}

impl StagingHalf {
    /// Back to the scan it was staged from
    pub fn to_scan_event(&self) -> ScanEvent {
        ScanEvent {
            raw: self.raw.clone(),
            format: self.format,
            part_no: self.part_no.clone(),
            lot_no: self.lot_no.clone(),
            sequence: self.sequence.clone(),
            station: self.station.clone(),
            line: self.line.clone(),
            quantity: self.quantity,
            scanned_at: Utc
                .timestamp_millis_opt(self.scanned_at_ms)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

#[derive(FromRow)]
struct StagingRow {
    id: i64,
    raw: String,
    format: String,
    part_no: String,
    lot_no: String,
    sequence: String,
    station: String,
    line: String,
    quantity: i64,
    scanned_at_ms: i64,
    created_at_ms: i64,
}

impl TryFrom<StagingRow> for StagingHalf {
    type Error = Error;

    fn try_from(row: StagingRow) -> Result<Self> {
        Ok(StagingHalf {
            id: row.id,
            raw: row.raw,
            format: row.format.parse().map_err(Error::Internal)?,
            part_no: row.part_no,
            lot_no: row.lot_no,
            sequence: row.sequence,
            station: row.station,
            line: row.line,
            quantity: row.quantity,
            scanned_at_ms: row.scanned_at_ms,
            created_at_ms: row.created_at_ms,
        })
    }
}

const STAGING_COLUMNS: &str = "id, raw, format, part_no, lot_no, sequence, station, line, quantity, scanned_at_ms, created_at_ms";

/// Plan-switch watermark for one line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermark {
    pub staging_id: i64,
    /// Plan the line switched to; None before the first planned scan
    pub plan_id: Option<i64>,
    pub part_no: String,
}

/// Which staged halves a search may return
#[derive(Debug, Clone)]
pub struct MatchCriteria<'a> {
    pub line: &'a str,
    /// None matches any part on the line
    pub part_no: Option<&'a str>,
    /// None ignores lots; an empty staged lot always matches
    pub lot_no: Option<&'a str>,
    /// Format being searched for
    pub format: ScanFormat,
    /// Oldest `created_at_ms` still eligible
    pub not_before_ms: i64,
    pub watermark: &'a Watermark,
}

pub(crate) async fn insert(conn: &mut SqliteConnection, scan: &ScanEvent, created_at_ms: i64) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO staging_halves
            (raw, format, part_no, lot_no, sequence, station, line, quantity, scanned_at_ms, created_at_ms)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&scan.raw)
    .bind(scan.format.as_str())
    .bind(&scan.part_no)
    .bind(&scan.lot_no)
    .bind(&scan.sequence)
    .bind(&scan.station)
    .bind(&scan.line)
    .bind(scan.quantity)
    .bind(scan.scanned_at.timestamp_millis())
    .bind(created_at_ms)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Oldest eligible half matching the criteria
pub(crate) async fn find_match(
    conn: &mut SqliteConnection,
    criteria: &MatchCriteria<'_>,
) -> Result<Option<StagingHalf>> {
    let sql = format!(
        r#"
        SELECT {STAGING_COLUMNS} FROM staging_halves
        WHERE line = ?
          AND format = ?
          AND (? IS NULL OR part_no = ?)
          AND (? IS NULL OR lot_no = '' OR lot_no = ?)
          AND created_at_ms >= ?
          AND id > ?
        ORDER BY id ASC
        LIMIT 1
        "#
    );

    let row: Option<StagingRow> = sqlx::query_as(&sql)
        .bind(criteria.line)
        .bind(criteria.format.as_str())
        .bind(criteria.part_no)
        .bind(criteria.part_no)
        .bind(criteria.lot_no)
        .bind(criteria.lot_no)
        .bind(criteria.not_before_ms)
        .bind(criteria.watermark.staging_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(StagingHalf::try_from).transpose()
}

/// Raw code already staged or already part of a completed unit
pub(crate) async fn raw_exists(conn: &mut SqliteConnection, format: ScanFormat, raw: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(SELECT 1 FROM staging_halves WHERE format = ?1 AND raw = ?2)
            OR EXISTS(SELECT 1 FROM unit_halves WHERE format = ?1 AND raw = ?2)
        "#,
    )
    .bind(format.as_str())
    .bind(raw)
    .fetch_one(&mut *conn)
    .await?;

    Ok(exists)
}

pub(crate) async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM staging_halves WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Drop halves created before the cutoff (all lines when `line` is None)
pub(crate) async fn purge_older_than(
    conn: &mut SqliteConnection,
    line: Option<&str>,
    cutoff_ms: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM staging_halves WHERE created_at_ms < ? AND (? IS NULL OR line = ?)",
    )
    .bind(cutoff_ms)
    .bind(line)
    .bind(line)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Highest staging id ever allocated
pub(crate) async fn max_id(conn: &mut SqliteConnection) -> Result<i64> {
    let seq: Option<i64> = sqlx::query_scalar("SELECT seq FROM sqlite_sequence WHERE name = 'staging_halves'")
        .fetch_optional(&mut *conn)
        .await?;
    Ok(seq.unwrap_or(0))
}

/// Pending counts and oldest age per line and format
pub(crate) async fn status(conn: &mut SqliteConnection, now_ms: i64) -> Result<Vec<StagingStatus>> {
    let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
        r#"
        SELECT line, format, COUNT(*), MIN(created_at_ms)
        FROM staging_halves
        GROUP BY line, format
        ORDER BY line, format
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(line, format, pending, oldest_ms)| {
            Ok(StagingStatus {
                line,
                format: format.parse().map_err(Error::Internal)?,
                pending,
                oldest_age_secs: ((now_ms - oldest_ms) / 1000).max(0),
            })
        })
        .collect()
}

/// (part_no, line) pairs that have both formats staged
pub(crate) async fn reconcilable(conn: &mut SqliteConnection) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT part_no, line FROM staging_halves
        GROUP BY part_no, line
        HAVING COUNT(DISTINCT format) = 2
        ORDER BY line, part_no
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

/// Oldest staged half of a format for a part on a line
pub(crate) async fn oldest_for(
    conn: &mut SqliteConnection,
    line: &str,
    part_no: &str,
    format: ScanFormat,
    not_before_ms: i64,
    watermark: &Watermark,
) -> Result<Option<StagingHalf>> {
    let criteria = MatchCriteria {
        line,
        part_no: Some(part_no),
        lot_no: None,
        format,
        not_before_ms,
        watermark,
    };
    find_match(conn, &criteria).await
}

pub(crate) async fn watermark(conn: &mut SqliteConnection, line: &str) -> Result<Watermark> {
    let row: Option<(i64, Option<i64>, String)> = sqlx::query_as(
        "SELECT staging_id, plan_id, part_no FROM line_watermarks WHERE line = ?",
    )
    .bind(line)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row
        .map(|(staging_id, plan_id, part_no)| Watermark {
            staging_id,
            plan_id,
            part_no,
        })
        .unwrap_or_default())
}

pub(crate) async fn set_watermark(
    conn: &mut SqliteConnection,
    line: &str,
    watermark: &Watermark,
    now_ms: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO line_watermarks (line, staging_id, part_no, plan_id, updated_at_ms)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(line) DO UPDATE SET
            staging_id = excluded.staging_id,
            part_no = excluded.part_no,
            plan_id = excluded.plan_id,
            updated_at_ms = excluded.updated_at_ms
        "#,
    )
    .bind(line)
    .bind(watermark.staging_id)
    .bind(&watermark.part_no)
    .bind(watermark.plan_id)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

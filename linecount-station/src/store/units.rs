//! Completed units: two linked halves per unit

use crate::model::{ScanEvent, ScanFormat};
use chrono::{DateTime, TimeZone, Utc};
use linecount_common::{Error, Result};
use sqlx::{FromRow, SqliteConnection};

/// Everything needed to persist one completed unit
#[derive(Debug, Clone)]
pub struct NewUnit<'a> {
    /// Half that carries the unit bookkeeping
    pub primary: &'a ScanEvent,
    pub secondary: &'a ScanEvent,
    /// Secondary half is a placeholder (solo mode)
    pub secondary_synthetic: bool,
    /// Part number the unit counts toward
    pub part_no: &'a str,
    pub work_date: &'a str,
    pub plan_id: Option<i64>,
    pub target_rate: i64,
    pub completed_at_ms: i64,
}

/// A completed unit as pushed to the remote store
#[derive(Debug, Clone, PartialEq)]
pub struct UnitRecord {
    pub unit_id: i64,
    pub line: String,
    pub part_no: String,
    pub lot_no: String,
    pub work_date: String,
    pub qr_raw: String,
    pub barcode_raw: String,
    pub station: String,
    pub quantity: i64,
    pub plan_id: Option<i64>,
    pub completed_at: DateTime<Utc>,
}

/// A half whose partner link is missing
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct UnlinkedHalf {
    pub id: i64,
    pub raw: String,
    pub format: String,
    pub part_no: String,
    pub lot_no: String,
    pub line: String,
    pub quantity: i64,
    pub work_date: String,
    pub scanned_at_ms: i64,
}

impl UnlinkedHalf {
    pub fn scan_format(&self) -> Result<ScanFormat> {
        self.format.parse().map_err(Error::Internal)
    }
}

async fn insert_half(
    conn: &mut SqliteConnection,
    scan: &ScanEvent,
    unit: &NewUnit<'_>,
    is_primary: bool,
    synthetic: bool,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO unit_halves
            (raw, format, part_no, scanned_part_no, lot_no, sequence, station, line, quantity,
             work_date, scanned_at_ms, completed_at_ms, is_primary, synthetic, plan_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&scan.raw)
    .bind(scan.format.as_str())
    .bind(unit.part_no)
    .bind(&scan.part_no)
    .bind(&scan.lot_no)
    .bind(&scan.sequence)
    .bind(&scan.station)
    .bind(&scan.line)
    .bind(scan.quantity)
    .bind(unit.work_date)
    .bind(scan.scanned_at.timestamp_millis())
    .bind(unit.completed_at_ms)
    .bind(is_primary)
    .bind(synthetic)
    .bind(if is_primary { unit.plan_id } else { None })
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Insert both halves and link them; returns the unit id (primary half id)
pub(crate) async fn insert_pair(conn: &mut SqliteConnection, unit: &NewUnit<'_>) -> Result<i64> {
    let primary_id = insert_half(conn, unit.primary, unit, true, false).await?;
    let secondary_id = insert_half(conn, unit.secondary, unit, false, unit.secondary_synthetic).await?;
    link(conn, primary_id, secondary_id).await?;
    Ok(primary_id)
}

async fn link(conn: &mut SqliteConnection, primary_id: i64, secondary_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE unit_halves
        SET linked_scan_id = CASE id WHEN ?1 THEN ?2 ELSE ?1 END,
            is_primary = CASE id WHEN ?1 THEN 1 ELSE 0 END
        WHERE id IN (?1, ?2)
        "#,
    )
    .bind(primary_id)
    .bind(secondary_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Link two halves left unlinked; false when either was linked meanwhile
pub(crate) async fn link_unlinked(
    conn: &mut SqliteConnection,
    primary_id: i64,
    secondary_id: i64,
    completed_at_ms: i64,
) -> Result<bool> {
    let unlinked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM unit_halves WHERE id IN (?, ?) AND linked_scan_id IS NULL",
    )
    .bind(primary_id)
    .bind(secondary_id)
    .fetch_one(&mut *conn)
    .await?;

    if unlinked != 2 {
        return Ok(false);
    }

    link(conn, primary_id, secondary_id).await?;
    sqlx::query(
        "UPDATE unit_halves SET completed_at_ms = COALESCE(completed_at_ms, ?) WHERE id IN (?, ?)",
    )
    .bind(completed_at_ms)
    .bind(primary_id)
    .bind(secondary_id)
    .execute(&mut *conn)
    .await?;

    Ok(true)
}

pub(crate) async fn unlinked(conn: &mut SqliteConnection) -> Result<Vec<UnlinkedHalf>> {
    let rows = sqlx::query_as::<_, UnlinkedHalf>(
        r#"
        SELECT id, raw, format, part_no, lot_no, line, quantity, work_date, scanned_at_ms
        FROM unit_halves
        WHERE linked_scan_id IS NULL
        ORDER BY id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

#[derive(FromRow)]
struct UnsyncedRow {
    id: i64,
    line: String,
    part_no: String,
    lot_no: String,
    work_date: String,
    format: String,
    raw: String,
    partner_raw: String,
    station: String,
    quantity: i64,
    plan_id: Option<i64>,
    completed_at_ms: Option<i64>,
}

/// Oldest unsynced completed units first
pub(crate) async fn unsynced(conn: &mut SqliteConnection, limit: u32) -> Result<Vec<UnitRecord>> {
    let rows = sqlx::query_as::<_, UnsyncedRow>(
        r#"
        SELECT p.id, p.line, p.part_no, p.lot_no, p.work_date, p.format, p.raw,
               s.raw AS partner_raw, p.station, p.quantity, p.plan_id, p.completed_at_ms
        FROM unit_halves p
        JOIN unit_halves s ON s.id = p.linked_scan_id
        WHERE p.is_primary = 1 AND p.synced = 0
        ORDER BY p.id ASC
        LIMIT ?
        "#,
    )
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let (qr_raw, barcode_raw) = if row.format == ScanFormat::Qr.as_str() {
                (row.raw, row.partner_raw)
            } else {
                (row.partner_raw, row.raw)
            };
            UnitRecord {
                unit_id: row.id,
                line: row.line,
                part_no: row.part_no,
                lot_no: row.lot_no,
                work_date: row.work_date,
                qr_raw,
                barcode_raw,
                station: row.station,
                quantity: row.quantity,
                plan_id: row.plan_id,
                completed_at: row
                    .completed_at_ms
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or_else(Utc::now),
            }
        })
        .collect())
}

pub(crate) async fn mark_synced(conn: &mut SqliteConnection, unit_id: i64, now_ms: i64) -> Result<()> {
    sqlx::query(
        "UPDATE unit_halves SET synced = 1, synced_at_ms = ? WHERE id = ? OR linked_scan_id = ?",
    )
    .bind(now_ms)
    .bind(unit_id)
    .bind(unit_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// (plan_id, unit_id, quantity) for counted units whose increment never reached the remote
pub(crate) async fn unpushed_increments(conn: &mut SqliteConnection) -> Result<Vec<(i64, i64, i64)>> {
    let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
        r#"
        SELECT plan_id, id, quantity FROM unit_halves
        WHERE is_primary = 1 AND plan_id IS NOT NULL AND increment_pushed = 0
          AND linked_scan_id IS NOT NULL
        ORDER BY id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

pub(crate) async fn mark_increment_pushed(conn: &mut SqliteConnection, unit_id: i64) -> Result<()> {
    sqlx::query("UPDATE unit_halves SET increment_pushed = 1 WHERE id = ?")
        .bind(unit_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Attach counted units to a plan (their increment is then pending)
pub(crate) async fn assign_plan(conn: &mut SqliteConnection, unit_id: i64, plan_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE unit_halves SET plan_id = ?, increment_pushed = 0 WHERE id = ? AND is_primary = 1",
    )
    .bind(plan_id)
    .bind(unit_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Completed quantity per part on a line since the given instant
pub(crate) async fn completed_since(
    conn: &mut SqliteConnection,
    line: &str,
    since_ms: i64,
) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT part_no, COALESCE(SUM(quantity), 0) FROM unit_halves
        WHERE is_primary = 1 AND line = ? AND completed_at_ms >= ?
        GROUP BY part_no
        "#,
    )
    .bind(line)
    .bind(since_ms)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Primary half and quantity of a unit
pub(crate) async fn unit_summary(
    conn: &mut SqliteConnection,
    unit_id: i64,
) -> Result<Option<(String, String, String, i64)>> {
    let row: Option<(String, String, String, i64)> = sqlx::query_as(
        "SELECT line, part_no, work_date, quantity FROM unit_halves WHERE id = ? AND is_primary = 1",
    )
    .bind(unit_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

//! Local Store
//!
//! Durable local persistence on SQLite. Every multi-statement write takes the
//! store's async gate once and runs inside one transaction, retried on lock
//! contention with the configured [`RetryPolicy`]. Reads skip the gate; WAL
//! keeps them consistent with the last committed write.
//!
//! Submodules hold connection-level helpers so a public operation can compose
//! several of them inside one transaction without re-entering the gate.

mod aggregates;
mod cross_refs;
mod plans;
mod staging;
mod units;

pub use aggregates::DailyAggregate;
pub use plans::MergeReport;
pub use staging::{MatchCriteria, StagingHalf, Watermark};
pub use units::{NewUnit, UnitRecord, UnlinkedHalf};

use crate::model::{PlanItem, PlanStatus, RemotePlan, ScanEvent, ScanFormat, StagingStatus};
use linecount_common::config::LocalConfig;
use linecount_common::retry::retry_on_lock;
use linecount_common::{Result, RetryPolicy};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

/// What a completed pair should be counted against
#[derive(Debug, Clone)]
pub struct PairContext {
    pub work_date: String,
    pub plan_id: Option<i64>,
    pub target_rate: i64,
    pub now_ms: i64,
    /// Validate the BARCODE main part against the QR sub-assembly
    pub cross_ref: bool,
}

/// Result of staging a half and trying to complete it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Paired { unit_id: i64, part_no: String, quantity: i64 },
    Staged { staging_id: i64 },
    /// Raw code already stored
    Duplicate,
    /// Same format already pending for this part and line
    DuplicateFormat,
    /// Cross-reference check failed; the partner half was discarded
    CrossRefMismatch,
}

/// Result of completing two halves already in staging
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    Paired { unit_id: i64, quantity: i64 },
    NoMatch,
}

/// Local SQLite store
#[derive(Debug)]
pub struct LocalStore {
    pool: SqlitePool,
    gate: Mutex<()>,
    retry: RetryPolicy,
}

impl LocalStore {
    pub fn new(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self {
            pool,
            gate: Mutex::new(()),
            retry,
        }
    }

    /// Open (creating if needed) the store at `path`
    pub async fn open(path: &Path, config: &LocalConfig) -> Result<Self> {
        let pool = linecount_common::db::init_database(path, config.busy_timeout_ms).await?;
        Ok(Self::new(pool, config.lock_retry))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ---------------------------------------------------------------------
    // Staging and pairing
    // ---------------------------------------------------------------------

    /// Insert a staging half; returns its id
    pub async fn put_staging(&self, scan: &ScanEvent, now_ms: i64) -> Result<i64> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("put_staging", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            let id = staging::insert(&mut tx, scan, now_ms).await?;
            tx.commit().await?;
            Ok(id)
        })
        .await
    }

    /// Raw code already staged or part of a completed unit
    pub async fn raw_exists(&self, format: ScanFormat, raw: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        staging::raw_exists(&mut conn, format, raw).await
    }

    /// Oldest staged half matching the criteria (read only)
    pub async fn peek_match(&self, criteria: &MatchCriteria<'_>) -> Result<Option<StagingHalf>> {
        let mut conn = self.pool.acquire().await?;
        staging::find_match(&mut conn, criteria).await
    }

    pub async fn line_watermark(&self, line: &str) -> Result<Watermark> {
        let mut conn = self.pool.acquire().await?;
        staging::watermark(&mut conn, line).await
    }

    /// Final part number of a cross-referenced pair, None on mismatch
    pub async fn resolve_cross_ref(&self, a: &ScanEvent, b: &ScanEvent) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        cross_ref_part(&mut conn, a, b).await
    }

    /// Stage a half and complete it against an eligible opposite half, atomically
    ///
    /// Inside one transaction: purge the line's expired halves, re-check the
    /// raw code, look for a partner; on a match promote both halves to a
    /// linked unit, bump the daily aggregate and the plan's produced_count;
    /// otherwise stage the half unless the same format is already pending.
    pub async fn stage_and_pair(
        &self,
        scan: &ScanEvent,
        criteria: &MatchCriteria<'_>,
        horizon_start_ms: i64,
        ctx: &PairContext,
    ) -> Result<StageResult> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("stage_and_pair", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            let result = stage_and_pair_in(&mut tx, scan, criteria, horizon_start_ms, ctx).await?;
            match result {
                StageResult::CrossRefMismatch | StageResult::Paired { .. } | StageResult::Staged { .. } => {
                    tx.commit().await?
                }
                StageResult::Duplicate | StageResult::DuplicateFormat => tx.rollback().await?,
            }
            Ok(result)
        })
        .await
    }

    /// Complete the oldest QR/BARCODE halves staged for a part on a line
    ///
    /// Returns the match result and the part number the unit counts toward.
    pub async fn try_complete_pair(
        &self,
        part_no: &str,
        line: &str,
        match_lot_no: bool,
        not_before_ms: i64,
        ctx: &PairContext,
    ) -> Result<(MatchResult, Option<String>)> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("try_complete_pair", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            let watermark = staging::watermark(&mut tx, line).await?;
            let Some(qr) =
                staging::oldest_for(&mut tx, line, part_no, ScanFormat::Qr, not_before_ms, &watermark).await?
            else {
                return Ok((MatchResult::NoMatch, None));
            };

            let lot = (match_lot_no && !qr.lot_no.is_empty()).then_some(qr.lot_no.as_str());
            let criteria = MatchCriteria {
                line,
                part_no: Some(part_no),
                lot_no: lot,
                format: ScanFormat::Barcode,
                not_before_ms,
                watermark: &watermark,
            };
            let Some(barcode) = staging::find_match(&mut tx, &criteria).await? else {
                return Ok((MatchResult::NoMatch, None));
            };

            staging::delete(&mut tx, qr.id).await?;
            staging::delete(&mut tx, barcode.id).await?;
            let qr_scan = qr.to_scan_event();
            let barcode_scan = barcode.to_scan_event();
            let unit_id = promote(&mut tx, &qr_scan, &barcode_scan, false, part_no, ctx).await?;
            tx.commit().await?;
            Ok((
                MatchResult::Paired {
                    unit_id,
                    quantity: qr_scan.quantity,
                },
                Some(part_no.to_string()),
            ))
        })
        .await
    }

    /// Persist a completed unit directly (solo mode); also bumps the aggregate
    pub async fn record_unit(&self, unit: &NewUnit<'_>) -> Result<i64> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("record_unit", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            let unit_id = record_unit_in(&mut tx, unit).await?;
            tx.commit().await?;
            Ok(unit_id)
        })
        .await
    }

    /// Delete staging halves created before the cutoff
    pub async fn purge_staging(&self, cutoff_ms: i64) -> Result<u64> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("purge_staging", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            let removed = staging::purge_older_than(&mut tx, None, cutoff_ms).await?;
            tx.commit().await?;
            Ok(removed)
        })
        .await
    }

    pub async fn staging_status(&self, now_ms: i64) -> Result<Vec<StagingStatus>> {
        let mut conn = self.pool.acquire().await?;
        staging::status(&mut conn, now_ms).await
    }

    /// (part_no, line) pairs with both formats staged
    pub async fn reconcilable_staging(&self) -> Result<Vec<(String, String)>> {
        let mut conn = self.pool.acquire().await?;
        staging::reconcilable(&mut conn).await
    }

    // ---------------------------------------------------------------------
    // Units
    // ---------------------------------------------------------------------

    pub async fn unlinked_halves(&self) -> Result<Vec<UnlinkedHalf>> {
        let mut conn = self.pool.acquire().await?;
        units::unlinked(&mut conn).await
    }

    /// Link two unlinked halves into a unit and count it once
    ///
    /// Returns false (and changes nothing) when either half was linked already.
    pub async fn link_halves(
        &self,
        primary_id: i64,
        secondary_id: i64,
        target_rate: i64,
        now_ms: i64,
    ) -> Result<bool> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("link_halves", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            if !units::link_unlinked(&mut tx, primary_id, secondary_id, now_ms).await? {
                return Ok(false);
            }
            if let Some((line, part_no, work_date, quantity)) = units::unit_summary(&mut tx, primary_id).await? {
                aggregates::bump(&mut tx, &work_date, &line, &part_no, quantity, target_rate, now_ms).await?;
            }
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    /// Oldest unsynced completed units
    pub async fn unsynced_units(&self, limit: u32) -> Result<Vec<UnitRecord>> {
        let mut conn = self.pool.acquire().await?;
        units::unsynced(&mut conn, limit).await
    }

    pub async fn mark_units_synced(&self, unit_ids: &[i64], now_ms: i64) -> Result<()> {
        if unit_ids.is_empty() {
            return Ok(());
        }
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("mark_units_synced", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            for id in unit_ids {
                units::mark_synced(&mut tx, *id, now_ms).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// (plan_id, unit_id, quantity) not yet pushed to the remote produced_count
    pub async fn unpushed_increments(&self) -> Result<Vec<(i64, i64, i64)>> {
        let mut conn = self.pool.acquire().await?;
        units::unpushed_increments(&mut conn).await
    }

    pub async fn mark_increments_pushed(&self, unit_ids: &[i64]) -> Result<()> {
        if unit_ids.is_empty() {
            return Ok(());
        }
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("mark_increments_pushed", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            for id in unit_ids {
                units::mark_increment_pushed(&mut tx, *id).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Completed quantity per part on a line since `since_ms`
    pub async fn completed_since(&self, line: &str, since_ms: i64) -> Result<Vec<(String, i64)>> {
        let mut conn = self.pool.acquire().await?;
        units::completed_since(&mut conn, line, since_ms).await
    }

    // ---------------------------------------------------------------------
    // Aggregates and plans
    // ---------------------------------------------------------------------

    pub async fn daily_aggregates(&self, work_date: &str, line: &str) -> Result<Vec<DailyAggregate>> {
        let mut conn = self.pool.acquire().await?;
        aggregates::for_line(&mut conn, work_date, line).await
    }

    /// Atomically add `delta` to a plan's produced_count and attach the given
    /// units to it; returns the new produced_count
    pub async fn apply_increment(&self, plan_id: i64, delta: i64, unit_ids: &[i64], now_ms: i64) -> Result<i64> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("apply_increment", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            let produced = plans::add_produced(&mut tx, plan_id, delta, Some(now_ms), now_ms).await?;
            for unit_id in unit_ids {
                units::assign_plan(&mut tx, *unit_id, plan_id).await?;
            }
            tx.commit().await?;
            Ok(produced)
        })
        .await
    }

    pub async fn load_plans(&self, work_date: &str, line: Option<&str>) -> Result<Vec<PlanItem>> {
        let mut conn = self.pool.acquire().await?;
        plans::load(&mut conn, work_date, line).await
    }

    pub async fn plan(&self, plan_id: i64) -> Result<Option<PlanItem>> {
        let mut conn = self.pool.acquire().await?;
        Ok(plans::get(&mut conn, plan_id).await?.map(|(item, _)| item))
    }

    /// Make a plan ACTIVE and close the line's other open plans; returns the
    /// ids that were closed
    pub async fn activate_plan(&self, plan_id: i64, line: &str, now_ms: i64) -> Result<Vec<i64>> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("activate_plan", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            let closed = plans::close_open_except(&mut tx, line, plan_id, now_ms).await?;
            plans::set_status(&mut tx, plan_id, PlanStatus::Active, now_ms).await?;
            tx.commit().await?;
            Ok(closed)
        })
        .await
    }

    /// Set a non-ACTIVE status locally and flag it for the remote
    pub async fn set_plan_status(&self, plan_id: i64, status: PlanStatus, now_ms: i64) -> Result<()> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("set_plan_status", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            plans::set_status(&mut tx, plan_id, status, now_ms).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn merge_remote_plans(
        &self,
        work_date: &str,
        line: &str,
        remote: &[RemotePlan],
        pending: &HashMap<i64, i64>,
        now_ms: i64,
    ) -> Result<MergeReport> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("merge_remote_plans", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            let report = plans::merge_remote(&mut tx, work_date, line, remote, pending, now_ms).await?;
            tx.commit().await?;
            Ok(report)
        })
        .await
    }

    /// Plans whose status the remote has not been told about
    pub async fn dirty_plans(&self) -> Result<Vec<PlanItem>> {
        let mut conn = self.pool.acquire().await?;
        plans::dirty(&mut conn).await
    }

    pub async fn clear_plan_dirty(&self, plan_id: i64, pushed: PlanStatus, now_ms: i64) -> Result<bool> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("clear_plan_dirty", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            let cleared = plans::clear_dirty(&mut tx, plan_id, pushed, now_ms).await?;
            tx.commit().await?;
            Ok(cleared)
        })
        .await
    }

    pub async fn replace_cross_refs(&self, rows: &[(String, String)], now_ms: i64) -> Result<usize> {
        let _gate = self.gate.lock().await;
        let pool = &self.pool;
        retry_on_lock("replace_cross_refs", &self.retry, || async move {
            let mut tx = pool.begin().await?;
            let count = cross_refs::replace_all(&mut tx, rows, now_ms).await?;
            tx.commit().await?;
            Ok(count)
        })
        .await
    }

    pub async fn sub_assembly_of(&self, part_no: &str) -> Result<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        cross_refs::sub_assembly_of(&mut conn, part_no).await
    }
}

async fn stage_and_pair_in(
    conn: &mut SqliteConnection,
    scan: &ScanEvent,
    criteria: &MatchCriteria<'_>,
    horizon_start_ms: i64,
    ctx: &PairContext,
) -> Result<StageResult> {
    let purged = staging::purge_older_than(conn, Some(&scan.line), horizon_start_ms).await?;
    if purged > 0 {
        debug!(line = %scan.line, purged, "Purged expired staging halves");
    }

    if staging::raw_exists(conn, scan.format, &scan.raw).await? {
        return Ok(StageResult::Duplicate);
    }

    let switched = switch_watermark(conn, scan, criteria, ctx).await?;
    let criteria = &MatchCriteria {
        watermark: switched.as_ref().unwrap_or(criteria.watermark),
        ..criteria.clone()
    };

    if let Some(partner) = staging::find_match(conn, criteria).await? {
        let partner_scan = partner.to_scan_event();
        let part_no = if ctx.cross_ref {
            match cross_ref_part(conn, scan, &partner_scan).await? {
                Some(part_no) => part_no,
                None => {
                    staging::delete(conn, partner.id).await?;
                    return Ok(StageResult::CrossRefMismatch);
                }
            }
        } else {
            scan.part_no.clone()
        };

        staging::delete(conn, partner.id).await?;
        let (primary, secondary) = match scan.format {
            ScanFormat::Qr => (scan, &partner_scan),
            ScanFormat::Barcode => (&partner_scan, scan),
        };
        let unit_id = promote(conn, primary, secondary, false, &part_no, ctx).await?;
        return Ok(StageResult::Paired {
            unit_id,
            part_no,
            quantity: primary.quantity,
        });
    }

    let pending = MatchCriteria {
        part_no: Some(&scan.part_no),
        format: scan.format,
        ..criteria.clone()
    };
    if staging::find_match(conn, &pending).await?.is_some() {
        return Ok(StageResult::DuplicateFormat);
    }

    match staging::insert(conn, scan, ctx.now_ms).await {
        Ok(staging_id) => Ok(StageResult::Staged { staging_id }),
        Err(e) if e.is_unique_violation() => Ok(StageResult::Duplicate),
        Err(e) => Err(e),
    }
}

/// Move the line's watermark past every staged half when this is the first
/// scan counted toward a different plan. Returns the new watermark.
///
/// In cross-reference mode the plan is resolved from the partner half, which
/// was staged without one; that partner stays eligible.
async fn switch_watermark(
    conn: &mut SqliteConnection,
    scan: &ScanEvent,
    criteria: &MatchCriteria<'_>,
    ctx: &PairContext,
) -> Result<Option<Watermark>> {
    let Some(plan_id) = ctx.plan_id else {
        return Ok(None);
    };
    if criteria.watermark.plan_id == Some(plan_id) {
        return Ok(None);
    }

    let mut staging_id = staging::max_id(conn).await?;
    if ctx.cross_ref {
        if let Some(partner) = staging::find_match(conn, criteria).await? {
            staging_id = staging_id.min(partner.id - 1);
        }
    }

    let watermark = Watermark {
        staging_id,
        plan_id: Some(plan_id),
        part_no: scan.part_no.clone(),
    };
    staging::set_watermark(conn, &scan.line, &watermark, ctx.now_ms).await?;
    debug!(
        line = %scan.line,
        plan_id,
        staging_id = watermark.staging_id,
        "Plan switch watermark moved"
    );
    Ok(Some(watermark))
}

async fn promote(
    conn: &mut SqliteConnection,
    primary: &ScanEvent,
    secondary: &ScanEvent,
    secondary_synthetic: bool,
    part_no: &str,
    ctx: &PairContext,
) -> Result<i64> {
    let unit = NewUnit {
        primary,
        secondary,
        secondary_synthetic,
        part_no,
        work_date: &ctx.work_date,
        plan_id: ctx.plan_id,
        target_rate: ctx.target_rate,
        completed_at_ms: ctx.now_ms,
    };
    record_unit_in(conn, &unit).await
}

async fn record_unit_in(conn: &mut SqliteConnection, unit: &NewUnit<'_>) -> Result<i64> {
    let unit_id = units::insert_pair(conn, unit).await?;
    aggregates::bump(
        conn,
        unit.work_date,
        &unit.primary.line,
        unit.part_no,
        unit.primary.quantity,
        unit.target_rate,
        unit.completed_at_ms,
    )
    .await?;
    if let Some(plan_id) = unit.plan_id {
        plans::add_produced(conn, plan_id, unit.primary.quantity, Some(unit.completed_at_ms), unit.completed_at_ms)
            .await?;
    }
    Ok(unit_id)
}

/// BARCODE is the main half; its sub-assembly must be the QR part.
/// Parts without a cross-reference entry pair only with themselves.
async fn cross_ref_part(conn: &mut SqliteConnection, a: &ScanEvent, b: &ScanEvent) -> Result<Option<String>> {
    let (main, sub) = match (a.format, b.format) {
        (ScanFormat::Barcode, ScanFormat::Qr) => (a, b),
        (ScanFormat::Qr, ScanFormat::Barcode) => (b, a),
        _ => return Ok(None),
    };

    let expected = cross_refs::sub_assembly_of(conn, &main.part_no).await?;
    let matches = match expected {
        Some(sub_assy) => sub_assy == sub.part_no,
        None => main.part_no == sub.part_no,
    };
    Ok(matches.then(|| main.part_no.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> LocalStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        linecount_common::db::create_schema(&pool).await.unwrap();
        LocalStore::new(pool, RetryPolicy::default())
    }

    fn scan(raw: &str, format: ScanFormat, part: &str, at_ms: i64) -> ScanEvent {
        ScanEvent {
            raw: raw.into(),
            format,
            part_no: part.into(),
            lot_no: "L1".into(),
            sequence: String::new(),
            station: "S1".into(),
            line: "M1".into(),
            quantity: 1,
            scanned_at: Utc.timestamp_millis_opt(at_ms).unwrap(),
        }
    }

    async fn seed_plans(store: &LocalStore, plans: &[(i64, &str)]) {
        let remote: Vec<RemotePlan> = plans
            .iter()
            .enumerate()
            .map(|(i, (id, part))| RemotePlan {
                id: *id,
                work_date: "2025-03-10".into(),
                line: "M1".into(),
                part_no: (*part).into(),
                lot_no: String::new(),
                model_code: String::new(),
                target_count: 10,
                produced_count: 0,
                status: PlanStatus::Planned,
                sequence: i as i64 + 1,
                target_rate: 0,
                started_at: None,
                planned_start: None,
                planned_end: None,
                effective_minutes: 480,
            })
            .collect();
        store
            .merge_remote_plans("2025-03-10", "M1", &remote, &HashMap::new(), 0)
            .await
            .unwrap();
    }

    fn ctx(now_ms: i64) -> PairContext {
        PairContext {
            work_date: "2025-03-10".into(),
            plan_id: None,
            target_rate: 0,
            now_ms,
            cross_ref: false,
        }
    }

    fn criteria<'a>(format: ScanFormat, part: &'a str, not_before_ms: i64, wm: &'a Watermark) -> MatchCriteria<'a> {
        MatchCriteria {
            line: "M1",
            part_no: Some(part),
            lot_no: Some("L1"),
            format,
            not_before_ms,
            watermark: wm,
        }
    }

    #[tokio::test]
    async fn test_stage_then_pair_counts_once() {
        let store = memory_store().await;
        let wm = Watermark::default();

        let qr = scan("QR-1", ScanFormat::Qr, "EBR1", 1_000);
        let staged = store
            .stage_and_pair(&qr, &criteria(ScanFormat::Barcode, "EBR1", 0, &wm), 0, &ctx(1_000))
            .await
            .unwrap();
        assert!(matches!(staged, StageResult::Staged { .. }));

        let bc = scan("BC-1", ScanFormat::Barcode, "EBR1", 2_000);
        let paired = store
            .stage_and_pair(&bc, &criteria(ScanFormat::Qr, "EBR1", 0, &wm), 0, &ctx(2_000))
            .await
            .unwrap();
        assert!(matches!(paired, StageResult::Paired { .. }));

        let totals = store.daily_aggregates("2025-03-10", "M1").await.unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].produced, 1);
        assert!(store.staging_status(3_000).await.unwrap().is_empty());

        let unsynced = store.unsynced_units(100).await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].qr_raw, "QR-1");
        assert_eq!(unsynced[0].barcode_raw, "BC-1");
    }

    #[tokio::test]
    async fn test_same_format_twice_is_rejected() {
        let store = memory_store().await;
        let wm = Watermark::default();

        let first = scan("QR-1", ScanFormat::Qr, "EBR1", 1_000);
        store
            .stage_and_pair(&first, &criteria(ScanFormat::Barcode, "EBR1", 0, &wm), 0, &ctx(1_000))
            .await
            .unwrap();

        let second = scan("QR-2", ScanFormat::Qr, "EBR1", 1_500);
        let result = store
            .stage_and_pair(&second, &criteria(ScanFormat::Barcode, "EBR1", 0, &wm), 0, &ctx(1_500))
            .await
            .unwrap();
        assert_eq!(result, StageResult::DuplicateFormat);

        let again = store
            .stage_and_pair(&first, &criteria(ScanFormat::Barcode, "EBR1", 0, &wm), 0, &ctx(1_600))
            .await
            .unwrap();
        assert_eq!(again, StageResult::Duplicate);
    }

    #[tokio::test]
    async fn test_try_complete_pair_from_staging() {
        let store = memory_store().await;
        store.put_staging(&scan("QR-9", ScanFormat::Qr, "EBR9", 1_000), 1_000).await.unwrap();
        store.put_staging(&scan("BC-9", ScanFormat::Barcode, "EBR9", 1_200), 1_200).await.unwrap();

        let (result, part) = store
            .try_complete_pair("EBR9", "M1", true, 0, &ctx(1_500))
            .await
            .unwrap();
        assert!(matches!(result, MatchResult::Paired { .. }));
        assert_eq!(part.as_deref(), Some("EBR9"));

        let (again, _) = store.try_complete_pair("EBR9", "M1", true, 0, &ctx(1_600)).await.unwrap();
        assert_eq!(again, MatchResult::NoMatch);
    }

    #[tokio::test]
    async fn test_cross_ref_mismatch_discards_partner() {
        let store = memory_store().await;
        store
            .replace_cross_refs(&[("MAIN1".to_string(), "SUB1".to_string())], 0)
            .await
            .unwrap();
        let wm = Watermark::default();
        let any_part = |format| MatchCriteria {
            line: "M1",
            part_no: None,
            lot_no: None,
            format,
            not_before_ms: 0,
            watermark: &wm,
        };
        let mut cross = ctx(1_000);
        cross.cross_ref = true;

        let bc = scan("BC-M", ScanFormat::Barcode, "MAIN1", 1_000);
        store.stage_and_pair(&bc, &any_part(ScanFormat::Qr), 0, &cross).await.unwrap();

        let wrong = scan("QR-X", ScanFormat::Qr, "OTHER", 1_100);
        let result = store.stage_and_pair(&wrong, &any_part(ScanFormat::Barcode), 0, &cross).await.unwrap();
        assert_eq!(result, StageResult::CrossRefMismatch);
        assert!(store.staging_status(1_200).await.unwrap().is_empty());

        let bc2 = scan("BC-M2", ScanFormat::Barcode, "MAIN1", 1_300);
        store.stage_and_pair(&bc2, &any_part(ScanFormat::Qr), 0, &cross).await.unwrap();
        let right = scan("QR-S", ScanFormat::Qr, "SUB1", 1_400);
        let result = store.stage_and_pair(&right, &any_part(ScanFormat::Barcode), 0, &cross).await.unwrap();
        assert!(matches!(result, StageResult::Paired { ref part_no, .. } if part_no == "MAIN1"));
    }

    #[tokio::test]
    async fn test_watermark_blocks_older_halves_of_the_same_part() {
        let store = memory_store().await;
        store.put_staging(&scan("BC-OLD", ScanFormat::Barcode, "EBR1", 1_000), 1_000).await.unwrap();

        let wm = Watermark {
            staging_id: 1,
            plan_id: Some(7),
            part_no: "EBR1".into(),
        };
        let qr = scan("QR-NEW", ScanFormat::Qr, "EBR1", 1_100);
        let result = store
            .stage_and_pair(&qr, &criteria(ScanFormat::Barcode, "EBR1", 0, &wm), 0, &ctx(1_100))
            .await
            .unwrap();
        assert!(matches!(result, StageResult::Staged { .. }));
    }

    #[tokio::test]
    async fn test_first_scan_for_new_plan_moves_watermark() {
        let store = memory_store().await;
        seed_plans(&store, &[(1, "EBR1"), (2, "EBR1")]).await;
        let mut plan_a = ctx(1_000);
        plan_a.plan_id = Some(1);
        let bc = scan("BC-A", ScanFormat::Barcode, "EBR1", 1_000);
        let wm = store.line_watermark("M1").await.unwrap();
        store
            .stage_and_pair(&bc, &criteria(ScanFormat::Qr, "EBR1", 0, &wm), 0, &plan_a)
            .await
            .unwrap();
        assert_eq!(store.line_watermark("M1").await.unwrap().plan_id, Some(1));

        // Same part, next work order: the leftover barcode must not pair
        let mut plan_b = ctx(2_000);
        plan_b.plan_id = Some(2);
        let qr = scan("QR-B", ScanFormat::Qr, "EBR1", 2_000);
        let wm = store.line_watermark("M1").await.unwrap();
        let result = store
            .stage_and_pair(&qr, &criteria(ScanFormat::Barcode, "EBR1", 0, &wm), 0, &plan_b)
            .await
            .unwrap();
        assert!(matches!(result, StageResult::Staged { .. }));

        let moved = store.line_watermark("M1").await.unwrap();
        assert_eq!(moved.plan_id, Some(2));
        assert_eq!(moved.staging_id, 1);

        // Halves staged after the switch still pair
        let bc = scan("BC-B", ScanFormat::Barcode, "EBR1", 2_500);
        let mut plan_b = ctx(2_500);
        plan_b.plan_id = Some(2);
        let result = store
            .stage_and_pair(&bc, &criteria(ScanFormat::Qr, "EBR1", 0, &moved), 0, &plan_b)
            .await
            .unwrap();
        assert!(matches!(result, StageResult::Paired { .. }));
    }

    #[tokio::test]
    async fn test_cross_ref_partner_survives_plan_switch() {
        let store = memory_store().await;
        seed_plans(&store, &[(5, "MAIN1")]).await;
        store
            .replace_cross_refs(&[("MAIN1".to_string(), "SUB1".to_string())], 0)
            .await
            .unwrap();
        let wm = store.line_watermark("M1").await.unwrap();
        let any_part = |format| MatchCriteria {
            line: "M1",
            part_no: None,
            lot_no: None,
            format,
            not_before_ms: 0,
            watermark: &wm,
        };
        let mut unplanned = ctx(1_000);
        unplanned.cross_ref = true;
        let sub = scan("QR-S", ScanFormat::Qr, "SUB1", 1_000);
        store.stage_and_pair(&sub, &any_part(ScanFormat::Barcode), 0, &unplanned).await.unwrap();

        let mut planned = ctx(1_200);
        planned.cross_ref = true;
        planned.plan_id = Some(5);
        let main = scan("BC-M", ScanFormat::Barcode, "MAIN1", 1_200);
        let result = store.stage_and_pair(&main, &any_part(ScanFormat::Qr), 0, &planned).await.unwrap();
        assert!(matches!(result, StageResult::Paired { ref part_no, .. } if part_no == "MAIN1"));
        assert_eq!(store.line_watermark("M1").await.unwrap().plan_id, Some(5));
    }

    #[tokio::test]
    async fn test_same_format_outside_window_or_other_lot_is_staged() {
        let store = memory_store().await;
        let wm = Watermark::default();

        let first = scan("QR-1", ScanFormat::Qr, "EBR1", 1_000);
        store
            .stage_and_pair(&first, &criteria(ScanFormat::Barcode, "EBR1", 0, &wm), 0, &ctx(1_000))
            .await
            .unwrap();

        // Window now starts after the first half was staged
        let late = scan("QR-2", ScanFormat::Qr, "EBR1", 16_000);
        let result = store
            .stage_and_pair(&late, &criteria(ScanFormat::Barcode, "EBR1", 6_000, &wm), 0, &ctx(16_000))
            .await
            .unwrap();
        assert!(matches!(result, StageResult::Staged { .. }));

        let mut other_lot = scan("QR-3", ScanFormat::Qr, "EBR1", 16_500);
        other_lot.lot_no = "L9".into();
        let criteria_l9 = MatchCriteria {
            lot_no: Some("L9"),
            ..criteria(ScanFormat::Barcode, "EBR1", 6_500, &wm)
        };
        let result = store
            .stage_and_pair(&other_lot, &criteria_l9, 0, &ctx(16_500))
            .await
            .unwrap();
        assert!(matches!(result, StageResult::Staged { .. }));
    }
}

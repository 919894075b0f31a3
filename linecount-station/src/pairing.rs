//! Pairing Engine
//!
//! Turns normalized scans into completed units. A unit completes when a QR
//! half and a BARCODE half of the same part (and lot, when both carry one)
//! arrive on the same line within the match window. Everything for one line
//! runs under that line's lock; the store makes each decision atomic.

use crate::lifecycle::{Admission, PlanLifecycle};
use crate::locks::LineLocks;
use crate::model::{ScanEvent, ScanFormat, ScanOutcome};
use crate::store::{LocalStore, MatchCriteria, MatchResult, NewUnit, PairContext, StageResult, Watermark};
use chrono::{DateTime, Utc};
use linecount_common::config::PairingConfig;
use linecount_common::events::{EventBus, LineEvent};
use linecount_common::{Clock, Result, WorkCalendar};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Raw prefix of the placeholder half created in solo mode
pub const SOLO_PREFIX: &str = "SOLO|";

/// Outcome of the startup repair of half-linked units
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub linked: usize,
    /// Half ids left without a partner
    pub unmatched: Vec<i64>,
}

pub struct PairingEngine {
    store: Arc<LocalStore>,
    lifecycle: Arc<PlanLifecycle>,
    locks: Arc<LineLocks>,
    clock: Arc<dyn Clock>,
    calendar: WorkCalendar,
    events: Arc<EventBus>,
    config: PairingConfig,
}

impl PairingEngine {
    pub fn new(
        store: Arc<LocalStore>,
        lifecycle: Arc<PlanLifecycle>,
        locks: Arc<LineLocks>,
        clock: Arc<dyn Clock>,
        calendar: WorkCalendar,
        events: Arc<EventBus>,
        config: PairingConfig,
    ) -> Self {
        Self {
            store,
            lifecycle,
            locks,
            clock,
            calendar,
            events,
            config,
        }
    }

    fn window_start_ms(&self, now_ms: i64) -> i64 {
        now_ms - (self.config.match_window_secs as i64) * 1000
    }

    fn horizon_start_ms(&self, now_ms: i64) -> i64 {
        now_ms - (self.config.cleanup_horizon_secs as i64) * 1000
    }

    /// Submit one normalized scan
    pub async fn submit(&self, scan: ScanEvent) -> Result<ScanOutcome> {
        let scan = scan.normalized();
        let _line = self.locks.lock(&scan.line).await;
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();

        if self.store.raw_exists(scan.format, &scan.raw).await? {
            debug!(line = %scan.line, raw = %scan.raw, "Duplicate scan ignored");
            return Ok(self.reject(&scan, ScanOutcome::DuplicateIgnored, now));
        }

        if self.config.solo_mode {
            return self.submit_solo(&scan, now).await;
        }

        let watermark = self.store.line_watermark(&scan.line).await?;
        let lot_no = (self.config.match_lot_no && !self.config.cross_ref_mode && !scan.lot_no.is_empty())
            .then_some(scan.lot_no.as_str());
        let criteria = MatchCriteria {
            line: &scan.line,
            part_no: (!self.config.cross_ref_mode).then_some(scan.part_no.as_str()),
            lot_no,
            format: scan.format.opposite(),
            not_before_ms: self.window_start_ms(now_ms),
            watermark: &watermark,
        };

        let admission = match self.admission_for(&scan, &criteria).await? {
            Some(Admission::Rejected(outcome)) => return Ok(self.reject(&scan, outcome, now)),
            Some(admission) => admission,
            None => Admission::Unplanned,
        };

        let ctx = PairContext {
            work_date: self.calendar.work_date_key(now),
            plan_id: admission.plan_id(),
            target_rate: admission.target_rate(),
            now_ms,
            cross_ref: self.config.cross_ref_mode,
        };

        let result = self
            .store
            .stage_and_pair(&scan, &criteria, self.horizon_start_ms(now_ms), &ctx)
            .await?;

        match result {
            StageResult::Paired {
                unit_id,
                part_no,
                quantity,
            } => {
                self.lifecycle
                    .record_completion(&scan.line, &admission, unit_id, quantity)
                    .await?;
                info!(line = %scan.line, part_no = %part_no, unit_id, plan_id = ?admission.plan_id(), "Unit completed");
                self.events.emit_lossy(LineEvent::UnitCompleted {
                    line: scan.line.clone(),
                    part_no,
                    unit_id,
                    plan_id: admission.plan_id(),
                    timestamp: now,
                });
                Ok(ScanOutcome::Paired { unit_id })
            }
            StageResult::Staged { staging_id } => {
                debug!(line = %scan.line, part_no = %scan.part_no, format = scan.format.as_str(), staging_id, "Half staged");
                self.events.emit_lossy(LineEvent::HalfStaged {
                    line: scan.line.clone(),
                    part_no: scan.part_no.clone(),
                    format: scan.format.as_str().to_string(),
                    timestamp: now,
                });
                Ok(ScanOutcome::AwaitingPair {
                    expected: scan.format.opposite(),
                })
            }
            StageResult::Duplicate => Ok(self.reject(&scan, ScanOutcome::DuplicateIgnored, now)),
            StageResult::DuplicateFormat => Ok(self.reject(&scan, ScanOutcome::DuplicateFormat, now)),
            StageResult::CrossRefMismatch => {
                warn!(line = %scan.line, part_no = %scan.part_no, raw = %scan.raw, "Cross-reference mismatch, partner discarded");
                Ok(self.reject(&scan, ScanOutcome::CrossRefMismatch, now))
            }
        }
    }

    /// Plan admission for a scan, None when admission waits for the partner
    ///
    /// In cross-reference mode the counted part is the BARCODE main part, so a
    /// QR sub-assembly half with no partner yet is staged unchecked.
    async fn admission_for(&self, scan: &ScanEvent, criteria: &MatchCriteria<'_>) -> Result<Option<Admission>> {
        if !self.config.cross_ref_mode {
            return Ok(Some(self.lifecycle.admit(&scan.line, &scan.part_no)));
        }

        match self.store.peek_match(criteria).await? {
            Some(partner) => {
                let partner = partner.to_scan_event();
                Ok(self
                    .store
                    .resolve_cross_ref(scan, &partner)
                    .await?
                    .map(|part_no| self.lifecycle.admit(&scan.line, &part_no)))
            }
            None if scan.format == ScanFormat::Barcode => Ok(Some(self.lifecycle.admit(&scan.line, &scan.part_no))),
            None => Ok(None),
        }
    }

    /// Solo mode: every scan completes at once with a placeholder partner
    async fn submit_solo(&self, scan: &ScanEvent, now: DateTime<Utc>) -> Result<ScanOutcome> {
        let admission = self.lifecycle.admit(&scan.line, &scan.part_no);
        if let Admission::Rejected(outcome) = admission {
            return Ok(self.reject(scan, outcome, now));
        }

        let placeholder = ScanEvent {
            raw: format!("{}{}", SOLO_PREFIX, scan.raw),
            format: scan.format.opposite(),
            ..scan.clone()
        };
        let (primary, secondary) = match scan.format {
            ScanFormat::Qr => (scan, &placeholder),
            ScanFormat::Barcode => (&placeholder, scan),
        };
        let work_date = self.calendar.work_date_key(now);
        let unit = NewUnit {
            primary,
            secondary,
            secondary_synthetic: true,
            part_no: &scan.part_no,
            work_date: &work_date,
            plan_id: admission.plan_id(),
            target_rate: admission.target_rate(),
            completed_at_ms: now.timestamp_millis(),
        };

        let unit_id = match self.store.record_unit(&unit).await {
            Ok(unit_id) => unit_id,
            Err(e) if e.is_unique_violation() => {
                return Ok(self.reject(scan, ScanOutcome::DuplicateIgnored, now));
            }
            Err(e) => return Err(e),
        };

        self.lifecycle
            .record_completion(&scan.line, &admission, unit_id, scan.quantity)
            .await?;
        info!(line = %scan.line, part_no = %scan.part_no, unit_id, "Unit completed (solo)");
        self.events.emit_lossy(LineEvent::UnitCompleted {
            line: scan.line.clone(),
            part_no: scan.part_no.clone(),
            unit_id,
            plan_id: admission.plan_id(),
            timestamp: now,
        });
        Ok(ScanOutcome::Paired { unit_id })
    }

    fn reject(&self, scan: &ScanEvent, outcome: ScanOutcome, now: DateTime<Utc>) -> ScanOutcome {
        self.events.emit_lossy(LineEvent::ScanRejected {
            line: scan.line.clone(),
            part_no: Some(scan.part_no.clone()),
            reason: outcome.reason_code().to_string(),
            raw: scan.raw.clone(),
            timestamp: now,
        });
        outcome
    }

    /// Complete the oldest QR/BARCODE halves already staged for a part
    pub async fn try_complete_pair(&self, part_no: &str, line: &str) -> Result<MatchResult> {
        let _line = self.locks.lock(line).await;
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();

        let admission = self.lifecycle.admit(line, part_no);
        if let Admission::Rejected(outcome) = &admission {
            debug!(line, part_no, reason = outcome.reason_code(), "Staged pair not admitted");
            return Ok(MatchResult::NoMatch);
        }

        let ctx = PairContext {
            work_date: self.calendar.work_date_key(now),
            plan_id: admission.plan_id(),
            target_rate: admission.target_rate(),
            now_ms,
            cross_ref: false,
        };
        let (result, counted_part) = self
            .store
            .try_complete_pair(
                part_no,
                line,
                self.config.match_lot_no,
                self.horizon_start_ms(now_ms),
                &ctx,
            )
            .await?;

        if let MatchResult::Paired { unit_id, quantity } = result {
            self.lifecycle
                .record_completion(line, &admission, unit_id, quantity)
                .await?;
            info!(line, part_no, unit_id, "Staged halves reconciled");
            self.events.emit_lossy(LineEvent::UnitCompleted {
                line: line.to_string(),
                part_no: counted_part.unwrap_or_else(|| part_no.to_string()),
                unit_id,
                plan_id: admission.plan_id(),
                timestamp: now,
            });
        }
        Ok(result)
    }

    /// Reconcile every part/line that has both formats staged
    pub async fn reconcile_staging(&self) -> Result<usize> {
        let mut completed = 0;
        for (part_no, line) in self.store.reconcilable_staging().await? {
            while let MatchResult::Paired { .. } = self.try_complete_pair(&part_no, &line).await? {
                completed += 1;
            }
        }
        if completed > 0 {
            info!(completed, "Reconciled staged halves");
        }
        Ok(completed)
    }

    /// Link unit halves whose partner link was lost in a crash
    ///
    /// Each QR half is paired with the oldest unlinked BARCODE half of the same
    /// line, part and compatible lot. Linking is conditional on both halves
    /// still being unlinked, so a repeated repair never counts a unit twice.
    pub async fn repair_unlinked(&self) -> Result<RepairReport> {
        let halves = self.store.unlinked_halves().await?;
        let mut report = RepairReport::default();
        let mut used: HashSet<i64> = HashSet::new();

        let (qrs, barcodes): (Vec<_>, Vec<_>) = halves
            .iter()
            .partition(|h| matches!(h.scan_format(), Ok(ScanFormat::Qr)));

        for qr in &qrs {
            let partner = barcodes.iter().find(|bc| {
                !used.contains(&bc.id)
                    && bc.line == qr.line
                    && bc.part_no == qr.part_no
                    && (!self.config.match_lot_no || qr.lot_no.is_empty() || bc.lot_no.is_empty() || bc.lot_no == qr.lot_no)
            });
            let Some(partner) = partner else {
                continue;
            };
            used.insert(partner.id);

            let _line = self.locks.lock(&qr.line).await;
            let target_rate = self.lifecycle.admit(&qr.line, &qr.part_no).target_rate();
            if !self
                .store
                .link_halves(qr.id, partner.id, target_rate, self.clock.now_millis())
                .await?
            {
                continue;
            }
            used.insert(qr.id);
            report.linked += 1;
            let plan_id = self
                .lifecycle
                .count_repaired_unit(&qr.line, &qr.part_no, qr.id, qr.quantity)
                .await?;
            info!(line = %qr.line, part_no = %qr.part_no, unit_id = qr.id, plan_id = ?plan_id, "Repaired half-linked unit");
        }

        for half in halves.iter().filter(|h| !used.contains(&h.id)) {
            warn!(
                line = %half.line,
                part_no = %half.part_no,
                format = %half.format,
                raw = %half.raw,
                "Unlinked half has no partner"
            );
            report.unmatched.push(half.id);
        }
        Ok(report)
    }

    /// Drop staging halves older than the cleanup horizon
    pub async fn purge_stale(&self) -> Result<u64> {
        let cutoff = self.horizon_start_ms(self.clock.now_millis());
        let removed = self.store.purge_staging(cutoff).await?;
        if removed > 0 {
            debug!(removed, "Purged stale staging halves");
        }
        Ok(removed)
    }

    /// Current plan-switch watermark of a line
    pub async fn watermark(&self, line: &str) -> Result<Watermark> {
        self.store.line_watermark(line).await
    }
}

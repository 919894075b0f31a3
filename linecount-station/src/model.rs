//! Domain types shared by the store, pairing engine, lifecycle manager and sync coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Code family a half was printed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanFormat {
    Qr,
    Barcode,
}

impl ScanFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanFormat::Qr => "QR",
            ScanFormat::Barcode => "BARCODE",
        }
    }

    /// The format that completes a half of this format
    pub fn opposite(&self) -> ScanFormat {
        match self {
            ScanFormat::Qr => ScanFormat::Barcode,
            ScanFormat::Barcode => ScanFormat::Qr,
        }
    }
}

impl fmt::Display for ScanFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "QR" => Ok(ScanFormat::Qr),
            "BARCODE" | "BC" => Ok(ScanFormat::Barcode),
            other => Err(format!("unknown scan format: {}", other)),
        }
    }
}

/// One normalized scan of one half
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanEvent {
    pub raw: String,
    pub format: ScanFormat,
    pub part_no: String,
    #[serde(default)]
    pub lot_no: String,
    #[serde(default)]
    pub sequence: String,
    #[serde(default)]
    pub station: String,
    pub line: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    pub scanned_at: DateTime<Utc>,
}

fn default_quantity() -> i64 {
    1
}

impl ScanEvent {
    /// Trim and uppercase the matching keys
    pub fn normalized(mut self) -> Self {
        self.raw = self.raw.trim().to_string();
        self.part_no = normalize_key(&self.part_no);
        self.line = normalize_key(&self.line);
        self.lot_no = self.lot_no.trim().to_uppercase();
        self.sequence = self.sequence.trim().to_string();
        self.station = self.station.trim().to_string();
        if self.quantity < 1 {
            self.quantity = 1;
        }
        self
    }
}

/// Matching keys compare trimmed and uppercased
pub fn normalize_key(value: &str) -> String {
    value.trim().to_uppercase()
}

/// Work-order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanStatus {
    Planned,
    Active,
    Paused,
    Closed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Planned => "PLANNED",
            PlanStatus::Active => "ACTIVE",
            PlanStatus::Paused => "PAUSED",
            PlanStatus::Closed => "CLOSED",
        }
    }

    /// Label the shared backend stores
    pub fn remote_label(&self) -> &'static str {
        match self {
            PlanStatus::Planned => "PLAN",
            PlanStatus::Active => "EN PROGRESO",
            PlanStatus::Paused => "PAUSADO",
            PlanStatus::Closed => "TERMINADO",
        }
    }

    /// Parse either vocabulary; cancelled rows return None
    pub fn from_label(label: &str) -> Option<PlanStatus> {
        match label.trim().to_uppercase().as_str() {
            "PLANNED" | "PLAN" | "PENDIENTE" => Some(PlanStatus::Planned),
            "ACTIVE" | "EN PROGRESO" | "EN_PROGRESO" => Some(PlanStatus::Active),
            "PAUSED" | "PAUSADO" => Some(PlanStatus::Paused),
            "CLOSED" | "TERMINADO" | "COMPLETADO" => Some(PlanStatus::Closed),
            _ => None,
        }
    }

    pub fn is_cancelled_label(label: &str) -> bool {
        matches!(label.trim().to_uppercase().as_str(), "CANCELLED" | "CANCELADO")
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, PlanStatus::Closed)
    }

    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, next),
            (Planned, Active)
                | (Planned, Closed)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Closed)
                | (Paused, Closed)
        )
    }

    /// Selection preference (lower wins): PLANNED, then PAUSED, then ACTIVE
    pub(crate) fn selection_rank(&self) -> u8 {
        match self {
            PlanStatus::Planned => 0,
            PlanStatus::Paused => 1,
            PlanStatus::Active => 2,
            PlanStatus::Closed => u8::MAX,
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlanStatus::from_label(s).ok_or_else(|| format!("unknown plan status: {}", s))
    }
}

/// Work order as cached locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub id: i64,
    pub work_date: String,
    pub line: String,
    pub part_no: String,
    pub lot_no: String,
    pub model_code: String,
    pub target_count: i64,
    pub produced_count: i64,
    pub status: PlanStatus,
    pub sequence: i64,
    /// Units per hour the plan is scheduled at
    pub target_rate: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub planned_start: Option<String>,
    pub planned_end: Option<String>,
    pub effective_minutes: i64,
    pub last_completion_at: Option<DateTime<Utc>>,
}

impl PlanItem {
    pub fn is_complete(&self) -> bool {
        self.produced_count >= self.target_count
    }

    pub fn remaining(&self) -> i64 {
        (self.target_count - self.produced_count).max(0)
    }

    /// Open and still short of target
    pub fn is_eligible(&self) -> bool {
        self.status.is_open() && !self.is_complete()
    }
}

/// Plan definition as pulled from the remote store
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePlan {
    pub id: i64,
    pub work_date: String,
    pub line: String,
    pub part_no: String,
    pub lot_no: String,
    pub model_code: String,
    pub target_count: i64,
    pub produced_count: i64,
    pub status: PlanStatus,
    pub sequence: i64,
    pub target_rate: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub planned_start: Option<String>,
    pub planned_end: Option<String>,
    pub effective_minutes: i64,
}

/// Per-part row of the current day's totals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyTotal {
    pub part_no: String,
    pub produced: i64,
    pub target: i64,
    pub target_rate: i64,
    /// Units completed in the last hour
    pub rate: i64,
}

/// Line-level rollup of the current day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineMetrics {
    pub line: String,
    pub planned: i64,
    pub produced: i64,
    pub efficiency_pct: f64,
    pub rate: i64,
    pub headcount: u32,
    /// Units per person-hour over the last hour (0 when headcount is unknown)
    pub units_per_person_hour: f64,
}

/// Staging diagnostics per line and format
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagingStatus {
    pub line: String,
    pub format: ScanFormat,
    pub pending: i64,
    pub oldest_age_secs: i64,
}

/// Result of submitting one scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome")]
pub enum ScanOutcome {
    /// Completed a unit
    Paired { unit_id: i64 },
    /// Staged; waiting for the given format
    AwaitingPair { expected: ScanFormat },
    DuplicateIgnored,
    /// Same format already pending for this part and line
    DuplicateFormat,
    OutOfPlan,
    PlanComplete,
    CrossRefMismatch,
    /// A lower-sequence plan for another part is still open
    ModelMismatch { active_part_no: String },
    Error { reason: String },
}

impl ScanOutcome {
    /// Short, stable reason code
    pub fn reason_code(&self) -> &'static str {
        match self {
            ScanOutcome::Paired { .. } => "PAIRED",
            ScanOutcome::AwaitingPair { .. } => "AWAITING_PAIR",
            ScanOutcome::DuplicateIgnored => "DUPLICATE",
            ScanOutcome::DuplicateFormat => "DUPLICATE_FORMAT",
            ScanOutcome::OutOfPlan => "OUT_OF_PLAN",
            ScanOutcome::PlanComplete => "PLAN_COMPLETE",
            ScanOutcome::CrossRefMismatch => "CROSS_REF_MISMATCH",
            ScanOutcome::ModelMismatch { .. } => "MODEL_MISMATCH",
            ScanOutcome::Error { .. } => "ERROR",
        }
    }

    /// Scan was stored (paired or staged)
    pub fn is_accepted(&self) -> bool {
        matches!(self, ScanOutcome::Paired { .. } | ScanOutcome::AwaitingPair { .. })
    }

    /// Operator-facing text: reason code plus the raw scanned text
    pub fn describe(&self, raw: &str) -> String {
        match self {
            ScanOutcome::ModelMismatch { active_part_no } => {
                format!("{} ({}): {}", self.reason_code(), active_part_no, raw)
            }
            ScanOutcome::Error { reason } => format!("{} ({}): {}", self.reason_code(), reason, raw),
            _ => format!("{}: {}", self.reason_code(), raw),
        }
    }
}

/// What a completion listener is told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    UnitCompleted,
    HalfStaged,
    Rejected,
}

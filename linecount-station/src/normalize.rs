//! Scan normalization seam
//!
//! Raw code text parsing lives outside this crate. The station only consumes
//! a [`ScanNormalizer`] that yields a [`ScanEvent`] or a [`NormalizeError`].

use crate::model::{ScanEvent, ScanFormat};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("empty scan")]
    Empty,

    #[error("unreadable scan: {0}")]
    Unreadable(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// Turns raw scanner text into a normalized scan
pub trait ScanNormalizer: Send + Sync {
    fn normalize(&self, raw: &str, line: &str, now: DateTime<Utc>) -> Result<ScanEvent, NormalizeError>;
}

/// Reads records already normalized upstream, one JSON object per scan:
///
/// ```json
/// {"code": "...", "format": "QR", "part_no": "EBR123", "lot_no": "L1"}
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonNormalizer;

#[derive(Deserialize)]
struct JsonScan {
    code: Option<String>,
    format: Option<String>,
    part_no: Option<String>,
    #[serde(default)]
    lot_no: String,
    #[serde(default)]
    sequence: String,
    #[serde(default)]
    station: String,
    line: Option<String>,
    quantity: Option<i64>,
}

impl ScanNormalizer for JsonNormalizer {
    fn normalize(&self, raw: &str, line: &str, now: DateTime<Utc>) -> Result<ScanEvent, NormalizeError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(NormalizeError::Empty);
        }

        let parsed: JsonScan =
            serde_json::from_str(raw).map_err(|e| NormalizeError::Unreadable(e.to_string()))?;

        let code = parsed.code.filter(|c| !c.trim().is_empty()).ok_or(NormalizeError::MissingField("code"))?;
        let format: ScanFormat = parsed
            .format
            .ok_or(NormalizeError::MissingField("format"))?
            .parse()
            .map_err(NormalizeError::Unreadable)?;
        let part_no = parsed
            .part_no
            .filter(|p| !p.trim().is_empty())
            .ok_or(NormalizeError::MissingField("part_no"))?;

        Ok(ScanEvent {
            raw: code,
            format,
            part_no,
            lot_no: parsed.lot_no,
            sequence: parsed.sequence,
            station: parsed.station,
            line: parsed.line.unwrap_or_else(|| line.to_string()),
            quantity: parsed.quantity.unwrap_or(1),
            scanned_at: now,
        }
        .normalized())
    }
}

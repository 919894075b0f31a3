//! # LineCount Station
//!
//! Counts finished units on a production line by reconciling two scans per
//! unit (a QR label and a BARCODE label) into one completed unit, tracks work
//! orders per line, and replicates everything to an intermittently reachable
//! remote database.
//!
//! **Components:**
//! - [`store`]: local SQLite persistence (staging, units, aggregates, plan cache)
//! - [`pairing`]: QR/BARCODE reconciliation
//! - [`lifecycle`]: work-order state machine and increment buffer
//! - [`remote`]: remote backend trait with MySQL and SQLite implementations
//! - [`sync`]: background replication loops and offline window
//! - [`service`]: the [`CounterService`] facade

pub mod lifecycle;
pub mod locks;
pub mod model;
pub mod normalize;
pub mod pairing;
pub mod remote;
pub mod service;
pub mod store;
pub mod sync;

pub use model::{
    CompletionKind, DailyTotal, LineMetrics, PlanItem, PlanStatus, RemotePlan, ScanEvent, ScanFormat, ScanOutcome,
    StagingStatus,
};
pub use normalize::{JsonNormalizer, NormalizeError, ScanNormalizer};
pub use remote::{MySqlRemote, RemoteError, RemoteStore, SqliteRemote};
pub use service::{CounterService, StartupReport};

//! # LineCount Common Library
//!
//! Shared code for the line counting station:
//! - Error and result types
//! - Configuration loading
//! - Clock abstraction and working-day calendar
//! - Retry policy for transient failures
//! - Event types (LineEvent enum) and EventBus
//! - Local database initialization and migrations

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock, WorkCalendar};
pub use error::{Error, Result};
pub use retry::RetryPolicy;

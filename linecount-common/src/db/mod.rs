//! Local database initialization and schema

pub mod init;
pub mod migrations;

pub use init::*;
pub use migrations::run_migrations;

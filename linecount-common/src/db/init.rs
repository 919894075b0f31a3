//! Local database initialization
//!
//! Creates the station database on first run and opens it in WAL mode with a
//! short busy timeout so lock contention surfaces quickly to the retry loop.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Open (creating if needed) the local database and bring its schema up to date
pub async fn init_database(db_path: &Path, busy_timeout_ms: u64) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;
    crate::db::migrations::run_migrations(&pool).await?;

    info!("Database busy timeout set to {} ms", busy_timeout_ms);
    Ok(pool)
}

/// Create every table and index (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_staging_halves_table(pool).await?;
    create_unit_halves_table(pool).await?;
    create_daily_aggregates_table(pool).await?;
    create_plan_cache_table(pool).await?;
    create_line_watermarks_table(pool).await?;
    create_cross_refs_table(pool).await?;
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Halves waiting for the complementary format
///
/// AUTOINCREMENT keeps ids monotonic across purges; line watermarks compare
/// against them.
async fn create_staging_halves_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS staging_halves (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            raw TEXT NOT NULL,
            format TEXT NOT NULL CHECK (format IN ('QR', 'BARCODE')),
            part_no TEXT NOT NULL,
            lot_no TEXT NOT NULL DEFAULT '',
            sequence TEXT NOT NULL DEFAULT '',
            station TEXT NOT NULL DEFAULT '',
            line TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            scanned_at_ms INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_staging_format_raw ON staging_halves(format, raw)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_staging_line_format ON staging_halves(line, format, created_at_ms)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Final halves of completed units
///
/// Each half points at its partner through `linked_scan_id`. The primary half
/// (QR, or the real half in solo mode) carries the unit-level bookkeeping:
/// `synced`, `plan_id` and `increment_pushed`.
async fn create_unit_halves_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS unit_halves (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            raw TEXT NOT NULL,
            format TEXT NOT NULL CHECK (format IN ('QR', 'BARCODE')),
            part_no TEXT NOT NULL,
            scanned_part_no TEXT NOT NULL DEFAULT '',
            lot_no TEXT NOT NULL DEFAULT '',
            sequence TEXT NOT NULL DEFAULT '',
            station TEXT NOT NULL DEFAULT '',
            line TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            work_date TEXT NOT NULL,
            scanned_at_ms INTEGER NOT NULL,
            completed_at_ms INTEGER,
            linked_scan_id INTEGER,
            is_primary INTEGER NOT NULL DEFAULT 0,
            synthetic INTEGER NOT NULL DEFAULT 0,
            plan_id INTEGER,
            synced INTEGER NOT NULL DEFAULT 0,
            synced_at_ms INTEGER,
            increment_pushed INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_units_format_raw ON unit_halves(format, raw)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_units_unsynced ON unit_halves(synced, is_primary, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_units_line_completed ON unit_halves(line, completed_at_ms)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_daily_aggregates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_aggregates (
            work_date TEXT NOT NULL,
            line TEXT NOT NULL,
            part_no TEXT NOT NULL,
            produced INTEGER NOT NULL DEFAULT 0,
            target_rate INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (work_date, line, part_no)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Local mirror of the remote plan table plus local overrides
async fn create_plan_cache_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plan_cache (
            id INTEGER PRIMARY KEY,
            work_date TEXT NOT NULL,
            line TEXT NOT NULL,
            part_no TEXT NOT NULL,
            lot_no TEXT NOT NULL DEFAULT '',
            model_code TEXT NOT NULL DEFAULT '',
            target_count INTEGER NOT NULL DEFAULT 0,
            produced_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'PLANNED',
            sequence INTEGER NOT NULL DEFAULT 0,
            target_rate INTEGER NOT NULL DEFAULT 0,
            started_at_ms INTEGER,
            planned_start TEXT,
            planned_end TEXT,
            effective_minutes INTEGER NOT NULL DEFAULT 0,
            status_dirty INTEGER NOT NULL DEFAULT 0,
            last_completion_ms INTEGER,
            updated_at_ms INTEGER NOT NULL,
            synced_at_ms INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_plan_cache_line ON plan_cache(line, work_date, sequence)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-line plan-switch watermark
///
/// Moved to the highest staging id when a line's first scan for a different
/// plan arrives. Halves staged at or below `staging_id` never pair again.
async fn create_line_watermarks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS line_watermarks (
            line TEXT PRIMARY KEY,
            staging_id INTEGER NOT NULL DEFAULT 0,
            part_no TEXT NOT NULL DEFAULT '',
            plan_id INTEGER,
            updated_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Main part number -> sub-assembly part number
async fn create_cross_refs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cross_refs (
            part_no TEXT PRIMARY KEY,
            sub_assy TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_creates_all_tables() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("station.db"), 250).await.unwrap();

        for table in [
            "schema_version",
            "staging_halves",
            "unit_halves",
            "daily_aggregates",
            "plan_cache",
            "line_watermarks",
            "cross_refs",
        ] {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert!(exists, "missing table {}", table);
        }
    }

    #[tokio::test]
    async fn test_staging_rejects_duplicate_raw_per_format() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();

        let insert = r#"
            INSERT INTO staging_halves (raw, format, part_no, line, scanned_at_ms, created_at_ms)
            VALUES (?, ?, 'P1', 'M1', 0, 0)
        "#;
        sqlx::query(insert).bind("ABC").bind("QR").execute(&pool).await.unwrap();
        // Same raw in the other format is a different key
        sqlx::query(insert).bind("ABC").bind("BARCODE").execute(&pool).await.unwrap();
        assert!(sqlx::query(insert).bind("ABC").bind("QR").execute(&pool).await.is_err());
    }
}

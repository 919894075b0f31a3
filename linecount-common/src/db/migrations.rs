//! Database schema migrations
//!
//! Versioned, idempotent migrations tracked in the `schema_version` table.
//! Tables are created with their current shape by `create_schema`; migrations
//! only bring station databases created by older builds up to date.
//!
//! # Migration Guidelines
//!
//! 1. Never modify an existing migration
//! 2. Add a new `migrate_vN` for each schema change and bump `CURRENT_SCHEMA_VERSION`
//! 3. Check for the column before `ALTER TABLE` so reruns are harmless

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Get current schema version from database (0 when never migrated)
async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    info!("All migrations completed successfully");
    Ok(())
}

async fn has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Migration v1: scanned part number on unit halves
///
/// Cross-reference pairing stores the final (main) part number in `part_no`;
/// the part actually printed on each half moved to `scanned_part_no`.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    if has_column(pool, "unit_halves", "scanned_part_no").await? {
        return Ok(());
    }

    sqlx::query("ALTER TABLE unit_halves ADD COLUMN scanned_part_no TEXT NOT NULL DEFAULT ''")
        .execute(pool)
        .await?;
    sqlx::query("UPDATE unit_halves SET scanned_part_no = part_no WHERE scanned_part_no = ''")
        .execute(pool)
        .await?;

    info!("Migration v1: added scanned_part_no to unit_halves");
    Ok(())
}

/// Migration v2: last completion time on cached plans (inactivity pause)
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    if has_column(pool, "plan_cache", "last_completion_ms").await? {
        return Ok(());
    }

    sqlx::query("ALTER TABLE plan_cache ADD COLUMN last_completion_ms INTEGER")
        .execute(pool)
        .await?;

    info!("Migration v2: added last_completion_ms to plan_cache");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrations_upgrade_old_unit_table() {
        let pool = memory_pool().await;
        sqlx::query(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("CREATE TABLE unit_halves (id INTEGER PRIMARY KEY, part_no TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE plan_cache (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO unit_halves (id, part_no) VALUES (1, 'EBR1')")
            .execute(&pool)
            .await
            .unwrap();

        run_migrations(&pool).await.unwrap();

        let scanned: String = sqlx::query_scalar("SELECT scanned_part_no FROM unit_halves WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(scanned, "EBR1");
        assert!(has_column(&pool, "plan_cache", "last_completion_ms").await.unwrap());
        assert_eq!(get_schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);

        // Second run is a no-op
        run_migrations(&pool).await.unwrap();
    }
}

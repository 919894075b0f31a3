//! Main part -> sub-assembly cache

use linecount_common::Result;
use sqlx::SqliteConnection;

pub(crate) async fn sub_assembly_of(conn: &mut SqliteConnection, part_no: &str) -> Result<Option<String>> {
    let sub: Option<String> = sqlx::query_scalar("SELECT sub_assy FROM cross_refs WHERE part_no = ?")
        .bind(part_no)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(sub)
}

/// Replace the cache with a fresh snapshot
pub(crate) async fn replace_all(
    conn: &mut SqliteConnection,
    rows: &[(String, String)],
    now_ms: i64,
) -> Result<usize> {
    sqlx::query("DELETE FROM cross_refs").execute(&mut *conn).await?;
    for (part_no, sub_assy) in rows {
        sqlx::query(
            "INSERT OR REPLACE INTO cross_refs (part_no, sub_assy, updated_at_ms) VALUES (?, ?, ?)",
        )
        .bind(part_no)
        .bind(sub_assy)
        .bind(now_ms)
        .execute(&mut *conn)
        .await?;
    }
    Ok(rows.len())
}

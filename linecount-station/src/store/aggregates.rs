//! Daily aggregate per (work date, line, part)

use linecount_common::Result;
use sqlx::{FromRow, SqliteConnection};

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DailyAggregate {
    pub part_no: String,
    pub produced: i64,
    pub target_rate: i64,
}

pub(crate) async fn bump(
    conn: &mut SqliteConnection,
    work_date: &str,
    line: &str,
    part_no: &str,
    quantity: i64,
    target_rate: i64,
    now_ms: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daily_aggregates (work_date, line, part_no, produced, target_rate, updated_at_ms)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(work_date, line, part_no) DO UPDATE SET
            produced = produced + excluded.produced,
            target_rate = CASE WHEN excluded.target_rate > 0 THEN excluded.target_rate ELSE target_rate END,
            updated_at_ms = excluded.updated_at_ms
        "#,
    )
    .bind(work_date)
    .bind(line)
    .bind(part_no)
    .bind(quantity)
    .bind(target_rate)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn for_line(
    conn: &mut SqliteConnection,
    work_date: &str,
    line: &str,
) -> Result<Vec<DailyAggregate>> {
    let rows = sqlx::query_as::<_, DailyAggregate>(
        r#"
        SELECT part_no, produced, target_rate FROM daily_aggregates
        WHERE work_date = ? AND line = ?
        ORDER BY part_no
        "#,
    )
    .bind(work_date)
    .bind(line)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

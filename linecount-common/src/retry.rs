//! Retry policy for transient failures
//!
//! One policy shape (attempt bound + exponential backoff) drives both local
//! lock-contention retries and transient remote errors.

use crate::{Error, Result};
use serde::Deserialize;
use std::future::Future;
use std::time::{Duration, Instant};

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff_ms: u64,
    /// Ceiling for the doubled delay
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the given failed attempt (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Retry a local database operation while SQLite reports the database as locked.
///
/// **Algorithm:**
/// 1. Attempt operation
/// 2. Success: return result
/// 3. Lock error and attempts remain: log WARN, back off, retry
/// 4. Lock error on the last attempt: return [`Error::TransientStorage`]
/// 5. Any other error: return it immediately
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Local store operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if err.is_lock_contention() => {
                if attempt >= max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Local store still locked, giving up"
                    );
                    return Err(Error::TransientStorage {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                    });
                }

                let backoff = policy.backoff_after(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Local store locked, will retry after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        };
        assert_eq!(policy.backoff_after(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_after(4), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let result = retry_on_lock("test_op", &RetryPolicy::default(), || async {
            Ok::<i32, Error>(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_non_lock_error_fails_immediately() {
        let mut attempts = 0;

        let result = retry_on_lock("test_op", &RetryPolicy::default(), || {
            attempts += 1;
            async move { Err::<i32, Error>(Error::Internal("other error".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Internal(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_lock_error_exhausts_attempts() {
        use sqlx::sqlite::SqlitePoolOptions;

        // Hold a write transaction on one connection so a second connection sees SQLITE_BUSY
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("lock.db").display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        sqlx::query("PRAGMA busy_timeout = 0").execute(&pool).await.unwrap();
        sqlx::query("CREATE TABLE t (x INTEGER)").execute(&pool).await.unwrap();

        let mut holder = pool.acquire().await.unwrap();
        sqlx::query("PRAGMA busy_timeout = 0").execute(&mut *holder).await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *holder).await.unwrap();

        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        let mut attempts = 0;
        let result = retry_on_lock("insert", &policy, || {
            attempts += 1;
            let pool = pool.clone();
            async move {
                let mut conn = pool.acquire().await?;
                sqlx::query("PRAGMA busy_timeout = 0").execute(&mut *conn).await?;
                sqlx::query("INSERT INTO t (x) VALUES (1)").execute(&mut *conn).await?;
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(Error::TransientStorage { attempts: 3, .. })));
        assert_eq!(attempts, 3);

        sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
    }
}

//! SQLite implementation of [`StepStore`]
//!
//! SQLite's `BEGIN IMMEDIATE` is a write-intent transaction: it takes
//! the RESERVED lock up front rather than deferring to the first write,
//! so two connections racing to reserve the same fresh key are totally
//! ordered by SQLite itself rather than by application-level locking.
//! Contention surfaces as `SQLITE_BUSY`/"database is locked", which this
//! adapter retries with bounded linear backoff.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};

use super::{now_ms, Reservation, StepRecord, StepStatus, StepStore, StoreError};

/// Retry budget for transient SQLite contention.
#[derive(Debug, Clone, Copy)]
pub struct StoreRetryConfig {
    /// Maximum number of attempts before giving up with [`StoreError::RetriesExhausted`].
    pub busy_retries: u32,
    /// Base backoff delay; the Nth retry waits `retry_backoff_ms * (N + 1)`.
    pub retry_backoff_ms: u64,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            busy_retries: 8,
            retry_backoff_ms: 40,
        }
    }
}

/// SQLite-backed step store.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> anyhow::Result<()> {
/// use durable_steps::store::SqliteStepStore;
///
/// let store = SqliteStepStore::connect("sqlite://workflows.db").await?;
/// store.initialize().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SqliteStepStore {
    pool: SqlitePool,
    retry: StoreRetryConfig,
}

impl SqliteStepStore {
    /// Connect to (creating if missing) a SQLite database at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options: SqliteConnectOptions = url
            .parse()
            .map_err(|e: sqlx::Error| StoreError::Database(e.to_string()))?;
        let options = options.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            pool,
            retry: StoreRetryConfig::default(),
        })
    }

    /// Wrap an already-constructed pool (e.g. an in-memory `sqlite::memory:` pool shared across connections).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: StoreRetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: StoreRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn is_busy(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db_err) => {
                let msg = db_err.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            _ => false,
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.retry.retry_backoff_ms * (attempt as u64 + 1);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<StepRecord, StoreError> {
    let status_str: String = row.try_get("status").map_err(db_err)?;
    let status = StepStatus::parse(&status_str)
        .ok_or_else(|| StoreError::Database(format!("unknown step status `{status_str}`")))?;

    Ok(StepRecord {
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        step_key: row.try_get("step_key").map_err(db_err)?,
        step_id: row.try_get("step_id").map_err(db_err)?,
        status,
        output_json: row.try_get("output_json").map_err(db_err)?,
        output_type: row.try_get("output_type").map_err(db_err)?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        attempt: row.try_get::<i64, _>("attempt").map_err(db_err)? as u32,
        owner: row.try_get("owner").map_err(db_err)?,
        started_at_ms: row.try_get("started_at_ms").map_err(db_err)?,
        updated_at_ms: row.try_get("updated_at_ms").map_err(db_err)?,
    })
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

#[async_trait]
impl StepStore for SqliteStepStore {
    #[instrument(skip(self))]
    async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS steps (
                workflow_id   TEXT NOT NULL,
                step_key      TEXT NOT NULL,
                step_id       TEXT NOT NULL,
                status        TEXT NOT NULL,
                output_json   TEXT,
                output_type   TEXT,
                error_message TEXT,
                attempt       INTEGER NOT NULL DEFAULT 0,
                owner         TEXT,
                started_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (workflow_id, step_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_steps_workflow_status ON steps(workflow_id, status)",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!("initialized steps schema");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reserve(
        &self,
        workflow_id: &str,
        step_key: &str,
        step_id: &str,
        owner: &str,
        lease_ms: u64,
    ) -> Result<Reservation, StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.try_reserve(workflow_id, step_key, step_id, owner, lease_ms).await {
                Ok(reservation) => return Ok(reservation),
                Err(TryReserveError::Busy(e)) => {
                    if attempt >= self.retry.busy_retries {
                        warn!(workflow_id, step_key, attempt, "reservation retries exhausted");
                        return Err(StoreError::RetriesExhausted { attempts: attempt });
                    }
                    debug!(workflow_id, step_key, attempt, error = %e, "retrying reservation after busy");
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                Err(TryReserveError::Other(e)) => return Err(e),
            }
        }
    }

    #[instrument(skip(self, output_json))]
    async fn complete(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        output_json: Option<String>,
        output_type: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET status = 'COMPLETED',
                output_json = ?,
                output_type = ?,
                error_message = NULL,
                updated_at_ms = ?
            WHERE workflow_id = ? AND step_key = ? AND owner = ? AND status = 'RUNNING'
            "#,
        )
        .bind(&output_json)
        .bind(output_type)
        .bind(now_ms())
        .bind(workflow_id)
        .bind(step_key)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OwnershipLost {
                workflow_id: workflow_id.to_string(),
                step_key: step_key.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail(
        &self,
        workflow_id: &str,
        step_key: &str,
        owner: &str,
        error_message: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET status = 'FAILED',
                error_message = ?,
                updated_at_ms = ?
            WHERE workflow_id = ? AND step_key = ? AND owner = ? AND status = 'RUNNING'
            "#,
        )
        .bind(error_message)
        .bind(now_ms())
        .bind(workflow_id)
        .bind(step_key)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OwnershipLost {
                workflow_id: workflow_id.to_string(),
                step_key: step_key.to_string(),
            });
        }
        Ok(())
    }
}

enum TryReserveError {
    Busy(sqlx::Error),
    Other(StoreError),
}

impl SqliteStepStore {
    async fn try_reserve(
        &self,
        workflow_id: &str,
        step_key: &str,
        step_id: &str,
        owner: &str,
        lease_ms: u64,
    ) -> Result<Reservation, TryReserveError> {
        let mut conn = self.pool.acquire().await.map_err(|e| TryReserveError::Other(db_err(e)))?;

        if let Err(e) = sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
            return Err(if Self::is_busy(&e) {
                TryReserveError::Busy(e)
            } else {
                TryReserveError::Other(db_err(e))
            });
        }

        let result = self.reserve_in_transaction(&mut conn, workflow_id, step_key, step_id, owner, lease_ms).await;

        match &result {
            Ok(_) => {
                if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
                    return Err(TryReserveError::Other(db_err(e)));
                }
            }
            Err(_) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            }
        }

        result
    }

    async fn reserve_in_transaction(
        &self,
        conn: &mut sqlx::pool::PoolConnection<sqlx::Sqlite>,
        workflow_id: &str,
        step_key: &str,
        step_id: &str,
        owner: &str,
        lease_ms: u64,
    ) -> Result<Reservation, TryReserveError> {
        let existing = sqlx::query("SELECT * FROM steps WHERE workflow_id = ? AND step_key = ?")
            .bind(workflow_id)
            .bind(step_key)
            .fetch_optional(&mut **conn)
            .await
            .map_err(|e| TryReserveError::Other(db_err(e)))?;

        let now = now_ms();

        let existing = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO steps
                        (workflow_id, step_key, step_id, status, attempt, owner, started_at_ms, updated_at_ms)
                    VALUES (?, ?, ?, 'RUNNING', 1, ?, ?, ?)
                    "#,
                )
                .bind(workflow_id)
                .bind(step_key)
                .bind(step_id)
                .bind(owner)
                .bind(now)
                .bind(now)
                .execute(&mut **conn)
                .await
                .map_err(|e| TryReserveError::Other(db_err(e)))?;

                let record = StepRecord {
                    workflow_id: workflow_id.to_string(),
                    step_key: step_key.to_string(),
                    step_id: step_id.to_string(),
                    status: StepStatus::Running,
                    output_json: None,
                    output_type: None,
                    error_message: None,
                    attempt: 1,
                    owner: Some(owner.to_string()),
                    started_at_ms: now,
                    updated_at_ms: now,
                };
                return Ok(Reservation::Acquired(record));
            }
            Some(row) => row_to_record(&row).map_err(TryReserveError::Other)?,
        };

        match existing.status {
            StepStatus::Completed => Ok(Reservation::Cached(existing)),
            StepStatus::Running | StepStatus::Failed => {
                let stale = existing.status == StepStatus::Running
                    && now.saturating_sub(existing.updated_at_ms) > lease_ms as i64;
                let same_owner =
                    existing.status == StepStatus::Running && existing.owner.as_deref() == Some(owner);

                if existing.status == StepStatus::Failed || stale || same_owner {
                    let new_attempt = existing.attempt + 1;
                    sqlx::query(
                        r#"
                        UPDATE steps
                        SET status = 'RUNNING',
                            owner = ?,
                            output_json = NULL,
                            output_type = NULL,
                            error_message = NULL,
                            attempt = ?,
                            updated_at_ms = ?
                        WHERE workflow_id = ? AND step_key = ?
                        "#,
                    )
                    .bind(owner)
                    .bind(new_attempt as i64)
                    .bind(now)
                    .bind(workflow_id)
                    .bind(step_key)
                    .execute(&mut **conn)
                    .await
                    .map_err(|e| TryReserveError::Other(db_err(e)))?;

                    Ok(Reservation::Acquired(StepRecord {
                        status: StepStatus::Running,
                        owner: Some(owner.to_string()),
                        output_json: None,
                        output_type: None,
                        error_message: None,
                        attempt: new_attempt,
                        updated_at_ms: now,
                        ..existing
                    }))
                } else {
                    Ok(Reservation::RunningElsewhere(existing))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> SqliteStepStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.db");
        // Leak the tempdir so the file survives for the store's lifetime within the test.
        std::mem::forget(dir);
        let store = SqliteStepStore::connect(&format!("sqlite://{}", path.display()))
            .await
            .unwrap();
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn fresh_key_is_acquired_with_attempt_one() {
        let store = temp_store().await;
        let res = store.reserve("wf", "k1", "a", "w1", 3_000).await.unwrap();
        assert!(matches!(res, Reservation::Acquired(r) if r.attempt == 1));
    }

    #[tokio::test]
    async fn completed_step_is_served_cached() {
        let store = temp_store().await;
        store.reserve("wf", "k1", "a", "w1", 3_000).await.unwrap();
        store
            .complete("wf", "k1", "w1", Some("1".into()), "i64")
            .await
            .unwrap();

        let res = store.reserve("wf", "k1", "a", "w2", 3_000).await.unwrap();
        assert!(matches!(res, Reservation::Cached(r) if r.output_json.as_deref() == Some("1")));
    }

    #[tokio::test]
    async fn complete_without_ownership_fails() {
        let store = temp_store().await;
        store.reserve("wf", "k1", "a", "w1", 3_000).await.unwrap();
        let err = store
            .complete("wf", "k1", "someone-else", Some("1".into()), "i64")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OwnershipLost { .. }));
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed_with_incremented_attempt() {
        let store = temp_store().await;
        store.reserve("wf", "k1", "a", "w1", 3_000).await.unwrap();
        let res = store.reserve("wf", "k1", "a", "w2", 0).await.unwrap();
        assert!(matches!(res, Reservation::Acquired(r) if r.attempt == 2));
    }

    #[tokio::test]
    async fn concurrent_reservations_on_fresh_key_yield_exactly_one_winner() {
        let store = std::sync::Arc::new(temp_store().await);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .reserve("wf", "k1", "a", &format!("w{i}"), 3_000)
                    .await
                    .unwrap()
            }));
        }

        let mut acquired = 0;
        let mut elsewhere = 0;
        for h in handles {
            match h.await.unwrap() {
                Reservation::Acquired(r) => {
                    assert_eq!(r.attempt, 1);
                    acquired += 1;
                }
                Reservation::RunningElsewhere(_) => elsewhere += 1,
                Reservation::Cached(_) => panic!("nothing should be cached yet"),
            }
        }
        assert_eq!(acquired, 1);
        assert_eq!(elsewhere, 7);
    }
}

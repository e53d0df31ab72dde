//! # PostgreSQL Operation Store
//!
//! Operations are stored as a JSONB document next to the columns the scheduler
//! queries on (`state`, `version`, `due_at`, lease columns).
//!
//! ## Claiming
//!
//! `claim_due` selects due rows with `FOR UPDATE SKIP LOCKED` and stamps the lease in
//! the same statement, so concurrent schedulers never claim the same operation while
//! a lease is live. Expired leases are claimable again.
//!
//! ```rust,no_run
//! use runtime_lifecycle::storage::{Operations, PgOperations};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let store = PgOperations::new(pool);
//! store.migrate().await?;
//!
//! let due = store.list_due(chrono::Utc::now()).await?;
//! println!("{} operations due", due.len());
//! # Ok(())
//! # }
//! ```

use super::{lease_deadline, Operations, StorageError, StorageResult};
use crate::models::Operation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    data: Json<Operation>,
    version: i64,
}

impl OperationRow {
    fn into_operation(self) -> Operation {
        let mut operation = self.data.0;
        operation.version = u64::try_from(self.version).unwrap_or_default();
        operation
    }
}

fn db_error(context: &str, err: sqlx::Error) -> StorageError {
    error!("{context}: {err}");
    StorageError::Database(format!("{context}: {err}"))
}

fn to_db_version(version: u64) -> StorageResult<i64> {
    i64::try_from(version)
        .map_err(|_| StorageError::Database(format!("version {version} out of range")))
}

pub struct PgOperations {
    pool: PgPool,
}

impl PgOperations {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Database(format!("migration failed: {e}")))
    }
}

#[async_trait]
impl Operations for PgOperations {
    async fn get(&self, id: &str) -> StorageResult<Operation> {
        sqlx::query_as::<_, OperationRow>(
            "SELECT data, version FROM lifecycle_operations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load operation", e))?
        .map(OperationRow::into_operation)
        .ok_or_else(|| StorageError::NotFound { id: id.to_string() })
    }

    #[instrument(skip(self, operation), fields(operation_id = %operation.id()))]
    async fn insert(&self, operation: &Operation) -> StorageResult<()> {
        let query = r#"
            INSERT INTO lifecycle_operations
                (id, instance_id, operation_type, state, version, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
        "#;

        let result = sqlx::query(query)
            .bind(operation.id())
            .bind(operation.instance_id())
            .bind(operation.operation_type().as_str())
            .bind(operation.state.as_str())
            .bind(to_db_version(operation.version)?)
            .bind(Json(operation))
            .bind(operation.created_at())
            .bind(operation.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to insert operation", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AlreadyExists {
                id: operation.id().to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self, operation), fields(operation_id = %operation.id(), version = operation.version))]
    async fn update(&self, operation: &Operation) -> StorageResult<Operation> {
        let query = r#"
            UPDATE lifecycle_operations
            SET data = $2, state = $3, updated_at = $4, version = version + 1
            WHERE id = $1 AND version = $5 AND instance_id = $6 AND operation_type = $7
            RETURNING version
        "#;

        let updated: Option<(i64,)> = sqlx::query_as(query)
            .bind(operation.id())
            .bind(Json(operation))
            .bind(operation.state.as_str())
            .bind(operation.updated_at)
            .bind(to_db_version(operation.version)?)
            .bind(operation.instance_id())
            .bind(operation.operation_type().as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to update operation", e))?;

        if let Some((version,)) = updated {
            let mut stored = operation.clone();
            stored.version = u64::try_from(version).unwrap_or_default();
            return Ok(stored);
        }

        let current = self.get(operation.id()).await?;
        if current.version != operation.version {
            debug!(actual = current.version, "Version conflict on update");
            Err(StorageError::Conflict {
                id: operation.id().to_string(),
                expected: operation.version,
                actual: current.version,
            })
        } else {
            Err(StorageError::IdentityChanged {
                id: operation.id().to_string(),
            })
        }
    }

    async fn list_due(&self, before: DateTime<Utc>) -> StorageResult<Vec<Operation>> {
        let query = r#"
            SELECT data, version FROM lifecycle_operations
            WHERE due_at IS NOT NULL AND due_at <= $1
              AND state NOT IN ('succeeded', 'failed', 'canceled')
            ORDER BY due_at
        "#;

        let rows = sqlx::query_as::<_, OperationRow>(query)
            .bind(before)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list due operations", e))?;

        Ok(rows.into_iter().map(OperationRow::into_operation).collect())
    }

    async fn schedule(&self, id: &str, due_at: DateTime<Utc>) -> StorageResult<()> {
        let result = sqlx::query("UPDATE lifecycle_operations SET due_at = $2 WHERE id = $1")
            .bind(id)
            .bind(due_at)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to schedule operation", e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(owner = owner))]
    async fn claim_due(
        &self,
        before: DateTime<Utc>,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Operation>> {
        let now = Utc::now();
        let expires_at = lease_deadline(now, lease)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let query = r#"
            WITH due AS (
                SELECT id FROM lifecycle_operations
                WHERE due_at IS NOT NULL AND due_at <= $1
                  AND (claimed_by IS NULL OR claim_expires_at <= $2)
                ORDER BY due_at
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            UPDATE lifecycle_operations o
            SET claimed_by = $3, claim_expires_at = $4
            FROM due
            WHERE o.id = due.id
            RETURNING o.data, o.version
        "#;

        let rows = sqlx::query_as::<_, OperationRow>(query)
            .bind(before)
            .bind(now)
            .bind(owner)
            .bind(expires_at)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to claim due operations", e))?;

        if !rows.is_empty() {
            debug!(claimed_count = rows.len(), "Claimed due operations");
        }
        Ok(rows.into_iter().map(OperationRow::into_operation).collect())
    }

    #[instrument(skip(self), fields(owner = owner))]
    async fn release(
        &self,
        id: &str,
        owner: &str,
        next_due: Option<DateTime<Utc>>,
    ) -> StorageResult<bool> {
        let query = r#"
            UPDATE lifecycle_operations
            SET claimed_by = NULL, claim_expires_at = NULL, due_at = $3
            WHERE id = $1 AND claimed_by = $2
        "#;

        let result = sqlx::query(query)
            .bind(id)
            .bind(owner)
            .bind(next_due)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to release operation", e))?;

        let released = result.rows_affected() > 0;
        if !released {
            warn!(
                operation_id = id,
                "Operation lease was not released (not owned by this worker or already released)"
            );
        }
        Ok(released)
    }
}

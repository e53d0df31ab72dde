//! # Operation Storage
//!
//! Persistence contract for operations plus the due queue that drives the scheduler.
//!
//! ## Overview
//!
//! Records and scheduling are kept apart: `update` mutates the record under a
//! compare-and-swap on `version`, while `schedule` / `claim_due` / `release` only move
//! the operation's due time and lease. Requeueing therefore never touches
//! `updated_at`, which steps use for their own timeouts.
//!
//! ## Claiming
//!
//! `claim_due` hands out an exclusive, time-bounded lease per operation. A worker
//! that dies mid-step loses its lease once it expires and another worker picks the
//! operation up from its last persisted state.

use crate::models::Operation;
use crate::orchestration::error_classifier::{ClassifiedError, ErrComponent, ErrReason};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryOperations;
#[cfg(feature = "postgres")]
pub use postgres::PgOperations;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("operation {id} not found")]
    NotFound { id: String },

    #[error("operation {id} already exists")]
    AlreadyExists { id: String },

    #[error("version conflict on operation {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("identity fields of operation {id} cannot change")]
    IdentityChanged { id: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StorageError> for ClassifiedError {
    fn from(err: StorageError) -> Self {
        let message = err.to_string();
        match err {
            StorageError::Conflict { .. } => ClassifiedError::new(message)
                .with_component(ErrComponent::Storage)
                .with_reason(ErrReason::Conflict),
            StorageError::NotFound { .. } => ClassifiedError::new(message)
                .with_component(ErrComponent::Db)
                .with_reason(ErrReason::NotFound),
            StorageError::IdentityChanged { .. } => ClassifiedError::fatal(message)
                .with_component(ErrComponent::InternalValidation)
                .with_reason(ErrReason::Internal),
            StorageError::AlreadyExists { .. }
            | StorageError::Database(_)
            | StorageError::Serialization(_) => {
                ClassifiedError::new(message).with_component(ErrComponent::Db)
            }
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable operation store
#[async_trait]
pub trait Operations: Send + Sync {
    /// Load the current record
    async fn get(&self, id: &str) -> StorageResult<Operation>;

    /// Persist a new record; it is not due until scheduled
    async fn insert(&self, operation: &Operation) -> StorageResult<()>;

    /// Compare-and-swap on `version`; returns the stored record with its new version
    async fn update(&self, operation: &Operation) -> StorageResult<Operation>;

    /// Non-terminal operations due at or before `before`, earliest first
    async fn list_due(&self, before: DateTime<Utc>) -> StorageResult<Vec<Operation>>;

    /// Make the operation due at `due_at`
    async fn schedule(&self, id: &str, due_at: DateTime<Utc>) -> StorageResult<()>;

    /// Lease up to `limit` due, unleased operations to `owner`
    async fn claim_due(
        &self,
        before: DateTime<Utc>,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Operation>>;

    /// Drop `owner`'s lease and reschedule; `None` removes the operation from the queue.
    /// Returns false if the lease was not held by `owner`.
    async fn release(
        &self,
        id: &str,
        owner: &str,
        next_due: Option<DateTime<Utc>>,
    ) -> StorageResult<bool>;
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> StorageResult<DateTime<Utc>> {
    chrono::Duration::from_std(lease)
        .map(|lease| now + lease)
        .map_err(|e| StorageError::Database(format!("invalid lease duration: {e}")))
}

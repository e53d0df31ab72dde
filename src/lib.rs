#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Runtime Lifecycle
//!
//! Durable step-pipeline engine for long-running Kubernetes runtime lifecycle
//! operations: provisioning, deprovisioning, updates and upgrades.
//!
//! ## Overview
//!
//! Each lifecycle request becomes a persisted [`models::Operation`]. A pool of
//! scheduler workers claims due operations, runs the step at the operation's pipeline
//! cursor and persists the result. Steps never block on external systems: a step that
//! has to wait returns a delay and the operation is picked up again later, by any
//! worker, even after a restart.
//!
//! ## Module Organization
//!
//! - [`models`] - The operation record and its value types
//! - [`state_machine`] - Operation states and transition rules
//! - [`storage`] - Persistence with version compare-and-swap and due-time leasing
//! - [`orchestration`] - Steps, pipelines, the operation manager and the scheduler
//! - [`steps`] - Built-in lifecycle steps and their pipelines
//! - [`clients`] - Trait seams for provisioner, Gardener and installer calls
//! - [`events`] - Lifecycle events and the operation result metrics collector
//! - [`config`] - Layered YAML and environment configuration
//! - [`error`] - Crate-level errors
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use runtime_lifecycle::config::LifecycleConfig;
//! use runtime_lifecycle::events::EventPublisher;
//! use runtime_lifecycle::orchestration::{OperationManager, Scheduler};
//! use runtime_lifecycle::storage::InMemoryOperations;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LifecycleConfig::default();
//! let storage = Arc::new(InMemoryOperations::new());
//! let manager = Arc::new(OperationManager::with_config(storage, config.manager.clone()));
//! let events = Arc::new(EventPublisher::from_config(&config.events));
//!
//! let scheduler = Arc::new(Scheduler::new(manager, events, &config));
//! let handle = scheduler.start();
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # All tests; PostgreSQL tests need DATABASE_URL and --ignored
//! ```

pub mod clients;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod steps;
pub mod storage;

pub use config::{ConfigManager, LifecycleConfig};
pub use error::{LifecycleError, Result};
pub use events::{EventPublisher, LifecycleEvent, OperationResultCollector};
pub use models::{Operation, OperationType, PipelineCursor, ProvisioningParameters};
pub use orchestration::{
    ClassifiedError, ErrComponent, ErrReason, OperationManager, ProcessOutcome, Scheduler,
    SchedulerHandle, StagedPipeline, Step, StepResult,
};
pub use state_machine::OperationState;
pub use storage::{InMemoryOperations, Operations, StorageError};

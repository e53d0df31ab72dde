//! Lifecycle event contract, publisher and the metrics projection.

pub mod collector;
pub mod publisher;
pub mod types;

pub use collector::{result_value, OperationResultCollector};
pub use publisher::{EventError, EventHandler, EventPublisher, EventSink};
pub use types::{LifecycleEvent, OperationSnapshot, StepProcessed};

//! Data model for lifecycle operations.

pub mod operation;

pub use operation::{
    ErsContext, LastError, Operation, OperationType, PipelineCursor, ProvisioningParameters,
};

//! # Step Failure Classification
//!
//! Structured errors carrying the failing subsystem, a stable cause code and a
//! recoverability marker.
//!
//! ## Overview
//!
//! Every failure a step hands back to the pipeline is a [`ClassifiedError`]. The
//! pipeline reads two things from it:
//!
//! - **Recoverability**: recoverable errors are retried with backoff inside the
//!   retry budget, non-recoverable errors fail the operation immediately.
//! - **Component / Reason**: stamped onto `Operation::last_error` and exported as
//!   metric labels.
//!
//! ## Propagation
//!
//! Wrapping is done by composition: [`ClassifiedError::context`] prefixes the message
//! and keeps every classification field, so the recoverability check on a
//! `ClassifiedError` is a field read. Errors that travelled through foreign wrappers
//! (an `anyhow` context, a collaborator's own error type) are still recognised:
//! [`is_non_recoverable`], [`component`] and [`reason`] walk the `source()` chain.
//!
//! ```rust
//! use runtime_lifecycle::orchestration::error_classifier::{
//!     classify, is_non_recoverable, mark_non_recoverable, ErrComponent, ErrReason,
//! };
//!
//! let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad kubeconfig");
//! let classified = mark_non_recoverable(classify(
//!     err,
//!     ErrComponent::ClusterK8sClient,
//!     Some(ErrReason::InvalidConfig),
//! ));
//!
//! let wrapped = anyhow::Error::new(classified).context("uninstall step");
//! assert!(is_non_recoverable(wrapped.as_ref()));
//! ```

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Subsystem a failure originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrComponent {
    /// Operation storage
    Db,
    /// Gardener shoot API
    ClusterClient,
    /// Kubernetes API of the managed runtime
    ClusterK8sClient,
    /// Kyma installation service
    KymaInstaller,
    /// Runtime provisioner
    Provisioner,
    /// Checks performed by the engine itself
    InternalValidation,
    /// Compare-and-swap storage layer
    Storage,
}

impl ErrComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Db => "db - keb",
            Self::ClusterClient => "gardener",
            Self::ClusterK8sClient => "k8s client - cluster",
            Self::KymaInstaller => "kyma installer",
            Self::Provisioner => "provisioner",
            Self::InternalValidation => "internal validation",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable cause code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrReason {
    Timeout,
    InvalidConfig,
    RemoteRejected,
    TriggerKymaUninstall,
    Conflict,
    NotFound,
    InvalidTransition,
    StepPanicked,
    Internal,
}

impl ErrReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::InvalidConfig => "invalid config",
            Self::RemoteRejected => "remote rejected",
            Self::TriggerKymaUninstall => "kyma uninstall trigger failed",
            Self::Conflict => "conflict",
            Self::NotFound => "not found",
            Self::InvalidTransition => "invalid state transition",
            Self::StepPanicked => "step panicked",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// A failure annotated with component, reason and recoverability
#[derive(Clone)]
pub struct ClassifiedError {
    message: String,
    component: Option<ErrComponent>,
    reason: Option<ErrReason>,
    recoverable: bool,
    cause: Option<Cause>,
}

impl ClassifiedError {
    /// A recoverable, unclassified error with the given message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            component: None,
            reason: None,
            recoverable: true,
            cause: None,
        }
    }

    /// A non-recoverable error with the given message
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(message).non_recoverable()
    }

    pub fn with_component(mut self, component: ErrComponent) -> Self {
        self.component = Some(component);
        self
    }

    pub fn with_reason(mut self, reason: ErrReason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Tag this error as terminal
    pub fn non_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    /// Prefix the message while keeping every classification field
    pub fn context(mut self, context: impl fmt::Display) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn component(&self) -> Option<ErrComponent> {
        self.component
    }

    pub fn reason(&self) -> Option<ErrReason> {
        self.reason
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifiedError")
            .field("message", &self.message)
            .field("component", &self.component)
            .field("reason", &self.reason)
            .field("recoverable", &self.recoverable)
            .finish()
    }
}

impl StdError for ClassifiedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl PartialEq for ClassifiedError {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
            && self.component == other.component
            && self.reason == other.reason
            && self.recoverable == other.recoverable
    }
}

impl From<anyhow::Error> for ClassifiedError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ClassifiedError>() {
            Ok(classified) => classified,
            Err(other) => {
                let boxed: Box<dyn StdError + Send + Sync + 'static> = other.into();
                from_boxed(boxed)
            }
        }
    }
}

fn from_boxed(err: Box<dyn StdError + Send + Sync + 'static>) -> ClassifiedError {
    match err.downcast::<ClassifiedError>() {
        Ok(classified) => *classified,
        Err(other) => {
            let cause: Cause = Arc::from(other);
            ClassifiedError {
                message: cause.to_string(),
                component: find_classified(cause.as_ref()).and_then(|c| c.component),
                reason: find_classified(cause.as_ref()).and_then(|c| c.reason),
                recoverable: !is_non_recoverable(cause.as_ref()),
                cause: Some(cause),
            }
        }
    }
}

/// Wrap `err` with a component and reason.
///
/// Never fails and never drops the underlying message. An error that already is (or
/// wraps) a `ClassifiedError` keeps its recoverability.
pub fn classify<E>(err: E, component: ErrComponent, reason: Option<ErrReason>) -> ClassifiedError
where
    E: StdError + Send + Sync + 'static,
{
    let mut classified = from_boxed(Box::new(err));
    classified.component = Some(component);
    classified.reason = reason;
    classified
}

/// Tag `err` as terminal
pub fn mark_non_recoverable(err: impl Into<ClassifiedError>) -> ClassifiedError {
    err.into().non_recoverable()
}

fn find_classified<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a ClassifiedError> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(classified) = err.downcast_ref::<ClassifiedError>() {
            return Some(classified);
        }
        current = err.source();
    }
    None
}

/// Whether any layer of `err` is a non-recoverable `ClassifiedError`
pub fn is_non_recoverable(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(classified) = err.downcast_ref::<ClassifiedError>() {
            if !classified.recoverable {
                return true;
            }
        }
        current = err.source();
    }
    false
}

/// Component of the outermost classified layer, `None` if never classified
pub fn component(err: &(dyn StdError + 'static)) -> Option<ErrComponent> {
    find_classified(err).and_then(ClassifiedError::component)
}

/// Reason of the outermost classified layer, `None` if never classified
pub fn reason(err: &(dyn StdError + 'static)) -> Option<ErrReason> {
    find_classified(err).and_then(ClassifiedError::reason)
}

//! Structured error types for the scheduler.
//!
//! The boundary rule: task handlers and loop internals may carry
//! `anyhow::Error` as transport, but only the typed errors below cross the
//! public API. Callers can pattern-match instead of string-matching.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced while constructing or advancing triggers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TriggerError {
    /// The trigger definition is malformed: inverted time range, zero-length
    /// interval, unparsable field expression, and so on.
    #[error("invalid trigger: {0}")]
    Invalid(String),

    /// The intersection search gave up before all children lined up.
    #[error("no common fire time found within {0} iterations")]
    MaxIterationsReached(u32),
}

impl TriggerError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Errors produced by serializers.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The payload envelope carries a tag this consumer does not know.
    #[error("unknown payload kind {0:?}")]
    UnknownKind(String),

    /// The payload was written by a newer producer than this consumer.
    #[error("unsupported {kind:?} payload version {version} (this build reads up to {supported})")]
    UnsupportedVersion {
        kind: String,
        version: u16,
        supported: u16,
    },
}

/// Errors surfaced by data store adapters.
///
/// Adapters classify their failures so the loops know what to do: transient
/// errors are retried with capped backoff, fatal errors stop the node.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Retryable I/O failure (connection reset, timeout, contention).
    #[error("transient store failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Unrecoverable failure (corruption, schema mismatch, unreachable).
    #[error("fatal store failure: {0}")]
    Fatal(#[source] anyhow::Error),

    /// An insert collided with an existing entity and the conflict policy
    /// forbids replacement.
    #[error("an entity with id {id:?} already exists")]
    Conflict { id: String },

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

impl StoreError {
    /// Whether a retry with backoff makes sense.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors surfaced by event broker adapters.
///
/// Delivery is best-effort, so brokers only error when publishing or managing
/// subscriptions is impossible, never for dropped events.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("event broker unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

/// Errors surfaced through the public scheduler facade.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("no task registered with id {0:?}")]
    TaskLookup(String),

    #[error("no schedule found with id {0:?}")]
    ScheduleLookup(String),

    #[error("no job found with id {0}")]
    JobLookup(Uuid),

    #[error("job {0} has not produced a result yet")]
    JobResultNotReady(Uuid),

    /// The task handler returned an error; the captured message comes from
    /// the job result, never from a rethrow inside the worker loop.
    #[error("task {task_id:?} failed: {exception}")]
    JobFailed { task_id: String, exception: String },

    #[error("job {0} missed its start deadline")]
    DeadlineMissed(Uuid),

    #[error("job {0} was cancelled")]
    JobCancelled(Uuid),

    #[error("scheduler is not running")]
    NotRunning,

    #[error("scheduler is already running")]
    AlreadyRunning,

    /// The node stopped because of an unrecoverable store failure; the
    /// original error is reported through `wait_until_stopped`.
    #[error("scheduler stopped after a fatal error: {0}")]
    Fatal(String),
}

//! Event broker contract.
//!
//! Guarantees (and deliberate non-guarantees):
//!
//! - **At-most-once delivery**: slow subscribers may miss events
//! - **No replay**: events published before a subscription are gone
//! - **No cross-kind ordering**: only per-entity causal order from a single
//!   node is preserved
//!
//! The broker exists for wake-ups and result waiting; durable state lives in
//! the data store.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::BrokerError;
use crate::events::{EventFilter, SchedulerEvent};

mod local;

pub use local::LocalEventBroker;

/// Callback invoked for every delivered event.
///
/// Callbacks run on broker internals and must not block; hand the event off
/// to a channel for anything heavier.
pub type EventCallback = Arc<dyn Fn(SchedulerEvent) + Send + Sync>;

/// Opaque token identifying a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub(crate) u64);

/// Best-effort fan-out bus for [`SchedulerEvent`]s.
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Publish an event to all matching subscribers.
    async fn publish(&self, event: SchedulerEvent) -> Result<(), BrokerError>;

    /// Register a callback for events passing `filter`.
    async fn subscribe(
        &self,
        filter: EventFilter,
        callback: EventCallback,
    ) -> Result<SubscriptionHandle, BrokerError>;

    /// Remove a subscription. Idempotent: unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BrokerError>;
}

//! In-process event broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{EventBroker, EventCallback, SubscriptionHandle};
use crate::errors::BrokerError;
use crate::events::{EventFilter, SchedulerEvent};

/// Default broadcast capacity; beyond it, the slowest subscribers start
/// losing events.
const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast-channel broker for single-process deployments and tests.
///
/// Each subscription runs its own forwarding task: it filters the broadcast
/// stream and invokes the callback. Lagged subscriptions drop events, which
/// the contract allows.
pub struct LocalEventBroker {
    sender: broadcast::Sender<SchedulerEvent>,
    subscriptions: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
}

impl LocalEventBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for LocalEventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalEventBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEventBroker")
            .field("subscription_count", &self.subscription_count())
            .finish()
    }
}

#[async_trait]
impl EventBroker for LocalEventBroker {
    async fn publish(&self, event: SchedulerEvent) -> Result<(), BrokerError> {
        // No subscribers is fine; delivery is best-effort.
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: EventFilter,
        callback: EventCallback,
    ) -> Result<SubscriptionHandle, BrokerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, token.clone());

        let mut receiver = self.sender.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => {
                            if filter.matches(&event) {
                                callback(event);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(subscription = id, missed, "subscriber lagged; events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(SubscriptionHandle(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BrokerError> {
        let token = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.0);
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, EventTag};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn channel_callback() -> (EventCallback, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: EventCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (callback, rx)
    }

    fn started_event() -> SchedulerEvent {
        SchedulerEvent::new("node-a", EventKind::SchedulerStarted)
    }

    #[tokio::test]
    async fn subscribers_receive_matching_events() {
        let broker = LocalEventBroker::new();
        let (callback, mut rx) = channel_callback();
        broker
            .subscribe(EventFilter::any(), callback)
            .await
            .unwrap();

        broker.publish(started_event()).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.tag(), EventTag::SchedulerStarted);
    }

    #[tokio::test]
    async fn filters_drop_unwanted_kinds() {
        let broker = LocalEventBroker::new();
        let (callback, mut rx) = channel_callback();
        broker
            .subscribe(EventFilter::for_kinds([EventTag::JobAdded]), callback)
            .await
            .unwrap();

        broker.publish(started_event()).await.unwrap();
        broker
            .publish(SchedulerEvent::new(
                "node-a",
                EventKind::JobAdded {
                    job_id: Uuid::new_v4(),
                    task_id: "t1".into(),
                    schedule_id: None,
                },
            ))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.tag(), EventTag::JobAdded);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let broker = LocalEventBroker::new();
        broker.publish(started_event()).await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_is_idempotent() {
        let broker = LocalEventBroker::new();
        let (callback, mut rx) = channel_callback();
        let handle = broker
            .subscribe(EventFilter::any(), callback)
            .await
            .unwrap();
        assert_eq!(broker.subscription_count(), 1);

        broker.unsubscribe(handle).await.unwrap();
        broker.unsubscribe(handle).await.unwrap();
        assert_eq!(broker.subscription_count(), 0);

        // Give the forwarding task a beat to observe cancellation.
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish(started_event()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_a_copy() {
        let broker = LocalEventBroker::new();
        let (cb1, mut rx1) = channel_callback();
        let (cb2, mut rx2) = channel_callback();
        broker.subscribe(EventFilter::any(), cb1).await.unwrap();
        broker.subscribe(EventFilter::any(), cb2).await.unwrap();

        broker.publish(started_event()).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().tag(), EventTag::SchedulerStarted);
        assert_eq!(rx2.recv().await.unwrap().tag(), EventTag::SchedulerStarted);
    }
}

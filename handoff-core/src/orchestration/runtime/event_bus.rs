use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use handoff_model::FlagEvent;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::orchestration::events::{EventHandler, FlagEventPublisher};

/// Handle identifying one subscription across all of its topics.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct SubscriberSlot {
    id: SubscriptionId,
    tx: mpsc::Sender<FlagEvent>,
}

/// Receiving end of a subscription. Events for all of its topics share one
/// bounded queue, so per-topic publish order is preserved.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<FlagEvent>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("queued", &self.rx.len())
            .field("closed", &self.rx.is_closed())
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next event. Returns `None` once the subscription has been
    /// removed from the bus and the queue is drained.
    pub async fn recv(&mut self) -> Option<FlagEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FlagEvent> {
        self.rx.try_recv().ok()
    }
}

/// Subscription whose events are consumed by a dedicated handler task.
#[derive(Debug)]
pub struct HandlerSubscription {
    pub id: SubscriptionId,
    pub task: JoinHandle<()>,
}

/// Point-in-time counters for the bus.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub topics: usize,
}

/// In-process topic broadcaster. Each subscriber owns a bounded queue; a full
/// queue drops the event for that subscriber only, so a slow consumer never
/// stalls the publisher or its peers.
pub struct EventBus {
    topics: DashMap<String, Vec<SubscriberSlot>>,
    capacity: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("EventBus")
            .field("subscriber_capacity", &self.capacity)
            .field("topics", &stats.topics)
            .field("published", &stats.published)
            .field("delivered", &stats.delivered)
            .field("dropped", &stats.dropped)
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a subscription for every topic in `topics`. Only events
    /// published after this call are delivered; there is no backlog replay.
    pub fn subscribe<I, S>(&self, topics: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.capacity);

        let unique: HashSet<String> = topics.into_iter().map(Into::into).collect();
        for topic in unique {
            trace!(target: "handoff::bus", subscription = %id, topic = %topic, "subscribed");
            self.topics.entry(topic).or_default().push(SubscriberSlot {
                id,
                tx: tx.clone(),
            });
        }

        Subscription { id, rx }
    }

    /// Subscribes `handler` and spawns its processing loop. The loop ends
    /// after [`EventBus::unsubscribe`] once the queue has drained.
    pub fn subscribe_with<I, S>(
        &self,
        topics: I,
        handler: Arc<dyn EventHandler>,
    ) -> HandlerSubscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut subscription = self.subscribe(topics);
        let id = subscription.id();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler.handle(event).await;
            }
            debug!(target: "handoff::bus", subscription = %id, "handler loop finished");
        });
        HandlerSubscription { id, task }
    }

    /// Removes the subscription from every topic. Idempotent; returns whether
    /// anything was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for mut entry in self.topics.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|slot| slot.id != id);
            removed |= entry.value().len() != before;
        }
        self.topics.retain(|_, slots| !slots.is_empty());
        if removed {
            debug!(target: "handoff::bus", subscription = %id, "unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|slots| slots.len()).unwrap_or_default()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            topics: self.topics.len(),
        }
    }
}

impl FlagEventPublisher for EventBus {
    fn publish(&self, event: FlagEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0usize;
        let mut closed = Vec::new();
        {
            let Some(slots) = self.topics.get(&event.topic) else {
                trace!(target: "handoff::bus", topic = %event.topic, "no subscribers");
                return 0;
            };
            for slot in slots.iter() {
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            target: "handoff::bus",
                            topic = %event.topic,
                            subscription = %slot.id,
                            flag_id = %event.flag_id,
                            "subscriber queue full; dropping event"
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(slot.id),
                }
            }
        }

        if !closed.is_empty() {
            if let Some(mut slots) = self.topics.get_mut(&event.topic) {
                slots.retain(|slot| !closed.contains(&slot.id));
            }
            self.topics.remove_if(&event.topic, |_, slots| slots.is_empty());
            debug!(
                target: "handoff::bus",
                topic = %event.topic,
                pruned = closed.len(),
                "pruned closed subscribers"
            );
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        trace!(
            target: "handoff::bus",
            topic = %event.topic,
            flag_id = %event.flag_id,
            delivered,
            "published"
        );
        delivered
    }
}

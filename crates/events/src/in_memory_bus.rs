//! In-memory event bus for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{BusError, Delivery, EventBus, Subscription};
use crate::envelope::RawEnvelope;
use crate::event::Topic;

/// Envelopes kept per topic (and per disconnected group) by default.
pub const DEFAULT_RETENTION: usize = 10_000;

#[derive(Debug, Default)]
struct GroupState {
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
    /// Envelopes published while no subscriber of the group was connected.
    backlog: VecDeque<RawEnvelope>,
    next: usize,
}

impl GroupState {
    /// Hand the envelope to one live subscriber (round-robin), or park it.
    fn deliver(&mut self, envelope: RawEnvelope, retention: usize) {
        let mut pending = Some(envelope);
        while let Some(env) = pending.take() {
            if self.subscribers.is_empty() {
                push_bounded(&mut self.backlog, env, retention);
                return;
            }
            let idx = self.next % self.subscribers.len();
            match self.subscribers[idx].send(Delivery::unacknowledged(env)) {
                Ok(()) => self.next = idx + 1,
                Err(mpsc::error::SendError(returned)) => {
                    // Receiver dropped: forget it and try the next one.
                    self.subscribers.remove(idx);
                    pending = Some(returned.envelope().clone());
                }
            }
        }
    }
}

/// Oldest entries go first once `retention` is reached, like an approximate
/// `MAXLEN` on a Redis stream.
fn push_bounded(queue: &mut VecDeque<RawEnvelope>, envelope: RawEnvelope, retention: usize) {
    while queue.len() >= retention.max(1) {
        queue.pop_front();
    }
    queue.push_back(envelope);
}

#[derive(Debug, Default)]
struct TopicState {
    log: VecDeque<RawEnvelope>,
    groups: HashMap<String, GroupState>,
}

/// In-memory pub/sub bus with consumer-group semantics.
///
/// - Fanout across groups, round-robin within a group
/// - A group declared late replays the retained tail of the topic
/// - No acknowledgment tracking (deliveries are never redelivered)
/// - Each topic log and each disconnected group's backlog keeps at most
///   `retention` envelopes
#[derive(Debug)]
pub struct InMemoryEventBus {
    topics: Mutex<HashMap<Topic, TopicState>>,
    retention: usize,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            topics: Mutex::default(),
            retention: retention.max(1),
        }
    }

    /// The retained envelopes of `topic`, in publish order.
    pub fn published(&self, topic: Topic) -> Vec<RawEnvelope> {
        self.topics
            .lock()
            .map(|t| {
                t.get(&topic)
                    .map(|s| s.log.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, envelope: RawEnvelope) -> Result<(), BusError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| BusError::Unavailable("in-memory bus lock poisoned".to_string()))?;

        let retention = self.retention;
        let state = topics.entry(envelope.topic()).or_default();
        push_bounded(&mut state.log, envelope.clone(), retention);
        for group in state.groups.values_mut() {
            group.deliver(envelope.clone(), retention);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: Topic, group: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| BusError::Unavailable("in-memory bus lock poisoned".to_string()))?;

        let state = topics.entry(topic).or_default();
        let log = state.log.clone();
        let group_state = state.groups.entry(group.to_string()).or_insert_with(|| GroupState {
            backlog: log,
            ..GroupState::default()
        });

        group_state.subscribers.push(tx);
        let backlog: Vec<_> = group_state.backlog.drain(..).collect();
        for env in backlog {
            group_state.deliver(env, self.retention);
        }

        Ok(Subscription::new(topic, rx))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::event::Event;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Event for Ping {
        fn event_type(&self) -> &'static str {
            "test.ping"
        }

        fn topic(&self) -> Topic {
            Topic::Orders
        }

        fn idempotency_key(&self) -> Option<String> {
            Some(self.n.to_string())
        }
    }

    fn ping(n: u32) -> RawEnvelope {
        RawEnvelope::wrap(Ping { n }).unwrap()
    }

    #[tokio::test]
    async fn every_group_receives_every_event() {
        let bus = InMemoryEventBus::new();
        let mut a = bus.subscribe(Topic::Orders, "a").await.unwrap();
        let mut b = bus.subscribe(Topic::Orders, "b").await.unwrap();

        bus.publish(ping(1)).await.unwrap();

        let got_a: Ping = a.recv().await.unwrap().envelope().decode().unwrap();
        let got_b: Ping = b.recv().await.unwrap().envelope().decode().unwrap();
        assert_eq!(got_a, Ping { n: 1 });
        assert_eq!(got_b, Ping { n: 1 });
    }

    #[tokio::test]
    async fn late_group_replays_history_in_order() {
        let bus = InMemoryEventBus::new();
        bus.publish(ping(1)).await.unwrap();
        bus.publish(ping(2)).await.unwrap();

        let mut sub = bus.subscribe(Topic::Orders, "late").await.unwrap();
        let first: Ping = sub.recv().await.unwrap().envelope().decode().unwrap();
        let second: Ping = sub.recv().await.unwrap().envelope().decode().unwrap();
        assert_eq!((first.n, second.n), (1, 2));
    }

    #[tokio::test]
    async fn events_published_while_disconnected_are_kept_for_the_group() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe(Topic::Orders, "svc").await.unwrap();
        drop(sub);

        bus.publish(ping(7)).await.unwrap();

        let mut again = bus.subscribe(Topic::Orders, "svc").await.unwrap();
        let got: Ping = again.recv().await.unwrap().envelope().decode().unwrap();
        assert_eq!(got.n, 7);
    }

    #[tokio::test]
    async fn retention_keeps_the_newest_envelopes() {
        let bus = InMemoryEventBus::with_retention(2);
        let parked = bus.subscribe(Topic::Orders, "parked").await.unwrap();
        drop(parked);

        for n in 1..=3 {
            bus.publish(ping(n)).await.unwrap();
        }

        let kept: Vec<u32> = bus
            .published(Topic::Orders)
            .iter()
            .map(|e| e.decode::<Ping>().unwrap().n)
            .collect();
        assert_eq!(kept, vec![2, 3]);

        for group in ["late", "parked"] {
            let mut sub = bus.subscribe(Topic::Orders, group).await.unwrap();
            let first: Ping = sub.recv().await.unwrap().envelope().decode().unwrap();
            let second: Ping = sub.recv().await.unwrap().envelope().decode().unwrap();
            assert_eq!((first.n, second.n), (2, 3));
            assert!(sub.try_recv().is_none());
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = InMemoryEventBus::new();
        let mut inventory = bus.subscribe(Topic::Inventory, "svc").await.unwrap();

        bus.publish(ping(1)).await.unwrap();

        assert!(inventory.try_recv().is_none());
        assert_eq!(bus.published(Topic::Orders).len(), 1);
    }
}

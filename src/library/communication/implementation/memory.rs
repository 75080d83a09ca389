//! In-process [`MessageBus`] implementation
//!
//! Mirrors the routing semantics of an AMQP broker closely enough to exercise the RPC layer
//! without one: exchanges route by [`ExchangeKind`], consumers sharing a queue receive messages
//! round-robin, deliveries have to be settled and negatively acknowledged or rejected deliveries
//! may be requeued. Messages published while nothing is bound to a matching queue are dropped.
//!
//! Publishing only holds an internal lock while routing, so any number of publishes may be in
//! flight concurrently.

use super::super::super::{BoxedError, EmptyResult};
use super::super::{
    Acknowledgement, Acknowledger, BusError, DeliveredMessage, ExchangeKind, InboundEnvelope,
    MessageBus, OutboundEnvelope, TopicSpec,
};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, trace};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Counters of a single queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Deliveries handed to a consumer, including redeliveries
    pub delivered: u64,
    /// Deliveries that have been acknowledged
    pub acked: u64,
    /// Deliveries that have been negatively acknowledged
    pub nacked: u64,
    /// Deliveries that have been rejected
    pub rejected: u64,
    /// Deliveries that have been put back into the queue
    pub requeued: u64,
    /// Deliveries currently awaiting settlement
    pub unacked: usize,
}

struct Binding {
    exchange: String,
    kind: ExchangeKind,
    key: String,
    queue: String,
}

impl Binding {
    fn routes(&self, exchange: &str, routing_key: &str) -> bool {
        if self.exchange != exchange {
            return false;
        }

        match self.kind {
            ExchangeKind::Direct => self.key == routing_key,
            ExchangeKind::Topic => topic_matches(&self.key, routing_key),
            ExchangeKind::Fanout => true,
        }
    }
}

#[derive(Default)]
struct Queue {
    consumers: Vec<UnboundedSender<InboundEnvelope>>,
    next_consumer: usize,
    backlog: VecDeque<DeliveredMessage>,
    unacked: BTreeMap<u64, DeliveredMessage>,
    stats: QueueStats,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    next_delivery_tag: u64,
    offline: bool,
    closed: bool,
    published: Vec<OutboundEnvelope>,
}

/// Message bus living entirely within the current process
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<State>>,
}

impl InMemoryBus {
    /// Creates a new bus without any queues
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Makes subsequent publishes fail with [`BusError::Offline`] until brought back online
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Shuts the bus down, ending every subscription stream
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;

        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    /// Counters of the given queue, if it exists
    pub fn stats(&self, queue: &str) -> Option<QueueStats> {
        self.state().queues.get(queue).map(|queue| QueueStats {
            unacked: queue.unacked.len(),
            ..queue.stats
        })
    }

    /// Every envelope accepted by the bus so far, in publishing order
    pub fn published(&self) -> Vec<OutboundEnvelope> {
        self.state().published.clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, envelope: OutboundEnvelope) -> EmptyResult {
        let mut state = self.state();

        if state.closed {
            return Err(BusError::Closed.into());
        } else if state.offline {
            return Err(BusError::Offline.into());
        }

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|binding| binding.routes(envelope.exchange(), envelope.routing_key()))
            .map(|binding| binding.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            debug!(
                "Dropping unroutable message for {} on {}",
                envelope.routing_key(),
                envelope.exchange()
            );
        }

        for queue in targets {
            let message = DeliveredMessage::new(
                envelope.exchange(),
                envelope.routing_key(),
                envelope.properties().clone(),
                envelope.payload().to_vec(),
                false,
            );

            dispatch(&self.state, &mut state, &queue, message);
        }

        state.published.push(envelope);

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: TopicSpec,
    ) -> Result<BoxStream<'static, InboundEnvelope>, BoxedError> {
        let mut state = self.state();

        if state.closed {
            return Err(BusError::Closed.into());
        }

        let bound = state.bindings.iter().any(|binding| {
            binding.exchange == topic.exchange
                && binding.kind == topic.kind
                && binding.key == topic.routing_key
                && binding.queue == topic.queue
        });

        if !bound {
            state.bindings.push(Binding {
                exchange: topic.exchange.clone(),
                kind: topic.kind,
                key: topic.routing_key.clone(),
                queue: topic.queue.clone(),
            });
        }

        let (sender, receiver) = unbounded();
        let queue = state.queues.entry(topic.queue.clone()).or_default();
        queue.consumers.push(sender);
        let backlog = std::mem::take(&mut queue.backlog);

        for message in backlog {
            dispatch(&self.state, &mut state, &topic.queue, message);
        }

        debug!(
            "Consuming {} bound to {} on {} ({})",
            topic.queue, topic.routing_key, topic.exchange, topic.kind
        );

        Ok(receiver.boxed())
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands a message to the next live consumer of a queue or parks it in the backlog
fn dispatch(shared: &Arc<Mutex<State>>, state: &mut State, queue_name: &str, message: DeliveredMessage) {
    let delivery_tag = state.next_delivery_tag + 1;
    let queue = state.queues.entry(queue_name.to_owned()).or_default();
    queue.consumers.retain(|consumer| !consumer.is_closed());

    if queue.consumers.is_empty() {
        queue.backlog.push_back(message);
        return;
    }

    let index = queue.next_consumer % queue.consumers.len();
    let acknowledger = MemoryAcknowledger {
        state: Arc::downgrade(shared),
        queue: queue_name.to_owned(),
    };
    let envelope = InboundEnvelope::new(
        message.clone(),
        Acknowledgement::new(delivery_tag, acknowledger),
    );

    if queue.consumers[index].unbounded_send(envelope).is_ok() {
        trace!("Delivered {} on {}", delivery_tag, queue_name);
        queue.next_consumer = index + 1;
        queue.unacked.insert(delivery_tag, message);
        queue.stats.delivered += 1;
        state.next_delivery_tag = delivery_tag;
    } else {
        queue.consumers.remove(index);
        queue.backlog.push_back(message);
    }
}

fn redelivered(message: DeliveredMessage) -> DeliveredMessage {
    let exchange = message.exchange().to_owned();
    let routing_key = message.routing_key().to_owned();
    let properties = message.properties().clone();

    DeliveredMessage::new(
        exchange,
        routing_key,
        properties,
        message.into_payload(),
        true,
    )
}

enum Settlement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

struct MemoryAcknowledger {
    state: Weak<Mutex<State>>,
    queue: String,
}

impl MemoryAcknowledger {
    fn settle(&self, delivery_tag: u64, multiple: bool, settlement: Settlement) -> EmptyResult {
        let shared = self.state.upgrade().ok_or(BusError::Closed)?;
        let mut state = lock(&shared);
        let queue = state.queues.get_mut(&self.queue).ok_or(BusError::Closed)?;

        let settled: Vec<DeliveredMessage> = if multiple {
            let remaining = queue.unacked.split_off(&(delivery_tag + 1));
            let settled = std::mem::replace(&mut queue.unacked, remaining);
            settled.into_values().collect()
        } else {
            queue.unacked.remove(&delivery_tag).into_iter().collect()
        };

        if settled.is_empty() {
            return Err(BusError::UnknownDelivery(delivery_tag).into());
        }

        let count = settled.len() as u64;
        let requeue = match settlement {
            Settlement::Ack => {
                queue.stats.acked += count;
                false
            }
            Settlement::Nack { requeue } => {
                queue.stats.nacked += count;
                requeue
            }
            Settlement::Reject { requeue } => {
                queue.stats.rejected += count;
                requeue
            }
        };

        if requeue {
            queue.stats.requeued += count;

            for message in settled {
                dispatch(&shared, &mut state, &self.queue, redelivered(message));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> EmptyResult {
        self.settle(delivery_tag, multiple, Settlement::Ack)
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> EmptyResult {
        self.settle(delivery_tag, multiple, Settlement::Nack { requeue })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> EmptyResult {
        self.settle(delivery_tag, false, Settlement::Reject { requeue })
    }
}

/// Matches a dot separated routing key against a binding pattern
///
/// `*` substitutes exactly one word, `#` substitutes zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();

    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && match_words(rest, &words[1..]),
        Some((literal, rest)) => {
            words.first() == Some(literal) && match_words(rest, &words[1..])
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    fn direct(queue: &str) -> TopicSpec {
        TopicSpec::new("ex", queue, ExchangeKind::Direct, queue)
    }

    #[test]
    fn match_topic_patterns() {
        assert!(topic_matches("getThing", "getThing"));
        assert!(!topic_matches("getThing", "getOther"));
        assert!(topic_matches("teams.*", "teams.get"));
        assert!(!topic_matches("teams.*", "teams.get.all"));
        assert!(!topic_matches("teams.*", "teams"));
        assert!(topic_matches("teams.#", "teams"));
        assert!(topic_matches("teams.#", "teams.get.all"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.get.#", "teams.get"));
        assert!(!topic_matches("*.get.#", "get"));
    }

    #[tokio::test]
    async fn route_direct_messages() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe(direct("q1")).await.unwrap();

        bus.publish(OutboundEnvelope::new("ex", "q1", b"one".to_vec()))
            .await
            .unwrap();
        bus.publish(OutboundEnvelope::new("ex", "nowhere", b"lost".to_vec()))
            .await
            .unwrap();

        let envelope = stream.next().await.unwrap();
        assert_eq!(envelope.message.payload(), b"one");
        assert_eq!(envelope.message.routing_key(), "q1");
        envelope.acknowledgement.ack(false).await.unwrap();

        assert_eq!(bus.published().len(), 2);
        assert_eq!(
            bus.stats("q1").unwrap(),
            QueueStats {
                delivered: 1,
                acked: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn route_topic_and_fanout_messages() {
        let bus = InMemoryBus::new();
        let mut topic = bus
            .subscribe(TopicSpec::new("ex", "teams.*", ExchangeKind::Topic, "teams"))
            .await
            .unwrap();
        let mut fanout = bus
            .subscribe(TopicSpec::new("ex", "", ExchangeKind::Fanout, "audit"))
            .await
            .unwrap();

        bus.publish(OutboundEnvelope::new("ex", "teams.get", b"x".to_vec()))
            .await
            .unwrap();

        let from_topic = topic.next().await.unwrap();
        let from_fanout = fanout.next().await.unwrap();
        assert_eq!(from_topic.message.routing_key(), "teams.get");
        assert_eq!(from_fanout.message.routing_key(), "teams.get");

        from_topic.acknowledgement.ack(false).await.unwrap();
        from_fanout.acknowledgement.ack(false).await.unwrap();
    }

    #[tokio::test]
    async fn distribute_round_robin() {
        let bus = InMemoryBus::new();
        let mut first = bus.subscribe(direct("q")).await.unwrap();
        let mut second = bus.subscribe(direct("q")).await.unwrap();

        for payload in &["a", "b", "c"] {
            bus.publish(OutboundEnvelope::new("ex", "q", payload.as_bytes().to_vec()))
                .await
                .unwrap();
        }

        let a = first.next().await.unwrap();
        let b = second.next().await.unwrap();
        let c = first.next().await.unwrap();

        assert_eq!(a.message.payload(), b"a");
        assert_eq!(b.message.payload(), b"b");
        assert_eq!(c.message.payload(), b"c");

        for envelope in vec![a, b, c] {
            envelope.acknowledgement.ack(false).await.unwrap();
        }
    }

    #[tokio::test]
    async fn requeue_on_nack_and_reject() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe(direct("q")).await.unwrap();

        bus.publish(OutboundEnvelope::new("ex", "q", b"retry".to_vec()))
            .await
            .unwrap();

        let first = stream.next().await.unwrap();
        assert!(!first.message.redelivered());
        first.acknowledgement.nack(false, true).await.unwrap();

        let second = stream.next().await.unwrap();
        assert!(second.message.redelivered());
        assert_eq!(second.message.payload(), b"retry");
        second.acknowledgement.reject(true).await.unwrap();

        let third = stream.next().await.unwrap();
        third.acknowledgement.reject(false).await.unwrap();

        let stats = bus.stats("q").unwrap();
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.unacked, 0);
    }

    #[tokio::test]
    async fn acknowledge_multiple() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe(direct("q")).await.unwrap();

        for _ in 0..3 {
            bus.publish(OutboundEnvelope::new("ex", "q", Vec::new()))
                .await
                .unwrap();
        }

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        let third = stream.next().await.unwrap();

        second.acknowledgement.ack(true).await.unwrap();
        assert_eq!(bus.stats("q").unwrap().acked, 2);
        assert_eq!(bus.stats("q").unwrap().unacked, 1);

        let error = first.acknowledgement.ack(false).await.unwrap_err();
        assert!(error.to_string().contains("unknown delivery tag"));

        third.acknowledgement.ack(false).await.unwrap();
        assert_eq!(bus.stats("q").unwrap().unacked, 0);
    }

    #[tokio::test]
    async fn hold_messages_until_a_consumer_appears() {
        let bus = InMemoryBus::new();
        drop(bus.subscribe(direct("q")).await.unwrap());

        bus.publish(OutboundEnvelope::new("ex", "q", b"parked".to_vec()))
            .await
            .unwrap();

        let mut stream = bus.subscribe(direct("q")).await.unwrap();
        let envelope = stream.next().await.unwrap();
        assert_eq!(envelope.message.payload(), b"parked");
        envelope.acknowledgement.ack(false).await.unwrap();
    }

    #[tokio::test]
    async fn refuse_publishing_while_offline_or_closed() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe(direct("q")).await.unwrap();

        bus.set_offline(true);
        let offline = bus
            .publish(OutboundEnvelope::new("ex", "q", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            offline.downcast_ref::<BusError>(),
            Some(BusError::Offline)
        ));

        bus.set_offline(false);
        bus.close();

        assert!(stream.next().await.is_none());
        assert!(bus
            .publish(OutboundEnvelope::new("ex", "q", Vec::new()))
            .await
            .is_err());
        assert!(bus.subscribe(direct("q")).await.is_err());
    }
}

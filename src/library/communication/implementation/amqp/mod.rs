//! Trait implementations using [`lapin`](::lapin)
//!
//! The connection to the broker is established by a background task so that constructing a bus
//! never blocks. Until it succeeds publishing fails with [`BusError::NotConnected`] while
//! subscribing waits for the connection.
//!
//! Publishing happens on a fixed pool of confirm-mode channels which are picked round-robin,
//! bounding the publish concurrency to the size of that pool. Exchanges are declared lazily the
//! first time a message is published to them.

mod convert;

use super::super::super::{BoxedError, EmptyResult};
use super::super::{
    Acknowledgement, Acknowledger, BusError, DeliveredMessage, ExchangeKind, InboundEnvelope,
    MessageBus, OutboundEnvelope, TopicSpec,
};
use async_trait::async_trait;
use convert::{exchange_kind, from_basic_properties, to_basic_properties};
use futures::stream::BoxStream;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

const REPLY_SUCCESS: u16 = 200;

/// Options of an [`AmqpBus`]
#[derive(Debug, Clone)]
pub struct AmqpOptions {
    /// Number of connection attempts before giving up
    pub connection_attempts: usize,
    /// Delay between two connection attempts
    pub retry_delay: Duration,
    /// Whether exchanges, queues and published messages survive a broker restart
    pub durable: bool,
    /// Number of channels used for publishing
    pub publish_channels: usize,
    /// Number of unacknowledged deliveries a subscription may hold at once
    pub prefetch: u16,
}

impl Default for AmqpOptions {
    fn default() -> Self {
        Self {
            connection_attempts: 5,
            retry_delay: Duration::from_secs(2),
            durable: true,
            publish_channels: 4,
            prefetch: 64,
        }
    }
}

struct Link {
    connection: Connection,
    publishers: Vec<Channel>,
}

impl Link {
    async fn open(url: &str, options: &AmqpOptions) -> Result<Self, lapin::Error> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let mut publishers = Vec::with_capacity(options.publish_channels);

        for _ in 0..options.publish_channels.max(1) {
            let channel = connection.create_channel().await?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
            publishers.push(channel);
        }

        Ok(Self {
            connection,
            publishers,
        })
    }
}

async fn establish(url: String, options: AmqpOptions, link: watch::Sender<Option<Arc<Link>>>) {
    let attempts = options.connection_attempts.max(1);

    for attempt in 1..=attempts {
        match Link::open(&url, &options).await {
            Ok(established) => {
                info!("Connected to message broker");
                if link.send(Some(Arc::new(established))).is_err() {
                    debug!("Message bus was dropped while connecting");
                }
                return;
            }
            Err(e) => {
                warn!(
                    "Connecting to message broker failed ({}/{}): {}",
                    attempt, attempts, e
                );

                if attempt < attempts {
                    tokio::time::sleep(options.retry_delay).await;
                }
            }
        }
    }

    error!("Giving up connecting to message broker");
}

/// [`MessageBus`] implementation for AMQP 0.9.1 brokers like RabbitMQ
pub struct AmqpBus {
    link: watch::Receiver<Option<Arc<Link>>>,
    options: AmqpOptions,
    declared: Mutex<HashSet<String>>,
    consumers: Mutex<Vec<(Channel, String)>>,
    next_publisher: AtomicUsize,
    connector: JoinHandle<()>,
}

impl AmqpBus {
    /// Starts connecting to the broker at `url` in the background
    pub fn new(url: impl Into<String>, options: AmqpOptions) -> Self {
        let (sender, link) = watch::channel(None);
        let connector = tokio::spawn(establish(url.into(), options.clone(), sender));

        Self {
            link,
            options,
            declared: Mutex::new(HashSet::new()),
            consumers: Mutex::new(Vec::new()),
            next_publisher: AtomicUsize::new(0),
            connector,
        }
    }

    fn current(&self) -> Result<Arc<Link>, BusError> {
        self.link.borrow().clone().ok_or(BusError::NotConnected)
    }

    /// Waits until the connection is established
    ///
    /// Fails with [`BusError::NotConnected`] once all connection attempts have been used up.
    pub async fn ready(&self) -> Result<(), BusError> {
        let mut link = self.link.clone();

        loop {
            if link.borrow().is_some() {
                return Ok(());
            }

            if link.changed().await.is_err() {
                return Err(BusError::NotConnected);
            }
        }
    }

    /// Whether the connection has been established and is still usable
    pub fn is_connected(&self) -> bool {
        self.current()
            .map(|link| link.connection.status().connected())
            .unwrap_or(false)
    }

    /// Cancels every consumer created by this bus, ending their subscription streams
    ///
    /// Deliveries received before can still be settled and the bus keeps publishing.
    pub async fn stop_consuming(&self) -> EmptyResult {
        let consumers = std::mem::take(
            &mut *self
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for (channel, consumer_tag) in consumers {
            channel
                .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                .await?;
            debug!("Cancelled consumer {}", consumer_tag);
        }

        Ok(())
    }

    /// Closes the connection, ending every subscription stream
    pub async fn close(&self) -> EmptyResult {
        self.connector.abort();

        if let Ok(link) = self.current() {
            link.connection.close(REPLY_SUCCESS, "shutting down").await?;
            info!("Disconnected from message broker");
        }

        Ok(())
    }

    async fn declare_exchange(
        &self,
        channel: &Channel,
        exchange: &str,
        kind: ExchangeKind,
    ) -> EmptyResult {
        // The default exchange always exists and may not be declared
        if exchange.is_empty() || self.is_declared(exchange) {
            return Ok(());
        }

        let options = ExchangeDeclareOptions {
            durable: self.options.durable,
            ..Default::default()
        };

        channel
            .exchange_declare(exchange, exchange_kind(kind), options, FieldTable::default())
            .await?;

        debug!("Declared {} exchange {}", kind, exchange);

        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(exchange.to_owned());

        Ok(())
    }

    fn is_declared(&self, exchange: &str) -> bool {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(exchange)
    }
}

impl Drop for AmqpBus {
    fn drop(&mut self) {
        self.connector.abort();
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn publish(&self, envelope: OutboundEnvelope) -> EmptyResult {
        let link = self.current()?;
        let index = self.next_publisher.fetch_add(1, Ordering::Relaxed) % link.publishers.len();
        let channel = &link.publishers[index];

        self.declare_exchange(channel, envelope.exchange(), envelope.kind())
            .await?;

        let properties = to_basic_properties(envelope.properties(), self.options.durable);
        let confirmation = channel
            .basic_publish(
                envelope.exchange(),
                envelope.routing_key(),
                BasicPublishOptions::default(),
                envelope.payload(),
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BusError::Transport(format!(
                "broker refused message for {} on {}",
                envelope.routing_key(),
                envelope.exchange()
            ))
            .into());
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: TopicSpec,
    ) -> Result<BoxStream<'static, InboundEnvelope>, BoxedError> {
        self.ready().await?;
        let link = self.current()?;

        let channel = link.connection.create_channel().await?;
        channel
            .basic_qos(self.options.prefetch, BasicQosOptions::default())
            .await?;

        self.declare_exchange(&channel, &topic.exchange, topic.kind)
            .await?;

        let queue_options = QueueDeclareOptions {
            durable: self.options.durable,
            ..Default::default()
        };
        channel
            .queue_declare(&topic.queue, queue_options, FieldTable::default())
            .await?;
        channel
            .queue_bind(
                &topic.queue,
                &topic.exchange,
                &topic.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer_tag = format!("courier-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &topic.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel, consumer_tag));

        debug!(
            "Consuming {} bound to {} on {} ({})",
            topic.queue, topic.routing_key, topic.exchange, topic.kind
        );

        let queue = topic.queue;
        let deliveries = consumer.filter_map(move |delivery| {
            let envelope = match delivery {
                Ok(delivery) => Some(inbound(delivery)),
                Err(e) => {
                    error!("Failed to receive from {}: {}", queue, e);
                    None
                }
            };

            futures::future::ready(envelope)
        });

        Ok(deliveries.boxed())
    }
}

fn inbound(mut delivery: Delivery) -> InboundEnvelope {
    let message = DeliveredMessage::new(
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        from_basic_properties(&delivery.properties),
        std::mem::take(&mut delivery.data),
        delivery.redelivered,
    );

    let acknowledger = AmqpAcknowledger {
        acker: delivery.acker.clone(),
    };

    InboundEnvelope::new(
        message,
        Acknowledgement::new(delivery.delivery_tag, acknowledger),
    )
}

/// Settles deliveries on the channel they were received on
struct AmqpAcknowledger {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self, _delivery_tag: u64, multiple: bool) -> EmptyResult {
        self.acker.ack(BasicAckOptions { multiple }).await?;
        Ok(())
    }

    async fn nack(&self, _delivery_tag: u64, multiple: bool, requeue: bool) -> EmptyResult {
        self.acker
            .nack(BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }

    async fn reject(&self, _delivery_tag: u64, requeue: bool) -> EmptyResult {
        self.acker.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod does {
    use super::*;

    const UNREACHABLE: &str = "amqp://127.0.0.1:1/%2f";

    fn impatient() -> AmqpOptions {
        AmqpOptions {
            connection_attempts: 1,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn refuse_publishing_before_connecting() {
        let bus = AmqpBus::new(UNREACHABLE, impatient());

        let error = bus
            .publish(OutboundEnvelope::new("svc.api.tx", "getThing", Vec::new()))
            .await
            .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<BusError>(),
            Some(BusError::NotConnected)
        ));
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn give_up_after_all_attempts() {
        let bus = AmqpBus::new(UNREACHABLE, impatient());

        assert!(matches!(bus.ready().await, Err(BusError::NotConnected)));
        assert!(bus
            .subscribe(TopicSpec::new("ex", "key", ExchangeKind::Direct, "queue"))
            .await
            .is_err());
        assert!(bus.close().await.is_ok());
    }

    #[test]
    fn default_to_durable_topology() {
        let options = AmqpOptions::default();

        assert!(options.durable);
        assert_eq!(options.connection_attempts, 5);
        assert_eq!(options.retry_delay, Duration::from_secs(2));
        assert_eq!(options.publish_channels, 4);
    }
}

use super::super::{BoxedError, EmptyResult};
use super::{ExchangeKind, InboundEnvelope, OutboundEnvelope};
use async_trait::async_trait;
use futures::stream::BoxStream;
use log::warn;
use std::fmt;
use thiserror::Error;

/// Errors raised by [`MessageBus`] implementations
#[derive(Error, Debug)]
pub enum BusError {
    /// The connection to the broker has not been established (yet)
    #[error("not connected to the message bus")]
    NotConnected,
    /// The bus has been shut down
    #[error("message bus has been closed")]
    Closed,
    /// The bus is temporarily unable to accept messages
    #[error("message bus is offline")]
    Offline,
    /// The delivery has already been settled or never existed
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
    /// The broker refused or failed to process an operation
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Describes a subscription to messages published on an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    /// Exchange to bind to
    pub exchange: String,
    /// Binding key, interpreted according to `kind`
    pub routing_key: String,
    /// Kind of the exchange
    pub kind: ExchangeKind,
    /// Queue which receives the matching messages
    pub queue: String,
}

impl TopicSpec {
    /// Creates a new instance from raw parts
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        kind: ExchangeKind,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            kind,
            queue: queue.into(),
        }
    }
}

/// Publish/subscribe capability the RPC layer is built upon
///
/// Implementations have to be safe for concurrent use. Any limit on how many publishes
/// may be in flight at once is documented by the implementation.
#[async_trait]
pub trait MessageBus {
    /// Sends a message, resolving once the bus has accepted it
    async fn publish(&self, envelope: OutboundEnvelope) -> EmptyResult;

    /// Binds the queue described by `topic` and streams its messages.
    /// The stream only ends when the bus shuts down.
    async fn subscribe(
        &self,
        topic: TopicSpec,
    ) -> Result<BoxStream<'static, InboundEnvelope>, BoxedError>;
}

/// Transport specific operations to settle a delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Marks the delivery (and all previous ones if `multiple` is set) as processed
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> EmptyResult;

    /// Marks the delivery (and all previous ones if `multiple` is set) as failed
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> EmptyResult;

    /// Refuses a single delivery
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> EmptyResult;
}

/// Single-use handle to settle one delivery
///
/// Every settling operation consumes the handle so that a delivery can not be settled twice.
/// Dropping a handle without settling it leaves the message unacknowledged on the bus and is
/// reported as a warning.
pub struct Acknowledgement {
    delivery_tag: u64,
    acknowledger: Option<Box<dyn Acknowledger>>,
}

impl Acknowledgement {
    /// Creates a new handle for the given delivery
    pub fn new<A: Acknowledger + 'static>(delivery_tag: u64, acknowledger: A) -> Self {
        Self {
            delivery_tag,
            acknowledger: Some(Box::new(acknowledger)),
        }
    }

    /// Identifier of the delivery, only meaningful to the bus that created it
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledges the delivery
    pub async fn ack(mut self, multiple: bool) -> EmptyResult {
        match self.acknowledger.take() {
            Some(acknowledger) => acknowledger.ack(self.delivery_tag, multiple).await,
            None => Ok(()),
        }
    }

    /// Negatively acknowledges the delivery
    pub async fn nack(mut self, multiple: bool, requeue: bool) -> EmptyResult {
        match self.acknowledger.take() {
            Some(acknowledger) => {
                acknowledger
                    .nack(self.delivery_tag, multiple, requeue)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Rejects the delivery
    pub async fn reject(mut self, requeue: bool) -> EmptyResult {
        match self.acknowledger.take() {
            Some(acknowledger) => acknowledger.reject(self.delivery_tag, requeue).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgement")
            .field("delivery_tag", &self.delivery_tag)
            .field("settled", &self.acknowledger.is_none())
            .finish()
    }
}

impl Drop for Acknowledgement {
    fn drop(&mut self) {
        if self.acknowledger.is_some() && !std::thread::panicking() {
            warn!(
                "Delivery {} was dropped without being settled",
                self.delivery_tag
            );
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct RecordingAcknowledger(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Acknowledger for RecordingAcknowledger {
        async fn ack(&self, delivery_tag: u64, multiple: bool) -> EmptyResult {
            self.0
                .lock()
                .unwrap()
                .push(format!("ack {} {}", delivery_tag, multiple));
            Ok(())
        }

        async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> EmptyResult {
            self.0
                .lock()
                .unwrap()
                .push(format!("nack {} {} {}", delivery_tag, multiple, requeue));
            Ok(())
        }

        async fn reject(&self, delivery_tag: u64, requeue: bool) -> EmptyResult {
            self.0
                .lock()
                .unwrap()
                .push(format!("reject {} {}", delivery_tag, requeue));
            Ok(())
        }
    }

    #[tokio::test]
    async fn forward_settlement_with_delivery_tag() {
        let recorder = RecordingAcknowledger::default();

        Acknowledgement::new(1, recorder.clone())
            .ack(false)
            .await
            .unwrap();
        Acknowledgement::new(2, recorder.clone())
            .nack(true, false)
            .await
            .unwrap();
        Acknowledgement::new(3, recorder.clone())
            .reject(true)
            .await
            .unwrap();

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["ack 1 false", "nack 2 true false", "reject 3 true"]
        );
    }

    #[test]
    fn report_settlement_state() {
        let acknowledgement = Acknowledgement::new(7, RecordingAcknowledger::default());
        assert_eq!(acknowledgement.delivery_tag(), 7);
        assert!(format!("{:?}", acknowledgement).contains("settled: false"));
    }
}

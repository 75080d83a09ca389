use super::super::{DeliveredMessage, InboundEnvelope};
use futures::{Stream, StreamExt};
use log::{debug, error, info};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Errors raised when registering a waiter
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CorrelatorError {
    /// A waiter for the identifier already exists, which indicates a bug in id generation
    #[error("correlation id {0} is already awaiting a response")]
    DuplicateCorrelationId(String),
    /// The correlator has been torn down and accepts no new waiters
    #[error("correlator has been shut down")]
    ShutDown,
}

/// Signal received by waiters released during [`Correlator::shutdown`]
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[error("waiter was cancelled")]
pub struct Cancelled;

/// Result of handing an inbound response to the [`Correlator`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DeliveryOutcome {
    /// The response has been handed to its waiter
    Matched,
    /// No waiter exists for the response, it has been discarded
    Orphaned,
}

/// Counters describing the traffic seen by a [`Correlator`]
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct CorrelatorStats {
    /// Responses handed to a waiter
    pub matched: u64,
    /// Responses without a waiter (late arrivals and unsolicited messages)
    pub orphaned: u64,
    /// Waiters withdrawn before a response arrived
    pub cancelled: u64,
    /// Waiters released by a shutdown
    pub released: u64,
}

#[derive(Default)]
struct Counters {
    matched: AtomicU64,
    orphaned: AtomicU64,
    cancelled: AtomicU64,
    released: AtomicU64,
}

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<String, oneshot::Sender<DeliveredMessage>>,
    shut_down: bool,
}

/// Single-use slot resolving to the response of one request
///
/// Resolves to [`Cancelled`] when the correlator is shut down before a response arrives.
pub struct ResponseSlot {
    receiver: oneshot::Receiver<DeliveredMessage>,
}

impl Future for ResponseSlot {
    type Output = Result<DeliveredMessage, Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| Cancelled))
    }
}

/// Table of in-flight requests matching inbound responses to their waiters
///
/// Every access to the table happens under a single lock which is never held across an
/// `.await`. Responses are handed to waiters through one-shot channels, so delivering a
/// response never blocks on a slow caller.
pub struct Correlator {
    table: Mutex<PendingTable>,
    counters: Counters,
    closed: (watch::Sender<bool>, watch::Receiver<bool>),
}

impl Default for Correlator {
    fn default() -> Self {
        Self {
            table: Mutex::default(),
            counters: Counters::default(),
            closed: watch::channel(false),
        }
    }
}

impl Correlator {
    /// Creates an empty correlator
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        // The table stays consistent even if a holder panicked, every critical section is a single map operation
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiter for the given identifier
    pub fn register(&self, correlation_id: &str) -> Result<ResponseSlot, CorrelatorError> {
        let mut table = self.table();

        if table.shut_down {
            return Err(CorrelatorError::ShutDown);
        }

        if table.waiters.contains_key(correlation_id) {
            return Err(CorrelatorError::DuplicateCorrelationId(
                correlation_id.to_owned(),
            ));
        }

        let (sender, receiver) = oneshot::channel();
        table.waiters.insert(correlation_id.to_owned(), sender);

        Ok(ResponseSlot { receiver })
    }

    /// Hands a response to its waiter and acknowledges it
    ///
    /// Responses without a waiter are acknowledged and discarded so they do not linger on the bus.
    pub async fn deliver(&self, envelope: InboundEnvelope) -> DeliveryOutcome {
        let (message, acknowledgement) = envelope.into_parts();

        let waiter = message
            .correlation_id()
            .and_then(|id| self.table().waiters.remove(id));

        let outcome = match waiter {
            // The waiter may have given up between the lookup and now, which makes it an orphan after all
            Some(waiter) => match waiter.send(message) {
                Ok(()) => DeliveryOutcome::Matched,
                Err(message) => {
                    debug!(
                        "Discarding response {:?}, its waiter went away",
                        message.correlation_id()
                    );
                    DeliveryOutcome::Orphaned
                }
            },
            None => {
                debug!(
                    "Discarding orphaned response {:?}",
                    message.correlation_id()
                );
                DeliveryOutcome::Orphaned
            }
        };

        match outcome {
            DeliveryOutcome::Matched => self.counters.matched.fetch_add(1, Ordering::Relaxed),
            DeliveryOutcome::Orphaned => self.counters.orphaned.fetch_add(1, Ordering::Relaxed),
        };

        if let Err(e) = acknowledgement.ack(false).await {
            error!("Failed to acknowledge rpc response: {}", e);
        }

        outcome
    }

    /// Withdraws the waiter for the given identifier if it still exists
    pub fn cancel(&self, correlation_id: &str) {
        if self.table().waiters.remove(correlation_id).is_some() {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Releases all waiters with a [`Cancelled`] signal and refuses further registrations
    ///
    /// Subsequent calls have no effect.
    pub fn shutdown(&self) {
        let drained = {
            let mut table = self.table();
            if table.shut_down {
                return;
            }
            table.shut_down = true;
            std::mem::take(&mut table.waiters)
        };

        let released = drained.len() as u64;
        self.counters.released.fetch_add(released, Ordering::Relaxed);

        // Dropping the senders wakes every waiter with a `Cancelled` signal
        drop(drained);
        self.closed.0.send(true).ok();

        info!("Correlator shut down, released {} waiting requests", released);
    }

    /// Whether a waiter for the given identifier exists
    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.table().waiters.contains_key(correlation_id)
    }

    /// Number of waiting requests
    pub fn pending(&self) -> usize {
        self.table().waiters.len()
    }

    /// Whether [`shutdown`](Correlator::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.table().shut_down
    }

    /// Resolves once [`shutdown`](Correlator::shutdown) has been called
    pub async fn closed(&self) {
        let mut closed = self.closed.1.clone();

        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            matched: self.counters.matched.load(Ordering::Relaxed),
            orphaned: self.counters.orphaned.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
        }
    }
}

/// Feeds every response from the reply subscription into the correlator
///
/// This is the only consumer of the reply queue. Once the stream ends the correlator is shut
/// down so that no caller keeps waiting for a response that can no longer arrive. A shutdown
/// of the correlator ends the loop as well, but only between two deliveries so that every
/// response taken from the stream is settled.
pub async fn listen<S>(correlator: Arc<Correlator>, responses: S)
where
    S: Stream<Item = InboundEnvelope> + Send,
{
    futures::pin_mut!(responses);

    loop {
        let envelope = tokio::select! {
            envelope = responses.next() => envelope,
            _ = correlator.closed() => {
                debug!("Correlator shut down, no longer listening for responses");
                return;
            }
        };

        match envelope {
            Some(envelope) => {
                correlator.deliver(envelope).await;
            }
            None => break,
        }
    }

    debug!("Reply subscription ended");
    correlator.shutdown();
}

/// Removes the registration of a request when dropped
pub(super) struct PendingGuard<'a> {
    correlator: &'a Correlator,
    correlation_id: &'a str,
}

impl<'a> PendingGuard<'a> {
    pub(super) fn new(correlator: &'a Correlator, correlation_id: &'a str) -> Self {
        Self {
            correlator,
            correlation_id,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.cancel(self.correlation_id);
    }
}

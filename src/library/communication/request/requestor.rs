use super::super::super::BoxedError;
use super::super::implementation::json::JsonRequestor;
use super::super::{
    DeliveredMessage, ExchangeKind, HeaderValue, Headers, MessageBus, OutboundEnvelope, Topology,
    CONTENT_TYPE_JSON,
};
use super::correlator::{listen, Cancelled, Correlator, CorrelatorError, PendingGuard};
use async_trait::async_trait;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Time a caller waits for a response unless specified otherwise
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Reason why a request did not yield a response
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NoResponseReason {
    /// The deadline elapsed
    Timeout,
    /// The caller withdrew the request
    Cancelled,
    /// The requestor has been shut down
    ShutDown,
}

impl fmt::Display for NoResponseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoResponseReason::Timeout => write!(f, "deadline elapsed"),
            NoResponseReason::Cancelled => write!(f, "request was cancelled"),
            NoResponseReason::ShutDown => write!(f, "requestor shut down"),
        }
    }
}

/// Error type for sending requests
#[derive(Error, Debug)]
pub enum RequestError {
    /// The request could not be encoded
    #[error("unable to serialize request")]
    Serialization(#[source] serde_json::Error),
    /// Publishing of the request failed
    #[error("sending of request failed")]
    PublishFailed(#[source] BoxedError),
    /// No response has been received
    #[error("no response received: {0}")]
    NoResponse(NoResponseReason),
    /// The generated correlation id collided with a pending request
    #[error("correlation id {0} is already in use")]
    DuplicateCorrelationId(String),
    /// The response could not be decoded
    #[error("response not parseable")]
    Deserialization(#[source] serde_json::Error),
    /// The remote handler reported a failure
    #[error("remote handler failed: {0}")]
    Remote(String),
}

impl From<CorrelatorError> for RequestError {
    fn from(e: CorrelatorError) -> Self {
        match e {
            CorrelatorError::DuplicateCorrelationId(id) => RequestError::DuplicateCorrelationId(id),
            CorrelatorError::ShutDown => RequestError::NoResponse(NoResponseReason::ShutDown),
        }
    }
}

impl From<Cancelled> for RequestError {
    fn from(_: Cancelled) -> Self {
        RequestError::NoResponse(NoResponseReason::ShutDown)
    }
}

/// Raw request which is about to be sent
#[derive(Debug, Clone)]
pub struct RawRequest {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    content_type: String,
    headers: Headers,
    deadline: Option<Duration>,
}

impl RawRequest {
    /// Creates a new JSON request using the default deadline of the requestor
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            content_type: CONTENT_TYPE_JSON.to_owned(),
            headers: Headers::new(),
            deadline: None,
        }
    }

    /// Declares the content type of the payload
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Adds an application header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Overrides the time to wait for a response
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Routing key of the request
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

/// Sender of raw requests, awaiting exactly one response per request
#[async_trait]
pub trait RawRequestor: Send + Sync {
    /// Exchange requests are published to by the convenience methods
    fn request_exchange(&self) -> &str;

    /// Sends a request and waits for its response, the deadline or the `cancellation` future,
    /// whichever completes first
    async fn request_raw<C>(
        &self,
        request: RawRequest,
        cancellation: C,
    ) -> Result<DeliveredMessage, RequestError>
    where
        C: Future<Output = ()> + Send;

    /// Sends a request and returns the payload of its response
    async fn request(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>, RequestError> {
        self.request_with_cancellation(
            exchange,
            routing_key,
            payload,
            deadline,
            futures::future::pending(),
        )
        .await
    }

    /// Like [`request`](RawRequestor::request) but gives up early once `cancellation` completes
    async fn request_with_cancellation<C>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        deadline: Option<Duration>,
        cancellation: C,
    ) -> Result<Vec<u8>, RequestError>
    where
        C: Future<Output = ()> + Send,
    {
        let mut request = RawRequest::new(exchange, routing_key, payload);

        if let Some(deadline) = deadline {
            request = request.with_deadline(deadline);
        }

        let response = self.request_raw(request, cancellation).await?;

        Ok(response.into_payload())
    }
}

/// Typed remote procedure calls using the [`RpcResponse`](super::RpcResponse) convention
#[async_trait]
pub trait Requestor {
    /// Sends `request` to the handler of `operation` and decodes the `data` of its response
    ///
    /// Responses with `ok = false` are reported as [`RequestError::Remote`].
    async fn call<Q, R>(
        &self,
        operation: &str,
        request: &Q,
        deadline: Option<Duration>,
    ) -> Result<R, RequestError>
    where
        Q: Serialize + Sync,
        R: DeserializeOwned + Send;
}

/// Options of a [`BusRequestor`]
#[derive(Debug, Clone)]
pub struct RequestorOptions {
    /// Deadline applied to requests which do not specify their own
    pub response_timeout: Duration,
}

impl Default for RequestorOptions {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// [`RawRequestor`] implementation on top of a [`MessageBus`]
///
/// Owns the subscription to the reply queue of its [`Topology`] and a background task feeding
/// it into a [`Correlator`]. Dropping the requestor shuts it down.
pub struct BusRequestor<B> {
    bus: Arc<B>,
    topology: Topology,
    options: RequestorOptions,
    correlator: Arc<Correlator>,
}

impl<B> BusRequestor<B>
where
    B: MessageBus + Send + Sync + 'static,
{
    /// Subscribes to the reply queue and starts collecting responses
    pub async fn connect(
        bus: Arc<B>,
        topology: Topology,
        options: RequestorOptions,
    ) -> Result<Self, BoxedError> {
        let responses = bus.subscribe(topology.reply_topic()).await?;
        let correlator = Arc::new(Correlator::new());
        tokio::spawn(listen(correlator.clone(), responses));

        debug!("Awaiting responses on {}", topology.reply_address());

        Ok(Self {
            bus,
            topology,
            options,
            correlator,
        })
    }

    /// Releases all waiting callers and stops collecting responses
    ///
    /// The reply loop finishes settling the response it is currently handling before it ends.
    pub fn shutdown(&self) {
        self.correlator.shutdown();
    }

    /// Correlation engine used by this requestor
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Topology requests are sent with
    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

#[async_trait]
impl<B> RawRequestor for BusRequestor<B>
where
    B: MessageBus + Send + Sync + 'static,
{
    fn request_exchange(&self) -> &str {
        self.topology.request_exchange()
    }

    async fn request_raw<C>(
        &self,
        request: RawRequest,
        cancellation: C,
    ) -> Result<DeliveredMessage, RequestError>
    where
        C: Future<Output = ()> + Send,
    {
        let correlation_id = Uuid::new_v4().to_string();
        let slot = self.correlator.register(&correlation_id)?;

        // Withdraws the registration on every exit path, including the caller dropping this future
        let _guard = PendingGuard::new(&self.correlator, &correlation_id);

        let deadline = request.deadline.unwrap_or(self.options.response_timeout);
        let mut envelope =
            OutboundEnvelope::new(request.exchange, request.routing_key, request.payload)
                .with_kind(ExchangeKind::Topic)
                .with_content_type(request.content_type)
                .with_message_id(correlation_id.as_str())
                .with_reply_to(self.topology.reply_address().as_str());

        for (name, value) in request.headers {
            envelope = envelope.with_header(name, value);
        }

        let routing_key = envelope.routing_key().to_owned();

        // The deadline and the cancellation cover publishing as well as waiting for the response
        let expiry = tokio::time::sleep(deadline);
        tokio::pin!(expiry);
        tokio::pin!(cancellation);

        tokio::select! {
            published = self.bus.publish(envelope) => published.map_err(RequestError::PublishFailed)?,
            _ = &mut expiry => {
                warn!("Request {} to {} could not be published within {:?}", correlation_id, routing_key, deadline);
                return Err(RequestError::NoResponse(NoResponseReason::Timeout));
            }
            _ = &mut cancellation => {
                debug!("Request {} to {} was cancelled while publishing", correlation_id, routing_key);
                return Err(RequestError::NoResponse(NoResponseReason::Cancelled));
            }
        }

        tokio::select! {
            response = slot => Ok(response?),
            _ = &mut expiry => {
                warn!("Request {} to {} timed out after {:?}", correlation_id, routing_key, deadline);
                Err(RequestError::NoResponse(NoResponseReason::Timeout))
            }
            _ = &mut cancellation => {
                debug!("Request {} to {} was cancelled", correlation_id, routing_key);
                Err(RequestError::NoResponse(NoResponseReason::Cancelled))
            }
        }
    }
}

impl<B> JsonRequestor for BusRequestor<B> where B: MessageBus + Send + Sync + 'static {}

impl<B> Drop for BusRequestor<B> {
    fn drop(&mut self) {
        self.correlator.shutdown();
    }
}

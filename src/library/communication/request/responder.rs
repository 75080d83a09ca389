use super::super::super::helpers::panic_message;
use super::super::super::{BoxedError, EmptyResult};
use super::super::{
    DeliveredMessage, ExchangeKind, Fault, InboundEnvelope, MessageBus, OutboundEnvelope, Topology,
    CONTENT_TYPE_JSON,
};
use super::RpcResponse;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Default limit of concurrently running handlers
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Structure which answers raw requests
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Processes a request, returning the payload of the response
    async fn handle(&self, request: DeliveredMessage) -> Result<Vec<u8>, BoxedError>;
}

/// [`RequestHandler`] created from a closure by [`handler_fn`]
pub struct HandlerFn<F> {
    function: F,
}

/// Wraps an async closure into a [`RequestHandler`]
pub fn handler_fn<F, Fut>(function: F) -> HandlerFn<F>
where
    F: Fn(DeliveredMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, BoxedError>> + Send + 'static,
{
    HandlerFn { function }
}

#[async_trait]
impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(DeliveredMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, BoxedError>> + Send + 'static,
{
    async fn handle(&self, request: DeliveredMessage) -> Result<Vec<u8>, BoxedError> {
        (self.function)(request).await
    }
}

/// Structure which processes typed requests and produces responses
///
/// Exposed on the bus through [`JsonProcessor`](super::super::implementation::json::JsonProcessor).
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Type of request to process
    type Request: DeserializeOwned + Send;
    /// Type of response produced
    type Response: Serialize + Send;

    /// Handler for requests, returning a response
    async fn process(&self, request: Self::Request) -> Result<Self::Response, BoxedError>;
}

/// Result of running a handler inside the fault boundary
#[derive(Debug, PartialEq)]
pub enum HandlerOutcome {
    /// The handler produced a response payload
    Success(Vec<u8>),
    /// The handler returned an error, panicked or timed out
    Failure(Fault),
}

impl HandlerOutcome {
    /// Runs a handler future, converting errors, panics and an exceeded `timeout` into a [`Fault`]
    pub async fn guarded<F>(handler: F, timeout: Option<Duration>) -> Self
    where
        F: Future<Output = Result<Vec<u8>, BoxedError>>,
    {
        let guarded = AssertUnwindSafe(handler).catch_unwind();

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(result) => result,
                Err(_) => return HandlerOutcome::Failure(Fault::timeout(limit)),
            },
            None => guarded.await,
        };

        match result {
            Ok(Ok(payload)) => HandlerOutcome::Success(payload),
            Ok(Err(e)) => HandlerOutcome::Failure(Fault::from_error(&e)),
            Err(panic) => HandlerOutcome::Failure(Fault::panic(panic_message(panic.as_ref()))),
        }
    }

    /// Payload and content type of the response to send
    ///
    /// Successful payloads are passed through verbatim, failures are described as JSON.
    pub fn into_response(self, content_type: &str) -> (Vec<u8>, String) {
        match self {
            HandlerOutcome::Success(payload) => (payload, content_type.to_owned()),
            HandlerOutcome::Failure(fault) => {
                let payload = serde_json::to_vec(&RpcResponse::failure(&fault))
                    .unwrap_or_else(|_| br#"{"ok":false}"#.to_vec());
                (payload, CONTENT_TYPE_JSON.to_owned())
            }
        }
    }
}

/// Options of a [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Maximum number of handlers running at once across all operations
    pub max_in_flight: usize,
    /// Time after which a handler is abandoned and a timeout is reported
    pub handler_timeout: Option<Duration>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            handler_timeout: None,
        }
    }
}

struct Responder<B> {
    bus: Arc<B>,
    response_exchange: String,
    handler_timeout: Option<Duration>,
}

impl<B> Responder<B>
where
    B: MessageBus + Send + Sync + 'static,
{
    /// Runs the handler and publishes its outcome to the reply address of the request
    ///
    /// The delivery is settled exactly once: acknowledged after the response has been attempted
    /// or rejected without requeueing if the request can not be answered at all.
    async fn respond(&self, handler: &dyn RequestHandler, envelope: InboundEnvelope) {
        let (request, acknowledgement) = envelope.into_parts();

        let (reply_to, request_id) = match (request.reply_to(), request.message_id()) {
            (Some(reply_to), Some(request_id)) => (reply_to.to_owned(), request_id.to_owned()),
            _ => {
                warn!(
                    "Rejecting request for {} without reply address or message id",
                    request.routing_key()
                );

                if let Err(e) = acknowledgement.reject(false).await {
                    error!("Failed to reject request: {}", e);
                }

                return;
            }
        };

        let operation = request.routing_key().to_owned();
        let content_type = request
            .content_type()
            .unwrap_or(CONTENT_TYPE_JSON)
            .to_owned();

        // Calling the handler happens inside the boundary so an eager panic is contained as well
        let outcome = HandlerOutcome::guarded(
            async move { handler.handle(request).await },
            self.handler_timeout,
        )
        .await;

        match &outcome {
            HandlerOutcome::Success(_) => debug!("Answered {} request {}", operation, request_id),
            HandlerOutcome::Failure(fault) => warn!(
                "Handler of {} failed on request {}: {}",
                operation,
                request_id,
                fault.description()
            ),
        }

        let (payload, content_type) = outcome.into_response(&content_type);
        let response = OutboundEnvelope::new(&self.response_exchange, reply_to, payload)
            .with_kind(ExchangeKind::Direct)
            .with_content_type(content_type)
            .with_correlation_id(request_id);

        if let Err(e) = self.bus.publish(response).await {
            error!("Failed to publish response for {}: {}", operation, e);
        }

        if let Err(e) = acknowledgement.ack(false).await {
            error!("Failed to acknowledge {} request: {}", operation, e);
        }
    }
}

/// Answers requests for a set of operations using one [`RequestHandler`] each
///
/// Every request is handled in its own task so that a slow request does not delay unrelated
/// ones. A failing handler is contained and answered with a failure response, the dispatcher
/// itself keeps serving.
pub struct Dispatcher<B> {
    bus: Arc<B>,
    topology: Topology,
    options: DispatcherOptions,
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl<B> Dispatcher<B>
where
    B: MessageBus + Send + Sync + 'static,
{
    /// Creates a dispatcher without any operations
    pub fn new(bus: Arc<B>, topology: Topology, options: DispatcherOptions) -> Self {
        Self {
            bus,
            topology,
            options,
            handlers: HashMap::new(),
        }
    }

    /// Serves `operation` with the given handler, replacing any previous one
    pub fn register<H>(&mut self, operation: impl Into<String>, handler: H)
    where
        H: RequestHandler + 'static,
    {
        self.handlers.insert(operation.into(), Arc::new(handler));
    }

    /// Names of all registered operations
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Consumes requests until every subscription has ended
    ///
    /// Subscribes to all operations before the first request is processed. Once the request
    /// streams end, returns after the handlers still in flight have finished.
    pub async fn run(self) -> EmptyResult {
        let limit = u32::try_from(self.options.max_in_flight)
            .unwrap_or(u32::MAX)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit as usize));
        let responder = Arc::new(Responder {
            bus: self.bus.clone(),
            response_exchange: self.topology.response_exchange().to_owned(),
            handler_timeout: self.options.handler_timeout,
        });

        let mut subscriptions = Vec::with_capacity(self.handlers.len());
        for (operation, handler) in self.handlers {
            let topic = self.topology.request_topic(&operation);
            let requests = self.bus.subscribe(topic).await?;
            info!("Serving {}", operation);
            subscriptions.push((operation, handler, requests));
        }

        let loops = subscriptions
            .into_iter()
            .map(|(operation, handler, requests)| {
                serve(
                    operation,
                    handler,
                    requests,
                    responder.clone(),
                    semaphore.clone(),
                )
            });

        futures::future::join_all(loops).await;

        // Every handler task holds a permit until it has settled its delivery
        if semaphore.acquire_many(limit).await.is_err() {
            warn!("Unable to wait for in-flight handlers");
        }

        info!("Dispatcher stopped");

        Ok(())
    }
}

async fn serve<B>(
    operation: String,
    handler: Arc<dyn RequestHandler>,
    mut requests: BoxStream<'static, InboundEnvelope>,
    responder: Arc<Responder<B>>,
    semaphore: Arc<Semaphore>,
) where
    B: MessageBus + Send + Sync + 'static,
{
    while let Some(envelope) = requests.next().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let handler = handler.clone();
        let responder = responder.clone();

        tokio::spawn(async move {
            responder.respond(handler.as_ref(), envelope).await;
            drop(permit);
        });
    }

    debug!("Request subscription for {} ended", operation);
}

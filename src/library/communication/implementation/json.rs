//! Serialization and deserialization provided by [`serde_json`] using marker traits
//!
//! Implementors of the raw traits opt into the typed ones by implementing a marker trait. The
//! typed layer speaks the [`RpcResponse`] convention: every response body is an object with an
//! `ok` flag, a `data` field holding the result and an `error` description for failures.

use super::super::super::BoxedError;
use super::super::request::{
    RawRequest, RawRequestor, RequestError, RequestHandler, RequestProcessor, Requestor,
    RpcResponse,
};
use super::super::DeliveredMessage;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Marker trait providing a default [`Requestor`] implementation based on [`serde_json`]
pub trait JsonRequestor: RawRequestor {}

#[async_trait]
impl<T> Requestor for T
where
    T: JsonRequestor,
{
    /// Serializes the request using [`serde_json::to_vec`] and unwraps the `data` of the response
    async fn call<Q, R>(
        &self,
        operation: &str,
        request: &Q,
        deadline: Option<Duration>,
    ) -> Result<R, RequestError>
    where
        Q: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let payload = serde_json::to_vec(request).map_err(RequestError::Serialization)?;
        let mut request = RawRequest::new(self.request_exchange(), operation, payload);

        if let Some(deadline) = deadline {
            request = request.with_deadline(deadline);
        }

        let response = self
            .request_raw(request, futures::future::pending())
            .await?;

        let envelope: RpcResponse<Value> =
            serde_json::from_slice(response.payload()).map_err(RequestError::Deserialization)?;

        if !envelope.ok {
            let description = envelope
                .error
                .unwrap_or_else(|| "unknown error".to_owned());
            return Err(RequestError::Remote(description));
        }

        serde_json::from_value(envelope.data.unwrap_or(Value::Null))
            .map_err(RequestError::Deserialization)
    }
}

/// Error raised when a typed request can not be processed
#[derive(Error, Debug)]
pub enum JsonProcessorError {
    /// The request payload did not match the expected type
    #[error("malformed request")]
    MalformedRequest(#[source] serde_json::Error),
    /// The response could not be encoded
    #[error("unable to serialize response")]
    Serialization(#[source] serde_json::Error),
}

/// Adapter exposing a typed [`RequestProcessor`] as a raw [`RequestHandler`]
///
/// Decodes the payload with [`serde_json::from_slice`] and wraps the result into a successful
/// [`RpcResponse`]. Malformed requests are reported as handler errors.
pub struct JsonProcessor<P> {
    processor: P,
}

impl<P> JsonProcessor<P> {
    /// Wraps the given processor
    pub fn new(processor: P) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl<P> RequestHandler for JsonProcessor<P>
where
    P: RequestProcessor,
{
    async fn handle(&self, request: DeliveredMessage) -> Result<Vec<u8>, BoxedError> {
        let request: P::Request = serde_json::from_slice(request.payload())
            .map_err(JsonProcessorError::MalformedRequest)?;

        let response = self.processor.process(request).await?;

        let payload = serde_json::to_vec(&RpcResponse::success(response))
            .map_err(JsonProcessorError::Serialization)?;

        Ok(payload)
    }
}

#[cfg(test)]
mod does {
    use super::super::super::request::{
        BusRequestor, Dispatcher, DispatcherOptions, RequestorOptions,
    };
    use super::super::super::{Properties, Topology};
    use super::super::memory::InMemoryBus;
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Deserialize)]
    struct TeamQuery {
        id: String,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Team {
        id: String,
        name: String,
    }

    struct TeamLookup;

    #[async_trait]
    impl RequestProcessor for TeamLookup {
        type Request = TeamQuery;
        type Response = Team;

        async fn process(&self, request: Self::Request) -> Result<Self::Response, BoxedError> {
            if request.id == "missing" {
                return Err("team does not exist".into());
            }

            Ok(Team {
                name: format!("Team {}", request.id),
                id: request.id,
            })
        }
    }

    fn message(payload: &[u8]) -> DeliveredMessage {
        DeliveredMessage::new("ex", "getTeam", Properties::default(), payload.to_vec(), false)
    }

    #[tokio::test]
    async fn wrap_processor_results() {
        let handler = JsonProcessor::new(TeamLookup);
        let response = handler.handle(message(br#"{"id":"t1"}"#)).await.unwrap();

        assert_eq!(
            serde_json::from_slice::<Value>(&response).unwrap(),
            json!({ "ok": true, "data": { "id": "t1", "name": "Team t1" } })
        );
    }

    #[tokio::test]
    async fn reject_malformed_requests() {
        let handler = JsonProcessor::new(TeamLookup);
        let error = handler.handle(message(b"not json")).await.unwrap_err();

        assert!(matches!(
            error.downcast_ref::<JsonProcessorError>(),
            Some(JsonProcessorError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn call_typed_processors() {
        let bus = InMemoryBus::new();
        let topology = Topology::for_service("teams");

        let mut dispatcher = Dispatcher::new(
            Arc::new(bus.clone()),
            topology.clone(),
            DispatcherOptions::default(),
        );
        dispatcher.register("getTeam", JsonProcessor::new(TeamLookup));
        tokio::spawn(dispatcher.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let requestor = BusRequestor::connect(
            Arc::new(bus.clone()),
            topology,
            RequestorOptions::default(),
        )
        .await
        .unwrap();

        let team: Team = requestor
            .call("getTeam", &json!({ "id": "t1" }), None)
            .await
            .unwrap();
        assert_eq!(
            team,
            Team {
                id: "t1".into(),
                name: "Team t1".into()
            }
        );

        let error = requestor
            .call::<_, Team>("getTeam", &json!({ "id": "missing" }), None)
            .await
            .unwrap_err();
        assert!(
            matches!(error, RequestError::Remote(description) if description == "team does not exist")
        );

        let error = requestor
            .call::<_, Team>("getTeam", &json!({ "identifier": "t1" }), None)
            .await
            .unwrap_err();
        assert!(
            matches!(error, RequestError::Remote(description) if description.starts_with("malformed request"))
        );
    }
}

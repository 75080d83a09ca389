//! Client performing a single request

use super::{termination_signal, SharedOptions};
use crate::library::communication::request::{
    BusRequestor, RawRequest, RawRequestor, RequestorOptions, DEFAULT_RESPONSE_TIMEOUT,
};
use crate::library::communication::CONTENT_TYPE_JSON;
use crate::library::helpers::parse_seconds;
use anyhow::{anyhow, Result};
use log::debug;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
/// Sends a request to an operation and prints the response
///
/// Exits with a non-zero status if no response arrives in time or the request can not be sent.
pub struct Options {
    /// Operation to invoke
    operation: String,

    /// Request payload
    #[structopt(default_value = "{}")]
    payload: String,

    /// Content type of the payload
    #[structopt(long, default_value = "application/json", value_name = "mime")]
    content_type: String,

    /// Seconds to wait for a response
    #[structopt(short, long, parse(try_from_str = parse_seconds), value_name = "seconds")]
    timeout: Option<Duration>,
}

impl Options {
    fn raw_request(&self, exchange: &str) -> RawRequest {
        RawRequest::new(exchange, &self.operation, self.payload.as_bytes())
            .with_content_type(&self.content_type)
            .with_deadline(self.timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT))
    }
}

/// Performs the request and writes the response payload to stdout
pub async fn run(shared_options: SharedOptions, options: Options) -> Result<()> {
    let bus = Arc::new(shared_options.bus());
    bus.ready().await?;

    let requestor = BusRequestor::connect(
        bus.clone(),
        shared_options.topology(),
        RequestorOptions::default(),
    )
    .await
    .map_err(|e| anyhow!(e))?;

    let request = options.raw_request(requestor.request_exchange());
    debug!("Requesting {}", request.routing_key());

    let response = requestor.request_raw(request, termination_signal()).await;

    requestor.shutdown();
    bus.close().await.map_err(|e| anyhow!(e))?;

    let response = response?;
    let mut stdout = std::io::stdout();
    stdout.write_all(response.payload())?;
    stdout.write_all(b"\n")?;

    Ok(())
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn build_request_from_arguments() {
        let options =
            Options::from_iter_safe(vec!["request", "getThing", r#"{"id":"t1"}"#, "-t", "5"])
                .unwrap();

        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.content_type, CONTENT_TYPE_JSON);

        let request = options.raw_request("courier.api.tx");
        assert_eq!(request.routing_key(), "getThing");
    }

    #[test]
    fn default_to_empty_object() {
        let options = Options::from_iter_safe(vec!["request", "ping"]).unwrap();

        assert_eq!(options.payload, "{}");
        assert_eq!(options.timeout, None);
    }
}

//! Server answering the built-in operations

use super::{termination_signal, SharedOptions};
use crate::library::communication::implementation::json::JsonProcessor;
use crate::library::communication::request::{
    handler_fn, Dispatcher, DispatcherOptions, RequestProcessor, DEFAULT_MAX_IN_FLIGHT,
};
use crate::library::communication::DeliveredMessage;
use crate::library::helpers::parse_seconds;
use crate::library::BoxedError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, StructOpt)]
/// Answers requests for the `echo` and `ping` operations
///
/// `echo` returns the request payload verbatim while `ping` answers any JSON request with a pong.
pub struct Options {
    /// Maximum number of requests handled at once
    #[structopt(long, env, default_value = "64", value_name = "count")]
    max_in_flight: usize,

    /// Seconds after which a handler is abandoned and a timeout is reported
    #[structopt(long, env, parse(try_from_str = parse_seconds), value_name = "seconds")]
    handler_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            handler_timeout: None,
        }
    }
}

#[derive(Serialize, Debug, PartialEq)]
struct Pong {
    message: &'static str,
    request: Value,
}

struct Ping;

#[async_trait]
impl RequestProcessor for Ping {
    type Request = Value;
    type Response = Pong;

    async fn process(&self, request: Self::Request) -> Result<Self::Response, BoxedError> {
        Ok(Pong {
            message: "pong",
            request,
        })
    }
}

async fn echo(request: DeliveredMessage) -> Result<Vec<u8>, BoxedError> {
    Ok(request.into_payload())
}

/// Serves the built-in operations until the process is terminated
pub async fn run(shared_options: SharedOptions, options: Options) -> Result<()> {
    let bus = Arc::new(shared_options.bus());
    bus.ready().await?;

    let dispatcher_options = DispatcherOptions {
        max_in_flight: options.max_in_flight,
        handler_timeout: options.handler_timeout,
    };

    let mut dispatcher =
        Dispatcher::new(bus.clone(), shared_options.topology(), dispatcher_options);
    dispatcher.register("echo", handler_fn(echo));
    dispatcher.register("ping", JsonProcessor::new(Ping));

    let mut server = tokio::spawn(dispatcher.run());

    tokio::select! {
        result = &mut server => {
            result?.map_err(|e| anyhow!(e))?;
            warn!("Request subscriptions ended unexpectedly");
        }
        _ = termination_signal() => {
            info!("Terminating, waiting for in-flight requests");
            bus.stop_consuming().await.map_err(|e| anyhow!(e))?;

            match tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await {
                Ok(result) => result?.map_err(|e| anyhow!(e))?,
                Err(_) => warn!("In-flight requests did not finish within {:?}", DRAIN_TIMEOUT),
            }
        }
    }

    bus.close().await.map_err(|e| anyhow!(e))?;

    Ok(())
}

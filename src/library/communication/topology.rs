use super::{ExchangeKind, TopicSpec};
use std::fmt;

/// Queue all responses to requests of one process are routed to
///
/// Established once at startup and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyAddress(String);

impl ReplyAddress {
    /// Creates a new address from a queue name
    pub fn new(queue: impl Into<String>) -> Self {
        Self(queue.into())
    }

    /// Name of the underlying queue
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exchange and queue names used by both parties of a remote procedure call
///
/// Requests are published to a topic exchange with the operation name as their routing key
/// and consumed from one queue per operation. Responses are published to a separate direct
/// exchange using the reply-to address of the request as their routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    request_exchange: String,
    response_exchange: String,
    queue_prefix: String,
    reply_address: ReplyAddress,
}

impl Topology {
    /// Derives all names from a service namespace
    ///
    /// For the namespace `slackTeams` this yields the request exchange `slackTeams.api.tx`,
    /// the response exchange `slackTeams.api.response`, request queues named `slackTeams.api.<operation>`
    /// and the reply queue `slackTeams.rpcResponses`.
    pub fn for_service(namespace: &str) -> Self {
        Self {
            request_exchange: format!("{}.api.tx", namespace),
            response_exchange: format!("{}.api.response", namespace),
            queue_prefix: format!("{}.api.", namespace),
            reply_address: ReplyAddress::new(format!("{}.rpcResponses", namespace)),
        }
    }

    /// Replaces the exchange requests are published to
    pub fn with_request_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.request_exchange = exchange.into();
        self
    }

    /// Replaces the exchange responses are published to
    pub fn with_response_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.response_exchange = exchange.into();
        self
    }

    /// Replaces the prefix of per-operation request queues
    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    /// Replaces the reply queue of this process
    pub fn with_reply_address(mut self, address: ReplyAddress) -> Self {
        self.reply_address = address;
        self
    }

    /// Exchange requests are published to
    pub fn request_exchange(&self) -> &str {
        &self.request_exchange
    }

    /// Exchange responses are published to
    pub fn response_exchange(&self) -> &str {
        &self.response_exchange
    }

    /// Reply queue of this process
    pub fn reply_address(&self) -> &ReplyAddress {
        &self.reply_address
    }

    /// Subscription consumed by the responder of an operation
    pub fn request_topic(&self, operation: &str) -> TopicSpec {
        TopicSpec::new(
            &self.request_exchange,
            operation,
            ExchangeKind::Topic,
            format!("{}{}", self.queue_prefix, operation),
        )
    }

    /// Subscription consumed by the requesting side to collect responses
    pub fn reply_topic(&self) -> TopicSpec {
        TopicSpec::new(
            &self.response_exchange,
            self.reply_address.as_str(),
            ExchangeKind::Direct,
            self.reply_address.as_str(),
        )
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn derive_names_from_namespace() {
        let topology = Topology::for_service("slackTeams");

        assert_eq!(
            topology.request_topic("getTeam"),
            TopicSpec::new(
                "slackTeams.api.tx",
                "getTeam",
                ExchangeKind::Topic,
                "slackTeams.api.getTeam"
            )
        );
        assert_eq!(
            topology.reply_topic(),
            TopicSpec::new(
                "slackTeams.api.response",
                "slackTeams.rpcResponses",
                ExchangeKind::Direct,
                "slackTeams.rpcResponses"
            )
        );
    }

    #[test]
    fn apply_overrides() {
        let topology = Topology::for_service("svc")
            .with_request_exchange("requests")
            .with_response_exchange("responses")
            .with_queue_prefix("q.")
            .with_reply_address(ReplyAddress::new("svc.replies.1"));

        assert_eq!(topology.request_topic("op").queue, "q.op");
        assert_eq!(topology.request_topic("op").exchange, "requests");
        assert_eq!(topology.reply_topic().exchange, "responses");
        assert_eq!(topology.reply_address().to_string(), "svc.replies.1");
    }
}

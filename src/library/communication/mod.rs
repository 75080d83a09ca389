//! Structures to perform remote procedure calls over a publish/subscribe message bus
//!
//! A message bus only knows how to publish [`OutboundEnvelope`]s to an exchange and how to
//! deliver [`InboundEnvelope`]s from a queue. This module layers a request-response pattern
//! on top of that:
//!
//! 1. The requesting side generates a unique correlation identifier, registers a waiter for it
//!    with the [`Correlator`](request::Correlator) and publishes the request with the identifier
//!    as its message id and its own reply queue as the reply-to address.
//! 2. The responding side consumes the request, runs a handler inside a fault boundary and
//!    publishes the outcome to the reply-to address, echoing the message id as the correlation id.
//! 3. A single listening loop on the requesting side consumes the reply queue and hands every
//!    response to the waiter registered for its correlation id.
//!
//! Responses are matched solely by their correlation identifier. There is no ordering between
//! concurrent requests and a response arriving after its request timed out is silently discarded.
//!
//! The [`Topology`] describes where requests and responses travel and is shared by both parties.

mod bus;
mod envelope;
mod error;
mod topology;

pub mod implementation;
pub mod request;

pub use bus::*;
pub use envelope::*;
pub use error::*;
pub use topology::*;

//! This library crate contains everything needed to perform remote procedure calls over a topic based message bus.
//!
//! The low-level [`library`] provides the envelope model, the bus abstraction, the correlation engine matching
//! responses to waiting callers and the dispatcher answering incoming requests. The [`services`] module builds
//! the executable services of the `courier` binary on top of it.

#![deny(missing_docs)]

pub mod library;

#[cfg(feature = "amqp")]
pub mod services;

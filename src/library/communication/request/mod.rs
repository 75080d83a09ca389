//! Request-response pattern on top of a [`MessageBus`](super::MessageBus)
//!
//! The requesting side is built from a [`Correlator`] fed by the reply subscription and a
//! [`BusRequestor`] which publishes requests and awaits their responses. The responding side
//! is a [`Dispatcher`] which runs a [`RequestHandler`] per operation.
//!
//! Both sides agree on the [`Topology`](super::Topology) and on the JSON envelope described by
//! [`RpcResponse`] when the typed helpers are used.

mod correlator;
mod requestor;
mod responder;
mod response;

pub use correlator::*;
pub use requestor::*;
pub use responder::*;
pub use response::*;

//! Switchboard - addressable-node messaging core
//!
//! Independently running processes address each other by channel name over a
//! publish/subscribe bus, correlate requests with replies through a callback
//! registry, and supervise worker processes and threads.

pub mod bus;
pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod id;
pub mod node;
pub mod registry;
pub mod service;
pub mod supervisor;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{Bus, BusError, BusMessage, MessageHandler};
pub use endpoint::{Controller, Done, Endpoint, RegistrationError, Route};
pub use envelope::{Envelope, EnvelopeError, Params, Reply};
pub use node::{Lifecycle, Node, NodeError, NodeIdentity, NoopLifecycle};
pub use registry::{CallbackError, CallbackRegistry, Continuation, RegistryConfig};
pub use service::{Service, ServiceBuilder};

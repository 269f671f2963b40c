//! Remote delivery dispatcher.
//!
//! Monitor units hand payloads to a shared [`Dispatcher`]. A fixed pool of
//! workers drains a bounded queue and performs the outbound calls; every
//! request carries a write-once response channel.
//!
//! ```text
//! ┌──────────────┐ submit() ┌───────────────┐      ┌──────────┐
//! │ MonitorUnit  │ ───────► │ bounded queue │ ───► │ worker 0 │ ──► HTTP / syslog
//! └──────▲───────┘ try_send └───────────────┘  ├─► │ worker 1 │
//!        │                                     └─► │ worker 2 │
//!        └────────── DeliveryResponse (oneshot) ◄──┴──────────┘
//! ```
//!
//! Overload never blocks a producer: when the queue is full the request is
//! dropped and the submitter sees a closed channel.

mod dispatcher;
mod error;
mod request;
mod transport;

use std::time::Duration;

pub use dispatcher::{DeliveryOutcome, Dispatcher, await_delivery};
pub use error::DeliveryError;
pub use request::{DeliveryRequest, DeliveryResponse, Destination};
pub use transport::{HttpTransport, NetworkTransport, SyslogTransport, Transport, build_client, prepare};

pub const DEFAULT_WORKERS: usize = 3;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// How long a caller waits for a response before giving up
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

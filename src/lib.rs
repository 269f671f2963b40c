//! Host telemetry agent
//!
//! Monitor units sample local signals on their own timers, write every sample
//! to the [`sink::LogSink`] and optionally forward it through the shared
//! [`dispatch::Dispatcher`]. The [`lifecycle::Coordinator`] owns process
//! start-up and the bounded graceful shutdown.
//!
//! ```text
//!   ┌──────────────┐  log()   ┌──────────┐
//!   │ MonitorUnit  │ ───────► │ LogSink  │ ──► stdout / file (+ syslog)
//!   │ (N of them)  │          └──────────┘
//!   │              │ submit() ┌────────────┐
//!   │              │ ───────► │ Dispatcher │ ──► HTTP collector / syslog
//!   └──────▲───────┘          └─────▲──────┘
//!          │      cancellation      │
//!          └──────── Coordinator ───┘
//! ```

pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod os_signals;
pub mod plugins;
pub mod sink;
pub mod syslog;
pub mod telemetry;
pub mod units;
pub mod util;

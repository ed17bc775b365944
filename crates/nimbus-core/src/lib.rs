//! Core request coordination for the Nimbus weather telemetry collector.
//!
//! Every outbound call the process makes to the upstream weather API goes
//! through a [`queue::RequestQueue`]: a single background worker dispatches
//! calls strictly in FIFO order with a minimum wall-clock gap between
//! dispatches, and identical concurrent submissions collapse into one
//! upstream call whose result all submitters share. The queue knows nothing
//! about devices or weather readings — it coordinates arbitrary callables
//! submitted by the scheduler, HTTP handlers, and CLI commands.

pub mod config;
pub mod error;
pub mod key;
pub mod queue;
pub mod telemetry;

pub use config::QueueConfig;
pub use error::{QueueError, Result};
pub use key::RequestKey;
pub use queue::{MetricsSnapshot, RequestQueue};

//! # Worker Components
//!
//! The process a master admits as a slave.
//!
//! - [`worker`]: announce over UDP, then serve the load and task channels
//! - [`metrics`]: load figure reported to the master
//! - [`error`]: worker error type

pub mod error;
pub mod metrics;
pub mod worker;

pub use error::{WorkerError, WorkerResult};
pub use metrics::WorkerMetrics;
pub use worker::{EchoExecutor, TaskExecutor, Worker};

//! # Common Components
//!
//! Shared utilities and data structures used by both master and worker.
//!
//! ## Modules
//!
//! - [`messages`]: Tagged packet envelope and every control message payload
//! - [`connection`]: Length-delimited framing of packets over TCP
//! - [`config`]: TOML configuration for both binaries
//! - [`net`]: Local and broadcast address discovery
//! - [`logging`]: Logger initialisation

pub mod config;
pub mod connection;
pub mod logging;
pub mod messages;
pub mod net;

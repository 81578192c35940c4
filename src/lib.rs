//! Master/worker task distribution over a LAN.
//!
//! A [`Master`] discovers workers by UDP broadcast, keeps two TCP channels open
//! to each (load probes and task traffic), places submitted tasks with a
//! pluggable policy, and moves the tasks of dead workers to survivors.

pub mod common;
pub mod master;
pub mod worker;

pub use common::messages::Packet;
pub use master::{Master, PolicyKind};
pub use worker::Worker;

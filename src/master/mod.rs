//! # Master Components
//!
//! ## Coordinator ([`master`])
//! Owns the pool and the task table, places tasks, and reclaims dead slaves.
//!
//! ## Slaves ([`slave`], [`pool`])
//! One record per admitted slave with its four channel loops, and the
//! registry that holds them.
//!
//! ## Placement ([`balancer`])
//! Pluggable policies choosing the slave for a task.
//!
//! ## Surfaces ([`discovery`], [`api`])
//! UDP admission handshake and the HTTP task API.

pub mod api;
pub mod balancer;
pub mod discovery;
pub mod error;
pub mod master;
pub mod pool;
pub mod slave;
pub mod task;

pub use balancer::{Balancer, PolicyKind};
pub use error::{MasterError, MasterResult, PlacementError};
pub use master::Master;
pub use pool::SlavePool;
pub use slave::{Slave, SlaveKey};
pub use task::{Task, TaskTable};

//! # Configuration
//!
//! TOML configuration for the master and worker binaries. Every field has a
//! default, so an empty file (or no file at all) yields a usable setup.
//!
//! ## Example master configuration
//!
//! ```toml
//! [master]
//! policy = "least_load"
//! discovery_port = 9000
//! http_address = "0.0.0.0:8080"
//!
//! [timing]
//! load_probe_interval_ms = 1000
//! gc_interval_ms = 2000
//!
//! [placement]
//! target_capacity = 100.0
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::common::messages::SlaveId;
use crate::master::balancer::PolicyKind;

/// Well-known UDP port the master listens on for discovery broadcasts.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9000;

/// UDP port a worker waits on for the master's discovery response.
pub const DEFAULT_REPLY_PORT: u16 = 9001;

/// Load a TOML configuration file and deserialize it into the specified type.
///
/// # Example
/// ```ignore
/// let config: MasterConfig = load_config("config/master.toml")?;
/// ```
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)?;
    let config: T = toml::from_str(&content)?;
    Ok(config)
}

// ============================================================================
// MASTER
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub master: MasterInfo,
    pub timing: TimingConfig,
    pub placement: PlacementConfig,
}

/// Identity and listening addresses of the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterInfo {
    /// Placement policy used for new tasks
    pub policy: PolicyKind,
    /// UDP discovery port (0 picks an ephemeral port)
    pub discovery_port: u16,
    /// HTTP submission API address; `None` disables the API
    pub http_address: Option<SocketAddr>,
    /// Address announced to slaves; detected from the routing table when unset
    pub advertise_address: Option<IpAddr>,
    /// Subnet mask used to derive the broadcast address
    pub netmask: Ipv4Addr,
}

impl Default for MasterInfo {
    fn default() -> Self {
        Self {
            policy: PolicyKind::RoundRobin,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            http_address: None,
            advertise_address: None,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
        }
    }
}

/// Intervals and limits for the per-slave loops and the reclamation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How often a `LoadRequest` is written on each load channel
    pub load_probe_interval_ms: u64,
    /// Pause between two writes on a task channel
    pub task_pacing_ms: u64,
    /// Period of the reclamation (GC) loop
    pub gc_interval_ms: u64,
    /// Wait before the single placement retry
    pub assign_retry_backoff_ms: u64,
    /// Timeout for dialing a slave's TCP channels
    pub connect_timeout_ms: u64,
    /// Capacity of each slave's outbound send queue
    pub send_queue_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            load_probe_interval_ms: 1000,
            task_pacing_ms: 100,
            gc_interval_ms: 2000,
            assign_retry_backoff_ms: 1000,
            connect_timeout_ms: 3000,
            send_queue_capacity: 64,
        }
    }
}

/// Shortest period handed to a ticker. `tokio::time::interval` panics on zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

impl TimingConfig {
    /// Period of each slave's load request loop, never zero.
    pub fn load_probe_interval(&self) -> Duration {
        Duration::from_millis(self.load_probe_interval_ms).max(MIN_INTERVAL)
    }

    pub fn task_pacing(&self) -> Duration {
        Duration::from_millis(self.task_pacing_ms)
    }

    /// Period of the reclamation loop, never zero.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms).max(MIN_INTERVAL)
    }

    pub fn assign_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.assign_retry_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Capacity the least-difference policy tries to fill each slave up to
    pub target_capacity: f64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            target_capacity: 100.0,
        }
    }
}

impl MasterConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        load_config(path)
    }
}

// ============================================================================
// WORKER
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker: WorkerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerInfo {
    pub id: SlaveId,
    /// Where discovery requests are sent: a broadcast or unicast address
    pub master_address: SocketAddr,
    /// Address the worker binds its listeners to
    pub listen_address: IpAddr,
    /// Address announced to the master; detected when unset
    pub advertise_address: Option<IpAddr>,
    /// Load channel port (0 picks an ephemeral port)
    pub load_port: u16,
    /// Task channel port (0 picks an ephemeral port)
    pub task_port: u16,
    /// UDP port for the discovery response (0 picks an ephemeral port)
    pub reply_port: u16,
    pub announce_timeout_ms: u64,
    pub announce_attempts: u32,
    /// Offers beyond this many running tasks are rejected (0 = unlimited)
    pub max_active_tasks: u64,
}

impl Default for WorkerInfo {
    fn default() -> Self {
        Self {
            id: 1,
            master_address: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                DEFAULT_DISCOVERY_PORT,
            ),
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_address: None,
            load_port: 9101,
            task_port: 9102,
            reply_port: DEFAULT_REPLY_PORT,
            announce_timeout_ms: 2000,
            announce_attempts: 5,
            max_active_tasks: 0,
        }
    }
}

impl WorkerInfo {
    pub fn announce_timeout(&self) -> Duration {
        Duration::from_millis(self.announce_timeout_ms)
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        load_config(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config: MasterConfig = toml::from_str("").unwrap();
        assert_eq!(config.master.policy, PolicyKind::RoundRobin);
        assert_eq!(config.master.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.timing.gc_interval(), Duration::from_secs(2));
        assert_eq!(config.placement.target_capacity, 100.0);
    }

    #[test]
    fn master_config_loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [master]
            policy = "least_difference"
            discovery_port = 0
            http_address = "127.0.0.1:8080"

            [timing]
            task_pacing_ms = 5
            "#
        )
        .unwrap();

        let config = MasterConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.master.policy, PolicyKind::LeastDifference);
        assert_eq!(config.master.discovery_port, 0);
        assert_eq!(
            config.master.http_address,
            Some("127.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(config.timing.task_pacing(), Duration::from_millis(5));
        assert_eq!(config.timing.load_probe_interval_ms, 1000);
    }

    #[tokio::test]
    async fn zero_intervals_are_clamped() {
        let config: MasterConfig =
            toml::from_str("[timing]\ngc_interval_ms = 0\nload_probe_interval_ms = 0\n").unwrap();
        assert_eq!(config.timing.gc_interval_ms, 0);
        assert_eq!(config.timing.gc_interval(), Duration::from_millis(1));
        assert_eq!(config.timing.load_probe_interval(), Duration::from_millis(1));

        // Both values must be usable as ticker periods.
        let _gc = tokio::time::interval(config.timing.gc_interval());
        let _load = tokio::time::interval(config.timing.load_probe_interval());
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let result: Result<MasterConfig, _> = toml::from_str("[master]\npolicy = \"random\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn worker_config_defaults_to_broadcast() {
        let config: WorkerConfig = toml::from_str("[worker]\nid = 4\n").unwrap();
        assert_eq!(config.worker.id, 4);
        assert_eq!(
            config.worker.master_address.ip(),
            IpAddr::V4(Ipv4Addr::BROADCAST)
        );
        assert_eq!(config.worker.announce_attempts, 5);
    }
}

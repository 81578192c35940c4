//! # Placement Policies
//!
//! A [`Balancer`] picks the slave that receives a new task, given an immutable
//! snapshot of the pool. Policies never see the pool lock.
//!
//! | Policy            | Choice                                                  |
//! |-------------------|---------------------------------------------------------|
//! | `first_available` | first live slave in snapshot order                      |
//! | `round_robin`     | rotating cursor over the live slaves                    |
//! | `least_load`      | minimum reported load, ties go to the earliest slave    |
//! | `least_difference`| best fit: minimises `|load + task.load - capacity|`     |
//!
//! Loads are read as of snapshot time and may be up to one probe interval old.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::common::config::PlacementConfig;
use crate::master::error::PlacementError;
use crate::master::slave::Slave;
use crate::master::task::Task;

pub trait Balancer: Send + Sync {
    fn kind(&self) -> PolicyKind;

    fn select(&self, slaves: &[Arc<Slave>], task: &Task) -> Result<Arc<Slave>, PlacementError>;
}

/// The closed set of placement policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    FirstAvailable,
    RoundRobin,
    LeastLoad,
    LeastDifference,
}

impl PolicyKind {
    pub const ALL: [PolicyKind; 4] = [
        PolicyKind::FirstAvailable,
        PolicyKind::RoundRobin,
        PolicyKind::LeastLoad,
        PolicyKind::LeastDifference,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::FirstAvailable => "first_available",
            PolicyKind::RoundRobin => "round_robin",
            PolicyKind::LeastLoad => "least_load",
            PolicyKind::LeastDifference => "least_difference",
        }
    }

    /// Instantiate the policy. Called once, when the master is built.
    pub fn build(self, placement: &PlacementConfig) -> Box<dyn Balancer> {
        match self {
            PolicyKind::FirstAvailable => Box::new(FirstAvailable),
            PolicyKind::RoundRobin => Box::new(RoundRobin::new()),
            PolicyKind::LeastLoad => Box::new(LeastLoad),
            PolicyKind::LeastDifference => Box::new(LeastDifference::new(placement.target_capacity)),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PolicyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown placement policy '{}' (expected one of: first_available, round_robin, least_load, least_difference)",
                    s
                )
            })
    }
}

/// Slaves still able to take work.
fn live(slaves: &[Arc<Slave>]) -> impl Iterator<Item = &Arc<Slave>> {
    slaves.iter().filter(|s| !s.is_closing())
}

// ============================================================================
// STRATEGIES
// ============================================================================

#[derive(Debug, Default)]
pub struct FirstAvailable;

impl Balancer for FirstAvailable {
    fn kind(&self) -> PolicyKind {
        PolicyKind::FirstAvailable
    }

    fn select(&self, slaves: &[Arc<Slave>], _task: &Task) -> Result<Arc<Slave>, PlacementError> {
        live(slaves)
            .next()
            .cloned()
            .ok_or(PlacementError::NoEligiblePeer)
    }
}

/// Rotates over the snapshot. The cursor is reduced modulo the current
/// snapshot length on every call, so a shrinking pool never indexes out of
/// range.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn kind(&self) -> PolicyKind {
        PolicyKind::RoundRobin
    }

    fn select(&self, slaves: &[Arc<Slave>], _task: &Task) -> Result<Arc<Slave>, PlacementError> {
        let candidates: Vec<&Arc<Slave>> = live(slaves).collect();
        if candidates.is_empty() {
            return Err(PlacementError::NoEligiblePeer);
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(Arc::clone(candidates[idx]))
    }
}

#[derive(Debug, Default)]
pub struct LeastLoad;

impl Balancer for LeastLoad {
    fn kind(&self) -> PolicyKind {
        PolicyKind::LeastLoad
    }

    fn select(&self, slaves: &[Arc<Slave>], _task: &Task) -> Result<Arc<Slave>, PlacementError> {
        let mut best: Option<(&Arc<Slave>, f64)> = None;
        for slave in live(slaves) {
            let load = slave.current_load();
            match best {
                Some((_, lowest)) if load >= lowest => {}
                _ => best = Some((slave, load)),
            }
        }
        best.map(|(slave, _)| Arc::clone(slave))
            .ok_or(PlacementError::NoEligiblePeer)
    }
}

/// Best-fit placement against a target capacity. Slaves the task would push
/// past the capacity are not eligible.
#[derive(Debug)]
pub struct LeastDifference {
    target_capacity: f64,
}

impl LeastDifference {
    pub fn new(target_capacity: f64) -> Self {
        Self { target_capacity }
    }
}

impl Balancer for LeastDifference {
    fn kind(&self) -> PolicyKind {
        PolicyKind::LeastDifference
    }

    fn select(&self, slaves: &[Arc<Slave>], task: &Task) -> Result<Arc<Slave>, PlacementError> {
        let mut best: Option<(&Arc<Slave>, f64)> = None;
        for slave in live(slaves) {
            let after = slave.current_load() + task.load as f64;
            if after > self.target_capacity {
                continue;
            }
            let gap = (after - self.target_capacity).abs();
            match best {
                Some((_, smallest)) if gap >= smallest => {}
                _ => best = Some((slave, gap)),
            }
        }
        best.map(|(slave, _)| Arc::clone(slave))
            .ok_or(PlacementError::NoEligiblePeer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::slave::tests::test_slave;

    fn task(load: u64) -> Task {
        Task::new(1, b"work".to_vec(), load)
    }

    fn pool_with_loads(loads: &[f64]) -> Vec<Arc<Slave>> {
        loads
            .iter()
            .enumerate()
            .map(|(i, load)| {
                let slave = test_slave(i as u8 + 1, 1);
                slave.record_load(*load, 1);
                slave
            })
            .collect()
    }

    #[test]
    fn policy_names_parse() {
        for kind in PolicyKind::ALL {
            assert_eq!(kind.as_str().parse::<PolicyKind>().unwrap(), kind);
            assert_eq!(kind.build(&PlacementConfig::default()).kind(), kind);
        }
        assert!("random".parse::<PolicyKind>().is_err());
    }

    #[test]
    fn empty_snapshot_has_no_eligible_peer() {
        for kind in PolicyKind::ALL {
            let balancer = kind.build(&PlacementConfig::default());
            assert_eq!(
                balancer.select(&[], &task(1)).unwrap_err(),
                PlacementError::NoEligiblePeer
            );
        }
    }

    #[test]
    fn first_available_skips_closing_slaves() {
        let slaves = pool_with_loads(&[1.0, 2.0]);
        slaves[0].shutdown();
        let chosen = FirstAvailable.select(&slaves, &task(1)).unwrap();
        assert_eq!(chosen.key(), slaves[1].key());
    }

    #[test]
    fn least_load_picks_the_lightest_slave() {
        let slaves = pool_with_loads(&[2.0, 8.0]);
        let chosen = LeastLoad.select(&slaves, &task(5)).unwrap();
        assert_eq!(chosen.key(), slaves[0].key());
    }

    #[test]
    fn least_load_ties_go_to_snapshot_order() {
        let slaves = pool_with_loads(&[4.0, 3.0, 3.0]);
        let chosen = LeastLoad.select(&slaves, &task(1)).unwrap();
        assert_eq!(chosen.key(), slaves[1].key());
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let slaves = pool_with_loads(&[0.0, 0.0, 0.0]);
        let rr = RoundRobin::new();
        let picks: Vec<_> = (0..6)
            .map(|_| rr.select(&slaves, &task(1)).unwrap().key())
            .collect();
        let expected: Vec<_> = [0, 1, 2, 0, 1, 2].iter().map(|&i| slaves[i].key()).collect();
        assert_eq!(picks, expected);
    }

    #[test]
    fn round_robin_survives_a_shrinking_snapshot() {
        let mut slaves = pool_with_loads(&[0.0, 0.0, 0.0]);
        let rr = RoundRobin::new();
        assert_eq!(rr.select(&slaves, &task(1)).unwrap().key(), slaves[0].key());
        assert_eq!(rr.select(&slaves, &task(1)).unwrap().key(), slaves[1].key());

        slaves.remove(1);
        for _ in 0..5 {
            let chosen = rr.select(&slaves, &task(1)).unwrap();
            assert!(slaves.iter().any(|s| s.key() == chosen.key()));
        }
        assert_eq!(rr.select(&slaves, &task(1)).unwrap().key(), slaves[1].key());
    }

    #[test]
    fn least_difference_prefers_the_best_fit() {
        let balancer = LeastDifference::new(10.0);
        let slaves = pool_with_loads(&[1.0, 6.0, 8.0]);
        // 6 + 3 = 9 leaves the smallest gap; 8 + 3 overflows the capacity.
        let chosen = balancer.select(&slaves, &task(3)).unwrap();
        assert_eq!(chosen.key(), slaves[1].key());
    }

    #[test]
    fn least_difference_rejects_when_nothing_fits() {
        let balancer = LeastDifference::new(10.0);
        let slaves = pool_with_loads(&[9.0, 9.5]);
        assert_eq!(
            balancer.select(&slaves, &task(5)).unwrap_err(),
            PlacementError::NoEligiblePeer
        );
    }
}

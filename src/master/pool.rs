//! # Slave Pool
//!
//! Thread-safe registry of every admitted slave. Reads (existence checks,
//! snapshots for placement) take the shared lock; admission, removal and
//! reclamation take the exclusive lock. No `(ip, id)` pair is ever present
//! twice.

use log::{debug, info};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use crate::common::messages::SlaveId;
use crate::master::slave::{Slave, SlaveEvent, SlaveKey, SlaveView};

#[derive(Debug, Default)]
pub struct SlavePool {
    slaves: RwLock<Vec<Arc<Slave>>>,
}

impl SlavePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the slave's loops onto its two channels and register it.
    ///
    /// # Arguments
    /// - `slave`: Freshly built record, still `Open`
    /// - `load_stream`: Dialed connection to the slave's load port
    /// - `task_stream`: Dialed connection to the slave's task port
    /// - `events`: Where the task receiver forwards replies and results
    ///
    /// # Returns
    /// - `true`: The slave joined the pool and its four loops are running
    /// - `false`: A slave with the same `(ip, id)` is already registered, or
    ///   this slave's shutdown has already fired (the master is closing).
    ///   Nothing is started and the streams are dropped.
    ///
    /// # Example
    /// ```ignore
    /// let slave = Slave::new(info, shutdown.child_token(), &timing);
    /// if pool.add(slave, load_stream, task_stream, events_tx.clone()).await {
    ///     info!("admitted");
    /// }
    /// ```
    pub async fn add(
        &self,
        slave: Arc<Slave>,
        load_stream: TcpStream,
        task_stream: TcpStream,
        events: mpsc::UnboundedSender<SlaveEvent>,
    ) -> bool {
        let mut slaves = self.slaves.write().await;
        if !Self::admissible(&slaves, &slave) {
            return false;
        }
        slave.start(load_stream, task_stream, events);
        slaves.push(slave);
        true
    }

    /// Register a slave without touching its loops. Same refusals as
    /// [`SlavePool::add`].
    pub async fn insert(&self, slave: Arc<Slave>) -> bool {
        let mut slaves = self.slaves.write().await;
        if !Self::admissible(&slaves, &slave) {
            return false;
        }
        slaves.push(slave);
        true
    }

    fn admissible(slaves: &[Arc<Slave>], slave: &Slave) -> bool {
        if slave.is_closing() {
            debug!("Slave {} is already closing, not registering", slave.key());
            return false;
        }
        if slaves.iter().any(|s| s.key() == slave.key()) {
            debug!("Slave {} already registered, ignoring", slave.key());
            return false;
        }
        true
    }

    pub async fn exists(&self, ip: IpAddr, id: SlaveId) -> bool {
        let key = SlaveKey { ip, id };
        self.slaves.read().await.iter().any(|s| s.key() == key)
    }

    pub async fn get(&self, key: SlaveKey) -> Option<Arc<Slave>> {
        self.slaves
            .read()
            .await
            .iter()
            .find(|s| s.key() == key)
            .cloned()
    }

    /// Copy of the current members, in admission order.
    ///
    /// Placement policies work on this copy so the pool lock is never held
    /// while a policy runs.
    ///
    /// # Example
    /// ```ignore
    /// let snapshot = pool.snapshot().await;
    /// let slave = balancer.select(&snapshot, &task)?;
    /// ```
    pub async fn snapshot(&self) -> Vec<Arc<Slave>> {
        self.slaves.read().await.clone()
    }

    pub async fn views(&self) -> Vec<SlaveView> {
        self.slaves.read().await.iter().map(|s| s.view()).collect()
    }

    pub async fn len(&self) -> usize {
        self.slaves.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slaves.read().await.is_empty()
    }

    /// Remove every slave at `ip` and signal its shutdown.
    ///
    /// # Arguments
    /// - `ip`: Address of the host to drop; every slave id on it goes
    ///
    /// # Returns
    /// Whether anything was removed. Removed slaves hand their tasks to
    /// nobody; use [`SlavePool::gc`] for failure recovery.
    pub async fn remove(&self, ip: IpAddr) -> bool {
        let removed: Vec<Arc<Slave>> = {
            let mut slaves = self.slaves.write().await;
            let (removed, kept) = std::mem::take(&mut *slaves)
                .into_iter()
                .partition(|s| s.ip() == ip);
            *slaves = kept;
            removed
        };

        for slave in &removed {
            slave.shutdown();
        }
        !removed.is_empty()
    }

    /// Remove and return every slave whose shutdown has fired and whose loops
    /// have all exited.
    ///
    /// The live set is rebuilt from a filtered copy, so each dead slave is
    /// returned by exactly one call.
    ///
    /// # Returns
    /// The reclaimed slaves, still holding their undertaken tasks. The caller
    /// takes those with [`Slave::reclaim`] and places them again.
    ///
    /// # Example
    /// ```ignore
    /// for slave in pool.gc().await {
    ///     for task_id in slave.reclaim() {
    ///         resubmit(task_id).await;
    ///     }
    /// }
    /// ```
    pub async fn gc(&self) -> Vec<Arc<Slave>> {
        let mut slaves = self.slaves.write().await;
        let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut *slaves)
            .into_iter()
            .partition(|s| s.is_reclaimable());
        *slaves = live;

        for slave in &dead {
            info!("🗑️  Reclaimed slave {}", slave.key());
        }
        dead
    }

    /// Signal every slave and block until all their loops have exited.
    pub async fn close_all(&self) {
        let slaves = self.snapshot().await;
        for slave in &slaves {
            slave.shutdown();
        }
        for slave in &slaves {
            slave.wait_closed().await;
        }
        info!("All {} slave(s) closed", slaves.len());
    }
}

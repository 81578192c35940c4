//! # Master Coordinator
//!
//! Owns the slave pool, the task table, the active placement policy, the
//! discovery listener, and the reclamation loop.
//!
//! ## Assignment
//!
//! ```text
//! assign_new_task(payload, load)
//!   └─ create Pending task
//!   └─ select slave from a pool snapshot ──fail──▶ wait backoff, select again ──fail──▶ Err(Placement)
//!   └─ slave.undertake(id), task → Assigned
//!   └─ TaskRequest onto the slave's send queue
//! ```
//!
//! ## Reclamation
//!
//! Every `gc_interval` the pool drops slaves whose loops have all exited. Each
//! task such a slave held is either deleted (its completion signal already
//! fired) or reset to `Pending` with load 0 and placed again. This is the only
//! failure recovery; individual tasks never time out.

use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::common::config::MasterConfig;
use crate::common::messages::{SlaveId, TaskId, TaskRequest, TaskStatus, TaskStatusRequest};
use crate::common::net::NetworkAddress;
use crate::master::api;
use crate::master::balancer::{Balancer, PolicyKind};
use crate::master::discovery;
use crate::master::error::{MasterError, MasterResult, PlacementError};
use crate::master::pool::SlavePool;
use crate::master::slave::{Slave, SlaveEvent, SlaveInfo, SlaveKey, SlaveView};
use crate::master::task::{Task, TaskTable, TaskView};

/// Load weight given to an orphaned task when it is placed again.
pub const RESUBMIT_LOAD: u64 = 0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Master {
    config: MasterConfig,
    address: NetworkAddress,
    pool: Arc<SlavePool>,
    tasks: Arc<TaskTable>,
    balancer: Box<dyn Balancer>,

    events_tx: mpsc::UnboundedSender<SlaveEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SlaveEvent>>>,

    /// Slaves whose TCP channels are being dialed
    admitting: Mutex<HashSet<SlaveKey>>,
    /// Admitted slaves that have not sent a `ConnectionAck` yet
    unacked: Mutex<HashSet<SlaveKey>>,
    discovery_addr: Mutex<Option<SocketAddr>>,

    shutdown: CancellationToken,
    background: TaskTracker,
}

impl Master {
    /// Build a master using the policy named in the configuration.
    ///
    /// Fails when no local network address can be determined.
    pub fn new(config: MasterConfig) -> MasterResult<Arc<Self>> {
        let policy = config.master.policy;
        Self::with_policy(config, policy)
    }

    pub fn with_policy(config: MasterConfig, policy: PolicyKind) -> MasterResult<Arc<Self>> {
        let address = NetworkAddress::resolve(config.master.advertise_address, config.master.netmask)
            .map_err(MasterError::Address)?;
        let balancer = policy.build(&config.placement);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            "🧭 Master at {} (broadcast {}) using {} placement",
            address.ip, address.broadcast, policy
        );

        Ok(Arc::new(Self {
            config,
            address,
            pool: Arc::new(SlavePool::new()),
            tasks: Arc::new(TaskTable::new()),
            balancer,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            admitting: Mutex::new(HashSet::new()),
            unacked: Mutex::new(HashSet::new()),
            discovery_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
            background: TaskTracker::new(),
        }))
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn address(&self) -> NetworkAddress {
        self.address
    }

    pub fn policy(&self) -> PolicyKind {
        self.balancer.kind()
    }

    pub fn pool(&self) -> &Arc<SlavePool> {
        &self.pool
    }

    pub fn tasks(&self) -> &Arc<TaskTable> {
        &self.tasks
    }

    /// UDP address the discovery listener is bound to, once started.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        *lock(&self.discovery_addr)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn background(&self) -> &TaskTracker {
        &self.background
    }

    pub async fn slave_exists(&self, ip: IpAddr, id: SlaveId) -> bool {
        self.pool.exists(ip, id).await
    }

    pub async fn slave_views(&self) -> Vec<SlaveView> {
        self.pool.views().await
    }

    pub fn unacked_slaves(&self) -> Vec<SlaveKey> {
        lock(&self.unacked).iter().copied().collect()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Bind the discovery socket and start the background loops: discovery,
    /// reclamation, slave event dispatch and, if configured, the HTTP API.
    ///
    /// Returns the bound discovery address.
    pub async fn start(self: &Arc<Self>) -> MasterResult<SocketAddr> {
        let bind = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.master.discovery_port,
        );
        let socket = UdpSocket::bind(bind).await?;
        socket.set_broadcast(true)?;
        let local = socket.local_addr()?;
        *lock(&self.discovery_addr) = Some(local);
        info!("📡 Discovery listening on {}", local);

        self.background
            .spawn(discovery::serve(Arc::clone(self), socket));
        self.background.spawn(Arc::clone(self).reclamation_loop());

        match lock(&self.events_rx).take() {
            Some(events) => {
                self.background
                    .spawn(Arc::clone(self).dispatch_events(events));
            }
            None => warn!("⚠️  Slave event dispatcher already running"),
        }

        if let Some(http) = self.config.master.http_address {
            let listener = tokio::net::TcpListener::bind(http).await?;
            info!("🌐 Task API listening on {}", listener.local_addr()?);
            self.background.spawn(api::serve(
                Arc::clone(self),
                listener,
                self.shutdown.clone(),
            ));
        }

        info!("🚀 Master running");
        Ok(local)
    }

    /// Start, then block until [`Master::close`] is called from elsewhere.
    pub async fn run(self: &Arc<Self>) -> MasterResult<()> {
        self.start().await?;
        self.shutdown.cancelled().await;
        self.close().await;
        Ok(())
    }

    /// Graceful shutdown of the master and every slave.
    ///
    /// Discovery, the API, reclamation and any admission still dialing are
    /// drained first. Only then is the pool closed, so no slave can join after
    /// the final snapshot. Safe to call more than once.
    ///
    /// # Example
    /// ```ignore
    /// let master = Master::new(config)?;
    /// master.start().await?;
    /// tokio::signal::ctrl_c().await?;
    /// master.close().await;
    /// ```
    pub async fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!("🛑 Closing master gracefully...");
        }
        self.shutdown.cancel();
        self.background.close();
        self.background.wait().await;
        self.pool.close_all().await;
        info!("Master closed");
    }

    // ========================================================================
    // ADMISSION
    // ========================================================================

    /// Dial the slave's load and task channels and add it to the pool.
    ///
    /// # Arguments
    /// - `info`: Identity and TCP ports from the slave's `ConnectionRequest`
    ///
    /// # Returns
    /// - `Ok(true)`: The slave is in the pool and awaiting its `ConnectionAck`
    /// - `Ok(false)`: Already registered, being admitted concurrently, or the
    ///   master is shutting down
    /// - `Err`: One of the channels could not be dialed in time
    pub async fn admit(&self, info: SlaveInfo) -> MasterResult<bool> {
        let key = info.key();
        if self.is_shutting_down() || self.pool.exists(key.ip, key.id).await {
            return Ok(false);
        }
        if !self.reserve(key) {
            return Ok(false);
        }
        self.admit_reserved(info).await
    }

    /// Claim `key` for admission. Fails if another admission holds it.
    pub(crate) fn reserve(&self, key: SlaveKey) -> bool {
        lock(&self.admitting).insert(key)
    }

    /// Admit a slave previously claimed with [`Master::reserve`].
    pub(crate) async fn admit_reserved(&self, info: SlaveInfo) -> MasterResult<bool> {
        let key = info.key();
        let result = self.connect_slave(info).await;
        lock(&self.admitting).remove(&key);
        result
    }

    async fn connect_slave(&self, info: SlaveInfo) -> MasterResult<bool> {
        let key = info.key();
        if self.is_shutting_down() {
            return Ok(false);
        }
        let timeout = self.config.timing.connect_timeout();
        let load_stream = connect(SocketAddr::new(info.ip, info.load_port), timeout).await?;
        let task_stream = connect(SocketAddr::new(info.ip, info.task_port), timeout).await?;

        let slave = Slave::new(info, self.shutdown.child_token(), &self.config.timing);
        let added = self
            .pool
            .add(slave, load_stream, task_stream, self.events_tx.clone())
            .await;
        if added {
            lock(&self.unacked).insert(key);
            info!("✅ Slave {} admitted", key);
        }
        Ok(added)
    }

    /// Record a slave's `ConnectionAck`.
    pub fn acknowledge(&self, key: SlaveKey) -> bool {
        let acked = lock(&self.unacked).remove(&key);
        if acked {
            debug!("Slave {} acknowledged admission", key);
        }
        acked
    }

    // ========================================================================
    // TASKS
    // ========================================================================

    /// Create a task and place it on a slave.
    ///
    /// If placement fails the master waits `assign_retry_backoff` and tries
    /// exactly once more. A slave reclaimed while it was taking the task
    /// counts as a failed attempt. When the retry fails too the task stays
    /// `Pending` and the caller decides when to try again; nothing is
    /// requeued automatically.
    ///
    /// # Arguments
    /// - `payload`: Opaque bytes handed to the worker's executor
    /// - `load`: Weight of the task, used by the `least_difference` policy
    ///
    /// # Returns
    /// - `Ok(id)`: The task is `Assigned` and its `TaskRequest` is queued
    /// - `Err(MasterError::Placement { task_id, .. })`: No slave could take
    ///   it; `task_id` is still in the table as `Pending`
    ///
    /// # Example
    /// ```ignore
    /// match master.assign_new_task(b"work".to_vec(), 5).await {
    ///     Ok(id) => {
    ///         let task = master.wait_for_task(id).await?;
    ///         println!("task #{} finished: {:?}", id, task.status);
    ///     }
    ///     Err(MasterError::Placement { task_id, .. }) => {
    ///         tokio::time::sleep(Duration::from_secs(1)).await;
    ///         master.retry_task(task_id).await?;
    ///     }
    ///     Err(e) => return Err(e),
    /// }
    /// ```
    pub async fn assign_new_task(&self, payload: Vec<u8>, load: u64) -> MasterResult<TaskId> {
        let task = self.tasks.create(payload, load).await;
        debug!("📝 Created task #{} (load {})", task.id, load);
        self.dispatch(&task).await?;
        Ok(task.id)
    }

    /// Place a `Pending` task again, with the same single retry as
    /// [`Master::assign_new_task`].
    ///
    /// # Returns
    /// - `Ok(key)`: The slave the task now runs on
    /// - `Err(MasterError::TaskNotFound)`: No task with this id
    /// - `Err(MasterError::TaskNotPending)`: The task is assigned or finished
    /// - `Err(MasterError::Placement { .. })`: Still no eligible slave
    pub async fn retry_task(&self, id: TaskId) -> MasterResult<SlaveKey> {
        let task = self.tasks.get(id).await.ok_or(MasterError::TaskNotFound(id))?;
        if task.status != TaskStatus::Pending {
            return Err(MasterError::TaskNotPending(id, task.status));
        }
        self.dispatch(&task).await
    }

    async fn dispatch(&self, task: &Task) -> MasterResult<SlaveKey> {
        let slave = match self.attempt(task).await? {
            Ok(slave) => slave,
            Err(first) => {
                debug!(
                    "Placement of task #{} failed ({}), retrying in {:?}",
                    task.id,
                    first,
                    self.config.timing.assign_retry_backoff()
                );
                tokio::time::sleep(self.config.timing.assign_retry_backoff()).await;
                self.attempt(task).await?.map_err(|source| {
                    warn!("⚠️  Task #{} left pending: {}", task.id, source);
                    MasterError::Placement {
                        task_id: task.id,
                        source,
                    }
                })?
            }
        };

        let key = slave.key();
        info!(
            "📌 Task #{} assigned to slave {} (load {:.2})",
            task.id,
            key,
            slave.current_load()
        );

        let request = TaskRequest {
            task_id: task.id,
            payload: task.payload.clone(),
            load: task.load,
        };
        if let Err(e) = slave.enqueue(request.into()).await {
            // Still undertaken by the slave, so reclamation will pick it up.
            warn!("⚠️  Task #{} not sent to {}: {}", task.id, key, e);
        }
        Ok(key)
    }

    /// One placement attempt: select a slave, have it undertake the task and
    /// mark the task `Assigned`.
    ///
    /// The outer error means the task itself can no longer be placed (gone or
    /// no longer `Pending`). The inner error is a failed attempt that leaves
    /// the task `Pending`, including a slave reclaimed between undertaking the
    /// task and the assignment being recorded.
    async fn attempt(&self, task: &Task) -> MasterResult<Result<Arc<Slave>, PlacementError>> {
        match self.select(task).await {
            Ok(slave) => self.claim(task, slave).await,
            Err(e) => Ok(Err(e)),
        }
    }

    /// Record the assignment of a task `slave` has already undertaken.
    async fn claim(
        &self,
        task: &Task,
        slave: Arc<Slave>,
    ) -> MasterResult<Result<Arc<Slave>, PlacementError>> {
        let key = slave.key();
        if !self.tasks.mark_assigned(task.id, key).await {
            slave.release(task.id);
            return Err(match self.tasks.get(task.id).await {
                Some(current) => MasterError::TaskNotPending(task.id, current.status),
                None => MasterError::TaskNotFound(task.id),
            });
        }

        if !slave.holds(task.id) {
            self.tasks.unassign(task.id, key).await;
            debug!("Slave {} reclaimed while taking task #{}", key, task.id);
            return Ok(Err(PlacementError::NoEligiblePeer));
        }
        Ok(Ok(slave))
    }

    async fn select(&self, task: &Task) -> Result<Arc<Slave>, PlacementError> {
        let snapshot = self.pool.snapshot().await;
        let slave = self.balancer.select(&snapshot, task)?;
        if slave.undertake(task.id) {
            Ok(slave)
        } else {
            Err(PlacementError::NoEligiblePeer)
        }
    }

    /// Ask the assignee of a task for its status. The answer arrives as a
    /// slave event.
    pub async fn query_task_status(&self, id: TaskId) -> MasterResult<()> {
        let task = self.tasks.get(id).await.ok_or(MasterError::TaskNotFound(id))?;
        let key = task.assigned_to.ok_or(MasterError::TaskUnassigned(id))?;
        let slave = self
            .pool
            .get(key)
            .await
            .ok_or(MasterError::TaskUnassigned(id))?;
        slave.enqueue(TaskStatusRequest { task_id: id }.into()).await
    }

    pub async fn task(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(id).await
    }

    pub async fn task_view(&self, id: TaskId) -> Option<TaskView> {
        self.tasks.get(id).await.map(|t| t.view())
    }

    /// Wait until the task completes or fails and return it.
    pub async fn wait_for_task(&self, id: TaskId) -> MasterResult<Task> {
        let task = self.tasks.get(id).await.ok_or(MasterError::TaskNotFound(id))?;
        task.completion().cancelled().await;
        self.tasks.get(id).await.ok_or(MasterError::TaskNotFound(id))
    }

    /// Remove a finished task from the table and return it.
    pub async fn drain_task(&self, id: TaskId) -> Option<Task> {
        self.tasks.drain(id).await
    }

    // ========================================================================
    // RECLAMATION
    // ========================================================================

    /// One reclamation pass.
    ///
    /// Every slave the pool's GC returns leaves the unacknowledged set. Its
    /// finished tasks are deleted and its unfinished ones are reset to
    /// `Pending` with [`RESUBMIT_LOAD`] and placed again.
    ///
    /// # Returns
    /// How many slaves were reclaimed.
    pub async fn reclaim(&self) -> usize {
        let removed = self.pool.gc().await;

        for slave in &removed {
            let key = slave.key();
            if lock(&self.unacked).remove(&key) {
                debug!("Slave {} reclaimed before acknowledging admission", key);
            }
            for task_id in slave.reclaim() {
                let Some(task) = self.tasks.get(task_id).await else {
                    continue;
                };

                if task.is_done() {
                    self.tasks.remove(task_id).await;
                    debug!("Dropped finished task #{} of reclaimed slave {}", task_id, key);
                    continue;
                }
                if task.assigned_to.is_some() && task.assigned_to != Some(key) {
                    continue;
                }

                let Some(orphan) = self.tasks.reset(task_id, RESUBMIT_LOAD).await else {
                    continue;
                };
                warn!("♻️  Resubmitting task #{} orphaned by slave {}", task_id, key);
                if let Err(e) = self.dispatch(&orphan).await {
                    warn!("⚠️  Could not resubmit task #{}: {}", task_id, e);
                }
            }
        }

        removed.len()
    }

    async fn reclamation_loop(self: Arc<Self>) {
        info!("Garbage collection routine started");
        let mut ticker = tokio::time::interval(self.config.timing.gc_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.reclaim().await;
        }
        debug!("Garbage collection routine stopped");
    }

    // ========================================================================
    // SLAVE EVENTS
    // ========================================================================

    async fn dispatch_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SlaveEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let master = Arc::clone(&self);
            self.background.spawn(async move {
                master.handle_event(event).await;
            });
        }
    }

    /// Apply one piece of task channel traffic to the task table.
    pub async fn handle_event(&self, event: SlaveEvent) {
        match event {
            SlaveEvent::TaskReply {
                slave,
                task_id,
                accept: true,
            } => {
                debug!("Slave {} accepted task #{}", slave, task_id);
            }
            SlaveEvent::TaskReply {
                slave,
                task_id,
                accept: false,
            } => {
                if self.tasks.unassign(task_id, slave).await {
                    self.release(slave, task_id).await;
                    warn!("⚠️  Slave {} rejected task #{}, task is pending", slave, task_id);
                }
            }
            SlaveEvent::TaskResult {
                slave,
                task_id,
                result,
            } => {
                self.release(slave, task_id).await;
                match self.tasks.complete(task_id, result).await {
                    Some(_) => info!("✅ Task #{} completed by slave {}", task_id, slave),
                    None => debug!("Ignoring result for unknown or finished task #{}", task_id),
                }
            }
            SlaveEvent::TaskStatus {
                slave,
                task_id,
                status,
            } => match status {
                TaskStatus::Failed => {
                    self.release(slave, task_id).await;
                    if self.tasks.fail(task_id).await.is_some() {
                        error!("❌ Task #{} failed on slave {}", task_id, slave);
                    }
                }
                TaskStatus::Completed => {
                    self.release(slave, task_id).await;
                    if self.tasks.complete(task_id, Vec::new()).await.is_some() {
                        info!("✅ Task #{} reported completed by slave {}", task_id, slave);
                    }
                }
                TaskStatus::Pending | TaskStatus::Assigned => {
                    debug!("Slave {} reports task #{} as {:?}", slave, task_id, status);
                }
            },
        }
    }

    async fn release(&self, key: SlaveKey, task_id: TaskId) {
        if let Some(slave) = self.pool.get(key).await {
            slave.release(task_id);
        }
    }
}

async fn connect(addr: SocketAddr, timeout: Duration) -> MasterResult<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(MasterError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connecting to {} timed out", addr),
        ))),
    }
}

//! # Slave Record
//!
//! Master-side state for one registered slave: its two persistent TCP
//! channels, the outbound task queue, the last accepted load sample, the set of
//! tasks it has undertaken, and its lifecycle.
//!
//! ## Loops
//!
//! [`Slave::start`] attaches four loops, all tracked by the slave's own
//! [`TaskTracker`] and all stopped by its [`CancellationToken`]:
//!
//! ```text
//!            load channel                        task channel
//!   ┌──────────────────────────┐      ┌──────────────────────────────┐
//!   │ probe sender  ──▶ slave  │      │ send queue ──▶ drainer ──▶   │
//!   │ load receiver ◀── slave  │      │ response receiver ◀── slave  │
//!   └──────────────────────────┘      └──────────────┬───────────────┘
//!                                                    ▼
//!                                          SlaveEvent channel ──▶ master
//! ```
//!
//! End-of-stream on either channel cancels the token. Once every loop has
//! exited the record is reclaimable by the pool.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::common::config::TimingConfig;
use crate::common::connection::{self, FrameReader, FrameWriter};
use crate::common::messages::{
    ConnectionRequest, LoadRequest, LoadResponse, Packet, SlaveId, TaskId, TaskRequestResponse,
    TaskResultResponse, TaskStatus, TaskStatusResponse,
};
use crate::master::error::{MasterError, MasterResult};

/// Identity of a slave: the `(ip, id)` pair it announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlaveKey {
    pub ip: IpAddr,
    pub id: SlaveId,
}

impl fmt::Display for SlaveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.ip, self.id)
    }
}

/// Addressing information needed to admit a slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveInfo {
    pub ip: IpAddr,
    pub id: SlaveId,
    pub load_port: u16,
    pub task_port: u16,
}

impl SlaveInfo {
    pub fn key(&self) -> SlaveKey {
        SlaveKey {
            ip: self.ip,
            id: self.id,
        }
    }
}

impl From<&ConnectionRequest> for SlaveInfo {
    fn from(req: &ConnectionRequest) -> Self {
        Self {
            ip: req.source,
            id: req.id,
            load_port: req.load_port,
            task_port: req.task_port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Open,
    Serving,
    Closing,
    Closed,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Open,
            1 => Lifecycle::Serving,
            2 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }
}

/// Task channel traffic forwarded to the master.
#[derive(Debug, Clone, PartialEq)]
pub enum SlaveEvent {
    TaskReply {
        slave: SlaveKey,
        task_id: TaskId,
        accept: bool,
    },
    TaskResult {
        slave: SlaveKey,
        task_id: TaskId,
        result: Vec<u8>,
    },
    TaskStatus {
        slave: SlaveKey,
        task_id: TaskId,
        status: TaskStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LoadSample {
    load: f64,
    timestamp: u64,
}

#[derive(Debug, Default)]
struct Undertaken {
    tasks: BTreeSet<TaskId>,
    reclaimed: bool,
}

/// Serializable snapshot of a slave, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct SlaveView {
    pub ip: IpAddr,
    pub id: SlaveId,
    pub load: f64,
    pub load_timestamp: u64,
    pub tasks: Vec<TaskId>,
    pub state: Lifecycle,
}

pub struct Slave {
    info: SlaveInfo,
    load: Mutex<LoadSample>,
    undertaken: Mutex<Undertaken>,
    send_tx: mpsc::Sender<Packet>,
    send_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    state: AtomicU8,
    shutdown: CancellationToken,
    loops: TaskTracker,
    probe_interval: Duration,
    pacing: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Slave {
    /// Create a record in the `Open` state. `shutdown` is usually a child of the
    /// master's token so that master shutdown fans out to every slave.
    pub fn new(info: SlaveInfo, shutdown: CancellationToken, timing: &TimingConfig) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(timing.send_queue_capacity.max(1));
        Arc::new(Self {
            info,
            load: Mutex::new(LoadSample {
                load: 0.0,
                timestamp: 0,
            }),
            undertaken: Mutex::new(Undertaken::default()),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            state: AtomicU8::new(Lifecycle::Open as u8),
            shutdown,
            loops: TaskTracker::new(),
            probe_interval: timing.load_probe_interval(),
            pacing: timing.task_pacing(),
        })
    }

    pub fn key(&self) -> SlaveKey {
        self.info.key()
    }

    pub fn ip(&self) -> IpAddr {
        self.info.ip
    }

    pub fn id(&self) -> SlaveId {
        self.info.id
    }

    pub fn info(&self) -> &SlaveInfo {
        &self.info
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    fn advance(&self, to: Lifecycle) {
        // Lifecycle only moves forward.
        self.state.fetch_max(to as u8, Ordering::AcqRel);
    }

    // ========================================================================
    // LOAD
    // ========================================================================

    /// Load of the most recent accepted sample.
    pub fn current_load(&self) -> f64 {
        lock(&self.load).load
    }

    pub fn load_timestamp(&self) -> u64 {
        lock(&self.load).timestamp
    }

    /// Apply a load sample unless it is older than the last accepted one.
    ///
    /// Returns whether the sample was applied.
    pub fn record_load(&self, load: f64, timestamp: u64) -> bool {
        let mut sample = lock(&self.load);
        if timestamp < sample.timestamp {
            return false;
        }
        *sample = LoadSample { load, timestamp };
        true
    }

    // ========================================================================
    // UNDERTAKEN TASKS
    // ========================================================================

    /// Record that this slave holds `task_id`.
    ///
    /// Refused once the slave has been reclaimed, so a placement racing with
    /// reclamation can never strand a task on a dead record.
    pub fn undertake(&self, task_id: TaskId) -> bool {
        let mut undertaken = lock(&self.undertaken);
        if undertaken.reclaimed {
            return false;
        }
        undertaken.tasks.insert(task_id);
        true
    }

    pub fn release(&self, task_id: TaskId) -> bool {
        lock(&self.undertaken).tasks.remove(&task_id)
    }

    pub fn holds(&self, task_id: TaskId) -> bool {
        lock(&self.undertaken).tasks.contains(&task_id)
    }

    pub fn undertaken_tasks(&self) -> Vec<TaskId> {
        lock(&self.undertaken).tasks.iter().copied().collect()
    }

    /// Take every undertaken task and refuse new ones. Only the first call
    /// returns tasks.
    pub fn reclaim(&self) -> Vec<TaskId> {
        let mut undertaken = lock(&self.undertaken);
        undertaken.reclaimed = true;
        std::mem::take(&mut undertaken.tasks).into_iter().collect()
    }

    // ========================================================================
    // SEND QUEUE
    // ========================================================================

    /// Queue a packet for the task channel.
    ///
    /// Waits while the queue is full; fails once the slave is closing.
    pub async fn enqueue(&self, packet: Packet) -> MasterResult<()> {
        if self.is_closing() {
            return Err(MasterError::SlaveClosed(self.key()));
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(MasterError::SlaveClosed(self.key())),
            sent = self.send_tx.send(packet) => sent.map_err(|_| MasterError::SlaveClosed(self.key())),
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    pub fn is_closing(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Signal every loop to stop. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("🔌 Slave {} shutting down", self.key());
        }
        self.advance(Lifecycle::Closing);
        self.shutdown.cancel();
        self.loops.close();
    }

    /// True once shutdown has fired and every loop has exited.
    pub fn is_reclaimable(&self) -> bool {
        let done = self.shutdown.is_cancelled() && self.loops.is_closed() && self.loops.is_empty();
        if done {
            self.advance(Lifecycle::Closed);
        }
        done
    }

    /// Wait until every loop has exited. Returns immediately for a slave
    /// whose loops are already gone.
    pub async fn wait_closed(&self) {
        self.loops.wait().await;
        if self.shutdown.is_cancelled() {
            self.advance(Lifecycle::Closed);
        }
    }

    pub fn view(&self) -> SlaveView {
        let sample = *lock(&self.load);
        SlaveView {
            ip: self.info.ip,
            id: self.info.id,
            load: sample.load,
            load_timestamp: sample.timestamp,
            tasks: self.undertaken_tasks(),
            state: self.lifecycle(),
        }
    }

    /// Attach the four channel loops.
    ///
    /// Calling this more than once has no effect.
    pub fn start(
        self: &Arc<Self>,
        load_stream: TcpStream,
        task_stream: TcpStream,
        events: mpsc::UnboundedSender<SlaveEvent>,
    ) {
        let (load_reader, load_writer) = connection::split(load_stream);
        let (task_reader, task_writer) = connection::split(task_stream);
        self.start_with(load_reader, load_writer, task_reader, task_writer, events);
    }

    pub(crate) fn start_with<LR, LW, TR, TW>(
        self: &Arc<Self>,
        load_reader: FrameReader<LR>,
        load_writer: FrameWriter<LW>,
        task_reader: FrameReader<TR>,
        task_writer: FrameWriter<TW>,
        events: mpsc::UnboundedSender<SlaveEvent>,
    ) where
        LR: AsyncRead + Unpin + Send + 'static,
        LW: AsyncWrite + Unpin + Send + 'static,
        TR: AsyncRead + Unpin + Send + 'static,
        TW: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(send_rx) = lock(&self.send_rx).take() else {
            warn!("⚠️  Slave {} already started", self.key());
            return;
        };

        self.loops.spawn(Arc::clone(self).probe_load(load_writer));
        self.loops.spawn(Arc::clone(self).receive_load(load_reader));
        self.loops.spawn(Arc::clone(self).drain_tasks(task_writer, send_rx));
        self.loops.spawn(Arc::clone(self).receive_tasks(task_reader, events));
        self.loops.close();
        self.advance(Lifecycle::Serving);

        info!(
            "🤝 Slave {} serving (load port {}, task port {})",
            self.key(),
            self.info.load_port,
            self.info.task_port
        );
    }

    /// Write a `LoadRequest` every probe interval.
    async fn probe_load<W: AsyncWrite + Unpin>(self: Arc<Self>, mut writer: FrameWriter<W>) {
        let probe = Packet::from(LoadRequest {});
        let mut ticker = tokio::time::interval(self.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let written = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                written = writer.write_packet(&probe) => written,
            };
            if let Err(e) = written {
                if e.is_closed() {
                    warn!("⚠️  Load channel to {} closed: {}", self.key(), e);
                    self.shutdown();
                    break;
                }
                warn!("⚠️  Failed to probe load of {}: {}", self.key(), e);
            }
        }

        let _ = writer.shutdown().await;
        debug!("Load prober for {} stopped", self.key());
    }

    /// Read load samples and apply them last-writer-wins by timestamp.
    async fn receive_load<R: AsyncRead + Unpin>(self: Arc<Self>, mut reader: FrameReader<R>) {
        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = reader.read_packet() => read,
            };

            match read {
                Ok(Packet::LoadResponse(LoadResponse { load, timestamp })) => {
                    if self.record_load(load, timestamp) {
                        debug!("📊 Slave {} load {:.2} @ {}", self.key(), load, timestamp);
                    } else {
                        debug!("Discarded stale load sample from {} @ {}", self.key(), timestamp);
                    }
                }
                Ok(other) => warn!(
                    "⚠️  Unexpected {} packet on load channel of {}",
                    other.kind(),
                    self.key()
                ),
                Err(e) if e.is_closed() => {
                    info!("🔌 Load channel of {} closed: {}", self.key(), e);
                    self.shutdown();
                    break;
                }
                Err(e) => warn!("⚠️  Dropped packet on load channel of {}: {}", self.key(), e),
            }
        }
        debug!("Load receiver for {} stopped", self.key());
    }

    /// Forward queued packets to the task channel, one per pacing interval.
    async fn drain_tasks<W: AsyncWrite + Unpin>(
        self: Arc<Self>,
        mut writer: FrameWriter<W>,
        mut queue: mpsc::Receiver<Packet>,
    ) {
        loop {
            let packet = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = queue.recv() => match next {
                    Some(packet) => packet,
                    None => break,
                },
            };

            let written = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                written = writer.write_packet(&packet) => written,
            };
            if let Err(e) = written {
                if e.is_closed() {
                    warn!("⚠️  Task channel to {} closed: {}", self.key(), e);
                    self.shutdown();
                    break;
                }
                warn!(
                    "⚠️  Failed to send {} packet to {}: {}",
                    packet.kind(),
                    self.key(),
                    e
                );
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.pacing) => {}
            }
        }

        let _ = writer.shutdown().await;
        debug!("Task drainer for {} stopped", self.key());
    }

    /// Decode task channel traffic and hand it to the master without waiting
    /// on how it is handled.
    async fn receive_tasks<R: AsyncRead + Unpin>(
        self: Arc<Self>,
        mut reader: FrameReader<R>,
        events: mpsc::UnboundedSender<SlaveEvent>,
    ) {
        let slave = self.key();
        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = reader.read_packet() => read,
            };

            let event = match read {
                Ok(Packet::TaskRequestResponse(TaskRequestResponse { task_id, accept })) => {
                    SlaveEvent::TaskReply {
                        slave,
                        task_id,
                        accept,
                    }
                }
                Ok(Packet::TaskResultResponse(TaskResultResponse { task_id, result })) => {
                    SlaveEvent::TaskResult {
                        slave,
                        task_id,
                        result,
                    }
                }
                Ok(Packet::TaskStatusResponse(TaskStatusResponse { task_id, status })) => {
                    SlaveEvent::TaskStatus {
                        slave,
                        task_id,
                        status,
                    }
                }
                Ok(other) => {
                    warn!(
                        "⚠️  Unexpected {} packet on task channel of {}",
                        other.kind(),
                        slave
                    );
                    continue;
                }
                Err(e) if e.is_closed() => {
                    info!("🔌 Task channel of {} closed: {}", slave, e);
                    self.shutdown();
                    break;
                }
                Err(e) => {
                    warn!("⚠️  Dropped packet on task channel of {}: {}", slave, e);
                    continue;
                }
            };

            if events.send(event).is_err() {
                debug!("Master stopped listening to {}", slave);
            }
        }
        debug!("Task receiver for {} stopped", slave);
    }
}

impl fmt::Debug for Slave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slave")
            .field("key", &self.key())
            .field("state", &self.lifecycle())
            .field("load", &self.current_load())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::messages::TaskRequest;
    use std::net::Ipv4Addr;

    pub(crate) fn fast_timing() -> TimingConfig {
        TimingConfig {
            load_probe_interval_ms: 10,
            task_pacing_ms: 1,
            gc_interval_ms: 20,
            assign_retry_backoff_ms: 10,
            connect_timeout_ms: 500,
            send_queue_capacity: 8,
        }
    }

    pub(crate) fn test_slave(last_octet: u8, id: SlaveId) -> Arc<Slave> {
        Slave::new(
            SlaveInfo {
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)),
                id,
                load_port: 0,
                task_port: 0,
            },
            CancellationToken::new(),
            &fast_timing(),
        )
    }

    #[test]
    fn out_of_order_samples_keep_the_newest() {
        let slave = test_slave(1, 1);
        let samples = [(5.0, 30), (9.0, 10), (7.0, 50), (1.0, 40), (3.0, 20)];
        let mut newest = (0.0, 0);
        for (load, ts) in samples {
            slave.record_load(load, ts);
            if ts >= newest.1 {
                newest = (load, ts);
            }
            assert_eq!(slave.current_load(), newest.0);
            assert_eq!(slave.load_timestamp(), newest.1);
        }
        assert_eq!(slave.current_load(), 7.0);
    }

    #[test]
    fn reclaimed_slave_refuses_tasks() {
        let slave = test_slave(1, 1);
        assert!(slave.undertake(1));
        assert!(slave.undertake(2));
        assert_eq!(slave.reclaim(), vec![1, 2]);
        assert!(slave.reclaim().is_empty());
        assert!(!slave.undertake(3));
        assert!(slave.undertaken_tasks().is_empty());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let slave = test_slave(1, 1);
        assert_eq!(slave.lifecycle(), Lifecycle::Open);
        slave.shutdown();
        slave.shutdown();
        assert_eq!(slave.lifecycle(), Lifecycle::Closing);
        assert!(slave.is_reclaimable());
        assert_eq!(slave.lifecycle(), Lifecycle::Closed);
    }

    #[tokio::test]
    async fn enqueue_fails_after_shutdown() {
        let slave = test_slave(1, 1);
        let packet = Packet::from(TaskRequest {
            task_id: 1,
            payload: vec![],
            load: 0,
        });
        slave.enqueue(packet.clone()).await.unwrap();
        slave.shutdown();
        assert!(matches!(
            slave.enqueue(packet).await,
            Err(MasterError::SlaveClosed(_))
        ));
    }

    #[tokio::test]
    async fn loops_run_until_the_remote_end_closes() {
        let slave = test_slave(2, 1);
        let (load_local, load_remote) = tokio::io::duplex(4096);
        let (task_local, task_remote) = tokio::io::duplex(4096);
        let (load_read, load_write) = tokio::io::split(load_local);
        let (task_read, task_write) = tokio::io::split(task_local);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        slave.start_with(
            FrameReader::new(load_read),
            FrameWriter::new(load_write),
            FrameReader::new(task_read),
            FrameWriter::new(task_write),
            events_tx,
        );
        assert_eq!(slave.lifecycle(), Lifecycle::Serving);

        // Remote side: answer one probe, receive one task, reply with a result.
        let (remote_load_read, remote_load_write) = tokio::io::split(load_remote);
        let mut remote_load_reader = FrameReader::new(remote_load_read);
        let mut remote_load_writer = FrameWriter::new(remote_load_write);
        let probe = remote_load_reader.read_packet().await.unwrap();
        assert_eq!(probe, Packet::from(LoadRequest {}));
        remote_load_writer
            .write_packet(&Packet::from(LoadResponse {
                load: 3.5,
                timestamp: 100,
            }))
            .await
            .unwrap();

        let (remote_task_read, remote_task_write) = tokio::io::split(task_remote);
        let mut remote_task_reader = FrameReader::new(remote_task_read);
        let mut remote_task_writer = FrameWriter::new(remote_task_write);
        slave
            .enqueue(Packet::from(TaskRequest {
                task_id: 9,
                payload: b"job".to_vec(),
                load: 1,
            }))
            .await
            .unwrap();
        let offered = remote_task_reader.read_packet().await.unwrap();
        assert!(matches!(offered, Packet::TaskRequest(TaskRequest { task_id: 9, .. })));

        remote_task_writer
            .write_packet(&Packet::from(TaskResultResponse {
                task_id: 9,
                result: b"ok".to_vec(),
            }))
            .await
            .unwrap();
        let event = events_rx.recv().await.unwrap();
        assert_eq!(
            event,
            SlaveEvent::TaskResult {
                slave: slave.key(),
                task_id: 9,
                result: b"ok".to_vec(),
            }
        );

        // Closing the remote task channel is treated as slave death.
        drop(remote_task_writer);
        drop(remote_task_reader);
        tokio::time::timeout(Duration::from_secs(5), slave.wait_closed())
            .await
            .unwrap();
        assert!(slave.is_closing());
        assert!(slave.is_reclaimable());
        assert_eq!(slave.current_load(), 3.5);
    }
}

//! # Worker Runtime
//!
//! The slave side of the protocol.
//!
//! ```text
//! bind load + task listeners
//!   └─ broadcast ConnectionRequest ──timeout──▶ retry with jitter (bounded)
//!   └─ ConnectionResponse received
//!   └─ accept the master's load channel, then its task channel
//!   └─ send ConnectionAck
//!   └─ serve both channels until the master goes away
//! ```
//!
//! Load probes are answered with a [`WorkerMetrics`] sample. Task offers are
//! accepted unless the worker is at `max_active_tasks`, executed on the
//! blocking pool by a [`TaskExecutor`], and answered with a
//! `TaskResultResponse` on success or a `Failed` status otherwise.

use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::common::config::WorkerInfo;
use crate::common::connection::{self, FrameReader, FrameWriter};
use crate::common::messages::{
    current_timestamp_millis, ConnectionAck, ConnectionRequest, ConnectionResponse, LoadResponse,
    Packet, TaskId, TaskRequest, TaskRequestResponse, TaskResultResponse, TaskStatus,
    TaskStatusRequest, TaskStatusResponse,
};
use crate::common::net::NetworkAddress;
use crate::worker::error::{WorkerError, WorkerResult};
use crate::worker::metrics::WorkerMetrics;

/// Upper bound of the random delay added to each announce timeout.
const ANNOUNCE_JITTER_MS: u64 = 250;

/// Runs the work carried by a task.
///
/// Called on the blocking thread pool, so implementations may do CPU-heavy
/// work synchronously.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, task_id: TaskId, payload: &[u8]) -> Result<Vec<u8>, String>;
}

/// Returns the payload unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

impl TaskExecutor for EchoExecutor {
    fn execute(&self, _task_id: TaskId, payload: &[u8]) -> Result<Vec<u8>, String> {
        Ok(payload.to_vec())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Listeners bound before announcing, so the master can dial in as soon as
/// it answers.
struct Listeners {
    load: TcpListener,
    task: TcpListener,
    reply: UdpSocket,
}

pub struct Worker {
    config: WorkerInfo,
    executor: Arc<dyn TaskExecutor>,
    metrics: WorkerMetrics,
    tasks: Mutex<HashMap<TaskId, TaskStatus>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Worker {
    pub fn new(config: WorkerInfo) -> Arc<Self> {
        Self::with_executor(config, EchoExecutor)
    }

    pub fn with_executor<E: TaskExecutor>(config: WorkerInfo, executor: E) -> Arc<Self> {
        Arc::new(Self {
            config,
            executor: Arc::new(executor),
            metrics: WorkerMetrics::new(),
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Last known status of a task offered to this worker.
    pub fn task_status(&self, task_id: TaskId) -> Option<TaskStatus> {
        lock(&self.tasks).get(&task_id).copied()
    }

    /// Stop serving. `run` returns once both channels are closed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Register with the master and serve its channels until either side
    /// closes them.
    pub async fn run(self: &Arc<Self>) -> WorkerResult<()> {
        let listeners = self.bind().await?;
        let advertised = NetworkAddress::resolve(
            self.config.advertise_address,
            Ipv4Addr::new(255, 255, 255, 0),
        )
        .map_err(WorkerError::Address)?;
        let (response, master) = match self.announce(&listeners, advertised.ip).await {
            Err(_) if self.shutdown.is_cancelled() => return Ok(()),
            announced => announced?,
        };
        info!(
            "🤝 Master at {} accepted worker {} (ack {})",
            response.master, self.config.id, response.ack
        );

        let (load_stream, task_stream) = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            accepted = tokio::time::timeout(
                self.config.announce_timeout() * 2,
                accept_channels(&listeners),
            ) => accepted.map_err(|_| WorkerError::ChannelTimeout)??,
        };

        let ack = Packet::from(ConnectionAck {
            source: advertised.ip,
            id: self.config.id,
        })
        .encode()?;
        let ack_to = SocketAddr::new(master.ip(), response.port);
        if let Err(e) = listeners.reply.send_to(&ack, ack_to).await {
            warn!("⚠️  Could not acknowledge admission to {}: {}", ack_to, e);
        }

        let (load_reader, load_writer) = connection::split(load_stream);
        let (task_reader, task_writer) = connection::split(task_stream);
        self.serve(load_reader, load_writer, task_reader, task_writer)
            .await;
        Ok(())
    }

    async fn bind(&self) -> WorkerResult<Listeners> {
        let ip = self.config.listen_address;
        let load = TcpListener::bind(SocketAddr::new(ip, self.config.load_port)).await?;
        let task = TcpListener::bind(SocketAddr::new(ip, self.config.task_port)).await?;
        let reply = UdpSocket::bind(SocketAddr::new(ip, self.config.reply_port)).await?;
        reply.set_broadcast(true)?;
        Ok(Listeners { load, task, reply })
    }

    /// Broadcast a `ConnectionRequest` until the master answers or the
    /// attempts run out.
    async fn announce(
        &self,
        listeners: &Listeners,
        source: IpAddr,
    ) -> WorkerResult<(ConnectionResponse, SocketAddr)> {
        let request = Packet::from(ConnectionRequest {
            source,
            reply_port: listeners.reply.local_addr()?.port(),
            id: self.config.id,
            load_port: listeners.load.local_addr()?.port(),
            task_port: listeners.task.local_addr()?.port(),
        })
        .encode()?;

        let attempts = self.config.announce_attempts.max(1);
        let mut buf = vec![0u8; 2048];
        for attempt in 1..=attempts {
            debug!(
                "📣 Announcing worker {} to {} (attempt {}/{})",
                self.config.id, self.config.master_address, attempt, attempts
            );
            listeners
                .reply
                .send_to(&request, self.config.master_address)
                .await?;

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=ANNOUNCE_JITTER_MS));
            let deadline = tokio::time::Instant::now() + self.config.announce_timeout() + jitter;

            loop {
                let received = tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        return Err(WorkerError::AnnounceTimedOut(attempt));
                    }
                    received = tokio::time::timeout_at(deadline, listeners.reply.recv_from(&mut buf)) => received,
                };
                let Ok(received) = received else {
                    break;
                };
                let (len, from) = received?;
                match Packet::decode(&buf[..len]) {
                    Ok(Packet::ConnectionResponse(response)) => return Ok((response, from)),
                    Ok(other) => debug!("Ignoring {} datagram from {}", other.kind(), from),
                    Err(e) => warn!("⚠️  Dropped malformed datagram from {}: {}", from, e),
                }
            }
            warn!("⚠️  No answer from master, retrying");
        }

        Err(WorkerError::AnnounceTimedOut(attempts))
    }

    pub(crate) async fn serve<LR, LW, TR, TW>(
        self: &Arc<Self>,
        load_reader: FrameReader<LR>,
        load_writer: FrameWriter<LW>,
        task_reader: FrameReader<TR>,
        task_writer: FrameWriter<TW>,
    ) where
        LR: AsyncRead + Unpin + Send + 'static,
        LW: AsyncWrite + Unpin + Send + 'static,
        TR: AsyncRead + Unpin + Send + 'static,
        TW: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        self.tracker
            .spawn(Arc::clone(self).answer_load(load_reader, load_writer));
        self.tracker
            .spawn(Arc::clone(self).write_task_channel(task_writer, outbox_rx));
        self.tracker
            .spawn(Arc::clone(self).read_task_channel(task_reader, outbox_tx));
        self.tracker.close();
        self.tracker.wait().await;
        info!("Worker {} stopped serving", self.config.id);
    }

    async fn answer_load<R, W>(self: Arc<Self>, mut reader: FrameReader<R>, mut writer: FrameWriter<W>)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = reader.read_packet() => read,
            };

            match read {
                Ok(Packet::LoadRequest(_)) => {
                    let sample = Packet::from(LoadResponse {
                        load: self.metrics.load(),
                        timestamp: current_timestamp_millis(),
                    });
                    if let Err(e) = writer.write_packet(&sample).await {
                        warn!("⚠️  Could not report load: {}", e);
                        if e.is_closed() {
                            break;
                        }
                    }
                }
                Ok(other) => warn!("⚠️  Unexpected {} packet on load channel", other.kind()),
                Err(e) if e.is_closed() => {
                    info!("🔌 Load channel closed by master");
                    break;
                }
                Err(e) => warn!("⚠️  Dropped packet on load channel: {}", e),
            }
        }

        self.shutdown.cancel();
        let _ = writer.shutdown().await;
    }

    async fn write_task_channel<W: AsyncWrite + Unpin>(
        self: Arc<Self>,
        mut writer: FrameWriter<W>,
        mut outbox: mpsc::UnboundedReceiver<Packet>,
    ) {
        loop {
            let packet = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = outbox.recv() => match next {
                    Some(packet) => packet,
                    None => break,
                },
            };
            if let Err(e) = writer.write_packet(&packet).await {
                warn!("⚠️  Could not send {} packet: {}", packet.kind(), e);
                if e.is_closed() {
                    break;
                }
            }
        }

        self.shutdown.cancel();
        let _ = writer.shutdown().await;
    }

    async fn read_task_channel<R: AsyncRead + Unpin>(
        self: Arc<Self>,
        mut reader: FrameReader<R>,
        outbox: mpsc::UnboundedSender<Packet>,
    ) {
        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = reader.read_packet() => read,
            };

            match read {
                Ok(Packet::TaskRequest(request)) => self.offer(request, &outbox),
                Ok(Packet::TaskStatusRequest(TaskStatusRequest { task_id })) => {
                    let status = self.task_status(task_id).unwrap_or(TaskStatus::Pending);
                    let _ = outbox.send(TaskStatusResponse { task_id, status }.into());
                }
                Ok(other) => warn!("⚠️  Unexpected {} packet on task channel", other.kind()),
                Err(e) if e.is_closed() => {
                    info!("🔌 Task channel closed by master");
                    break;
                }
                Err(e) => warn!("⚠️  Dropped packet on task channel: {}", e),
            }
        }

        self.shutdown.cancel();
    }

    /// Accept or reject an offer and, when accepted, run it in the background.
    fn offer(self: &Arc<Self>, request: TaskRequest, outbox: &mpsc::UnboundedSender<Packet>) {
        let TaskRequest {
            task_id, payload, ..
        } = request;

        let limit = self.config.max_active_tasks;
        let accept = limit == 0 || self.metrics.active_tasks() < limit;
        let _ = outbox.send(TaskRequestResponse { task_id, accept }.into());
        if !accept {
            info!("🚫 Rejected task #{} ({} running)", task_id, self.metrics.active_tasks());
            return;
        }

        info!("📥 Accepted task #{} ({} bytes)", task_id, payload.len());
        lock(&self.tasks).insert(task_id, TaskStatus::Assigned);
        self.metrics.task_started();

        let worker = Arc::clone(self);
        let outbox = outbox.clone();
        tokio::spawn(async move {
            let executor = Arc::clone(&worker.executor);
            let outcome =
                tokio::task::spawn_blocking(move || executor.execute(task_id, &payload)).await;
            worker.metrics.task_finished();

            let reply = match outcome {
                Ok(Ok(result)) => {
                    info!("✅ Task #{} done ({} bytes)", task_id, result.len());
                    lock(&worker.tasks).insert(task_id, TaskStatus::Completed);
                    Packet::from(TaskResultResponse { task_id, result })
                }
                Ok(Err(reason)) => {
                    error!("❌ Task #{} failed: {}", task_id, reason);
                    lock(&worker.tasks).insert(task_id, TaskStatus::Failed);
                    Packet::from(TaskStatusResponse {
                        task_id,
                        status: TaskStatus::Failed,
                    })
                }
                Err(e) => {
                    error!("❌ Task #{} panicked: {}", task_id, e);
                    lock(&worker.tasks).insert(task_id, TaskStatus::Failed);
                    Packet::from(TaskStatusResponse {
                        task_id,
                        status: TaskStatus::Failed,
                    })
                }
            };
            if outbox.send(reply).is_err() {
                debug!("Task channel gone before task #{} reported", task_id);
            }
        });
    }
}

/// The master dials the load channel first, then the task channel.
async fn accept_channels(
    listeners: &Listeners,
) -> WorkerResult<(tokio::net::TcpStream, tokio::net::TcpStream)> {
    let (load, from) = listeners.load.accept().await?;
    debug!("Load channel opened by {}", from);
    let (task, from) = listeners.task.accept().await?;
    debug!("Task channel opened by {}", from);
    Ok((load, task))
}

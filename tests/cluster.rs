use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};

use slave_pool::common::config::{MasterConfig, TimingConfig, WorkerInfo};
use slave_pool::common::messages::{
    ConnectionAck, ConnectionRequest, ConnectionResponse, Packet, TaskId, TaskStatus,
};
use slave_pool::master::{Master, PolicyKind};
use slave_pool::worker::{TaskExecutor, Worker};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn master_config() -> MasterConfig {
    let mut config = MasterConfig::default();
    config.master.discovery_port = 0;
    config.master.advertise_address = Some(LOCALHOST);
    config.timing = TimingConfig {
        load_probe_interval_ms: 50,
        task_pacing_ms: 1,
        gc_interval_ms: 20,
        assign_retry_backoff_ms: 50,
        connect_timeout_ms: 1000,
        send_queue_capacity: 16,
    };
    config
}

fn worker_config(id: u16, discovery: SocketAddr) -> WorkerInfo {
    WorkerInfo {
        id,
        master_address: SocketAddr::new(LOCALHOST, discovery.port()),
        listen_address: LOCALHOST,
        advertise_address: Some(LOCALHOST),
        load_port: 0,
        task_port: 0,
        reply_port: 0,
        announce_timeout_ms: 500,
        announce_attempts: 5,
        max_active_tasks: 0,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

fn spawn_worker(worker: &Arc<Worker>) -> tokio::task::JoinHandle<()> {
    let worker = Arc::clone(worker);
    tokio::spawn(async move {
        worker.run().await.expect("worker run");
    })
}

#[tokio::test]
async fn task_round_trip_through_discovered_worker() {
    let master = Master::with_policy(master_config(), PolicyKind::LeastLoad).unwrap();
    let discovery = master.start().await.unwrap();

    let worker = Worker::new(worker_config(1, discovery));
    let handle = spawn_worker(&worker);

    eventually("admission", || async { master.slave_exists(LOCALHOST, 1).await }).await;
    eventually("connection ack", || async { master.unacked_slaves().is_empty() }).await;

    let id = master.assign_new_task(b"hello".to_vec(), 3).await.unwrap();
    let task = tokio::time::timeout(Duration::from_secs(10), master.wait_for_task(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(b"hello".to_vec()));
    assert_eq!(task.assigned_to, None);

    // Load samples arrive on the load channel.
    eventually("load sample", || async {
        master.slave_views().await[0].load_timestamp > 0
    })
    .await;

    master.close().await;
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("worker stops once the master closes")
        .unwrap();
}

struct Slow;

impl TaskExecutor for Slow {
    fn execute(&self, _task_id: TaskId, payload: &[u8]) -> Result<Vec<u8>, String> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(payload.to_vec())
    }
}

#[tokio::test]
async fn tasks_of_a_dead_worker_move_to_a_survivor() {
    let master = Master::with_policy(master_config(), PolicyKind::FirstAvailable).unwrap();
    let discovery = master.start().await.unwrap();

    let doomed = Worker::with_executor(worker_config(1, discovery), Slow);
    let _doomed_handle = spawn_worker(&doomed);
    eventually("first admission", || async { master.slave_exists(LOCALHOST, 1).await }).await;

    let survivor = Worker::new(worker_config(2, discovery));
    let _survivor_handle = spawn_worker(&survivor);
    eventually("second admission", || async { master.slave_exists(LOCALHOST, 2).await }).await;

    let id = master.assign_new_task(b"payload".to_vec(), 7).await.unwrap();
    let assigned = master.task(id).await.unwrap().assigned_to.unwrap();
    assert_eq!(assigned.id, 1);
    eventually("offer accepted", || async {
        doomed.task_status(id) == Some(TaskStatus::Assigned)
    })
    .await;

    doomed.shutdown();

    let task = tokio::time::timeout(Duration::from_secs(10), master.wait_for_task(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.id, id);
    assert_eq!(task.load, 0);
    assert_eq!(task.result, Some(b"payload".to_vec()));

    eventually("dead worker reclaimed", || async {
        !master.slave_exists(LOCALHOST, 1).await
    })
    .await;
    assert_eq!(master.pool().len().await, 1);

    master.close().await;
}

async fn connection_response(reply: &UdpSocket) -> ConnectionResponse {
    let mut buf = vec![0u8; 1024];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), reply.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    match Packet::decode(&buf[..len]).unwrap() {
        Packet::ConnectionResponse(response) => response,
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn repeated_announcements_admit_once() {
    let master = Master::with_policy(master_config(), PolicyKind::RoundRobin).unwrap();
    let discovery = master.start().await.unwrap();
    let discovery = SocketAddr::new(LOCALHOST, discovery.port());

    let load = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let task = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let reply = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    let request = Packet::from(ConnectionRequest {
        source: LOCALHOST,
        reply_port: reply.local_addr().unwrap().port(),
        id: 9,
        load_port: load.local_addr().unwrap().port(),
        task_port: task.local_addr().unwrap().port(),
    })
    .encode()
    .unwrap();

    reply.send_to(&request, discovery).await.unwrap();
    let first = connection_response(&reply).await;
    assert!(first.ack);
    assert_eq!(first.master, LOCALHOST);

    let (_load_conn, _) = load.accept().await.unwrap();
    let (_task_conn, _) = task.accept().await.unwrap();
    eventually("admission", || async { master.slave_exists(LOCALHOST, 9).await }).await;

    reply.send_to(&request, discovery).await.unwrap();
    assert!(!connection_response(&reply).await.ack);
    assert_eq!(master.pool().len().await, 1);
    assert_eq!(master.unacked_slaves().len(), 1);

    master.close().await;
}

#[tokio::test]
async fn acknowledgement_matches_the_announced_address() {
    let master = Master::with_policy(master_config(), PolicyKind::RoundRobin).unwrap();
    let discovery = master.start().await.unwrap();
    let discovery = SocketAddr::new(LOCALHOST, discovery.port());

    // The worker announces 127.0.0.2 but its datagrams leave from 127.0.0.1.
    let announced = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));
    let load = TcpListener::bind((announced, 0)).await.unwrap();
    let task = TcpListener::bind((announced, 0)).await.unwrap();
    let reply = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
    let request = Packet::from(ConnectionRequest {
        source: announced,
        reply_port: reply.local_addr().unwrap().port(),
        id: 3,
        load_port: load.local_addr().unwrap().port(),
        task_port: task.local_addr().unwrap().port(),
    })
    .encode()
    .unwrap();

    reply.send_to(&request, discovery).await.unwrap();
    let response = connection_response(&reply).await;
    assert!(response.ack);

    let (_load_conn, _) = load.accept().await.unwrap();
    let (_task_conn, _) = task.accept().await.unwrap();
    eventually("admission", || async { master.slave_exists(announced, 3).await }).await;
    assert_eq!(master.unacked_slaves().len(), 1);

    let ack = Packet::from(ConnectionAck {
        source: announced,
        id: 3,
    })
    .encode()
    .unwrap();
    reply
        .send_to(&ack, SocketAddr::new(LOCALHOST, response.port))
        .await
        .unwrap();
    eventually("ack recorded", || async { master.unacked_slaves().is_empty() }).await;

    master.close().await;
}

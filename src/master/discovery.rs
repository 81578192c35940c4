//! UDP discovery listener.
//!
//! Slaves broadcast a [`ConnectionRequest`] to the master's discovery port. A
//! first-time `(ip, id)` gets `ack: true` and is admitted in the background;
//! a slave that is already registered, or being admitted, gets `ack: false`.
//! The slave confirms with a [`ConnectionAck`] once both TCP channels are up.

use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::common::messages::{ConnectionAck, ConnectionRequest, ConnectionResponse, Packet};
use crate::master::master::Master;
use crate::master::slave::{SlaveInfo, SlaveKey};

const MAX_DATAGRAM: usize = 64 * 1024;

pub(crate) async fn serve(master: Arc<Master>, socket: UdpSocket) {
    let shutdown = master.shutdown_token();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("⚠️  Discovery receive failed: {}", e);
                    continue;
                }
            },
        };

        match Packet::decode(&buf[..len]) {
            Ok(Packet::ConnectionRequest(request)) => {
                handle_request(&master, &socket, request, from).await;
            }
            Ok(Packet::ConnectionAck(ConnectionAck { source, id })) => {
                let key = SlaveKey { ip: source, id };
                if !master.acknowledge(key) {
                    debug!("Unexpected ack from slave {} (via {})", key, from);
                }
            }
            Ok(other) => debug!("Ignoring {} datagram from {}", other.kind(), from),
            Err(e) => warn!("⚠️  Dropped malformed datagram from {}: {}", from, e),
        }
    }

    debug!("Discovery listener stopped");
}

async fn handle_request(
    master: &Arc<Master>,
    socket: &UdpSocket,
    request: ConnectionRequest,
    from: SocketAddr,
) {
    let info = SlaveInfo::from(&request);
    let key = info.key();
    let known = master.slave_exists(key.ip, key.id).await || !master.reserve(key);
    if !known {
        info!("👋 Connection request from slave {} (via {})", key, from);
    }

    let port = socket.local_addr().map(|a| a.port()).unwrap_or_default();
    let response = ConnectionResponse {
        ack: !known,
        master: master.address().ip,
        port,
    };
    let reply_to = SocketAddr::new(request.source, request.reply_port);
    match Packet::from(response).encode() {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, reply_to).await {
                warn!("⚠️  Could not answer slave {} at {}: {}", key, reply_to, e);
            }
        }
        Err(e) => warn!("⚠️  Could not encode connection response: {}", e),
    }

    if known {
        debug!("Slave {} already known, not admitting again", key);
        return;
    }

    let admitting = Arc::clone(master);
    master.background().spawn(async move {
        match admitting.admit_reserved(info).await {
            Ok(true) => {}
            Ok(false) => debug!("Admission of {} skipped", key),
            Err(e) => warn!("⚠️  Could not admit slave {}: {}", key, e),
        }
    });
}

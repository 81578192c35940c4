//! # Wire Protocol
//!
//! Defines every control message exchanged between the master and its slaves:
//! - Discovery handshake (connection request / response / ack) over UDP
//! - Load probing on the per-slave load channel
//! - Task lifecycle (offer, accept/reject, result, status) on the task channel
//!
//! ## Envelope
//!
//! ```text
//! [1 byte: packet type tag] [N bytes: JSON payload for that tag]
//! ```
//!
//! The tag comes from the closed [`PacketType`] enumeration. Each payload type
//! is statically bound to exactly one tag through the [`Payload`] trait, so the
//! encoder can only ever emit a payload under the tag it belongs to.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Identifier of a task, allocated monotonically by the master.
pub type TaskId = u64;

/// Slave-local identifier announced during discovery.
pub type SlaveId = u16;

// ============================================================================
// PACKET TYPES
// ============================================================================

/// Tag stored in the first octet of every packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    ConnectionRequest = 1,
    ConnectionResponse = 2,
    ConnectionAck = 3,
    LoadRequest = 4,
    LoadResponse = 5,
    TaskRequest = 6,
    TaskRequestResponse = 7,
    TaskResultResponse = 8,
    TaskStatusRequest = 9,
    TaskStatusResponse = 10,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        let kind = match tag {
            1 => PacketType::ConnectionRequest,
            2 => PacketType::ConnectionResponse,
            3 => PacketType::ConnectionAck,
            4 => PacketType::LoadRequest,
            5 => PacketType::LoadResponse,
            6 => PacketType::TaskRequest,
            7 => PacketType::TaskRequestResponse,
            8 => PacketType::TaskResultResponse,
            9 => PacketType::TaskStatusRequest,
            10 => PacketType::TaskStatusResponse,
            other => return Err(ProtocolError::InvalidPacketType(other)),
        };
        Ok(kind)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors raised while encoding or decoding packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid packet type tag: {0}")]
    InvalidPacketType(u8),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("payload of kind {payload} cannot be encoded as {requested}")]
    UnsupportedPayloadType {
        payload: PacketType,
        requested: PacketType,
    },
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Binds a payload struct to its packet tag.
pub trait Payload: Serialize + DeserializeOwned {
    const KIND: PacketType;
}

/// Lifecycle state of a task, shared by the master's task table and the
/// status exchange on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

/// Broadcast by a slave to announce itself to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    /// Address the slave can be reached at
    pub source: IpAddr,
    /// UDP port the slave waits on for the master's response
    pub reply_port: u16,
    /// Slave-local identifier; `(source, id)` is the slave's identity
    pub id: SlaveId,
    /// TCP port of the slave's load channel
    pub load_port: u16,
    /// TCP port of the slave's task channel
    pub task_port: u16,
}

/// Master's unicast reply to a [`ConnectionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    /// `false` when the slave is already registered
    pub ack: bool,
    pub master: IpAddr,
    /// Master's discovery port, where the slave sends its [`ConnectionAck`]
    pub port: u16,
}

/// Sent by a slave once both of the master's TCP channels are accepted.
///
/// Keyed like the [`ConnectionRequest`] it answers: `source` is the announced
/// address, not whichever interface the datagram happens to leave from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAck {
    pub source: IpAddr,
    pub id: SlaveId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {}

/// A load sample. `timestamp` is Unix milliseconds at sampling time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResponse {
    pub load: f64,
    pub timestamp: u64,
}

/// Task offer pushed by the master onto a slave's task channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub load: u64,
}

/// Slave's accept/reject answer to a [`TaskRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequestResponse {
    pub task_id: TaskId,
    pub accept: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResultResponse {
    pub task_id: TaskId,
    #[serde(with = "base64_bytes")]
    pub result: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusRequest {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

macro_rules! bind_payloads {
    ($($payload:ident),* $(,)?) => {
        $(
            impl Payload for $payload {
                const KIND: PacketType = PacketType::$payload;
            }

            impl From<$payload> for Packet {
                fn from(payload: $payload) -> Self {
                    Packet::$payload(payload)
                }
            }
        )*

        /// Any decoded packet, tagged by kind.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Packet {
            $($payload($payload),)*
        }

        impl Packet {
            /// Tag this packet is sent under.
            pub fn kind(&self) -> PacketType {
                match self {
                    $(Packet::$payload(_) => PacketType::$payload,)*
                }
            }

            /// Encode this packet into a tagged envelope.
            pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
                match self {
                    $(Packet::$payload(p) => encode(p, PacketType::$payload),)*
                }
            }

            /// Decode an envelope, dispatching on its tag.
            pub fn decode(buf: &[u8]) -> Result<Packet, ProtocolError> {
                let kind = packet_type(buf)?;
                match kind {
                    $(PacketType::$payload => decode::<$payload>(buf, kind).map(Packet::$payload),)*
                }
            }
        }
    };
}

bind_payloads!(
    ConnectionRequest,
    ConnectionResponse,
    ConnectionAck,
    LoadRequest,
    LoadResponse,
    TaskRequest,
    TaskRequestResponse,
    TaskResultResponse,
    TaskStatusRequest,
    TaskStatusResponse,
);

// ============================================================================
// ENCODING
// ============================================================================

/// Read the tag of an envelope without decoding its payload.
pub fn packet_type(buf: &[u8]) -> Result<PacketType, ProtocolError> {
    let tag = *buf
        .first()
        .ok_or_else(|| ProtocolError::MalformedPayload("empty packet".to_string()))?;
    PacketType::try_from(tag)
}

/// Encode `payload` under tag `kind`.
///
/// Fails with [`ProtocolError::UnsupportedPayloadType`] when `kind` is not the
/// tag the payload type is bound to.
pub fn encode<P: Payload>(payload: &P, kind: PacketType) -> Result<Vec<u8>, ProtocolError> {
    if P::KIND != kind {
        return Err(ProtocolError::UnsupportedPayloadType {
            payload: P::KIND,
            requested: kind,
        });
    }

    let mut buf = vec![kind as u8];
    serde_json::to_writer(&mut buf, payload)
        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
    Ok(buf)
}

/// Decode the payload of an envelope expected to carry tag `kind`.
pub fn decode<P: Payload>(buf: &[u8], kind: PacketType) -> Result<P, ProtocolError> {
    if P::KIND != kind {
        return Err(ProtocolError::UnsupportedPayloadType {
            payload: P::KIND,
            requested: kind,
        });
    }

    let found = packet_type(buf)?;
    if found != kind {
        return Err(ProtocolError::MalformedPayload(format!(
            "expected {} packet, found {}",
            kind, found
        )));
    }

    serde_json::from_slice(&buf[1..]).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

/// Serde adapter carrying opaque byte blobs as base64 strings inside JSON.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Current Unix time in milliseconds, used to stamp load samples.
pub fn current_timestamp_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_packets() -> Vec<Packet> {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        vec![
            ConnectionRequest {
                source: ip,
                reply_port: 9001,
                id: 7,
                load_port: 9101,
                task_port: 9102,
            }
            .into(),
            ConnectionResponse {
                ack: true,
                master: ip,
                port: 9000,
            }
            .into(),
            ConnectionAck { source: ip, id: 7 }.into(),
            LoadRequest {}.into(),
            LoadResponse {
                load: 42.5,
                timestamp: 1_700_000_000_000,
            }
            .into(),
            TaskRequest {
                task_id: 3,
                payload: vec![0, 1, 2, 255],
                load: 5,
            }
            .into(),
            TaskRequestResponse {
                task_id: 3,
                accept: false,
            }
            .into(),
            TaskResultResponse {
                task_id: 3,
                result: b"done".to_vec(),
            }
            .into(),
            TaskStatusRequest { task_id: 3 }.into(),
            TaskStatusResponse {
                task_id: 3,
                status: TaskStatus::Failed,
            }
            .into(),
        ]
    }

    #[test]
    fn every_packet_kind_survives_the_envelope() {
        for packet in sample_packets() {
            let bytes = packet.encode().unwrap();
            assert_eq!(bytes[0], packet.kind() as u8);
            assert_eq!(Packet::decode(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn typed_decode_matches_tag() {
        let bytes = encode(&TaskStatusRequest { task_id: 11 }, PacketType::TaskStatusRequest).unwrap();
        let decoded: TaskStatusRequest = decode(&bytes, PacketType::TaskStatusRequest).unwrap();
        assert_eq!(decoded.task_id, 11);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        for tag in [0u8, 11, 200] {
            let err = Packet::decode(&[tag, b'{', b'}']).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidPacketType(t) if t == tag));
        }
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let mut bytes = Packet::from(LoadResponse {
            load: 1.0,
            timestamp: 10,
        })
        .encode()
        .unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            Packet::decode(&bytes),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn empty_buffer_is_malformed() {
        assert!(matches!(
            Packet::decode(&[]),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn payload_under_foreign_tag_is_unsupported() {
        let err = encode(&LoadRequest {}, PacketType::TaskRequest).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedPayloadType {
                payload: PacketType::LoadRequest,
                requested: PacketType::TaskRequest,
            }
        ));
    }

    #[test]
    fn typed_decode_refuses_other_tags() {
        let bytes = encode(&LoadRequest {}, PacketType::LoadRequest).unwrap();
        let result: Result<LoadResponse, _> = decode(&bytes, PacketType::LoadResponse);
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn blobs_travel_as_base64() {
        let bytes = Packet::from(TaskResultResponse {
            task_id: 1,
            result: b"hi".to_vec(),
        })
        .encode()
        .unwrap();
        let json = std::str::from_utf8(&bytes[1..]).unwrap();
        assert!(json.contains("\"aGk=\""));
    }
}

//! # TCP Connection Framing
//!
//! Each packet envelope travels over TCP inside a length-delimited frame:
//! ```text
//! [4 bytes: frame length, big-endian] [N bytes: packet envelope]
//! ```
//!
//! Streams are split into a [`FrameReader`] and a [`FrameWriter`] so that a
//! slave's receive loop and send loop can own their halves independently.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::messages::{Packet, ProtocolError};

/// Largest frame accepted from the network (16 MiB).
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed by peer")]
    Closed,

    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Whether this error means the stream is gone for good.
    ///
    /// An oversized frame leaves the stream unsynchronised, so it counts as
    /// closed as well.
    pub fn is_closed(&self) -> bool {
        match self {
            ConnectionError::Closed | ConnectionError::FrameTooLarge(_) => true,
            ConnectionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            ConnectionError::Protocol(_) => false,
        }
    }
}

/// Reading half of a framed connection.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one raw frame.
    ///
    /// Returns [`ConnectionError::Closed`] when the peer closed the stream on a
    /// frame boundary.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let mut length_buf = [0u8; 4];
        if let Err(e) = self.inner.read_exact(&mut length_buf).await {
            return Err(match e.kind() {
                io::ErrorKind::UnexpectedEof => ConnectionError::Closed,
                _ => ConnectionError::Io(e),
            });
        }

        let length = u32::from_be_bytes(length_buf) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(ConnectionError::FrameTooLarge(length));
        }

        let mut data = vec![0u8; length];
        self.inner.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Read and decode one packet.
    ///
    /// A frame that fails to decode yields [`ConnectionError::Protocol`]; the
    /// stream stays usable and the caller may keep reading.
    pub async fn read_packet(&mut self) -> Result<Packet, ConnectionError> {
        let frame = self.read_frame().await?;
        Ok(Packet::decode(&frame)?)
    }
}

/// Writing half of a framed connection.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let length = data.len() as u32;
        self.inner.write_all(&length.to_be_bytes()).await?;
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        let data = packet.encode()?;
        self.write_frame(&data).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Split a TCP stream into framed halves.
pub fn split(stream: TcpStream) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
    let (read, write) = stream.into_split();
    (FrameReader::new(read), FrameWriter::new(write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::messages::{LoadRequest, LoadResponse, PacketType};

    #[tokio::test]
    async fn packets_cross_a_duplex_stream() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        let sample = Packet::from(LoadResponse {
            load: 12.5,
            timestamp: 99,
        });
        writer.write_packet(&Packet::from(LoadRequest {})).await.unwrap();
        writer.write_packet(&sample).await.unwrap();

        assert_eq!(reader.read_packet().await.unwrap().kind(), PacketType::LoadRequest);
        assert_eq!(reader.read_packet().await.unwrap(), sample);
    }

    #[tokio::test]
    async fn garbage_frame_is_recoverable() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(a);
        let mut reader = FrameReader::new(b);

        writer.write_frame(&[42, b'x']).await.unwrap();
        writer.write_packet(&Packet::from(LoadRequest {})).await.unwrap();

        let err = reader.read_packet().await.unwrap_err();
        assert!(!err.is_closed());
        assert_eq!(reader.read_packet().await.unwrap().kind(), PacketType::LoadRequest);
    }

    #[tokio::test]
    async fn dropped_writer_reads_as_closed() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut reader = FrameReader::new(b);
        let err = reader.read_packet().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn oversized_frame_is_fatal() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let mut reader = FrameReader::new(b);
        let err = reader.read_frame().await.unwrap_err();
        assert!(err.is_closed());
    }
}

//! Worker-side error types.

use thiserror::Error;

use crate::common::connection::ConnectionError;
use crate::common::messages::ProtocolError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no connection response from the master after {0} attempt(s)")]
    AnnounceTimedOut(u32),

    #[error("master did not open both channels in time")]
    ChannelTimeout,

    #[error("cannot determine local network address: {0}")]
    Address(#[source] std::io::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

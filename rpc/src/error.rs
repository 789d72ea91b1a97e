use crate::ProcId;
use thiserror::Error;

/// errors raised by the transport.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("initialization failed: {0}")]
    InitFailed(String),

    #[error("connection to peer {0} lost")]
    ConnectionLost(ProcId),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport is shut down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;

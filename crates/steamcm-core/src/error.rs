use thiserror::Error;

use crate::enums::EResult;

/// Errors produced by the steamcm protocol layer.
#[derive(Debug, Error)]
pub enum CmError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("decompression error: {0}")]
    Decompress(String),

    #[error("connection to {address} closed")]
    ConnectionClosed { address: String },

    #[error("no servers found")]
    NoServersFound,

    #[error("logon rejected: {0:?}")]
    LogonRejected(EResult),

    #[error("service call failed: {0:?}")]
    Service(EResult),

    #[error("directory error: {0}")]
    Directory(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CmError {
    /// The server address a `ConnectionClosed` failure happened on.
    pub fn failed_address(&self) -> Option<&str> {
        match self {
            CmError::ConnectionClosed { address } => Some(address),
            _ => None,
        }
    }
}

impl From<prost::DecodeError> for CmError {
    fn from(e: prost::DecodeError) -> Self {
        CmError::Decode(e.to_string())
    }
}

pub type CmResult<T> = Result<T, CmError>;

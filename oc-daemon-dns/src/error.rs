//! DNS proxy error types

use std::io;
use thiserror::Error;

/// DNS proxy result type
pub type Result<T> = std::result::Result<T, DnsProxyError>;

/// DNS proxy error types
#[derive(Error, Debug)]
pub enum DnsProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("DNS protocol error: {0}")]
    Protocol(String),

    #[error("upstream exchange timeout")]
    Timeout,

    #[error("invalid upstream server address: {0}")]
    InvalidUpstream(String),
}

impl From<hickory_proto::ProtoError> for DnsProxyError {
    fn from(e: hickory_proto::ProtoError) -> Self {
        DnsProxyError::Protocol(e.to_string())
    }
}

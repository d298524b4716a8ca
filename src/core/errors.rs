use thiserror::Error;

use crate::netio::relay::RelayError;
use crate::netio::rudp::ConnError;

/// Per-dial failures. All of these are local to one client: they become a
/// Failure result and never unwind the scheduler.
#[derive(Debug, Error)]
pub enum DhcpError {
    #[error("exchange timed out after {0} attempt(s)")]
    ExchangeTimeout(usize),
    #[error("{0} is not configured for this client")]
    NotConfigured(&'static str),
    #[error("response is missing required option {0}")]
    MissingOption(&'static str),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("no router advertisement with the managed flag was seen")]
    NotManaged,
    #[error("codec failure: {0}")]
    Codec(String),
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("failed to apply lease: {0}")]
    Apply(#[from] std::io::Error),
}

impl From<dhcproto::error::EncodeError> for DhcpError {
    fn from(e: dhcproto::error::EncodeError) -> Self {
        DhcpError::Codec(e.to_string())
    }
}

impl From<dhcproto::error::DecodeError> for DhcpError {
    fn from(e: dhcproto::error::DecodeError) -> Self {
        DhcpError::Codec(e.to_string())
    }
}

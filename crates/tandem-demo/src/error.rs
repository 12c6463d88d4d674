//! Demo driver errors.

use tandem_core::{ErrorKind, HandshakeError, SessionError};
use thiserror::Error;

/// Errors surfaced by the async driver.
#[derive(Error, Debug)]
pub enum DemoError {
    /// Handshake aborted, locally or by the peer
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Established session rejected a message
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// The other end of the link went away
    #[error("link closed")]
    LinkClosed,
}

impl DemoError {
    /// Protocol error kind, if this wraps a protocol error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Handshake(e) => Some(e.kind()),
            Self::Session(e) => Some(e.kind()),
            Self::LinkClosed => None,
        }
    }
}

use std::time::Duration;

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Channel-level error.
    #[error("channel error: {0}")]
    Channel(#[from] ratlink_channel::ChannelError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] ratlink_frame::FrameError),

    /// The session is not open (closed by us, the peer, or retry exhaustion).
    #[error("session {id} is closed")]
    SessionClosed { id: u8 },

    /// A new-session or end-of-session handshake ran out of attempts.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A blocking read or write timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// All 255 session ids are in use.
    #[error("no free session id")]
    NoFreeSessionId,

    /// The transporter gave up on the channel.
    #[error("transport is down")]
    TransportDown,

    /// The session exists but is not of the requested kind.
    #[error("session {id} is a {actual} session")]
    WrongKind { id: u8, actual: &'static str },

    /// A worker thread could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

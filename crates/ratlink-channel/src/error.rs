/// Errors that can occur on a byte channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel is not connected.
    #[error("channel not connected")]
    NotConnected,

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// An I/O error occurred on the channel. Usually transient.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote end refused the login exchange.
    #[error("login rejected: {0}")]
    LoginRejected(String),

    /// The channel cannot be re-established (e.g. an accepted socket).
    #[error("channel {0} cannot reconnect")]
    CannotReconnect(String),

    /// The channel has been shut down.
    #[error("channel shut down")]
    Shutdown,
}

impl ChannelError {
    /// Whether a reconnect attempt could plausibly clear this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::Io(_) | ChannelError::NotConnected | ChannelError::Connect { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

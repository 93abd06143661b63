/// Failures of a [`Connection`](crate::Connection).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The remote end is gone, or the connection was closed locally.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("could not reach {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write failed: {0}")]
    SendFailed(#[source] std::io::Error),

    #[error("read failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),
}

impl TransportError {
    /// `true` when the connection is unusable from now on, as opposed to
    /// a single failed read or write.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_))
    }
}

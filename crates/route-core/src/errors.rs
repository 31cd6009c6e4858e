/// Failures of either collaborator connection.
/// Classifies errors as session-fatal (tear the session down) or per-request.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connect to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },
    #[error("request rejected: {0}")]
    RequestFailed(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    pub fn connect(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectFailed {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the error means the connection itself is unusable.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. } | Self::ConnectionLost(_) | Self::Closed
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectFailed { .. } => "connect_failed",
            Self::RequestFailed(_) => "request_failed",
            Self::ConnectionLost(_) => "connection_lost",
            Self::Protocol(_) => "protocol",
            Self::Closed => "closed",
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::ConnectionLost(e.to_string())
    }
}

/// Control message decoding failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("control message is empty")]
    Empty,
    #[error("control message missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown control command: {0}")]
    UnknownCommand(String),
}

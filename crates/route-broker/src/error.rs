use route_core::ConnectionError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("gave up after {attempts} failed connection attempts")]
    ConnectExhausted { attempts: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl BrokerError {
    /// True when retrying the session cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectExhausted { .. } | Self::Config(_))
    }
}

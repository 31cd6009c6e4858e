use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::channel::ChannelMap;
use crate::errors::ConnectionError;
use crate::ids::RequestId;
use crate::request::{Request, RequestWindow};

/// How long a fetch may block. Negative millisecond values mean forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchTimeout {
    Infinite,
    After(Duration),
}

impl FetchTimeout {
    pub fn from_millis(ms: i64) -> Self {
        if ms < 0 {
            Self::Infinite
        } else {
            Self::After(Duration::from_millis(ms as u64))
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::After(d) => Some(*d),
        }
    }

    pub fn as_millis(&self) -> i64 {
        match self {
            Self::Infinite => -1,
            Self::After(d) => d.as_millis() as i64,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }
}

/// Result of a single data-source fetch. A timeout is a normal outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum FetchOutcome {
    Data(ChannelMap),
    TimedOut,
}

/// One event read from the request-source connection.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    /// Nothing arrived within the fetch timeout; treated as a ping.
    Timeout,
    /// The client no longer wants the response stream of this request.
    EndOfStream(RequestId),
    Request(Request),
}

/// One logical session with the data source.
#[async_trait]
pub trait DataConnection: Send {
    /// Name the server actually assigned to this client.
    fn client_name(&self) -> &str;
    /// Full path name of the data-source server.
    fn server_name(&self) -> &str;

    async fn request(&mut self, map: &ChannelMap, window: RequestWindow) -> Result<(), ConnectionError>;
    async fn subscribe(&mut self, map: &ChannelMap, window: RequestWindow) -> Result<(), ConnectionError>;

    /// Push-style stream. Defaults to a plain subscription.
    async fn monitor(&mut self, map: &ChannelMap, window: RequestWindow) -> Result<(), ConnectionError> {
        self.subscribe(map, window).await
    }

    async fn fetch(&mut self, timeout: FetchTimeout) -> Result<FetchOutcome, ConnectionError>;

    /// Round-trip ping.
    async fn is_alive(&mut self) -> bool;

    /// Tell the data source the outstanding stream is no longer wanted.
    async fn end_stream(&mut self) -> Result<(), ConnectionError>;

    /// Idempotent.
    async fn close(&mut self);

    fn bytes_transferred(&self) -> u64;
}

#[async_trait]
pub trait DataConnector: Send + Sync {
    async fn open(
        &self,
        address: &str,
        client_name: &str,
    ) -> Result<Box<dyn DataConnection>, ConnectionError>;
}

/// The inbound side: a queue of request events plus the response path.
///
/// `next_event` is only called by the broker loop; `publish`/`finish` are
/// called concurrently by workers.
#[async_trait]
pub trait RequestSource: Send + Sync {
    fn client_name(&self) -> String;
    fn server_name(&self) -> String;

    async fn next_event(&self, timeout: FetchTimeout) -> Result<InboundEvent, ConnectionError>;

    /// Answer (part of) a request. `streaming` keeps the response open.
    async fn publish(&self, id: &RequestId, map: ChannelMap, streaming: bool) -> Result<(), ConnectionError>;

    /// Empty terminal answer; ends the response stream of `id`.
    async fn finish(&self, id: &RequestId) -> Result<(), ConnectionError> {
        self.publish(id, ChannelMap::new(), false).await
    }

    async fn is_alive(&self) -> bool;
    async fn close(&self);
    fn bytes_transferred(&self) -> u64;
}

#[async_trait]
pub trait RequestSourceConnector: Send + Sync {
    async fn open(
        &self,
        address: &str,
        client_name: &str,
    ) -> Result<Arc<dyn RequestSource>, ConnectionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_timeout_is_infinite() {
        assert_eq!(FetchTimeout::from_millis(-1), FetchTimeout::Infinite);
        assert!(FetchTimeout::from_millis(-1).as_duration().is_none());
        assert_eq!(FetchTimeout::Infinite.as_millis(), -1);
    }

    #[test]
    fn finite_timeout_keeps_millis() {
        let t = FetchTimeout::from_millis(60_000);
        assert_eq!(t.as_duration(), Some(Duration::from_secs(60)));
        assert_eq!(t.as_millis(), 60_000);
        assert!(!t.is_infinite());
    }

    #[test]
    fn zero_timeout_is_a_poll() {
        assert_eq!(FetchTimeout::from_millis(0).as_duration(), Some(Duration::ZERO));
    }
}

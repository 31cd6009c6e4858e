//! Scripted in-memory collaborators for deterministic testing without sockets.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::channel::ChannelMap;
use crate::connection::{
    DataConnection, DataConnector, FetchOutcome, FetchTimeout, InboundEvent, RequestSource,
    RequestSourceConnector,
};
use crate::errors::ConnectionError;
use crate::ids::RequestId;
use crate::request::{Request, RequestWindow};

/// Longest an unscripted fetch sleeps before reporting a timeout.
const IDLE_FETCH: Duration = Duration::from_millis(20);

/// Pre-programmed fetch results, consumed in order per request key.
#[derive(Clone, Debug)]
pub enum MockFetch {
    /// Answer every requested channel with this payload.
    Data(Vec<u8>),
    /// Answer with exactly this (remote-named) map.
    Raw(ChannelMap),
    TimedOut,
    Lost,
    /// Wait, then resolve the inner result.
    Delay(Duration, Box<MockFetch>),
}

impl MockFetch {
    pub fn text(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    pub fn delayed(delay: Duration, inner: MockFetch) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// A request seen by the mock data source.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub client_name: String,
    pub map: ChannelMap,
    pub window: RequestWindow,
    pub mode: &'static str,
}

#[derive(Default)]
struct DataState {
    scripts: HashMap<String, VecDeque<MockFetch>>,
    requests: Vec<RecordedRequest>,
    opened_names: Vec<String>,
    end_stream_delay: Option<Duration>,
}

struct DataInner {
    server_name: String,
    state: Mutex<DataState>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    end_streams: AtomicUsize,
    fail_opens: AtomicUsize,
    alive: AtomicBool,
}

/// Mock data source. Scripts are keyed by the first remote channel name of
/// the outstanding request.
#[derive(Clone)]
pub struct MockDataSource {
    inner: Arc<DataInner>,
}

impl MockDataSource {
    pub fn new(server_name: &str) -> Self {
        Self {
            inner: Arc::new(DataInner {
                server_name: server_name.to_string(),
                state: Mutex::new(DataState::default()),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                end_streams: AtomicUsize::new(0),
                fail_opens: AtomicUsize::new(0),
                alive: AtomicBool::new(true),
            }),
        }
    }

    pub fn script(&self, remote_channel: &str, fetches: Vec<MockFetch>) {
        self.inner
            .state
            .lock()
            .scripts
            .entry(remote_channel.to_string())
            .or_default()
            .extend(fetches);
    }

    /// Make the next `n` opens fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.inner.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn set_alive(&self, alive: bool) {
        self.inner.alive.store(alive, Ordering::SeqCst);
    }

    /// Make every `end_stream` take this long to be acknowledged.
    pub fn slow_end_stream(&self, delay: Duration) {
        self.inner.state.lock().end_stream_delay = Some(delay);
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn end_streams(&self) -> usize {
        self.inner.end_streams.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.state.lock().requests.clone()
    }

    pub fn opened_names(&self) -> Vec<String> {
        self.inner.state.lock().opened_names.clone()
    }
}

#[async_trait]
impl DataConnector for MockDataSource {
    async fn open(
        &self,
        address: &str,
        client_name: &str,
    ) -> Result<Box<dyn DataConnection>, ConnectionError> {
        let pending = self.inner.fail_opens.load(Ordering::SeqCst);
        if pending > 0 {
            self.inner.fail_opens.store(pending - 1, Ordering::SeqCst);
            return Err(ConnectionError::connect(address, "mock refused"));
        }
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.state.lock().opened_names.push(client_name.to_string());
        Ok(Box::new(MockDataConnection {
            inner: self.inner.clone(),
            client_name: client_name.to_string(),
            current: None,
            bytes: 0,
            closed: false,
        }))
    }
}

struct MockDataConnection {
    inner: Arc<DataInner>,
    client_name: String,
    current: Option<ChannelMap>,
    bytes: u64,
    closed: bool,
}

impl MockDataConnection {
    fn record(&mut self, map: &ChannelMap, window: RequestWindow, mode: &'static str) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.inner.state.lock().requests.push(RecordedRequest {
            client_name: self.client_name.clone(),
            map: map.clone(),
            window,
            mode,
        });
        self.current = Some(map.clone());
        Ok(())
    }

    fn answer(&mut self, payload: &[u8]) -> ChannelMap {
        let mut out = ChannelMap::new();
        if let Some(current) = &self.current {
            for name in current.names() {
                let idx = out.add(name);
                out.put_data(idx, payload.to_vec(), None);
            }
        }
        self.bytes += out.payload_bytes();
        out
    }
}

#[async_trait]
impl DataConnection for MockDataConnection {
    fn client_name(&self) -> &str {
        &self.client_name
    }

    fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    async fn request(&mut self, map: &ChannelMap, window: RequestWindow) -> Result<(), ConnectionError> {
        self.record(map, window, "request")
    }

    async fn subscribe(&mut self, map: &ChannelMap, window: RequestWindow) -> Result<(), ConnectionError> {
        self.record(map, window, "subscribe")
    }

    async fn monitor(&mut self, map: &ChannelMap, window: RequestWindow) -> Result<(), ConnectionError> {
        self.record(map, window, "monitor")
    }

    async fn fetch(&mut self, timeout: FetchTimeout) -> Result<FetchOutcome, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let key = match self.current.as_ref().and_then(|m| m.first_name()) {
            Some(key) => key.to_string(),
            None => return Err(ConnectionError::Protocol("fetch without request".into())),
        };
        let next = self
            .inner
            .state
            .lock()
            .scripts
            .get_mut(&key)
            .and_then(VecDeque::pop_front);

        let Some(mut current) = next else {
            let idle = timeout.as_duration().map_or(IDLE_FETCH, |d| d.min(IDLE_FETCH));
            tokio::time::sleep(idle).await;
            return Ok(FetchOutcome::TimedOut);
        };
        loop {
            match current {
                MockFetch::Data(payload) => return Ok(FetchOutcome::Data(self.answer(&payload))),
                MockFetch::Raw(map) => {
                    self.bytes += map.payload_bytes();
                    return Ok(FetchOutcome::Data(map));
                }
                MockFetch::TimedOut => return Ok(FetchOutcome::TimedOut),
                MockFetch::Lost => return Err(ConnectionError::ConnectionLost("mock lost".into())),
                MockFetch::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    current = *inner;
                }
            }
        }
    }

    async fn is_alive(&mut self) -> bool {
        !self.closed && self.inner.alive.load(Ordering::SeqCst)
    }

    async fn end_stream(&mut self) -> Result<(), ConnectionError> {
        let delay = self.inner.state.lock().end_stream_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.end_streams.fetch_add(1, Ordering::SeqCst);
        self.current = None;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn bytes_transferred(&self) -> u64 {
        self.bytes
    }
}

/// A publish seen by the mock request source.
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub id: RequestId,
    pub map: ChannelMap,
    pub streaming: bool,
}

impl Published {
    /// Empty, non-streaming answer that ends a response stream.
    pub fn is_terminal(&self) -> bool {
        self.map.is_empty() && !self.streaming
    }
}

struct SourceInner {
    server_name: String,
    client_name: Mutex<String>,
    events: Mutex<VecDeque<Result<InboundEvent, ConnectionError>>>,
    arrived: Notify,
    published: Mutex<Vec<Published>>,
    alive: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_opens: AtomicUsize,
    bytes: AtomicU64,
}

/// Mock request source; acts as its own connector. Every open hands back the
/// same shared queue.
#[derive(Clone)]
pub struct MockRequestSource {
    inner: Arc<SourceInner>,
}

impl MockRequestSource {
    pub fn new(server_name: &str) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                server_name: server_name.to_string(),
                client_name: Mutex::new(String::new()),
                events: Mutex::new(VecDeque::new()),
                arrived: Notify::new(),
                published: Mutex::new(Vec::new()),
                alive: AtomicBool::new(true),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                fail_opens: AtomicUsize::new(0),
                bytes: AtomicU64::new(0),
            }),
        }
    }

    fn push(&self, event: Result<InboundEvent, ConnectionError>) {
        self.inner.events.lock().push_back(event);
        self.inner.arrived.notify_one();
    }

    pub fn push_request(&self, request: Request) {
        self.push(Ok(InboundEvent::Request(request)));
    }

    pub fn push_end_of_stream(&self, id: &str) {
        self.push(Ok(InboundEvent::EndOfStream(RequestId::from_raw(id))));
    }

    pub fn push_timeout(&self) {
        self.push(Ok(InboundEvent::Timeout));
    }

    pub fn push_failure(&self, error: ConnectionError) {
        self.push(Err(error));
    }

    pub fn set_alive(&self, alive: bool) {
        self.inner.alive.store(alive, Ordering::SeqCst);
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.inner.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<Published> {
        self.inner.published.lock().clone()
    }

    pub fn published_for(&self, id: &str) -> Vec<Published> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|p| p.id.as_str() == id)
            .cloned()
            .collect()
    }

    /// Poll until `pred` holds for the publish log or `within` elapses.
    pub async fn wait_until<F>(&self, within: Duration, pred: F) -> bool
    where
        F: Fn(&[Published]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if pred(&self.inner.published.lock()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_publishes(&self, id: &str, count: usize, within: Duration) -> bool {
        self.wait_until(within, |log| {
            log.iter().filter(|p| p.id.as_str() == id).count() >= count
        })
        .await
    }
}

#[async_trait]
impl RequestSourceConnector for MockRequestSource {
    async fn open(
        &self,
        address: &str,
        client_name: &str,
    ) -> Result<Arc<dyn RequestSource>, ConnectionError> {
        let pending = self.inner.fail_opens.load(Ordering::SeqCst);
        if pending > 0 {
            self.inner.fail_opens.store(pending - 1, Ordering::SeqCst);
            return Err(ConnectionError::connect(address, "mock refused"));
        }
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        *self.inner.client_name.lock() = client_name.to_string();
        self.inner.alive.store(true, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl RequestSource for MockRequestSource {
    fn client_name(&self) -> String {
        self.inner.client_name.lock().clone()
    }

    fn server_name(&self) -> String {
        self.inner.server_name.clone()
    }

    async fn next_event(&self, timeout: FetchTimeout) -> Result<InboundEvent, ConnectionError> {
        loop {
            if let Some(event) = self.inner.events.lock().pop_front() {
                return event;
            }
            let arrived = self.inner.arrived.notified();
            match timeout.as_duration() {
                Some(limit) => {
                    if tokio::time::timeout(limit, arrived).await.is_err() {
                        return Ok(InboundEvent::Timeout);
                    }
                }
                None => arrived.await,
            }
        }
    }

    async fn publish(&self, id: &RequestId, map: ChannelMap, streaming: bool) -> Result<(), ConnectionError> {
        self.inner.bytes.fetch_add(map.payload_bytes(), Ordering::SeqCst);
        self.inner.published.lock().push(Published {
            id: id.clone(),
            map,
            streaming,
        });
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn bytes_transferred(&self) -> u64 {
        self.inner.bytes.load(Ordering::SeqCst)
    }
}

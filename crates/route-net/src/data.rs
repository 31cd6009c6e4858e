//! Data-source leg: one TCP connection per worker.

use async_trait::async_trait;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use route_core::{
    ChannelMap, ConnectionError, DataConnection, DataConnector, FetchOutcome, FetchTimeout, RequestWindow,
};

use crate::frame::{recv_frame, send_frame, Frame, FrameError, RequestMode, Role};
use crate::{dial, PING_TIMEOUT};

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDataConnector;

#[async_trait]
impl DataConnector for TcpDataConnector {
    async fn open(&self, address: &str, client_name: &str) -> Result<Box<dyn DataConnection>, ConnectionError> {
        let dialed = dial(address, Role::Sink, client_name).await?;
        Ok(Box::new(TcpDataConnection {
            framed: dialed.framed,
            client_name: dialed.client_name,
            server_name: dialed.server_name,
            bytes: dialed.bytes,
            closed: false,
        }))
    }
}

pub struct TcpDataConnection {
    framed: Framed<TcpStream, LinesCodec>,
    client_name: String,
    server_name: String,
    bytes: u64,
    closed: bool,
}

impl TcpDataConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.bytes += send_frame(&mut self.framed, &frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Frame, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let (frame, read) = recv_frame(&mut self.framed).await?;
        self.bytes += read;
        Ok(frame)
    }

    async fn register(&mut self, map: &ChannelMap, window: RequestWindow, mode: RequestMode) -> Result<(), ConnectionError> {
        self.send(Frame::Request {
            map: map.clone(),
            window,
            mode,
        })
        .await
    }

    /// Read until `want` matches, discarding anything else.
    async fn skip_until(&mut self, want: fn(&Frame) -> bool) -> Result<(), ConnectionError> {
        loop {
            let frame = self.recv().await?;
            if want(&frame) {
                return Ok(());
            }
            debug!(op = frame.op(), "discarding frame");
        }
    }
}

#[async_trait]
impl DataConnection for TcpDataConnection {
    fn client_name(&self) -> &str {
        &self.client_name
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }

    async fn request(&mut self, map: &ChannelMap, window: RequestWindow) -> Result<(), ConnectionError> {
        self.register(map, window, RequestMode::Request).await
    }

    async fn subscribe(&mut self, map: &ChannelMap, window: RequestWindow) -> Result<(), ConnectionError> {
        self.register(map, window, RequestMode::Subscribe).await
    }

    async fn monitor(&mut self, map: &ChannelMap, window: RequestWindow) -> Result<(), ConnectionError> {
        self.register(map, window, RequestMode::Monitor).await
    }

    async fn fetch(&mut self, timeout: FetchTimeout) -> Result<FetchOutcome, ConnectionError> {
        let deadline = timeout.as_duration().map(|d| tokio::time::Instant::now() + d);
        loop {
            let frame = match deadline {
                Some(at) => match tokio::time::timeout_at(at, self.recv()).await {
                    Ok(frame) => frame?,
                    Err(_) => return Ok(FetchOutcome::TimedOut),
                },
                None => self.recv().await?,
            };
            match frame {
                Frame::Data { map } => return Ok(FetchOutcome::Data(map)),
                Frame::Error { message } => return Err(ConnectionError::RequestFailed(message)),
                Frame::Bye => return Err(FrameError::Closed.into()),
                Frame::Pong | Frame::Ended => continue,
                other => return Err(FrameError::unexpected("data", &other).into()),
            }
        }
    }

    async fn is_alive(&mut self) -> bool {
        if self.send(Frame::Ping).await.is_err() {
            return false;
        }
        let pong = self.skip_until(|f| matches!(f, Frame::Pong));
        matches!(tokio::time::timeout(PING_TIMEOUT, pong).await, Ok(Ok(())))
    }

    async fn end_stream(&mut self) -> Result<(), ConnectionError> {
        self.send(Frame::EndStream).await?;
        let ended = self.skip_until(|f| matches!(f, Frame::Ended));
        match tokio::time::timeout(PING_TIMEOUT, ended).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Protocol("no acknowledgement of end of stream".into())),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(sent) = send_frame(&mut self.framed, &Frame::Bye).await {
            self.bytes += sent;
        }
        if let Err(e) = SinkExt::<String>::close(&mut self.framed).await {
            warn!(client = %self.client_name, error = %e, "error closing data connection");
        }
        self.closed = true;
    }

    fn bytes_transferred(&self) -> u64 {
        self.bytes
    }
}

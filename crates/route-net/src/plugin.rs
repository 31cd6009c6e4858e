//! Request-source leg: the broker's single connection to its gateway.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use route_core::{
    ChannelMap, ConnectionError, FetchTimeout, InboundEvent, RequestId, RequestSource, RequestSourceConnector,
};

use crate::frame::{recv_frame, send_frame, Frame, FrameError, Role};
use crate::{dial, PING_TIMEOUT};

type Transport = Framed<TcpStream, LinesCodec>;

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpRequestSourceConnector;

#[async_trait]
impl RequestSourceConnector for TcpRequestSourceConnector {
    async fn open(&self, address: &str, client_name: &str) -> Result<Arc<dyn RequestSource>, ConnectionError> {
        let dialed = dial(address, Role::Plugin, client_name).await?;
        let (writer, reader) = dialed.framed.split();
        Ok(Arc::new(TcpRequestSource {
            client_name: dialed.client_name,
            server_name: dialed.server_name,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(VecDeque::new()),
            bytes: AtomicU64::new(dialed.bytes),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Reads are driven by the broker loop only; publishes come from any worker.
pub struct TcpRequestSource {
    client_name: String,
    server_name: String,
    reader: tokio::sync::Mutex<SplitStream<Transport>>,
    writer: tokio::sync::Mutex<SplitSink<Transport, String>>,
    /// Events read while waiting for a pong.
    pending: Mutex<VecDeque<InboundEvent>>,
    bytes: AtomicU64,
    closed: AtomicBool,
}

impl TcpRequestSource {
    async fn send(&self, frame: &Frame) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        let mut writer = self.writer.lock().await;
        let sent = send_frame(&mut *writer, frame).await?;
        self.bytes.fetch_add(sent, Ordering::Relaxed);
        Ok(())
    }

    async fn recv(&self, reader: &mut SplitStream<Transport>) -> Result<Frame, ConnectionError> {
        let (frame, read) = recv_frame(reader).await?;
        self.bytes.fetch_add(read, Ordering::Relaxed);
        Ok(frame)
    }
}

/// Map a frame to an inbound event. None for frames the reader skips.
fn to_event(frame: Frame) -> Result<Option<InboundEvent>, ConnectionError> {
    match frame {
        Frame::Inbound { request } => Ok(Some(InboundEvent::Request(request))),
        Frame::EndOfStream { id } => Ok(Some(InboundEvent::EndOfStream(id))),
        Frame::Pong => Ok(None),
        Frame::Error { message } => Err(ConnectionError::RequestFailed(message)),
        Frame::Bye => Err(FrameError::Closed.into()),
        other => Err(FrameError::unexpected("inbound", &other).into()),
    }
}

#[async_trait]
impl RequestSource for TcpRequestSource {
    fn client_name(&self) -> String {
        self.client_name.clone()
    }

    fn server_name(&self) -> String {
        self.server_name.clone()
    }

    async fn next_event(&self, timeout: FetchTimeout) -> Result<InboundEvent, ConnectionError> {
        if let Some(event) = self.pending.lock().pop_front() {
            return Ok(event);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        let deadline = timeout.as_duration().map(|d| tokio::time::Instant::now() + d);
        let mut reader = self.reader.lock().await;
        loop {
            let frame = match deadline {
                Some(at) => match tokio::time::timeout_at(at, self.recv(&mut reader)).await {
                    Ok(frame) => frame?,
                    Err(_) => return Ok(InboundEvent::Timeout),
                },
                None => self.recv(&mut reader).await?,
            };
            if let Some(event) = to_event(frame)? {
                return Ok(event);
            }
        }
    }

    async fn publish(&self, id: &RequestId, map: ChannelMap, streaming: bool) -> Result<(), ConnectionError> {
        self.send(&Frame::Publish {
            id: id.clone(),
            map,
            more: streaming,
        })
        .await
    }

    async fn is_alive(&self) -> bool {
        if self.send(&Frame::Ping).await.is_err() {
            return false;
        }
        let mut reader = self.reader.lock().await;
        let wait_pong = async {
            loop {
                let frame = self.recv(&mut reader).await?;
                match frame {
                    Frame::Pong => return Ok::<_, ConnectionError>(()),
                    Frame::Inbound { .. } | Frame::EndOfStream { .. } => {
                        if let Some(event) = to_event(frame)? {
                            self.pending.lock().push_back(event);
                        }
                    }
                    other => debug!(op = other.op(), "ignoring frame while waiting for pong"),
                }
            }
        };
        matches!(tokio::time::timeout(PING_TIMEOUT, wait_pong).await, Ok(Ok(())))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Ok(sent) = send_frame(&mut *writer, &Frame::Bye).await {
            self.bytes.fetch_add(sent, Ordering::Relaxed);
        }
        if let Err(e) = writer.close().await {
            warn!(client = %self.client_name, error = %e, "error closing request source");
        }
    }

    fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{accept, listener};
    use route_core::{ReferenceMode, Request};
    use std::time::Duration;

    #[tokio::test]
    async fn inbound_requests_and_end_of_stream() {
        let (listener, address) = listener().await;
        let server = tokio::spawn(async move {
            let (mut peer, asked) = accept(&listener, "/GW", None).await;
            assert_eq!(asked, "src");
            peer.send(Frame::Pong).await;
            peer.send(Frame::Inbound {
                request: Request::subscribe(RequestId::from_raw("S"), ["X"]),
            })
            .await;
            peer.send(Frame::EndOfStream { id: RequestId::from_raw("S") }).await;
            peer
        });

        let source = TcpRequestSourceConnector.open(&address, "src").await.unwrap();
        let _peer = server.await.unwrap();
        assert_eq!(source.server_name(), "/GW");

        let InboundEvent::Request(req) = source.next_event(FetchTimeout::Infinite).await.unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.id.as_str(), "S");
        assert_eq!(
            source.next_event(FetchTimeout::Infinite).await.unwrap(),
            InboundEvent::EndOfStream(RequestId::from_raw("S"))
        );
        assert_eq!(
            source.next_event(FetchTimeout::After(Duration::from_millis(20))).await.unwrap(),
            InboundEvent::Timeout
        );
    }

    #[tokio::test]
    async fn publish_and_finish_reach_the_gateway() {
        let (listener, address) = listener().await;
        let server = tokio::spawn(async move {
            let (mut peer, _) = accept(&listener, "/GW", None).await;
            let first = peer.recv().await;
            let last = peer.recv().await;
            (first, last)
        });

        let source = TcpRequestSourceConnector.open(&address, "src").await.unwrap();
        let id = RequestId::from_raw("A");
        let mut map = ChannelMap::with_names(["X"]);
        map.put_string(0, "v");
        source.publish(&id, map.clone(), true).await.unwrap();
        source.finish(&id).await.unwrap();

        let (first, last) = server.await.unwrap();
        assert_eq!(first, Frame::Publish { id: id.clone(), map, more: true });
        assert_eq!(
            last,
            Frame::Publish {
                id,
                map: ChannelMap::new(),
                more: false
            }
        );
        assert!(source.bytes_transferred() > 0);
    }

    #[tokio::test]
    async fn liveness_keeps_events_that_arrive_first() {
        let (listener, address) = listener().await;
        let server = tokio::spawn(async move {
            let (mut peer, _) = accept(&listener, "/GW", None).await;
            assert_eq!(peer.recv().await, Frame::Ping);
            peer.send(Frame::Inbound {
                request: Request::one_shot(RequestId::from_raw("A"), ["X"], ReferenceMode::Newest),
            })
            .await;
            peer.send(Frame::Pong).await;
            peer
        });

        let source = TcpRequestSourceConnector.open(&address, "src").await.unwrap();
        assert!(source.is_alive().await);
        let _peer = server.await.unwrap();
        assert!(matches!(
            source.next_event(FetchTimeout::After(Duration::from_millis(50))).await.unwrap(),
            InboundEvent::Request(r) if r.id.as_str() == "A"
        ));
    }

    #[tokio::test]
    async fn gateway_hangup_is_connection_loss() {
        let (listener, address) = listener().await;
        let server = tokio::spawn(async move { accept(&listener, "/GW", None).await });
        let source = TcpRequestSourceConnector.open(&address, "src").await.unwrap();
        drop(server.await.unwrap());

        let err = source.next_event(FetchTimeout::Infinite).await.unwrap_err();
        assert!(err.is_session_fatal());
        assert!(!source.is_alive().await);
    }

    #[tokio::test]
    async fn close_says_bye_once() {
        let (listener, address) = listener().await;
        let server = tokio::spawn(async move {
            let (mut peer, _) = accept(&listener, "/GW", None).await;
            let bye = peer.recv().await;
            (bye, peer.try_recv().await)
        });

        let source = TcpRequestSourceConnector.open(&address, "src").await.unwrap();
        source.close().await;
        source.close().await;
        assert_eq!(server.await.unwrap(), (Frame::Bye, None));
        assert_eq!(
            source.publish(&RequestId::from_raw("A"), ChannelMap::new(), false).await,
            Err(ConnectionError::Closed)
        );
    }
}

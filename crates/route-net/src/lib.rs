//! JSON-over-TCP transport for both connection roles of the routing broker.
//!
//! Every frame is one JSON object on its own line, tagged by `op`. A client
//! opens with `hello` and the server answers `welcome` with the names it
//! assigned.

pub mod data;
pub mod frame;
pub mod plugin;

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

use route_core::ConnectionError;

pub use data::{TcpDataConnection, TcpDataConnector};
pub use frame::{Frame, FrameError, RequestMode, Role};
pub use plugin::{TcpRequestSource, TcpRequestSourceConnector};

/// Bound on connect plus handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on a liveness round trip.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// An open, greeted connection.
pub(crate) struct Dialed {
    pub framed: Framed<TcpStream, LinesCodec>,
    pub client_name: String,
    pub server_name: String,
    pub bytes: u64,
}

/// Connect to `address` and exchange `hello`/`welcome`.
pub(crate) async fn dial(address: &str, role: Role, name: &str) -> Result<Dialed, ConnectionError> {
    match tokio::time::timeout(CONNECT_TIMEOUT, handshake(address, role, name)).await {
        Ok(Ok(dialed)) => {
            debug!(address, ?role, client = %dialed.client_name, server = %dialed.server_name, "connected");
            Ok(dialed)
        }
        Ok(Err(ConnectionError::ConnectionLost(reason) | ConnectionError::Protocol(reason))) => {
            Err(ConnectionError::connect(address, reason))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ConnectionError::connect(address, "handshake timed out")),
    }
}

async fn handshake(address: &str, role: Role, name: &str) -> Result<Dialed, ConnectionError> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(frame::MAX_FRAME_LEN));
    let hello = Frame::Hello {
        role,
        name: name.to_string(),
    };
    let mut bytes = frame::send_frame(&mut framed, &hello).await?;
    let (reply, read) = frame::recv_frame(&mut framed).await?;
    bytes += read;
    match reply {
        Frame::Welcome {
            client_name,
            server_name,
        } => Ok(Dialed {
            framed,
            client_name,
            server_name,
            bytes,
        }),
        Frame::Error { message } => Err(ConnectionError::connect(address, message)),
        other => Err(FrameError::unexpected("welcome", &other).into()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process peer for transport tests.

    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::{Framed, LinesCodec};

    use crate::frame::{recv_frame, send_frame, Frame};

    pub struct Peer {
        pub framed: Framed<TcpStream, LinesCodec>,
    }

    impl Peer {
        pub async fn send(&mut self, frame: Frame) {
            send_frame(&mut self.framed, &frame).await.unwrap();
        }

        pub async fn recv(&mut self) -> Frame {
            recv_frame(&mut self.framed).await.unwrap().0
        }

        /// Next frame, or None once the client hung up.
        pub async fn try_recv(&mut self) -> Option<Frame> {
            recv_frame(&mut self.framed).await.ok().map(|(f, _)| f)
        }
    }

    pub async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        (listener, address)
    }

    /// Accept one client and greet it, optionally under another name.
    pub async fn accept(listener: &TcpListener, server_name: &str, rename: Option<&str>) -> (Peer, String) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut peer = Peer {
            framed: Framed::new(stream, LinesCodec::new()),
        };
        let Frame::Hello { name, .. } = peer.recv().await else {
            panic!("expected hello");
        };
        let client_name = rename.map(str::to_string).unwrap_or(name.clone());
        peer.send(Frame::Welcome {
            client_name,
            server_name: server_name.to_string(),
        })
        .await;
        (peer, name)
    }
}

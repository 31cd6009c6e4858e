//! Line-delimited JSON frames shared by both connection roles.

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::codec::LinesCodecError;

use route_core::{ChannelMap, ConnectionError, Request, RequestId, RequestWindow};

/// Longest accepted frame, in bytes.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Which leg a connecting client plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Fetches data from the remote source.
    Sink,
    /// Receives requests from the gateway and publishes answers.
    Plugin,
}

/// How a data request is registered upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    Request,
    Subscribe,
    Monitor,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Hello { role: Role, name: String },
    /// Server reply to `Hello`; the server may rename the client.
    Welcome { client_name: String, server_name: String },
    Request { map: ChannelMap, window: RequestWindow, mode: RequestMode },
    Data { map: ChannelMap },
    EndStream,
    /// Acknowledges `EndStream`; no `Data` for the old request follows.
    Ended,
    Inbound { request: Request },
    EndOfStream { id: RequestId },
    Publish { id: RequestId, map: ChannelMap, more: bool },
    Ping,
    Pong,
    Error { message: String },
    Bye,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("codec error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected frame: expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: String },

    #[error("peer closed the connection")]
    Closed,
}

impl FrameError {
    pub fn unexpected(expected: &'static str, got: &Frame) -> Self {
        Self::Unexpected {
            expected,
            got: got.op().to_string(),
        }
    }
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Codec(LinesCodecError::Io(io)) => io.into(),
            FrameError::Closed => ConnectionError::ConnectionLost(e.to_string()),
            FrameError::Codec(LinesCodecError::MaxLineLengthExceeded) | FrameError::Json(_) => {
                ConnectionError::Protocol(e.to_string())
            }
            FrameError::Unexpected { .. } => ConnectionError::Protocol(e.to_string()),
        }
    }
}

impl Frame {
    /// Wire name of this frame's `op` tag.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Welcome { .. } => "welcome",
            Self::Request { .. } => "request",
            Self::Data { .. } => "data",
            Self::EndStream => "end_stream",
            Self::Ended => "ended",
            Self::Inbound { .. } => "inbound",
            Self::EndOfStream { .. } => "end_of_stream",
            Self::Publish { .. } => "publish",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
            Self::Bye => "bye",
        }
    }
}

/// Write one frame. Returns the bytes put on the wire.
pub async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<u64, FrameError>
where
    S: Sink<String, Error = LinesCodecError> + Unpin,
{
    let line = serde_json::to_string(frame)?;
    let len = line.len() as u64 + 1;
    sink.send(line).await?;
    Ok(len)
}

/// Read one frame and its size on the wire. `Closed` at end of stream.
pub async fn recv_frame<S>(stream: &mut S) -> Result<(Frame, u64), FrameError>
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    match stream.next().await {
        Some(line) => {
            let line = line?;
            let frame = serde_json::from_str(&line)?;
            Ok((frame, line.len() as u64 + 1))
        }
        None => Err(FrameError::Closed),
    }
}

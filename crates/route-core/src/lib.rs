//! Core types shared by the routing broker and its transports.

pub mod channel;
pub mod connection;
pub mod control;
pub mod errors;
pub mod ids;
pub mod mock;
pub mod namespace;
pub mod request;

pub use channel::{Channel, ChannelMap};
pub use connection::{
    DataConnection, DataConnector, FetchOutcome, FetchTimeout, InboundEvent, RequestSource,
    RequestSourceConnector,
};
pub use control::{ControlCommand, ControlMessage};
pub use errors::{ConnectionError, ControlError};
pub use ids::{RequestId, SessionId};
pub use namespace::{RemoteNamespace, PROBE_CLIENT_NAME};
pub use request::{ReferenceMode, Request, RequestKind, RequestWindow};

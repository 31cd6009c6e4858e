//! Request-routing broker: accepts data requests from a gateway, serves each
//! one against a remote data source on a pooled connection, and republishes
//! the results under local names.

pub mod backoff;
pub mod broker;
pub mod config;
pub mod error;
pub mod pool;
pub mod registry;
pub mod reporter;
pub mod settings;
pub mod worker;

pub use backoff::ReconnectPolicy;
pub use broker::{Broker, SessionEnd, TERMINATE_ACK};
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use pool::{Worker, WorkerPool};
pub use registry::{ActiveRequests, RequestHandle};
pub use reporter::{open_recorder, MetricsReporter};
pub use settings::{load_settings, RouteSettings};
pub use worker::{run_request, SessionContext, WorkerOutcome};

//! Top-level dispatch loop.
//!
//! Per session: `Connecting -> Serving -> (Degraded -> Connecting) | Terminated`.
//! Events on the request source are handled strictly in arrival order; each
//! new request runs in its own task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use route_core::namespace::route_client_name;
use route_core::{
    ChannelMap, ConnectionError, ControlCommand, ControlMessage, DataConnector, InboundEvent,
    RemoteNamespace, Request, RequestId, RequestSource, RequestSourceConnector, SessionId, PROBE_CLIENT_NAME,
};
use route_telemetry::MetricsRecorder;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::pool::WorkerPool;
use crate::registry::ActiveRequests;
use crate::worker::{run_request, SessionContext};

/// Answer to a self-addressed terminate command.
pub const TERMINATE_ACK: &str = "RoutingPlugIn terminated";

/// Why a serving session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Terminate command addressed to this broker.
    Terminated,
    /// Process shutdown requested.
    Shutdown,
    /// Request-source connection failed; in-flight streams are lost.
    Reconnect(ConnectionError),
}

/// Classification of one inbound request.
enum Inbound {
    Registration,
    Control(ControlMessage),
    MalformedControl(String),
    Data,
}

struct Session {
    id: SessionId,
    ctx: Arc<SessionContext>,
    client_name: String,
    identity: String,
    degraded: bool,
    last_bytes: u64,
}

pub struct Broker {
    config: BrokerConfig,
    sources: Arc<dyn RequestSourceConnector>,
    sinks: Arc<dyn DataConnector>,
    pool: Arc<WorkerPool>,
    registry: Arc<ActiveRequests>,
    metrics: Arc<MetricsRecorder>,
    shutdown: CancellationToken,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        sources: Arc<dyn RequestSourceConnector>,
        sinks: Arc<dyn DataConnector>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(
            sinks.clone(),
            config.sink_address.clone(),
            config.max_threads,
            metrics.clone(),
        ));
        Self {
            config,
            sources,
            sinks,
            pool,
            registry: Arc::new(ActiveRequests::new()),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the broker at its next suspension point.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> &Arc<ActiveRequests> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Connect, serve, and reconnect until terminated, shut down, or out of
    /// connection attempts.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let policy = &self.config.reconnect;
        let mut failures: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.connect().await {
                Ok(session) => {
                    failures = 0;
                    match self.serve(session).await {
                        SessionEnd::Terminated | SessionEnd::Shutdown => break,
                        SessionEnd::Reconnect(e) => {
                            warn!(error = %e, "request-source connection lost, reconnecting; streams will be lost");
                            self.metrics.counter_inc("route.sessions.reconnects", &[], 1);
                        }
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(attempt = failures, error = %e, kind = e.error_kind(), "connect failed");
                }
            }

            if policy.exhausted(failures) {
                error!(attempts = failures, "giving up on connecting");
                self.pool.close_all().await;
                return Err(BrokerError::ConnectExhausted { attempts: failures });
            }

            let delay = policy.delay_for(failures.max(1));
            debug!(attempt = failures, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.registry.cancel_all();
        self.pool.close_all().await;
        info!("broker stopped");
        Ok(())
    }

    /// Open both legs of a session and derive its naming.
    async fn connect(&self) -> Result<Session, ConnectionError> {
        let stale = self.registry.cancel_all();
        if stale > 0 {
            debug!(cancelled = stale, "cleared requests from previous session");
        }

        let mut probe = self.sinks.open(&self.config.sink_address, PROBE_CLIENT_NAME).await?;
        let remote_source = probe.server_name().to_string();
        probe.close().await;

        let namespace = RemoteNamespace::new(&remote_source);
        let wanted = self
            .config
            .client_name
            .clone()
            .unwrap_or_else(|| namespace.default_client_name().to_string());

        let source = self.sources.open(&self.config.plugin_address, &wanted).await?;
        let client_name = source.client_name();
        let gateway = source.server_name();
        self.pool.set_client_name(route_client_name(&gateway));
        let identity = format!("{gateway}/{client_name}");
        let id = SessionId::new();

        info!(
            session = %id,
            client = %identity,
            plugin_address = %self.config.plugin_address,
            sink_address = %self.config.sink_address,
            remote_source = %namespace.prefix(),
            "routing session connected"
        );
        self.metrics.counter_inc("route.sessions.connected", &[], 1);
        self.metrics.gauge_set(
            "route.sessions.info",
            &[
                ("plugin", self.config.plugin_address.as_str()),
                ("sink", self.config.sink_address.as_str()),
                ("source", namespace.prefix()),
            ],
            1.0,
        );

        let last_bytes = source.bytes_transferred();
        let ctx = Arc::new(SessionContext {
            source,
            namespace,
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            timeout: self.config.timeout,
            refresh_after: self.config.refresh_threshold(),
            flushed: Arc::new(AtomicBool::new(false)),
        });
        Ok(Session {
            id,
            ctx,
            client_name,
            identity,
            degraded: false,
            last_bytes,
        })
    }

    async fn serve(&self, mut session: Session) -> SessionEnd {
        let source = session.ctx.source.clone();

        loop {
            if session.degraded {
                if !source.is_alive().await {
                    let lost = ConnectionError::ConnectionLost("request source failed liveness check".into());
                    return self.teardown(&session, SessionEnd::Reconnect(lost)).await;
                }
                debug!(client = %session.identity, "request source verified alive");
                session.degraded = false;
            }

            session.ctx.flushed.store(false, Ordering::SeqCst);
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return self.teardown(&session, SessionEnd::Shutdown).await,
                next = source.next_event(self.config.timeout) => next,
            };
            let event = match next {
                Ok(event) => event,
                Err(e) => return self.teardown(&session, SessionEnd::Reconnect(e)).await,
            };

            let total = source.bytes_transferred();
            self.metrics.counter_inc(
                "route.bytes.transferred",
                &[("leg", "plugin")],
                total.saturating_sub(session.last_bytes),
            );
            session.last_bytes = total;

            if let Some(threshold) = self.config.stale_threshold() {
                self.pool.sweep_stale(Instant::now(), threshold).await;
            }

            match event {
                InboundEvent::Timeout => {
                    // Streaming publishes keep the connection alive on their own.
                    if !session.ctx.flushed.load(Ordering::SeqCst) {
                        debug!(client = %session.identity, "ping with no traffic, verifying connection");
                        session.degraded = true;
                    }
                }
                InboundEvent::EndOfStream(id) => {
                    if self.registry.cancel(&id, true) {
                        debug!(request_id = %id, "end of stream, cancelling worker");
                    } else {
                        info!(request_id = %id, "end of stream with no matching request");
                    }
                }
                InboundEvent::Request(request) => {
                    if let Some(end) = self.handle_request(&session, request).await {
                        return self.teardown(&session, end).await;
                    }
                }
            }
        }
    }

    async fn handle_request(&self, session: &Session, request: Request) -> Option<SessionEnd> {
        let source = &session.ctx.source;
        let answered = match classify(&request, &session.client_name) {
            Inbound::Data => {
                self.dispatch(session, request);
                return None;
            }
            Inbound::Registration => {
                self.metrics.counter_inc("route.control.messages", &[("type", "registration")], 1);
                let mut map = ChannelMap::with_names([session.client_name.as_str()]);
                map.put_data(0, vec![0u8], Some("application/octet-stream"));
                source.publish(&request.id, map, false).await
            }
            Inbound::Control(msg) if msg.id == session.client_name => {
                self.metrics.counter_inc("route.control.messages", &[("type", "shutdown")], 1);
                info!(request_id = %request.id, client = %session.identity, "received shutdown message");
                let mut map = ChannelMap::with_names([session.client_name.as_str()]);
                map.put_string(0, TERMINATE_ACK);
                if let Err(e) = source.publish(&request.id, map, false).await {
                    warn!(error = %e, "failed to acknowledge shutdown");
                }
                return Some(SessionEnd::Terminated);
            }
            Inbound::Control(msg) => {
                self.metrics.counter_inc("route.control.messages", &[("type", "terminate")], 1);
                let target = RequestId::from_raw(msg.id.as_str());
                match msg.command {
                    ControlCommand::Terminate if self.registry.cancel(&target, false) => {
                        info!(request_id = %target, "terminating request on command");
                    }
                    ControlCommand::Terminate => {
                        warn!(request_id = %target, "unknown request or command, ignored");
                    }
                }
                source.finish(&request.id).await
            }
            Inbound::MalformedControl(reason) => {
                self.metrics.counter_inc("route.control.messages", &[("type", "malformed")], 1);
                warn!(request_id = %request.id, reason = %reason, "control message ignored");
                source.finish(&request.id).await
            }
        };

        match answered {
            Err(e) if e.is_session_fatal() => Some(SessionEnd::Reconnect(e)),
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "failed to answer control request");
                None
            }
            Ok(()) => None,
        }
    }

    fn dispatch(&self, session: &Session, request: Request) {
        let handle = self.registry.register(request.id.clone(), request.kind);
        self.metrics.counter_inc("route.requests.dispatched", &[], 1);
        debug!(request_id = %request.id, kind = ?request.kind, "dispatching request");
        tokio::spawn(run_request(session.ctx.clone(), request, handle));
    }

    /// Cancel all workers and close the request source.
    async fn teardown(&self, session: &Session, end: SessionEnd) -> SessionEnd {
        let cancelled = self.registry.cancel_all();
        info!(session = %session.id, client = %session.identity, cancelled, reason = ?end, "closing routing session");
        session.ctx.source.close().await;
        end
    }
}

fn classify(request: &Request, client_name: &str) -> Inbound {
    if request.channels.first_name() != Some(client_name) {
        return Inbound::Data;
    }
    if request.is_registration() {
        return Inbound::Registration;
    }
    let payload = request.channels.data_as_str(0).unwrap_or_default();
    match ControlMessage::parse(payload) {
        Ok(msg) => Inbound::Control(msg),
        Err(e) => Inbound::MalformedControl(e.to_string()),
    }
}

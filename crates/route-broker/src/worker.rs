//! Per-request execution: map, request, fetch, republish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use route_core::{
    ConnectionError, FetchOutcome, FetchTimeout, RemoteNamespace, Request, RequestKind,
    RequestSource, RequestWindow,
};
use route_telemetry::MetricsRecorder;

use crate::pool::{Worker, WorkerPool};
use crate::registry::{ActiveRequests, RequestHandle};

/// Everything a worker needs from the session that dispatched it.
pub struct SessionContext {
    pub source: Arc<dyn RequestSource>,
    pub namespace: RemoteNamespace,
    pub pool: Arc<WorkerPool>,
    pub registry: Arc<ActiveRequests>,
    pub metrics: Arc<MetricsRecorder>,
    pub timeout: FetchTimeout,
    /// Workers idle longer than this are probed before use.
    pub refresh_after: Option<Duration>,
    /// Set on every successful republish; cleared before each inbound fetch.
    pub flushed: Arc<AtomicBool>,
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Completed { batches: usize },
    Cancelled { batches: usize },
    Aborted { batches: usize, error: ConnectionError },
}

impl WorkerOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Cancelled { .. } => "cancelled",
            Self::Aborted { .. } => "aborted",
        }
    }
}

enum Served {
    Completed,
    Cancelled,
}

/// Serve one request to completion. Acquires its worker from the pool and
/// always leaves the registry without this request's entry.
pub async fn run_request(ctx: Arc<SessionContext>, request: Request, handle: Arc<RequestHandle>) -> WorkerOutcome {
    ctx.metrics.gauge_inc("route.requests.active", &[], 1.0);
    let outcome = match ctx.pool.acquire().await {
        Ok(worker) => execute(&ctx, worker, &request, &handle).await,
        Err(error) => {
            warn!(request_id = %request.id, error = %error, "no data-source connection for request");
            ctx.registry.remove(&handle);
            end_response(&ctx, &request, &handle).await;
            WorkerOutcome::Aborted { batches: 0, error }
        }
    };

    let elapsed_ms = handle.started_at().elapsed().as_secs_f64() * 1000.0;
    ctx.metrics.gauge_inc("route.requests.active", &[], -1.0);
    ctx.metrics
        .counter_inc(&format!("route.requests.{}", outcome.label()), &[("kind", kind_label(request.kind))], 1);
    ctx.metrics.histogram_observe("route.request.duration_ms", &[], elapsed_ms);
    outcome
}

async fn execute(
    ctx: &SessionContext,
    mut worker: Worker,
    request: &Request,
    handle: &Arc<RequestHandle>,
) -> WorkerOutcome {
    let mut batches = 0;
    let result = serve(ctx, &mut worker, request, handle, &mut batches).await;

    match result {
        Ok(Served::Completed) => {
            debug!(request_id = %request.id, worker = worker.id(), batches, "request completed");
            ctx.registry.remove(handle);
            ctx.pool.release(worker).await;
            WorkerOutcome::Completed { batches }
        }
        Ok(Served::Cancelled) => {
            info!(request_id = %request.id, worker = worker.id(), batches, at_eos = handle.at_eos(), "request cancelled");
            ctx.registry.remove(handle);
            let clean = match worker.connection().end_stream().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(request_id = %request.id, error = %e, "failed to end upstream stream");
                    false
                }
            };
            end_response(ctx, request, handle).await;
            if clean {
                ctx.pool.release(worker).await;
            } else {
                ctx.pool.discard(worker).await;
            }
            WorkerOutcome::Cancelled { batches }
        }
        Err(error) => {
            warn!(
                request_id = %request.id,
                worker = worker.id(),
                batches,
                at_eos = handle.at_eos(),
                error = %error,
                kind = error.error_kind(),
                "request aborted"
            );
            ctx.registry.remove(handle);
            end_response(ctx, request, handle).await;
            ctx.pool.discard(worker).await;
            WorkerOutcome::Aborted { batches, error }
        }
    }
}

async fn serve(
    ctx: &SessionContext,
    worker: &mut Worker,
    request: &Request,
    handle: &RequestHandle,
    batches: &mut usize,
) -> Result<Served, ConnectionError> {
    if let Some(threshold) = ctx.refresh_after {
        ctx.pool.refresh(worker, threshold).await?;
    }

    let remote = ctx.namespace.to_remote(request);
    let window = request.window();
    let stream_window = if request.duration == 0.0 {
        RequestWindow::by_frame()
    } else {
        window
    };
    match request.kind {
        RequestKind::OneShot => worker.connection().request(&remote, window).await?,
        RequestKind::Subscribe => worker.connection().subscribe(&remote, stream_window).await?,
        RequestKind::Monitor => worker.connection().monitor(&remote, stream_window).await?,
    }
    let streaming = request.kind.is_streaming();

    loop {
        if handle.is_cancelled() {
            return Ok(Served::Cancelled);
        }

        let before = worker.connection().bytes_transferred();
        let batch = match worker.connection().fetch(ctx.timeout).await? {
            FetchOutcome::TimedOut => continue,
            FetchOutcome::Data(batch) => batch,
        };
        let after = worker.connection().bytes_transferred();

        let local = ctx.namespace.to_local(&batch);
        ctx.source.publish(&request.id, local.map, streaming).await?;
        ctx.flushed.store(true, Ordering::SeqCst);
        worker.touch();
        *batches += 1;
        ctx.metrics.counter_inc(
            "route.bytes.transferred",
            &[("leg", "sink")],
            after.saturating_sub(before),
        );

        if !streaming {
            return Ok(Served::Completed);
        }
        if handle.is_cancelled() {
            return Ok(Served::Cancelled);
        }
    }
}

/// Best-effort terminal answer, skipped when the client already closed.
async fn end_response(ctx: &SessionContext, request: &Request, handle: &RequestHandle) {
    if handle.at_eos() {
        return;
    }
    if let Err(e) = ctx.source.finish(&request.id).await {
        warn!(request_id = %request.id, error = %e, "failed to end response stream");
    }
}

fn kind_label(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::OneShot => "one_shot",
        RequestKind::Subscribe => "subscribe",
        RequestKind::Monitor => "monitor",
    }
}

//! Periodic metrics snapshots.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use route_telemetry::MetricsRecorder;

use crate::error::BrokerError;
use crate::settings::MetricsSettings;

/// File name of the on-disk metrics archive.
pub const ARCHIVE_FILE: &str = "route-metrics.db";

/// Open the recorder described by `settings`: on disk under `data_dir` when
/// `archive > 0`, in memory otherwise.
pub fn open_recorder(settings: &MetricsSettings, data_dir: &Path) -> Result<Arc<MetricsRecorder>, BrokerError> {
    let recorder = if settings.archive > 0 {
        let path = data_dir.join(ARCHIVE_FILE);
        info!(path = %path.display(), "archiving metrics to disk");
        MetricsRecorder::new(&path)
    } else {
        MetricsRecorder::in_memory()
    };
    recorder
        .map(Arc::new)
        .map_err(|e| BrokerError::Internal(format!("failed to open metrics store: {e}")))
}

pub struct MetricsReporter {
    recorder: Arc<MetricsRecorder>,
    interval: Duration,
    cache: u64,
}

impl MetricsReporter {
    pub fn new(recorder: Arc<MetricsRecorder>, settings: &MetricsSettings) -> Self {
        Self {
            recorder,
            interval: Duration::from_secs(settings.interval_secs),
            cache: settings.cache,
        }
    }

    /// Snapshot once, then trim to the retained row count.
    pub fn report_once(&self) -> Result<usize, BrokerError> {
        let written = self
            .recorder
            .snapshot()
            .map_err(|e| BrokerError::Internal(format!("metrics snapshot failed: {e}")))?;
        if self.cache > 0 {
            let pruned = self
                .recorder
                .prune_to(self.cache)
                .map_err(|e| BrokerError::Internal(format!("metrics prune failed: {e}")))?;
            if pruned > 0 {
                debug!(pruned, "pruned old metric rows");
            }
        }
        Ok(written)
    }

    /// Report every interval until `shutdown`, then take a final snapshot.
    /// A zero interval disables reporting.
    pub async fn run(self, shutdown: CancellationToken) {
        if self.interval.is_zero() {
            debug!("metrics reporting disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.report_once() {
                        warn!(error = %e, "metrics report failed");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        if let Err(e) = self.report_once() {
            warn!(error = %e, "final metrics report failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use route_telemetry::MetricsQuery;

    fn settings(interval_secs: u64, cache: u64, archive: u64) -> MetricsSettings {
        MetricsSettings {
            interval_secs,
            cache,
            archive,
        }
    }

    #[test]
    fn archive_selects_on_disk_store() {
        let dir = std::env::temp_dir().join(format!("route-test-reporter-{}", uuid::Uuid::now_v7()));
        let recorder = open_recorder(&settings(10, 100, 1), &dir).unwrap();
        recorder.counter_inc("route.requests.dispatched", &[], 1);
        recorder.snapshot().unwrap();
        assert!(dir.join(ARCHIVE_FILE).exists());
    }

    #[test]
    fn no_archive_stays_in_memory() {
        let dir = std::env::temp_dir().join(format!("route-test-reporter-{}", uuid::Uuid::now_v7()));
        open_recorder(&settings(10, 100, 0), &dir).unwrap();
        assert!(!dir.join(ARCHIVE_FILE).exists());
    }

    #[test]
    fn report_once_trims_to_cache() {
        let recorder = Arc::new(MetricsRecorder::in_memory().unwrap());
        recorder.counter_inc("a", &[], 1);
        recorder.counter_inc("b", &[], 1);
        let reporter = MetricsReporter::new(recorder.clone(), &settings(1, 3, 0));
        for _ in 0..4 {
            assert_eq!(reporter.report_once().unwrap(), 2);
        }
        assert_eq!(recorder.row_count().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_on_interval_and_at_shutdown() {
        let recorder = Arc::new(MetricsRecorder::in_memory().unwrap());
        recorder.gauge_set("route.pool.idle", &[], 2.0);
        let reporter = MetricsReporter::new(recorder.clone(), &settings(10, 0, 0));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reporter.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.cancel();
        task.await.unwrap();

        let rows = recorder.query(&MetricsQuery::default()).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn zero_interval_disables_reporting() {
        let recorder = Arc::new(MetricsRecorder::in_memory().unwrap());
        recorder.counter_inc("c", &[], 1);
        let reporter = MetricsReporter::new(recorder.clone(), &settings(0, 0, 0));
        reporter.run(CancellationToken::new()).await;
        assert_eq!(recorder.row_count().unwrap(), 0);
    }
}

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "gauge" => Self::Gauge,
            "histogram" => Self::Histogram,
            _ => Self::Counter,
        }
    }
}

/// One persisted metric row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Default)]
struct Counter(AtomicU64);

/// f64 stored as raw bits.
#[derive(Default)]
struct Gauge(AtomicU64);

impl Gauge {
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }
}

#[derive(Default)]
struct Histogram(Mutex<Vec<f64>>);

impl Histogram {
    fn summary(&self) -> HistogramSummary {
        let mut obs = self.0.lock().clone();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(f64::total_cmp);
        let pick = |q: f64| obs[((obs.len() as f64 * q) as usize).min(obs.len() - 1)];
        HistogramSummary {
            count: obs.len() as u64,
            sum: obs.iter().sum(),
            min: obs[0],
            max: obs[obs.len() - 1],
            p50: pick(0.5),
            p95: pick(0.95),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
}

/// Name plus label pairs sorted by key.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: HashMap<&str, &str> = self
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// Map of live metrics of one kind; read lock on the hot path.
struct Family<T>(RwLock<HashMap<MetricKey, T>>);

impl<T: Default> Family<T> {
    fn new() -> Self {
        Self(RwLock::new(HashMap::new()))
    }

    fn with<R>(&self, name: &str, labels: &[(&str, &str)], f: impl Fn(&T) -> R) -> R {
        let key = MetricKey::new(name, labels);
        if let Some(m) = self.0.read().get(&key) {
            return f(m);
        }
        let mut map = self.0.write();
        f(map.entry(key).or_default())
    }

    fn peek<R>(&self, name: &str, labels: &[(&str, &str)], f: impl Fn(&T) -> R) -> Option<R> {
        self.0.read().get(&MetricKey::new(name, labels)).map(f)
    }
}

/// Thread-safe metrics recorder with SQLite snapshots.
pub struct MetricsRecorder {
    counters: Family<Counter>,
    gauges: Family<Gauge>,
    histograms: Family<Histogram>,
    db: Mutex<Connection>,
}

impl MetricsRecorder {
    /// Recorder persisting snapshots to a database file.
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    /// Recorder whose snapshots live only as long as the process.
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS route_metrics (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_route_metrics_name ON route_metrics(name, timestamp);",
        )?;
        Ok(Self {
            counters: Family::new(),
            gauges: Family::new(),
            histograms: Family::new(),
            db: Mutex::new(conn),
        })
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters.with(name, labels, |c| {
            c.0.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .peek(name, labels, |c| c.0.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges.with(name, labels, |g| g.set(value));
    }

    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        self.gauges.with(name, labels, |g| g.add(delta));
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges.peek(name, labels, Gauge::get).unwrap_or(0.0)
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms.with(name, labels, |h| h.0.lock().push(value));
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .peek(name, labels, Histogram::summary)
            .unwrap_or_default()
    }

    /// Write the current value of every metric as one row each. Histograms
    /// persist their p50. Returns the number of rows written.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let mut rows: Vec<(String, Option<String>, f64, MetricType)> = Vec::new();
        for (key, c) in self.counters.0.read().iter() {
            let v = c.0.load(Ordering::Relaxed) as f64;
            rows.push((key.name.clone(), key.labels_json(), v, MetricType::Counter));
        }
        for (key, g) in self.gauges.0.read().iter() {
            rows.push((key.name.clone(), key.labels_json(), g.get(), MetricType::Gauge));
        }
        for (key, h) in self.histograms.0.read().iter() {
            let p50 = h.summary().p50;
            rows.push((key.name.clone(), key.labels_json(), p50, MetricType::Histogram));
        }

        let mut db = self.db.lock();
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO route_metrics (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (name, labels, value, kind) in &rows {
                stmt.execute(rusqlite::params![now, name, value, labels, kind.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Newest rows first.
    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let db = self.db.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, name, value, labels, metric_type FROM route_metrics WHERE 1=1",
        );
        let mut params: Vec<&dyn rusqlite::types::ToSql> = Vec::new();
        if let Some(name) = &q.name {
            params.push(name);
            sql.push_str(&format!(" AND name = ?{}", params.len()));
        }
        if let Some(since) = &q.since {
            params.push(since);
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), |row| {
            let kind: String = row.get(5)?;
            Ok(MetricsSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                labels: row.get(4)?,
                metric_type: MetricType::parse(&kind),
            })
        })?;
        rows.collect()
    }

    /// Keep only the newest `max_rows` rows. Returns how many were removed.
    pub fn prune_to(&self, max_rows: u64) -> Result<usize, rusqlite::Error> {
        let db = self.db.lock();
        db.execute(
            "DELETE FROM route_metrics WHERE id NOT IN
                 (SELECT id FROM route_metrics ORDER BY id DESC LIMIT ?1)",
            rusqlite::params![max_rows as i64],
        )
    }

    pub fn row_count(&self) -> Result<u64, rusqlite::Error> {
        let db = self.db.lock();
        db.query_row("SELECT COUNT(*) FROM route_metrics", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("route-test-metrics-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("metrics.db")
    }

    #[test]
    fn counters_are_keyed_by_labels() {
        let m = MetricsRecorder::in_memory().unwrap();
        m.counter_inc("route.requests.completed", &[("kind", "one_shot")], 1);
        m.counter_inc("route.requests.completed", &[("kind", "one_shot")], 2);
        m.counter_inc("route.requests.completed", &[("kind", "subscribe")], 1);

        assert_eq!(m.counter_get("route.requests.completed", &[("kind", "one_shot")]), 3);
        assert_eq!(m.counter_get("route.requests.completed", &[("kind", "subscribe")]), 1);
        assert_eq!(m.counter_get("route.requests.completed", &[]), 0);
    }

    #[test]
    fn label_order_does_not_matter() {
        let m = MetricsRecorder::in_memory().unwrap();
        m.counter_inc("t", &[("a", "1"), ("b", "2")], 1);
        m.counter_inc("t", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(m.counter_get("t", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn gauges_go_both_ways() {
        let m = MetricsRecorder::in_memory().unwrap();
        m.gauge_set("route.pool.idle", &[], 4.0);
        m.gauge_inc("route.pool.idle", &[], -1.5);
        assert_eq!(m.gauge_get("route.pool.idle", &[]), 2.5);
        m.gauge_inc("route.requests.active", &[], 1.0);
        assert_eq!(m.gauge_get("route.requests.active", &[]), 1.0);
    }

    #[test]
    fn histogram_summary_statistics() {
        let m = MetricsRecorder::in_memory().unwrap();
        for v in 1..=10 {
            m.histogram_observe("route.request.duration_ms", &[], v as f64 * 10.0);
        }
        let s = m.histogram_summary("route.request.duration_ms", &[]);
        assert_eq!(s.count, 10);
        assert_eq!(s.sum, 550.0);
        assert_eq!(s.min, 10.0);
        assert_eq!(s.max, 100.0);
        assert_eq!(s.p50, 60.0);
        assert_eq!(s.p95, 100.0);
        assert_eq!(m.histogram_summary("missing", &[]), HistogramSummary::default());
    }

    #[test]
    fn snapshot_and_query_on_disk() {
        let m = MetricsRecorder::new(&temp_db()).unwrap();
        m.counter_inc("route.bytes.transferred", &[("leg", "sink")], 42);
        m.gauge_set("route.pool.idle", &[], 3.0);
        m.histogram_observe("route.request.duration_ms", &[], 7.0);
        assert_eq!(m.snapshot().unwrap(), 3);

        let rows = m
            .query(&MetricsQuery {
                name: Some("route.bytes.transferred".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 42.0);
        assert_eq!(rows[0].metric_type, MetricType::Counter);
        assert!(rows[0].labels.as_deref().unwrap().contains("sink"));
    }

    #[test]
    fn since_filter_excludes_older_rows() {
        let m = MetricsRecorder::in_memory().unwrap();
        m.counter_inc("c", &[], 1);
        m.snapshot().unwrap();
        let rows = m
            .query(&MetricsQuery {
                since: Some("2099-01-01T00:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn prune_keeps_newest_rows() {
        let m = MetricsRecorder::in_memory().unwrap();
        m.counter_inc("c", &[], 1);
        for _ in 0..5 {
            m.snapshot().unwrap();
        }
        assert_eq!(m.row_count().unwrap(), 5);
        assert_eq!(m.prune_to(2).unwrap(), 3);
        assert_eq!(m.row_count().unwrap(), 2);
    }

    #[test]
    fn concurrent_increments() {
        use std::sync::Arc;

        let m = Arc::new(MetricsRecorder::in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        m.counter_inc("route.requests.dispatched", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.counter_get("route.requests.dispatched", &[]), 4000);
    }
}

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

/// A metric value at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
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

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric key: name + sorted labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
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

/// f64 stored as bits so gauges can be set lock-free.
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }

    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

fn summarize(observations: &mut [f64]) -> HistogramSummary {
    if observations.is_empty() {
        return HistogramSummary::default();
    }
    observations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let count = observations.len();
    let pick = |q: f64| observations[((count as f64 * q) as usize).min(count - 1)];
    HistogramSummary {
        count: count as u64,
        sum: observations.iter().sum(),
        p50: pick(0.5),
        p95: pick(0.95),
        p99: pick(0.99),
    }
}

/// Thread-safe metrics recorder, optionally snapshotting into SQLite.
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    gauges: RwLock<HashMap<MetricKey, AtomicF64>>,
    histograms: RwLock<HashMap<MetricKey, Mutex<Vec<f64>>>>,
    db: Option<Mutex<Connection>>,
}

impl MetricsRecorder {
    pub fn in_memory() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    pub fn with_db(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            db: Some(Mutex::new(conn)),
            ..Self::in_memory()
        })
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_gauge(name, labels, |g| g.set(value));
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, |g| g.get())
    }

    fn with_gauge(&self, name: &str, labels: &[(&str, &str)], f: impl FnOnce(&AtomicF64)) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            f(g);
            return;
        }
        f(self.gauges.write().entry(key).or_insert_with(AtomicF64::new));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.lock().push(value);
            return;
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .push(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(|h| summarize(&mut h.lock()))
            .unwrap_or_default()
    }

    /// Current values of every metric. Histograms report their p50.
    pub fn current(&self) -> Vec<MetricsSnapshot> {
        let now = Utc::now().to_rfc3339();
        let mut out = Vec::new();
        let mut push = |key: &MetricKey, value: f64, metric_type: MetricType| {
            out.push(MetricsSnapshot {
                timestamp: now.clone(),
                name: key.name.clone(),
                value,
                labels: key.labels_json(),
                metric_type,
            });
        };
        for (key, c) in self.counters.read().iter() {
            push(key, c.load(Ordering::Relaxed) as f64, MetricType::Counter);
        }
        for (key, g) in self.gauges.read().iter() {
            push(key, g.get(), MetricType::Gauge);
        }
        for (key, h) in self.histograms.read().iter() {
            push(key, summarize(&mut h.lock()).p50, MetricType::Histogram);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }

    /// Persist current values. Returns the number of rows written (0 without a DB).
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let rows = self.current();
        let db = db.lock();
        for row in &rows {
            db.execute(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![row.timestamp, row.name, row.value, row.labels, row.metric_type.as_str()],
            )?;
        }
        Ok(rows.len())
    }

    /// Query historical snapshots, newest first.
    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let db = db.lock();
        let mut stmt = db.prepare(
            "SELECT timestamp, name, value, labels, metric_type FROM metrics_snapshots
             WHERE (?1 IS NULL OR name = ?1) AND (?2 IS NULL OR timestamp >= ?2)
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![q.name, q.since, q.limit.unwrap_or(100)],
            |row| {
                let mt: String = row.get(4)?;
                Ok(MetricsSnapshot {
                    timestamp: row.get(0)?,
                    name: row.get(1)?,
                    value: row.get(2)?,
                    labels: row.get(3)?,
                    metric_type: MetricType::parse(&mt),
                })
            },
        )?;
        rows.collect()
    }
}

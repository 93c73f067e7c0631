//! Historical metric snapshots: bounded retention, periodic persistence,
//! trend classification, and read-side aggregates.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::metrics::{nearest_rank_p95, MetricsReport};
use crate::system::SystemReadings;

/// Maximum number of snapshots retained in memory.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Snapshots per comparison window for trend classification.
const TREND_WINDOW: usize = 30;

/// Relative difference below which two window means count as stable.
const TREND_TOLERANCE: f64 = 0.05;

/// Immutable point-in-time copy of the metric window plus host readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub captured_at: DateTime<Utc>,
    pub metrics: MetricsReport,
    pub system: SystemReadings,
}

/// Direction a metric is moving in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

/// Rolling trend classification per metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendReport {
    pub error_rate: Trend,
    pub average_latency: Trend,
    pub p95_latency: Trend,
    /// Snapshots available for comparison; fewer than two full windows
    /// reports everything as stable.
    pub sample_count: usize,
}

/// Per-calendar-date aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    /// Highest requests-per-minute observed between two snapshots.
    pub max_throughput_per_minute: f64,
    pub mean_success_rate: f64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub errors_by_category: BTreeMap<String, u64>,
}

/// Request volume groupings for read-side analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePatterns {
    /// Requests by hour of day (0-23).
    pub by_hour: BTreeMap<u8, u64>,
    /// Requests by weekday name.
    pub by_weekday: BTreeMap<String, u64>,
    /// Requests by ISO week (e.g. "2026-W35").
    pub by_week: BTreeMap<String, u64>,
}

/// Bounded snapshot store with file persistence.
pub struct SnapshotStore {
    inner: Mutex<VecDeque<MetricSnapshot>>,
    capacity: usize,
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
            path: path.into(),
        }
    }

    pub fn with_default_capacity(path: impl Into<PathBuf>) -> Self {
        Self::new(path, DEFAULT_CAPACITY)
    }

    /// Append a snapshot, evicting the oldest past capacity.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn record(&self, snapshot: MetricSnapshot) {
        let mut list = self.inner.lock().expect("snapshot store lock poisoned");
        list.push_back(snapshot);
        while list.len() > self.capacity {
            list.pop_front();
        }
    }

    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("snapshot store lock poisoned").len()
    }

    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordered copy of all retained snapshots.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn snapshots(&self) -> Vec<MetricSnapshot> {
        self.inner
            .lock()
            .expect("snapshot store lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Snapshots captured at or after `since`.
    pub fn snapshots_since(&self, since: DateTime<Utc>) -> Vec<MetricSnapshot> {
        self.snapshots()
            .into_iter()
            .filter(|s| s.captured_at >= since)
            .collect()
    }

    /// Persist the full list to the configured file.
    ///
    /// Written atomically via a temp file and rename so a crash mid-write
    /// never truncates the previous history.
    pub async fn persist(&self) -> Result<()> {
        let snapshots = self.snapshots();
        let json = serde_json::to_vec_pretty(&snapshots).context("serialize snapshot history")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }

        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename into {}", self.path.display()))?;

        debug!(count = snapshots.len(), path = %self.path.display(), "Persisted snapshot history");
        Ok(())
    }

    /// Reload history from the configured file if present.
    ///
    /// Returns the number of snapshots loaded; a missing file is not an
    /// error (first start).
    pub async fn load(&self) -> Result<usize> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot history file yet");
                return Ok(0);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()));
            }
        };

        let snapshots: Vec<MetricSnapshot> =
            serde_json::from_slice(&bytes).context("parse snapshot history")?;
        let count = snapshots.len();

        let mut list = self.inner.lock().expect("snapshot store lock poisoned");
        *list = snapshots.into_iter().collect();
        while list.len() > self.capacity {
            list.pop_front();
        }
        drop(list);

        info!(count, path = %self.path.display(), "Loaded snapshot history");
        Ok(count)
    }

    /// Rolling trend per metric: mean of the most recent window compared to
    /// the preceding window.
    pub fn trends(&self) -> TrendReport {
        let snapshots = self.snapshots();
        let n = snapshots.len();
        if n < TREND_WINDOW * 2 {
            return TrendReport {
                error_rate: Trend::Stable,
                average_latency: Trend::Stable,
                p95_latency: Trend::Stable,
                sample_count: n,
            };
        }

        let recent = &snapshots[n - TREND_WINDOW..];
        let prior = &snapshots[n - TREND_WINDOW * 2..n - TREND_WINDOW];

        let mean = |set: &[MetricSnapshot], f: fn(&MetricsReport) -> f64| {
            set.iter().map(|s| f(&s.metrics)).sum::<f64>() / set.len() as f64
        };

        TrendReport {
            error_rate: classify(
                mean(recent, |m| m.error_rate),
                mean(prior, |m| m.error_rate),
            ),
            average_latency: classify(
                mean(recent, |m| m.average_latency_ms),
                mean(prior, |m| m.average_latency_ms),
            ),
            p95_latency: classify(
                mean(recent, |m| m.p95_latency_ms),
                mean(prior, |m| m.p95_latency_ms),
            ),
            sample_count: n,
        }
    }

    /// Aggregates keyed by calendar date. Interval deltas are attributed to
    /// the date of the later snapshot.
    pub fn daily_aggregates(&self) -> Vec<DailyAggregate> {
        let snapshots = self.snapshots();

        struct DayAccum {
            success_rates: Vec<f64>,
            avg_latencies: Vec<f64>,
            p95_latencies: Vec<f64>,
            max_throughput: f64,
            errors: BTreeMap<String, u64>,
        }

        let mut days: BTreeMap<NaiveDate, DayAccum> = BTreeMap::new();

        for (i, snap) in snapshots.iter().enumerate() {
            let date = snap.captured_at.date_naive();
            let day = days.entry(date).or_insert_with(|| DayAccum {
                success_rates: Vec::new(),
                avg_latencies: Vec::new(),
                p95_latencies: Vec::new(),
                max_throughput: 0.0,
                errors: BTreeMap::new(),
            });

            day.success_rates.push(1.0 - snap.metrics.error_rate);
            day.avg_latencies.push(snap.metrics.average_latency_ms);
            day.p95_latencies.push(snap.metrics.p95_latency_ms);

            if i > 0 {
                let prev = &snapshots[i - 1];
                let minutes = (snap.captured_at - prev.captured_at).num_seconds() as f64 / 60.0;
                if let Some(delta) = counter_delta(
                    prev.metrics.total_requests,
                    snap.metrics.total_requests,
                ) {
                    if minutes > 0.0 {
                        day.max_throughput = day.max_throughput.max(delta as f64 / minutes);
                    }
                }
                for (category, count) in &snap.metrics.errors_by_category {
                    let prev_count = prev
                        .metrics
                        .errors_by_category
                        .get(category)
                        .copied()
                        .unwrap_or(0);
                    if let Some(delta) = counter_delta(prev_count, *count) {
                        *day.errors.entry(category.clone()).or_insert(0) += delta;
                    }
                }
            }
        }

        days.into_iter()
            .map(|(date, day)| {
                let mut sorted_p95 = day.p95_latencies.clone();
                sorted_p95.sort_by(|a, b| a.total_cmp(b));
                DailyAggregate {
                    date,
                    max_throughput_per_minute: day.max_throughput,
                    mean_success_rate: mean_of(&day.success_rates),
                    mean_latency_ms: mean_of(&day.avg_latencies),
                    p95_latency_ms: nearest_rank_p95(&sorted_p95),
                    errors_by_category: day.errors,
                }
            })
            .collect()
    }

    /// Request volume grouped by hour of day, weekday, and ISO week.
    pub fn usage_patterns(&self, since: Option<DateTime<Utc>>) -> UsagePatterns {
        let snapshots = match since {
            Some(since) => self.snapshots_since(since),
            None => self.snapshots(),
        };

        let mut patterns = UsagePatterns {
            by_hour: BTreeMap::new(),
            by_weekday: BTreeMap::new(),
            by_week: BTreeMap::new(),
        };

        for pair in snapshots.windows(2) {
            let (prev, snap) = (&pair[0], &pair[1]);
            let Some(delta) =
                counter_delta(prev.metrics.total_requests, snap.metrics.total_requests)
            else {
                continue;
            };
            if delta == 0 {
                continue;
            }
            let at = snap.captured_at;
            *patterns.by_hour.entry(at.hour() as u8).or_insert(0) += delta;
            *patterns
                .by_weekday
                .entry(at.format("%A").to_string())
                .or_insert(0) += delta;
            *patterns
                .by_week
                .entry(format!("{}-W{:02}", at.iso_week().year(), at.iso_week().week()))
                .or_insert(0) += delta;
        }

        patterns
    }
}

/// Delta between two cumulative counter readings. `None` when the counter
/// went backwards (process restart between snapshots).
fn counter_delta(prev: u64, current: u64) -> Option<u64> {
    current.checked_sub(prev)
}

fn mean_of(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Lower is better for every tracked metric, so a falling mean improves.
fn classify(recent_mean: f64, prior_mean: f64) -> Trend {
    let base = prior_mean.abs().max(f64::EPSILON);
    let diff = (recent_mean - prior_mean) / base;
    if diff.abs() <= TREND_TOLERANCE {
        Trend::Stable
    } else if diff < 0.0 {
        Trend::Improving
    } else {
        Trend::Declining
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

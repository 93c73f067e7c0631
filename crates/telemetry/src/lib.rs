//! Metrics collection, alerting, and historical snapshots for the deploy relay.
//!
//! This crate provides the health-signal side of the relay:
//! - [`MetricStore`] aggregates per-request outcomes into rolling statistics
//! - [`AlertManager`] turns those statistics into threshold-triggered alerts
//!   with an acknowledge/resolve lifecycle
//! - [`SnapshotStore`] periodically persists point-in-time snapshots and
//!   derives trend and aggregate views from them
//!
//! All shared state lives behind concurrency-safe store objects exposing
//! `record(...)` and snapshot-style reads; raw counters are never shared
//! across task boundaries.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alerts;
pub mod history;
pub mod metrics;
pub mod system;

pub use alerts::{
    Alert, AlertKind, AlertManager, AlertSeverity, AlertThresholds, NotificationChannel,
};
pub use history::{MetricSnapshot, SnapshotStore, Trend, TrendReport};
pub use metrics::{
    ErrorCategory, EventKind, MetricStore, MetricsReport, RequestOutcome, ServiceStatus,
};
pub use system::{SystemProbe, SystemReadings};

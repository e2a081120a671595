//! Agent metrics: labelled counter/gauge families with Prometheus text
//! exposition, served over HTTP.
//!
//! The family names below are a compatibility contract with existing
//! dashboards and must not change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use log::info;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::fmt::Write as _;
use tokio_util::sync::CancellationToken;

/// Count of events handled by the dispatcher, labelled by event type.
pub static EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        "computeblade_agent_events_count",
        "type",
        "ComputeBlade agent internal event handler statistics (handled events)",
    )
});

/// Count of events dropped due to queue backlog, labelled by event type.
pub static EVENTS_DROPPED: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        "computeblade_agent_events_dropped_count",
        "type",
        "ComputeBlade agent internal event handler statistics (dropped events)",
    )
});

/// Blade state gauge; exactly one of the labels critical/identify/normal
/// is 1 at any instant.
pub static BLADE_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        "computeblade_state_state",
        "state",
        "ComputeBlade state (label values are critical, identify, normal)",
    )
});

/// Monotonic counter family with a single label dimension.
pub struct CounterVec {
    name: &'static str,
    label: &'static str,
    help: &'static str,
    values: RwLock<HashMap<&'static str, Arc<AtomicU64>>>,
}

impl CounterVec {
    fn new(name: &'static str, label: &'static str, help: &'static str) -> Self {
        Self {
            name,
            label,
            help,
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Increments the counter for the given label value by one.
    pub fn inc(&self, label_value: &'static str) {
        self.cell(label_value).fetch_add(1, Ordering::SeqCst);
    }

    /// Current value for the given label value (0 if never touched).
    pub fn get(&self, label_value: &'static str) -> u64 {
        self.cell(label_value).load(Ordering::SeqCst)
    }

    fn cell(&self, label_value: &'static str) -> Arc<AtomicU64> {
        if let Some(cell) = self.values.read().get(label_value) {
            return cell.clone();
        }
        self.values
            .write()
            .entry(label_value)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        let values = self.values.read();
        let mut labels: Vec<_> = values.keys().copied().collect();
        labels.sort_unstable();
        for label_value in labels {
            let _ = writeln!(
                out,
                "{}{{{}=\"{}\"}} {}",
                self.name,
                self.label,
                label_value,
                values[label_value].load(Ordering::SeqCst)
            );
        }
    }
}

/// Gauge family with a single label dimension.
pub struct GaugeVec {
    name: &'static str,
    label: &'static str,
    help: &'static str,
    values: RwLock<HashMap<&'static str, Arc<AtomicU64>>>,
}

impl GaugeVec {
    fn new(name: &'static str, label: &'static str, help: &'static str) -> Self {
        Self {
            name,
            label,
            help,
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Sets the gauge for the given label value.
    pub fn set(&self, label_value: &'static str, value: u64) {
        self.cell(label_value).store(value, Ordering::SeqCst);
    }

    /// Current value for the given label value (0 if never touched).
    pub fn get(&self, label_value: &'static str) -> u64 {
        self.cell(label_value).load(Ordering::SeqCst)
    }

    fn cell(&self, label_value: &'static str) -> Arc<AtomicU64> {
        if let Some(cell) = self.values.read().get(label_value) {
            return cell.clone();
        }
        self.values
            .write()
            .entry(label_value)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} gauge", self.name);
        let values = self.values.read();
        let mut labels: Vec<_> = values.keys().copied().collect();
        labels.sort_unstable();
        for label_value in labels {
            let _ = writeln!(
                out,
                "{}{{{}=\"{}\"}} {}",
                self.name,
                self.label,
                label_value,
                values[label_value].load(Ordering::SeqCst)
            );
        }
    }
}

/// Renders all metric families in Prometheus exposition format.
pub fn render() -> String {
    let mut out = String::new();
    EVENTS_TOTAL.render(&mut out);
    EVENTS_DROPPED.render(&mut out);
    BLADE_STATE.render(&mut out);
    out
}

/// Serves `/metrics` and `/healthz` until the token is cancelled.
pub async fn serve(addr: &str, token: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(|| async { render() }))
        .route("/healthz", get(|| async { "ok" }));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;

    info!("Metrics server listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("metrics server failed")?;

    Ok(())
}

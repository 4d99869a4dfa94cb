pub mod server;

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics output is not utf8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    // Chain pointers
    best_known_number: IntGauge,
    best_suggested_body: IntGauge,
    head_number: IntGauge,
    best_known_beacon_number: IntGauge,
    lowest_inserted_beacon_header: IntGauge,
    // Sync
    peers: IntGauge,
    sync_responses: IntCounterVec,
    sync_peer_allocation_failures: IntCounterVec,
    sync_dispatch_failures: IntCounterVec,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, MetricsError> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, MetricsError> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let best_known_number = gauge(
            &registry,
            "chain_best_known_number",
            "Highest block number with a classical block",
        )?;
        let best_suggested_body = gauge(
            &registry,
            "chain_best_suggested_body",
            "Number of the best suggested block body",
        )?;
        let head_number = gauge(&registry, "chain_head_number", "Number of the head block")?;
        let best_known_beacon_number = gauge(
            &registry,
            "chain_best_known_beacon_number",
            "Highest block number known from beacon sync",
        )?;
        let lowest_inserted_beacon_header = gauge(
            &registry,
            "chain_lowest_inserted_beacon_header",
            "Number of the lowest beacon header inserted",
        )?;

        let peers = gauge(&registry, "sync_peers", "Number of peers in the sync pool")?;
        let sync_responses = counter_vec(
            &registry,
            "sync_responses_total",
            "Total number of handled sync responses",
            &["feed", "result"],
        )?;
        let sync_peer_allocation_failures = counter_vec(
            &registry,
            "sync_peer_allocation_failures_total",
            "Total number of requests for which no peer could be allocated",
            &["feed"],
        )?;
        let sync_dispatch_failures = counter_vec(
            &registry,
            "sync_dispatch_failures_total",
            "Total number of failed sync requests",
            &["feed"],
        )?;

        Ok(Self {
            registry,
            best_known_number,
            best_suggested_body,
            head_number,
            best_known_beacon_number,
            lowest_inserted_beacon_header,
            peers,
            sync_responses,
            sync_peer_allocation_failures,
            sync_dispatch_failures,
        })
    }

    pub fn gather(&self) -> Result<String, MetricsError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    // Chain pointers
    pub fn set_best_known_number(&self, v: u64) {
        self.best_known_number.set(v as i64);
    }

    pub fn set_best_suggested_body(&self, v: u64) {
        self.best_suggested_body.set(v as i64);
    }

    pub fn set_head_number(&self, v: u64) {
        self.head_number.set(v as i64);
    }

    pub fn set_best_known_beacon_number(&self, v: u64) {
        self.best_known_beacon_number.set(v as i64);
    }

    pub fn set_lowest_inserted_beacon_header(&self, v: u64) {
        self.lowest_inserted_beacon_header.set(v as i64);
    }

    // Sync
    pub fn set_peers(&self, v: usize) {
        self.peers.set(v as i64);
    }

    pub fn inc_sync_response(&self, feed: &str, result: &str) {
        self.sync_responses.with_label_values(&[feed, result]).inc();
    }

    pub fn sync_response_count(&self, feed: &str, result: &str) -> u64 {
        self.sync_responses.with_label_values(&[feed, result]).get()
    }

    pub fn inc_peer_allocation_failure(&self, feed: &str) {
        self.sync_peer_allocation_failures.with_label_values(&[feed]).inc();
    }

    pub fn inc_dispatch_failure(&self, feed: &str) {
        self.sync_dispatch_failures.with_label_values(&[feed]).inc();
    }

    pub fn dispatch_failure_count(&self, feed: &str) -> u64 {
        self.sync_dispatch_failures.with_label_values(&[feed]).get()
    }
}

pub type SharedMetrics = Arc<Metrics>;

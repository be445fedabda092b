//! Prometheus metrics for the relay engine

use crate::error::Result;
use crate::stats::Direction;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::debug;

/// Relay metrics, labelled by rule id.
///
/// Each manager owns its own registry so several managers (tests, embedded
/// use) never collide on metric names.
#[derive(Clone)]
pub struct ForwardMetrics {
    /// Connections by outcome: accepted, rejected, failed
    pub connections_total: IntCounterVec,

    /// Currently relayed connections or UDP sessions
    pub connections_active: IntGaugeVec,

    /// Bytes relayed by direction
    pub bytes_total: IntCounterVec,

    /// Rules currently running
    pub rules_running: IntGauge,

    registry: Registry,
}

impl ForwardMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connections_total = IntCounterVec::new(
            Opts::new("forward_connections_total", "Relay connections by outcome"),
            &["rule_id", "result"],
        )?;

        let connections_active = IntGaugeVec::new(
            Opts::new("forward_connections_active", "Active relay connections"),
            &["rule_id"],
        )?;

        let bytes_total = IntCounterVec::new(
            Opts::new("forward_bytes_total", "Bytes relayed"),
            &["rule_id", "direction"],
        )?;

        let rules_running = IntGauge::new("forward_rules_running", "Forward rules currently running")?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(bytes_total.clone()))?;
        registry.register(Box::new(rules_running.clone()))?;

        debug!("Forward metrics initialized");

        Ok(Self {
            connections_total,
            connections_active,
            bytes_total,
            rules_running,
            registry,
        })
    }

    /// Resolve the label set of one rule once, for use on hot paths
    pub fn for_rule(&self, rule_id: u64) -> RuleMetrics {
        let id = rule_id.to_string();
        let id = id.as_str();
        RuleMetrics {
            accepted: self.connections_total.with_label_values(&[id, "accepted"]),
            rejected: self.connections_total.with_label_values(&[id, "rejected"]),
            failed: self.connections_total.with_label_values(&[id, "failed"]),
            active: self.connections_active.with_label_values(&[id]),
            upload: self.bytes_total.with_label_values(&[id, Direction::Upload.as_str()]),
            download: self
                .bytes_total
                .with_label_values(&[id, Direction::Download.as_str()]),
        }
    }

    /// Drop every series of a deleted rule
    pub fn remove_rule(&self, rule_id: u64) {
        let id = rule_id.to_string();
        let id = id.as_str();
        for result in ["accepted", "rejected", "failed"] {
            let _ = self.connections_total.remove_label_values(&[id, result]);
        }
        let _ = self.connections_active.remove_label_values(&[id]);
        for direction in [Direction::Upload, Direction::Download] {
            let _ = self
                .bytes_total
                .remove_label_values(&[id, direction.as_str()]);
        }
    }

    /// Text exposition format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Pre-labelled handles for one rule
#[derive(Clone)]
pub struct RuleMetrics {
    accepted: IntCounter,
    rejected: IntCounter,
    failed: IntCounter,
    active: IntGauge,
    upload: IntCounter,
    download: IntCounter,
}

impl RuleMetrics {
    pub fn connection_accepted(&self) {
        self.accepted.inc();
        self.active.inc();
    }

    pub fn connection_closed(&self) {
        self.active.dec();
    }

    pub fn connection_rejected(&self) {
        self.rejected.inc();
    }

    pub fn connection_failed(&self) {
        self.failed.inc();
    }

    pub fn bytes(&self, direction: Direction, n: u64) {
        match direction {
            Direction::Upload => self.upload.inc_by(n),
            Direction::Download => self.download.inc_by(n),
        }
    }

    /// Reset the active gauge when a run ends
    pub fn reset_active(&self) {
        self.active.set(0);
    }
}

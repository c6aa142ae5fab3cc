//! Upload metrics.
//!
//! Metrics are fire-and-forget: a sink never reports failure to its caller, so a
//! broken metrics pipeline cannot fail a backup.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::MetricsConfig;

pub const UPLOAD_BYTES_METRIC: &str = "etcd_backup.s3_upload.bytes";

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn increment(&self, metric: &str, value: u64, tags: &[String]);
}

/// Builds the sink selected by configuration.
pub fn sink_from_config(config: &MetricsConfig) -> Arc<dyn MetricsSink> {
    match config {
        MetricsConfig::Disabled => Arc::new(DisabledMetrics),
        MetricsConfig::DogStatsd { host, port } => Arc::new(DogStatsdSink::new(host.clone(), *port)),
    }
}

pub struct DisabledMetrics;

#[async_trait]
impl MetricsSink for DisabledMetrics {
    async fn increment(&self, metric: &str, _value: u64, _tags: &[String]) {
        debug!("Not submitting metric {}: DOGSTATSD_METRICS_ENABLED is not set", metric);
    }
}

/// Sends counters to a DogStatsD agent over UDP.
pub struct DogStatsdSink {
    host: String,
    port: u16,
}

impl DogStatsdSink {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    async fn send(&self, datagram: &str) -> std::io::Result<()> {
        let target = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address for metrics host"))?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.send_to(datagram.as_bytes(), target).await?;
        Ok(())
    }
}

/// DogStatsD counter line: `<metric>:<value>|c|#tag1,tag2`.
pub fn format_counter(metric: &str, value: u64, tags: &[String]) -> String {
    if tags.is_empty() {
        format!("{}:{}|c", metric, value)
    } else {
        format!("{}:{}|c|#{}", metric, value, tags.join(","))
    }
}

#[async_trait]
impl MetricsSink for DogStatsdSink {
    async fn increment(&self, metric: &str, value: u64, tags: &[String]) {
        debug!("Submitting dogstatsd metrics to {}:{}", self.host, self.port);
        let datagram = format_counter(metric, value, tags);
        if let Err(e) = self.send(&datagram).await {
            warn!("Failed to submit metric {} to {}:{}: {}", metric, self.host, self.port, e);
        }
    }
}

use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};

/// All the counters/gauges/histograms the routing frontend and SSHD update,
/// on their own registry rather than prometheus's process-global default so
/// that more than one `Metrics` can exist in a process (tests, multiple
/// orchestrator instances) without panicking on duplicate registration.
pub struct Metrics {
    registry: Registry,
    pub routing_connections_count: IntCounter,
    pub routing_errors_count: IntCounter,
    pub routing_connection_timeout_count: IntCounter,
    pub routing_active_connections_count: Gauge,
    pub routing_connection_duration_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let routing_connections_count = IntCounter::with_opts(Opts::new(
            "routing_connections_count",
            "Total inbound connections accepted by the SSH routing frontend",
        ))?;
        let routing_errors_count = IntCounter::with_opts(Opts::new(
            "routing_errors_count",
            "Connections that ended in a protocol, policy, or routing error",
        ))?;
        let routing_connection_timeout_count = IntCounter::with_opts(Opts::new(
            "routing_connection_timeout_count",
            "Connections that exceeded the handshake deadline",
        ))?;
        let routing_active_connections_count = Gauge::with_opts(Opts::new(
            "routing_active_connections_count",
            "Connections currently being piped",
        ))?;
        let routing_connection_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "routing_connection_duration_seconds",
                "Wall-clock duration of a piped connection",
            )
            .buckets(prometheus::exponential_buckets(0.01, 1.5, 50)?),
        )?;

        registry.register(Box::new(routing_connections_count.clone()))?;
        registry.register(Box::new(routing_errors_count.clone()))?;
        registry.register(Box::new(routing_connection_timeout_count.clone()))?;
        registry.register(Box::new(routing_active_connections_count.clone()))?;
        registry.register(Box::new(routing_connection_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            routing_connections_count,
            routing_errors_count,
            routing_connection_timeout_count,
            routing_active_connections_count,
            routing_connection_duration_seconds,
        })
    }

    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buf)?;
        Ok(buf)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("metric registration cannot fail on a fresh registry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_as_text() {
        let metrics = Metrics::default();
        metrics.routing_connections_count.inc();
        let rendered = metrics.render().unwrap();
        assert!(String::from_utf8(rendered)
            .unwrap()
            .contains("routing_connections_count"));
    }
}

//! Prometheus metrics for the domain message bus.
//!
//! All metrics follow the naming convention: `ddd_bus_<metric>_<unit>`
//!
//! Counters are usable before [`register_metrics`] is called; registration
//! only makes them visible to [`encode_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // TRAFFIC
    // =========================================================================

    /// Envelopes handed to the broker
    pub static ref MESSAGES_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("ddd_bus_messages_published_total", "Envelopes published to the broker"),
        &["kind", "domain"]  // kind: command/event/response/error
    ).expect("metric creation failed");

    /// Envelopes delivered by the broker
    pub static ref MESSAGES_RECEIVED: CounterVec = CounterVec::new(
        Opts::new("ddd_bus_messages_received_total", "Envelopes delivered by the broker"),
        &["kind", "domain"]
    ).expect("metric creation failed");

    /// Envelopes dropped at the decode boundary
    pub static ref PROTOCOL_ERRORS: CounterVec = CounterVec::new(
        Opts::new("ddd_bus_protocol_errors_total", "Inbound envelopes that failed to decode"),
        &["reason"]  // reason: unknown_kind/unregistered/malformed/kind_mismatch
    ).expect("metric creation failed");

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// Commands awaiting a reply
    pub static ref PENDING_REQUESTS: Gauge = Gauge::new(
        "ddd_bus_pending_requests",
        "Commands sent and still awaiting a reply"
    ).expect("metric creation failed");

    /// Round trip of remote commands
    pub static ref COMMAND_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ddd_bus_command_duration_seconds",
            "Time from publishing a command to receiving its reply"
        ).buckets(exponential_buckets(0.0005, 2.0, 16).expect("valid buckets"))
    ).expect("metric creation failed");

    /// Commands whose caller gave up waiting
    pub static ref COMMAND_TIMEOUTS: CounterVec = CounterVec::new(
        Opts::new("ddd_bus_command_timeouts_total", "Commands that timed out waiting for a reply"),
        &["domain"]
    ).expect("metric creation failed");

    /// Inbound commands dropped because the caller is not allowed
    pub static ref PERMISSION_DENIED: CounterVec = CounterVec::new(
        Opts::new("ddd_bus_permission_denied_total", "Inbound commands from callers without permission"),
        &["command"]
    ).expect("metric creation failed");

    // =========================================================================
    // HANDLERS & LIFECYCLE
    // =========================================================================

    /// Handler invocations that did not succeed
    pub static ref HANDLER_FAILURES: CounterVec = CounterVec::new(
        Opts::new("ddd_bus_handler_failures_total", "Failed handler invocations"),
        &["kind", "outcome"]  // outcome: domain_error/internal/panic
    ).expect("metric creation failed");

    /// Endpoint start attempts
    pub static ref ENDPOINT_STARTS: CounterVec = CounterVec::new(
        Opts::new("ddd_bus_endpoint_starts_total", "Endpoint start attempts"),
        &["role", "outcome"]  // role: self/remote, outcome: ok/failed
    ).expect("metric creation failed");
}

/// Handle for the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_PUBLISHED.clone()),
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(PROTOCOL_ERRORS.clone()),
        Box::new(PENDING_REQUESTS.clone()),
        Box::new(COMMAND_LATENCY.clone()),
        Box::new(COMMAND_TIMEOUTS.clone()),
        Box::new(PERMISSION_DENIED.clone()),
        Box::new(HANDLER_FAILURES.clone()),
        Box::new(ENDPOINT_STARTS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice() {
        assert!(register_metrics().is_ok());
        assert!(register_metrics().is_ok());
    }

    #[test]
    fn test_counter_increment() {
        MESSAGES_PUBLISHED.with_label_values(&["command", "billing"]).inc();
        assert!(
            MESSAGES_PUBLISHED
                .with_label_values(&["command", "billing"])
                .get()
                >= 1.0
        );
    }

    #[test]
    fn test_encoded_output_names_bus_metrics() {
        register_metrics().unwrap();
        COMMAND_TIMEOUTS.with_label_values(&["billing"]).inc();

        let text = encode_metrics().unwrap();
        assert!(text.contains("ddd_bus_command_timeouts_total"));
    }

    #[test]
    fn test_histogram_timer() {
        let before = COMMAND_LATENCY.get_sample_count();
        drop(HistogramTimer::new(&COMMAND_LATENCY));
        assert!(COMMAND_LATENCY.get_sample_count() > before);
    }
}

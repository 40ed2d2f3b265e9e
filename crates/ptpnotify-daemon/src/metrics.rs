//! Prometheus metrics for the sidecar.
//!
//! The engine and bus record into these counters; exposing them is glue (the
//! REST router serves `/metrics` in Prometheus text format).

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use ptpnotify_core::event::{EventType, SyncState};
use thiserror::Error;

use crate::ptp4lconf::{ConfigName, Iface};

/// Errors raised by metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Registering a metric with the registry failed.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Encoding the metrics output failed.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// All sidecar metrics, registered on one registry.
///
/// The struct is cheap to share behind an `Arc`; every metric uses interior
/// mutability.
pub struct ProxyMetrics {
    registry: Registry,
    events_published_total: CounterVec,
    events_dropped_total: CounterVec,
    transport_retries_total: CounterVec,
    transport_connection_losses_total: CounterVec,
    state_transitions_total: CounterVec,
    interface_offset_ns: GaugeVec,
}

impl ProxyMetrics {
    /// Creates the metrics on a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error when a metric fails to register.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let events_published_total = CounterVec::new(
            Opts::new(
                "ptpnotify_events_published_total",
                "Events handed to the out channel, by event type",
            ),
            &["type"],
        )?;
        registry.register(Box::new(events_published_total.clone()))?;

        let events_dropped_total = CounterVec::new(
            Opts::new(
                "ptpnotify_events_dropped_total",
                "Events dropped instead of delivered, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(events_dropped_total.clone()))?;

        let transport_retries_total = CounterVec::new(
            Opts::new(
                "ptpnotify_transport_retries_total",
                "Immediate delivery retries, by transport",
            ),
            &["transport"],
        )?;
        registry.register(Box::new(transport_retries_total.clone()))?;

        let transport_connection_losses_total = CounterVec::new(
            Opts::new(
                "ptpnotify_transport_connection_losses_total",
                "Transport connection losses, by transport",
            ),
            &["transport"],
        )?;
        registry.register(Box::new(transport_connection_losses_total.clone()))?;

        let state_transitions_total = CounterVec::new(
            Opts::new(
                "ptpnotify_state_transitions_total",
                "Published synchronization state transitions, by new state",
            ),
            &["state"],
        )?;
        registry.register(Box::new(state_transitions_total.clone()))?;

        let interface_offset_ns = GaugeVec::new(
            Opts::new(
                "ptpnotify_interface_offset_ns",
                "Last observed offset in nanoseconds",
            ),
            &["config", "iface"],
        )?;
        registry.register(Box::new(interface_offset_ns.clone()))?;

        Ok(Self {
            registry,
            events_published_total,
            events_dropped_total,
            transport_retries_total,
            transport_connection_losses_total,
            state_transitions_total,
            interface_offset_ns,
        })
    }

    /// Records an event handed to the out channel.
    pub fn event_published(&self, event_type: EventType) {
        self.events_published_total
            .with_label_values(&[event_type.as_str()])
            .inc();
    }

    /// Records a dropped event.
    pub fn event_dropped(&self, reason: &str) {
        self.events_dropped_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Records an immediate delivery retry.
    pub fn transport_retry(&self, transport: &str) {
        self.transport_retries_total
            .with_label_values(&[transport])
            .inc();
    }

    /// Records a transport connection loss.
    pub fn transport_connection_loss(&self, transport: &str) {
        self.transport_connection_losses_total
            .with_label_values(&[transport])
            .inc();
    }

    /// Records a published state transition.
    pub fn state_transition(&self, state: SyncState) {
        self.state_transitions_total
            .with_label_values(&[state.as_str()])
            .inc();
    }

    /// Updates the last-offset gauge for one interface.
    #[allow(clippy::cast_precision_loss)] // offsets are far below 2^52 ns
    pub fn set_interface_offset(&self, config: &ConfigName, iface: &Iface, offset_ns: i64) {
        self.interface_offset_ns
            .with_label_values(&[config.as_str(), iface.as_str()])
            .set(offset_ns as f64);
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error when encoding fails or produces invalid UTF-8.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

//! CloudEvent payload model for PTP synchronization events.
//!
//! Every event the sidecar publishes is a small envelope ([`Event`]) around a
//! versioned list of data values ([`EventData`]). A state-change event
//! carries a NOTIFICATION value (the new [`SyncState`]) plus a METRIC value
//! (the offset in nanoseconds); a clock-class change carries the METRIC
//! value only.
//!
//! The JSON shape is part of the external contract and is pinned by the
//! tests at the bottom of this module:
//!
//! ```json
//! {
//!   "version": "v1",
//!   "values": [
//!     {"resource": "...", "dataType": "notification", "valueType": "enumeration", "value": "LOCKED"},
//!     {"resource": "...", "dataType": "metric",       "valueType": "decimal",     "value": 42}
//!   ]
//! }
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version string carried in every [`EventData`] payload.
pub const DATA_VERSION: &str = "v1";

/// Synchronization state of a tracked clock.
///
/// `Unknown` is an engine-internal marker for log states the engine has not
/// classified; it never survives a publish decision (an unknown state is
/// downgraded before emission) but it does appear in warning logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    /// The local clock has no valid synchronization source.
    #[serde(rename = "FREERUN")]
    Freerun,

    /// The local clock is tracking a master within the configured threshold.
    #[serde(rename = "LOCKED")]
    Locked,

    /// The master was lost; the clock runs on its oscillator until the
    /// hold-over timer expires.
    #[serde(rename = "HOLDOVER")]
    Holdover,

    /// A state the engine could not classify.
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl SyncState {
    /// Returns the wire representation of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Freerun => "FREERUN",
            Self::Locked => "LOCKED",
            Self::Holdover => "HOLDOVER",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Returns `true` for the three states that may be published.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed vocabulary of PTP event kinds.
///
/// One publisher exists per variant at steady state; registration of the
/// publisher table fails on a duplicate or missing mapping, so a lookup by
/// event type cannot fail at publication time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// PTP clock state transition (FREERUN/LOCKED/HOLDOVER).
    #[serde(rename = "event.sync.ptp-status.ptp-state-change")]
    PtpStateChange,

    /// OS clock (`CLOCK_REALTIME`) synchronization state transition.
    #[serde(rename = "event.sync.sync-status.os-clock-sync-state-change")]
    OsClockSyncStateChange,

    /// Announced PTP clock-class changed.
    #[serde(rename = "event.sync.ptp-status.ptp-clock-class-change")]
    PtpClockClassChange,

    /// Overall synchronization state of the node.
    #[serde(rename = "event.sync.sync-status.synchronization-state-change")]
    SynchronizationStateChange,

    /// GNSS receiver synchronization state transition.
    #[serde(rename = "event.sync.gnss-status.gnss-state-change")]
    GnssStateChange,
}

impl EventType {
    /// All event types, in publisher-registration order.
    pub const ALL: [Self; 5] = [
        Self::PtpStateChange,
        Self::OsClockSyncStateChange,
        Self::PtpClockClassChange,
        Self::SynchronizationStateChange,
        Self::GnssStateChange,
    ];

    /// Returns the wire representation of the event type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PtpStateChange => "event.sync.ptp-status.ptp-state-change",
            Self::OsClockSyncStateChange => "event.sync.sync-status.os-clock-sync-state-change",
            Self::PtpClockClassChange => "event.sync.ptp-status.ptp-clock-class-change",
            Self::SynchronizationStateChange => {
                "event.sync.sync-status.synchronization-state-change"
            },
            Self::GnssStateChange => "event.sync.gnss-status.gnss-state-change",
        }
    }

    /// Resource suffix under which the publisher for this event type is
    /// registered. Interpolated into the node resource template together
    /// with the node name.
    #[must_use]
    pub const fn resource_suffix(&self) -> &'static str {
        match self {
            Self::PtpStateChange => "/sync/ptp-status/ptp-state-change",
            Self::OsClockSyncStateChange => "/sync/sync-status/os-clock-sync-state-change",
            Self::PtpClockClassChange => "/sync/ptp-status/ptp-clock-class-change",
            Self::SynchronizationStateChange => "/sync/sync-status/sync-state",
            Self::GnssStateChange => "/sync/gnss-status/gnss-sync-status",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a [`DataValue`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// A state notification.
    #[serde(rename = "notification")]
    Notification,

    /// A numeric measurement.
    #[serde(rename = "metric")]
    Metric,
}

/// Wire representation of a [`DataValue`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    /// One of a closed set of strings.
    #[serde(rename = "enumeration")]
    Enumeration,

    /// A signed integer.
    #[serde(rename = "decimal")]
    Decimal,
}

/// The value carried by a [`DataValue`]: a sync-state enumeration or a
/// decimal metric (signed nanoseconds, clock class, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventValue {
    /// A synchronization state.
    State(SyncState),
    /// A signed integer metric.
    Decimal(i64),
}

/// A single entry of a CloudEvent payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataValue {
    /// Resource address the value refers to.
    pub resource: String,

    /// Whether this is a notification or a metric.
    #[serde(rename = "dataType")]
    pub data_type: DataType,

    /// Wire type of `value`.
    #[serde(rename = "valueType")]
    pub value_type: ValueType,

    /// The value itself.
    pub value: EventValue,
}

impl DataValue {
    /// Builds a NOTIFICATION value carrying a synchronization state.
    #[must_use]
    pub fn notification(resource: impl Into<String>, state: SyncState) -> Self {
        Self {
            resource: resource.into(),
            data_type: DataType::Notification,
            value_type: ValueType::Enumeration,
            value: EventValue::State(state),
        }
    }

    /// Builds a METRIC value carrying a signed integer.
    #[must_use]
    pub fn metric(resource: impl Into<String>, value: i64) -> Self {
        Self {
            resource: resource.into(),
            data_type: DataType::Metric,
            value_type: ValueType::Decimal,
            value: EventValue::Decimal(value),
        }
    }
}

/// Versioned, ordered list of data values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    /// Payload schema version, always [`DATA_VERSION`].
    pub version: String,

    /// The values, in emission order.
    pub values: Vec<DataValue>,
}

impl EventData {
    /// Builds the payload of a state-change event: a NOTIFICATION value for
    /// the new state followed by a METRIC value for the offset.
    #[must_use]
    pub fn state_and_metric(resource: &str, state: SyncState, offset_ns: i64) -> Self {
        Self {
            version: DATA_VERSION.to_string(),
            values: vec![
                DataValue::notification(resource, state),
                DataValue::metric(resource, offset_ns),
            ],
        }
    }

    /// Builds the payload of a metric-only event (clock-class change).
    #[must_use]
    pub fn metric_only(resource: &str, value: i64) -> Self {
        Self {
            version: DATA_VERSION.to_string(),
            values: vec![DataValue::metric(resource, value)],
        }
    }
}

/// The CloudEvent envelope published on the bus and returned by the
/// current-state REST query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id (UUID v4).
    pub id: String,

    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Fully interpolated resource address the event originates from.
    pub source: String,

    /// Emission timestamp.
    pub time: DateTime<Utc>,

    /// The payload.
    pub data: EventData,
}

impl Event {
    /// Builds a new event with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(event_type: EventType, source: impl Into<String>, data: EventData) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            source: source.into(),
            time: Utc::now(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_change_payload_shape() {
        let data = EventData::state_and_metric("/cluster/node/worker-0/sync", SyncState::Locked, 42);
        let json = serde_json::to_value(&data).expect("serialize failed");

        assert_eq!(json["version"], "v1");
        assert_eq!(json["values"][0]["dataType"], "notification");
        assert_eq!(json["values"][0]["valueType"], "enumeration");
        assert_eq!(json["values"][0]["value"], "LOCKED");
        assert_eq!(json["values"][1]["dataType"], "metric");
        assert_eq!(json["values"][1]["valueType"], "decimal");
        assert_eq!(json["values"][1]["value"], 42);
    }

    #[test]
    fn clock_class_payload_has_metric_only() {
        let data = EventData::metric_only("/cluster/node/worker-0/sync", 6);
        assert_eq!(data.values.len(), 1);
        assert_eq!(data.values[0].data_type, DataType::Metric);
    }

    #[test]
    fn event_value_round_trip() {
        let state: EventValue = serde_json::from_str("\"HOLDOVER\"").expect("deserialize failed");
        assert_eq!(state, EventValue::State(SyncState::Holdover));

        let metric: EventValue = serde_json::from_str("-500").expect("deserialize failed");
        assert_eq!(metric, EventValue::Decimal(-500));
    }

    #[test]
    fn event_envelope_round_trip() {
        let event = Event::new(
            EventType::PtpStateChange,
            "/cluster/node/worker-0/sync/ptp-status/ptp-state-change",
            EventData::state_and_metric("/cluster/node/worker-0/sync", SyncState::Freerun, 999),
        );
        let json = serde_json::to_string(&event).expect("serialize failed");
        let decoded: Event = serde_json::from_str(&json).expect("deserialize failed");
        assert_eq!(event, decoded);
        assert!(json.contains("\"type\":\"event.sync.ptp-status.ptp-state-change\""));
    }

    #[test]
    fn resource_suffixes_are_rooted() {
        for event_type in EventType::ALL {
            assert!(event_type.resource_suffix().starts_with('/'));
        }
    }

    #[test]
    fn sync_state_known() {
        assert!(SyncState::Locked.is_known());
        assert!(SyncState::Freerun.is_known());
        assert!(SyncState::Holdover.is_known());
        assert!(!SyncState::Unknown.is_known());
    }
}

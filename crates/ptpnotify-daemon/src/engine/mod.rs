//! The PTP event engine.
//!
//! [`PtpEventManager`] is the per-node object tying the stores together: it
//! consumes typed samples and configuration updates, runs the transition
//! rules in [`state`], and emits CloudEvents onto the bus's out channel.
//!
//! The manager holds the threshold, config and stats registries plus the
//! publisher table (one publisher per event type, registered at startup).
//! Cyclic ownership with the bus and transports is avoided by construction:
//! the manager only holds the out channel's sender end, handed down at
//! construction.
//!
//! Sample processing is panic-safe at the public boundary only: a panic
//! inside [`PtpEventManager::on_sample`] is caught, logged and the sample
//! discarded. The recover barrier deliberately does not extend into the
//! transition rules, where it would mask bugs.

mod holdover;
mod state;

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use ptpnotify_core::channel::DataChan;
use ptpnotify_core::event::{DataValue, Event, EventData, EventType, SyncState, DATA_VERSION};
use ptpnotify_core::pubsub::PubSub;
use ptpnotify_core::resource::ResourceTemplate;
use ptpnotify_core::store::{PubSubStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::Shutdown;
use crate::metrics::ProxyMetrics;
use crate::ptp4lconf::{ConfigName, ConfigRegistry, Iface, PtpRole};
use crate::stats::StatsStore;
use crate::threshold::{ThresholdLimits, ThresholdRegistry};

use self::state::Action;

/// Errors raised by engine setup and queries.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No publisher is registered for the event type.
    #[error("no publisher registered for event type {0}")]
    PublisherMissing(EventType),

    /// A publisher for the event type was registered twice.
    #[error("publisher for event type {0} registered twice")]
    DuplicatePublisher(EventType),

    /// No publisher resource matches the queried address.
    #[error("no publisher resource matches {0}")]
    UnknownResource(String),

    /// No state has been recorded yet for the queried resource.
    #[error("no state recorded yet for {0}")]
    StateUnknown(String),

    /// Creating the publisher record failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One registered event publisher.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    /// Store id of the publisher record.
    pub id: String,
    /// Fully interpolated resource address events are published under.
    pub address: String,
}

/// One profile carried by a configuration-map update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtpProfile {
    /// Profile name.
    pub name: String,
    /// The `ptp4l` config file the profile drives.
    pub config_name: ConfigName,
    /// Event thresholds for the profile.
    #[serde(default)]
    pub thresholds: ThresholdLimits,
}

/// A configuration-map update: the full set of active profiles. Profiles
/// absent from the update are retired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtpConfigUpdate {
    /// The active profiles.
    pub profiles: Vec<PtpProfile>,
}

/// The per-node event engine.
pub struct PtpEventManager {
    node_name: String,
    resource_prefix: ResourceTemplate,
    publishers: HashMap<EventType, EventPublisher>,
    thresholds: ThresholdRegistry,
    configs: ConfigRegistry,
    stats: Arc<StatsStore>,
    profile_configs: Mutex<HashMap<String, ConfigName>>,
    holdover_active: Arc<Mutex<HashSet<(ConfigName, Iface)>>>,
    out_tx: mpsc::Sender<DataChan>,
    metrics: Arc<ProxyMetrics>,
    shutdown: Shutdown,
}

impl PtpEventManager {
    /// Builds the engine. Publishers must be registered with
    /// [`Self::register_publishers`] before samples are processed.
    #[must_use]
    pub fn new(
        node_name: impl Into<String>,
        resource_prefix: ResourceTemplate,
        out_tx: mpsc::Sender<DataChan>,
        metrics: Arc<ProxyMetrics>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            resource_prefix,
            publishers: HashMap::new(),
            thresholds: ThresholdRegistry::new(),
            configs: ConfigRegistry::new(),
            stats: Arc::new(StatsStore::new()),
            profile_configs: Mutex::new(HashMap::new()),
            holdover_active: Arc::new(Mutex::new(HashSet::new())),
            out_tx,
            metrics,
            shutdown,
        }
    }

    /// Registers one publisher per event type through the publisher store.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] when a record cannot be created or a type
    /// would be registered twice; this fails daemon startup, so a missing
    /// mapping can never surface at publication time.
    pub fn register_publishers(
        &mut self,
        store: &PubSubStore,
        endpoint: &str,
    ) -> Result<(), EngineError> {
        for event_type in EventType::ALL {
            let address = self
                .resource_prefix
                .render(&self.node_name, event_type.resource_suffix());
            let record = store.create(PubSub::new(address.clone(), endpoint))?;
            let id = record
                .id
                .clone()
                .ok_or(EngineError::PublisherMissing(event_type))?;
            info!(event_type = %event_type, address = %address, id = %id, "publisher registered");
            if self
                .publishers
                .insert(event_type, EventPublisher { id, address })
                .is_some()
            {
                return Err(EngineError::DuplicatePublisher(event_type));
            }
        }
        Ok(())
    }

    /// The threshold registry (single writer: the configuration watcher).
    #[must_use]
    pub const fn thresholds(&self) -> &ThresholdRegistry {
        &self.thresholds
    }

    /// The PTP config registry.
    #[must_use]
    pub const fn configs(&self) -> &ConfigRegistry {
        &self.configs
    }

    /// The stats store.
    #[must_use]
    pub fn stats(&self) -> &StatsStore {
        &self.stats
    }

    /// The registered publisher table.
    #[must_use]
    pub const fn publishers(&self) -> &HashMap<EventType, EventPublisher> {
        &self.publishers
    }

    /// `true` while the out channel still has a consumer.
    #[must_use]
    pub fn is_bus_open(&self) -> bool {
        !self.out_tx.is_closed()
    }

    /// Ingests one measurement. Any internal panic is caught here, logged,
    /// and the sample discarded.
    pub async fn on_sample(
        &self,
        profile: &str,
        config: &ConfigName,
        iface: &Iface,
        offset_ns: i64,
        current_state: SyncState,
        event_type: EventType,
    ) {
        let outcome = AssertUnwindSafe(
            self.handle_sample(profile, config, iface, offset_ns, current_state, event_type),
        )
        .catch_unwind()
        .await;
        if let Err(panic) = outcome {
            error!(
                profile,
                config_name = %config,
                iface = %iface,
                panic = %panic_message(&panic),
                "sample processing panicked, discarding sample"
            );
            self.metrics.event_dropped("panic");
        }
    }

    async fn handle_sample(
        &self,
        profile: &str,
        config: &ConfigName,
        iface: &Iface,
        offset_ns: i64,
        current_state: SyncState,
        event_type: EventType,
    ) {
        let threshold = self.thresholds.get(profile);
        let limits = threshold.limits;
        let in_range = limits.in_range(offset_ns);
        let last = self.stats.with_stats(config, iface, |s| s.last_sync_state());
        let decision = state::evaluate(last, current_state, in_range);

        if decision.warn_unknown {
            warn!(
                profile,
                config_name = %config,
                iface = %iface,
                state = %current_state,
                last = %last,
                "unclassified sync state"
            );
        }

        match decision.action {
            Action::Ignore => {},
            Action::RecordOffset => {
                self.stats.with_stats(config, iface, |s| {
                    s.set_last_offset(offset_ns);
                    s.add_value(offset_ns);
                });
                self.metrics.set_interface_offset(config, iface, offset_ns);
            },
            Action::Publish {
                state,
                record_value,
            } => {
                let publish_type = if decision.force_state_change {
                    EventType::PtpStateChange
                } else {
                    event_type
                };
                info!(
                    profile,
                    config_name = %config,
                    iface = %iface,
                    last = %last,
                    state = %state,
                    offset = offset_ns,
                    threshold_min = limits.min_offset_ns,
                    threshold_max = limits.max_offset_ns,
                    "publishing state event"
                );
                self.publish_event(state, offset_ns, iface.as_str(), publish_type)
                    .await;
                self.stats.with_stats(config, iface, |s| {
                    if state.is_known() {
                        s.set_last_sync_state(state);
                    }
                    s.set_last_offset(offset_ns);
                    if record_value {
                        s.add_value(offset_ns);
                    }
                });
                self.metrics.state_transition(state);
                self.metrics.set_interface_offset(config, iface, offset_ns);
            },
        }
    }

    /// Builds and publishes one event on the out channel. Producers block on
    /// a full channel; that is the intended back-pressure path.
    pub async fn publish_event(
        &self,
        state: SyncState,
        offset_ns: i64,
        source: &str,
        event_type: EventType,
    ) {
        let Some(publisher) = self.publishers.get(&event_type) else {
            error!(event_type = %event_type, "no publisher registered, dropping event");
            self.metrics.event_dropped("publisher-missing");
            return;
        };

        let event_source = self
            .resource_prefix
            .render(&self.node_name, &format!("/{source}"));
        let data = if event_type == EventType::PtpClockClassChange {
            EventData::metric_only(&event_source, offset_ns)
        } else {
            EventData::state_and_metric(&event_source, state, offset_ns)
        };
        let event = Event::new(event_type, publisher.address.clone(), data);

        if self
            .out_tx
            .send(DataChan::event(publisher.address.clone(), event))
            .await
            .is_err()
        {
            warn!(event_type = %event_type, "event bus closed, dropping event");
            self.metrics.event_dropped("bus-closed");
        } else {
            self.metrics.event_published(event_type);
        }
    }

    /// Publishes a clock-class change: a single METRIC value carrying the
    /// class code. The carrier state is fixed to LOCKED.
    pub async fn publish_clock_class_change(
        &self,
        class: i64,
        source: &str,
        event_type: EventType,
    ) {
        self.publish_event(SyncState::Locked, class, source, event_type)
            .await;
    }

    /// Records a clock-class observation and publishes a
    /// `PtpClockClassChange` event only when the class actually changed.
    pub async fn on_clock_class(
        &self,
        config: &ConfigName,
        iface: &Iface,
        class: i64,
    ) {
        let changed = self.stats.with_stats(config, iface, |s| s.set_clock_class(class));
        if changed {
            info!(config_name = %config, iface = %iface, class, "clock class changed");
            self.publish_clock_class_change(class, iface.as_str(), EventType::PtpClockClassChange)
                .await;
        }
    }

    /// Handles a master loss: transitions the interface to HOLDOVER, emits
    /// the state-change event and starts the scoped hold-over timer. At most
    /// one timer runs per `(config, iface)`; a second loss while one is
    /// active is a no-op.
    pub async fn on_master_loss(&self, profile: &str, config: &ConfigName, iface: &Iface) {
        {
            let mut active = self.holdover_active.lock().unwrap();
            if !active.insert((config.clone(), iface.clone())) {
                debug!(
                    profile,
                    config_name = %config,
                    iface = %iface,
                    "hold-over already active"
                );
                return;
            }
        }

        let threshold = self.thresholds.get(profile);
        let offset = self.stats.with_stats(config, iface, |s| s.last_offset());
        info!(
            profile,
            config_name = %config,
            iface = %iface,
            state = %SyncState::Holdover,
            offset,
            threshold_min = threshold.limits.min_offset_ns,
            threshold_max = threshold.limits.max_offset_ns,
            "master lost, entering hold-over"
        );
        self.publish_event(
            SyncState::Holdover,
            offset,
            iface.as_str(),
            EventType::PtpStateChange,
        )
        .await;
        self.stats
            .with_stats(config, iface, |s| s.set_last_sync_state(SyncState::Holdover));
        self.metrics.state_transition(SyncState::Holdover);

        let ctx = holdover::HoldoverCtx {
            stats: Arc::clone(&self.stats),
            active: Arc::clone(&self.holdover_active),
            out_tx: self.out_tx.clone(),
            metrics: Arc::clone(&self.metrics),
            publisher_address: self
                .publishers
                .get(&EventType::PtpStateChange)
                .map(|p| p.address.clone()),
            event_source: self
                .resource_prefix
                .render(&self.node_name, &format!("/{iface}")),
        };
        holdover::spawn(
            ctx,
            config.clone(),
            iface.clone(),
            threshold.limits.hold_over_timeout(),
            threshold,
            self.shutdown.clone(),
        );
    }

    /// Applies a configuration-map update: installs thresholds for the
    /// active profiles (replacing changed ones, which fires the old
    /// generation's close signal) and retires profiles that vanished,
    /// deleting their PTP config and stats.
    pub fn on_config_change(&self, update: &PtpConfigUpdate) {
        let next: HashMap<String, ConfigName> = update
            .profiles
            .iter()
            .map(|p| (p.name.clone(), p.config_name.clone()))
            .collect();
        let previous = {
            let mut mapping = self.profile_configs.lock().unwrap();
            std::mem::replace(&mut *mapping, next.clone())
        };

        // Lock order: threshold, then config, then stats.
        for profile in &update.profiles {
            self.thresholds.set(&profile.name, profile.thresholds);
        }
        for (name, config) in previous {
            if !next.contains_key(&name) {
                info!(
                    profile = %name,
                    config_name = %config,
                    "profile removed, retiring threshold, config and stats"
                );
                self.thresholds.remove(&name);
                self.configs.delete(&config);
                self.stats.delete_config(&config);
            }
        }
    }

    /// Updates the role of one interface after a `ptp4l` role-change line.
    pub fn on_role_change(&self, config: &ConfigName, iface: &Iface, role: PtpRole) {
        self.configs.set_role(config, iface, role);
        self.stats.with_stats(config, iface, |s| s.set_role(role));
    }

    /// Synchronously builds a CloudEvent from the stats store for the given
    /// publisher resource address, without touching the bus. Used by the
    /// REST current-state query.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownResource`] when no publisher matches
    /// the address and [`EngineError::StateUnknown`] when no stats have been
    /// recorded yet.
    pub fn current_state(&self, resource_address: &str) -> Result<Event, EngineError> {
        let event_type = self
            .publishers
            .iter()
            .find(|(_, p)| p.address == resource_address)
            .map(|(t, _)| *t)
            .ok_or_else(|| EngineError::UnknownResource(resource_address.to_string()))?;

        let mut records = self.stats.all();
        records.sort_by(|a, b| (a.0.as_str(), a.1.as_str()).cmp(&(b.0.as_str(), b.1.as_str())));

        let mut values = Vec::new();
        for (_config, iface, stats) in records {
            let source = self
                .resource_prefix
                .render(&self.node_name, &format!("/{iface}"));
            if event_type == EventType::PtpClockClassChange {
                if let Some(class) = stats.last_clock_class() {
                    values.push(DataValue::metric(&source, class));
                }
            } else {
                values.push(DataValue::notification(&source, stats.last_sync_state()));
                values.push(DataValue::metric(&source, stats.last_offset()));
            }
        }
        if values.is_empty() {
            return Err(EngineError::StateUnknown(resource_address.to_string()));
        }

        Ok(Event::new(
            event_type,
            resource_address,
            EventData {
                version: DATA_VERSION.to_string(),
                values,
            },
        ))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

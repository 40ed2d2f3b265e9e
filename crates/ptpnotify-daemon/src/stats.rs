//! Rolling per-interface synchronization statistics.
//!
//! One [`Stats`] record exists per `(ConfigName, Iface)` while the config is
//! loaded. The record carries the last published sync state, the last offset
//! and an incrementally maintained mean/min/max of the offset. No history
//! is kept.
//!
//! All map mutations go through a single reader-writer lock held only across
//! the map operation itself, never across I/O or a channel send. For a fixed
//! key, state transitions are linearizable with respect to sample arrival
//! because each key is touched by exactly one sample-processing task.

use std::collections::HashMap;
use std::sync::RwLock;

use ptpnotify_core::event::SyncState;
use serde::Serialize;

use crate::ptp4lconf::{ConfigName, Iface, PtpRole};

/// Rolling statistics and last-known sync state for one interface under one
/// config.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    config_name: String,
    role: PtpRole,
    alias_name: Option<String>,
    last_sync_state: SyncState,
    last_offset_ns: i64,
    last_clock_class: Option<i64>,
    count: u64,
    mean_ns: f64,
    min_ns: i64,
    max_ns: i64,
}

impl Stats {
    /// Builds a fresh record for `config_name`. The initial sync state is
    /// `Unknown` until the first publish decision.
    #[must_use]
    pub fn new(config_name: impl Into<String>) -> Self {
        Self {
            config_name: config_name.into(),
            role: PtpRole::Unknown,
            alias_name: None,
            last_sync_state: SyncState::Unknown,
            last_offset_ns: 0,
            last_clock_class: None,
            count: 0,
            mean_ns: 0.0,
            min_ns: 0,
            max_ns: 0,
        }
    }

    /// Folds one offset into the rolling mean/min/max.
    #[allow(clippy::cast_precision_loss)] // offsets are far below 2^52 ns
    pub fn add_value(&mut self, offset_ns: i64) {
        if self.count == 0 {
            self.min_ns = offset_ns;
            self.max_ns = offset_ns;
            self.mean_ns = offset_ns as f64;
        } else {
            self.min_ns = self.min_ns.min(offset_ns);
            self.max_ns = self.max_ns.max(offset_ns);
            let delta = offset_ns as f64 - self.mean_ns;
            self.mean_ns += delta / (self.count as f64 + 1.0);
        }
        self.count += 1;
    }

    /// Last published sync state.
    #[must_use]
    pub const fn last_sync_state(&self) -> SyncState {
        self.last_sync_state
    }

    /// Records a new sync state.
    pub const fn set_last_sync_state(&mut self, state: SyncState) {
        self.last_sync_state = state;
    }

    /// Last observed offset in nanoseconds.
    #[must_use]
    pub const fn last_offset(&self) -> i64 {
        self.last_offset_ns
    }

    /// Records the last observed offset.
    pub const fn set_last_offset(&mut self, offset_ns: i64) {
        self.last_offset_ns = offset_ns;
    }

    /// Last observed PTP clock class, if any.
    #[must_use]
    pub const fn last_clock_class(&self) -> Option<i64> {
        self.last_clock_class
    }

    /// Records the clock class; returns `true` when the value changed.
    pub fn set_clock_class(&mut self, class: i64) -> bool {
        let changed = self.last_clock_class != Some(class);
        self.last_clock_class = Some(class);
        changed
    }

    /// Port role of the interface.
    #[must_use]
    pub const fn role(&self) -> PtpRole {
        self.role
    }

    /// Records the port role.
    pub const fn set_role(&mut self, role: PtpRole) {
        self.role = role;
    }

    /// Alias under which metrics for this interface are reported.
    #[must_use]
    pub fn alias_name(&self) -> Option<&str> {
        self.alias_name.as_deref()
    }

    /// Records the metrics alias.
    pub fn set_alias_name(&mut self, alias: impl Into<String>) {
        self.alias_name = Some(alias.into());
    }

    /// Number of offsets folded into the window.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Rolling mean offset.
    #[must_use]
    pub const fn mean(&self) -> f64 {
        self.mean_ns
    }

    /// Smallest offset seen.
    #[must_use]
    pub const fn min(&self) -> i64 {
        self.min_ns
    }

    /// Largest offset seen.
    #[must_use]
    pub const fn max(&self) -> i64 {
        self.max_ns
    }
}

/// Concurrent map `ConfigName → Iface → Stats`.
#[derive(Debug, Default)]
pub struct StatsStore {
    inner: RwLock<HashMap<ConfigName, HashMap<Iface, Stats>>>,
}

impl StatsStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against the record for `(config, iface)`, creating it lazily
    /// on first touch. The write lock is held only for the duration of `f`,
    /// which must not perform I/O.
    pub fn with_stats<R>(
        &self,
        config: &ConfigName,
        iface: &Iface,
        f: impl FnOnce(&mut Stats) -> R,
    ) -> R {
        let mut inner = self.inner.write().unwrap();
        let stats = inner
            .entry(config.clone())
            .or_default()
            .entry(iface.clone())
            .or_insert_with(|| Stats::new(config.as_str()));
        f(stats)
    }

    /// Returns a snapshot of the record for `(config, iface)`, if present.
    /// The snapshot is for logging and read-side queries only.
    #[must_use]
    pub fn snapshot(&self, config: &ConfigName, iface: &Iface) -> Option<Stats> {
        self.inner
            .read()
            .unwrap()
            .get(config)
            .and_then(|m| m.get(iface))
            .cloned()
    }

    /// Applies `from → to` on the record's sync state without creating it.
    /// Returns the record's last offset when the transition applied, `None`
    /// when the record is missing or in a different state.
    pub fn transition(
        &self,
        config: &ConfigName,
        iface: &Iface,
        from: SyncState,
        to: SyncState,
    ) -> Option<i64> {
        let mut inner = self.inner.write().unwrap();
        let stats = inner.get_mut(config)?.get_mut(iface)?;
        if stats.last_sync_state() != from {
            return None;
        }
        stats.set_last_sync_state(to);
        Some(stats.last_offset())
    }

    /// Returns snapshots of every record. Order is unspecified.
    #[must_use]
    pub fn all(&self) -> Vec<(ConfigName, Iface, Stats)> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .flat_map(|(config, ifaces)| {
                ifaces
                    .iter()
                    .map(|(iface, stats)| (config.clone(), iface.clone(), stats.clone()))
            })
            .collect()
    }

    /// Deletes the record for `(config, iface)`.
    pub fn delete(&self, config: &ConfigName, iface: &Iface) {
        let mut inner = self.inner.write().unwrap();
        if let Some(ifaces) = inner.get_mut(config) {
            ifaces.remove(iface);
        }
    }

    /// Deletes every record under `config`.
    pub fn delete_config(&self, config: &ConfigName) {
        self.inner.write().unwrap().remove(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> (ConfigName, Iface) {
        (ConfigName::from("ptp4l.0.config"), Iface::from("ens1f0"))
    }

    #[test]
    fn rolling_window_tracks_mean_min_max() {
        let mut stats = Stats::new("ptp4l.0.config");
        for offset in [10, -20, 40] {
            stats.add_value(offset);
        }
        assert_eq!(stats.count(), 3);
        assert_eq!(stats.min(), -20);
        assert_eq!(stats.max(), 40);
        assert!((stats.mean() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn first_value_initializes_window() {
        let mut stats = Stats::new("c");
        stats.add_value(-5);
        assert_eq!(stats.min(), -5);
        assert_eq!(stats.max(), -5);
        assert!((stats.mean() - (-5.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn exactly_one_record_per_key() {
        let store = StatsStore::new();
        let (config, iface) = key();

        store.with_stats(&config, &iface, |s| s.add_value(1));
        store.with_stats(&config, &iface, |s| s.add_value(2));

        let snapshot = store.snapshot(&config, &iface).expect("record exists");
        assert_eq!(snapshot.count(), 2);
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn transition_requires_expected_state() {
        let store = StatsStore::new();
        let (config, iface) = key();
        store.with_stats(&config, &iface, |s| {
            s.set_last_sync_state(SyncState::Holdover);
            s.set_last_offset(77);
        });

        assert_eq!(
            store.transition(&config, &iface, SyncState::Locked, SyncState::Freerun),
            None
        );
        assert_eq!(
            store.transition(&config, &iface, SyncState::Holdover, SyncState::Freerun),
            Some(77)
        );
        let snapshot = store.snapshot(&config, &iface).expect("record exists");
        assert_eq!(snapshot.last_sync_state(), SyncState::Freerun);
    }

    #[test]
    fn transition_does_not_create_records() {
        let store = StatsStore::new();
        let (config, iface) = key();
        assert_eq!(
            store.transition(&config, &iface, SyncState::Holdover, SyncState::Freerun),
            None
        );
        assert!(store.snapshot(&config, &iface).is_none());
    }

    #[test]
    fn delete_config_removes_all_interfaces() {
        let store = StatsStore::new();
        let config = ConfigName::from("ptp4l.0.config");
        store.with_stats(&config, &Iface::from("ens1f0"), |_| ());
        store.with_stats(&config, &Iface::from("ens1f1"), |_| ());

        store.delete_config(&config);
        assert!(store.all().is_empty());
    }

    #[test]
    fn clock_class_change_detection() {
        let mut stats = Stats::new("c");
        assert!(stats.set_clock_class(6));
        assert!(!stats.set_clock_class(6));
        assert!(stats.set_clock_class(7));
        assert_eq!(stats.last_clock_class(), Some(7));
    }
}

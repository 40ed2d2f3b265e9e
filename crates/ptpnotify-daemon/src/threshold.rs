//! Clock threshold registry.
//!
//! Holds the per-profile offset thresholds and hold-over timeout the engine
//! evaluates samples against. The write path is a single task (the
//! configuration watcher); readers get copy-on-read snapshots so no lock is
//! held while a sample is processed.
//!
//! Every registry entry owns a close signal. Replacing or removing the entry
//! fires the signal, so hold-over timers started against the old generation
//! exit immediately instead of running out their full timeout.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

/// Default hold-over timeout.
pub const DEFAULT_HOLDOVER_TIMEOUT_SECS: u64 = 5;

/// Default upper offset bound in nanoseconds.
pub const DEFAULT_MAX_OFFSET_NS: i64 = 100;

/// Default lower offset bound in nanoseconds.
pub const DEFAULT_MIN_OFFSET_NS: i64 = -100;

/// Numeric limits of a clock threshold.
///
/// `max_offset_ns` is non-negative and `min_offset_ns` non-positive; an
/// entry violating that ordering is an engine-level fault and reads of it
/// fall back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdLimits {
    /// Hold-over timeout in seconds.
    #[serde(default = "default_holdover_secs")]
    pub hold_over_timeout_secs: u64,

    /// Inclusive upper offset bound in nanoseconds.
    #[serde(default = "default_max_offset")]
    pub max_offset_ns: i64,

    /// Inclusive lower offset bound in nanoseconds.
    #[serde(default = "default_min_offset")]
    pub min_offset_ns: i64,
}

const fn default_holdover_secs() -> u64 {
    DEFAULT_HOLDOVER_TIMEOUT_SECS
}

const fn default_max_offset() -> i64 {
    DEFAULT_MAX_OFFSET_NS
}

const fn default_min_offset() -> i64 {
    DEFAULT_MIN_OFFSET_NS
}

impl Default for ThresholdLimits {
    fn default() -> Self {
        Self {
            hold_over_timeout_secs: DEFAULT_HOLDOVER_TIMEOUT_SECS,
            max_offset_ns: DEFAULT_MAX_OFFSET_NS,
            min_offset_ns: DEFAULT_MIN_OFFSET_NS,
        }
    }
}

impl ThresholdLimits {
    /// Returns `true` when `max >= 0 >= min` holds.
    #[must_use]
    pub const fn is_ordered(&self) -> bool {
        self.max_offset_ns >= 0 && self.min_offset_ns <= 0
    }

    /// Inclusive range check against both bounds.
    #[must_use]
    pub const fn in_range(&self, offset_ns: i64) -> bool {
        self.min_offset_ns <= offset_ns && offset_ns <= self.max_offset_ns
    }

    /// Hold-over timeout as a [`Duration`].
    #[must_use]
    pub const fn hold_over_timeout(&self) -> Duration {
        Duration::from_secs(self.hold_over_timeout_secs)
    }
}

/// Read-side view of a threshold: the limits plus a handle on the entry's
/// close signal.
#[derive(Debug, Clone)]
pub struct ThresholdSnapshot {
    /// The numeric limits at snapshot time.
    pub limits: ThresholdLimits,
    close: watch::Receiver<bool>,
}

impl ThresholdSnapshot {
    /// Completes when this threshold generation is retired (replaced or
    /// removed). Never completes for the built-in default threshold.
    pub async fn closed(mut self) {
        if self.close.wait_for(|closed| *closed).await.is_err() {
            // The sender is only dropped without firing when the whole
            // registry goes away; callers also watch the daemon shutdown
            // signal, so park here instead of reporting a spurious close.
            std::future::pending::<()>().await;
        }
    }
}

struct ThresholdEntry {
    limits: ThresholdLimits,
    close_tx: watch::Sender<bool>,
}

impl ThresholdEntry {
    fn new(limits: ThresholdLimits) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self { limits, close_tx }
    }

    fn snapshot(&self) -> ThresholdSnapshot {
        ThresholdSnapshot {
            limits: self.limits,
            close: self.close_tx.subscribe(),
        }
    }

    fn fire_close(&self) {
        let _ = self.close_tx.send(true);
    }
}

/// Concurrent map from profile name to clock threshold.
#[derive(Default)]
pub struct ThresholdRegistry {
    inner: RwLock<HashMap<String, ThresholdEntry>>,
}

impl ThresholdRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the threshold for `profile`.
    ///
    /// Fallback chain: exact match, then the first entry in map iteration
    /// order (one threshold per config is the common case; the iteration
    /// order is unspecified and callers must not rely on it when profiles
    /// overlap), then the hard-coded defaults.
    ///
    /// A stored entry whose limits violate `max >= 0 >= min` is reported and
    /// read as the defaults, keeping its close signal.
    #[must_use]
    pub fn get(&self, profile: &str) -> ThresholdSnapshot {
        let inner = self.inner.read().unwrap();
        let entry = inner.get(profile).or_else(|| inner.values().next());
        match entry {
            Some(entry) if entry.limits.is_ordered() => entry.snapshot(),
            Some(entry) => {
                warn!(
                    profile,
                    threshold_min = entry.limits.min_offset_ns,
                    threshold_max = entry.limits.max_offset_ns,
                    "misordered threshold bounds, falling back to defaults"
                );
                ThresholdSnapshot {
                    limits: ThresholdLimits::default(),
                    close: entry.close_tx.subscribe(),
                }
            },
            None => Self::default_snapshot(),
        }
    }

    /// Installs the threshold for `profile`.
    ///
    /// A changed threshold replaces the entry atomically: the new close
    /// signal is installed first, then the old generation's signal fires.
    /// Setting identical limits is a no-op so running hold-over timers are
    /// not disturbed by redundant configuration updates.
    pub fn set(&self, profile: &str, limits: ThresholdLimits) {
        let old = {
            let mut inner = self.inner.write().unwrap();
            let unchanged = inner.get(profile).is_some_and(|e| e.limits == limits);
            if unchanged {
                return;
            }
            inner.insert(profile.to_string(), ThresholdEntry::new(limits))
        };
        if let Some(old) = old {
            old.fire_close();
        }
    }

    /// Removes the threshold for `profile`, firing its close signal.
    /// Returns `true` when an entry existed.
    pub fn remove(&self, profile: &str) -> bool {
        let old = self.inner.write().unwrap().remove(profile);
        match old {
            Some(entry) => {
                entry.fire_close();
                true
            },
            None => false,
        }
    }

    /// Returns the registered profile names. Order is unspecified.
    #[must_use]
    pub fn profiles(&self) -> Vec<String> {
        self.inner.read().unwrap().keys().cloned().collect()
    }

    fn default_snapshot() -> ThresholdSnapshot {
        // Receiver whose sender is gone: closed() parks forever, which is
        // the wanted behavior for the built-in defaults.
        let (tx, rx) = watch::channel(false);
        drop(tx);
        ThresholdSnapshot {
            limits: ThresholdLimits::default(),
            close: rx,
        }
    }
}

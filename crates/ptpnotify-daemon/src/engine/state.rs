//! Pure state-transition rules.
//!
//! One sample is evaluated against the previously published state and the
//! in-range flag; the result says whether to publish, what to publish and
//! how to update the rolling statistics. Keeping this free of I/O and locks
//! makes the transition table testable cell by cell, and keeps the panic
//! barrier out of the decision logic.
//!
//! Rule summary:
//!
//! - LOCKED is re-announced when re-entering range after FREERUN;
//! - an out-of-range sample while LOCKED downgrades to FREERUN;
//! - HOLDOVER is never preempted by an in-range sample, since hold-over encodes a
//!   structural outage (master loss) the offset alone cannot contradict;
//! - a sample with an unclassified previous state is announced after the
//!   range check (an out-of-range LOCKED sample is reported as FREERUN);
//! - an unclassified *current* state is announced best-effort as a plain
//!   state-change event, again after the range check.

use ptpnotify_core::event::SyncState;

/// What to do with the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Drop the sample entirely.
    Ignore,

    /// Record the offset into the rolling window; publish nothing.
    RecordOffset,

    /// Publish `state`, record the last offset, and fold the offset into
    /// the rolling window when `record_value` is set.
    Publish { state: SyncState, record_value: bool },
}

/// Evaluation result for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Decision {
    /// The action to take.
    pub action: Action,

    /// An unclassified state was involved; log a warning.
    pub warn_unknown: bool,

    /// Publish under the generic state-change event type instead of the
    /// sample's own event type.
    pub force_state_change: bool,
}

impl Decision {
    const fn ignore() -> Self {
        Self {
            action: Action::Ignore,
            warn_unknown: false,
            force_state_change: false,
        }
    }

    const fn record_offset() -> Self {
        Self {
            action: Action::RecordOffset,
            warn_unknown: false,
            force_state_change: false,
        }
    }

    const fn publish(state: SyncState, record_value: bool) -> Self {
        Self {
            action: Action::Publish {
                state,
                record_value,
            },
            warn_unknown: false,
            force_state_change: false,
        }
    }
}

/// Evaluates one sample. `last` is the previously published state for the
/// interface, `current` the state carried by the sample, `in_range` whether
/// the offset satisfies the threshold bounds.
pub(crate) fn evaluate(last: SyncState, current: SyncState, in_range: bool) -> Decision {
    match current {
        SyncState::Locked => match last {
            // Already announced FREERUN; re-announce LOCKED only once the
            // offset is back in range.
            SyncState::Freerun => {
                if in_range {
                    Decision::publish(SyncState::Locked, true)
                } else {
                    Decision::ignore()
                }
            },
            SyncState::Locked => {
                if in_range {
                    Decision::record_offset()
                } else {
                    Decision::publish(SyncState::Freerun, false)
                }
            },
            // The hold-over timer owns the exit from HOLDOVER.
            SyncState::Holdover => Decision::ignore(),
            SyncState::Unknown => {
                let state = if in_range {
                    SyncState::Locked
                } else {
                    SyncState::Freerun
                };
                Decision {
                    warn_unknown: true,
                    ..Decision::publish(state, false)
                }
            },
        },
        SyncState::Freerun => {
            if last == SyncState::Freerun {
                Decision::ignore()
            } else {
                Decision::publish(SyncState::Freerun, true)
            }
        },
        // Unclassified or out-of-band current state: warn and announce
        // best-effort under the generic state-change type.
        other => {
            let state = if in_range { other } else { SyncState::Freerun };
            Decision {
                warn_unknown: true,
                force_state_change: true,
                ..Decision::publish(state, false)
            }
        },
    }
}

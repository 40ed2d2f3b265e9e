//! Scoped hold-over timers.
//!
//! One timer task runs per `(config, iface)` in HOLDOVER. It exits on the
//! first of: timeout expiry, the owning threshold generation's close signal,
//! or daemon shutdown. Expiry and close both emit FREERUN and update stats;
//! shutdown exits silently.
//!
//! The timer owns a [`HoldoverCtx`] handle struct rather than the whole
//! engine: the stats store, the hold-over bookkeeping set, the bus sender
//! and the state-change publisher address, cloned at spawn time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ptpnotify_core::channel::DataChan;
use ptpnotify_core::event::{Event, EventData, EventType, SyncState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::Shutdown;
use crate::metrics::ProxyMetrics;
use crate::ptp4lconf::{ConfigName, Iface};
use crate::stats::StatsStore;
use crate::threshold::ThresholdSnapshot;

/// Everything a hold-over timer needs from the engine.
pub(super) struct HoldoverCtx {
    pub stats: Arc<StatsStore>,
    pub active: Arc<Mutex<HashSet<(ConfigName, Iface)>>>,
    pub out_tx: mpsc::Sender<DataChan>,
    pub metrics: Arc<ProxyMetrics>,
    /// Address of the state-change publisher; `None` only when publisher
    /// registration was skipped, in which case the timer still flips the
    /// stats back but cannot emit.
    pub publisher_address: Option<String>,
    /// Rendered event source for the interface.
    pub event_source: String,
}

pub(super) fn spawn(
    ctx: HoldoverCtx,
    config: ConfigName,
    iface: Iface,
    timeout: Duration,
    threshold: ThresholdSnapshot,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let emit = tokio::select! {
            () = tokio::time::sleep(timeout) => {
                debug!(config_name = %config, iface = %iface, "hold-over timer expired");
                true
            }
            () = threshold.closed() => {
                debug!(config_name = %config, iface = %iface, "threshold retired, ending hold-over");
                true
            }
            () = shutdown.closed() => false,
        };

        if emit {
            // Exit hold-over only if the interface is still in it; the
            // stats record may be gone when the profile was retired.
            if let Some(offset) =
                ctx.stats
                    .transition(&config, &iface, SyncState::Holdover, SyncState::Freerun)
            {
                if let Some(address) = &ctx.publisher_address {
                    let data =
                        EventData::state_and_metric(&ctx.event_source, SyncState::Freerun, offset);
                    let event = Event::new(EventType::PtpStateChange, address.clone(), data);
                    if ctx
                        .out_tx
                        .send(DataChan::event(address.clone(), event))
                        .await
                        .is_err()
                    {
                        warn!(iface = %iface, "event bus closed, dropping hold-over exit event");
                        ctx.metrics.event_dropped("bus-closed");
                    } else {
                        ctx.metrics.event_published(EventType::PtpStateChange);
                    }
                }
                ctx.metrics.state_transition(SyncState::Freerun);
            }
        }

        ctx.active
            .lock()
            .unwrap()
            .remove(&(config.clone(), iface.clone()));
    })
}

//! End-to-end engine scenarios: lock acquisition, range violation, master
//! loss with hold-over, and threshold hot-swap.

use std::sync::Arc;
use std::time::Duration;

use ptpnotify_core::channel::DataChan;
use ptpnotify_core::event::{DataType, EventType, EventValue, SyncState};
use ptpnotify_core::resource::ResourceTemplate;
use ptpnotify_core::store::{PubSubStore, StoreKind};
use ptpnotify_daemon::bus::{shutdown_channel, ShutdownHandle};
use ptpnotify_daemon::engine::{PtpConfigUpdate, PtpEventManager, PtpProfile};
use ptpnotify_daemon::metrics::ProxyMetrics;
use ptpnotify_daemon::ptp4lconf::{ConfigName, Iface};
use ptpnotify_daemon::threshold::{ThresholdLimits, DEFAULT_MAX_OFFSET_NS};
use tokio::sync::mpsc;

struct Harness {
    engine: Arc<PtpEventManager>,
    out_rx: mpsc::Receiver<DataChan>,
    _shutdown: ShutdownHandle,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let publishers = PubSubStore::open(dir.path(), StoreKind::Publisher).expect("open store");
    let (out_tx, out_rx) = mpsc::channel(32);
    let (shutdown_handle, shutdown) = shutdown_channel();
    let metrics = Arc::new(ProxyMetrics::new().expect("metrics"));

    let mut engine = PtpEventManager::new(
        "worker-0",
        ResourceTemplate::default(),
        out_tx,
        metrics,
        shutdown,
    );
    engine
        .register_publishers(&publishers, "http://localhost:9085/api/cloudNotifications/v1/")
        .expect("register publishers");

    Harness {
        engine: Arc::new(engine),
        out_rx,
        _shutdown: shutdown_handle,
        _dir: dir,
    }
}

fn limits(hold: u64, max: i64, min: i64) -> ThresholdLimits {
    ThresholdLimits {
        hold_over_timeout_secs: hold,
        max_offset_ns: max,
        min_offset_ns: min,
    }
}

fn published_state(msg: &DataChan) -> SyncState {
    let event = msg.data.as_ref().expect("event payload");
    let value = event
        .data
        .values
        .iter()
        .find(|v| v.data_type == DataType::Notification)
        .expect("notification value");
    match value.value {
        EventValue::State(state) => state,
        EventValue::Decimal(_) => panic!("notification carried a decimal"),
    }
}

fn published_offset(msg: &DataChan) -> i64 {
    let event = msg.data.as_ref().expect("event payload");
    let value = event
        .data
        .values
        .iter()
        .find(|v| v.data_type == DataType::Metric)
        .expect("metric value");
    match value.value {
        EventValue::Decimal(offset) => offset,
        EventValue::State(_) => panic!("metric carried a state"),
    }
}

async fn recv(rx: &mut mpsc::Receiver<DataChan>) -> DataChan {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("out channel closed")
}

#[tokio::test]
async fn s1_lock_acquisition() {
    let mut h = harness();
    h.engine.thresholds().set("profile", limits(5, 100, -100));
    let config = ConfigName::from("ptp4l.0.config");
    let iface = Iface::from("ens1f0");

    h.engine
        .on_sample(
            "profile",
            &config,
            &iface,
            0,
            SyncState::Freerun,
            EventType::PtpStateChange,
        )
        .await;
    h.engine
        .on_sample(
            "profile",
            &config,
            &iface,
            42,
            SyncState::Locked,
            EventType::PtpStateChange,
        )
        .await;

    let first = recv(&mut h.out_rx).await;
    assert_eq!(published_state(&first), SyncState::Freerun);

    let second = recv(&mut h.out_rx).await;
    assert_eq!(published_state(&second), SyncState::Locked);
    assert_eq!(published_offset(&second), 42);

    // No clock-class change was emitted.
    assert!(h.out_rx.try_recv().is_err());
}

#[tokio::test]
async fn s2_range_violation_downgrades_to_freerun() {
    let mut h = harness();
    h.engine.thresholds().set("profile", limits(5, 100, -100));
    let config = ConfigName::from("ptp4l.0.config");
    let iface = Iface::from("ens1f0");

    h.engine
        .on_sample(
            "profile",
            &config,
            &iface,
            0,
            SyncState::Freerun,
            EventType::PtpStateChange,
        )
        .await;
    h.engine
        .on_sample(
            "profile",
            &config,
            &iface,
            42,
            SyncState::Locked,
            EventType::PtpStateChange,
        )
        .await;
    let _freerun = recv(&mut h.out_rx).await;
    let _locked = recv(&mut h.out_rx).await;

    h.engine
        .on_sample(
            "profile",
            &config,
            &iface,
            500,
            SyncState::Locked,
            EventType::PtpStateChange,
        )
        .await;
    let violation = recv(&mut h.out_rx).await;
    assert_eq!(published_state(&violation), SyncState::Freerun);
    assert_eq!(published_offset(&violation), 500);

    let stats = h
        .engine
        .stats()
        .snapshot(&config, &iface)
        .expect("stats recorded");
    assert_eq!(stats.last_sync_state(), SyncState::Freerun);
    assert_eq!(stats.last_offset(), 500);
}

#[tokio::test]
async fn in_range_locked_samples_do_not_reemit() {
    let mut h = harness();
    h.engine.thresholds().set("profile", limits(5, 100, -100));
    let config = ConfigName::from("ptp4l.0.config");
    let iface = Iface::from("ens1f0");

    for (offset, state) in [(0, SyncState::Freerun), (10, SyncState::Locked)] {
        h.engine
            .on_sample(
                "profile",
                &config,
                &iface,
                offset,
                state,
                EventType::PtpStateChange,
            )
            .await;
    }
    let _ = recv(&mut h.out_rx).await;
    let _ = recv(&mut h.out_rx).await;

    // A steady stream of in-range LOCKED samples only updates the window.
    for offset in [11, -3, 25] {
        h.engine
            .on_sample(
                "profile",
                &config,
                &iface,
                offset,
                SyncState::Locked,
                EventType::PtpStateChange,
            )
            .await;
    }
    assert!(h.out_rx.try_recv().is_err());

    let stats = h
        .engine
        .stats()
        .snapshot(&config, &iface)
        .expect("stats recorded");
    assert_eq!(stats.last_offset(), 25);
    assert_eq!(stats.min(), -3);
}

#[tokio::test(start_paused = true)]
async fn s3_master_loss_holdover_then_freerun() {
    let mut h = harness();
    h.engine.thresholds().set("profile", limits(5, 100, -100));
    let config = ConfigName::from("ptp4l.0.config");
    let iface = Iface::from("ens1f0");

    h.engine
        .on_sample(
            "profile",
            &config,
            &iface,
            0,
            SyncState::Freerun,
            EventType::PtpStateChange,
        )
        .await;
    h.engine
        .on_sample(
            "profile",
            &config,
            &iface,
            10,
            SyncState::Locked,
            EventType::PtpStateChange,
        )
        .await;
    let _ = recv(&mut h.out_rx).await;
    let _ = recv(&mut h.out_rx).await;

    h.engine.on_master_loss("profile", &config, &iface).await;
    let holdover = recv(&mut h.out_rx).await;
    assert_eq!(published_state(&holdover), SyncState::Holdover);
    // Let the spawned timer task register its sleep before the clock moves.
    tokio::task::yield_now().await;

    // An in-range LOCKED sample during hold-over produces no event.
    h.engine
        .on_sample(
            "profile",
            &config,
            &iface,
            0,
            SyncState::Locked,
            EventType::PtpStateChange,
        )
        .await;
    assert!(h.out_rx.try_recv().is_err());

    // A second loss while the timer runs is idempotent.
    h.engine.on_master_loss("profile", &config, &iface).await;
    assert!(h.out_rx.try_recv().is_err());

    // The hold-over timer fires after 5 s (virtual time) and emits FREERUN.
    tokio::time::advance(Duration::from_secs(6)).await;
    let freerun = recv(&mut h.out_rx).await;
    assert_eq!(published_state(&freerun), SyncState::Freerun);

    let stats = h
        .engine
        .stats()
        .snapshot(&config, &iface)
        .expect("stats recorded");
    assert_eq!(stats.last_sync_state(), SyncState::Freerun);

    // After the timer exits, a new master loss starts a fresh hold-over.
    h.engine.on_master_loss("profile", &config, &iface).await;
    let again = recv(&mut h.out_rx).await;
    assert_eq!(published_state(&again), SyncState::Holdover);
}

#[tokio::test]
async fn s5_threshold_hot_swap() {
    let mut h = harness();
    h.engine.thresholds().set("profile", limits(5, 100, -100));
    let config = ConfigName::from("ptp4l.0.config");
    let locked_iface = Iface::from("ens1f0");
    let holdover_iface = Iface::from("ens1f1");

    // ens1f0 ends up LOCKED at offset 50.
    for (offset, state) in [(0, SyncState::Freerun), (50, SyncState::Locked)] {
        h.engine
            .on_sample(
                "profile",
                &config,
                &locked_iface,
                offset,
                state,
                EventType::PtpStateChange,
            )
            .await;
    }
    let _ = recv(&mut h.out_rx).await;
    let _ = recv(&mut h.out_rx).await;

    // ens1f1 ends up in HOLDOVER.
    for (offset, state) in [(0, SyncState::Freerun), (5, SyncState::Locked)] {
        h.engine
            .on_sample(
                "profile",
                &config,
                &holdover_iface,
                offset,
                state,
                EventType::PtpStateChange,
            )
            .await;
    }
    let _ = recv(&mut h.out_rx).await;
    let _ = recv(&mut h.out_rx).await;
    h.engine
        .on_master_loss("profile", &config, &holdover_iface)
        .await;
    let _holdover = recv(&mut h.out_rx).await;

    // Hot-swap the threshold: max 100 -> 10.
    h.engine.thresholds().set("profile", limits(5, 10, -10));

    // The old generation's close signal ends ens1f1's hold-over early.
    let closed = recv(&mut h.out_rx).await;
    assert_eq!(published_state(&closed), SyncState::Freerun);
    let event = closed.data.as_ref().expect("event payload");
    assert!(event.data.values[0].resource.contains("ens1f1"));

    // The next LOCKED sample at 50 now violates the narrowed range.
    h.engine
        .on_sample(
            "profile",
            &config,
            &locked_iface,
            50,
            SyncState::Locked,
            EventType::PtpStateChange,
        )
        .await;
    let downgraded = recv(&mut h.out_rx).await;
    assert_eq!(published_state(&downgraded), SyncState::Freerun);
    assert_eq!(published_offset(&downgraded), 50);
}

#[tokio::test]
async fn config_change_retires_vanished_profiles() {
    let mut h = harness();
    let config = ConfigName::from("ptp4l.0.config");
    let iface = Iface::from("ens1f0");

    let update = PtpConfigUpdate {
        profiles: vec![PtpProfile {
            name: "grandmaster".to_string(),
            config_name: config.clone(),
            thresholds: limits(5, 40, -40),
        }],
    };
    h.engine.on_config_change(&update);
    assert_eq!(h.engine.thresholds().get("grandmaster").limits.max_offset_ns, 40);

    h.engine
        .on_sample(
            "grandmaster",
            &config,
            &iface,
            0,
            SyncState::Freerun,
            EventType::PtpStateChange,
        )
        .await;
    let _ = recv(&mut h.out_rx).await;
    assert!(h.engine.stats().snapshot(&config, &iface).is_some());

    // The profile vanishes from the next update.
    h.engine.on_config_change(&PtpConfigUpdate::default());
    assert!(h.engine.stats().snapshot(&config, &iface).is_none());
    assert_eq!(
        h.engine.thresholds().get("grandmaster").limits.max_offset_ns,
        DEFAULT_MAX_OFFSET_NS
    );
}

#[tokio::test]
async fn clock_class_events_only_fire_on_change() {
    let mut h = harness();
    let config = ConfigName::from("ptp4l.0.config");
    let iface = Iface::from("ens1f0");

    h.engine.on_clock_class(&config, &iface, 6).await;
    let first = recv(&mut h.out_rx).await;
    let event = first.data.as_ref().expect("event payload");
    assert_eq!(event.event_type, EventType::PtpClockClassChange);
    // Clock-class events carry the METRIC entry only.
    assert_eq!(event.data.values.len(), 1);
    assert_eq!(published_offset(&first), 6);

    h.engine.on_clock_class(&config, &iface, 6).await;
    assert!(h.out_rx.try_recv().is_err());

    h.engine.on_clock_class(&config, &iface, 7).await;
    let second = recv(&mut h.out_rx).await;
    assert_eq!(published_offset(&second), 7);
}

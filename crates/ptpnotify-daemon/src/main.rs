//! ptpnotify-daemon: the PTP event notification sidecar.
//!
//! Bring-up order: configuration, stores, bus, engine (publisher
//! registration), transport plugin, dispatchers, REST API. SIGTERM/SIGINT
//! fire the daemon-wide close signal; dispatchers drain at most one more
//! message each and every long-lived task exits within the drain budget.
//!
//! Exit codes: 0 on clean shutdown, 1 on a fatal configuration error, 2
//! when the REST API cannot bind.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use ptpnotify_core::store::{PubSubStore, StoreKind};
use ptpnotify_daemon::api::{self, AppState};
use ptpnotify_daemon::bus::{self, EventBus, InDispatcher, OutDispatcher};
use ptpnotify_daemon::config::{ConfigOverrides, DaemonConfig};
use ptpnotify_daemon::engine::PtpEventManager;
use ptpnotify_daemon::metrics::ProxyMetrics;
use ptpnotify_daemon::transport::{self, TransportError};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const EXIT_FATAL_CONFIG: u8 = 1;
const EXIT_FATAL_BIND: u8 = 2;

/// PTP event notification sidecar.
#[derive(Parser, Debug)]
#[command(name = "ptpnotify-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// REST API port.
    #[arg(long)]
    api_port: Option<u16>,

    /// REST API path prefix.
    #[arg(long)]
    api_path: Option<String>,

    /// Directory for subscription persistence (falls back to $STORE_PATH,
    /// then ".").
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Node identity injected into resource templates (falls back to
    /// $NODE_NAME).
    #[arg(long)]
    node_name: Option<String>,

    /// Transport plugin, AMQP or HTTP (falls back to $PTP_PLUGIN; none
    /// means local-only delivery).
    #[arg(long)]
    transport: Option<String>,

    /// Transport endpoint, <kind>:<host>:<port>.
    #[arg(long)]
    transport_host: Option<String>,

    /// Bus channel capacity.
    #[arg(long)]
    channel_capacity: Option<usize>,

    /// Resource prefix template with two %s placeholders.
    #[arg(long)]
    resource_prefix: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let overrides = ConfigOverrides {
        api_port: args.api_port,
        api_path: args.api_path,
        store_path: args.store_path,
        node_name: args.node_name,
        plugin: args.transport,
        transport_host: args.transport_host,
        channel_capacity: args.channel_capacity,
        resource_prefix: args.resource_prefix,
    };
    let config = match DaemonConfig::resolve(overrides) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "fatal configuration error");
            return ExitCode::from(EXIT_FATAL_CONFIG);
        },
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to create runtime");
            return ExitCode::from(EXIT_FATAL_CONFIG);
        },
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Bind(e)) => {
            error!(error = %e, "fatal bind error");
            ExitCode::from(EXIT_FATAL_BIND)
        },
        Err(RunError::Fatal(e)) => {
            error!(error = %e, "fatal error");
            ExitCode::from(EXIT_FATAL_CONFIG)
        },
    }
}

async fn run(config: DaemonConfig) -> Result<(), RunError> {
    info!(
        node_name = %config.node_name,
        store_path = %config.store_path.display(),
        channel_capacity = config.channel_capacity,
        "starting ptpnotify daemon"
    );

    let metrics = Arc::new(
        ProxyMetrics::new().map_err(|e| RunError::Fatal(anyhow::Error::new(e)))?,
    );
    let publishers = Arc::new(
        PubSubStore::open(&config.store_path, StoreKind::Publisher)
            .map_err(|e| RunError::Fatal(anyhow::Error::new(e)))?,
    );
    let subscriptions = Arc::new(
        PubSubStore::open(&config.store_path, StoreKind::Subscription)
            .map_err(|e| RunError::Fatal(anyhow::Error::new(e)))?,
    );

    let (shutdown_handle, shutdown) = bus::shutdown_channel();
    let mut event_bus = EventBus::new(config.channel_capacity);

    let mut engine = PtpEventManager::new(
        &config.node_name,
        config.resource_prefix.clone(),
        event_bus.out_sender(),
        Arc::clone(&metrics),
        shutdown.clone(),
    );
    engine
        .register_publishers(&publishers, &config.api_base())
        .map_err(|e| RunError::Fatal(anyhow::Error::new(e)))?;
    let engine = Arc::new(engine);

    let mut out_dispatcher = OutDispatcher::new(
        event_bus.take_out_receiver(),
        Arc::clone(&subscriptions),
        Arc::clone(&metrics),
        shutdown.clone(),
    );

    // Transport plugin: start failure is a recoverable degradation, not a
    // fatal error. Local subscribers keep receiving events either way.
    let mut plugin = None;
    if let Some(host) = &config.transport {
        let mut transport = transport::build(
            host,
            event_bus.in_sender(),
            shutdown.clone(),
            Arc::clone(&metrics),
            config.channel_capacity,
        );
        match transport.start().await {
            Ok(()) => info!(transport = transport.name(), host = %host, "transport plugin started"),
            Err(TransportError::Unavailable(e)) => warn!(
                transport = transport.name(),
                error = %e,
                "transport unavailable, continuing with local-only delivery"
            ),
            Err(e) => warn!(
                transport = transport.name(),
                error = %e,
                "transport failed to start, continuing with local-only delivery"
            ),
        }
        if let Some(sender) = transport.sender() {
            out_dispatcher.register_transport(transport.name(), sender);
        }
        plugin = Some(transport);
    } else {
        info!("no transport plugin configured, local-only delivery");
    }

    let in_dispatcher = InDispatcher::new(
        event_bus.take_in_receiver(),
        Arc::clone(&subscriptions),
        Arc::clone(&metrics),
        shutdown.clone(),
    );
    let out_task = tokio::spawn(out_dispatcher.run());
    let in_task = tokio::spawn(in_dispatcher.run());

    let app_state = Arc::new(AppState {
        publishers,
        subscriptions,
        engine: Arc::clone(&engine),
        metrics,
        api_base: config.api_base(),
    });
    let app = api::router(app_state, &config.api_path);
    let listener = TcpListener::bind(("0.0.0.0", config.api_port))
        .await
        .map_err(RunError::Bind)?;
    info!(port = config.api_port, path = %config.api_path, "REST API listening");

    let mut api_shutdown = shutdown.clone();
    let api_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_shutdown.closed().await })
            .await
    });

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("shutting down");
    shutdown_handle.signal();

    let drain = tokio::time::timeout(config.drain_timeout, async {
        let _ = out_task.await;
        let _ = in_task.await;
    });
    if drain.await.is_err() {
        warn!("dispatchers exceeded the drain budget");
    }
    if let Some(mut plugin) = plugin {
        plugin.stop().await;
    }
    if tokio::time::timeout(config.drain_timeout, api_task)
        .await
        .is_err()
    {
        warn!("API server exceeded the drain budget");
    }

    info!("shutdown complete");
    Ok(())
}

//! HTTP event fabric plugin.
//!
//! A local HTTP server on the configured host:port acts as the event
//! fabric: peers POST CloudEvents to `/event` and the receiver feeds them
//! into the bus's `in` channel. Peer discovery is handled outside the core.
//!
//! Outbound delivery does not go through this plugin; the out-dispatcher
//! already POSTs events to each subscriber's endpoint, so
//! [`Transport::sender`] returns `None` here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use ptpnotify_core::channel::DataChan;
use ptpnotify_core::event::Event;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::Shutdown;
use crate::metrics::ProxyMetrics;

use super::{Transport, TransportError, TransportHost};

/// Request body cap for the fabric endpoint.
const MAX_BODY_SIZE: usize = 64 * 1024;

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

struct FabricState {
    in_tx: mpsc::Sender<DataChan>,
    metrics: Arc<ProxyMetrics>,
}

/// The HTTP fabric plugin.
pub struct HttpTransport {
    host: TransportHost,
    in_tx: mpsc::Sender<DataChan>,
    shutdown: Shutdown,
    metrics: Arc<ProxyMetrics>,
    server: Option<JoinHandle<()>>,
    bound: Option<SocketAddr>,
}

impl HttpTransport {
    /// Builds the plugin.
    #[must_use]
    pub fn new(
        host: TransportHost,
        in_tx: mpsc::Sender<DataChan>,
        shutdown: Shutdown,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            host,
            in_tx,
            shutdown,
            metrics,
            server: None,
            bound: None,
        }
    }

    /// The address the fabric actually bound to (set after a successful
    /// [`Transport::start`]; useful with port 0).
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn sender(&self) -> Option<mpsc::Sender<DataChan>> {
        None
    }

    async fn start(&mut self) -> Result<(), TransportError> {
        let listener = TcpListener::bind((self.host.host.as_str(), self.host.port))
            .await
            .map_err(|e| {
                TransportError::Unavailable(format!(
                    "cannot bind event fabric on {}: {e}",
                    self.host.authority()
                ))
            })?;
        let bound = listener
            .local_addr()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        self.bound = Some(bound);

        let state = Arc::new(FabricState {
            in_tx: self.in_tx.clone(),
            metrics: Arc::clone(&self.metrics),
        });
        let app = Router::new()
            .route("/event", post(receive_event))
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .with_state(state);

        let mut shutdown = self.shutdown.clone();
        info!(addr = %bound, "http event fabric listening");
        self.server = Some(tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.closed().await });
            if let Err(e) = serve.await {
                error!(error = %e, "event fabric server failed");
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            let abort = server.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, server).await.is_err() {
                abort.abort();
            }
        }
    }
}

/// Accepts one CloudEvent from a fabric peer and feeds it to the `in`
/// channel. Blocks when the channel is full; that back-pressure is
/// intentional.
async fn receive_event(
    State(state): State<Arc<FabricState>>,
    Json(event): Json<Event>,
) -> StatusCode {
    let msg = DataChan::event(event.source.clone(), event);
    if state.in_tx.send(msg).await.is_err() {
        state.metrics.event_dropped("bus-closed");
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::ACCEPTED
    }
}

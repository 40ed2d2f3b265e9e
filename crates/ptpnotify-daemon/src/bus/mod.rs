//! The in-process event bus.
//!
//! Two bounded channels plus one dispatcher task each:
//!
//! - the **out** channel carries events produced by the engine or REST layer
//!   towards registered transport senders and local subscribers;
//! - the **in** channel carries messages arriving from a transport, routed
//!   by `(address, channel_type)`.
//!
//! Ordering is FIFO per channel; there is no ordering between the two.
//! Producers block when a channel is full; that is the back-pressure knob:
//! transport slowness propagates back into the engine so sample coalescing
//! happens upstream.
//!
//! Shutdown is cooperative. The supervisor fires the [`Shutdown`] signal;
//! each dispatcher observes it, drains at most one more message and
//! returns. Transport plugins and hold-over timers watch the same signal.
//!
//! Delivery failures are retried once immediately; a second failure is
//! counted, logged and the message dropped. The dispatchers never block on a
//! dead transport: hand-off to a transport sender uses `try_send`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use ptpnotify_core::channel::{ChannelStatus, ChannelType, DataChan};
use ptpnotify_core::store::PubSubStore;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::metrics::ProxyMetrics;

/// Default bus channel capacity. Increasing it trades delivery latency for
/// memory; size it to the expected sample rate times the worst-case
/// transport latency.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;

/// Per-request timeout for subscriber delivery.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

type HttpClient = Client<HttpConnector, Full<Bytes>>;

fn new_http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Creates the daemon-wide close signal.
#[must_use]
pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

/// Write end of the close signal, owned by the supervisor.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Fires the close signal. Idempotent.
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns a fresh read end.
    #[must_use]
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read end of the close signal. Every long-lived task selects on
/// [`Shutdown::closed`].
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Completes when the signal fires. A dropped [`ShutdownHandle`] counts
    /// as fired: the daemon is going away either way.
    pub async fn closed(&mut self) {
        if self.rx.wait_for(|closed| *closed).await.is_err() {
            // Sender gone; treat as closed.
        }
    }

    /// Returns `true` once the signal has fired.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }
}

/// The bounded channel pair. Receivers are taken once by the dispatchers.
#[derive(Debug)]
pub struct EventBus {
    in_tx: mpsc::Sender<DataChan>,
    out_tx: mpsc::Sender<DataChan>,
    in_rx: Option<mpsc::Receiver<DataChan>>,
    out_rx: Option<mpsc::Receiver<DataChan>>,
}

impl EventBus {
    /// Builds the channel pair with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        Self {
            in_tx,
            out_tx,
            in_rx: Some(in_rx),
            out_rx: Some(out_rx),
        }
    }

    /// Sender for the `in` channel (transport receivers feed this).
    #[must_use]
    pub fn in_sender(&self) -> mpsc::Sender<DataChan> {
        self.in_tx.clone()
    }

    /// Sender for the `out` channel (engine and REST feed this).
    #[must_use]
    pub fn out_sender(&self) -> mpsc::Sender<DataChan> {
        self.out_tx.clone()
    }

    /// Takes the `in` receiver. Panics if taken twice.
    #[must_use]
    pub fn take_in_receiver(&mut self) -> mpsc::Receiver<DataChan> {
        self.in_rx.take().expect("in receiver already taken")
    }

    /// Takes the `out` receiver. Panics if taken twice.
    #[must_use]
    pub fn take_out_receiver(&mut self) -> mpsc::Receiver<DataChan> {
        self.out_rx.take().expect("out receiver already taken")
    }
}

/// A transport sender registered with the out-dispatcher.
struct TransportSender {
    name: &'static str,
    tx: mpsc::Sender<DataChan>,
}

/// Dispatcher for the `out` channel: fans each event out to every registered
/// transport sender and HTTP-POSTs it to each matching local subscriber.
pub struct OutDispatcher {
    rx: mpsc::Receiver<DataChan>,
    transports: Vec<TransportSender>,
    subscriptions: Arc<PubSubStore>,
    client: HttpClient,
    metrics: Arc<ProxyMetrics>,
    shutdown: Shutdown,
}

impl OutDispatcher {
    /// Builds a dispatcher over the bus's out receiver.
    #[must_use]
    pub fn new(
        rx: mpsc::Receiver<DataChan>,
        subscriptions: Arc<PubSubStore>,
        metrics: Arc<ProxyMetrics>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            rx,
            transports: Vec::new(),
            subscriptions,
            client: new_http_client(),
            metrics,
            shutdown,
        }
    }

    /// Registers a transport sender. Must happen before [`Self::run`].
    pub fn register_transport(&mut self, name: &'static str, tx: mpsc::Sender<DataChan>) {
        self.transports.push(TransportSender { name, tx });
    }

    /// Runs the dispatch loop until the close signal fires (drains at most
    /// one more message) or all producers are gone.
    pub async fn run(mut self) {
        info!(
            transports = self.transports.len(),
            "out dispatcher started"
        );
        loop {
            tokio::select! {
                () = self.shutdown.closed() => {
                    if let Ok(msg) = self.rx.try_recv() {
                        self.dispatch(msg).await;
                    }
                    info!("out dispatcher stopped");
                    return;
                }
                maybe = self.rx.recv() => match maybe {
                    Some(msg) => self.dispatch(msg).await,
                    None => {
                        info!("out channel closed, dispatcher stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, msg: DataChan) {
        if msg.channel_type != ChannelType::Event || msg.data.is_none() {
            debug!(address = %msg.address, channel_type = %msg.channel_type, "ignoring non-event out message");
            return;
        }

        for transport in &self.transports {
            // try_send keeps the dispatcher from blocking on a dead
            // transport; one immediate retry, then drop.
            if transport.tx.try_send(msg.clone()).is_err() {
                self.metrics.transport_retry(transport.name);
                if transport.tx.try_send(msg.clone()).is_err() {
                    self.metrics.event_dropped("transport-busy");
                    warn!(
                        transport = transport.name,
                        address = %msg.address,
                        "transport sender full, dropping event"
                    );
                }
            }
        }

        deliver_to_subscribers(
            &self.client,
            &self.subscriptions,
            &self.metrics,
            &msg,
        )
        .await;
    }
}

/// Dispatcher for the `in` channel: routes messages arriving from a
/// transport by `(address, channel_type)`.
pub struct InDispatcher {
    rx: mpsc::Receiver<DataChan>,
    subscriptions: Arc<PubSubStore>,
    client: HttpClient,
    metrics: Arc<ProxyMetrics>,
    shutdown: Shutdown,
}

impl InDispatcher {
    /// Builds a dispatcher over the bus's in receiver.
    #[must_use]
    pub fn new(
        rx: mpsc::Receiver<DataChan>,
        subscriptions: Arc<PubSubStore>,
        metrics: Arc<ProxyMetrics>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            rx,
            subscriptions,
            client: new_http_client(),
            metrics,
            shutdown,
        }
    }

    /// Runs the routing loop until the close signal fires (drains at most
    /// one more message) or all producers are gone.
    pub async fn run(mut self) {
        info!("in dispatcher started");
        loop {
            tokio::select! {
                () = self.shutdown.closed() => {
                    if let Ok(msg) = self.rx.try_recv() {
                        self.route(msg).await;
                    }
                    info!("in dispatcher stopped");
                    return;
                }
                maybe = self.rx.recv() => match maybe {
                    Some(msg) => self.route(msg).await,
                    None => {
                        info!("in channel closed, dispatcher stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn route(&self, msg: DataChan) {
        match msg.channel_type {
            ChannelType::Event => {
                if let (Some(hook), Some(event)) = (&msg.process_event_fn, &msg.data) {
                    if !hook(event) {
                        debug!(address = %msg.address, "local consumer absorbed event");
                        return;
                    }
                }
                deliver_to_subscribers(&self.client, &self.subscriptions, &self.metrics, &msg)
                    .await;
            },
            ChannelType::Subscription => match msg.status {
                ChannelStatus::Delete => {
                    for record in self.subscriptions.find_by_resource(&msg.address) {
                        if let Some(id) = record.id.as_deref() {
                            if let Err(e) = self.subscriptions.delete(id) {
                                warn!(address = %msg.address, error = %e, "failed to delete subscription");
                            }
                        }
                    }
                },
                _ => debug!(
                    address = %msg.address,
                    status = %msg.status,
                    "subscription bookkeeping message"
                ),
            },
            ChannelType::Status => {
                if msg.status == ChannelStatus::Failed {
                    self.metrics.transport_connection_loss("remote");
                }
                debug!(address = %msg.address, status = %msg.status, "status message");
            },
            ChannelType::Publisher => {
                debug!(address = %msg.address, "publisher bookkeeping message");
            },
        }
    }
}

/// POSTs the event to every subscriber registered for the message's address.
/// One immediate retry per subscriber, then count, log and drop.
async fn deliver_to_subscribers(
    client: &HttpClient,
    subscriptions: &PubSubStore,
    metrics: &ProxyMetrics,
    msg: &DataChan,
) {
    let Some(event) = &msg.data else { return };
    let subscribers = subscriptions.find_by_resource(&msg.address);
    if subscribers.is_empty() {
        debug!(address = %msg.address, "no local subscribers");
        return;
    }

    let body = match serde_json::to_vec(event) {
        Ok(body) => Bytes::from(body),
        Err(e) => {
            warn!(address = %msg.address, error = %e, "failed to encode event");
            metrics.event_dropped("encode");
            return;
        },
    };

    for subscriber in subscribers {
        let mut delivered = false;
        for attempt in 0..2 {
            if attempt > 0 {
                metrics.transport_retry("local");
            }
            match post_json(client, &subscriber.end_point_uri, body.clone()).await {
                Ok(()) => {
                    delivered = true;
                    break;
                },
                Err(e) => {
                    debug!(
                        endpoint = %subscriber.end_point_uri,
                        attempt,
                        error = %e,
                        "subscriber delivery failed"
                    );
                },
            }
        }
        if delivered {
            debug!(
                endpoint = %subscriber.end_point_uri,
                event_type = %event.event_type,
                "event delivered"
            );
        } else {
            metrics.event_dropped("subscriber-unreachable");
            warn!(
                endpoint = %subscriber.end_point_uri,
                address = %msg.address,
                "dropping event after retry"
            );
        }
    }
}

async fn post_json(client: &HttpClient, uri: &str, body: Bytes) -> Result<(), String> {
    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(body))
        .map_err(|e| e.to_string())?;

    let response = tokio::time::timeout(DELIVERY_TIMEOUT, client.request(request))
        .await
        .map_err(|_| format!("request timed out after {DELIVERY_TIMEOUT:?}"))?
        .map_err(|e| e.to_string())?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("subscriber returned {}", response.status()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn shutdown_signal_is_idempotent_and_observable() {
        let (handle, mut shutdown) = shutdown_channel();
        assert!(!shutdown.is_closed());

        handle.signal();
        handle.signal();
        tokio::time::timeout(Duration::from_millis(100), shutdown.closed())
            .await
            .expect("closed() did not observe the signal");
        assert!(shutdown.is_closed());
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_closed() {
        let (handle, mut shutdown) = shutdown_channel();
        drop(handle);
        tokio::time::timeout(Duration::from_millis(100), shutdown.closed())
            .await
            .expect("closed() did not complete after handle drop");
    }

    #[tokio::test]
    async fn bus_receivers_are_taken_once() {
        let mut bus = EventBus::new(4);
        let _out = bus.take_out_receiver();
        let _in = bus.take_in_receiver();
        let tx = bus.out_sender();
        assert!(!tx.is_closed());
    }

    #[tokio::test]
    async fn out_channel_applies_backpressure() {
        let bus = EventBus::new(1);
        let tx = bus.out_sender();
        tx.try_send(DataChan::status("/a", ChannelStatus::New))
            .expect("first message fits");
        assert!(tx
            .try_send(DataChan::status("/b", ChannelStatus::New))
            .is_err());
    }
}

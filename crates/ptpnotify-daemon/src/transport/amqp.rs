//! AMQP transport plugin.
//!
//! One connection supervisor owns the broker link. The concrete AMQP wire
//! codec lives outside this crate; here events are handed to the broker
//! adapter as line-delimited JSON frames over the connection. What this
//! module does own is the lifecycle the bus relies on:
//!
//! - start attempts one connection; failure is reported as recoverable
//!   ([`TransportError::Unavailable`]) while the supervisor keeps
//!   reconnecting with exponential back-off plus jitter, capped at 30 s;
//! - a write failure drops the message (the dispatcher already retried
//!   once), files a transport-loss status message on the `in` channel and
//!   re-enters the reconnect loop;
//! - the supervisor observes the daemon close signal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ptpnotify_core::channel::{ChannelStatus, DataChan};
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::Shutdown;
use crate::metrics::ProxyMetrics;

use super::{Transport, TransportError, TransportHost};

/// Reconnect back-off cap.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// First reconnect delay.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Address transport-loss status messages are filed under on the `in`
/// channel.
pub const TRANSPORT_LOSS_ADDRESS: &str = "/transport/amqp/connection-loss";

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Exponential back-off with jitter, capped at [`MAX_RECONNECT_DELAY`].
fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(5);
    let base = INITIAL_RECONNECT_DELAY
        .saturating_mul(2u32.pow(exponent))
        .min(MAX_RECONNECT_DELAY);
    #[allow(clippy::cast_possible_truncation)] // base is at most 30s
    let quarter_ms = (base.as_millis() as u64 / 4).max(1);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=quarter_ms));
    (base + jitter).min(MAX_RECONNECT_DELAY)
}

/// The AMQP plugin.
pub struct AmqpTransport {
    host: TransportHost,
    tx: mpsc::Sender<DataChan>,
    rx: Option<mpsc::Receiver<DataChan>>,
    in_tx: mpsc::Sender<DataChan>,
    shutdown: Shutdown,
    metrics: Arc<ProxyMetrics>,
    worker: Option<JoinHandle<()>>,
}

impl AmqpTransport {
    /// Builds the plugin. `capacity` bounds the sender queue the
    /// out-dispatcher feeds.
    #[must_use]
    pub fn new(
        host: TransportHost,
        in_tx: mpsc::Sender<DataChan>,
        shutdown: Shutdown,
        metrics: Arc<ProxyMetrics>,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            host,
            tx,
            rx: Some(rx),
            in_tx,
            shutdown,
            metrics,
            worker: None,
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn name(&self) -> &'static str {
        "amqp"
    }

    fn sender(&self) -> Option<mpsc::Sender<DataChan>> {
        Some(self.tx.clone())
    }

    async fn start(&mut self) -> Result<(), TransportError> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| TransportError::Transient("transport already started".to_string()))?;

        let authority = self.host.authority();
        let initial = TcpStream::connect(&authority).await;
        let startup_error = initial.as_ref().err().map(ToString::to_string);

        self.worker = Some(tokio::spawn(supervise(
            authority.clone(),
            rx,
            initial.ok(),
            self.in_tx.clone(),
            self.shutdown.clone(),
            Arc::clone(&self.metrics),
        )));

        match startup_error {
            None => {
                info!(broker = %authority, "amqp transport connected");
                Ok(())
            },
            Some(error) => Err(TransportError::Unavailable(format!(
                "broker {authority} unreachable: {error}"
            ))),
        }
    }

    async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let abort = worker.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, worker).await.is_err() {
                abort.abort();
            }
        }
    }
}

async fn supervise(
    authority: String,
    mut rx: mpsc::Receiver<DataChan>,
    mut stream: Option<TcpStream>,
    in_tx: mpsc::Sender<DataChan>,
    mut shutdown: Shutdown,
    metrics: Arc<ProxyMetrics>,
) {
    let mut attempt: u32 = 0;
    loop {
        if stream.is_none() {
            attempt += 1;
            let delay = reconnect_delay(attempt);
            debug!(broker = %authority, attempt, ?delay, "scheduling broker reconnect");
            tokio::select! {
                () = shutdown.closed() => return,
                () = tokio::time::sleep(delay) => {}
            }
            match TcpStream::connect(&authority).await {
                Ok(conn) => {
                    info!(broker = %authority, "broker connection established");
                    attempt = 0;
                    stream = Some(conn);
                },
                Err(error) => {
                    debug!(broker = %authority, %error, "broker connect failed");
                    continue;
                },
            }
        }

        tokio::select! {
            () = shutdown.closed() => return,
            maybe = rx.recv() => {
                let Some(msg) = maybe else { return };
                let Some(conn) = stream.as_mut() else { continue };
                if let Err(error) = write_frame(conn, &msg).await {
                    warn!(broker = %authority, %error, "broker write failed, reconnecting");
                    metrics.transport_connection_loss("amqp");
                    metrics.event_dropped("transport-write");
                    let _ = in_tx.try_send(DataChan::status(
                        TRANSPORT_LOSS_ADDRESS,
                        ChannelStatus::Failed,
                    ));
                    stream = None;
                }
            }
        }
    }
}

async fn write_frame(stream: &mut TcpStream, msg: &DataChan) -> std::io::Result<()> {
    let Some(event) = &msg.data else {
        return Ok(());
    };
    let mut frame = serde_json::to_vec(event)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    frame.push(b'\n');
    stream.write_all(&frame).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::shutdown_channel;
    use crate::metrics::ProxyMetrics;

    #[test]
    fn backoff_is_capped_with_jitter() {
        for attempt in 1..=20 {
            let delay = reconnect_delay(attempt);
            assert!(delay <= MAX_RECONNECT_DELAY, "attempt {attempt}: {delay:?}");
            assert!(delay >= INITIAL_RECONNECT_DELAY);
        }
        // Early attempts stay well under the cap.
        assert!(reconnect_delay(1) < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_recoverable_start_failure() {
        let host: TransportHost = "amqp:127.0.0.1:9".parse().expect("valid host");
        let (_handle, shutdown) = shutdown_channel();
        let (in_tx, _in_rx) = mpsc::channel(4);
        let metrics = Arc::new(ProxyMetrics::new().expect("metrics"));

        let mut transport = AmqpTransport::new(host, in_tx, shutdown, metrics, 4);
        let result = transport.start().await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
        // The sender end still exists: the dispatcher can register it and
        // delivery resumes if the broker comes back.
        assert!(transport.sender().is_some());
        transport.stop().await;
    }
}

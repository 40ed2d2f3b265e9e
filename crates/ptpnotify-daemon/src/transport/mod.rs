//! Transport plugin contract.
//!
//! A plugin is a `(start, stop)` pair plus two channel ends: a sender the
//! out-dispatcher fans events into, and the bus's `in` sender the plugin's
//! receiver side feeds. One plugin is loaded per process, selected by the
//! `PTP_PLUGIN` environment variable or the `--transport` flag.
//!
//! A plugin may refuse to start (broker unreachable). That is a recoverable
//! degradation, not a fatal error: the engine keeps running, the bus keeps
//! dispatching, and events still reach locally registered subscribers while
//! a background reconnect task keeps trying.

pub mod amqp;
pub mod http;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use ptpnotify_core::channel::DataChan;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::bus::Shutdown;
use crate::metrics::ProxyMetrics;

/// Errors raised by transport plugins.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport endpoint is unreachable; the daemon degrades to
    /// local-only delivery.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// A transient failure; the affected message was retried once and
    /// dropped.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// The transport host string does not parse.
    #[error("invalid transport host {0:?} (expected <kind>:<host>:<port>)")]
    InvalidHost(String),

    /// The transport kind is not recognized.
    #[error("unknown transport kind {0:?} (expected AMQP or HTTP)")]
    UnknownKind(String),
}

/// The supported wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// AMQP broker.
    Amqp,
    /// Local HTTP event fabric.
    Http,
}

impl TransportKind {
    /// Default host for the kind, used when only `PTP_PLUGIN` is given.
    #[must_use]
    pub fn default_host(&self) -> TransportHost {
        match self {
            Self::Amqp => TransportHost {
                kind: Self::Amqp,
                host: "localhost".to_string(),
                port: 5672,
            },
            Self::Http => TransportHost {
                kind: Self::Http,
                host: "localhost".to_string(),
                port: 8089,
            },
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amqp => f.write_str("amqp"),
            Self::Http => f.write_str("http"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AMQP" => Ok(Self::Amqp),
            "HTTP" => Ok(Self::Http),
            other => Err(TransportError::UnknownKind(other.to_string())),
        }
    }
}

/// A parsed transport endpoint, `<kind>:<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHost {
    /// Wire protocol.
    pub kind: TransportKind,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl TransportHost {
    /// `host:port` for dialing.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for TransportHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.host, self.port)
    }
}

impl FromStr for TransportHost {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(kind), Some(host), Some(port)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(TransportError::InvalidHost(s.to_string()));
        };
        if host.is_empty() {
            return Err(TransportError::InvalidHost(s.to_string()));
        }
        let kind: TransportKind = kind.parse()?;
        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::InvalidHost(s.to_string()))?;
        Ok(Self {
            kind,
            host: host.to_string(),
            port,
        })
    }
}

/// Contract between the bus and a concrete transport.
#[async_trait]
pub trait Transport: Send {
    /// Name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Sender end to register with the out-dispatcher, when the transport
    /// carries outbound events itself. The HTTP fabric returns `None`:
    /// outbound delivery there is the dispatcher's subscriber POST path.
    fn sender(&self) -> Option<mpsc::Sender<DataChan>>;

    /// Starts the plugin. [`TransportError::Unavailable`] is recoverable:
    /// the plugin keeps reconnecting in the background and the caller
    /// continues local-only.
    async fn start(&mut self) -> Result<(), TransportError>;

    /// Stops the plugin. Observes the same close signal as the dispatchers.
    async fn stop(&mut self);
}

/// Builds the plugin for the parsed host.
#[must_use]
pub fn build(
    host: &TransportHost,
    in_tx: mpsc::Sender<DataChan>,
    shutdown: Shutdown,
    metrics: Arc<ProxyMetrics>,
    capacity: usize,
) -> Box<dyn Transport> {
    match host.kind {
        TransportKind::Amqp => Box::new(amqp::AmqpTransport::new(
            host.clone(),
            in_tx,
            shutdown,
            metrics,
            capacity,
        )),
        TransportKind::Http => Box::new(http::HttpTransport::new(
            host.clone(),
            in_tx,
            shutdown,
            metrics,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_amqp_host() {
        let host: TransportHost = "amqp:broker.local:5672".parse().expect("valid host");
        assert_eq!(host.kind, TransportKind::Amqp);
        assert_eq!(host.authority(), "broker.local:5672");
    }

    #[test]
    fn parses_http_host() {
        let host: TransportHost = "HTTP:localhost:8089".parse().expect("valid host");
        assert_eq!(host.kind, TransportKind::Http);
        assert_eq!(host.port, 8089);
    }

    #[test]
    fn rejects_malformed_hosts() {
        assert!(matches!(
            "amqp:localhost".parse::<TransportHost>(),
            Err(TransportError::InvalidHost(_))
        ));
        assert!(matches!(
            "amqp::5672".parse::<TransportHost>(),
            Err(TransportError::InvalidHost(_))
        ));
        assert!(matches!(
            "amqp:localhost:notaport".parse::<TransportHost>(),
            Err(TransportError::InvalidHost(_))
        ));
        assert!(matches!(
            "ftp:localhost:21".parse::<TransportHost>(),
            Err(TransportError::UnknownKind(_))
        ));
    }

    #[test]
    fn default_hosts() {
        assert_eq!(TransportKind::Amqp.default_host().port, 5672);
        assert_eq!(TransportKind::Http.default_host().port, 8089);
    }
}

//! Daemon configuration.
//!
//! Inputs come from the command line with environment fallbacks
//! (`STORE_PATH`, `NODE_NAME`, `PTP_PLUGIN`); a flag always overrides the
//! environment. An invalid configuration at startup is fatal (exit code 1);
//! at runtime an offending update is dropped by the engine and the previous
//! configuration retained.

use std::path::PathBuf;
use std::time::Duration;

use ptpnotify_core::resource::{ResourceTemplate, TemplateError};
use thiserror::Error;

use crate::transport::{TransportError, TransportHost, TransportKind};

/// Directory for subscription persistence.
pub const ENV_STORE_PATH: &str = "STORE_PATH";

/// Node identity injected into resource templates.
pub const ENV_NODE_NAME: &str = "NODE_NAME";

/// Transport plugin selector (`AMQP` or `HTTP`).
pub const ENV_PTP_PLUGIN: &str = "PTP_PLUGIN";

/// Default REST API port.
pub const DEFAULT_API_PORT: u16 = 9085;

/// Default REST API path prefix.
pub const DEFAULT_API_PATH: &str = "/api/cloudNotifications/v1/";

/// Budget for draining dispatchers and the API server at shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration errors. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No node name was provided.
    #[error("NODE_NAME must be set (environment or --node-name)")]
    MissingNodeName,

    /// The plugin selector and the transport host disagree.
    #[error("transport plugin {plugin} does not match transport host {host}")]
    TransportMismatch {
        /// The selected plugin kind.
        plugin: TransportKind,
        /// The configured host.
        host: TransportHost,
    },

    /// The transport selector or host does not parse.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The resource prefix template is malformed.
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Raw inputs from the command line. `None` falls back to the environment,
/// then to the defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// REST API port.
    pub api_port: Option<u16>,
    /// REST API path prefix.
    pub api_path: Option<String>,
    /// Store directory.
    pub store_path: Option<PathBuf>,
    /// Node identity.
    pub node_name: Option<String>,
    /// Transport plugin selector.
    pub plugin: Option<String>,
    /// Transport endpoint, `<kind>:<host>:<port>`.
    pub transport_host: Option<String>,
    /// Bus channel capacity.
    pub channel_capacity: Option<usize>,
    /// Resource prefix template.
    pub resource_prefix: Option<String>,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// REST API port.
    pub api_port: u16,
    /// REST API path prefix, normalized to `/…/`.
    pub api_path: String,
    /// Directory for subscription persistence.
    pub store_path: PathBuf,
    /// Node identity injected into resource templates.
    pub node_name: String,
    /// Resource prefix template.
    pub resource_prefix: ResourceTemplate,
    /// Bus channel capacity.
    pub channel_capacity: usize,
    /// Transport endpoint; `None` means local-only delivery.
    pub transport: Option<TransportHost>,
    /// Shutdown drain budget.
    pub drain_timeout: Duration,
}

impl DaemonConfig {
    /// Resolves the configuration from overrides and the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the node name is missing or the
    /// transport/template inputs are malformed.
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        Self::resolve_with_env(overrides, |key| std::env::var(key).ok())
    }

    /// Like [`Self::resolve`] with an explicit environment, for tests.
    ///
    /// # Errors
    ///
    /// See [`Self::resolve`].
    pub fn resolve_with_env(
        overrides: ConfigOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let node_name = overrides
            .node_name
            .or_else(|| env(ENV_NODE_NAME))
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::MissingNodeName)?;

        let store_path = overrides
            .store_path
            .or_else(|| env(ENV_STORE_PATH).filter(|p| !p.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let plugin = overrides
            .plugin
            .or_else(|| env(ENV_PTP_PLUGIN))
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<TransportKind>())
            .transpose()?;

        let transport = match (plugin, overrides.transport_host) {
            (None, None) => None,
            (kind, Some(host)) => {
                let host: TransportHost = host.parse()?;
                if let Some(kind) = kind {
                    if kind != host.kind {
                        return Err(ConfigError::TransportMismatch { plugin: kind, host });
                    }
                }
                Some(host)
            },
            (Some(kind), None) => Some(kind.default_host()),
        };

        let resource_prefix = match overrides.resource_prefix {
            Some(template) => ResourceTemplate::new(template)?,
            None => ResourceTemplate::default(),
        };

        Ok(Self {
            api_port: overrides.api_port.unwrap_or(DEFAULT_API_PORT),
            api_path: normalize_api_path(
                overrides.api_path.as_deref().unwrap_or(DEFAULT_API_PATH),
            ),
            store_path,
            node_name,
            resource_prefix,
            channel_capacity: overrides
                .channel_capacity
                .unwrap_or(crate::bus::DEFAULT_CHANNEL_CAPACITY),
            transport,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    /// Base URL of the local REST API, used for `URILocation` fields and the
    /// publisher loopback endpoint.
    #[must_use]
    pub fn api_base(&self) -> String {
        format!("http://localhost:{}{}", self.api_port, self.api_path)
    }
}

fn normalize_api_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn node_name_is_required() {
        let result = DaemonConfig::resolve_with_env(ConfigOverrides::default(), no_env);
        assert!(matches!(result, Err(ConfigError::MissingNodeName)));
    }

    #[test]
    fn environment_provides_fallbacks() {
        let env = |key: &str| match key {
            ENV_NODE_NAME => Some("worker-0".to_string()),
            ENV_STORE_PATH => Some("/var/lib/ptpnotify".to_string()),
            ENV_PTP_PLUGIN => Some("AMQP".to_string()),
            _ => None,
        };
        let config =
            DaemonConfig::resolve_with_env(ConfigOverrides::default(), env).expect("resolves");
        assert_eq!(config.node_name, "worker-0");
        assert_eq!(config.store_path, PathBuf::from("/var/lib/ptpnotify"));
        let transport = config.transport.expect("plugin selected");
        assert_eq!(transport.kind, TransportKind::Amqp);
        assert_eq!(transport.port, 5672);
        assert_eq!(config.api_path, DEFAULT_API_PATH);
        assert_eq!(config.channel_capacity, crate::bus::DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn flags_override_environment() {
        let env = |key: &str| match key {
            ENV_NODE_NAME => Some("from-env".to_string()),
            _ => None,
        };
        let overrides = ConfigOverrides {
            node_name: Some("from-flag".to_string()),
            transport_host: Some("http:localhost:8089".to_string()),
            ..Default::default()
        };
        let config = DaemonConfig::resolve_with_env(overrides, env).expect("resolves");
        assert_eq!(config.node_name, "from-flag");
        assert_eq!(
            config.transport.expect("host configured").kind,
            TransportKind::Http
        );
    }

    #[test]
    fn plugin_and_host_must_agree() {
        let overrides = ConfigOverrides {
            node_name: Some("n".to_string()),
            plugin: Some("AMQP".to_string()),
            transport_host: Some("http:localhost:8089".to_string()),
            ..Default::default()
        };
        let result = DaemonConfig::resolve_with_env(overrides, no_env);
        assert!(matches!(result, Err(ConfigError::TransportMismatch { .. })));
    }

    #[test]
    fn api_path_is_normalized() {
        let overrides = ConfigOverrides {
            node_name: Some("n".to_string()),
            api_path: Some("api/events/v1".to_string()),
            ..Default::default()
        };
        let config = DaemonConfig::resolve_with_env(overrides, no_env).expect("resolves");
        assert_eq!(config.api_path, "/api/events/v1/");
    }

    #[test]
    fn no_plugin_means_local_only() {
        let overrides = ConfigOverrides {
            node_name: Some("n".to_string()),
            ..Default::default()
        };
        let config = DaemonConfig::resolve_with_env(overrides, no_env).expect("resolves");
        assert!(config.transport.is_none());
    }
}

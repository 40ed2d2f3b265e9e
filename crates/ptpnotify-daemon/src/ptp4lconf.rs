//! PTP configuration registry.
//!
//! Maps a `ptp4l` config file name to the interfaces it drives and their
//! current roles. The registry is populated by the log-tailing side (out of
//! scope here) through typed updates; the engine reads it when resolving
//! samples and deletes entries when a profile vanishes from the
//! configuration map.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Identity of a `ptp4l` configuration file (e.g. `ptp4l.0.config`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigName(String);

impl ConfigName {
    /// Wraps a config file name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the raw name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConfigName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for ConfigName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A network interface name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Iface(String);

impl Iface {
    /// Wraps an interface name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the raw name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Iface {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for Iface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role a port currently plays, as announced by `ptp4l`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PtpRole {
    /// Port is the time source for its segment.
    Master,
    /// Port is tracking a master.
    Slave,
    /// Port is in the faulty state.
    Faulty,
    /// Port is passive.
    Passive,
    /// Port is listening for announce messages.
    Listening,
    /// Role not yet discovered or not recognized.
    #[default]
    Unknown,
}

impl PtpRole {
    /// Returns the role as `ptp4l` spells it.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "MASTER",
            Self::Slave => "SLAVE",
            Self::Faulty => "FAULTY",
            Self::Passive => "PASSIVE",
            Self::Listening => "LISTENING",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PtpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PtpRole {
    type Err = std::convert::Infallible;

    // Unrecognized role strings map to Unknown rather than an error: role
    // change lines may carry states this build does not know about.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let role = match s.to_ascii_uppercase().as_str() {
            "MASTER" => Self::Master,
            "SLAVE" => Self::Slave,
            "FAULTY" => Self::Faulty,
            "PASSIVE" => Self::Passive,
            "LISTENING" => Self::Listening,
            _ => Self::Unknown,
        };
        Ok(role)
    }
}

/// An interface and its current role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtpInterface {
    /// Interface name.
    pub name: Iface,
    /// Current role.
    pub role: PtpRole,
}

/// The interfaces driven by one `ptp4l` configuration file, in discovery
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ptp4lConfig {
    /// Config file name.
    pub name: ConfigName,
    /// Interfaces and their roles.
    pub interfaces: Vec<PtpInterface>,
}

impl Ptp4lConfig {
    /// Builds an empty config for `name`.
    #[must_use]
    pub fn new(name: ConfigName) -> Self {
        Self {
            name,
            interfaces: Vec::new(),
        }
    }

    /// Returns the interface entry for `iface`, if discovered.
    #[must_use]
    pub fn interface(&self, iface: &Iface) -> Option<&PtpInterface> {
        self.interfaces.iter().find(|i| &i.name == iface)
    }

    /// Sets the role for `iface`, discovering the interface if needed.
    pub fn set_role(&mut self, iface: &Iface, role: PtpRole) {
        match self.interfaces.iter_mut().find(|i| &i.name == iface) {
            Some(entry) => entry.role = role,
            None => self.interfaces.push(PtpInterface {
                name: iface.clone(),
                role,
            }),
        }
    }
}

/// Concurrent map from config file name to [`Ptp4lConfig`].
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    inner: RwLock<HashMap<ConfigName, Ptp4lConfig>>,
}

impl ConfigRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the config for `name`, creating an empty one on first
    /// reference.
    #[must_use]
    pub fn get_or_create(&self, name: &ConfigName) -> Ptp4lConfig {
        let mut inner = self.inner.write().unwrap();
        inner
            .entry(name.clone())
            .or_insert_with(|| Ptp4lConfig::new(name.clone()))
            .clone()
    }

    /// Replaces the config for `name`.
    pub fn replace(&self, config: Ptp4lConfig) {
        self.inner
            .write()
            .unwrap()
            .insert(config.name.clone(), config);
    }

    /// Sets the role of one interface, discovering config and interface as
    /// needed.
    pub fn set_role(&self, name: &ConfigName, iface: &Iface, role: PtpRole) {
        let mut inner = self.inner.write().unwrap();
        inner
            .entry(name.clone())
            .or_insert_with(|| Ptp4lConfig::new(name.clone()))
            .set_role(iface, role);
    }

    /// Returns the role of `iface` under `name`, if discovered.
    #[must_use]
    pub fn role(&self, name: &ConfigName, iface: &Iface) -> Option<PtpRole> {
        self.inner
            .read()
            .unwrap()
            .get(name)
            .and_then(|c| c.interface(iface))
            .map(|i| i.role)
    }

    /// Removes the config for `name`. Returns `true` when it existed.
    pub fn delete(&self, name: &ConfigName) -> bool {
        self.inner.write().unwrap().remove(name).is_some()
    }

    /// Returns the known config names. Order is unspecified.
    #[must_use]
    pub fn names(&self) -> Vec<ConfigName> {
        self.inner.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing() {
        assert_eq!("SLAVE".parse::<PtpRole>().unwrap(), PtpRole::Slave);
        assert_eq!("master".parse::<PtpRole>().unwrap(), PtpRole::Master);
        assert_eq!("Listening".parse::<PtpRole>().unwrap(), PtpRole::Listening);
        assert_eq!("GIBBERISH".parse::<PtpRole>().unwrap(), PtpRole::Unknown);
    }

    #[test]
    fn get_or_create_is_lazy() {
        let registry = ConfigRegistry::new();
        let name = ConfigName::from("ptp4l.0.config");
        assert!(registry.names().is_empty());

        let config = registry.get_or_create(&name);
        assert!(config.interfaces.is_empty());
        assert_eq!(registry.names(), vec![name]);
    }

    #[test]
    fn set_role_discovers_interface() {
        let registry = ConfigRegistry::new();
        let name = ConfigName::from("ptp4l.0.config");
        let iface = Iface::from("ens1f0");

        registry.set_role(&name, &iface, PtpRole::Slave);
        assert_eq!(registry.role(&name, &iface), Some(PtpRole::Slave));

        registry.set_role(&name, &iface, PtpRole::Faulty);
        assert_eq!(registry.role(&name, &iface), Some(PtpRole::Faulty));

        let config = registry.get_or_create(&name);
        assert_eq!(config.interfaces.len(), 1);
    }

    #[test]
    fn delete_removes_config() {
        let registry = ConfigRegistry::new();
        let name = ConfigName::from("ptp4l.0.config");
        registry.get_or_create(&name);

        assert!(registry.delete(&name));
        assert!(!registry.delete(&name));
        assert!(registry.names().is_empty());
    }
}

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::transport::{PN_DEV_HOST, PN_DEV_PC, PN_DEV_SOS};

pub const CONFIG_VERSION: u32 = 1;

/// Default request timeout when a client entry does not set one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfigInput {
    pub version: u32,
    pub interface: Option<String>,
    pub clients: Vec<ClientConfigInput>,
    pub netlink: NetlinkConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfigInput {
    pub resource: Option<u8>,
    pub default_timeout_secs: Option<u64>,
    pub indications: Vec<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetlinkConfigInput {
    pub bring_up: Option<bool>,
    pub local_address: Option<u8>,
    pub remote_address: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Phonet resource the client binds to.
    pub resource: u8,
    /// Zero waits indefinitely.
    pub default_timeout: Duration,
    /// Indication types to subscribe, deduplicated, in file order.
    pub indications: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetlinkConfig {
    /// Set `IFF_UP` on the watched interface at start.
    pub bring_up: bool,
    /// Device address assigned to the link once it is up.
    pub local_address: Option<u8>,
    /// Device routed through the link once it is up.
    pub remote_address: Option<u8>,
}

impl Default for NetlinkConfig {
    fn default() -> Self {
        Self {
            bring_up: true,
            local_address: None,
            remote_address: None,
        }
    }
}

/// Where the modem link lives: by name or by kernel index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceSelector {
    Name(String),
    Index(u32),
}

impl InterfaceSelector {
    /// Numeric strings select by index, anything else by name.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(match trimmed.parse::<u32>() {
            Ok(index) => InterfaceSelector::Index(index),
            Err(_) => InterfaceSelector::Name(trimmed.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub version: u32,
    /// Modem interface; `None` watches every Phonet interface.
    pub interface: Option<InterfaceSelector>,
    /// One entry per distinct resource.
    pub clients: Vec<ClientConfig>,
    pub netlink: NetlinkConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            interface: None,
            clients: Vec::new(),
            netlink: NetlinkConfig::default(),
        }
    }
}

impl AgentConfigInput {
    pub fn resolve(self) -> Result<AgentConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let mut used = HashSet::new();
        let mut clients = Vec::new();
        for client in self.clients {
            let Some(resource) = client.resource else {
                continue;
            };
            if !used.insert(resource) {
                continue;
            }
            let mut seen = HashSet::new();
            let indications = client
                .indications
                .into_iter()
                .filter(|ty| seen.insert(*ty))
                .collect();
            clients.push(ClientConfig {
                resource,
                default_timeout: Duration::from_secs(
                    client.default_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
                ),
                indications,
            });
        }

        if let Some(local) = self.netlink.local_address {
            if local != PN_DEV_PC && local != PN_DEV_SOS {
                return Err(format!("Invalid local address 0x{:02x}", local));
            }
        }
        if let Some(remote) = self.netlink.remote_address {
            if remote != PN_DEV_SOS && remote != PN_DEV_HOST {
                return Err(format!("Invalid remote address 0x{:02x}", remote));
            }
        }
        let netlink = NetlinkConfig {
            bring_up: self
                .netlink
                .bring_up
                .unwrap_or(NetlinkConfig::default().bring_up),
            local_address: self.netlink.local_address,
            remote_address: self.netlink.remote_address,
        };

        Ok(AgentConfig {
            version,
            interface: self.interface.as_deref().and_then(InterfaceSelector::parse),
            clients,
            netlink,
        })
    }
}

impl AgentConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(AgentConfig::default());
        }
        let parsed: AgentConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }
}

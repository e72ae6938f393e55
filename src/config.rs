use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Error};
use common::{DebugMsgType, DebugMsgTypes, MESH_CHANNEL, MESH_PORT};
use serde::{Deserialize, Serialize};

use crate::dns::{DnsReplyCode, DEFAULT_TTL, DNS_PORT};
use crate::portal::HTTP_PORT;

pub const CONFIG_FILE: &str = "config.ron";

#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub mesh: MeshConfig,
    pub station: StationConfig,
    pub dns: DnsConfig,
    pub portal: PortalConfig,
    pub simulation: SimulationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    pub prefix: String,
    pub password: String,
    pub port: u16,
    pub channel: u8,
    pub hostname: String,
    pub debug_msg_types: Vec<DebugMsgType>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            prefix: "meshPrefix".to_string(),
            password: "meshPassword".to_string(),
            port: MESH_PORT,
            channel: MESH_CHANNEL,
            hostname: "MeshGateway".to_string(),
            debug_msg_types: vec![
                DebugMsgType::Error,
                DebugMsgType::Startup,
                DebugMsgType::Connection,
            ],
        }
    }
}

impl MeshConfig {
    pub fn debug_msg_types(&self) -> DebugMsgTypes {
        self.debug_msg_types.iter().copied().collect()
    }
}

/// Upstream access point the gateway joins as a station
#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StationConfig {
    pub ssid: String,
    pub password: String,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            ssid: "mySSID".to_string(),
            password: "myPASSWORD".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DnsConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub ttl: u32,
    pub domain: String,
    pub error_reply_code: DnsReplyCode,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DNS_PORT,
            ttl: DEFAULT_TTL,
            domain: "www.webserver.com".to_string(),
            error_reply_code: DnsReplyCode::ServerFailure,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PortalConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Send text submitted through the form out over the mesh
    pub forward_broadcasts: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: HTTP_PORT,
            forward_broadcasts: false,
        }
    }
}

impl PortalConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Options for the in-process mesh used when no radio is attached
#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Gateway node id, random when unset
    pub node_id: Option<u32>,
    /// Extra simulated nodes joining the same mesh
    pub peers: u32,
    /// Lease handed out by the simulated upstream access point, none if unset
    pub upstream_lease: Option<Ipv4Addr>,
    pub association_interval_ms: u64,
    /// Period of the run loop calling `update`
    pub update_interval_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            peers: 3,
            upstream_lease: Some(Ipv4Addr::new(192, 168, 1, 77)),
            association_interval_ms: 1000,
            update_interval_ms: 10,
        }
    }
}

impl SimulationConfig {
    pub fn association_interval(&self) -> Duration {
        Duration::from_millis(self.association_interval_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// env_logger filter, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,mesh=debug".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Config, Error> {
        Self::load_from(CONFIG_FILE)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Config, Error> {
        let path = path.as_ref();
        let config = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = ron::from_str(&config)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Config, Error> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn to_ron(&self) -> Result<String, Error> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    /// Credentials are kept out of the config file when these are set
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ssid) = lookup("STATION_SSID") {
            self.station.ssid = ssid;
        }
        if let Some(password) = lookup("STATION_PASSWORD") {
            self.station.password = password;
        }
        if let Some(password) = lookup("MESH_PASSWORD") {
            self.mesh.password = password;
        }
    }
}

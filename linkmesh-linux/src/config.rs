//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use linkmesh_core::{MacAddr, MeshConfig};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/linkmesh/config.toml or /etc/linkmesh/config.toml.
/// Env overrides: LINKMESH_PORT, LINKMESH_MESH_PASSWORD, LINKMESH_STATION_MAC.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Multicast group standing in for the shared radio channel.
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// UDP port of the emulated channel (default 45680).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Station address, `aa:bb:cc:dd:ee:ff`. Random locally administered if unset.
    #[serde(default)]
    pub station_mac: Option<String>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Period of the hello broadcast and connection-queue ping.
    #[serde(default = "default_hello_interval_secs")]
    pub hello_interval_secs: u64,
    /// tracing filter directive; RUST_LOG wins when set.
    #[serde(default)]
    pub log_filter: Option<String>,
    #[serde(default)]
    pub mesh: MeshConfig,
}

fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}
fn default_port() -> u16 {
    45680
}
fn default_tick_interval_ms() -> u64 {
    10
}
fn default_hello_interval_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multicast_group: default_multicast_group(),
            port: default_port(),
            station_mac: None,
            tick_interval_ms: default_tick_interval_ms(),
            hello_interval_secs: default_hello_interval_secs(),
            log_filter: None,
            mesh: MeshConfig::default(),
        }
    }
}

impl Config {
    /// Configured station MAC, or a random locally administered unicast one.
    pub fn station_mac(&self) -> Result<MacAddr, linkmesh_core::protocol::MacParseError> {
        match &self.station_mac {
            Some(s) => s.parse(),
            None => {
                let mut bytes: [u8; 6] = rand::random();
                bytes[0] = (bytes[0] & 0xFC) | 0x02;
                Ok(MacAddr(bytes))
            }
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("LINKMESH_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("LINKMESH_MESH_PASSWORD") {
        c.mesh.mesh_password = s;
    }
    if let Ok(s) = std::env::var("LINKMESH_STATION_MAC") {
        c.station_mac = Some(s);
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/linkmesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/linkmesh/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                // Logging is not up yet; the filter comes from this file.
                Ok(Err(e)) => eprintln!("ignoring {}: {}", p.display(), e),
                Err(e) => eprintln!("cannot read {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_with_mesh_table() {
        let c: Config = toml::from_str(
            r#"
            port = 5000
            station_mac = "02:00:00:00:00:07"

            [mesh]
            node_id = "7"
            wifi_channel = 6
            "#,
        )
        .unwrap();
        assert_eq!(c.port, 5000);
        assert_eq!(c.tick_interval_ms, 10);
        assert_eq!(c.mesh.ssid(), "MeshNode_7");
        assert_eq!(c.mesh.wifi_channel, 6);
        assert_eq!(c.mesh.session_lifetime_ms, MeshConfig::default().session_lifetime_ms);
        assert_eq!(c.station_mac().unwrap(), MacAddr([2, 0, 0, 0, 0, 7]));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 1").is_err());
        assert!(toml::from_str::<Config>("[mesh]\nchannel = 1").is_err());
    }

    #[test]
    fn random_station_mac_is_local_unicast() {
        let mac = Config::default().station_mac().unwrap();
        assert_eq!(mac.0[0] & 0x03, 0x02);
    }
}

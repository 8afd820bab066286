//! Engine configuration with the protocol's default parameters.

use serde::{Deserialize, Serialize};

use crate::assembler::{DEFAULT_REASSEMBLY_TIMEOUT_MS, DEFAULT_REPLAY_WINDOW_MS};
use crate::crypto::DEFAULT_NONCE_LEN;
use crate::handshake::DEFAULT_HANDSHAKE_STEP_TIMEOUT_MS;
use crate::peer_table::{DEFAULT_PEER_TABLE_CAPACITY, MAX_PEER_SLOTS};
use crate::request_log::{DEFAULT_PEER_REQUEST_LIFETIME_MS, DEFAULT_PEER_REQUEST_LOG_CAPACITY};
use crate::response_queue::DEFAULT_RESPONSE_TIMEOUT_MS;
use crate::send_queue::{DEFAULT_BACKOFF_MS, DEFAULT_TRANSMISSIONS_PER_FRAME};
use crate::time::Millis;

pub const DEFAULT_MESH_NAME: &str = "MeshNode_";
pub const DEFAULT_MESH_PASSWORD: &str = "ChangeThisMeshPassword";
pub const DEFAULT_SESSION_LIFETIME_MS: Millis = 45_000;
/// How long a sent unicast request accepts its response.
pub const DEFAULT_SENT_REQUEST_LIFETIME_MS: Millis = 2_500;
/// How long a broadcast accepts responses.
pub const DEFAULT_BROADCAST_RESPONSE_TIMEOUT_MS: Millis = 1_000;
pub const DEFAULT_MAX_FRAGMENTS_PER_MESSAGE: u8 = 3;

const PASSWORD_LEN: std::ops::RangeInclusive<usize> = 8..=64;
const CHANNELS: std::ops::RangeInclusive<u8> = 1..=13;

/// Mesh engine settings. Every field has a default; unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    /// SSID prefix shared by all nodes of the mesh.
    #[serde(default = "default_mesh_name")]
    pub mesh_name: String,
    /// Appended to `mesh_name` to form this node's SSID.
    #[serde(default)]
    pub node_id: String,
    /// Authenticates handshakes (8 to 64 characters).
    #[serde(default = "default_mesh_password")]
    pub mesh_password: String,
    #[serde(default = "default_wifi_channel")]
    pub wifi_channel: u8,
    /// Lifetime of sessions created automatically for encrypted sends.
    #[serde(default = "default_session_lifetime_ms")]
    pub session_lifetime_ms: Millis,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: Millis,
    #[serde(default = "default_handshake_step_timeout_ms")]
    pub handshake_step_timeout_ms: Millis,
    #[serde(default = "default_transmissions_per_frame")]
    pub transmissions_per_frame: u8,
    #[serde(default = "default_retransmission_backoff_ms")]
    pub retransmission_backoff_ms: Millis,
    #[serde(default = "default_peer_table_capacity")]
    pub peer_table_capacity: usize,
    #[serde(default = "default_peer_request_log_capacity")]
    pub peer_request_log_capacity: usize,
    #[serde(default = "default_peer_request_lifetime_ms")]
    pub peer_request_lifetime_ms: Millis,
    #[serde(default = "default_reassembly_timeout_ms")]
    pub reassembly_timeout_ms: Millis,
    #[serde(default = "default_sent_request_lifetime_ms")]
    pub sent_request_lifetime_ms: Millis,
    #[serde(default = "default_broadcast_response_timeout_ms")]
    pub broadcast_response_timeout_ms: Millis,
    #[serde(default = "default_replay_window_ms")]
    pub replay_window_ms: Millis,
    #[serde(default = "default_max_fragments_per_message")]
    pub max_fragments_per_message: u8,
    #[serde(default = "default_nonce_length")]
    pub nonce_length: usize,
    /// When false, unencrypted unicast requests are dropped.
    #[serde(default = "default_accepts_unencrypted_requests")]
    pub accepts_unencrypted_requests: bool,
}

fn default_mesh_name() -> String {
    DEFAULT_MESH_NAME.to_string()
}
fn default_mesh_password() -> String {
    DEFAULT_MESH_PASSWORD.to_string()
}
fn default_wifi_channel() -> u8 {
    1
}
fn default_session_lifetime_ms() -> Millis {
    DEFAULT_SESSION_LIFETIME_MS
}
fn default_response_timeout_ms() -> Millis {
    DEFAULT_RESPONSE_TIMEOUT_MS
}
fn default_handshake_step_timeout_ms() -> Millis {
    DEFAULT_HANDSHAKE_STEP_TIMEOUT_MS
}
fn default_transmissions_per_frame() -> u8 {
    DEFAULT_TRANSMISSIONS_PER_FRAME
}
fn default_retransmission_backoff_ms() -> Millis {
    DEFAULT_BACKOFF_MS
}
fn default_peer_table_capacity() -> usize {
    DEFAULT_PEER_TABLE_CAPACITY
}
fn default_peer_request_log_capacity() -> usize {
    DEFAULT_PEER_REQUEST_LOG_CAPACITY
}
fn default_peer_request_lifetime_ms() -> Millis {
    DEFAULT_PEER_REQUEST_LIFETIME_MS
}
fn default_reassembly_timeout_ms() -> Millis {
    DEFAULT_REASSEMBLY_TIMEOUT_MS
}
fn default_sent_request_lifetime_ms() -> Millis {
    DEFAULT_SENT_REQUEST_LIFETIME_MS
}
fn default_broadcast_response_timeout_ms() -> Millis {
    DEFAULT_BROADCAST_RESPONSE_TIMEOUT_MS
}
fn default_replay_window_ms() -> Millis {
    DEFAULT_REPLAY_WINDOW_MS
}
fn default_max_fragments_per_message() -> u8 {
    DEFAULT_MAX_FRAGMENTS_PER_MESSAGE
}
fn default_nonce_length() -> usize {
    DEFAULT_NONCE_LEN
}
fn default_accepts_unencrypted_requests() -> bool {
    true
}

impl MeshConfig {
    pub fn new() -> Self {
        Self {
            mesh_name: default_mesh_name(),
            node_id: String::new(),
            mesh_password: default_mesh_password(),
            wifi_channel: default_wifi_channel(),
            session_lifetime_ms: default_session_lifetime_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            handshake_step_timeout_ms: default_handshake_step_timeout_ms(),
            transmissions_per_frame: default_transmissions_per_frame(),
            retransmission_backoff_ms: default_retransmission_backoff_ms(),
            peer_table_capacity: default_peer_table_capacity(),
            peer_request_log_capacity: default_peer_request_log_capacity(),
            peer_request_lifetime_ms: default_peer_request_lifetime_ms(),
            reassembly_timeout_ms: default_reassembly_timeout_ms(),
            sent_request_lifetime_ms: default_sent_request_lifetime_ms(),
            broadcast_response_timeout_ms: default_broadcast_response_timeout_ms(),
            replay_window_ms: default_replay_window_ms(),
            max_fragments_per_message: default_max_fragments_per_message(),
            nonce_length: default_nonce_length(),
            accepts_unencrypted_requests: default_accepts_unencrypted_requests(),
        }
    }

    /// SSID this node advertises when its access point is active.
    pub fn ssid(&self) -> String {
        format!("{}{}", self.mesh_name, self.node_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mesh_name.is_empty() {
            return Err(ConfigError::EmptyMeshName);
        }
        if !PASSWORD_LEN.contains(&self.mesh_password.len()) {
            return Err(ConfigError::PasswordLength(self.mesh_password.len()));
        }
        if !CHANNELS.contains(&self.wifi_channel) {
            return Err(ConfigError::Channel(self.wifi_channel));
        }
        if !(1..=MAX_PEER_SLOTS).contains(&self.peer_table_capacity) {
            return Err(ConfigError::PeerTableCapacity(self.peer_table_capacity));
        }
        if self.peer_request_log_capacity == 0 {
            return Err(ConfigError::Zero("peer_request_log_capacity"));
        }
        if self.transmissions_per_frame == 0 {
            return Err(ConfigError::Zero("transmissions_per_frame"));
        }
        if self.max_fragments_per_message == 0 {
            return Err(ConfigError::Zero("max_fragments_per_message"));
        }
        if self.nonce_length == 0 {
            return Err(ConfigError::Zero("nonce_length"));
        }
        for (name, value) in [
            ("session_lifetime_ms", self.session_lifetime_ms),
            ("response_timeout_ms", self.response_timeout_ms),
            ("handshake_step_timeout_ms", self.handshake_step_timeout_ms),
            ("peer_request_lifetime_ms", self.peer_request_lifetime_ms),
            ("reassembly_timeout_ms", self.reassembly_timeout_ms),
            ("sent_request_lifetime_ms", self.sent_request_lifetime_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("mesh name must not be empty")]
    EmptyMeshName,
    #[error("mesh password must be 8 to 64 characters, got {0}")]
    PasswordLength(usize),
    #[error("wifi channel {0} outside 1..=13")]
    Channel(u8),
    #[error("peer table capacity {0} outside 1..=6")]
    PeerTableCapacity(usize),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = MeshConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.peer_table_capacity, 6);
        assert_eq!(c.transmissions_per_frame, 3);
        assert_eq!(c.session_lifetime_ms, 45_000);
        assert_eq!(c.ssid(), "MeshNode_");
    }

    #[test]
    fn password_bounds() {
        let mut c = MeshConfig::default();
        c.mesh_password = "short".into();
        assert_eq!(c.validate(), Err(ConfigError::PasswordLength(5)));
        c.mesh_password = "x".repeat(64);
        assert!(c.validate().is_ok());
        c.mesh_password = "x".repeat(65);
        assert!(c.validate().is_err());
    }

    #[test]
    fn peer_table_bounded_by_hardware() {
        let mut c = MeshConfig::default();
        c.peer_table_capacity = 7;
        assert_eq!(c.validate(), Err(ConfigError::PeerTableCapacity(7)));
        c.peer_table_capacity = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn channel_and_zero_checks() {
        let mut c = MeshConfig::default();
        c.wifi_channel = 14;
        assert_eq!(c.validate(), Err(ConfigError::Channel(14)));
        c.wifi_channel = 6;
        c.response_timeout_ms = 0;
        assert_eq!(c.validate(), Err(ConfigError::Zero("response_timeout_ms")));
    }
}

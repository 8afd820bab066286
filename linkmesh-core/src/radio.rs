//! Radio abstraction: the LLD datagram service, scanning and the access point,
//! supplied by the host.

use crate::protocol::MacAddr;

/// Result of handing one frame to the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Unicast frame acknowledged at the link layer.
    Delivered,
    /// Broadcast frame left the radio (broadcasts are never acknowledged).
    BroadcastSent,
    /// No link-layer ack; counts against the retransmit budget.
    NoAck,
    /// Radio could not take the frame right now; retried without counting.
    RadioBusy,
}

impl SendResult {
    pub fn is_success(self) -> bool {
        matches!(self, SendResult::Delivered | SendResult::BroadcastSent)
    }
}

/// One access point found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub ssid: String,
    pub bssid: MacAddr,
    pub channel: u8,
    pub rssi: i8,
}

/// Radio interface driven by the engine. Calls are synchronous and bounded.
pub trait Radio {
    /// Station interface address, used as this node's identity.
    fn station_mac(&self) -> MacAddr;

    /// Access point interface address.
    fn ap_mac(&self) -> MacAddr;

    /// Transmit one encoded frame to `destination` (or the broadcast address).
    fn send(&mut self, destination: MacAddr, frame: &[u8]) -> SendResult;

    /// Scan for access points, on the current channel unless `all_channels`.
    fn scan(&mut self, all_channels: bool) -> Vec<NetworkInfo>;

    fn start_access_point(
        &mut self,
        ssid: &str,
        password: &str,
        channel: u8,
    ) -> Result<(), RadioError>;

    fn stop_access_point(&mut self);

    /// Retune a running access point.
    fn set_ap_channel(&mut self, channel: u8);
}

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("access point unavailable: {0}")]
    AccessPoint(String),
    #[error("invalid channel {0}")]
    InvalidChannel(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_delivery_counts_as_success() {
        assert!(SendResult::Delivered.is_success());
        assert!(SendResult::BroadcastSent.is_success());
        assert!(!SendResult::NoAck.is_success());
        assert!(!SendResult::RadioBusy.is_success());
    }
}

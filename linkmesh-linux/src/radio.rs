//! Emulated LLD radio: one UDP multicast datagram per frame, plus AP beacons for scans.
//!
//! Datagram: kind (1) | source MAC (6) | destination MAC (6) | body.
//! Frame body is the encoded LinkMesh frame; beacon body is
//! channel (1) | station MAC (6) | SSID.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use linkmesh_core::{MacAddr, NetworkInfo, Radio, RadioError, SendResult, BROADCAST_MAC};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const KIND_FRAME: u8 = 0;
const KIND_BEACON: u8 = 1;
const HEADER_LEN: usize = 13;
/// Addresses not heard from for this long are treated as out of range.
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

struct Heard {
    /// Set for access points seen through a beacon.
    network: Option<NetworkInfo>,
    last_seen: Instant,
}

/// What the receive loop has heard, keyed by station and AP address.
#[derive(Clone, Default)]
pub struct Neighbours(Arc<Mutex<HashMap<MacAddr, Heard>>>);

impl Neighbours {
    fn lock(&self) -> MutexGuard<'_, HashMap<MacAddr, Heard>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn heard_frame(&self, station: MacAddr) {
        self.lock().insert(
            station,
            Heard {
                network: None,
                last_seen: Instant::now(),
            },
        );
    }

    fn heard_beacon(&self, station: MacAddr, network: NetworkInfo) {
        let now = Instant::now();
        let mut heard = self.lock();
        heard.insert(
            network.bssid,
            Heard {
                network: Some(network),
                last_seen: now,
            },
        );
        heard
            .entry(station)
            .or_insert(Heard {
                network: None,
                last_seen: now,
            })
            .last_seen = now;
    }

    fn in_range(&self, mac: &MacAddr) -> bool {
        self.lock()
            .get(mac)
            .map(|h| h.last_seen.elapsed() < PEER_TIMEOUT)
            .unwrap_or(false)
    }

    fn networks(&self) -> Vec<NetworkInfo> {
        let mut heard = self.lock();
        heard.retain(|_, h| h.last_seen.elapsed() < PEER_TIMEOUT);
        heard.values().filter_map(|h| h.network.clone()).collect()
    }
}

struct AccessPoint {
    ssid: String,
    channel: u8,
}

pub struct UdpRadio {
    socket: std::net::UdpSocket,
    group: SocketAddr,
    station: MacAddr,
    ap: MacAddr,
    access_point: Option<AccessPoint>,
    neighbours: Neighbours,
}

/// AP address derived from the station address, as radios with two interfaces do.
pub fn ap_mac_for(station: MacAddr) -> MacAddr {
    let mut bytes = station.0;
    bytes[5] = bytes[5].wrapping_add(1);
    MacAddr(bytes)
}

fn datagram(kind: u8, src: MacAddr, dst: MacAddr, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(kind);
    out.extend_from_slice(src.as_bytes());
    out.extend_from_slice(dst.as_bytes());
    out.extend_from_slice(body);
    out
}

fn mac_at(bytes: &[u8], at: usize) -> Option<MacAddr> {
    let slice = bytes.get(at..at + 6)?;
    let mut mac = [0u8; 6];
    mac.copy_from_slice(slice);
    Some(MacAddr(mac))
}

impl UdpRadio {
    pub fn new(
        socket: std::net::UdpSocket,
        group: SocketAddr,
        station: MacAddr,
        neighbours: Neighbours,
    ) -> Self {
        Self {
            socket,
            group,
            station,
            ap: ap_mac_for(station),
            access_point: None,
            neighbours,
        }
    }

    /// Announce the access point, if one is running.
    pub fn send_beacon(&self) {
        let Some(ap) = &self.access_point else {
            return;
        };
        let mut body = Vec::with_capacity(7 + ap.ssid.len());
        body.push(ap.channel);
        body.extend_from_slice(self.station.as_bytes());
        body.extend_from_slice(ap.ssid.as_bytes());
        let d = datagram(KIND_BEACON, self.ap, BROADCAST_MAC, &body);
        if let Err(e) = self.socket.send_to(&d, self.group) {
            debug!(error = %e, "beacon not sent");
        }
    }
}

impl Radio for UdpRadio {
    fn station_mac(&self) -> MacAddr {
        self.station
    }

    fn ap_mac(&self) -> MacAddr {
        self.ap
    }

    fn send(&mut self, destination: MacAddr, frame: &[u8]) -> SendResult {
        let broadcast = destination.is_broadcast();
        if !broadcast && !self.neighbours.in_range(&destination) {
            return SendResult::NoAck;
        }
        let d = datagram(KIND_FRAME, self.station, destination, frame);
        match self.socket.send_to(&d, self.group) {
            Ok(_) if broadcast => SendResult::BroadcastSent,
            Ok(_) => SendResult::Delivered,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => SendResult::RadioBusy,
            Err(e) => {
                warn!(error = %e, "datagram send failed");
                SendResult::NoAck
            }
        }
    }

    fn scan(&mut self, all_channels: bool) -> Vec<NetworkInfo> {
        let channel = self.access_point.as_ref().map(|a| a.channel);
        self.neighbours
            .networks()
            .into_iter()
            .filter(|n| all_channels || channel.map(|c| c == n.channel).unwrap_or(true))
            .collect()
    }

    fn start_access_point(
        &mut self,
        ssid: &str,
        _password: &str,
        channel: u8,
    ) -> Result<(), RadioError> {
        if !(1..=13).contains(&channel) {
            return Err(RadioError::InvalidChannel(channel));
        }
        self.access_point = Some(AccessPoint {
            ssid: ssid.to_string(),
            channel,
        });
        self.send_beacon();
        Ok(())
    }

    fn stop_access_point(&mut self) {
        self.access_point = None;
    }

    fn set_ap_channel(&mut self, channel: u8) {
        if let Some(ap) = &mut self.access_point {
            ap.channel = channel;
        }
    }
}

/// Bind the channel socket and join the multicast group.
pub fn make_multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
    let sock = std::net::UdpSocket::bind(("0.0.0.0", port))?;
    sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    sock.set_multicast_ttl_v4(1)?;
    sock.set_multicast_loop_v4(true)?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

pub fn group_addr(group: Ipv4Addr, port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(group, port))
}

/// A frame addressed to this node (or broadcast), as `(sender, frame bytes)`.
pub type Received = (MacAddr, Vec<u8>);

/// Read datagrams, record neighbours, forward frames for `station`/`ap` to the engine.
pub async fn recv_loop(
    socket: UdpSocket,
    station: MacAddr,
    neighbours: Neighbours,
    frames: mpsc::Sender<Received>,
) -> std::io::Result<()> {
    let ap = ap_mac_for(station);
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let d = &buf[..n];
        let (Some(src), Some(dst)) = (mac_at(d, 1), mac_at(d, 7)) else {
            trace!(%from, "runt datagram");
            continue;
        };
        if src == station || src == ap {
            continue;
        }
        let body = &d[HEADER_LEN..];
        match d[0] {
            KIND_BEACON => {
                let (Some(&channel), Some(owner)) = (body.first(), mac_at(body, 1)) else {
                    continue;
                };
                let ssid = String::from_utf8_lossy(body.get(7..).unwrap_or_default()).into_owned();
                neighbours.heard_beacon(
                    owner,
                    NetworkInfo {
                        ssid,
                        bssid: src,
                        channel,
                        rssi: -50,
                    },
                );
            }
            KIND_FRAME => {
                neighbours.heard_frame(src);
                if dst != station && dst != ap && !dst.is_broadcast() {
                    continue;
                }
                if frames.try_send((src, body.to_vec())).is_err() {
                    debug!(peer = %src, "engine busy, frame dropped");
                }
            }
            other => trace!(kind = other, "unknown datagram kind"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, b])
    }

    #[test]
    fn datagram_layout() {
        let d = datagram(KIND_FRAME, mac(1), mac(2), b"xyz");
        assert_eq!(d.len(), HEADER_LEN + 3);
        assert_eq!(mac_at(&d, 1), Some(mac(1)));
        assert_eq!(mac_at(&d, 7), Some(mac(2)));
        assert_eq!(&d[HEADER_LEN..], b"xyz");
        assert_eq!(mac_at(&d[..10], 7), None);
    }

    #[test]
    fn ap_address_differs_from_station() {
        assert_eq!(ap_mac_for(mac(1)), mac(2));
        assert_eq!(ap_mac_for(mac(0xFF)).0[5], 0);
    }

    #[test]
    fn beacons_feed_scans_and_reachability() {
        let n = Neighbours::default();
        assert!(!n.in_range(&mac(3)));
        n.heard_beacon(
            mac(3),
            NetworkInfo {
                ssid: "MeshNode_3".into(),
                bssid: mac(4),
                channel: 6,
                rssi: -50,
            },
        );
        assert!(n.in_range(&mac(3)));
        assert!(n.in_range(&mac(4)));
        let nets = n.networks();
        assert_eq!(nets.len(), 1);
        assert_eq!(nets[0].ssid, "MeshNode_3");
        n.heard_frame(mac(9));
        assert_eq!(n.networks().len(), 1);
    }
}

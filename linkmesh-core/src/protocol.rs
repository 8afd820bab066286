//! LinkMesh protocol vocabulary: addresses, frame types, message IDs and the
//! handshake messages carried inside handshake frames.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Current protocol version. Carried in every connection request.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest datagram the radio accepts.
pub const MAX_FRAME_LEN: usize = 250;
/// Largest payload a single frame may carry, before header/tag limits apply.
pub const MAX_PAYLOAD_LEN: usize = 233;
pub const MAC_LEN: usize = 6;
pub const MESSAGE_ID_LEN: usize = 8;
pub const SESSION_TAG_LEN: usize = 8;
pub const AUTH_TAG_LEN: usize = 4;

/// Radio hardware address (station or access point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; MAC_LEN]);

/// Broadcast sentinel `FF:FF:FF:FF:FF:FF`.
pub const BROADCAST_MAC: MacAddr = MacAddr([0xFF; MAC_LEN]);

impl MacAddr {
    pub fn new(bytes: [u8; MAC_LEN]) -> Self {
        MacAddr(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MAC_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == BROADCAST_MAC
    }

    /// Numeric value used for handshake tie-breaking (first byte most significant).
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct MacParseError(String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; MAC_LEN];
        let mut parts = s.split([':', '-']);
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(|| MacParseError(s.to_string()))?;
            if part.len() != 2 {
                return Err(MacParseError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacParseError(s.to_string()));
        }
        Ok(MacAddr(out))
    }
}

/// Frame type, stored in the low 3 bits of the first frame byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Broadcast = 0,
    /// Unicast request.
    Unicast = 1,
    SynchronizationRequest = 2,
    SynchronizationConfirmation = 3,
    EncryptedConnectionRequest = 4,
    EncryptedConnectionRemovalRequest = 5,
    /// Confirmation-ack or refusal closing a handshake.
    Ack = 6,
    Response = 7,
}

impl FrameType {
    pub const MASK: u8 = 0x07;

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => FrameType::Broadcast,
            1 => FrameType::Unicast,
            2 => FrameType::SynchronizationRequest,
            3 => FrameType::SynchronizationConfirmation,
            4 => FrameType::EncryptedConnectionRequest,
            5 => FrameType::EncryptedConnectionRemovalRequest,
            6 => FrameType::Ack,
            7 => FrameType::Response,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Broadcast frames omit the destination MAC.
    pub fn has_destination(self) -> bool {
        self != FrameType::Broadcast
    }

    /// Frames that establish a session. They take priority in the send queue.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            FrameType::SynchronizationRequest
                | FrameType::SynchronizationConfirmation
                | FrameType::EncryptedConnectionRequest
                | FrameType::Ack
        )
    }

    /// Frames whose assembled body goes to the request handler.
    pub fn is_request(self) -> bool {
        matches!(self, FrameType::Broadcast | FrameType::Unicast)
    }
}

const ENCRYPTED_FLAG: u64 = 1 << 63;
const FRAGMENT_BITS: u32 = 8;
/// Largest message sequence number representable in a [`MessageId`].
pub const MAX_SEQUENCE: u64 = (1 << 55) - 1;

/// 64-bit message identifier: bit 63 = encrypted, bits 8..=62 = sequence,
/// bits 0..=7 = fragment index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    pub fn new(sequence: u64, fragment: u8, encrypted: bool) -> Self {
        let mut raw = ((sequence & MAX_SEQUENCE) << FRAGMENT_BITS) | u64::from(fragment);
        if encrypted {
            raw |= ENCRYPTED_FLAG;
        }
        MessageId(raw)
    }

    pub fn from_raw(raw: u64) -> Self {
        MessageId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_encrypted(self) -> bool {
        self.0 & ENCRYPTED_FLAG != 0
    }

    pub fn sequence(self) -> u64 {
        (self.0 & !ENCRYPTED_FLAG) >> FRAGMENT_BITS
    }

    pub fn fragment_index(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// High 56 bits: identifies the message regardless of fragment.
    pub fn message_key(self) -> u64 {
        self.0 >> FRAGMENT_BITS
    }

    pub fn with_fragment(self, fragment: u8) -> Self {
        MessageId((self.0 & !0xFF) | u64::from(fragment))
    }

    /// ID of fragment 0; used as the request ID of a whole message.
    pub fn first_fragment(self) -> Self {
        self.with_fragment(0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Payloads of handshake and removal frames. Encoding is bincode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    /// Sent in an encrypted-connection-request frame.
    ConnectionRequest {
        protocol_version: u8,
        request_id: u64,
        nonce: String,
        ap_mac: MacAddr,
        /// `None` requests a permanent session.
        duration_ms: Option<u32>,
        hmac: [u8; 32],
    },
    /// Responder challenge carrying its own nonce.
    SynchronizationRequest {
        request_id: u64,
        nonce: String,
        ap_mac: MacAddr,
        hmac: [u8; 32],
    },
    /// Both session keys sealed under the hash key.
    SynchronizationConfirmation {
        request_id: u64,
        sealed_keys: Vec<u8>,
    },
    /// Responder installed the session.
    ConfirmationAck { request_id: u64, hmac: [u8; 32] },
    /// Responder could not free a peer slot.
    Refused { request_id: u64, hmac: [u8; 32] },
    /// Carried in an encrypted removal-request frame.
    RemovalRequest { request_id: u64 },
}

impl HandshakeMessage {
    pub fn request_id(&self) -> u64 {
        match self {
            HandshakeMessage::ConnectionRequest { request_id, .. }
            | HandshakeMessage::SynchronizationRequest { request_id, .. }
            | HandshakeMessage::SynchronizationConfirmation { request_id, .. }
            | HandshakeMessage::ConfirmationAck { request_id, .. }
            | HandshakeMessage::Refused { request_id, .. }
            | HandshakeMessage::RemovalRequest { request_id } => *request_id,
        }
    }

    /// Frame type that carries this message.
    pub fn frame_type(&self) -> FrameType {
        match self {
            HandshakeMessage::ConnectionRequest { .. } => FrameType::EncryptedConnectionRequest,
            HandshakeMessage::SynchronizationRequest { .. } => FrameType::SynchronizationRequest,
            HandshakeMessage::SynchronizationConfirmation { .. } => {
                FrameType::SynchronizationConfirmation
            }
            HandshakeMessage::ConfirmationAck { .. } | HandshakeMessage::Refused { .. } => {
                FrameType::Ack
            }
            HandshakeMessage::RemovalRequest { .. } => {
                FrameType::EncryptedConnectionRemovalRequest
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddr = "AA:bb:0c:00:ff:01".parse().unwrap();
        assert_eq!(mac.0, [0xaa, 0xbb, 0x0c, 0x00, 0xff, 0x01]);
        assert_eq!(mac.to_string(), "aa:bb:0c:00:ff:01");
        assert!("aa:bb:cc".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn mac_ordering_matches_numeric_value() {
        let a = MacAddr([0, 0, 0, 0, 0, 1]);
        let b = MacAddr([0, 0, 0, 0, 1, 0]);
        assert!(a < b);
        assert!(a.to_u64() < b.to_u64());
        assert!(BROADCAST_MAC.is_broadcast());
    }

    #[test]
    fn message_id_fields() {
        let id = MessageId::new(0x1234, 2, true);
        assert!(id.is_encrypted());
        assert_eq!(id.sequence(), 0x1234);
        assert_eq!(id.fragment_index(), 2);
        assert_eq!(id.first_fragment().fragment_index(), 0);
        assert_eq!(id.message_key(), id.with_fragment(9).message_key());

        let plain = MessageId::new(7, 0, false);
        assert!(!plain.is_encrypted());
        assert_eq!(plain.raw() >> 63, 0);
    }

    #[test]
    fn frame_type_bits() {
        for v in 0..8u8 {
            assert_eq!(FrameType::from_u8(v).unwrap().as_u8(), v);
        }
        assert!(FrameType::from_u8(8).is_none());
        assert!(!FrameType::Broadcast.has_destination());
        assert!(FrameType::Ack.is_handshake());
        assert!(!FrameType::EncryptedConnectionRemovalRequest.is_handshake());
    }

    #[test]
    fn handshake_message_fits_one_frame() {
        let msg = HandshakeMessage::ConnectionRequest {
            protocol_version: PROTOCOL_VERSION,
            request_id: u64::MAX,
            nonce: "a".repeat(13),
            ap_mac: BROADCAST_MAC,
            duration_ms: Some(45_000),
            hmac: [7u8; 32],
        };
        let bytes = msg.encode().unwrap();
        assert!(bytes.len() < MAX_PAYLOAD_LEN);
        assert_eq!(HandshakeMessage::decode(&bytes).unwrap(), msg);
        assert_eq!(msg.frame_type(), FrameType::EncryptedConnectionRequest);
    }
}

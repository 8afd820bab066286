//! Framing: on-air layout of a single LLD frame.
//!
//! ```text
//! type(1) remaining(1) [destination(6)] message-id(8 LE) [session-tag(8 LE)]
//! payload-length(1) payload(N) [auth-tag(4)]
//! ```
//! Destination is omitted for broadcast frames; session and auth tags are
//! present only when the message-ID carries the encrypted flag.

use crate::protocol::{
    FrameType, MacAddr, MessageId, AUTH_TAG_LEN, MAC_LEN, MAX_FRAME_LEN, MAX_PAYLOAD_LEN,
    MESSAGE_ID_LEN, SESSION_TAG_LEN,
};

/// Everything before the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    /// Fragments of the same message still to come after this one.
    pub fragments_remaining: u8,
    /// `None` for broadcast frames.
    pub destination: Option<MacAddr>,
    pub message_id: MessageId,
    /// Sender's own session key; present iff the frame is encrypted.
    pub session_tag: Option<u64>,
}

impl FrameHeader {
    pub fn is_encrypted(&self) -> bool {
        self.message_id.is_encrypted()
    }

    /// Header size on the air, including the payload-length byte.
    pub fn encoded_len(&self) -> usize {
        header_len(self.frame_type, self.is_encrypted())
    }

    /// Header bytes as transmitted for a payload of `payload_len` bytes.
    /// Used as the authenticated header of encrypted frames.
    pub fn to_bytes(&self, payload_len: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.frame_type.as_u8());
        out.push(self.fragments_remaining);
        if let Some(dest) = &self.destination {
            out.extend_from_slice(dest.as_bytes());
        }
        out.extend_from_slice(&self.message_id.raw().to_le_bytes());
        if let Some(tag) = self.session_tag {
            out.extend_from_slice(&tag.to_le_bytes());
        }
        out.push(payload_len);
        out
    }

    fn check(&self) -> Result<(), FrameEncodeError> {
        if self.destination.is_some() != self.frame_type.has_destination() {
            return Err(FrameEncodeError::Malformed("destination"));
        }
        if self.session_tag.is_some() != self.is_encrypted() {
            return Err(FrameEncodeError::Malformed("session tag"));
        }
        Ok(())
    }
}

/// One parsed frame. For encrypted frames `payload` is still ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
    pub auth_tag: Option<[u8; AUTH_TAG_LEN]>,
}

fn header_len(frame_type: FrameType, encrypted: bool) -> usize {
    let mut len = 2 + MESSAGE_ID_LEN + 1;
    if frame_type.has_destination() {
        len += MAC_LEN;
    }
    if encrypted {
        len += SESSION_TAG_LEN;
    }
    len
}

/// Largest payload one frame of this kind can carry.
pub fn max_payload_len(frame_type: FrameType, encrypted: bool) -> usize {
    let tag = if encrypted { AUTH_TAG_LEN } else { 0 };
    MAX_PAYLOAD_LEN.min(MAX_FRAME_LEN - header_len(frame_type, encrypted) - tag)
}

/// Serialize a frame. Fails with `TooLarge` when the payload does not fit one datagram.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    frame.header.check()?;
    if frame.auth_tag.is_some() != frame.header.is_encrypted() {
        return Err(FrameEncodeError::Malformed("auth tag"));
    }
    let max = max_payload_len(frame.header.frame_type, frame.header.is_encrypted());
    if frame.payload.len() > max {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = frame.header.to_bytes(frame.payload.len() as u8);
    out.extend_from_slice(&frame.payload);
    if let Some(tag) = &frame.auth_tag {
        out.extend_from_slice(tag);
    }
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("inconsistent frame: {0}")]
    Malformed(&'static str),
}

/// Parse one datagram into a frame. The whole datagram must be consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let mut cursor = Cursor { bytes, pos: 0 };
    let type_byte = cursor.take(1)?[0];
    if type_byte & !FrameType::MASK != 0 {
        return Err(FrameDecodeError::UnknownFrameType(type_byte));
    }
    let frame_type =
        FrameType::from_u8(type_byte).ok_or(FrameDecodeError::UnknownFrameType(type_byte))?;
    let fragments_remaining = cursor.take(1)?[0];
    let destination = if frame_type.has_destination() {
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(cursor.take(MAC_LEN)?);
        Some(MacAddr(mac))
    } else {
        None
    };
    let message_id = MessageId::from_raw(cursor.take_u64()?);
    let session_tag = if message_id.is_encrypted() {
        Some(cursor.take_u64()?)
    } else {
        None
    };
    let payload_len = usize::from(cursor.take(1)?[0]);
    let tag_len = if message_id.is_encrypted() {
        AUTH_TAG_LEN
    } else {
        0
    };
    if bytes.len() - cursor.pos != payload_len + tag_len {
        return Err(FrameDecodeError::LengthMismatch);
    }
    if payload_len > max_payload_len(frame_type, message_id.is_encrypted()) {
        return Err(FrameDecodeError::TooLarge);
    }
    let payload = cursor.take(payload_len)?.to_vec();
    let auth_tag = if message_id.is_encrypted() {
        let mut tag = [0u8; AUTH_TAG_LEN];
        tag.copy_from_slice(cursor.take(AUTH_TAG_LEN)?);
        Some(tag)
    } else {
        None
    };
    Ok(Frame {
        header: FrameHeader {
            frame_type,
            fragments_remaining,
            destination,
            message_id,
            session_tag,
        },
        payload,
        auth_tag,
    })
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame truncated")]
    Truncated,
    #[error("frame too large")]
    TooLarge,
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),
    #[error("payload length does not match frame length")]
    LengthMismatch,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameDecodeError> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(FrameDecodeError::Truncated);
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_u64(&mut self) -> Result<u64, FrameDecodeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BROADCAST_MAC;

    fn unicast(payload: Vec<u8>) -> Frame {
        Frame {
            header: FrameHeader {
                frame_type: FrameType::Unicast,
                fragments_remaining: 0,
                destination: Some(MacAddr([1, 2, 3, 4, 5, 6])),
                message_id: MessageId::new(42, 0, false),
                session_tag: None,
            },
            payload,
            auth_tag: None,
        }
    }

    #[test]
    fn roundtrip_unicast() {
        let frame = unicast(b"ping".to_vec());
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(bytes.len(), 17 + 4);
        assert_eq!(bytes[0], FrameType::Unicast.as_u8());
        assert_eq!(&bytes[2..8], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(bytes[16], 4);
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn broadcast_omits_destination() {
        let frame = Frame {
            header: FrameHeader {
                frame_type: FrameType::Broadcast,
                fragments_remaining: 0,
                destination: None,
                message_id: MessageId::new(1, 0, false),
                session_tag: None,
            },
            payload: b"hi".to_vec(),
            auth_tag: None,
        };
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(bytes.len(), 11 + 2);
        assert_eq!(bytes[10], 2);
        assert_eq!(&bytes[11..], b"hi");
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn encrypted_frame_carries_tags() {
        let frame = Frame {
            header: FrameHeader {
                frame_type: FrameType::Unicast,
                fragments_remaining: 1,
                destination: Some(BROADCAST_MAC),
                message_id: MessageId::new(9, 0, true),
                session_tag: Some(0xDEAD_BEEF),
            },
            payload: vec![0xAB; 10],
            auth_tag: Some([1, 2, 3, 4]),
        };
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(bytes.len(), 25 + 10 + 4);
        assert_eq!(&bytes[bytes.len() - 4..], &[1, 2, 3, 4]);
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn payload_limits() {
        assert_eq!(max_payload_len(FrameType::Unicast, false), 233);
        assert_eq!(max_payload_len(FrameType::Unicast, true), 221);
        assert_eq!(max_payload_len(FrameType::Broadcast, false), 233);
        assert!(encode_frame(&unicast(vec![0; 233])).is_ok());
        assert!(matches!(
            encode_frame(&unicast(vec![0; 234])),
            Err(FrameEncodeError::TooLarge)
        ));
        assert!(encode_frame(&unicast(vec![0; 233])).unwrap().len() <= MAX_FRAME_LEN);
    }

    #[test]
    fn rejects_bad_frames() {
        let bytes = encode_frame(&unicast(b"abc".to_vec())).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(FrameDecodeError::LengthMismatch)
        ));
        assert!(matches!(
            decode_frame(&bytes[..5]),
            Err(FrameDecodeError::Truncated)
        ));
        let mut bad = bytes.clone();
        bad[0] = 0x09;
        assert!(matches!(
            decode_frame(&bad),
            Err(FrameDecodeError::UnknownFrameType(0x09))
        ));
        let mut extra = bytes;
        extra.push(0);
        assert!(matches!(
            decode_frame(&extra),
            Err(FrameDecodeError::LengthMismatch)
        ));
    }

    #[test]
    fn inconsistent_header_is_refused() {
        let mut frame = unicast(vec![]);
        frame.header.destination = None;
        assert!(matches!(
            encode_frame(&frame),
            Err(FrameEncodeError::Malformed(_))
        ));
    }
}

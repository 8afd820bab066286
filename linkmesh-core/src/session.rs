//! Encrypted session with one peer: keys, hash key, lifetime and message counters.

use serde::{Deserialize, Serialize};

use crate::crypto::HASH_KEY_LEN;
use crate::protocol::{MacAddr, MessageId, MAX_SEQUENCE};
use crate::time::{ExpiringTimeTracker, Millis};

/// Saved form of a session, enough to restore it on a later boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerializedConnection {
    pub peer_sta_mac: MacAddr,
    pub peer_ap_mac: MacAddr,
    pub peer_session_key: u64,
    pub own_session_key: u64,
    pub hash_key: [u8; HASH_KEY_LEN],
    /// Lifetime left when saved; absent for permanent sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_duration_ms: Option<Millis>,
    pub next_sequence: u64,
}

/// Symmetric pairwise state enabling authenticated encrypted frames with one peer.
#[derive(Debug, Clone)]
pub struct EncryptedConnectionData {
    peer_sta_mac: MacAddr,
    peer_ap_mac: MacAddr,
    peer_session_key: u64,
    own_session_key: u64,
    hash_key: [u8; HASH_KEY_LEN],
    /// `None` = permanent.
    expiry: Option<ExpiringTimeTracker>,
    next_sequence: u64,
}

impl EncryptedConnectionData {
    pub fn new(
        peer_sta_mac: MacAddr,
        peer_ap_mac: MacAddr,
        peer_session_key: u64,
        own_session_key: u64,
        hash_key: [u8; HASH_KEY_LEN],
    ) -> Self {
        Self {
            peer_sta_mac,
            peer_ap_mac,
            peer_session_key,
            own_session_key,
            hash_key,
            expiry: None,
            next_sequence: 1,
        }
    }

    /// Same as `new` but expiring `duration` ms after `now`.
    pub fn temporary(
        peer_sta_mac: MacAddr,
        peer_ap_mac: MacAddr,
        peer_session_key: u64,
        own_session_key: u64,
        hash_key: [u8; HASH_KEY_LEN],
        duration: Millis,
        now: Millis,
    ) -> Self {
        let mut s = Self::new(
            peer_sta_mac,
            peer_ap_mac,
            peer_session_key,
            own_session_key,
            hash_key,
        );
        s.expiry = Some(ExpiringTimeTracker::new(duration, now));
        s
    }

    pub fn peer_sta_mac(&self) -> MacAddr {
        self.peer_sta_mac
    }

    pub fn peer_ap_mac(&self) -> MacAddr {
        self.peer_ap_mac
    }

    pub fn peer_session_key(&self) -> u64 {
        self.peer_session_key
    }

    pub fn own_session_key(&self) -> u64 {
        self.own_session_key
    }

    pub fn hash_key(&self) -> &[u8; HASH_KEY_LEN] {
        &self.hash_key
    }

    /// True if `mac` is either the peer's station or AP address.
    pub fn connected_to(&self, mac: &MacAddr) -> bool {
        self.peer_sta_mac == *mac || self.peer_ap_mac == *mac
    }

    pub fn is_temporary(&self) -> bool {
        self.expiry.is_some()
    }

    /// `None` for permanent sessions.
    pub fn remaining_duration(&self, now: Millis) -> Option<Millis> {
        self.expiry.map(|e| e.remaining_duration(now))
    }

    pub fn expired(&self, now: Millis) -> bool {
        self.expiry.map(|e| e.expired(now)).unwrap_or(false)
    }

    /// Turn the session into a temporary one with `remaining` ms left.
    pub fn set_remaining_duration(&mut self, remaining: Millis, now: Millis) {
        match &mut self.expiry {
            Some(e) => e.set_remaining_duration(remaining, now),
            None => self.expiry = Some(ExpiringTimeTracker::new(remaining, now)),
        }
    }

    /// Make the session permanent.
    pub fn remove_duration(&mut self) {
        self.expiry = None;
    }

    /// Keep a temporary session alive for at least `min_duration` more ms.
    /// Permanent sessions and longer remaining lifetimes are left alone.
    pub fn extend_remaining_duration(&mut self, min_duration: Millis, now: Millis) {
        if let Some(e) = &mut self.expiry {
            if e.remaining_duration(now) < min_duration {
                e.set_remaining_duration(min_duration, now);
            }
        }
    }

    pub fn export(&self, now: Millis) -> SerializedConnection {
        SerializedConnection {
            peer_sta_mac: self.peer_sta_mac,
            peer_ap_mac: self.peer_ap_mac,
            peer_session_key: self.peer_session_key,
            own_session_key: self.own_session_key,
            hash_key: self.hash_key,
            remaining_duration_ms: self.remaining_duration(now),
            next_sequence: self.next_sequence,
        }
    }

    /// Continue the outgoing counter from a saved `next_sequence`. Never moves
    /// it backwards, since the peer already saw the IDs below the current one.
    pub fn resume_sequence(&mut self, next_sequence: u64) {
        self.next_sequence = self.next_sequence.max(next_sequence.clamp(1, MAX_SEQUENCE));
    }

    /// Replace keys after a re-handshake with the same peer. Counters restart.
    pub fn rekey(
        &mut self,
        peer_ap_mac: MacAddr,
        peer_session_key: u64,
        own_session_key: u64,
        hash_key: [u8; HASH_KEY_LEN],
    ) {
        self.peer_ap_mac = peer_ap_mac;
        self.peer_session_key = peer_session_key;
        self.own_session_key = own_session_key;
        self.hash_key = hash_key;
        self.next_sequence = 1;
    }

    /// Next outgoing encrypted message ID (fragment 0). Monotonic within the session.
    pub fn next_message_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_sequence, 0, true);
        self.next_sequence = if self.next_sequence >= MAX_SEQUENCE {
            1
        } else {
            self.next_sequence + 1
        };
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, b])
    }

    #[test]
    fn permanent_never_expires() {
        let s = EncryptedConnectionData::new(mac(1), mac(2), 10, 20, [0; 32]);
        assert!(!s.is_temporary());
        assert!(!s.expired(u32::MAX));
        assert_eq!(s.remaining_duration(0), None);
    }

    #[test]
    fn temporary_lifecycle() {
        let mut s = EncryptedConnectionData::temporary(mac(1), mac(2), 10, 20, [0; 32], 100, 0);
        assert_eq!(s.remaining_duration(40), Some(60));
        assert!(s.expired(100));
        s.set_remaining_duration(500, 100);
        assert!(!s.expired(100));
        s.remove_duration();
        assert!(!s.is_temporary());
    }

    #[test]
    fn extension_never_shortens() {
        let mut s = EncryptedConnectionData::temporary(mac(1), mac(2), 10, 20, [0; 32], 5_000, 0);
        s.extend_remaining_duration(1_000, 0);
        assert_eq!(s.remaining_duration(0), Some(5_000));
        s.extend_remaining_duration(8_000, 1_000);
        assert_eq!(s.remaining_duration(1_000), Some(8_000));
        let mut p = EncryptedConnectionData::new(mac(1), mac(2), 10, 20, [0; 32]);
        p.extend_remaining_duration(1_000, 0);
        assert!(!p.is_temporary());
    }

    #[test]
    fn export_carries_counter_and_lifetime() {
        let mut s = EncryptedConnectionData::temporary(mac(1), mac(2), 10, 20, [7; 32], 900, 100);
        s.next_message_id();
        s.next_message_id();
        let saved = s.export(400);
        assert_eq!(saved.remaining_duration_ms, Some(600));
        assert_eq!(saved.next_sequence, 3);
        assert_eq!(saved.hash_key, [7; 32]);

        let mut restored = EncryptedConnectionData::new(mac(1), mac(2), 10, 20, [7; 32]);
        restored.resume_sequence(saved.next_sequence);
        assert_eq!(restored.next_message_id(), MessageId::new(3, 0, true));
        restored.resume_sequence(1);
        assert_eq!(restored.next_message_id(), MessageId::new(4, 0, true));
    }

    #[test]
    fn connected_to_either_mac() {
        let s = EncryptedConnectionData::new(mac(1), mac(2), 10, 20, [0; 32]);
        assert!(s.connected_to(&mac(1)));
        assert!(s.connected_to(&mac(2)));
        assert!(!s.connected_to(&mac(3)));
    }

    #[test]
    fn message_ids_increase() {
        let mut s = EncryptedConnectionData::new(mac(1), mac(2), 10, 20, [0; 32]);
        let a = s.next_message_id();
        let b = s.next_message_id();
        assert!(a.is_encrypted());
        assert!(b.sequence() > a.sequence());
        s.rekey(mac(2), 30, 40, [1; 32]);
        assert_eq!(s.next_message_id().sequence(), 1);
        assert_eq!(s.own_session_key(), 40);
    }
}

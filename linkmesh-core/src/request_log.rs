//! Peer request log: handshakes started by remote peers toward this node,
//! keyed by request ID, bounded and expiring.
//!
//! An entry is live while its current handshake step has time left. A stalled
//! entry (step timed out, or our reply could not be delivered) no longer counts
//! as a running handshake but is kept for the full lifetime, so a retransmitted
//! request with the same ID still gets the same nonce.

use crate::protocol::MacAddr;
use crate::time::{ExpiringTimeTracker, Millis};

pub const DEFAULT_PEER_REQUEST_LOG_CAPACITY: usize = 3;
pub const DEFAULT_PEER_REQUEST_LIFETIME_MS: Millis = 45_000;
/// Time the initiator has to answer our synchronization request.
pub const DEFAULT_PEER_REQUEST_STEP_TIMEOUT_MS: Millis = 1_000;

/// Session the responder will install once the confirmation arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSession {
    pub peer_sta_mac: MacAddr,
    pub peer_ap_mac: MacAddr,
    /// Requested lifetime; `None` = permanent.
    pub duration_ms: Option<Millis>,
}

#[derive(Debug, Clone)]
pub struct PeerRequestEntry {
    pub request_id: u64,
    pub request_encrypted: bool,
    pub authentication_password: String,
    pub peer_nonce: String,
    pub own_nonce: String,
    pub pending: PendingSession,
    expiry: ExpiringTimeTracker,
    step: ExpiringTimeTracker,
    stalled: bool,
}

impl PeerRequestEntry {
    pub fn remaining_duration(&self, now: Millis) -> Millis {
        self.expiry.remaining_duration(now)
    }

    pub fn expired(&self, now: Millis) -> bool {
        self.expiry.expired(now)
    }

    /// The handshake is still running at `now`.
    pub fn is_live(&self, now: Millis) -> bool {
        !self.stalled && !self.step.expired(now)
    }

    /// Marked stalled by a sweep or a failed reply.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }
}

/// Everything needed to record a new request.
pub struct NewPeerRequest {
    pub request_id: u64,
    pub request_encrypted: bool,
    pub authentication_password: String,
    pub peer_nonce: String,
    pub own_nonce: String,
    pub pending: PendingSession,
}

pub struct PeerRequestLog {
    entries: Vec<PeerRequestEntry>,
    capacity: usize,
    lifetime: Millis,
    step_timeout: Millis,
}

impl PeerRequestLog {
    pub fn new(capacity: usize, lifetime: Millis, step_timeout: Millis) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            lifetime,
            step_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a request. A request ID already present keeps its nonce and
    /// password and gets a fresh step timer. A different request from the same
    /// peer replaces that peer's older entry. When full, the oldest stalled
    /// entry makes room.
    pub fn record(
        &mut self,
        request: NewPeerRequest,
        now: Millis,
    ) -> Result<&PeerRequestEntry, RequestLogError> {
        let peer = request.pending.peer_sta_mac;
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.request_id == request.request_id && e.pending.peer_sta_mac == peer)
        {
            let entry = &mut self.entries[pos];
            entry.step = ExpiringTimeTracker::new(self.step_timeout, now);
            entry.stalled = false;
            return Ok(&self.entries[pos]);
        }
        self.entries.retain(|e| e.pending.peer_sta_mac != peer);
        if self.entries.len() >= self.capacity {
            let Some(pos) = self.entries.iter().position(|e| e.stalled) else {
                return Err(RequestLogError::Full);
            };
            self.entries.remove(pos);
        }
        self.entries.push(PeerRequestEntry {
            request_id: request.request_id,
            request_encrypted: request.request_encrypted,
            authentication_password: request.authentication_password,
            peer_nonce: request.peer_nonce,
            own_nonce: request.own_nonce,
            pending: request.pending,
            expiry: ExpiringTimeTracker::new(self.lifetime, now),
            step: ExpiringTimeTracker::new(self.step_timeout, now),
            stalled: false,
        });
        let last = self.entries.len() - 1;
        Ok(&self.entries[last])
    }

    pub fn get(&self, request_id: u64, peer: &MacAddr) -> Option<&PeerRequestEntry> {
        self.entries
            .iter()
            .find(|e| e.request_id == request_id && e.pending.peer_sta_mac == *peer)
    }

    pub fn get_by_peer(&self, peer: &MacAddr) -> Option<&PeerRequestEntry> {
        self.entries.iter().find(|e| e.pending.peer_sta_mac == *peer)
    }

    /// Stop counting `peer`'s request as running. Returns it if it was live.
    pub fn stall(&mut self, peer: &MacAddr) -> Option<PeerRequestEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.pending.peer_sta_mac == *peer && !e.stalled)?;
        entry.stalled = true;
        Some(entry.clone())
    }

    pub fn remove(&mut self, request_id: u64, peer: &MacAddr) -> Option<PeerRequestEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.request_id == request_id && e.pending.peer_sta_mac == *peer)?;
        Some(self.entries.remove(pos))
    }

    pub fn remove_by_peer(&mut self, peer: &MacAddr) -> Option<PeerRequestEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.pending.peer_sta_mac == *peer)?;
        Some(self.entries.remove(pos))
    }

    /// Stall entries whose step timed out and drop those past their lifetime.
    /// Returns the entries that stopped being live in this sweep.
    pub fn expire(&mut self, now: Millis) -> Vec<PeerRequestEntry> {
        let mut stalled = Vec::new();
        for e in self.entries.iter_mut() {
            if !e.stalled && (e.step.expired(now) || e.expiry.expired(now)) {
                e.stalled = true;
                stalled.push(e.clone());
            }
        }
        self.entries.retain(|e| !e.expiry.expired(now));
        stalled
    }
}

impl Default for PeerRequestLog {
    fn default() -> Self {
        Self::new(
            DEFAULT_PEER_REQUEST_LOG_CAPACITY,
            DEFAULT_PEER_REQUEST_LIFETIME_MS,
            DEFAULT_PEER_REQUEST_STEP_TIMEOUT_MS,
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestLogError {
    #[error("peer request log full")]
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, b])
    }

    fn request(id: u64, peer: u8, nonce: &str) -> NewPeerRequest {
        NewPeerRequest {
            request_id: id,
            request_encrypted: false,
            authentication_password: "password".into(),
            peer_nonce: "peer-nonce".into(),
            own_nonce: nonce.into(),
            pending: PendingSession {
                peer_sta_mac: mac(peer),
                peer_ap_mac: mac(peer + 100),
                duration_ms: None,
            },
        }
    }

    #[test]
    fn duplicate_request_is_idempotent() {
        let mut log = PeerRequestLog::default();
        let first = log.record(request(7, 1, "nonceA"), 0).unwrap().own_nonce.clone();
        let again = log.record(request(7, 1, "nonceB"), 10).unwrap();
        assert_eq!(again.own_nonce, first);
        assert_eq!(again.authentication_password, "password");
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn new_request_from_same_peer_replaces() {
        let mut log = PeerRequestLog::default();
        log.record(request(7, 1, "a"), 0).unwrap();
        log.record(request(8, 1, "b"), 0).unwrap();
        assert_eq!(log.len(), 1);
        assert!(log.get(7, &mac(1)).is_none());
        assert_eq!(log.get_by_peer(&mac(1)).unwrap().request_id, 8);
    }

    #[test]
    fn bounded() {
        let mut log = PeerRequestLog::new(3, 1_000, 100);
        for p in 1..=3 {
            log.record(request(u64::from(p), p, "n"), 0).unwrap();
        }
        assert!(matches!(
            log.record(request(9, 9, "n"), 0),
            Err(RequestLogError::Full)
        ));
        assert!(log.remove(2, &mac(2)).is_some());
        assert!(log.record(request(9, 9, "n"), 0).is_ok());
    }

    #[test]
    fn entries_expire() {
        let mut log = PeerRequestLog::new(3, 1_000, 1_000);
        log.record(request(1, 1, "n"), 0).unwrap();
        log.record(request(2, 2, "n"), 500).unwrap();
        assert_eq!(log.get(1, &mac(1)).unwrap().remaining_duration(400), 600);
        let gone = log.expire(1_000);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].request_id, 1);
        assert_eq!(log.len(), 1);
        assert!(log.remove_by_peer(&mac(2)).is_some());
        assert!(log.is_empty());
    }

    #[test]
    fn step_timeout_stalls_but_keeps_nonce() {
        let mut log = PeerRequestLog::new(3, 45_000, 1_000);
        let nonce = log.record(request(7, 1, "first"), 0).unwrap().own_nonce.clone();
        assert!(log.get(7, &mac(1)).unwrap().is_live(999));
        assert!(log.expire(999).is_empty());
        let stalled = log.expire(1_000);
        assert_eq!(stalled.len(), 1);
        assert!(log.expire(1_001).is_empty());
        let entry = log.get(7, &mac(1)).unwrap();
        assert!(entry.is_stalled());
        assert!(!entry.is_live(1_000));
        // The initiator retransmits: same nonce, running again.
        let again = log.record(request(7, 1, "second"), 1_500).unwrap();
        assert_eq!(again.own_nonce, nonce);
        assert!(again.is_live(1_500));
    }

    #[test]
    fn failed_reply_stalls_once() {
        let mut log = PeerRequestLog::default();
        log.record(request(3, 1, "n"), 0).unwrap();
        assert_eq!(log.stall(&mac(1)).unwrap().request_id, 3);
        assert!(log.stall(&mac(1)).is_none());
        assert!(log.stall(&mac(2)).is_none());
        assert!(log.expire(5_000).is_empty());
    }

    #[test]
    fn stalled_entry_gives_up_its_slot() {
        let mut log = PeerRequestLog::new(2, 45_000, 1_000);
        log.record(request(1, 1, "n"), 0).unwrap();
        log.record(request(2, 2, "n"), 500).unwrap();
        assert!(matches!(
            log.record(request(3, 3, "n"), 600),
            Err(RequestLogError::Full)
        ));
        log.expire(1_000);
        log.record(request(3, 3, "n"), 1_000).unwrap();
        assert!(log.get_by_peer(&mac(1)).is_none());
        assert!(log.get_by_peer(&mac(2)).is_some());
    }
}

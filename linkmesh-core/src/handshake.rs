//! Connection manager: handshake state machine establishing session keys
//! authenticated by a shared password.
//!
//! Initiator: `None -> RequestSent -> AwaitingConfirm -> Established`.
//! Responder: rooted in a [`PeerRequestLog`] entry, from the encrypted-connection
//! request until the synchronization confirmation arrives or the step times out.
//! This module decides what to send and what to install; the engine sends
//! frames and owns the peer table.

use std::collections::{HashMap, HashSet};

use crate::crypto::{self, CryptoError, HASH_KEY_LEN};
use crate::peer_table::PeerTable;
use crate::protocol::{HandshakeMessage, MacAddr, PROTOCOL_VERSION};
use crate::request_log::{NewPeerRequest, PeerRequestEntry, PeerRequestLog, PendingSession};
use crate::time::{ExpiringTimeTracker, Millis};

pub const DEFAULT_HANDSHAKE_STEP_TIMEOUT_MS: Millis = 1_000;

const ACK_LABEL: &[u8] = b"ack";
const REFUSED_LABEL: &[u8] = b"refused";

/// Per-peer connection state as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    RequestSent,
    AwaitingConfirm,
    Established,
    RemovalPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// A handshake step did not complete in time.
    Timeout,
    AuthenticationFailed,
    /// No peer slot could be freed on one of the two sides.
    NoPeerSlot,
    /// A handshake frame exhausted its retransmissions.
    TransmissionFailed,
}

/// Keys agreed in a handshake, from this node's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub peer_sta_mac: MacAddr,
    pub peer_ap_mac: MacAddr,
    pub peer_session_key: u64,
    pub own_session_key: u64,
    pub hash_key: [u8; HASH_KEY_LEN],
    /// `None` = permanent.
    pub duration_ms: Option<Millis>,
}

/// Local addresses and password used when answering a remote handshake.
#[derive(Debug, Clone)]
pub struct LocalIdentity<'a> {
    pub sta_mac: MacAddr,
    pub ap_mac: MacAddr,
    pub password: &'a str,
}

/// What to do after a handshake frame was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Send(HandshakeMessage),
    /// Responder: install the session, then send the ack.
    InstallAndSend(SessionKeys, HandshakeMessage),
    /// Initiator: install the session; the first field is the handshake's target.
    Install(MacAddr, SessionKeys),
    Failed(MacAddr, HandshakeFailure),
    Ignore,
}

enum OutgoingPhase {
    RequestSent,
    AwaitingConfirm {
        keys: SessionKeys,
        confirmation: HandshakeMessage,
    },
}

struct OutgoingHandshake {
    request_id: u64,
    password: String,
    own_nonce: String,
    duration_ms: Option<Millis>,
    phase: OutgoingPhase,
    step: ExpiringTimeTracker,
}

/// Handshakes that ran out of time in one sweep.
#[derive(Debug, Default)]
pub struct ExpiredHandshakes {
    /// Peers this node was initiating toward.
    pub outgoing: Vec<MacAddr>,
    /// Remote-initiated requests whose step ran out without a confirmation.
    pub incoming: Vec<PeerRequestEntry>,
}

pub struct ConnectionManager {
    outgoing: HashMap<MacAddr, OutgoingHandshake>,
    incoming: PeerRequestLog,
    removal_pending: HashSet<MacAddr>,
    step_timeout: Millis,
    nonce_len: usize,
}

fn ack_mac(hash_key: &[u8; HASH_KEY_LEN], request_id: u64) -> Result<[u8; 32], CryptoError> {
    crypto::mac_parts(hash_key, &[&request_id.to_le_bytes(), ACK_LABEL])
}

fn refusal_mac(password: &str, request_id: u64) -> Result<[u8; 32], CryptoError> {
    crypto::mac_parts(
        password.as_bytes(),
        &[&request_id.to_le_bytes(), REFUSED_LABEL],
    )
}

fn nonce_mac(password: &str, request_id: u64, nonce: &str) -> Result<[u8; 32], CryptoError> {
    crypto::mac_parts(
        password.as_bytes(),
        &[&request_id.to_le_bytes(), nonce.as_bytes()],
    )
}

fn verify_nonce_mac(
    password: &str,
    request_id: u64,
    nonce: &str,
    hmac: &[u8; 32],
) -> Result<(), CryptoError> {
    crypto::verify_mac(
        password.as_bytes(),
        &[&request_id.to_le_bytes(), nonce.as_bytes()],
        hmac,
    )
}

/// Refusal answer to a connection request, authenticated with the password.
pub fn refusal(password: &str, request_id: u64) -> Result<HandshakeMessage, CryptoError> {
    Ok(HandshakeMessage::Refused {
        request_id,
        hmac: refusal_mac(password, request_id)?,
    })
}

impl ConnectionManager {
    pub fn new(
        step_timeout: Millis,
        nonce_len: usize,
        request_log_capacity: usize,
        request_lifetime: Millis,
    ) -> Self {
        Self {
            outgoing: HashMap::new(),
            incoming: PeerRequestLog::new(request_log_capacity, request_lifetime, step_timeout),
            removal_pending: HashSet::new(),
            step_timeout,
            nonce_len,
        }
    }

    /// Key of the outgoing handshake toward `mac` (station or AP address).
    pub fn outgoing_target(&self, mac: &MacAddr) -> Option<MacAddr> {
        if self.outgoing.contains_key(mac) {
            return Some(*mac);
        }
        self.outgoing.iter().find_map(|(target, h)| match &h.phase {
            OutgoingPhase::AwaitingConfirm { keys, .. }
                if keys.peer_sta_mac == *mac || keys.peer_ap_mac == *mac =>
            {
                Some(*target)
            }
            _ => None,
        })
    }

    pub fn state(&self, peer: &MacAddr, table: &PeerTable) -> ConnectionState {
        if self.removal_pending.contains(peer) {
            return ConnectionState::RemovalPending;
        }
        if let Some(h) = self.outgoing_target(peer).and_then(|t| self.outgoing.get(&t)) {
            return match h.phase {
                OutgoingPhase::RequestSent => ConnectionState::RequestSent,
                OutgoingPhase::AwaitingConfirm { .. } => ConnectionState::AwaitingConfirm,
            };
        }
        if table.contains(peer) {
            ConnectionState::Established
        } else if self
            .incoming
            .get_by_peer(peer)
            .map(|e| !e.is_stalled())
            .unwrap_or(false)
        {
            ConnectionState::AwaitingConfirm
        } else {
            ConnectionState::None
        }
    }

    pub fn is_initiating(&self, peer: &MacAddr) -> bool {
        self.outgoing_target(peer).is_some()
    }

    /// A handshake with `peer` is running at `now` in either role.
    pub fn in_progress(&self, peer: &MacAddr, now: Millis) -> bool {
        self.is_initiating(peer)
            || self
                .incoming
                .get_by_peer(peer)
                .map(|e| e.is_live(now))
                .unwrap_or(false)
    }

    pub fn pending_requests(&self) -> usize {
        self.incoming.len()
    }

    /// Start a handshake toward `peer`. Returns `None` if one is already running.
    pub fn begin(
        &mut self,
        peer: MacAddr,
        own_ap_mac: MacAddr,
        password: &str,
        duration_ms: Option<Millis>,
        now: Millis,
    ) -> Result<Option<HandshakeMessage>, CryptoError> {
        if self.is_initiating(&peer) {
            return Ok(None);
        }
        let request_id = crypto::random64();
        let own_nonce = crypto::random_nonce(self.nonce_len);
        let hmac = nonce_mac(password, request_id, &own_nonce)?;
        let msg = HandshakeMessage::ConnectionRequest {
            protocol_version: PROTOCOL_VERSION,
            request_id,
            nonce: own_nonce.clone(),
            ap_mac: own_ap_mac,
            duration_ms,
            hmac,
        };
        self.outgoing.insert(
            peer,
            OutgoingHandshake {
                request_id,
                password: password.to_string(),
                own_nonce,
                duration_ms,
                phase: OutgoingPhase::RequestSent,
                step: ExpiringTimeTracker::new(self.step_timeout, now),
            },
        );
        Ok(Some(msg))
    }

    /// Drop the outgoing handshake toward `peer`. Returns its target.
    pub fn abort(&mut self, peer: &MacAddr) -> Option<MacAddr> {
        let target = self.outgoing_target(peer)?;
        self.outgoing.remove(&target);
        Some(target)
    }

    /// Drop the outgoing handshake with `request_id`. Returns its target.
    pub fn abort_request(&mut self, request_id: u64) -> Option<MacAddr> {
        let target = self.target_of_request(request_id)?;
        self.outgoing.remove(&target);
        Some(target)
    }

    fn target_of_request(&self, request_id: u64) -> Option<MacAddr> {
        self.outgoing
            .iter()
            .find(|(_, h)| h.request_id == request_id)
            .map(|(target, _)| *target)
    }

    /// Our synchronization request to `peer` could not be delivered. The
    /// record stays for request-ID idempotence only.
    pub fn stall_incoming(&mut self, peer: &MacAddr) -> Option<PeerRequestEntry> {
        self.incoming.stall(peer)
    }

    /// Responder: an encrypted-connection request arrived.
    pub fn on_connection_request(
        &mut self,
        peer: MacAddr,
        msg: &HandshakeMessage,
        request_encrypted: bool,
        local: &LocalIdentity<'_>,
        table: &PeerTable,
        now: Millis,
    ) -> Result<HandshakeReply, CryptoError> {
        let HandshakeMessage::ConnectionRequest {
            protocol_version,
            request_id,
            nonce,
            ap_mac,
            duration_ms,
            hmac,
        } = msg
        else {
            return Ok(HandshakeReply::Ignore);
        };
        if *protocol_version != PROTOCOL_VERSION {
            return Ok(HandshakeReply::Ignore);
        }
        verify_nonce_mac(local.password, *request_id, nonce, hmac)?;
        let own = self
            .outgoing_target(&peer)
            .or_else(|| self.outgoing_target(ap_mac));
        if let Some(target) = own {
            if local.sta_mac < peer {
                return Ok(HandshakeReply::Ignore);
            }
            self.outgoing.remove(&target);
        }
        if !table.has_room() && !table.contains(&peer) {
            return Ok(HandshakeReply::Send(refusal(local.password, *request_id)?));
        }
        let recorded = self.incoming.record(
            NewPeerRequest {
                request_id: *request_id,
                request_encrypted,
                authentication_password: local.password.to_string(),
                peer_nonce: nonce.clone(),
                own_nonce: crypto::random_nonce(self.nonce_len),
                pending: PendingSession {
                    peer_sta_mac: peer,
                    peer_ap_mac: *ap_mac,
                    duration_ms: *duration_ms,
                },
            },
            now,
        );
        let entry = match recorded {
            Ok(entry) => entry,
            Err(_) => return Ok(HandshakeReply::Send(refusal(local.password, *request_id)?)),
        };
        let hmac = nonce_mac(&entry.authentication_password, entry.request_id, &entry.own_nonce)?;
        Ok(HandshakeReply::Send(HandshakeMessage::SynchronizationRequest {
            request_id: entry.request_id,
            nonce: entry.own_nonce.clone(),
            ap_mac: local.ap_mac,
            hmac,
        }))
    }

    /// Initiator: the responder's challenge arrived.
    pub fn on_synchronization_request(
        &mut self,
        peer: MacAddr,
        msg: &HandshakeMessage,
        table: &PeerTable,
        now: Millis,
    ) -> Result<HandshakeReply, CryptoError> {
        let HandshakeMessage::SynchronizationRequest {
            request_id,
            nonce,
            ap_mac,
            hmac,
        } = msg
        else {
            return Ok(HandshakeReply::Ignore);
        };
        let step_timeout = self.step_timeout;
        let Some(target) = self.target_of_request(*request_id) else {
            return Ok(HandshakeReply::Ignore);
        };
        let Some(h) = self.outgoing.get_mut(&target) else {
            return Ok(HandshakeReply::Ignore);
        };
        if let OutgoingPhase::AwaitingConfirm { confirmation, .. } = &h.phase {
            return Ok(HandshakeReply::Send(confirmation.clone()));
        }
        verify_nonce_mac(&h.password, *request_id, nonce, hmac)?;
        let hash_key = crypto::derive_hash_key(&h.password, &h.own_nonce, nonce)?;
        let (peer_session_key, own_session_key) = loop {
            let pair = (crypto::random64(), crypto::random64());
            if pair.0 != pair.1 && !table.keys_in_use(pair.0, pair.1) {
                break pair;
            }
        };
        let sealed_keys =
            crypto::seal_session_keys(&hash_key, *request_id, peer_session_key, own_session_key)?;
        let confirmation = HandshakeMessage::SynchronizationConfirmation {
            request_id: *request_id,
            sealed_keys,
        };
        h.phase = OutgoingPhase::AwaitingConfirm {
            keys: SessionKeys {
                peer_sta_mac: peer,
                peer_ap_mac: *ap_mac,
                peer_session_key,
                own_session_key,
                hash_key,
                duration_ms: h.duration_ms,
            },
            confirmation: confirmation.clone(),
        };
        h.step = ExpiringTimeTracker::new(step_timeout, now);
        Ok(HandshakeReply::Send(confirmation))
    }

    /// Responder: the initiator's confirmation with the sealed keys arrived.
    pub fn on_confirmation(
        &mut self,
        peer: MacAddr,
        msg: &HandshakeMessage,
        table: &PeerTable,
    ) -> Result<HandshakeReply, CryptoError> {
        let HandshakeMessage::SynchronizationConfirmation {
            request_id,
            sealed_keys,
        } = msg
        else {
            return Ok(HandshakeReply::Ignore);
        };
        let Some(entry) = self.incoming.get(*request_id, &peer) else {
            // Duplicate after install: the ack was lost, send it again.
            if let Some(s) = table.get(&peer) {
                if let Ok((peer_key, own_key)) =
                    crypto::open_session_keys(s.hash_key(), *request_id, sealed_keys)
                {
                    if s.own_session_key() == peer_key && s.peer_session_key() == own_key {
                        return Ok(HandshakeReply::Send(HandshakeMessage::ConfirmationAck {
                            request_id: *request_id,
                            hmac: ack_mac(s.hash_key(), *request_id)?,
                        }));
                    }
                }
            }
            return Ok(HandshakeReply::Ignore);
        };
        let hash_key = crypto::derive_hash_key(
            &entry.authentication_password,
            &entry.peer_nonce,
            &entry.own_nonce,
        )?;
        // Keys are named from the initiator's side.
        let (initiator_peer_key, initiator_own_key) =
            crypto::open_session_keys(&hash_key, *request_id, sealed_keys)?;
        let keys = SessionKeys {
            peer_sta_mac: peer,
            peer_ap_mac: entry.pending.peer_ap_mac,
            peer_session_key: initiator_own_key,
            own_session_key: initiator_peer_key,
            hash_key,
            duration_ms: entry.pending.duration_ms,
        };
        self.incoming.remove(*request_id, &peer);
        let ack = HandshakeMessage::ConfirmationAck {
            request_id: *request_id,
            hmac: ack_mac(&hash_key, *request_id)?,
        };
        Ok(HandshakeReply::InstallAndSend(keys, ack))
    }

    /// Initiator: the responder acked or refused.
    pub fn on_ack(
        &mut self,
        peer: MacAddr,
        msg: &HandshakeMessage,
    ) -> Result<HandshakeReply, CryptoError> {
        let Some(target) = self.target_of_request(msg.request_id()) else {
            return Ok(HandshakeReply::Ignore);
        };
        let Some(h) = self.outgoing.get(&target) else {
            return Ok(HandshakeReply::Ignore);
        };
        match msg {
            HandshakeMessage::ConfirmationAck { request_id, hmac } => {
                let OutgoingPhase::AwaitingConfirm { keys, .. } = &h.phase else {
                    return Ok(HandshakeReply::Ignore);
                };
                if keys.peer_sta_mac != peer {
                    return Ok(HandshakeReply::Ignore);
                }
                crypto::verify_mac(
                    &keys.hash_key,
                    &[&request_id.to_le_bytes(), ACK_LABEL],
                    hmac,
                )?;
                let keys = keys.clone();
                self.outgoing.remove(&target);
                Ok(HandshakeReply::Install(target, keys))
            }
            HandshakeMessage::Refused { request_id, hmac } => {
                crypto::verify_mac(
                    h.password.as_bytes(),
                    &[&request_id.to_le_bytes(), REFUSED_LABEL],
                    hmac,
                )?;
                self.outgoing.remove(&target);
                Ok(HandshakeReply::Failed(target, HandshakeFailure::NoPeerSlot))
            }
            _ => Ok(HandshakeReply::Ignore),
        }
    }

    /// Remove handshakes whose current step timed out.
    pub fn expire(&mut self, now: Millis) -> ExpiredHandshakes {
        let outgoing: Vec<MacAddr> = self
            .outgoing
            .iter()
            .filter(|(_, h)| h.step.expired(now))
            .map(|(&peer, _)| peer)
            .collect();
        for peer in &outgoing {
            self.outgoing.remove(peer);
        }
        ExpiredHandshakes {
            outgoing,
            incoming: self.incoming.expire(now),
        }
    }

    pub fn mark_removal_pending(&mut self, peer: MacAddr) {
        self.removal_pending.insert(peer);
    }

    pub fn finish_removal(&mut self, peer: &MacAddr) -> bool {
        self.removal_pending.remove(peer)
    }

    pub fn is_removal_pending(&self, peer: &MacAddr) -> bool {
        self.removal_pending.contains(peer)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(
            DEFAULT_HANDSHAKE_STEP_TIMEOUT_MS,
            crypto::DEFAULT_NONCE_LEN,
            crate::request_log::DEFAULT_PEER_REQUEST_LOG_CAPACITY,
            crate::request_log::DEFAULT_PEER_REQUEST_LIFETIME_MS,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EncryptedConnectionData;

    const PASSWORD: &str = "mesh-password";

    fn mac(b: u8) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, b])
    }

    fn local(b: u8) -> LocalIdentity<'static> {
        LocalIdentity {
            sta_mac: mac(b),
            ap_mac: mac(b + 100),
            password: PASSWORD,
        }
    }

    fn sent(reply: HandshakeReply) -> HandshakeMessage {
        match reply {
            HandshakeReply::Send(m) => m,
            other => panic!("expected Send, got {:?}", other),
        }
    }

    fn install(table: &mut PeerTable, peer: MacAddr, keys: &SessionKeys) {
        assert_eq!(keys.peer_sta_mac, peer);
        let s = EncryptedConnectionData::new(
            peer,
            keys.peer_ap_mac,
            keys.peer_session_key,
            keys.own_session_key,
            keys.hash_key,
        );
        table.add(s, 0).unwrap();
    }

    /// Runs A(1) -> B(2) to completion and returns both sides' keys.
    fn full_handshake(
        a: &mut ConnectionManager,
        b: &mut ConnectionManager,
        ta: &PeerTable,
        tb: &PeerTable,
    ) -> (SessionKeys, SessionKeys) {
        let req = a.begin(mac(2), mac(101), PASSWORD, Some(45_000), 0).unwrap().unwrap();
        assert_eq!(a.state(&mac(2), ta), ConnectionState::RequestSent);
        let sync = sent(b.on_connection_request(mac(1), &req, false, &local(2), tb, 0).unwrap());
        assert_eq!(b.state(&mac(1), tb), ConnectionState::AwaitingConfirm);
        let confirm = sent(a.on_synchronization_request(mac(2), &sync, ta, 5).unwrap());
        assert_eq!(a.state(&mac(2), ta), ConnectionState::AwaitingConfirm);
        let (kb, ack) = match b.on_confirmation(mac(1), &confirm, tb).unwrap() {
            HandshakeReply::InstallAndSend(k, ack) => (k, ack),
            other => panic!("unexpected {:?}", other),
        };
        let ka = match a.on_ack(mac(2), &ack).unwrap() {
            HandshakeReply::Install(target, k) => {
                assert_eq!(target, mac(2));
                k
            }
            other => panic!("unexpected {:?}", other),
        };
        (ka, kb)
    }

    #[test]
    fn handshake_agrees_on_mirrored_keys() {
        let mut a = ConnectionManager::default();
        let mut b = ConnectionManager::default();
        let (ta, tb) = (PeerTable::default(), PeerTable::default());
        let (ka, kb) = full_handshake(&mut a, &mut b, &ta, &tb);
        assert_eq!(ka.hash_key, kb.hash_key);
        assert_eq!(ka.peer_session_key, kb.own_session_key);
        assert_eq!(ka.own_session_key, kb.peer_session_key);
        assert_eq!(ka.peer_ap_mac, mac(102));
        assert_eq!(kb.peer_ap_mac, mac(101));
        assert_eq!(kb.duration_ms, Some(45_000));
        assert!(!a.in_progress(&mac(2), 5));
        assert!(!b.in_progress(&mac(1), 5));
        assert_eq!(b.pending_requests(), 0);
    }

    #[test]
    fn handshake_toward_ap_address_resolves_station() {
        let mut a = ConnectionManager::default();
        let mut b = ConnectionManager::default();
        let (ta, tb) = (PeerTable::default(), PeerTable::default());
        let req = a.begin(mac(102), mac(101), PASSWORD, None, 0).unwrap().unwrap();
        let sync = sent(b.on_connection_request(mac(1), &req, false, &local(2), &tb, 0).unwrap());
        // Replies come from the station address.
        let confirm = sent(a.on_synchronization_request(mac(2), &sync, &ta, 1).unwrap());
        assert!(a.is_initiating(&mac(2)));
        assert_eq!(a.outgoing_target(&mac(2)), Some(mac(102)));
        let ack = match b.on_confirmation(mac(1), &confirm, &tb).unwrap() {
            HandshakeReply::InstallAndSend(_, ack) => ack,
            other => panic!("unexpected {:?}", other),
        };
        match a.on_ack(mac(2), &ack).unwrap() {
            HandshakeReply::Install(target, keys) => {
                assert_eq!(target, mac(102));
                assert_eq!(keys.peer_sta_mac, mac(2));
                assert_eq!(keys.duration_ms, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn repeated_request_reuses_nonce() {
        let mut a = ConnectionManager::default();
        let mut b = ConnectionManager::default();
        let tb = PeerTable::default();
        let req = a.begin(mac(2), mac(101), PASSWORD, None, 0).unwrap().unwrap();
        assert!(a.begin(mac(2), mac(101), PASSWORD, None, 0).unwrap().is_none());
        let first = sent(b.on_connection_request(mac(1), &req, false, &local(2), &tb, 0).unwrap());
        let second = sent(b.on_connection_request(mac(1), &req, false, &local(2), &tb, 1).unwrap());
        assert_eq!(first, second);
        assert_eq!(b.pending_requests(), 1);
    }

    #[test]
    fn duplicate_sync_request_resends_confirmation() {
        let mut a = ConnectionManager::default();
        let mut b = ConnectionManager::default();
        let (ta, tb) = (PeerTable::default(), PeerTable::default());
        let req = a.begin(mac(2), mac(101), PASSWORD, None, 0).unwrap().unwrap();
        let sync = sent(b.on_connection_request(mac(1), &req, false, &local(2), &tb, 0).unwrap());
        let c1 = sent(a.on_synchronization_request(mac(2), &sync, &ta, 1).unwrap());
        let c2 = sent(a.on_synchronization_request(mac(2), &sync, &ta, 2).unwrap());
        assert_eq!(c1, c2);
    }

    #[test]
    fn duplicate_confirmation_after_install_is_reacked() {
        let mut a = ConnectionManager::default();
        let mut b = ConnectionManager::default();
        let (ta, mut tb) = (PeerTable::default(), PeerTable::default());
        let req = a.begin(mac(2), mac(101), PASSWORD, None, 0).unwrap().unwrap();
        let sync = sent(b.on_connection_request(mac(1), &req, false, &local(2), &tb, 0).unwrap());
        let confirm = sent(a.on_synchronization_request(mac(2), &sync, &ta, 1).unwrap());
        let (kb, ack) = match b.on_confirmation(mac(1), &confirm, &tb).unwrap() {
            HandshakeReply::InstallAndSend(k, ack) => (k, ack),
            other => panic!("unexpected {:?}", other),
        };
        install(&mut tb, mac(1), &kb);
        assert_eq!(sent(b.on_confirmation(mac(1), &confirm, &tb).unwrap()), ack);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let mut a = ConnectionManager::default();
        let mut b = ConnectionManager::default();
        let tb = PeerTable::default();
        let req = a.begin(mac(2), mac(101), "another-password", None, 0).unwrap().unwrap();
        assert!(matches!(
            b.on_connection_request(mac(1), &req, false, &local(2), &tb, 0),
            Err(CryptoError::AuthenticationFailed)
        ));
        assert_eq!(b.pending_requests(), 0);
    }

    #[test]
    fn smaller_mac_wins_tie() {
        let mut a = ConnectionManager::default();
        let mut b = ConnectionManager::default();
        let (ta, tb) = (PeerTable::default(), PeerTable::default());
        let req_a = a.begin(mac(2), mac(101), PASSWORD, None, 0).unwrap().unwrap();
        let req_b = b.begin(mac(1), mac(102), PASSWORD, None, 0).unwrap().unwrap();
        // A (smaller MAC) ignores B's request and keeps its own handshake.
        assert_eq!(
            a.on_connection_request(mac(2), &req_b, false, &local(1), &ta, 0).unwrap(),
            HandshakeReply::Ignore
        );
        assert!(a.is_initiating(&mac(2)));
        // B aborts and answers A.
        let sync = sent(b.on_connection_request(mac(1), &req_a, false, &local(2), &tb, 0).unwrap());
        assert!(!b.is_initiating(&mac(1)));
        assert!(matches!(sync, HandshakeMessage::SynchronizationRequest { .. }));
        assert!(b.in_progress(&mac(1), 0));
    }

    #[test]
    fn full_table_refuses() {
        let mut a = ConnectionManager::default();
        let mut b = ConnectionManager::default();
        let ta = PeerTable::default();
        let mut tb = PeerTable::new(1);
        tb.add(EncryptedConnectionData::new(mac(9), mac(109), 1, 2, [0; 32]), 0)
            .unwrap();
        let req = a.begin(mac(2), mac(101), PASSWORD, None, 0).unwrap().unwrap();
        let refused = sent(b.on_connection_request(mac(1), &req, false, &local(2), &tb, 0).unwrap());
        assert!(matches!(refused, HandshakeMessage::Refused { .. }));
        assert_eq!(
            a.on_ack(mac(2), &refused).unwrap(),
            HandshakeReply::Failed(mac(2), HandshakeFailure::NoPeerSlot)
        );
        assert_eq!(a.state(&mac(2), &ta), ConnectionState::None);
    }

    #[test]
    fn steps_time_out() {
        let mut a = ConnectionManager::default();
        let mut b = ConnectionManager::default();
        let tb = PeerTable::default();
        let req = a.begin(mac(2), mac(101), PASSWORD, None, 0).unwrap().unwrap();
        b.on_connection_request(mac(1), &req, false, &local(2), &tb, 0).unwrap();
        assert!(a.expire(999).outgoing.is_empty());
        assert_eq!(a.expire(1_000).outgoing, vec![mac(2)]);
        assert!(!a.is_initiating(&mac(2)));
        let expired = b.expire(crate::request_log::DEFAULT_PEER_REQUEST_LIFETIME_MS);
        assert_eq!(expired.incoming.len(), 1);
    }

    #[test]
    fn responder_step_times_out_without_losing_the_request() {
        let mut a = ConnectionManager::default();
        let mut b = ConnectionManager::default();
        let tb = PeerTable::default();
        let req = a.begin(mac(2), mac(101), PASSWORD, None, 0).unwrap().unwrap();
        let sync = sent(b.on_connection_request(mac(1), &req, false, &local(2), &tb, 0).unwrap());
        assert!(b.in_progress(&mac(1), 999));
        assert!(!b.in_progress(&mac(1), 1_000));
        let expired = b.expire(1_000);
        assert_eq!(expired.incoming.len(), 1);
        assert_eq!(b.state(&mac(1), &tb), ConnectionState::None);
        assert_eq!(b.pending_requests(), 1);
        // A late retransmission of the same request is answered identically.
        let again = sent(b.on_connection_request(mac(1), &req, false, &local(2), &tb, 1_200).unwrap());
        assert_eq!(again, sync);
        assert!(b.in_progress(&mac(1), 1_200));
    }

    #[test]
    fn undeliverable_sync_request_stalls_responder() {
        let mut a = ConnectionManager::default();
        let mut b = ConnectionManager::default();
        let tb = PeerTable::default();
        let req = a.begin(mac(2), mac(101), PASSWORD, None, 0).unwrap().unwrap();
        b.on_connection_request(mac(1), &req, false, &local(2), &tb, 0).unwrap();
        assert!(b.stall_incoming(&mac(1)).is_some());
        assert!(!b.in_progress(&mac(1), 1));
        assert!(b.stall_incoming(&mac(1)).is_none());
        assert!(b.expire(1_000).incoming.is_empty());
    }

    #[test]
    fn removal_pending_state() {
        let mut m = ConnectionManager::default();
        let t = PeerTable::default();
        m.mark_removal_pending(mac(3));
        assert_eq!(m.state(&mac(3), &t), ConnectionState::RemovalPending);
        assert!(m.finish_removal(&mac(3)));
        assert!(!m.finish_removal(&mac(3)));
        assert_eq!(m.state(&mac(3), &t), ConnectionState::None);
    }
}

//! Host-driven API: MeshCore owns the protocol state; the host owns the clock
//! and the radio, calls [`MeshCore::perform_maintenance`] from its main loop
//! and feeds received frames through [`MeshCore::on_frame_received`].

use std::mem;

use heapless::spsc::Queue;
use tracing::{debug, info, trace, warn};

use crate::ap::ApRole;
use crate::assembler::{
    AssembledMessage, AssemblyResult, ReceiveAssembler, ReceivedFragment, ReplayStream,
};
use crate::config::MeshConfig;
use crate::crypto;
use crate::error::MeshError;
use crate::handshake::{
    self, ConnectionManager, ConnectionState, HandshakeFailure, HandshakeReply, LocalIdentity,
    SessionKeys,
};
use crate::peer_table::{PeerTable, PeerTableError};
use crate::protocol::{
    FrameType, HandshakeMessage, MacAddr, MessageId, BROADCAST_MAC, MAX_FRAME_LEN, MAX_SEQUENCE,
};
use crate::radio::{NetworkInfo, Radio, RadioError, SendResult};
use crate::response_queue::{parse_response_body, ResponseEntry, ResponseQueue};
use crate::send_queue::{
    self, EntryKind, OutcomeSlot, Outbound, RetryDecision, SendBody, SendEntry, SendQueue,
};
use crate::session::{EncryptedConnectionData, SerializedConnection};
use crate::stats::MeshStats;
use crate::time::{ExpiringTimeTracker, Millis};
use crate::wire::{self, Frame, FrameHeader};

/// Receive ring slots; one slot is always kept free.
pub const RX_RING_SLOTS: usize = 8;

/// Delivery details handed to the request and response handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    pub sender: MacAddr,
    /// ID of the received message (fragment 0).
    pub message_id: MessageId,
    pub encrypted: bool,
    pub broadcast: bool,
}

pub type RequestHandler = Box<dyn FnMut(&str, &MessageContext) -> String>;
pub type ResponseHandler = Box<dyn FnMut(&str, &MessageContext)>;
pub type NetworkFilter = Box<dyn FnMut(&[NetworkInfo]) -> Vec<usize>>;

/// Application hooks. The request handler's non-empty return value is sent back
/// as the response; the network filter returns indices of networks to keep.
pub struct Callbacks {
    pub request_handler: RequestHandler,
    pub response_handler: ResponseHandler,
    pub network_filter: NetworkFilter,
}

impl Callbacks {
    pub fn new<Q, S, F>(request_handler: Q, response_handler: S, network_filter: F) -> Self
    where
        Q: FnMut(&str, &MessageContext) -> String + 'static,
        S: FnMut(&str, &MessageContext) + 'static,
        F: FnMut(&[NetworkInfo]) -> Vec<usize> + 'static,
    {
        Self {
            request_handler: Box::new(request_handler),
            response_handler: Box::new(response_handler),
            network_filter: Box::new(network_filter),
        }
    }
}

/// Network filter keeping every network whose SSID starts with `prefix`.
pub fn mesh_name_filter(prefix: impl Into<String>) -> impl FnMut(&[NetworkInfo]) -> Vec<usize> {
    let prefix = prefix.into();
    move |networks: &[NetworkInfo]| {
        networks
            .iter()
            .enumerate()
            .filter(|(_, n)| n.ssid.starts_with(prefix.as_str()))
            .map(|(i, _)| i)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    Broadcast,
    Peers(Vec<MacAddr>),
    /// Networks selected by the last scan.
    ConnectionQueue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmissionOptions {
    /// Scan (and refresh the connection queue) before sending.
    pub scan: bool,
    pub scan_all_channels: bool,
    /// Send over encrypted sessions, creating them as needed. Ignored for broadcasts.
    pub encrypt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionStatus {
    Pending,
    TransmissionComplete,
    RecipientUnreachable,
    HandshakeFailed,
    NoPeerSlot,
    NoSession,
    FrameTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionOutcome {
    pub recipient: MacAddr,
    pub status: TransmissionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Initiated,
    InProgress,
    /// Session already existed; only its duration was updated.
    AlreadyEstablished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    Scheduled,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Expired,
    /// Made room for a new session.
    Evicted,
    Requested,
    PeerRequested,
}

/// Things that happened since the previous tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    ConnectionEstablished {
        peer: MacAddr,
        temporary: bool,
    },
    HandshakeFailed {
        peer: MacAddr,
        reason: HandshakeFailure,
    },
    ConnectionRemoved {
        peer: MacAddr,
        reason: RemovalReason,
    },
    TransmissionFinished {
        recipient: MacAddr,
        status: TransmissionStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_sta_mac: MacAddr,
    pub peer_ap_mac: MacAddr,
    pub temporary: bool,
    /// `None` for permanent sessions.
    pub remaining_duration_ms: Option<Millis>,
}

/// A sent request still accepting responses.
struct ExpectedResponse {
    request_id: MessageId,
    /// `BROADCAST_MAC` for broadcasts, which accept several responses.
    target: MacAddr,
    tracker: ExpiringTimeTracker,
}

struct RxFrame {
    sender: MacAddr,
    bytes: heapless::Vec<u8, MAX_FRAME_LEN>,
}

/// Main coordinator. Single-threaded; every call takes the current time.
pub struct MeshCore<R: Radio> {
    radio: R,
    config: MeshConfig,
    callbacks: Callbacks,
    peers: PeerTable,
    connections: ConnectionManager,
    send_queue: SendQueue,
    assembler: ReceiveAssembler,
    responses: ResponseQueue,
    expecting: Vec<ExpectedResponse>,
    connection_queue: Vec<NetworkInfo>,
    outcomes: Vec<TransmissionOutcome>,
    generation: u64,
    unencrypted_sequence: u64,
    rx_ring: Queue<RxFrame, RX_RING_SLOTS>,
    reported_overflows: u64,
    stats: MeshStats,
    pending_events: Vec<MeshEvent>,
}

/// Encrypted removal-request frame for `session`, built before the session is dropped.
fn removal_notice_frame(session: &mut EncryptedConnectionData) -> Result<Vec<u8>, MeshError> {
    let body = HandshakeMessage::RemovalRequest {
        request_id: crypto::random64(),
    }
    .encode()?;
    let len = u8::try_from(body.len()).map_err(|_| MeshError::FrameTooLarge)?;
    let header = FrameHeader {
        frame_type: FrameType::EncryptedConnectionRemovalRequest,
        fragments_remaining: 0,
        destination: Some(session.peer_sta_mac()),
        message_id: session.next_message_id(),
        session_tag: Some(session.own_session_key()),
    };
    let (payload, tag) = crypto::encrypt(
        session.own_session_key(),
        session.hash_key(),
        &header.to_bytes(len),
        &body,
    )?;
    Ok(wire::encode_frame(&Frame {
        header,
        payload,
        auth_tag: Some(tag),
    })?)
}

/// Address whose entries go out one message at a time. Encrypted traffic to a
/// peer's station and AP addresses shares one session counter, so both map to
/// the station address.
fn ordering_peer(peers: &PeerTable, entry: &SendEntry) -> MacAddr {
    if !entry.encrypted {
        return entry.target;
    }
    peers
        .get(&entry.target)
        .map(|s| s.peer_sta_mac())
        .unwrap_or(entry.target)
}

impl<R: Radio> MeshCore<R> {
    pub fn new(radio: R, config: MeshConfig, callbacks: Callbacks) -> Result<Self, MeshError> {
        config.validate()?;
        Ok(Self {
            peers: PeerTable::new(config.peer_table_capacity),
            connections: ConnectionManager::new(
                config.handshake_step_timeout_ms,
                config.nonce_length,
                config.peer_request_log_capacity,
                config.peer_request_lifetime_ms,
            ),
            send_queue: SendQueue::new(
                config.transmissions_per_frame,
                config.retransmission_backoff_ms,
            ),
            assembler: ReceiveAssembler::new(config.reassembly_timeout_ms, config.replay_window_ms),
            responses: ResponseQueue::new(config.response_timeout_ms),
            expecting: Vec::new(),
            connection_queue: Vec::new(),
            outcomes: Vec::new(),
            generation: 0,
            // Random start so a restarted node is not taken for a replay.
            unencrypted_sequence: u64::from(rand::random::<u32>()).max(1),
            rx_ring: Queue::new(),
            reported_overflows: 0,
            stats: MeshStats::new(),
            pending_events: Vec::new(),
            radio,
            config,
            callbacks,
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    /// Outcomes of the latest `attempt_transmission`, one per targeted recipient.
    pub fn latest_transmission_outcomes(&self) -> &[TransmissionOutcome] {
        &self.outcomes
    }

    pub fn latest_transmission_successful(&self) -> bool {
        !self.outcomes.is_empty()
            && self
                .outcomes
                .iter()
                .all(|o| o.status == TransmissionStatus::TransmissionComplete)
    }

    pub fn connection_state(&self, peer: &MacAddr) -> ConnectionState {
        self.connections.state(peer, &self.peers)
    }

    pub fn encrypted_connection_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connection_info(&self, peer: &MacAddr, now: Millis) -> Option<ConnectionInfo> {
        self.peers.get(peer).map(|s| ConnectionInfo {
            peer_sta_mac: s.peer_sta_mac(),
            peer_ap_mac: s.peer_ap_mac(),
            temporary: s.is_temporary(),
            remaining_duration_ms: s.remaining_duration(now),
        })
    }

    /// Networks selected by the last scan. Valid until the next scan.
    pub fn connection_queue(&self) -> &[NetworkInfo] {
        &self.connection_queue
    }

    pub fn scheduled_response_count(&self) -> usize {
        self.responses.len()
    }

    pub fn scheduled_response(&self, index: usize) -> Option<&ResponseEntry> {
        self.responses.get(index)
    }

    pub fn clear_scheduled_responses(&mut self) {
        self.responses.clear();
    }

    pub fn delete_scheduled_responses_by_recipient(
        &mut self,
        recipient: &MacAddr,
        encrypted_only: bool,
    ) -> usize {
        self.responses.remove_by_recipient(recipient, encrypted_only)
    }

    /// Scan, run the network filter and replace the connection queue.
    pub fn scan(&mut self, all_channels: bool) {
        let networks = self.radio.scan(all_channels);
        let selected = (self.callbacks.network_filter)(&networks);
        self.connection_queue = selected
            .into_iter()
            .filter_map(|i| networks.get(i).cloned())
            .collect();
        debug!(
            found = networks.len(),
            selected = self.connection_queue.len(),
            "scan complete"
        );
    }

    /// Queue `message` for `recipients`. Outcomes start as `Pending` and are
    /// final once the send queue has finished with each recipient.
    pub fn attempt_transmission(
        &mut self,
        message: &str,
        recipients: Recipients,
        options: TransmissionOptions,
        now: Millis,
    ) -> Result<(), MeshError> {
        self.outcomes.clear();
        self.generation += 1;
        self.expire_sessions(now);
        if options.scan {
            self.scan(options.scan_all_channels);
        }
        let broadcast = recipients == Recipients::Broadcast;
        if broadcast && options.encrypt {
            debug!("broadcasts are never encrypted");
        }
        let encrypt = options.encrypt && !broadcast;
        let frame_type = if broadcast {
            FrameType::Broadcast
        } else {
            FrameType::Unicast
        };
        let fragments = send_queue::fragment_count(
            message.len(),
            wire::max_payload_len(frame_type, encrypt),
        );
        if fragments > usize::from(self.config.max_fragments_per_message) {
            return Err(MeshError::FrameTooLarge);
        }
        let targets: Vec<MacAddr> = match recipients {
            Recipients::Broadcast => vec![BROADCAST_MAC],
            Recipients::Peers(peers) => peers,
            Recipients::ConnectionQueue => self.connection_queue.iter().map(|n| n.bssid).collect(),
        };
        let password = self.config.mesh_password.clone();
        let lifetime = self.config.session_lifetime_ms;
        let duration = Some(lifetime);
        for target in targets {
            let slot = OutcomeSlot {
                generation: self.generation,
                index: self.outcomes.len(),
            };
            self.outcomes.push(TransmissionOutcome {
                recipient: target,
                status: TransmissionStatus::Pending,
            });
            let parked = encrypt && !self.peers.contains(&target);
            if encrypt && !parked {
                self.extend_session(&target, lifetime, now);
            }
            if parked && !self.connections.in_progress(&target, now) {
                if let Err(err) = self.begin_handshake(target, &password, duration, now) {
                    warn!(peer = %target, error = %err, "could not start handshake");
                    self.outcomes[slot.index].status = TransmissionStatus::HandshakeFailed;
                    continue;
                }
            }
            self.send_queue.push(
                Outbound {
                    target,
                    frame_type,
                    kind: EntryKind::Request,
                    body: SendBody::Message(message.as_bytes().to_vec()),
                    encrypted: encrypt,
                    // Bounded by max_fragments_per_message.
                    fragment_count: fragments as u8,
                },
                parked,
                Some(slot),
            );
        }
        Ok(())
    }

    /// Start a handshake with `peer`. An existing session only gets its
    /// duration updated (`None` makes it permanent).
    pub fn request_encrypted_connection(
        &mut self,
        peer: MacAddr,
        password: &str,
        duration_ms: Option<Millis>,
        now: Millis,
    ) -> Result<HandshakeStatus, MeshError> {
        if duration_ms == Some(0) {
            return Err(MeshError::InvalidDuration);
        }
        self.expire_sessions(now);
        if let Some(session) = self.peers.get_mut(&peer) {
            match duration_ms {
                Some(d) => session.set_remaining_duration(d, now),
                None => session.remove_duration(),
            }
            return Ok(HandshakeStatus::AlreadyEstablished);
        }
        if self.connections.in_progress(&peer, now) {
            return Ok(HandshakeStatus::InProgress);
        }
        if self.begin_handshake(peer, password, duration_ms, now)? {
            Ok(HandshakeStatus::Initiated)
        } else {
            Ok(HandshakeStatus::InProgress)
        }
    }

    /// Like [`MeshCore::request_encrypted_connection`] with a temporary
    /// duration, except an existing session is never shortened: a temporary one
    /// keeps the longer of its remaining time and `min_duration_ms`, a permanent
    /// one stays permanent.
    pub fn request_flexible_temporary_encrypted_connection(
        &mut self,
        peer: MacAddr,
        password: &str,
        min_duration_ms: Millis,
        now: Millis,
    ) -> Result<HandshakeStatus, MeshError> {
        if min_duration_ms == 0 {
            return Err(MeshError::InvalidDuration);
        }
        self.expire_sessions(now);
        if self.extend_session(&peer, min_duration_ms, now) {
            return Ok(HandshakeStatus::AlreadyEstablished);
        }
        if self.connections.in_progress(&peer, now) {
            return Ok(HandshakeStatus::InProgress);
        }
        if self.begin_handshake(peer, password, Some(min_duration_ms), now)? {
            Ok(HandshakeStatus::Initiated)
        } else {
            Ok(HandshakeStatus::InProgress)
        }
    }

    /// False if there is no session with `peer`.
    fn extend_session(&mut self, peer: &MacAddr, min_duration_ms: Millis, now: Millis) -> bool {
        match self.peers.get_mut(peer) {
            Some(session) => {
                session.extend_remaining_duration(min_duration_ms, now);
                true
            }
            None => false,
        }
    }

    /// The session with `peer` as JSON, for
    /// [`MeshCore::add_serialized_encrypted_connection`] after a restart.
    pub fn serialize_encrypted_connection(
        &self,
        peer: &MacAddr,
        now: Millis,
    ) -> Result<String, MeshError> {
        let session = self
            .peers
            .get(peer)
            .filter(|s| !s.expired(now))
            .ok_or(MeshError::NotConnected)?;
        Ok(serde_json::to_string(&session.export(now))?)
    }

    /// Restore a session saved by [`MeshCore::serialize_encrypted_connection`].
    /// A session already held with that peer takes over the saved keys, lifetime
    /// and counter. With `ignore_duration` the restored session is permanent.
    pub fn add_serialized_encrypted_connection(
        &mut self,
        serialized: &str,
        ignore_duration: bool,
        now: Millis,
    ) -> Result<(), MeshError> {
        let saved: SerializedConnection = serde_json::from_str(serialized)?;
        let duration_ms = if ignore_duration {
            None
        } else {
            saved.remaining_duration_ms
        };
        if duration_ms == Some(0) {
            return Err(MeshError::InvalidDuration);
        }
        self.expire_sessions(now);
        let peer = saved.peer_sta_mac;
        self.install_session(
            SessionKeys {
                peer_sta_mac: peer,
                peer_ap_mac: saved.peer_ap_mac,
                peer_session_key: saved.peer_session_key,
                own_session_key: saved.own_session_key,
                hash_key: saved.hash_key,
                duration_ms,
            },
            now,
            true,
        )?;
        if let Some(session) = self.peers.get_mut(&peer) {
            session.resume_sequence(saved.next_sequence);
        }
        info!(peer = %peer, "encrypted connection restored");
        self.pending_events.push(MeshEvent::ConnectionEstablished {
            peer,
            temporary: duration_ms.is_some(),
        });
        Ok(())
    }

    /// Install a session whose keys were agreed out of band.
    pub fn add_encrypted_connection(
        &mut self,
        keys: SessionKeys,
        now: Millis,
    ) -> Result<(), MeshError> {
        if keys.duration_ms == Some(0) {
            return Err(MeshError::InvalidDuration);
        }
        let peer = keys.peer_sta_mac;
        let temporary = keys.duration_ms.is_some();
        self.install_session(keys, now, false)?;
        self.pending_events
            .push(MeshEvent::ConnectionEstablished { peer, temporary });
        Ok(())
    }

    /// Tell `peer` the session is over and drop it.
    pub fn remove_encrypted_connection(&mut self, peer: MacAddr, now: Millis) -> RemovalOutcome {
        if self.remove_peer(peer, true, now) {
            RemovalOutcome::Scheduled
        } else {
            RemovalOutcome::NotFound
        }
    }

    /// Drop the session with `peer`, optionally sending an encrypted removal
    /// notice. A session that already expired at `now` is reported as expired
    /// and gets no notice.
    pub fn remove_peer(&mut self, peer: MacAddr, send_removal_notice: bool, now: Millis) -> bool {
        self.expire_sessions(now);
        let Some(mut session) = self.peers.remove(&peer) else {
            return false;
        };
        if send_removal_notice {
            self.queue_removal_notice(&mut session);
        }
        info!(peer = %session.peer_sta_mac(), "encrypted connection removed");
        self.session_removed(
            session,
            RemovalReason::Requested,
            TransmissionStatus::NoSession,
        );
        true
    }

    /// Copy a received frame into the receive ring. Safe to call from the
    /// radio's receive callback: no allocation, no logging. Returns false if
    /// the frame was dropped.
    pub fn on_frame_received(&mut self, sender: MacAddr, bytes: &[u8]) -> bool {
        let Ok(bytes) = heapless::Vec::from_slice(bytes) else {
            return false;
        };
        match self.rx_ring.enqueue(RxFrame { sender, bytes }) {
            Ok(()) => true,
            Err(_) => {
                self.stats.record_ring_overflow();
                false
            }
        }
    }

    /// One engine tick: receive, expire, schedule one response, transmit.
    pub fn perform_maintenance(&mut self, now: Millis) -> Vec<MeshEvent> {
        self.drain_rx(now);
        self.collect_garbage(now);
        self.schedule_response(now);
        self.service_send_queue(now);
        mem::take(&mut self.pending_events)
    }

    fn next_unencrypted_id(&mut self) -> MessageId {
        let id = MessageId::new(self.unencrypted_sequence, 0, false);
        self.unencrypted_sequence = if self.unencrypted_sequence >= MAX_SEQUENCE {
            1
        } else {
            self.unencrypted_sequence + 1
        };
        id
    }

    fn begin_handshake(
        &mut self,
        target: MacAddr,
        password: &str,
        duration_ms: Option<Millis>,
        now: Millis,
    ) -> Result<bool, MeshError> {
        let own_ap = self.radio.ap_mac();
        match self
            .connections
            .begin(target, own_ap, password, duration_ms, now)?
        {
            Some(msg) => {
                debug!(peer = %target, request_id = msg.request_id(), "handshake started");
                self.queue_handshake(target, &msg)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn queue_handshake(&mut self, target: MacAddr, msg: &HandshakeMessage) -> Result<(), MeshError> {
        let body = msg.encode()?;
        let frame_type = msg.frame_type();
        let fragments =
            send_queue::fragment_count(body.len(), wire::max_payload_len(frame_type, false));
        let fragment_count = u8::try_from(fragments).map_err(|_| MeshError::FrameTooLarge)?;
        trace!(peer = %target, ?frame_type, "queueing handshake frame");
        self.send_queue.push(
            Outbound {
                target,
                frame_type,
                kind: EntryKind::Handshake,
                body: SendBody::Message(body),
                encrypted: false,
                fragment_count,
            },
            false,
            None,
        );
        Ok(())
    }

    fn queue_removal_notice(&mut self, session: &mut EncryptedConnectionData) {
        let peer = session.peer_sta_mac();
        match removal_notice_frame(session) {
            Ok(frame) => {
                self.connections.mark_removal_pending(peer);
                self.send_queue.push(
                    Outbound {
                        target: peer,
                        frame_type: FrameType::EncryptedConnectionRemovalRequest,
                        kind: EntryKind::RemovalNotice,
                        body: SendBody::Encoded(frame),
                        // Already encrypted; must outlive the session.
                        encrypted: false,
                        fragment_count: 1,
                    },
                    false,
                    None,
                );
            }
            Err(err) => warn!(peer = %peer, error = %err, "could not build removal notice"),
        }
    }

    fn report(&mut self, entry: &SendEntry, status: TransmissionStatus) {
        let Some(slot) = entry.outcome else {
            return;
        };
        if slot.generation == self.generation {
            if let Some(outcome) = self.outcomes.get_mut(slot.index) {
                outcome.status = status;
            }
        }
        self.pending_events.push(MeshEvent::TransmissionFinished {
            recipient: entry.target,
            status,
        });
    }

    fn install_session(
        &mut self,
        keys: SessionKeys,
        now: Millis,
        rekey_existing: bool,
    ) -> Result<(), MeshError> {
        let session = match keys.duration_ms {
            Some(duration) => EncryptedConnectionData::temporary(
                keys.peer_sta_mac,
                keys.peer_ap_mac,
                keys.peer_session_key,
                keys.own_session_key,
                keys.hash_key,
                duration,
                now,
            ),
            None => EncryptedConnectionData::new(
                keys.peer_sta_mac,
                keys.peer_ap_mac,
                keys.peer_session_key,
                keys.own_session_key,
                keys.hash_key,
            ),
        };
        match self.peers.add(session.clone(), now) {
            Ok(()) => Ok(()),
            Err(PeerTableError::DuplicatePeer) => {
                if rekey_existing {
                    self.rekey_session(&keys);
                }
                Ok(())
            }
            Err(PeerTableError::PeerTableFull) => {
                let Some(mut evicted) = self.peers.evict_least_recently_used_temporary() else {
                    return Err(MeshError::NoPeerSlot);
                };
                info!(peer = %evicted.peer_sta_mac(), "evicting least recently used session");
                self.queue_removal_notice(&mut evicted);
                self.session_removed(
                    evicted,
                    RemovalReason::Evicted,
                    TransmissionStatus::RecipientUnreachable,
                );
                self.peers.add(session, now)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn rekey_session(&mut self, keys: &SessionKeys) {
        let Some(existing) = self.peers.get_mut(&keys.peer_sta_mac) else {
            return;
        };
        if existing.peer_session_key() == keys.peer_session_key
            && existing.own_session_key() == keys.own_session_key
            && existing.hash_key() == &keys.hash_key
        {
            return;
        }
        let old_key = existing.peer_session_key();
        existing.rekey(
            keys.peer_ap_mac,
            keys.peer_session_key,
            keys.own_session_key,
            keys.hash_key,
        );
        self.assembler.forget_session(old_key);
        self.send_queue
            .restart_encrypted(&[keys.peer_sta_mac, keys.peer_ap_mac]);
        debug!(peer = %keys.peer_sta_mac, "session re-keyed");
    }

    /// Clean up after a session left the table.
    fn session_removed(
        &mut self,
        session: EncryptedConnectionData,
        reason: RemovalReason,
        status: TransmissionStatus,
    ) {
        let (sta, ap) = (session.peer_sta_mac(), session.peer_ap_mac());
        self.assembler.forget_session(session.peer_session_key());
        let cancelled = self
            .send_queue
            .take_where(|e| e.encrypted && (e.target == sta || e.target == ap));
        for entry in &cancelled {
            self.report(entry, status);
        }
        self.responses.remove_by_recipient(&sta, true);
        self.responses.remove_by_recipient(&ap, true);
        self.expecting.retain(|x| {
            !(x.request_id.is_encrypted() && (x.target == sta || x.target == ap))
        });
        self.pending_events
            .push(MeshEvent::ConnectionRemoved { peer: sta, reason });
    }

    fn expire_sessions(&mut self, now: Millis) {
        for session in self.peers.expire(now) {
            info!(peer = %session.peer_sta_mac(), "encrypted connection expired");
            self.session_removed(
                session,
                RemovalReason::Expired,
                TransmissionStatus::NoSession,
            );
        }
    }

    fn session_established(&mut self, target: MacAddr, keys: &SessionKeys) {
        // A crossing handshake of our own is now moot.
        self.connections.abort(&keys.peer_sta_mac);
        self.connections.abort(&keys.peer_ap_mac);
        let mut released = self.send_queue.release_parked(&target);
        for mac in [keys.peer_sta_mac, keys.peer_ap_mac] {
            if mac != target {
                released += self.send_queue.release_parked(&mac);
            }
        }
        let temporary = keys.duration_ms.is_some();
        info!(peer = %keys.peer_sta_mac, temporary, released, "encrypted connection established");
        self.pending_events.push(MeshEvent::ConnectionEstablished {
            peer: keys.peer_sta_mac,
            temporary,
        });
    }

    fn handshake_failed(&mut self, target: MacAddr, reason: HandshakeFailure) {
        let status = if reason == HandshakeFailure::NoPeerSlot {
            TransmissionStatus::NoPeerSlot
        } else {
            TransmissionStatus::HandshakeFailed
        };
        let parked = self
            .send_queue
            .take_where(|e| e.session_pending && e.target == target);
        for entry in &parked {
            self.report(entry, status);
        }
        warn!(peer = %target, ?reason, "handshake failed");
        self.pending_events
            .push(MeshEvent::HandshakeFailed { peer: target, reason });
    }

    /// A handshake `peer` started with us stopped running. Entries parked on it
    /// fail unless a handshake of our own is still under way.
    fn incoming_handshake_stalled(&mut self, peer: MacAddr, reason: HandshakeFailure, now: Millis) {
        if !self.connections.in_progress(&peer, now) && self.send_queue.has_parked_for(&peer) {
            self.handshake_failed(peer, reason);
        }
    }

    // --- transmit path ---

    fn service_send_queue(&mut self, now: Millis) {
        let mut budget = self
            .send_queue
            .iter()
            .map(|e| usize::from(e.fragment_count))
            .sum::<usize>()
            + self.send_queue.len();
        while budget > 0 {
            budget -= 1;
            let peers = &self.peers;
            let Some(index) = self
                .send_queue
                .next_eligible(now, |e| ordering_peer(peers, e))
            else {
                break;
            };
            self.transmit(index, now);
        }
    }

    /// Encode the current fragment of entry `index`. `None` if its session is gone.
    fn prepare_frame(&mut self, index: usize) -> Result<Option<Vec<u8>>, MeshError> {
        let Some(entry) = self.send_queue.get(index) else {
            return Ok(None);
        };
        if let SendBody::Encoded(frame) = &entry.body {
            return Ok(Some(frame.clone()));
        }
        let (target, frame_type, encrypted) = (entry.target, entry.frame_type, entry.encrypted);
        let base = match entry.message_id {
            Some(id) => id,
            None => {
                let id = if encrypted {
                    match self.peers.get_mut(&target) {
                        Some(session) => session.next_message_id(),
                        None => return Ok(None),
                    }
                } else {
                    self.next_unencrypted_id()
                };
                if let Some(e) = self.send_queue.get_mut(index) {
                    e.message_id = Some(id);
                }
                id
            }
        };
        let Some(entry) = self.send_queue.get(index) else {
            return Ok(None);
        };
        let fragment = entry.next_fragment;
        let chunk = entry
            .fragment(fragment, wire::max_payload_len(frame_type, encrypted))
            .to_vec();
        let header = FrameHeader {
            frame_type,
            fragments_remaining: entry.fragment_count.saturating_sub(fragment + 1),
            destination: frame_type.has_destination().then_some(target),
            message_id: base.with_fragment(fragment),
            session_tag: None,
        };
        if !encrypted {
            return Ok(Some(wire::encode_frame(&Frame {
                header,
                payload: chunk,
                auth_tag: None,
            })?));
        }
        let Some(session) = self.peers.get(&target) else {
            return Ok(None);
        };
        let header = FrameHeader {
            session_tag: Some(session.own_session_key()),
            ..header
        };
        let (payload, tag) = crypto::encrypt(
            session.own_session_key(),
            session.hash_key(),
            &header.to_bytes(chunk.len() as u8),
            &chunk,
        )?;
        Ok(Some(wire::encode_frame(&Frame {
            header,
            payload,
            auth_tag: Some(tag),
        })?))
    }

    fn transmit(&mut self, index: usize, now: Millis) {
        let frame = match self.prepare_frame(index) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                if let Some(e) = self.send_queue.remove(index) {
                    debug!(peer = %e.target, "no session for encrypted entry");
                    self.report(&e, TransmissionStatus::NoSession);
                }
                return;
            }
            Err(err) => {
                if let Some(e) = self.send_queue.remove(index) {
                    warn!(peer = %e.target, error = %err, "dropping entry that cannot be framed");
                    self.report(&e, TransmissionStatus::FrameTooLarge);
                }
                return;
            }
        };
        let Some(target) = self.send_queue.get(index).map(|e| e.target) else {
            return;
        };
        self.send_queue.mark_attempt(index, now);
        let result = self.radio.send(target, &frame);
        self.stats.record_send(result.is_success());
        match result {
            SendResult::Delivered | SendResult::BroadcastSent => {
                if let Some(done) = self.send_queue.fragment_delivered(index) {
                    self.entry_sent(done, now);
                }
            }
            SendResult::NoAck => match self.send_queue.retry_later(index, now, true) {
                RetryDecision::Requeued => {
                    debug!(peer = %target, "no ack, retransmitting after backoff")
                }
                RetryDecision::Exhausted(e) => self.entry_exhausted(e, now),
            },
            SendResult::RadioBusy => {
                trace!(peer = %target, "radio busy");
                self.send_queue.retry_later(index, now, false);
            }
        }
    }

    fn entry_sent(&mut self, entry: SendEntry, now: Millis) {
        match entry.kind {
            EntryKind::Request => {
                if let Some(request_id) = entry.message_id {
                    let lifetime = if entry.target.is_broadcast() {
                        self.config.broadcast_response_timeout_ms
                    } else {
                        self.config.sent_request_lifetime_ms
                    };
                    self.expecting.push(ExpectedResponse {
                        request_id,
                        target: entry.target,
                        tracker: ExpiringTimeTracker::new(lifetime, now),
                    });
                }
            }
            EntryKind::RemovalNotice => {
                self.connections.finish_removal(&entry.target);
            }
            EntryKind::Response | EntryKind::Handshake => {}
        }
        trace!(peer = %entry.target, kind = ?entry.kind, "sent");
        self.report(&entry, TransmissionStatus::TransmissionComplete);
    }

    fn entry_exhausted(&mut self, entry: SendEntry, now: Millis) {
        warn!(peer = %entry.target, kind = ?entry.kind, "recipient unreachable");
        match entry.kind {
            EntryKind::Handshake
                if matches!(
                    entry.frame_type,
                    FrameType::EncryptedConnectionRequest | FrameType::SynchronizationConfirmation
                ) =>
            {
                if let Some(target) = self.connections.abort(&entry.target) {
                    self.handshake_failed(target, HandshakeFailure::TransmissionFailed);
                }
            }
            EntryKind::Handshake if entry.frame_type == FrameType::SynchronizationRequest => {
                if self.connections.stall_incoming(&entry.target).is_some() {
                    self.incoming_handshake_stalled(
                        entry.target,
                        HandshakeFailure::TransmissionFailed,
                        now,
                    );
                }
            }
            EntryKind::RemovalNotice => {
                self.connections.finish_removal(&entry.target);
            }
            _ => {}
        }
        self.report(&entry, TransmissionStatus::RecipientUnreachable);
    }

    // --- receive path ---

    fn drain_rx(&mut self, now: Millis) {
        let overflows = self.stats.ring_overflows();
        if overflows != self.reported_overflows {
            warn!(
                dropped = overflows - self.reported_overflows,
                "receive ring overflowed"
            );
            self.reported_overflows = overflows;
        }
        while let Some(rx) = self.rx_ring.dequeue() {
            self.handle_frame(rx.sender, &rx.bytes, now);
        }
    }

    fn handle_frame(&mut self, sender: MacAddr, bytes: &[u8], now: Millis) {
        let frame = match wire::decode_frame(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(peer = %sender, error = %err, "dropping undecodable frame");
                return;
            }
        };
        if let Some(destination) = frame.header.destination {
            if destination != self.radio.station_mac() && destination != self.radio.ap_mac() {
                trace!(peer = %sender, "frame for another node");
                return;
            }
        }
        let header = frame.header;
        let (payload, stream) = match (header.session_tag, frame.auth_tag) {
            (Some(tag), Some(auth)) => {
                let Some(session) = self.peers.lookup_by_session_key(tag) else {
                    debug!(peer = %sender, "encrypted frame for unknown session");
                    return;
                };
                if !session.connected_to(&sender) {
                    debug!(peer = %sender, "session tag from wrong sender");
                    return;
                }
                let header_bytes = header.to_bytes(frame.payload.len() as u8);
                match crypto::decrypt(tag, session.hash_key(), &header_bytes, &frame.payload, &auth) {
                    Ok(plain) => {
                        self.peers.touch(&sender);
                        (plain, ReplayStream::Session(tag))
                    }
                    Err(_) => {
                        self.stats.record_auth_failure(sender);
                        warn!(peer = %sender, "frame authentication failed");
                        return;
                    }
                }
            }
            _ if header.frame_type == FrameType::Broadcast => (frame.payload, ReplayStream::Broadcast),
            _ => {
                let destination = header.destination.unwrap_or(self.radio.station_mac());
                (frame.payload, ReplayStream::Directed(destination))
            }
        };
        let fragment = ReceivedFragment {
            sender,
            frame_type: header.frame_type,
            message_id: header.message_id,
            fragments_remaining: header.fragments_remaining,
            payload,
        };
        match self.assembler.accept(fragment, stream, now) {
            AssemblyResult::Complete(msg) => self.dispatch(msg, now),
            AssemblyResult::InProgress => {}
            AssemblyResult::Duplicate => {
                trace!(peer = %sender, id = %header.message_id, "duplicate dropped")
            }
            AssemblyResult::Rejected => {
                debug!(peer = %sender, id = %header.message_id, "inconsistent fragment dropped")
            }
        }
    }

    fn dispatch(&mut self, msg: AssembledMessage, now: Millis) {
        match msg.frame_type {
            FrameType::Broadcast | FrameType::Unicast => self.handle_request(msg, now),
            FrameType::Response => self.handle_response(msg),
            FrameType::EncryptedConnectionRemovalRequest => self.handle_removal_request(msg),
            FrameType::SynchronizationRequest
            | FrameType::SynchronizationConfirmation
            | FrameType::EncryptedConnectionRequest
            | FrameType::Ack => self.handle_handshake(msg, now),
        }
    }

    fn handle_request(&mut self, msg: AssembledMessage, now: Millis) {
        let encrypted = msg.is_encrypted();
        if msg.frame_type == FrameType::Unicast
            && !encrypted
            && !self.config.accepts_unencrypted_requests
        {
            debug!(peer = %msg.sender, "unencrypted request refused");
            return;
        }
        let text = String::from_utf8_lossy(&msg.body);
        let ctx = MessageContext {
            sender: msg.sender,
            message_id: msg.message_id,
            encrypted,
            broadcast: msg.frame_type == FrameType::Broadcast,
        };
        let reply = (self.callbacks.request_handler)(&text, &ctx);
        if !reply.is_empty() {
            self.responses.push(ResponseEntry::new(
                msg.sender,
                reply,
                msg.message_id,
                encrypted,
                now,
            ));
        }
    }

    fn expected_position(&self, sender: &MacAddr, request_id: MessageId) -> Option<usize> {
        self.expecting.iter().position(|x| {
            x.request_id == request_id
                && (x.target.is_broadcast()
                    || x.target == *sender
                    // Unencrypted IDs come from one node-wide counter.
                    || !request_id.is_encrypted()
                    || self
                        .peers
                        .get(&x.target)
                        .map(|s| s.connected_to(sender))
                        .unwrap_or(false))
        })
    }

    fn handle_response(&mut self, msg: AssembledMessage) {
        let Some((request_id, reply)) = parse_response_body(&msg.body) else {
            debug!(peer = %msg.sender, "malformed response");
            return;
        };
        if request_id.is_encrypted() && !msg.is_encrypted() {
            debug!(peer = %msg.sender, "unencrypted response to encrypted request");
            return;
        }
        let Some(pos) = self.expected_position(&msg.sender, request_id) else {
            debug!(peer = %msg.sender, request_id = %request_id, "unexpected response");
            return;
        };
        if !self.expecting[pos].target.is_broadcast() {
            self.expecting.remove(pos);
        }
        let ctx = MessageContext {
            sender: msg.sender,
            message_id: msg.message_id,
            encrypted: msg.is_encrypted(),
            broadcast: false,
        };
        (self.callbacks.response_handler)(&reply, &ctx);
    }

    fn handle_removal_request(&mut self, msg: AssembledMessage) {
        if !msg.is_encrypted() {
            debug!(peer = %msg.sender, "unencrypted removal request ignored");
            return;
        }
        if !matches!(
            HandshakeMessage::decode(&msg.body),
            Ok(HandshakeMessage::RemovalRequest { .. })
        ) {
            debug!(peer = %msg.sender, "malformed removal request");
            return;
        }
        if let Some(session) = self.peers.remove(&msg.sender) {
            info!(peer = %msg.sender, "peer removed encrypted connection");
            self.session_removed(
                session,
                RemovalReason::PeerRequested,
                TransmissionStatus::NoSession,
            );
        }
    }

    fn handle_handshake(&mut self, msg: AssembledMessage, now: Millis) {
        let sender = msg.sender;
        let hs = match HandshakeMessage::decode(&msg.body) {
            Ok(hs) if hs.frame_type() == msg.frame_type => hs,
            Ok(_) => {
                debug!(peer = %sender, "handshake payload does not match frame type");
                return;
            }
            Err(err) => {
                debug!(peer = %sender, error = %err, "malformed handshake payload");
                return;
            }
        };
        let result = match &hs {
            HandshakeMessage::ConnectionRequest { ap_mac, .. } => {
                let crossing = self
                    .connections
                    .outgoing_target(&sender)
                    .or_else(|| self.connections.outgoing_target(ap_mac));
                let local = LocalIdentity {
                    sta_mac: self.radio.station_mac(),
                    ap_mac: self.radio.ap_mac(),
                    password: &self.config.mesh_password,
                };
                let result = self.connections.on_connection_request(
                    sender,
                    &hs,
                    msg.is_encrypted(),
                    &local,
                    &self.peers,
                    now,
                );
                if let Some(target) = crossing {
                    if !self.connections.is_initiating(&target) {
                        debug!(peer = %sender, "crossing handshake, answering theirs");
                        self.send_queue.take_where(|e| {
                            e.target == target
                                && e.frame_type == FrameType::EncryptedConnectionRequest
                                && !e.started()
                        });
                    }
                }
                result
            }
            HandshakeMessage::SynchronizationRequest { .. } => self
                .connections
                .on_synchronization_request(sender, &hs, &self.peers, now),
            HandshakeMessage::SynchronizationConfirmation { .. } => {
                self.connections.on_confirmation(sender, &hs, &self.peers)
            }
            HandshakeMessage::ConfirmationAck { .. } | HandshakeMessage::Refused { .. } => {
                self.connections.on_ack(sender, &hs)
            }
            HandshakeMessage::RemovalRequest { .. } => Ok(HandshakeReply::Ignore),
        };
        match result {
            Err(err) => {
                self.stats.record_auth_failure(sender);
                warn!(peer = %sender, error = %err, "handshake frame rejected");
                if !matches!(hs, HandshakeMessage::ConnectionRequest { .. }) {
                    if let Some(target) = self.connections.abort_request(hs.request_id()) {
                        self.handshake_failed(target, HandshakeFailure::AuthenticationFailed);
                    }
                }
            }
            Ok(HandshakeReply::Send(reply)) => {
                if let Err(err) = self.queue_handshake(sender, &reply) {
                    warn!(peer = %sender, error = %err, "could not queue handshake reply");
                }
            }
            Ok(HandshakeReply::InstallAndSend(keys, ack)) => {
                let reply = match self.install_session(keys.clone(), now, true) {
                    Ok(()) => {
                        self.session_established(sender, &keys);
                        Ok(ack)
                    }
                    Err(err) => {
                        warn!(peer = %sender, error = %err, "refusing handshake");
                        handshake::refusal(&self.config.mesh_password, hs.request_id())
                    }
                };
                match reply {
                    Ok(reply) => {
                        if let Err(err) = self.queue_handshake(sender, &reply) {
                            warn!(peer = %sender, error = %err, "could not queue handshake reply");
                        }
                    }
                    Err(err) => warn!(peer = %sender, error = %err, "could not build refusal"),
                }
            }
            Ok(HandshakeReply::Install(target, keys)) => {
                match self.install_session(keys.clone(), now, true) {
                    Ok(()) => self.session_established(target, &keys),
                    Err(err) => {
                        warn!(peer = %sender, error = %err, "could not install session");
                        self.handshake_failed(target, HandshakeFailure::NoPeerSlot);
                    }
                }
            }
            Ok(HandshakeReply::Failed(target, reason)) => self.handshake_failed(target, reason),
            Ok(HandshakeReply::Ignore) => {
                trace!(peer = %sender, request_id = hs.request_id(), "handshake frame ignored")
            }
        }
    }

    // --- maintenance ---

    fn collect_garbage(&mut self, now: Millis) {
        self.expire_sessions(now);
        let expired = self.connections.expire(now);
        for target in expired.outgoing {
            self.handshake_failed(target, HandshakeFailure::Timeout);
        }
        for entry in expired.incoming {
            let peer = entry.pending.peer_sta_mac;
            debug!(peer = %peer, request_id = entry.request_id, "peer request timed out");
            self.incoming_handshake_stalled(peer, HandshakeFailure::Timeout, now);
        }
        let dropped = self.assembler.expire(now);
        if dropped > 0 {
            debug!(dropped, "incomplete messages timed out");
        }
        for r in self.responses.expire(now) {
            warn!(peer = %r.recipient, request_id = %r.request_id, "response timed out");
        }
        self.expecting.retain(|x| !x.tracker.expired(now));
    }

    /// Move the oldest pending response to the send queue.
    fn schedule_response(&mut self, now: Millis) {
        let (ready, expired) = self.responses.pop_ready(now);
        for r in expired {
            warn!(peer = %r.recipient, request_id = %r.request_id, "response timed out");
        }
        let Some(response) = ready else {
            return;
        };
        if response.encrypted && !self.peers.contains(&response.recipient) {
            debug!(peer = %response.recipient, "no session for encrypted response");
            return;
        }
        let body = response.to_body();
        let fragments = send_queue::fragment_count(
            body.len(),
            wire::max_payload_len(FrameType::Response, response.encrypted),
        );
        if fragments > usize::from(self.config.max_fragments_per_message) {
            warn!(peer = %response.recipient, "response too large, dropped");
            return;
        }
        self.send_queue.push(
            Outbound {
                target: response.recipient,
                frame_type: FrameType::Response,
                kind: EntryKind::Response,
                body: SendBody::Message(body),
                encrypted: response.encrypted,
                fragment_count: fragments as u8,
            },
            false,
            None,
        );
    }
}

impl<R: Radio> ApRole for MeshCore<R> {
    fn activate_ap_hook(&mut self) -> Result<(), RadioError> {
        let ssid = self.config.ssid();
        self.radio.start_access_point(
            &ssid,
            &self.config.mesh_password,
            self.config.wifi_channel,
        )
    }

    fn deactivate_ap_hook(&mut self) {
        self.radio.stop_access_point();
    }

    fn retune_ap(&mut self, channel: u8) {
        self.config.wifi_channel = channel;
        self.radio.set_ap_channel(channel);
    }
}

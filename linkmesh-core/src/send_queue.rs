//! Send queue: outbound messages with per-recipient ordering, retransmission and backoff.
//!
//! Dequeue discipline: at most one message in flight per target (broadcasts share
//! the broadcast sentinel as target, so they are serialized globally); among
//! messages not yet started, handshake frames go before data frames.

use std::collections::VecDeque;

use crate::protocol::{FrameType, MacAddr, MessageId};
use crate::time::{ExpiringTimeTracker, Millis, TimeTracker};

/// Send attempts per fragment before the entry fails.
pub const DEFAULT_TRANSMISSIONS_PER_FRAME: u8 = 3;
/// Delay before a fragment is retried.
pub const DEFAULT_BACKOFF_MS: Millis = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Application message (broadcast or unicast request).
    Request,
    /// Reply to a received request.
    Response,
    Handshake,
    RemovalNotice,
}

/// Where the final status of an entry is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeSlot {
    /// Transmission attempt the entry belongs to.
    pub generation: u64,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub enum SendBody {
    /// Whole message; fragmented when transmitted.
    Message(Vec<u8>),
    /// A single frame encoded ahead of time.
    Encoded(Vec<u8>),
}

/// What the caller wants sent.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub target: MacAddr,
    pub frame_type: FrameType,
    pub kind: EntryKind,
    pub body: SendBody,
    pub encrypted: bool,
    pub fragment_count: u8,
}

#[derive(Debug, Clone)]
pub struct SendEntry {
    /// Admission order.
    pub id: u64,
    pub target: MacAddr,
    pub frame_type: FrameType,
    pub kind: EntryKind,
    pub body: SendBody,
    pub encrypted: bool,
    pub transmissions_remaining: u8,
    pub next_fragment: u8,
    pub fragment_count: u8,
    /// Assigned on the first send attempt so IDs follow transmission order.
    pub message_id: Option<MessageId>,
    pub last_send: Option<TimeTracker>,
    /// Waiting for a session handshake with `target`.
    pub session_pending: bool,
    pub outcome: Option<OutcomeSlot>,
    backoff: Option<ExpiringTimeTracker>,
}

impl SendEntry {
    /// At least one frame of this entry went to the radio.
    pub fn started(&self) -> bool {
        self.last_send.is_some()
    }

    pub fn ready(&self, now: Millis) -> bool {
        self.backoff.map(|b| b.expired(now)).unwrap_or(true)
    }

    pub fn is_finished(&self) -> bool {
        self.next_fragment >= self.fragment_count
    }

    /// Bytes of fragment `index` when the message is split into `max_payload` chunks.
    pub fn fragment(&self, index: u8, max_payload: usize) -> &[u8] {
        match &self.body {
            SendBody::Message(bytes) => {
                let start = (usize::from(index) * max_payload).min(bytes.len());
                let end = (start + max_payload).min(bytes.len());
                &bytes[start..end]
            }
            SendBody::Encoded(frame) => frame,
        }
    }
}

/// Number of fragments needed for `len` bytes (at least one, so empty messages still go out).
pub fn fragment_count(len: usize, max_payload: usize) -> usize {
    if len == 0 || max_payload == 0 {
        1
    } else {
        len.div_ceil(max_payload)
    }
}

/// Result of a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Moved to the tail with a backoff.
    Requeued,
    /// Budget exhausted; the entry left the queue.
    Exhausted(SendEntry),
}

pub struct SendQueue {
    entries: VecDeque<SendEntry>,
    next_id: u64,
    transmissions_per_frame: u8,
    backoff: Millis,
}

impl SendQueue {
    pub fn new(transmissions_per_frame: u8, backoff: Millis) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 0,
            transmissions_per_frame: transmissions_per_frame.max(1),
            backoff,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(
        &mut self,
        outbound: Outbound,
        session_pending: bool,
        outcome: Option<OutcomeSlot>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(SendEntry {
            id,
            target: outbound.target,
            frame_type: outbound.frame_type,
            kind: outbound.kind,
            body: outbound.body,
            encrypted: outbound.encrypted,
            transmissions_remaining: self.transmissions_per_frame,
            next_fragment: 0,
            fragment_count: outbound.fragment_count.max(1),
            message_id: None,
            last_send: None,
            session_pending,
            outcome,
            backoff: None,
        });
        id
    }

    pub fn get(&self, index: usize) -> Option<&SendEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut SendEntry> {
        self.entries.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SendEntry> {
        self.entries.iter()
    }

    /// Index of the next entry allowed to transmit at `now`. `peer_of` names the
    /// peer an entry counts against; each peer has at most one message in flight.
    pub fn next_eligible<F>(&self, now: Millis, peer_of: F) -> Option<usize>
    where
        F: Fn(&SendEntry) -> MacAddr,
    {
        for handshake_pass in [true, false] {
            for (i, e) in self.entries.iter().enumerate() {
                if (e.kind == EntryKind::Handshake) != handshake_pass {
                    continue;
                }
                if e.session_pending || !e.ready(now) || self.blocked(i, &peer_of) {
                    continue;
                }
                return Some(i);
            }
        }
        None
    }

    fn blocked<F>(&self, index: usize, peer_of: &F) -> bool
    where
        F: Fn(&SendEntry) -> MacAddr,
    {
        let e = &self.entries[index];
        let peer = peer_of(e);
        self.entries.iter().enumerate().any(|(j, o)| {
            if j == index || peer_of(o) != peer {
                return false;
            }
            if o.started() {
                return true;
            }
            if e.started() {
                return false;
            }
            match (e.kind == EntryKind::Handshake, o.kind == EntryKind::Handshake) {
                (true, true) => o.id < e.id,
                (true, false) => false,
                (false, true) => true,
                (false, false) => o.id < e.id,
            }
        })
    }

    /// Record a send attempt of the current fragment.
    pub fn mark_attempt(&mut self, index: usize, now: Millis) {
        if let Some(e) = self.entries.get_mut(index) {
            e.last_send = Some(TimeTracker::new(now));
            e.backoff = None;
        }
    }

    /// Current fragment reached the radio. Returns the entry once its last fragment is out.
    pub fn fragment_delivered(&mut self, index: usize) -> Option<SendEntry> {
        let e = self.entries.get_mut(index)?;
        e.next_fragment = e.next_fragment.saturating_add(1);
        e.transmissions_remaining = self.transmissions_per_frame;
        if e.is_finished() {
            self.entries.remove(index)
        } else {
            None
        }
    }

    /// Retry the current fragment after the backoff. `count_attempt` is false for a busy radio.
    pub fn retry_later(&mut self, index: usize, now: Millis, count_attempt: bool) -> RetryDecision {
        let Some(mut e) = self.entries.remove(index) else {
            return RetryDecision::Requeued;
        };
        if count_attempt {
            e.transmissions_remaining = e.transmissions_remaining.saturating_sub(1);
            if e.transmissions_remaining == 0 {
                return RetryDecision::Exhausted(e);
            }
        }
        e.backoff = Some(ExpiringTimeTracker::new(self.backoff, now));
        self.entries.push_back(e);
        RetryDecision::Requeued
    }

    pub fn remove(&mut self, index: usize) -> Option<SendEntry> {
        self.entries.remove(index)
    }

    /// Remove and return all entries matching `pred`, in queue order.
    pub fn take_where<F>(&mut self, mut pred: F) -> Vec<SendEntry>
    where
        F: FnMut(&SendEntry) -> bool,
    {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for e in self.entries.drain(..) {
            if pred(&e) {
                taken.push(e);
            } else {
                kept.push_back(e);
            }
        }
        self.entries = kept;
        taken
    }

    /// Clear the session-pending marker of every entry for `peer`.
    pub fn release_parked(&mut self, peer: &MacAddr) -> usize {
        let mut n = 0;
        for e in self.entries.iter_mut() {
            if e.session_pending && e.target == *peer {
                e.session_pending = false;
                n += 1;
            }
        }
        n
    }

    /// Restart encrypted entries for `targets` from their first fragment with a
    /// fresh message ID, after the session with that peer was re-keyed.
    pub fn restart_encrypted(&mut self, targets: &[MacAddr]) {
        for e in self
            .entries
            .iter_mut()
            .filter(|e| e.encrypted && targets.contains(&e.target))
        {
            e.message_id = None;
            e.next_fragment = 0;
        }
    }

    pub fn has_parked_for(&self, peer: &MacAddr) -> bool {
        self.entries
            .iter()
            .any(|e| e.session_pending && e.target == *peer)
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSMISSIONS_PER_FRAME, DEFAULT_BACKOFF_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BROADCAST_MAC;

    fn mac(b: u8) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, b])
    }

    fn data(target: MacAddr, fragments: u8) -> Outbound {
        Outbound {
            target,
            frame_type: FrameType::Unicast,
            kind: EntryKind::Request,
            body: SendBody::Message(vec![0; 10]),
            encrypted: false,
            fragment_count: fragments,
        }
    }

    fn next(q: &SendQueue, now: Millis) -> Option<usize> {
        q.next_eligible(now, |e| e.target)
    }

    fn handshake(target: MacAddr) -> Outbound {
        Outbound {
            target,
            frame_type: FrameType::EncryptedConnectionRequest,
            kind: EntryKind::Handshake,
            body: SendBody::Message(vec![1; 4]),
            encrypted: false,
            fragment_count: 1,
        }
    }

    #[test]
    fn fragments_split() {
        assert_eq!(fragment_count(0, 233), 1);
        assert_eq!(fragment_count(233, 233), 1);
        assert_eq!(fragment_count(234, 233), 2);
        let mut q = SendQueue::default();
        q.push(
            Outbound {
                body: SendBody::Message((0..10).collect()),
                ..data(mac(1), 3)
            },
            false,
            None,
        );
        let e = q.get(0).unwrap();
        assert_eq!(e.fragment(0, 4), &[0, 1, 2, 3]);
        assert_eq!(e.fragment(2, 4), &[8, 9]);
    }

    #[test]
    fn handshake_goes_first() {
        let mut q = SendQueue::default();
        q.push(data(mac(1), 1), false, None);
        q.push(handshake(mac(2)), false, None);
        assert_eq!(next(&q, 0), Some(1));
    }

    #[test]
    fn one_in_flight_per_peer() {
        let mut q = SendQueue::default();
        q.push(data(mac(1), 2), false, None);
        q.push(data(mac(1), 1), false, None);
        q.push(data(mac(2), 1), false, None);
        assert_eq!(next(&q, 0), Some(0));
        q.mark_attempt(0, 0);
        assert!(q.fragment_delivered(0).is_none());
        // First message half sent: the second to the same peer waits, handshake too.
        q.push(handshake(mac(1)), false, None);
        assert_eq!(next(&q, 0), Some(0));
        q.mark_attempt(0, 0);
        assert!(q.fragment_delivered(0).is_some());
        // Handshake now beats the older data entry for the same peer.
        assert_eq!(q.get(next(&q, 0).unwrap()).unwrap().kind, EntryKind::Handshake);
    }

    #[test]
    fn addresses_of_one_peer_share_a_slot() {
        let mut q = SendQueue::default();
        q.push(data(mac(3), 2), false, None);
        q.push(data(mac(1), 1), false, None);
        let same_peer = |e: &SendEntry| if e.target == mac(3) { mac(1) } else { e.target };
        assert_eq!(q.next_eligible(0, same_peer), Some(0));
        q.mark_attempt(0, 0);
        assert!(q.fragment_delivered(0).is_none());
        assert_eq!(q.next_eligible(0, same_peer), Some(0));
        // Second fragment unacked: the entry backs off and moves to the back.
        assert!(matches!(q.retry_later(0, 0, true), RetryDecision::Requeued));
        assert_eq!(q.next_eligible(0, same_peer), None);
        // Keyed by raw address the other message would overtake it.
        assert_eq!(next(&q, 0), Some(0));
        assert_eq!(q.get(0).unwrap().target, mac(1));
    }

    #[test]
    fn broadcasts_are_serialized() {
        let mut q = SendQueue::default();
        q.push(data(BROADCAST_MAC, 2), false, None);
        q.push(data(BROADCAST_MAC, 1), false, None);
        q.mark_attempt(0, 0);
        q.fragment_delivered(0);
        assert_eq!(next(&q, 0), Some(0));
        assert_eq!(q.get(0).unwrap().next_fragment, 1);
    }

    #[test]
    fn retry_backoff_and_exhaustion() {
        let mut q = SendQueue::default();
        q.push(data(mac(1), 1), false, None);
        q.mark_attempt(0, 100);
        assert!(matches!(q.retry_later(0, 100, true), RetryDecision::Requeued));
        assert_eq!(q.get(0).unwrap().transmissions_remaining, 2);
        assert_eq!(next(&q, 105), None);
        assert_eq!(next(&q, 110), Some(0));
        q.mark_attempt(0, 110);
        assert!(matches!(q.retry_later(0, 110, false), RetryDecision::Requeued));
        assert_eq!(q.get(0).unwrap().transmissions_remaining, 2);
        q.mark_attempt(0, 120);
        q.retry_later(0, 120, true);
        q.mark_attempt(0, 130);
        match q.retry_later(0, 130, true) {
            RetryDecision::Exhausted(e) => assert_eq!(e.transmissions_remaining, 0),
            RetryDecision::Requeued => panic!("expected exhaustion"),
        }
        assert!(q.is_empty());
    }

    #[test]
    fn parked_entries_wait_for_release() {
        let mut q = SendQueue::default();
        q.push(data(mac(1), 1), true, None);
        q.push(data(mac(1), 1), false, None);
        q.push(handshake(mac(1)), false, None);
        assert_eq!(next(&q, 0), Some(2));
        q.take_where(|e| e.kind == EntryKind::Handshake);
        assert_eq!(next(&q, 0), None);
        assert!(q.has_parked_for(&mac(1)));
        assert_eq!(q.release_parked(&mac(1)), 1);
        assert_eq!(next(&q, 0), Some(0));
    }

    #[test]
    fn rekey_restarts_encrypted_entries() {
        let mut q = SendQueue::default();
        q.push(
            Outbound {
                encrypted: true,
                ..data(mac(1), 2)
            },
            false,
            None,
        );
        q.push(data(mac(1), 1), false, None);
        for i in 0..2 {
            q.get_mut(i).unwrap().message_id = Some(MessageId::new(7, 0, i == 0));
        }
        q.mark_attempt(0, 0);
        q.fragment_delivered(0);
        q.restart_encrypted(&[mac(1)]);
        let e = q.get(0).unwrap();
        assert_eq!(e.next_fragment, 0);
        assert!(e.message_id.is_none());
        assert!(q.get(1).unwrap().message_id.is_some());
    }
}

//! Receive assembler: reassemble fragments per (sender, message) and drop replays.

use std::collections::HashMap;

use crate::protocol::{FrameType, MacAddr, MessageId};
use crate::time::{Millis, TimeTracker};

/// Partial messages are dropped this long after their first fragment.
pub const DEFAULT_REASSEMBLY_TIMEOUT_MS: Millis = 1_000;
/// Unencrypted replay state is forgotten after this much silence from a sender.
pub const DEFAULT_REPLAY_WINDOW_MS: Millis = 2_500;

/// Independent message-ID sequence of one sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplayStream {
    Broadcast,
    /// Unencrypted frames addressed to one of this node's interfaces.
    Directed(MacAddr),
    /// Encrypted frames of one session, identified by the peer's session key.
    Session(u64),
}

/// One received frame, already decrypted.
#[derive(Debug, Clone)]
pub struct ReceivedFragment {
    pub sender: MacAddr,
    pub frame_type: FrameType,
    pub message_id: MessageId,
    pub fragments_remaining: u8,
    pub payload: Vec<u8>,
}

/// A complete message ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    pub sender: MacAddr,
    pub frame_type: FrameType,
    /// ID of fragment 0.
    pub message_id: MessageId,
    pub body: Vec<u8>,
}

impl AssembledMessage {
    pub fn is_encrypted(&self) -> bool {
        self.message_id.is_encrypted()
    }
}

#[derive(Debug)]
pub enum AssemblyResult {
    Complete(AssembledMessage),
    InProgress,
    /// Message-ID not above the highest accepted for this stream.
    Duplicate,
    /// Fragment inconsistent with the message it claims to belong to.
    Rejected,
}

struct PartialMessage {
    frame_type: FrameType,
    stream: ReplayStream,
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    started: TimeTracker,
}

impl PartialMessage {
    fn is_complete(&self) -> bool {
        self.received == self.fragments.len()
    }

    fn reassemble_into_bytes(self) -> Vec<u8> {
        self.fragments.into_iter().flatten().flatten().collect()
    }
}

struct ReplayRecord {
    highest: u64,
    last_accepted: TimeTracker,
}

pub struct ReceiveAssembler {
    partial: HashMap<(MacAddr, u64), PartialMessage>,
    replay: HashMap<(MacAddr, ReplayStream), ReplayRecord>,
    timeout: Millis,
    replay_window: Millis,
}

impl ReceiveAssembler {
    pub fn new(timeout: Millis, replay_window: Millis) -> Self {
        Self {
            partial: HashMap::new(),
            replay: HashMap::new(),
            timeout,
            replay_window,
        }
    }

    pub fn partial_count(&self) -> usize {
        self.partial.len()
    }

    /// Store one fragment; returns the whole message when its last fragment arrives.
    pub fn accept(
        &mut self,
        fragment: ReceivedFragment,
        stream: ReplayStream,
        now: Millis,
    ) -> AssemblyResult {
        let sequence = fragment.message_id.sequence();
        if let Some(record) = self.replay.get(&(fragment.sender, stream)) {
            if sequence <= record.highest {
                return AssemblyResult::Duplicate;
            }
        }
        let index = usize::from(fragment.message_id.fragment_index());
        let total = index + usize::from(fragment.fragments_remaining) + 1;
        if total > usize::from(u8::MAX) + 1 {
            return AssemblyResult::Rejected;
        }
        let key = (fragment.sender, fragment.message_id.message_key());
        let partial = self.partial.entry(key).or_insert_with(|| PartialMessage {
            frame_type: fragment.frame_type,
            stream,
            fragments: vec![None; total],
            received: 0,
            started: TimeTracker::new(now),
        });
        if partial.frame_type != fragment.frame_type
            || partial.stream != stream
            || partial.fragments.len() != total
        {
            self.partial.remove(&key);
            return AssemblyResult::Rejected;
        }
        if partial.fragments[index].is_none() {
            partial.fragments[index] = Some(fragment.payload);
            partial.received += 1;
        }
        if !partial.is_complete() {
            return AssemblyResult::InProgress;
        }
        let Some(done) = self.partial.remove(&key) else {
            return AssemblyResult::InProgress;
        };
        let frame_type = done.frame_type;
        let body = done.reassemble_into_bytes();
        self.replay.insert(
            (fragment.sender, stream),
            ReplayRecord {
                highest: sequence,
                last_accepted: TimeTracker::new(now),
            },
        );
        AssemblyResult::Complete(AssembledMessage {
            sender: fragment.sender,
            frame_type,
            message_id: fragment.message_id.first_fragment(),
            body,
        })
    }

    /// Drop timed-out partial messages and stale unencrypted replay state.
    /// Returns the number of partial messages dropped.
    pub fn expire(&mut self, now: Millis) -> usize {
        let before = self.partial.len();
        let timeout = self.timeout;
        self.partial
            .retain(|_, p| p.started.time_since_creation(now) < timeout);
        let window = self.replay_window;
        self.replay.retain(|(_, stream), r| {
            matches!(stream, ReplayStream::Session(_))
                || r.last_accepted.time_since_creation(now) < window
        });
        before - self.partial.len()
    }

    /// Forget all state of a session that no longer exists.
    pub fn forget_session(&mut self, peer_session_key: u64) {
        let stream = ReplayStream::Session(peer_session_key);
        self.partial.retain(|_, p| p.stream != stream);
        self.replay.retain(|(_, s), _| *s != stream);
    }
}

impl Default for ReceiveAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_REASSEMBLY_TIMEOUT_MS, DEFAULT_REPLAY_WINDOW_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TO_STA: ReplayStream = ReplayStream::Directed(MacAddr([0x02, 0, 0, 0, 0, 9]));
    const TO_AP: ReplayStream = ReplayStream::Directed(MacAddr([0x06, 0, 0, 0, 0, 9]));

    fn mac(b: u8) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, b])
    }

    fn frag(seq: u64, index: u8, remaining: u8, payload: &[u8]) -> ReceivedFragment {
        ReceivedFragment {
            sender: mac(1),
            frame_type: FrameType::Unicast,
            message_id: MessageId::new(seq, index, false),
            fragments_remaining: remaining,
            payload: payload.to_vec(),
        }
    }

    fn complete(r: AssemblyResult) -> AssembledMessage {
        match r {
            AssemblyResult::Complete(m) => m,
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn single_fragment_completes() {
        let mut a = ReceiveAssembler::default();
        let m = complete(a.accept(frag(1, 0, 0, b"ping"), TO_STA, 0));
        assert_eq!(m.body, b"ping");
        assert_eq!(m.sender, mac(1));
        assert_eq!(m.message_id, MessageId::new(1, 0, false));
    }

    #[test]
    fn out_of_order_fragments_reassemble() {
        let mut a = ReceiveAssembler::default();
        assert!(matches!(
            a.accept(frag(5, 2, 0, b"ghi"), TO_STA, 0),
            AssemblyResult::InProgress
        ));
        assert!(matches!(
            a.accept(frag(5, 0, 2, b"abc"), TO_STA, 1),
            AssemblyResult::InProgress
        ));
        assert!(matches!(
            a.accept(frag(5, 0, 2, b"abc"), TO_STA, 2),
            AssemblyResult::InProgress
        ));
        let m = complete(a.accept(frag(5, 1, 1, b"def"), TO_STA, 3));
        assert_eq!(m.body, b"abcdefghi");
        assert_eq!(a.partial_count(), 0);
    }

    #[test]
    fn replays_are_dropped() {
        let mut a = ReceiveAssembler::default();
        complete(a.accept(frag(7, 0, 0, b"x"), TO_STA, 0));
        assert!(matches!(
            a.accept(frag(7, 0, 0, b"x"), TO_STA, 5),
            AssemblyResult::Duplicate
        ));
        assert!(matches!(
            a.accept(frag(6, 0, 0, b"old"), TO_STA, 5),
            AssemblyResult::Duplicate
        ));
        // Streams are independent.
        complete(a.accept(frag(3, 0, 0, b"b"), ReplayStream::Broadcast, 5));
        complete(a.accept(frag(8, 0, 0, b"y"), TO_STA, 6));
    }

    #[test]
    fn each_interface_tracks_its_own_sequence() {
        let mut a = ReceiveAssembler::default();
        complete(a.accept(frag(11, 0, 0, b"y"), TO_STA, 0));
        // An earlier ID retransmitted to the AP address is still new there.
        let m = complete(a.accept(frag(10, 0, 0, b"big"), TO_AP, 1));
        assert_eq!(m.body, b"big");
        assert!(matches!(
            a.accept(frag(10, 0, 0, b"big"), TO_AP, 2),
            AssemblyResult::Duplicate
        ));
        assert!(matches!(
            a.accept(frag(10, 0, 0, b"big"), TO_STA, 2),
            AssemblyResult::Duplicate
        ));
    }

    #[test]
    fn partial_times_out() {
        let mut a = ReceiveAssembler::default();
        a.accept(frag(9, 0, 1, b"half"), TO_STA, 0);
        assert_eq!(a.expire(999), 0);
        assert_eq!(a.expire(1_000), 1);
        assert!(matches!(
            a.accept(frag(9, 1, 0, b"rest"), TO_STA, 1_001),
            AssemblyResult::InProgress
        ));
    }

    #[test]
    fn replay_window_forgets_unencrypted_senders() {
        let mut a = ReceiveAssembler::new(1_000, 2_500);
        complete(a.accept(frag(100, 0, 0, b"x"), TO_STA, 0));
        let mut enc = frag(100, 0, 0, b"e");
        enc.message_id = MessageId::new(100, 0, true);
        complete(a.accept(enc.clone(), ReplayStream::Session(42), 0));
        a.expire(2_500);
        // Sender restarted its counter: accepted again after the window.
        complete(a.accept(frag(1, 0, 0, b"x"), TO_STA, 2_600));
        assert!(matches!(
            a.accept(enc, ReplayStream::Session(42), 2_600),
            AssemblyResult::Duplicate
        ));
        a.forget_session(42);
        let mut again = frag(100, 0, 0, b"e");
        again.message_id = MessageId::new(100, 0, true);
        complete(a.accept(again, ReplayStream::Session(42), 2_700));
    }

    #[test]
    fn inconsistent_fragment_rejected() {
        let mut a = ReceiveAssembler::default();
        a.accept(frag(4, 0, 2, b"a"), TO_STA, 0);
        assert!(matches!(
            a.accept(frag(4, 1, 0, b"b"), TO_STA, 0),
            AssemblyResult::Rejected
        ));
        assert_eq!(a.partial_count(), 0);
    }
}

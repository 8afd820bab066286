//! Response queue: replies waiting to be sent, in creation order.

use std::collections::VecDeque;

use crate::protocol::{MacAddr, MessageId};
use crate::time::{Millis, TimeTracker};

pub const DEFAULT_RESPONSE_TIMEOUT_MS: Millis = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEntry {
    pub recipient: MacAddr,
    pub reply: String,
    /// ID of the request being answered.
    pub request_id: MessageId,
    /// Send encrypted; set when the request arrived encrypted.
    pub encrypted: bool,
    pub created: TimeTracker,
}

impl ResponseEntry {
    pub fn new(
        recipient: MacAddr,
        reply: String,
        request_id: MessageId,
        encrypted: bool,
        now: Millis,
    ) -> Self {
        Self {
            recipient,
            reply,
            request_id,
            encrypted,
            created: TimeTracker::new(now),
        }
    }

    /// Wire body: request ID (8 bytes LE) followed by the reply text.
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + self.reply.len());
        body.extend_from_slice(&self.request_id.raw().to_le_bytes());
        body.extend_from_slice(self.reply.as_bytes());
        body
    }
}

/// Split a response body into the request ID it answers and the reply text.
pub fn parse_response_body(body: &[u8]) -> Option<(MessageId, String)> {
    if body.len() < 8 {
        return None;
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&body[..8]);
    let reply = String::from_utf8_lossy(&body[8..]).into_owned();
    Some((MessageId::from_raw(u64::from_le_bytes(id)), reply))
}

pub struct ResponseQueue {
    entries: VecDeque<ResponseEntry>,
    timeout: Millis,
}

impl ResponseQueue {
    pub fn new(timeout: Millis) -> Self {
        Self {
            entries: VecDeque::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: ResponseEntry) {
        self.entries.push_back(entry);
    }

    pub fn get(&self, index: usize) -> Option<&ResponseEntry> {
        self.entries.get(index)
    }

    fn is_expired(&self, entry: &ResponseEntry, now: Millis) -> bool {
        entry.created.time_since_creation(now) >= self.timeout
    }

    /// Oldest reply still within its timeout. Expired replies in front of it are
    /// removed and returned in the second element.
    pub fn pop_ready(&mut self, now: Millis) -> (Option<ResponseEntry>, Vec<ResponseEntry>) {
        let mut expired = Vec::new();
        while let Some(front) = self.entries.pop_front() {
            if self.is_expired(&front, now) {
                expired.push(front);
            } else {
                return (Some(front), expired);
            }
        }
        (None, expired)
    }

    /// Remove every expired reply.
    pub fn expire(&mut self, now: Millis) -> Vec<ResponseEntry> {
        let timeout = self.timeout;
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.created.time_since_creation(now) >= timeout);
        self.entries = kept.into();
        expired
    }

    /// Delete replies for `recipient`; with `encrypted_only`, only encrypted ones.
    pub fn remove_by_recipient(&mut self, recipient: &MacAddr, encrypted_only: bool) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.recipient == *recipient && (e.encrypted || !encrypted_only)));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ResponseQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_TIMEOUT_MS)
    }
}

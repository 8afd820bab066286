//! Encrypted peer table: bounded set of sessions keyed by peer station MAC,
//! kept in least-recently-used order.

use crate::protocol::MacAddr;
use crate::session::EncryptedConnectionData;
use crate::time::Millis;

/// Radio peer-slot limit; the table can never be configured larger.
pub const MAX_PEER_SLOTS: usize = 6;
pub const DEFAULT_PEER_TABLE_CAPACITY: usize = MAX_PEER_SLOTS;

pub struct PeerTable {
    /// Least recently used first.
    sessions: Vec<EncryptedConnectionData>,
    capacity: usize,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_PEER_SLOTS);
        Self {
            sessions: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.capacity
    }

    /// Insert a session. On `DuplicatePeer` the existing entry's lifetime has been
    /// refreshed from `session` and marked used; callers treat that as success.
    pub fn add(
        &mut self,
        session: EncryptedConnectionData,
        now: Millis,
    ) -> Result<(), PeerTableError> {
        if let Some(existing) = self.get_mut(&session.peer_sta_mac()) {
            match session.remaining_duration(now) {
                Some(remaining) => existing.set_remaining_duration(remaining, now),
                None => existing.remove_duration(),
            }
            let mac = session.peer_sta_mac();
            self.touch(&mac);
            return Err(PeerTableError::DuplicatePeer);
        }
        if self.keys_in_use(session.peer_session_key(), session.own_session_key()) {
            return Err(PeerTableError::DuplicateSessionKeys);
        }
        if self.is_full() {
            return Err(PeerTableError::PeerTableFull);
        }
        self.sessions.push(session);
        Ok(())
    }

    /// True if any session already uses this (peer key, own key) pair.
    pub fn keys_in_use(&self, peer_session_key: u64, own_session_key: u64) -> bool {
        self.sessions.iter().any(|s| {
            s.peer_session_key() == peer_session_key && s.own_session_key() == own_session_key
        })
    }

    /// Session whose peer station or AP MAC is `mac`.
    pub fn get(&self, mac: &MacAddr) -> Option<&EncryptedConnectionData> {
        self.sessions.iter().find(|s| s.connected_to(mac))
    }

    pub fn get_mut(&mut self, mac: &MacAddr) -> Option<&mut EncryptedConnectionData> {
        self.sessions.iter_mut().find(|s| s.connected_to(mac))
    }

    pub fn contains(&self, mac: &MacAddr) -> bool {
        self.get(mac).is_some()
    }

    /// Resolve the session tag of a received frame (the peer's own key).
    pub fn lookup_by_session_key(&self, peer_session_key: u64) -> Option<&EncryptedConnectionData> {
        self.sessions
            .iter()
            .find(|s| s.peer_session_key() == peer_session_key)
    }

    /// Mark the session with `mac` as most recently used.
    pub fn touch(&mut self, mac: &MacAddr) {
        if let Some(pos) = self.sessions.iter().position(|s| s.connected_to(mac)) {
            let s = self.sessions.remove(pos);
            self.sessions.push(s);
        }
    }

    pub fn remove(&mut self, mac: &MacAddr) -> Option<EncryptedConnectionData> {
        let pos = self.sessions.iter().position(|s| s.connected_to(mac))?;
        Some(self.sessions.remove(pos))
    }

    /// Evict the least recently used temporary session. Permanent sessions stay.
    pub fn evict_least_recently_used_temporary(&mut self) -> Option<EncryptedConnectionData> {
        let pos = self.sessions.iter().position(|s| s.is_temporary())?;
        Some(self.sessions.remove(pos))
    }

    /// True if a slot is free or can be freed by eviction.
    pub fn has_room(&self) -> bool {
        !self.is_full() || self.sessions.iter().any(|s| s.is_temporary())
    }

    /// Remove every expired session and return them.
    pub fn expire(&mut self, now: Millis) -> Vec<EncryptedConnectionData> {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.sessions.len() {
            if self.sessions[i].expired(now) {
                expired.push(self.sessions.remove(i));
            } else {
                i += 1;
            }
        }
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &EncryptedConnectionData> {
        self.sessions.iter()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_TABLE_CAPACITY)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerTableError {
    #[error("peer table full")]
    PeerTableFull,
    #[error("peer already has a session")]
    DuplicatePeer,
    #[error("session key pair already in use")]
    DuplicateSessionKeys,
}

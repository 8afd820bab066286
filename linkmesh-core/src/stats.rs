//! Transmission statistics and per-peer authentication failure tracking.

use std::collections::HashMap;

use crate::protocol::MacAddr;

#[derive(Debug, Default)]
pub struct MeshStats {
    frames_sent: u64,
    frames_failed: u64,
    ring_overflows: u64,
    auth_failures: HashMap<MacAddr, u32>,
}

impl MeshStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one frame handed to the radio.
    pub fn record_send(&mut self, success: bool) {
        if success {
            self.frames_sent += 1;
        } else {
            self.frames_failed += 1;
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_failed(&self) -> u64 {
        self.frames_failed
    }

    /// Failed share of all send attempts, 0.0 when nothing was sent.
    pub fn transmission_fail_rate(&self) -> f64 {
        let total = self.frames_sent + self.frames_failed;
        if total == 0 {
            0.0
        } else {
            self.frames_failed as f64 / total as f64
        }
    }

    pub fn record_auth_failure(&mut self, peer: MacAddr) {
        *self.auth_failures.entry(peer).or_insert(0) += 1;
    }

    pub fn auth_failure_count(&self, peer: &MacAddr) -> u32 {
        self.auth_failures.get(peer).copied().unwrap_or(0)
    }

    pub fn total_auth_failures(&self) -> u64 {
        self.auth_failures.values().map(|&n| u64::from(n)).sum()
    }

    pub fn record_ring_overflow(&mut self) {
        self.ring_overflows += 1;
    }

    /// Received frames dropped because the receive ring was full.
    pub fn ring_overflows(&self) -> u64 {
        self.ring_overflows
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_rate() {
        let mut s = MeshStats::new();
        assert_eq!(s.transmission_fail_rate(), 0.0);
        s.record_send(true);
        s.record_send(true);
        s.record_send(true);
        s.record_send(false);
        assert_eq!(s.frames_sent(), 3);
        assert_eq!(s.frames_failed(), 1);
        assert!((s.transmission_fail_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn auth_failures_per_peer() {
        let mut s = MeshStats::new();
        let a = MacAddr([2, 0, 0, 0, 0, 1]);
        let b = MacAddr([2, 0, 0, 0, 0, 2]);
        s.record_auth_failure(a);
        s.record_auth_failure(a);
        s.record_auth_failure(b);
        assert_eq!(s.auth_failure_count(&a), 2);
        assert_eq!(s.auth_failure_count(&b), 1);
        assert_eq!(s.total_auth_failures(), 3);
        s.reset();
        assert_eq!(s.auth_failure_count(&a), 0);
    }
}

//! Wrap-safe millisecond time tracking.
//!
//! All arithmetic is `now - created` with wrapping subtraction, compared
//! against an unsigned duration. Correct as long as no tracked entity lives
//! longer than `u32::MAX` milliseconds (about 49 days).

/// Milliseconds from an arbitrary host epoch. Wraps at `u32::MAX`.
pub type Millis = u32;

/// Remembers when something was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeTracker {
    creation_time: Millis,
}

impl TimeTracker {
    pub fn new(now: Millis) -> Self {
        Self { creation_time: now }
    }

    pub fn creation_time(&self) -> Millis {
        self.creation_time
    }

    /// Elapsed milliseconds, correct across one clock wrap.
    pub fn time_since_creation(&self, now: Millis) -> Millis {
        now.wrapping_sub(self.creation_time)
    }
}

/// A [`TimeTracker`] with a duration after which it counts as expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiringTimeTracker {
    tracker: TimeTracker,
    duration: Millis,
}

impl ExpiringTimeTracker {
    pub fn new(duration: Millis, now: Millis) -> Self {
        Self {
            tracker: TimeTracker::new(now),
            duration,
        }
    }

    pub fn duration(&self) -> Millis {
        self.duration
    }

    pub fn creation_time(&self) -> Millis {
        self.tracker.creation_time()
    }

    pub fn time_since_creation(&self, now: Millis) -> Millis {
        self.tracker.time_since_creation(now)
    }

    /// `max(0, duration - time_since_creation)`.
    pub fn remaining_duration(&self, now: Millis) -> Millis {
        self.duration
            .saturating_sub(self.tracker.time_since_creation(now))
    }

    /// Restart the tracker so that exactly `remaining` milliseconds are left.
    pub fn set_remaining_duration(&mut self, remaining: Millis, now: Millis) {
        self.tracker = TimeTracker::new(now);
        self.duration = remaining;
    }

    /// Expired once the elapsed time reaches the duration, so a tracker with
    /// zero remaining duration is always expired.
    pub fn expired(&self, now: Millis) -> bool {
        self.tracker.time_since_creation(now) >= self.duration
    }
}

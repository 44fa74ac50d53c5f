//! Per-key window state.

/// Admissions recorded for one key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Requests admitted in this window. At least 1 for a live bucket.
    pub count: u32,
    /// Absolute time (ms) at which the window resets.
    pub expires_at: u64,
}

impl Bucket {
    /// Start a new window at `now` holding the request that opened it.
    pub fn open(now: u64, window_ms: u64) -> Self {
        Self {
            count: 1,
            expires_at: now.saturating_add(window_ms),
        }
    }

    /// A window is over once `now` reaches `expires_at`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    /// Milliseconds left until the window resets.
    pub fn retry_after_ms(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }
}

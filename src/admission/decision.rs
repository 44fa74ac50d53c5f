//! Admission outcomes.

use std::time::Duration;

/// HTTP status for an admitted request.
pub const STATUS_OK: u16 = 200;
/// HTTP status for a throttled request.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// The outcome of one admission check.
///
/// Denial is a regular value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request was admitted and counted.
    Allowed {
        /// Requests still admissible in this window.
        remaining: u32,
    },
    /// The request was rejected and not counted.
    Denied {
        /// Milliseconds until the window resets.
        retry_after_ms: u64,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Remaining quota, or zero when denied.
    pub fn remaining(&self) -> u32 {
        match self {
            Decision::Allowed { remaining } => *remaining,
            Decision::Denied { .. } => 0,
        }
    }

    /// Time until a denied caller may retry. Zero when allowed.
    pub fn retry_after(&self) -> Duration {
        match self {
            Decision::Allowed { .. } => Duration::ZERO,
            Decision::Denied { retry_after_ms } => Duration::from_millis(*retry_after_ms),
        }
    }

    /// `Retry-After` in whole seconds, rounded up so a client that honours
    /// it never retries early.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied { retry_after_ms } => Some(retry_after_ms.div_ceil(1000)),
        }
    }

    /// Value for an HTTP `Retry-After` header, present only when denied.
    pub fn retry_after_header(&self) -> Option<String> {
        self.retry_after_secs().map(|secs| secs.to_string())
    }

    /// HTTP status a request handler should answer with.
    pub fn http_status(&self) -> u16 {
        if self.is_allowed() {
            STATUS_OK
        } else {
            STATUS_TOO_MANY_REQUESTS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_decision() {
        let decision = Decision::Allowed { remaining: 4 };
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining(), 4);
        assert_eq!(decision.retry_after(), Duration::ZERO);
        assert_eq!(decision.retry_after_header(), None);
        assert_eq!(decision.http_status(), 200);
    }

    #[test]
    fn test_denied_decision_rounds_header_up() {
        let decision = Decision::Denied {
            retry_after_ms: 1001,
        };
        assert!(!decision.is_allowed());
        assert_eq!(decision.remaining(), 0);
        assert_eq!(decision.retry_after(), Duration::from_millis(1001));
        assert_eq!(decision.retry_after_header().as_deref(), Some("2"));
        assert_eq!(decision.http_status(), 429);
    }

    #[test]
    fn test_sub_second_retry_is_one_second() {
        let decision = Decision::Denied { retry_after_ms: 1 };
        assert_eq!(decision.retry_after_secs(), Some(1));

        let decision = Decision::Denied {
            retry_after_ms: 60_000,
        };
        assert_eq!(decision.retry_after_secs(), Some(60));
    }
}

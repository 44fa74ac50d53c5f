//! Fixed-window admission controller.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BinaryHeap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use super::bucket::Bucket;
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::policy::Policy;
use crate::error::{Result, TollgateError};

/// Capacity is freed in batches of `max_buckets / EVICTION_BATCH_DIVISOR`.
const EVICTION_BATCH_DIVISOR: usize = 10;

/// Housekeeping knobs for a controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerOptions {
    /// Sweep expired buckets after every N-th check
    pub sweep_every: Option<NonZeroU64>,
    /// Soft upper bound on the number of tracked keys
    pub max_buckets: Option<usize>,
}

/// Decides, per key, whether a request fits in the current window.
///
/// Each key has at most one [`Bucket`]. The read-modify-write for a key runs
/// while holding that key's shard lock, so concurrent checks for the same key
/// are serialized. Share one controller between handlers with an `Arc`.
pub struct AdmissionController<C: Clock = SystemClock> {
    /// Live and not-yet-swept buckets indexed by key
    buckets: DashMap<String, Bucket>,
    /// Time source for the clock-reading entry points
    clock: C,
    options: ControllerOptions,
    /// Checks performed, drives opportunistic sweeping
    calls: AtomicU64,
}

impl AdmissionController<SystemClock> {
    /// Create a controller on wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for AdmissionController<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> AdmissionController<C> {
    /// Create a controller reading time from `clock`.
    pub fn with_clock(clock: C) -> Self {
        Self::with_options(clock, ControllerOptions::default())
    }

    /// Create a controller with explicit housekeeping options.
    pub fn with_options(clock: C, options: ControllerOptions) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
            options,
            calls: AtomicU64::new(0),
        }
    }

    /// The controller's time source.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Check `key` against `policy` at the clock's current time.
    pub fn check(&self, key: &str, policy: &Policy) -> Result<Decision> {
        self.check_and_record(key, policy.limit, policy.window_ms)
    }

    /// Check and record one request at the clock's current time.
    pub fn check_and_record(&self, key: &str, limit: u32, window_ms: u64) -> Result<Decision> {
        self.check_and_record_at(key, limit, window_ms, self.clock.now_ms())
    }

    /// Check and record one request for `key` at time `now`.
    ///
    /// Opens a new window when the key has none or its window has ended
    /// (`expires_at <= now`). Within a live window the request is counted if
    /// the count is below `limit`, otherwise it is denied and the bucket is
    /// left untouched.
    pub fn check_and_record_at(
        &self,
        key: &str,
        limit: u32,
        window_ms: u64,
        now: u64,
    ) -> Result<Decision> {
        validate(key, limit, window_ms)?;

        trace!(key = %key, limit = limit, window_ms = window_ms, now = now, "Checking admission");

        if !self.buckets.contains_key(key) {
            self.make_room(now);
        }

        // Shard lock held for the rest of this block.
        let decision = match self.buckets.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Bucket::open(now, window_ms));
                debug!(key = %key, limit = limit, window_ms = window_ms, "Opened window");
                Decision::Allowed {
                    remaining: limit - 1,
                }
            }
            Entry::Occupied(mut entry) => {
                let bucket = entry.get_mut();
                if bucket.is_expired(now) {
                    *bucket = Bucket::open(now, window_ms);
                    debug!(key = %key, limit = limit, window_ms = window_ms, "Opened window");
                    Decision::Allowed {
                        remaining: limit - 1,
                    }
                } else if bucket.count >= limit {
                    let retry_after_ms = bucket.retry_after_ms(now);
                    debug!(
                        key = %key,
                        count = bucket.count,
                        retry_after_ms = retry_after_ms,
                        "Admission denied"
                    );
                    Decision::Denied { retry_after_ms }
                } else {
                    bucket.count += 1;
                    Decision::Allowed {
                        remaining: limit - bucket.count,
                    }
                }
            }
        };

        self.maybe_sweep(now);

        Ok(decision)
    }

    /// Remove every bucket whose window has ended by `now`.
    ///
    /// Returns how many buckets were removed.
    pub fn sweep(&self, now: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_expired(now));
        let removed = before.saturating_sub(self.buckets.len());

        if removed > 0 {
            debug!(removed = removed, remaining = self.buckets.len(), "Swept expired buckets");
        }
        removed
    }

    /// Snapshot of the bucket stored for `key`, expired or not.
    pub fn bucket(&self, key: &str) -> Option<Bucket> {
        self.buckets.get(key).map(|b| *b)
    }

    /// Number of buckets currently stored.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    fn maybe_sweep(&self, now: u64) {
        let Some(every) = self.options.sweep_every else {
            return;
        };

        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if calls % every.get() == 0 {
            self.sweep(now);
        }
    }

    /// Keep the map under `max_buckets` before a new key is inserted.
    ///
    /// One pass over the map frees a batch of `max_buckets / 10` slots (at
    /// least one): expired buckets first, then the live buckets closest to
    /// expiry. The next batch of new keys then inserts without scanning.
    /// Concurrent inserts can overshoot the bound briefly.
    fn make_room(&self, now: u64) {
        let Some(max_buckets) = self.options.max_buckets else {
            return;
        };
        if self.buckets.len() < max_buckets {
            return;
        }

        let batch = (max_buckets / EVICTION_BATCH_DIVISOR).max(1);
        let mut expired = Vec::new();
        // Max-heap holding the `batch` earliest-expiring live buckets.
        let mut earliest: BinaryHeap<(u64, String)> = BinaryHeap::with_capacity(batch + 1);

        for entry in self.buckets.iter() {
            let expires_at = entry.value().expires_at;
            if expires_at <= now {
                expired.push(entry.key().clone());
            } else if expired.len() < batch {
                let closer = earliest
                    .peek()
                    .map_or(true, |(latest, _)| expires_at < *latest);
                if earliest.len() < batch || closer {
                    earliest.push((expires_at, entry.key().clone()));
                    if earliest.len() > batch {
                        earliest.pop();
                    }
                }
            }
        }

        let mut removed = 0;
        for key in &expired {
            // Skip buckets reopened since the scan.
            if self
                .buckets
                .remove_if(key, |_, bucket| bucket.is_expired(now))
                .is_some()
            {
                removed += 1;
            }
        }

        let mut evicted = 0;
        if expired.len() < batch {
            for (expires_at, key) in earliest
                .into_sorted_vec()
                .into_iter()
                .take(batch - expired.len())
            {
                if self
                    .buckets
                    .remove_if(&key, |_, bucket| bucket.expires_at == expires_at)
                    .is_some()
                {
                    evicted += 1;
                }
            }
        }

        debug!(
            removed = removed,
            evicted = evicted,
            max_buckets = max_buckets,
            "Made room at capacity"
        );
    }
}

fn validate(key: &str, limit: u32, window_ms: u64) -> Result<()> {
    if key.is_empty() {
        return Err(TollgateError::InvalidConfiguration(
            "key must not be empty".to_string(),
        ));
    }
    if limit == 0 {
        return Err(TollgateError::InvalidConfiguration(
            "limit must be positive".to_string(),
        ));
    }
    if window_ms == 0 {
        return Err(TollgateError::InvalidConfiguration(
            "window_ms must be positive".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::clock::ManualClock;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn allowed(remaining: u32) -> Decision {
        Decision::Allowed { remaining }
    }

    fn denied(retry_after_ms: u64) -> Decision {
        Decision::Denied { retry_after_ms }
    }

    #[test]
    fn test_walkthrough_limit_three() {
        let controller = AdmissionController::new();

        let cases = [
            (0, allowed(2)),
            (100, allowed(1)),
            (200, allowed(0)),
            (300, denied(700)),
            (999, denied(1)),
            (1000, allowed(2)),
        ];

        for (now, expected) in cases {
            let decision = assert_ok!(controller.check_and_record_at("k", 3, 1000, now));
            assert_eq!(decision, expected, "at now={}", now);
        }
    }

    #[test]
    fn test_first_limit_calls_admitted_then_denied() {
        let controller = AdmissionController::new();

        for i in 0..5u64 {
            let decision = controller.check_and_record_at("k", 5, 1000, i * 10).unwrap();
            assert!(decision.is_allowed(), "call {} should be admitted", i);
        }
        for i in 5..20u64 {
            let decision = controller.check_and_record_at("k", 5, 1000, i * 10).unwrap();
            assert!(!decision.is_allowed(), "call {} should be denied", i);
        }
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let controller = AdmissionController::new();

        for now in [0, 1, 2] {
            controller.check_and_record_at("k", 3, 1000, now).unwrap();
        }
        assert!(!controller.check_and_record_at("k", 3, 1000, 500).unwrap().is_allowed());

        let decision = controller.check_and_record_at("k", 3, 1000, 1500).unwrap();
        assert_eq!(decision, allowed(2));

        let bucket = controller.bucket("k").unwrap();
        assert_eq!(bucket.count, 1);
        assert_eq!(bucket.expires_at, 2500);
    }

    #[test]
    fn test_exact_expiry_opens_new_window() {
        let controller = AdmissionController::new();

        controller.check_and_record_at("k", 1, 1000, 0).unwrap();
        assert_eq!(
            controller.check_and_record_at("k", 1, 1000, 999).unwrap(),
            denied(1)
        );
        assert_eq!(
            controller.check_and_record_at("k", 1, 1000, 1000).unwrap(),
            allowed(0)
        );
        assert_eq!(controller.bucket("k").unwrap().expires_at, 2000);
    }

    #[test]
    fn test_retry_after_strictly_decreases() {
        let controller = AdmissionController::new();
        controller.check_and_record_at("k", 1, 1000, 0).unwrap();

        let mut previous = u64::MAX;
        for now in (1..1000).step_by(37) {
            match controller.check_and_record_at("k", 1, 1000, now).unwrap() {
                Decision::Denied { retry_after_ms } => {
                    assert!(retry_after_ms < previous);
                    assert!(retry_after_ms > 0);
                    assert_eq!(retry_after_ms, 1000 - now);
                    previous = retry_after_ms;
                }
                other => panic!("expected denial at {}, got {:?}", now, other),
            }
        }
    }

    #[test]
    fn test_keys_are_isolated() {
        let controller = AdmissionController::new();

        for now in 0..3 {
            controller.check_and_record_at("a", 3, 1000, now).unwrap();
        }
        assert!(!controller.check_and_record_at("a", 3, 1000, 10).unwrap().is_allowed());

        assert_eq!(
            controller.check_and_record_at("b", 3, 1000, 10).unwrap(),
            allowed(2)
        );
        assert_eq!(controller.bucket("a").unwrap().count, 3);
        assert_eq!(controller.bucket("b").unwrap().count, 1);
    }

    #[test]
    fn test_denial_does_not_consume_quota() {
        let controller = AdmissionController::new();

        controller.check_and_record_at("k", 2, 1000, 0).unwrap();
        controller.check_and_record_at("k", 2, 1000, 1).unwrap();
        let before = controller.bucket("k").unwrap();

        for now in [2, 3, 4] {
            assert!(!controller.check_and_record_at("k", 2, 1000, now).unwrap().is_allowed());
            assert_eq!(controller.bucket("k").unwrap(), before);
        }
    }

    #[test]
    fn test_invalid_configuration_fails_fast() {
        let controller = AdmissionController::new();

        let err = assert_err!(controller.check_and_record_at("", 3, 1000, 0));
        assert!(matches!(err, TollgateError::InvalidConfiguration(_)));
        let err = assert_err!(controller.check_and_record_at("k", 0, 1000, 0));
        assert!(matches!(err, TollgateError::InvalidConfiguration(_)));
        let err = assert_err!(controller.check_and_record_at("k", 3, 0, 0));
        assert!(matches!(err, TollgateError::InvalidConfiguration(_)));

        assert_eq!(controller.bucket_count(), 0);
    }

    #[test]
    fn test_check_uses_clock_and_policy() {
        let controller = AdmissionController::with_clock(ManualClock::new(0));
        let policy = Policy::new(2, 1000).unwrap();

        assert_eq!(controller.check("k", &policy).unwrap(), allowed(1));
        assert_eq!(controller.check("k", &policy).unwrap(), allowed(0));

        controller.clock().advance(400);
        assert_eq!(controller.check("k", &policy).unwrap(), denied(600));

        controller.clock().advance(600);
        assert_eq!(controller.check("k", &policy).unwrap(), allowed(1));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let controller = AdmissionController::new();

        controller.check_and_record_at("short", 5, 100, 0).unwrap();
        controller.check_and_record_at("long", 5, 10_000, 0).unwrap();
        assert_eq!(controller.bucket_count(), 2);

        assert_eq!(controller.sweep(99), 0);
        assert_eq!(controller.sweep(100), 1);
        assert!(controller.bucket("short").is_none());
        assert!(controller.bucket("long").is_some());
    }

    #[test]
    fn test_opportunistic_sweep() {
        let options = ControllerOptions {
            sweep_every: NonZeroU64::new(3),
            max_buckets: None,
        };
        let controller = AdmissionController::with_options(SystemClock, options);

        controller.check_and_record_at("a", 5, 100, 0).unwrap();
        controller.check_and_record_at("b", 5, 100, 0).unwrap();
        assert_eq!(controller.bucket_count(), 2);

        // Third call sweeps "a" and "b", which expired at 100.
        controller.check_and_record_at("c", 5, 100, 500).unwrap();
        assert_eq!(controller.bucket_count(), 1);
        assert!(controller.bucket("c").is_some());
    }

    #[test]
    fn test_capacity_prefers_expired_buckets() {
        let options = ControllerOptions {
            sweep_every: None,
            max_buckets: Some(2),
        };
        let controller = AdmissionController::with_options(SystemClock, options);

        controller.check_and_record_at("old", 5, 100, 0).unwrap();
        controller.check_and_record_at("live", 5, 10_000, 0).unwrap();

        controller.check_and_record_at("new", 5, 10_000, 200).unwrap();
        assert_eq!(controller.bucket_count(), 2);
        assert!(controller.bucket("old").is_none());
        assert!(controller.bucket("live").is_some());
        assert!(controller.bucket("new").is_some());
    }

    #[test]
    fn test_capacity_evicts_closest_to_expiry() {
        let options = ControllerOptions {
            sweep_every: None,
            max_buckets: Some(2),
        };
        let controller = AdmissionController::with_options(SystemClock, options);

        controller.check_and_record_at("a", 5, 5_000, 0).unwrap();
        controller.check_and_record_at("b", 5, 9_000, 0).unwrap();
        controller.check_and_record_at("c", 5, 9_000, 10).unwrap();

        assert_eq!(controller.bucket_count(), 2);
        assert!(controller.bucket("a").is_none());

        // Existing keys never trigger eviction.
        controller.check_and_record_at("b", 5, 9_000, 20).unwrap();
        assert_eq!(controller.bucket("b").unwrap().count, 2);
        assert!(controller.bucket("c").is_some());
    }

    #[test]
    fn test_capacity_frees_a_batch_per_pass() {
        let options = ControllerOptions {
            sweep_every: None,
            max_buckets: Some(20),
        };
        let controller = AdmissionController::with_options(SystemClock, options);

        for i in 0..20u64 {
            let key = format!("k{}", i);
            controller.check_and_record_at(&key, 5, 10_000 + i, 0).unwrap();
        }
        assert_eq!(controller.bucket_count(), 20);

        // One pass frees max_buckets / 10 = 2 slots, closest to expiry first.
        controller.check_and_record_at("new1", 5, 50_000, 1).unwrap();
        assert_eq!(controller.bucket_count(), 19);
        assert!(controller.bucket("k0").is_none());
        assert!(controller.bucket("k1").is_none());
        assert!(controller.bucket("k2").is_some());

        // The freed slot is used without another eviction.
        controller.check_and_record_at("new2", 5, 50_000, 2).unwrap();
        assert_eq!(controller.bucket_count(), 20);
        assert!(controller.bucket("k2").is_some());
    }

    #[test]
    fn test_capacity_pass_removes_every_expired_bucket() {
        let options = ControllerOptions {
            sweep_every: None,
            max_buckets: Some(3),
        };
        let controller = AdmissionController::with_options(SystemClock, options);

        controller.check_and_record_at("a", 5, 100, 0).unwrap();
        controller.check_and_record_at("b", 5, 100, 0).unwrap();
        controller.check_and_record_at("c", 5, 10_000, 0).unwrap();

        // Both expired buckets go in one pass even though the batch is 1.
        controller.check_and_record_at("d", 5, 10_000, 200).unwrap();
        assert_eq!(controller.bucket_count(), 2);
        assert!(controller.bucket("c").is_some());
        assert!(controller.bucket("d").is_some());
    }

    #[test]
    fn test_clear() {
        let controller = AdmissionController::new();
        controller.check_and_record_at("k", 5, 1000, 0).unwrap();
        assert_eq!(controller.bucket_count(), 1);

        controller.clear();
        assert_eq!(controller.bucket_count(), 0);
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_limit() {
        let controller = Arc::new(AdmissionController::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let controller = Arc::clone(&controller);
            handles.push(std::thread::spawn(move || {
                (0..50)
                    .filter(|_| {
                        controller
                            .check_and_record_at("shared", 100, 60_000, 1)
                            .unwrap()
                            .is_allowed()
                    })
                    .count()
            }));
        }

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert_eq!(controller.bucket("shared").unwrap().count, 100);
    }
}

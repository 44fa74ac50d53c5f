//! Background removal of expired buckets.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::clock::Clock;
use super::controller::AdmissionController;

/// Owns the sweeper task. Dropping the handle stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop sweeping.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn a tokio task that sweeps `controller` every `interval`.
///
/// Must be called from within a tokio runtime.
pub fn spawn_sweeper<C>(controller: Arc<AdmissionController<C>>, interval: Duration) -> SweeperHandle
where
    C: Clock + 'static,
{
    info!(interval_ms = interval.as_millis() as u64, "Starting bucket sweeper");

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let now = controller.clock().now_ms();
            let removed = controller.sweep(now);
            debug!(
                removed = removed,
                buckets = controller.bucket_count(),
                "Sweeper pass complete"
            );
        }
    });

    SweeperHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::clock::ManualClock;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_buckets() {
        let controller = Arc::new(AdmissionController::with_clock(ManualClock::new(0)));
        controller.check_and_record_at("a", 5, 100, 0).unwrap();
        controller.check_and_record_at("b", 5, 10_000, 0).unwrap();

        controller.clock().set(500);
        let handle = spawn_sweeper(Arc::clone(&controller), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(controller.bucket("a").is_none());
        assert!(controller.bucket("b").is_some());
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_sweeper() {
        let controller = Arc::new(AdmissionController::with_clock(ManualClock::new(0)));
        let handle = spawn_sweeper(Arc::clone(&controller), Duration::from_millis(10));
        handle.stop();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(Arc::strong_count(&controller), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_only_sweeps_on_ticks() {
        let controller = Arc::new(AdmissionController::with_clock(ManualClock::new(0)));
        controller.check_and_record_at("a", 5, 100, 0).unwrap();
        let handle = spawn_sweeper(Arc::clone(&controller), Duration::from_secs(60));

        controller.clock().set(500);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(controller.bucket("a").is_some());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(controller.bucket("a").is_none());
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_sweeper() {
        let controller = Arc::new(AdmissionController::with_clock(ManualClock::new(0)));
        let handle = spawn_sweeper(Arc::clone(&controller), Duration::from_millis(10));
        drop(handle);

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only the test holds the controller once the task is gone.
        assert_eq!(Arc::strong_count(&controller), 1);
    }
}

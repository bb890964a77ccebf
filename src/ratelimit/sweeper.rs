//! Background eviction of expired counters.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::limiter::now_millis;
use super::store::CounterStore;

/// Default time between sweep cycles.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Periodically removes counters whose window has elapsed.
///
/// A single task runs the cycles back to back, so two sweeps never overlap.
pub struct Sweeper {
    store: Arc<dyn CounterStore>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<dyn CounterStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run one sweep at `now`. Returns the number of entries removed;
    /// backend failures are logged and count as zero.
    pub fn sweep_at(&self, now: u64) -> usize {
        match self.store.sweep(now) {
            Ok(removed) => {
                debug!(
                    removed = removed,
                    remaining = self.store.len(),
                    "Swept expired rate limit counters"
                );
                removed
            }
            Err(e) => {
                warn!(error = %e, "Rate limit counter sweep failed");
                0
            }
        }
    }

    /// Start the sweep loop on the tokio runtime.
    ///
    /// Each cycle scans the whole store, so it runs on the blocking pool
    /// and the loop waits for it before the next tick.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(
            interval_secs = self.interval.as_secs_f64(),
            backend = self.store.kind(),
            "Starting counter sweeper"
        );

        let sweeper = Arc::new(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cycle = Arc::clone(&sweeper);
                        let now = now_millis();
                        if let Err(e) = tokio::task::spawn_blocking(move || cycle.sweep_at(now)).await {
                            warn!(error = %e, "Counter sweep cycle panicked");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }

            info!("Counter sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Owner handle for a running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for the current cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Counter sweeper task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MemoryCounterStore, Policy};

    #[test]
    fn test_sweep_at_removes_expired() {
        let store = Arc::new(MemoryCounterStore::new());
        let policy = Policy::new("p", 1, Duration::from_secs(1));
        store.hit("old", &policy, 0).unwrap();
        store.hit("new", &policy, 10_000).unwrap();

        let sweeper = Sweeper::new(store.clone(), DEFAULT_SWEEP_INTERVAL);
        assert_eq!(sweeper.sweep_at(5_000), 1);
        assert_eq!(sweeper.sweep_at(5_000), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_sweeper_evicts_and_stops() {
        let store = Arc::new(MemoryCounterStore::new());
        let policy = Policy::new("p", 1, Duration::from_millis(1));
        for key in ["a", "b", "c"] {
            store.hit(key, &policy, 0).unwrap();
        }

        let handle = Sweeper::new(store.clone(), Duration::from_millis(10)).spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());

        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_large_store_swept_off_the_runtime_thread() {
        let store = Arc::new(MemoryCounterStore::new());
        let policy = Policy::new("p", 1, Duration::from_millis(1));
        for i in 0..10_000 {
            store.hit(&format!("client-{}", i), &policy, 0).unwrap();
        }

        let handle = Sweeper::new(store.clone(), Duration::from_millis(10)).spawn();
        // The timer keeps firing on the single runtime thread while sweeps run
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.is_empty() {
                break;
            }
        }
        handle.shutdown().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_live_counters_survive_sweeps() {
        let store = Arc::new(MemoryCounterStore::new());
        let policy = Policy::new("p", 10, Duration::from_secs(3600));
        store.hit("live", &policy, now_millis()).unwrap();

        let handle = Sweeper::new(store.clone(), Duration::from_millis(5)).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert_eq!(store.get("live").unwrap().count, 1);
    }
}

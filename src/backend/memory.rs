use crate::backend::{Backend, Decision, WindowInput, WindowStatus};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

/// A fixed window [Backend] that uses [Dashmap](dashmap::DashMap) to store counters in memory.
///
/// Counters are only shared between clones within one process, use the Redis backend when
/// actions are checked from several processes.
#[derive(Clone)]
pub struct InMemoryBackend {
    map: Arc<DashMap<String, Value>>,
    next_window: Arc<AtomicU64>,
    _gc: Option<Arc<GarbageCollector>>,
}

struct Value {
    ttl: Instant,
    count: u64,
    window: u64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Interval {0:?} is too large")]
    IntervalOverflow(Duration),
}

// Stops the collector once the last backend clone is dropped.
struct GarbageCollector(JoinHandle<()>);

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl InMemoryBackend {
    pub fn builder() -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    fn garbage_collector(map: Arc<DashMap<String, Value>>, interval: Duration) -> JoinHandle<()> {
        assert!(!interval.is_zero(), "GC interval must be non-zero");
        tokio::spawn(async move {
            loop {
                let now = Instant::now();
                map.retain(|_k, v| v.ttl > now);
                log::trace!("Rate limit GC retained {} windows", map.len());
                tokio::time::sleep_until(now + interval).await;
            }
        })
    }
}

impl Backend for InMemoryBackend {
    type Error = Error;

    async fn request(&self, input: WindowInput) -> Result<(Decision, WindowStatus), Self::Error> {
        let now = Instant::now();
        let expiry = now
            .checked_add(input.interval)
            .ok_or(Error::IntervalOverflow(input.interval))?;
        // The entry guard holds the shard lock, so the expiry check, comparison and increment
        // happen as one step for this key.
        let mut value = self.map.entry(input.key).or_insert_with(|| Value {
            ttl: now,
            count: 0,
            window: 0,
        });
        if value.ttl <= now {
            // No live window, start a new one from zero.
            value.ttl = expiry;
            value.count = 0;
            value.window = self.next_window.fetch_add(1, Ordering::Relaxed);
        }
        let allow = value.count < input.max_requests;
        if allow {
            value.count += 1;
        }
        let status = WindowStatus {
            limit: input.max_requests,
            remaining: input.max_requests.saturating_sub(value.count),
            reset: value.ttl,
            window: value.window,
        };
        Ok((Decision::from_allowed(allow), status))
    }

    async fn rollback(&self, key: &str, window: u64) -> Result<(), Self::Error> {
        if let Some(mut value) = self.map.get_mut(key) {
            if value.window == window && value.ttl > Instant::now() {
                value.count = value.count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn peek(&self, key: &str, max_requests: u64) -> Result<Option<WindowStatus>, Self::Error> {
        let now = Instant::now();
        Ok(self
            .map
            .get(key)
            .filter(|value| value.ttl > now)
            .map(|value| WindowStatus {
                limit: max_requests,
                remaining: max_requests.saturating_sub(value.count),
                reset: value.ttl,
                window: value.window,
            }))
    }

    async fn remove_key(&self, key: &str) -> Result<(), Self::Error> {
        self.map.remove(key);
        Ok(())
    }
}

pub struct InMemoryBackendBuilder {
    gc_interval: Option<Duration>,
}

impl InMemoryBackendBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing expired windows.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// # Panics
    ///
    /// When garbage collection is enabled this must be called from within a Tokio runtime.
    pub fn build(self) -> InMemoryBackend {
        let map = Arc::new(DashMap::<String, Value>::new());
        let _gc = self.gc_interval.map(|gc_interval| {
            Arc::new(GarbageCollector(InMemoryBackend::garbage_collector(
                map.clone(),
                gc_interval,
            )))
        });
        InMemoryBackend {
            map,
            next_window: Arc::new(AtomicU64::new(1)),
            _gc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Barrier;

    const MINUTE: Duration = Duration::from_secs(60);

    fn input(max_requests: u64) -> WindowInput {
        WindowInput {
            interval: MINUTE,
            max_requests,
            key: "KEY1".to_string(),
        }
    }

    #[actix_web::test]
    async fn test_allow_deny() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder().build();
        for _ in 0..5 {
            // First 5 should be allowed
            let (decision, _) = backend.request(input(5)).await.unwrap();
            assert!(decision.is_allowed());
        }
        // Sixth should be denied
        let (decision, _) = backend.request(input(5)).await.unwrap();
        assert!(decision.is_denied());
    }

    #[actix_web::test]
    async fn test_denied_attempts_are_not_counted() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        backend.request(input(2)).await.unwrap();
        backend.request(input(2)).await.unwrap();
        for _ in 0..100 {
            let (decision, _) = backend.request(input(2)).await.unwrap();
            assert!(decision.is_denied());
        }
        assert_eq!(backend.map.get("KEY1").unwrap().count, 2);
    }

    #[actix_web::test]
    async fn test_reset() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        // Make first request, should be allowed
        let (decision, _) = backend.request(input(1)).await.unwrap();
        assert!(decision.is_allowed());
        // Request again, should be denied
        let (decision, _) = backend.request(input(1)).await.unwrap();
        assert!(decision.is_denied());
        // Advance time and try again, should now be allowed
        tokio::time::advance(MINUTE).await;
        // We want to be sure the key hasn't been garbage collected, and we are testing the expiry logic
        assert!(backend.map.contains_key("KEY1"));
        let (decision, status) = backend.request(input(1)).await.unwrap();
        assert!(decision.is_allowed());
        // The new window starts at the time of the request that opened it
        assert_eq!(status.reset, Instant::now() + MINUTE);
        assert_eq!(backend.map.get("KEY1").unwrap().count, 1);
    }

    #[actix_web::test]
    async fn test_garbage_collection() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder()
            .with_gc_interval(Some(MINUTE))
            .build();
        backend.request(input(1)).await.unwrap();
        backend
            .request(WindowInput {
                interval: MINUTE * 2,
                max_requests: 1,
                key: "KEY2".to_string(),
            })
            .await
            .unwrap();
        assert!(backend.map.contains_key("KEY1"));
        assert!(backend.map.contains_key("KEY2"));
        // Advance time such that the garbage collector runs,
        // expired KEY1 should be cleaned, but KEY2 should remain.
        tokio::time::advance(MINUTE).await;
        tokio::task::yield_now().await;
        assert!(!backend.map.contains_key("KEY1"));
        assert!(backend.map.contains_key("KEY2"));
    }

    #[actix_web::test]
    async fn test_output() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder().build();
        // First of 2 should be allowed.
        let (decision, status) = backend.request(input(2)).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(status.remaining, 1);
        assert_eq!(status.limit, 2);
        assert_eq!(status.reset, Instant::now() + MINUTE);
        // Second of 2 should be allowed.
        let (decision, status) = backend.request(input(2)).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(status.remaining, 0);
        assert_eq!(status.limit, 2);
        assert_eq!(status.reset, Instant::now() + MINUTE);
        // Should be denied
        let (decision, status) = backend.request(input(2)).await.unwrap();
        assert!(decision.is_denied());
        assert_eq!(status.remaining, 0);
        assert_eq!(status.limit, 2);
        assert_eq!(status.reset, Instant::now() + MINUTE);
    }

    #[actix_web::test]
    async fn test_rollback() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder().build();
        let (_, status) = backend.request(input(5)).await.unwrap();
        assert_eq!(status.remaining, 4);
        backend.rollback("KEY1", status.window).await.unwrap();
        // Remaining requests should still be the same, since the previous call was excluded
        let (_, status) = backend.request(input(5)).await.unwrap();
        assert_eq!(status.remaining, 4);
    }

    #[actix_web::test]
    async fn test_rollback_key_gone() {
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        backend.rollback("KEY1", 1).await.unwrap();
        assert!(!backend.map.contains_key("KEY1"));
    }

    #[actix_web::test]
    async fn test_rollback_from_elapsed_window_is_ignored() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        let (decision, stale) = backend.request(input(2)).await.unwrap();
        assert!(decision.is_allowed());

        tokio::time::advance(MINUTE).await;
        for _ in 0..2 {
            let (decision, status) = backend.request(input(2)).await.unwrap();
            assert!(decision.is_allowed());
            assert_ne!(status.window, stale.window);
        }
        // Slot from the previous window must not be handed out again
        backend.rollback("KEY1", stale.window).await.unwrap();
        let mut allowed = 0;
        for _ in 0..5 {
            if backend.request(input(2)).await.unwrap().0.is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 0);
        assert_eq!(backend.map.get("KEY1").unwrap().count, 2);
    }

    #[actix_web::test]
    async fn test_window_is_stable_within_interval() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        let (_, first) = backend.request(input(3)).await.unwrap();
        let (_, second) = backend.request(input(3)).await.unwrap();
        assert_eq!(first.window, second.window);
        let peeked = backend.peek("KEY1", 3).await.unwrap().unwrap();
        assert_eq!(peeked.window, first.window);
    }

    #[actix_web::test]
    async fn test_peek() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        assert!(backend.peek("KEY1", 3).await.unwrap().is_none());
        backend.request(input(3)).await.unwrap();
        let status = backend.peek("KEY1", 3).await.unwrap().unwrap();
        assert_eq!(status.remaining, 2);
        // Peeking does not count an attempt
        let status = backend.peek("KEY1", 3).await.unwrap().unwrap();
        assert_eq!(status.remaining, 2);
        tokio::time::advance(MINUTE).await;
        assert!(backend.peek("KEY1", 3).await.unwrap().is_none());
    }

    #[actix_web::test]
    async fn test_remove_key() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        let (decision, _) = backend.request(input(1)).await.unwrap();
        assert!(decision.is_allowed());
        let (decision, _) = backend.request(input(1)).await.unwrap();
        assert!(decision.is_denied());
        backend.remove_key("KEY1").await.unwrap();
        // Counter should have been reset
        let (decision, _) = backend.request(input(1)).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[actix_web::test]
    async fn test_interval_overflow() {
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        let result = backend
            .request(WindowInput {
                interval: Duration::MAX,
                max_requests: 1,
                key: "KEY1".to_string(),
            })
            .await;
        assert!(matches!(result, Err(Error::IntervalOverflow(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_requests_admit_exactly_max() {
        let backend = InMemoryBackend::builder().with_gc_interval(None).build();
        let allowed = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(64));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let backend = backend.clone();
                let allowed = allowed.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    let (decision, _) = backend.request(input(10)).await.unwrap();
                    if decision.is_allowed() {
                        allowed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(allowed.load(Ordering::SeqCst), 10);
        assert_eq!(backend.map.get("KEY1").unwrap().count, 10);
    }
}

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use switchyard_messaging::Envelope;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Clone, Debug)]
struct CachedReply {
    timestamp: Instant,
    envelope: Envelope,
}

#[derive(Debug)]
struct Inner {
    entries: DashMap<String, CachedReply>,
    retention: Duration,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl Inner {
    fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, reply| reply.timestamp.elapsed() < self.retention);
        before.saturating_sub(self.entries.len())
    }
}

/// Recent replies keyed by correlation ID, so retried requests can be
/// answered without running the worker again.
///
/// Entries expire after the retention window; a background task purges them
/// every sweep interval and lookups ignore expired entries in between.
#[derive(Clone, Debug)]
pub struct ReplyCache {
    inner: Arc<Inner>,
}

impl ReplyCache {
    /// Creates a cache and starts its sweeper. Must be called inside a Tokio
    /// runtime.
    #[must_use]
    pub fn new(retention: Duration, sweep_interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            entries: DashMap::new(),
            retention,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        });

        Self::spawn_sweeper(&inner, sweep_interval);

        Self { inner }
    }

    fn spawn_sweeper(inner: &Arc<Inner>, sweep_interval: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let shutdown_token = inner.shutdown_token.clone();

        inner.task_tracker.spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = shutdown_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let purged = inner.sweep();
                        if purged > 0 {
                            debug!(purged, "swept expired replies");
                        }
                    }
                }
            }
        });
    }

    /// Caches a reply.
    pub fn put(&self, correlation_id: impl Into<String>, envelope: Envelope) {
        self.inner.entries.insert(
            correlation_id.into(),
            CachedReply {
                timestamp: Instant::now(),
                envelope,
            },
        );
    }

    /// Gets a cached reply that has not expired.
    #[must_use]
    pub fn get(&self, correlation_id: &str) -> Option<Envelope> {
        self.inner
            .entries
            .get(correlation_id)
            .filter(|reply| reply.timestamp.elapsed() < self.inner.retention)
            .map(|reply| reply.envelope.clone())
    }

    /// Number of entries, expired or not, still held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Removes expired entries now and returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Stops the sweeper and drops every entry.
    pub async fn stop(&self) {
        self.inner.shutdown_token.cancel();
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;
        self.inner.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETENTION: Duration = Duration::from_secs(20);
    const SWEEP: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_entry_is_served_until_retention_elapses() {
        let cache = ReplyCache::new(RETENTION, SWEEP);
        cache.put("c-1", Envelope::text("pong"));

        tokio::time::sleep(RETENTION - Duration::from_millis(1)).await;
        assert_eq!(
            cache.get("c-1").and_then(|reply| reply.body_text().map(str::to_string)),
            Some("pong".to_string())
        );

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(cache.get("c-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_entries() {
        let cache = ReplyCache::new(RETENTION, SWEEP);
        cache.put("c-1", Envelope::text("pong"));

        tokio::time::sleep(RETENTION + SWEEP + Duration::from_millis(1)).await;

        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sweep_keeps_fresh_entries() {
        let cache = ReplyCache::new(RETENTION, Duration::from_secs(3600));
        cache.put("old", Envelope::text("a"));
        tokio::time::sleep(RETENTION).await;
        cache.put("new", Envelope::text("b"));

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("new").is_some());
    }

    #[tokio::test]
    async fn test_stop_clears_entries() {
        let cache = ReplyCache::new(RETENTION, SWEEP);
        cache.put("c-1", Envelope::text("pong"));

        cache.stop().await;

        assert!(cache.is_empty());
    }
}

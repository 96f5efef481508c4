//! Background revalidation of stale pages.
//!
//! At most one re-render runs per key. Membership is held by a
//! [`RevalidationGuard`] owned by the spawned task, so the key is released
//! exactly once however the task ends: success, failure, or abort during
//! shutdown.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use super::error::RenderError;
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::store::{CacheEntry, CacheStore, RenderSequence, StoreWrite};

const SOURCE: &str = "cache::revalidate";
const METRIC_REVALIDATE_STARTED: &str = "rendercache_revalidate_started_total";
const METRIC_REVALIDATE_FAILED: &str = "rendercache_revalidate_failed_total";
const METRIC_PAGE_EVICT: &str = "rendercache_page_evict_total";

type Settled = Shared<BoxFuture<'static, ()>>;

/// Outcome of draining background work at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub aborted: usize,
}

/// Releases a key from the in-flight set when the owning task ends.
struct RevalidationGuard {
    key: CacheKey,
    in_flight: Arc<DashMap<CacheKey, Settled>>,
    _done: oneshot::Sender<()>,
}

impl Drop for RevalidationGuard {
    fn drop(&mut self) {
        // Removal happens before `_done` is dropped, so `settled` waiters
        // never observe the key still registered.
        self.in_flight.remove(&self.key);
    }
}

pub struct RevalidationCoordinator {
    store: Arc<dyn CacheStore<CacheEntry>>,
    sequence: RenderSequence,
    in_flight: Arc<DashMap<CacheKey, Settled>>,
    failures: Arc<DashMap<CacheKey, Instant>>,
    cooldown: Duration,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl RevalidationCoordinator {
    /// `sequence` must be the one every other writer of `store` draws from.
    pub fn new(
        store: Arc<dyn CacheStore<CacheEntry>>,
        sequence: RenderSequence,
        cooldown: Duration,
    ) -> Self {
        Self {
            store,
            sequence,
            in_flight: Arc::new(DashMap::new()),
            failures: Arc::new(DashMap::new()),
            cooldown,
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Schedule `render` as the background refresh for `key`.
    ///
    /// Returns `false` without polling `render` when the key is already being
    /// revalidated, a recent failure is still cooling down, or the
    /// coordinator has been shut down. Must be called within a tokio runtime.
    pub fn trigger<F>(&self, key: CacheKey, render: F) -> bool
    where
        F: Future<Output = Result<Bytes, RenderError>> + Send + 'static,
    {
        self.prune_failures();
        if self.cooling_down(&key) {
            debug!(key = %key, "revalidation suppressed by failure cooldown");
            return false;
        }

        let mut slot = mutex_lock(&self.tasks, SOURCE, "trigger");
        let Some(tasks) = slot.as_mut() else {
            debug!(key = %key, "revalidation rejected after shutdown");
            return false;
        };
        while tasks.try_join_next().is_some() {}

        let guard = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(vacant) => {
                let (done, settled) = oneshot::channel::<()>();
                vacant.insert(
                    async move {
                        let _ = settled.await;
                    }
                    .boxed()
                    .shared(),
                );
                RevalidationGuard {
                    key: key.clone(),
                    in_flight: Arc::clone(&self.in_flight),
                    _done: done,
                }
            }
        };

        counter!(METRIC_REVALIDATE_STARTED).increment(1);
        debug!(key = %key, "revalidation scheduled");

        let store = Arc::clone(&self.store);
        let sequence = self.sequence.clone();
        let failures = Arc::clone(&self.failures);
        let cooldown = self.cooldown;
        tasks.spawn(async move {
            let _guard = guard;
            let generation = sequence.next();
            match render.await {
                Ok(bytes) => {
                    failures.remove(&key);
                    let entry = CacheEntry::new(bytes, generation);
                    match store.insert_unless(key.clone(), entry, CacheEntry::supersedes).await {
                        StoreWrite::Stored { evicted } => {
                            if let Some(evicted) = evicted {
                                counter!(METRIC_PAGE_EVICT).increment(1);
                                debug!(cache = store.name(), key = %evicted, "entry evicted");
                            }
                            debug!(key = %key, generation, "revalidation stored fresh entry");
                        }
                        StoreWrite::Kept => {
                            debug!(key = %key, generation, "revalidation result older than stored entry");
                        }
                    }
                }
                Err(err) => {
                    counter!(METRIC_REVALIDATE_FAILED).increment(1);
                    warn!(
                        key = %key,
                        error = %err,
                        "background revalidation failed; keeping stale entry"
                    );
                    if !cooldown.is_zero() {
                        failures.insert(key, Instant::now());
                    }
                }
            }
        });

        true
    }

    /// Wait for the in-flight revalidation of `key`, if any.
    pub async fn settled(&self, key: &CacheKey) {
        let pending = self.in_flight.get(key).map(|entry| entry.value().clone());
        if let Some(pending) = pending {
            pending.await;
        }
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of keys currently revalidating.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Forget recorded failures for `key` so the next stale hit retries.
    pub fn clear_failure(&self, key: &CacheKey) {
        self.failures.remove(key);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    /// Stop accepting work and wait up to `grace` for outstanding tasks.
    ///
    /// Tasks still running after `grace` are aborted. Calling this more than
    /// once returns an empty report.
    pub async fn shutdown(&self, grace: Duration) -> DrainReport {
        let taken = mutex_lock(&self.tasks, SOURCE, "shutdown").take();
        let Some(mut tasks) = taken else {
            return DrainReport::default();
        };

        let mut report = DrainReport::default();
        let pending = tasks.len();
        let drained = timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    warn!(error = %err, "revalidation task ended abnormally");
                }
                report.completed += 1;
            }
        })
        .await;

        if drained.is_err() {
            report.aborted = tasks.len();
            tasks.shutdown().await;
        }

        info!(
            pending,
            completed = report.completed,
            aborted = report.aborted,
            grace_ms = grace.as_millis() as u64,
            "revalidation drain finished"
        );
        report
    }

    /// Forget failures whose cooldown has elapsed.
    fn prune_failures(&self) {
        if self.failures.is_empty() {
            return;
        }
        let cooldown = self.cooldown;
        self.failures.retain(|_, failed_at| failed_at.elapsed() < cooldown);
    }

    fn cooling_down(&self, key: &CacheKey) -> bool {
        if self.cooldown.is_zero() {
            return false;
        }
        let failed_at = self.failures.get(key).map(|entry| *entry.value());
        failed_at.is_some_and(|failed_at| failed_at.elapsed() < self.cooldown)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::config::Capacity;
    use crate::cache::store::MemoryStore;

    fn coordinator(cooldown: Duration) -> (RevalidationCoordinator, Arc<MemoryStore<CacheEntry>>) {
        let store = Arc::new(MemoryStore::new("page", Capacity::Unbounded));
        let coordinator =
            RevalidationCoordinator::new(store.clone(), RenderSequence::new(), cooldown);
        (coordinator, store)
    }

    #[tokio::test]
    async fn second_trigger_for_same_key_is_a_no_op() {
        let (coordinator, store) = coordinator(Duration::ZERO);
        let key = CacheKey::from_path("/posts/a");
        let runs = Arc::new(AtomicUsize::new(0));

        let first = {
            let runs = Arc::clone(&runs);
            coordinator.trigger(key.clone(), async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok::<_, RenderError>(Bytes::from_static(b"v2"))
            })
        };
        let second = {
            let runs = Arc::clone(&runs);
            coordinator.trigger(key.clone(), async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RenderError>(Bytes::from_static(b"v3"))
            })
        };

        assert!(first);
        assert!(!second);
        assert_eq!(coordinator.in_flight(), 1);

        coordinator.settled(&key).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.in_flight(), 0);
        let stored = store.get(&key).await.expect("entry stored");
        assert_eq!(stored.bytes(), &Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn distinct_keys_revalidate_independently() {
        let (coordinator, store) = coordinator(Duration::ZERO);

        for path in ["/a", "/b", "/c"] {
            assert!(coordinator.trigger(CacheKey::from_path(path), async {
                tokio::task::yield_now().await;
                Ok::<_, RenderError>(Bytes::from_static(b"fresh"))
            }));
        }
        assert_eq!(coordinator.in_flight(), 3);

        let report = coordinator.shutdown(Duration::from_secs(5)).await;
        assert_eq!(
            report,
            DrainReport {
                completed: 3,
                aborted: 0
            }
        );
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn failure_keeps_existing_entry_and_releases_key() {
        let (coordinator, store) = coordinator(Duration::ZERO);
        let key = CacheKey::from_path("/posts/a");
        store
            .insert(key.clone(), CacheEntry::new(Bytes::from_static(b"v1"), 0))
            .await;

        assert!(
            coordinator.trigger(key.clone(), async { Err::<Bytes, _>(RenderError::failed("db down")) })
        );
        coordinator.settled(&key).await;

        assert!(!coordinator.is_in_flight(&key));
        let stored = store.get(&key).await.expect("stale entry kept");
        assert_eq!(stored.bytes(), &Bytes::from_static(b"v1"));

        // Without a cooldown the very next stale hit may retry.
        assert!(coordinator.trigger(key.clone(), async { Ok::<_, RenderError>(Bytes::from_static(b"v2")) }));
        coordinator.settled(&key).await;
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_retries_until_it_elapses() {
        let (coordinator, _store) = coordinator(Duration::from_secs(30));
        let key = CacheKey::from_path("/flaky");

        assert!(coordinator.trigger(key.clone(), async { Err::<Bytes, _>(RenderError::failed("boom")) }));
        coordinator.settled(&key).await;

        assert!(!coordinator.trigger(key.clone(), async { Ok::<_, RenderError>(Bytes::new()) }));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(coordinator.trigger(key.clone(), async { Ok::<_, RenderError>(Bytes::new()) }));
        coordinator.settled(&key).await;
    }

    #[tokio::test(start_paused = true)]
    async fn expired_failures_are_forgotten() {
        let (coordinator, _store) = coordinator(Duration::from_secs(30));

        for index in 0..50 {
            let key = CacheKey::from_path(&format!("/gone/{index}"));
            assert!(coordinator.trigger(key.clone(), async { Err::<Bytes, _>(RenderError::failed("boom")) }));
            coordinator.settled(&key).await;
        }
        assert_eq!(coordinator.failures.len(), 50);

        tokio::time::advance(Duration::from_secs(10)).await;
        let recent = CacheKey::from_path("/recent");
        assert!(coordinator.trigger(recent.clone(), async { Err::<Bytes, _>(RenderError::failed("boom")) }));
        coordinator.settled(&recent).await;
        assert_eq!(coordinator.failures.len(), 51);

        tokio::time::advance(Duration::from_secs(21)).await;
        let other = CacheKey::from_path("/other");
        assert!(coordinator.trigger(other.clone(), async { Ok::<_, RenderError>(Bytes::new()) }));
        coordinator.settled(&other).await;

        assert_eq!(coordinator.failures.len(), 1);
        assert!(coordinator.failures.contains_key(&recent));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_tasks_that_outlive_grace() {
        let (coordinator, store) = coordinator(Duration::ZERO);
        let slow = CacheKey::from_path("/slow");
        let quick = CacheKey::from_path("/quick");

        assert!(coordinator.trigger(slow.clone(), async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok::<_, RenderError>(Bytes::from_static(b"late"))
        }));
        assert!(coordinator.trigger(quick.clone(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, RenderError>(Bytes::from_static(b"quick"))
        }));

        let report = coordinator.shutdown(Duration::from_secs(1)).await;
        assert_eq!(
            report,
            DrainReport {
                completed: 1,
                aborted: 1
            }
        );
        assert!(store.get(&quick).await.is_some());
        assert!(store.get(&slow).await.is_none());
        assert_eq!(coordinator.in_flight(), 0);

        assert!(!coordinator.trigger(quick, async { Ok::<_, RenderError>(Bytes::new()) }));
        assert_eq!(
            coordinator.shutdown(Duration::from_secs(1)).await,
            DrainReport::default()
        );
    }
}

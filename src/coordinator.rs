//! Request coalescing in front of the render worker.
//!
//! [`Coordinator::request_render`] is the trigger: the first caller for a key
//! reserves a pending cache entry, submits one task and later publishes the
//! result; every other caller finds the entry and returns at once.
//! [`Coordinator::await_render`] is the fetch: it parks until the entry for a
//! key is ready. Calling the trigger early and the fetch late lets the browser
//! render overlap the backend round-trip.

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use url::Url;

use crate::cache::{
    CacheEntry, RenderCache, RenderedPage, RequestKey, Reservation, DEFAULT_CACHE_TTL,
};
use crate::preview::SiteProfile;
use crate::route::Route;
use crate::worker::{RenderTask, RenderWorker, RenderedFragment, WorkerOptions};
use crate::{Engine, Error, Result};

/// Tunables for the render pipeline.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub worker: WorkerOptions,
    /// Lifetime of a cache entry from insertion.
    pub cache_ttl: Duration,
    /// How often expired entries are swept; `None` relies on lookup expiry only.
    pub sweep_interval: Option<Duration>,
    /// Upper bound on waiting for a submitted task's outcome.
    pub result_timeout: Duration,
}

impl CoordinatorOptions {
    /// Worst case for a task that just entered a full queue: every task ahead
    /// of it plus itself spends its whole budget.
    pub fn default_result_timeout(worker: &WorkerOptions) -> Duration {
        let slots = worker.queue_capacity.max(1) as u32 + 1;
        worker.task_timeout.saturating_mul(slots)
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        let worker = WorkerOptions::default();
        Self {
            result_timeout: Self::default_result_timeout(&worker),
            worker,
            cache_ttl: DEFAULT_CACHE_TTL,
            sweep_interval: Some(DEFAULT_CACHE_TTL),
        }
    }
}

/// Publishes an empty page if the owner of a reservation goes away without
/// publishing, so waiters are never stranded.
struct ReleaseOnDrop(CacheEntry);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if self.0.publish(RenderedPage::default()) {
            warn!("Render abandoned before completion; released waiters with an empty page");
        }
    }
}

/// Owns the cache and the render worker.
#[derive(Debug)]
pub struct Coordinator {
    cache: RenderCache,
    worker: RenderWorker,
    profile: SiteProfile,
    result_timeout: Duration,
    sweeper: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Spawns the render worker with an engine built by `factory` and wraps
    /// it in a coordinator.
    pub async fn start<E, F>(
        factory: F,
        profile: SiteProfile,
        options: CoordinatorOptions,
    ) -> Result<Self>
    where
        E: Engine + 'static,
        F: FnOnce() -> Result<E> + Send + 'static,
    {
        let worker = RenderWorker::spawn(factory, options.worker.clone()).await?;
        Ok(Self::new(worker, profile, options))
    }

    /// Must be called from within a tokio runtime when a sweep interval is set.
    pub fn new(worker: RenderWorker, profile: SiteProfile, options: CoordinatorOptions) -> Self {
        let cache = RenderCache::new(options.cache_ttl);
        let sweeper = options
            .sweep_interval
            .map(|every| spawn_sweeper(cache.clone(), every));
        Self {
            cache,
            worker,
            profile,
            result_timeout: options.result_timeout,
            sweeper,
        }
    }

    pub fn cache(&self) -> &RenderCache {
        &self.cache
    }

    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }

    /// Renders `target` for `key` unless a render for `key` is cached or in
    /// flight, then publishes the result to everyone awaiting `key`.
    ///
    /// Completes after the render is published (or immediately for a hit).
    /// Suspends while the worker queue is full.
    pub async fn request_render(&self, key: RequestKey, target: Url, route: Arc<Route>) {
        match self.cache.reserve(&key) {
            Reservation::Existing(_) => {
                debug!("Render for {} already cached or in flight", key);
            }
            Reservation::Reserved(entry) => self.complete(entry, key, target, route).await,
        }
    }

    /// Like [`request_render`](Self::request_render), but returns as soon as
    /// the cache entry is reserved and runs the render on a spawned task.
    ///
    /// A subsequent [`await_render`](Self::await_render) for `key` is
    /// therefore guaranteed to find the entry.
    pub fn trigger_render(self: &Arc<Self>, key: RequestKey, target: Url, route: Arc<Route>) {
        if let Reservation::Reserved(entry) = self.cache.reserve(&key) {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.complete(entry, key, target, route).await;
            });
        }
    }

    /// Returns `None` at once if `key` was never requested (or expired);
    /// otherwise waits until its render is published.
    ///
    /// Failed renders yield an empty [`RenderedPage`], never an error.
    pub async fn await_render(&self, key: &RequestKey) -> Option<RenderedPage> {
        self.cache.await_ready(key).await
    }

    async fn complete(&self, entry: CacheEntry, key: RequestKey, target: Url, route: Arc<Route>) {
        let guard = ReleaseOnDrop(entry);
        let page = match self.render(&key, target, route).await {
            Ok(fragment) => self.profile.finish(&key, fragment, OffsetDateTime::now_utc()),
            Err(err) => {
                warn!("Serving {} without render: {}", key, err);
                RenderedPage::default()
            }
        };
        guard.0.publish(page);
    }

    async fn render(
        &self,
        key: &RequestKey,
        target: Url,
        route: Arc<Route>,
    ) -> Result<RenderedFragment> {
        let (task, outcome) = RenderTask::new(key.clone(), target, route);
        self.worker.submit(task).await?;
        match tokio::time::timeout(self.result_timeout, outcome).await {
            Ok(Ok(outcome)) => outcome,
            // worker dropped the task without resolving it
            Ok(Err(_)) => Err(Error::WorkerClosed),
            Err(_) => Err(Error::timeout(self.result_timeout)),
        }
    }

    /// Stops the sweeper, closes the task queue and joins the worker.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        self.worker.shutdown().await
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

fn spawn_sweeper(cache: RenderCache, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.purge_expired();
            if removed > 0 {
                debug!("Swept {} expired render(s)", removed);
            }
        }
    })
}

//! Time-bounded render cache with single-flight reservation.
//!
//! Every request key maps to a [`CacheEntry`] whose content is published
//! exactly once. Entries are inserted *before* their render completes, so a
//! pending entry doubles as the "render in flight" marker that keeps a second
//! caller from enqueuing the same page.
//!
//! Reservation goes through [`DashMap::entry`], which only locks the shard
//! owning the key: lookups and reservations for unrelated keys never wait on
//! each other.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use url::Url;

use crate::{Error, Result};

/// Default lifetime of a cache entry, measured from insertion.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Canonical identity of a renderable page.
///
/// Derived from the URL the client asked for (scheme, host, port, path and
/// query), never from the rewritten backend URL. The fragment is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn from_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(url.into())
    }

    /// Parses and canonicalizes a URL string.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| Error::Other(format!("Invalid request URL {}: {}", raw, e)))?;
        Ok(Self::from_url(&url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Final content of a render: the fragment to splice and the preview markup.
///
/// Both fields are empty when the render failed; callers treat an empty page
/// as "serve the backend response unmodified".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedPage {
    pub inner_html: String,
    pub metadata: String,
}

impl RenderedPage {
    pub fn is_empty(&self) -> bool {
        self.inner_html.is_empty() && self.metadata.is_empty()
    }
}

/// A cached render outcome with a broadcast-once ready signal.
///
/// Clones share the same slot. [`publish`](CacheEntry::publish) stores the
/// content and wakes every task parked in [`wait`](CacheEntry::wait).
#[derive(Debug, Clone)]
pub struct CacheEntry {
    slot: Arc<watch::Sender<Option<RenderedPage>>>,
}

impl CacheEntry {
    /// A pending entry: empty and not ready.
    pub fn pending() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// An entry that is already ready with `page`.
    pub fn ready(page: RenderedPage) -> Self {
        let (slot, _) = watch::channel(Some(page));
        Self {
            slot: Arc::new(slot),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Content of the entry, `None` while the render is still pending.
    pub fn page(&self) -> Option<RenderedPage> {
        self.slot.borrow().clone()
    }

    /// Stores `page` and fires the ready signal.
    ///
    /// First writer wins: returns `false` and leaves the entry untouched if it
    /// was already published.
    pub fn publish(&self, page: RenderedPage) -> bool {
        self.slot.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(page);
            true
        })
    }

    /// Suspends until the entry is ready and returns its content.
    pub async fn wait(&self) -> RenderedPage {
        let mut ready = self.slot.subscribe();
        let page = match ready.wait_for(Option::is_some).await {
            Ok(page) => (*page).clone(),
            Err(_) => None,
        };
        page.unwrap_or_default()
    }
}

/// Outcome of [`RenderCache::reserve`].
#[derive(Debug, Clone)]
pub enum Reservation {
    /// A live entry (pending or ready) already exists for the key.
    Existing(CacheEntry),
    /// A fresh pending entry was inserted; the caller owns its render.
    Reserved(CacheEntry),
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    inserted_at: Instant,
}

impl Slot {
    fn new(entry: CacheEntry) -> Self {
        Self {
            entry,
            inserted_at: Instant::now(),
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) >= ttl
    }
}

/// Shared, concurrent map from request key to render outcome.
#[derive(Debug, Clone)]
pub struct RenderCache {
    entries: Arc<DashMap<RequestKey, Slot>>,
    ttl: Duration,
}

impl Default for RenderCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl RenderCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the live entry for `key`, or `None` if absent or expired.
    ///
    /// Reading never extends an entry's lifetime.
    pub fn get(&self, key: &RequestKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let (entry, expired) = {
            let slot = self.entries.get(key)?;
            (slot.entry.clone(), slot.is_expired(now, self.ttl))
        };

        if expired {
            self.entries
                .remove_if(key, |_, slot| slot.is_expired(now, self.ttl));
            return None;
        }

        Some(entry)
    }

    /// Inserts or replaces the entry for `key`, restarting its expiry clock.
    pub fn put(&self, key: RequestKey, entry: CacheEntry) {
        self.entries.insert(key, Slot::new(entry));
    }

    /// Atomically returns the live entry for `key` or inserts a pending one.
    ///
    /// Only the shard holding `key` is locked, and only for the duration of
    /// the check-and-insert.
    pub fn reserve(&self, key: &RequestKey) -> Reservation {
        let now = Instant::now();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now, self.ttl) {
                    let entry = CacheEntry::pending();
                    occupied.insert(Slot::new(entry.clone()));
                    Reservation::Reserved(entry)
                } else {
                    Reservation::Existing(occupied.get().entry.clone())
                }
            }
            Entry::Vacant(vacant) => {
                let entry = CacheEntry::pending();
                vacant.insert(Slot::new(entry.clone()));
                Reservation::Reserved(entry)
            }
        }
    }

    /// Returns `None` at once if `key` has no live entry; otherwise waits for
    /// the entry's ready signal and returns its content.
    pub async fn await_ready(&self, key: &RequestKey) -> Option<RenderedPage> {
        let entry = self.get(key)?;
        Some(entry.wait().await)
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, slot| {
            let keep = !slot.is_expired(now, self.ttl);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> RequestKey {
        RequestKey::parse(&format!("http://example.com{}", path)).unwrap()
    }

    fn page(html: &str) -> RenderedPage {
        RenderedPage {
            inner_html: html.to_string(),
            metadata: String::new(),
        }
    }

    #[test]
    fn request_key_drops_fragment_and_keeps_query() {
        let key = RequestKey::parse("http://Example.com:8080/posts/1?lang=en#top").unwrap();
        assert_eq!(key.as_str(), "http://example.com:8080/posts/1?lang=en");
    }

    #[test]
    fn get_returns_none_for_missing_key() {
        let cache = RenderCache::default();
        assert!(cache.get(&key("/missing")).is_none());
    }

    #[test]
    fn put_then_get_returns_entry() {
        let cache = RenderCache::default();
        cache.put(key("/a"), CacheEntry::ready(page("<p>a</p>")));
        let entry = cache.get(&key("/a")).expect("entry");
        assert!(entry.is_ready());
        assert_eq!(entry.page().unwrap().inner_html, "<p>a</p>");
    }

    #[test]
    fn reserve_inserts_once_then_reports_existing() {
        let cache = RenderCache::default();
        let first = cache.reserve(&key("/a"));
        let second = cache.reserve(&key("/a"));

        let reserved = match first {
            Reservation::Reserved(entry) => entry,
            Reservation::Existing(_) => panic!("first reservation should insert"),
        };
        let existing = match second {
            Reservation::Existing(entry) => entry,
            Reservation::Reserved(_) => panic!("second reservation should reuse"),
        };

        assert!(!existing.is_ready());
        reserved.publish(page("done"));
        assert_eq!(existing.page().unwrap().inner_html, "done");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn publish_is_first_writer_wins() {
        let entry = CacheEntry::pending();
        assert!(entry.publish(page("first")));
        assert!(!entry.publish(page("second")));
        assert_eq!(entry.page().unwrap().inner_html, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = RenderCache::new(Duration::from_secs(60));
        cache.put(key("/a"), CacheEntry::ready(page("a")));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get(&key("/a")).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(&key("/a")).is_none());
        assert!(cache.await_ready(&key("/a")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn get_does_not_extend_lifetime_but_put_does() {
        let cache = RenderCache::new(Duration::from_secs(10));
        cache.put(key("/read"), CacheEntry::ready(page("r")));
        cache.put(key("/write"), CacheEntry::ready(page("w")));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&key("/read")).is_some());
        cache.put(key("/write"), CacheEntry::ready(page("w2")));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&key("/read")).is_none());
        assert_eq!(
            cache.get(&key("/write")).unwrap().page().unwrap().inner_html,
            "w2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_can_be_reserved_again() {
        let cache = RenderCache::new(Duration::from_secs(5));
        assert!(matches!(cache.reserve(&key("/a")), Reservation::Reserved(_)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(cache.reserve(&key("/a")), Reservation::Reserved(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired_entries() {
        let cache = RenderCache::new(Duration::from_secs(5));
        cache.put(key("/old"), CacheEntry::ready(page("old")));
        tokio::time::advance(Duration::from_secs(3)).await;
        cache.put(key("/new"), CacheEntry::ready(page("new")));
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("/new")).is_some());
    }

    #[tokio::test]
    async fn await_ready_returns_none_without_entry() {
        let cache = RenderCache::default();
        assert!(cache.await_ready(&key("/none")).await.is_none());
    }

    #[tokio::test]
    async fn await_ready_wakes_every_waiter() {
        let cache = RenderCache::default();
        let entry = match cache.reserve(&key("/a")) {
            Reservation::Reserved(entry) => entry,
            Reservation::Existing(_) => unreachable!(),
        };

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.await_ready(&key("/a")).await })
            })
            .collect();

        tokio::task::yield_now().await;
        entry.publish(page("shared"));

        for waiter in waiters {
            let result = waiter.await.unwrap().expect("entry present");
            assert_eq!(result.inner_html, "shared");
        }
    }
}

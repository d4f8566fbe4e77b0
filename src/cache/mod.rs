//! In-process caches for rendered pages and prerendered shells.
//!
//! - [`PageCache`] holds full documents for SSG and ISR routes, with the render
//!   time needed for ISR staleness and the set of keys currently being
//!   revalidated in the background.
//! - [`ShellCache`] holds one prerendered PPR shell per key.
//! - [`hydration::HydrationModuleCache`] holds transpiled client modules.
//!
//! All three are keyed by [`cache_key`] and safe to share across tasks.

pub mod hydration;

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::time::Instant;

use crate::context::Params;

/// Cache key for a route and its params: `{route id}?{name=value&...}` in
/// pattern order, or just the id for a parameterless route.
///
/// # Examples
///
/// ```
/// use islet::cache::cache_key;
/// use islet::context::Params;
///
/// let params: Params = [("slug", "hello")].into_iter().collect();
/// assert_eq!(cache_key("blog_[slug].tsx", &params), "blog_[slug].tsx?slug=hello");
/// assert_eq!(cache_key("(index).tsx", &Params::new()), "(index).tsx");
/// ```
pub fn cache_key(route_id: &str, params: &Params) -> String {
    if params.is_empty() {
        return route_id.to_owned();
    }
    let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{route_id}?{}", query.join("&"))
}

/// A document ready to be cached: its HTML, where the data payload sits in
/// it, and the loader data that payload was built from.
#[derive(Debug, Clone)]
pub struct StaticPage {
    pub html: String,
    pub payload: Range<usize>,
    pub data: Value,
}

impl StaticPage {
    /// A page with no payload to rewrite.
    pub fn plain(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            payload: 0..0,
            data: Value::Null,
        }
    }
}

/// A cached document.
///
/// The cached HTML never carries request-specific state. Per-request values
/// are spliced into the payload range with [`with_payload`](Self::with_payload).
#[derive(Debug, Clone)]
pub struct CachedPage {
    pub html: Arc<str>,
    pub payload: Range<usize>,
    pub data: Value,
    pub rendered_at: Instant,
}

impl CachedPage {
    /// `true` once the page is older than `window`. A zero window never expires.
    pub fn is_stale(&self, window: Duration, now: Instant) -> bool {
        !window.is_zero() && now.saturating_duration_since(self.rendered_at) >= window
    }

    /// The document with its payload replaced by `payload`.
    pub fn with_payload(&self, payload: &str) -> String {
        let Range { start, end } = self.payload.clone();
        format!("{}{payload}{}", &self.html[..start], &self.html[end..])
    }
}

#[derive(Debug, Default)]
struct PageCacheInner {
    pages: DashMap<String, CachedPage>,
    revalidating: DashSet<String>,
}

/// Rendered documents for SSG and ISR routes. Cloning shares the cache.
#[derive(Debug, Clone, Default)]
pub struct PageCache {
    inner: Arc<PageCacheInner>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<CachedPage> {
        self.inner.pages.get(key).map(|entry| entry.value().clone())
    }

    /// Stores `page` as rendered now.
    pub fn insert(&self, key: impl Into<String>, page: StaticPage) -> CachedPage {
        let page = CachedPage {
            html: page.html.into(),
            payload: page.payload,
            data: page.data,
            rendered_at: Instant::now(),
        };
        self.inner.pages.insert(key.into(), page.clone());
        page
    }

    pub fn remove(&self, key: &str) -> Option<CachedPage> {
        self.inner.pages.remove(key).map(|(_, page)| page)
    }

    pub fn clear(&self) {
        self.inner.pages.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pages.is_empty()
    }

    /// Claims the background revalidation slot for `key`.
    ///
    /// Returns `None` while another revalidation of the same key is in flight.
    /// The slot is released when the returned guard drops.
    pub fn begin_revalidation(&self, key: &str) -> Option<RevalidationGuard> {
        if !self.inner.revalidating.insert(key.to_owned()) {
            return None;
        }
        Some(RevalidationGuard {
            cache: self.clone(),
            key: key.to_owned(),
        })
    }

    pub fn is_revalidating(&self, key: &str) -> bool {
        self.inner.revalidating.contains(key)
    }
}

/// Holds a revalidation slot; see [`PageCache::begin_revalidation`].
#[derive(Debug)]
pub struct RevalidationGuard {
    cache: PageCache,
    key: String,
}

impl RevalidationGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RevalidationGuard {
    fn drop(&mut self) {
        self.cache.inner.revalidating.remove(&self.key);
    }
}

/// Prerendered PPR shells by key.
#[derive(Debug)]
pub struct ShellCache<T> {
    shells: DashMap<String, Arc<T>>,
}

impl<T> Default for ShellCache<T> {
    fn default() -> Self {
        Self {
            shells: DashMap::new(),
        }
    }
}

impl<T> ShellCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.shells.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Stores `shell` unless another task stored one first; returns the winner.
    pub fn insert(&self, key: impl Into<String>, shell: T) -> Arc<T> {
        let entry = self.shells.entry(key.into()).or_insert_with(|| Arc::new(shell));
        Arc::clone(entry.value())
    }

    pub fn clear(&self) {
        self.shells.clear();
    }

    pub fn len(&self) -> usize {
        self.shells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shells.is_empty()
    }
}

//! Cache layer that runs the caching strategies around a network fetcher.

use color_eyre::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::{CacheStorage, CachedResponse};
use super::traits::{should_store, CacheResult, Request, Response};

/// Cache layer that manages caching strategies and store writes.
///
/// Writes triggered by a fetch are detached: the response is handed back to
/// the caller without waiting for the store to accept it. A failed write is
/// logged and otherwise ignored, the stores are read-through caches.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// Stores a fallback lookup may consult after the strategy's own store
  fallback: Vec<String>,
  pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  /// Create a new cache layer over the given storage backend.
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      fallback: Vec::new(),
      pending: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Let offline fallbacks also search these stores, in order. Any store not
  /// listed here (or passed to the strategy) is never read by a fallback.
  pub fn with_fallback_stores(mut self, stores: Vec<String>) -> Self {
    self.fallback = stores;
    self
  }

  #[cfg(test)]
  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Network-first with store fallback.
  ///
  /// 1. Fetch from network; on success store a copy (if eligible) and return it
  /// 2. On network failure, return the best stored match
  /// 3. With no stored match, the fetch error propagates
  pub async fn network_first<F, Fut>(
    &self,
    store: &str,
    request: &Request,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match fetcher().await {
      Ok(response) => {
        self.store_detached(store, request, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        debug!(url = %request.url(), error = %err, "Network failed, trying stores");
        match self.lookup_fallback(store, request) {
          Some(cached) => Ok(CacheResult::offline(cached.response, cached.cached_at)),
          None => Err(err.wrap_err(format!("No stored response for {}", request.url()))),
        }
      }
    }
  }

  /// Cache-first: a stored response is returned without touching the network.
  ///
  /// On a miss the network is consulted and its failure propagates.
  pub async fn cache_first<F, Fut>(
    &self,
    store: &str,
    request: &Request,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match self.storage.get(store, request) {
      Ok(Some(cached)) => return Ok(CacheResult::from_cache(cached.response, cached.cached_at)),
      Ok(None) => {}
      Err(e) => warn!(store, url = %request.url(), error = %e, "Store lookup failed"),
    }

    let response = fetcher().await?;
    self.store_detached(store, request, &response);
    Ok(CacheResult::from_network(response))
  }

  /// Network-first, then stores, then a synthesized 503. Never fails.
  pub async fn network_first_or_placeholder<F, Fut>(
    &self,
    store: &str,
    request: &Request,
    fetcher: F,
  ) -> CacheResult<Response>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match self.network_first(store, request, fetcher).await {
      Ok(result) => result,
      Err(err) => {
        debug!(url = %request.url(), error = %err, "Serving offline placeholder");
        CacheResult::placeholder(Response::placeholder())
      }
    }
  }

  /// Wait for every detached write spawned so far.
  pub async fn settle(&self) {
    let handles = match self.pending.lock() {
      Ok(mut pending) => std::mem::take(&mut *pending),
      Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };

    for result in futures::future::join_all(handles).await {
      if let Err(e) = result {
        warn!(error = %e, "Store write task did not complete");
      }
    }
  }

  /// Store lookup for the fallback paths: the strategy's own store, then the
  /// fallback stores. Read errors count as a miss.
  fn lookup_fallback(&self, store: &str, request: &Request) -> Option<CachedResponse> {
    let mut stores = vec![store];
    stores.extend(
      self
        .fallback
        .iter()
        .map(String::as_str)
        .filter(|name| *name != store),
    );

    match self.storage.match_in(&stores, request) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(store, url = %request.url(), error = %e, "Store lookup failed");
        None
      }
    }
  }

  /// Spawn a write of a copy of `response` if it passes the write policy.
  fn store_detached(&self, store: &str, request: &Request, response: &Response) {
    if !should_store(request, response) {
      debug!(
        method = request.method(),
        status = response.status,
        url = %request.url(),
        "Not caching response"
      );
      return;
    }

    let storage = Arc::clone(&self.storage);
    let store = store.to_string();
    let request = request.clone();
    let response = response.clone();

    let handle = tokio::task::spawn_blocking(move || {
      if let Err(e) = storage.put(&store, &request, &response) {
        warn!(store = %store, url = %request.url(), error = %e, "Failed to store response");
      }
    });

    let mut pending = match self.pending.lock() {
      Ok(pending) => pending,
      Err(poisoned) => poisoned.into_inner(),
    };
    pending.retain(|h| !h.is_finished());
    pending.push(handle);
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fallback: self.fallback.clone(),
      pending: Arc::clone(&self.pending),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{MemoryStorage, StoreSummary};
  use crate::cache::traits::{CacheSource, PLACEHOLDER_BODY};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};

  /// Reads work, every write is rejected.
  struct ReadOnlyStorage {
    inner: MemoryStorage,
    rejected: AtomicU32,
  }

  impl CacheStorage for ReadOnlyStorage {
    fn open(&self, store: &str) -> Result<()> {
      self.inner.open(store)
    }
    fn has(&self, store: &str) -> Result<bool> {
      self.inner.has(store)
    }
    fn keys(&self) -> Result<Vec<String>> {
      self.inner.keys()
    }
    fn delete(&self, store: &str) -> Result<bool> {
      self.inner.delete(store)
    }
    fn put(&self, store: &str, _request: &Request, _response: &Response) -> Result<()> {
      self.rejected.fetch_add(1, Ordering::SeqCst);
      Err(eyre!("disk full writing to {}", store))
    }
    fn get(&self, store: &str, request: &Request) -> Result<Option<CachedResponse>> {
      self.inner.get(store, request)
    }
    fn summaries(&self) -> Result<Vec<StoreSummary>> {
      self.inner.summaries()
    }
  }

  fn layer() -> CacheLayer<MemoryStorage> {
    CacheLayer::new(Arc::new(MemoryStorage::new()))
  }

  fn req(method: &str, url: &str) -> Request {
    Request::parse(method, url).unwrap()
  }

  #[tokio::test]
  async fn test_network_first_stores_and_falls_back() {
    let cache = layer();
    let request = req("GET", "https://app.test/routes.json");

    let result = cache
      .network_first("data", &request, || async { Ok(Response::ok("[1,2]")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    cache.settle().await;

    let result = cache
      .network_first("data", &request, || async { Err(eyre!("offline")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body_text(), "[1,2]");
    assert!(result.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_network_first_miss_propagates() {
    let cache = layer();
    let request = req("GET", "https://app.test/routes.json");

    let result = cache
      .network_first("data", &request, || async { Err(eyre!("offline")) })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_cache_first_skips_network_on_hit() {
    let cache = layer();
    let request = req("GET", "https://unpkg.com/leaflet@1.9.4/dist/leaflet.js");
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
      let result = cache
        .cache_first("static", &request, || async {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(Response::ok("L"))
        })
        .await
        .unwrap();
      assert_eq!(result.data.body_text(), "L");
      cache.settle().await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_propagates_network_error() {
    let cache = layer();
    let request = req("GET", "https://unpkg.com/leaflet@1.9.4/dist/leaflet.js");

    let result = cache
      .cache_first("static", &request, || async { Err(eyre!("offline")) })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_placeholder_when_everything_fails() {
    let cache = layer();
    let request = req("GET", "https://app.test/about");

    let result = cache
      .network_first_or_placeholder("static", &request, || async { Err(eyre!("offline")) })
      .await;
    assert_eq!(result.source, CacheSource::Placeholder);
    assert_eq!(result.data.status, 503);
    assert_eq!(result.data.header("Content-Type"), Some("text/plain"));
    assert_eq!(result.data.body_text(), PLACEHOLDER_BODY);
  }

  #[tokio::test]
  async fn test_ineligible_responses_are_not_stored() {
    let cache = layer();
    let not_found = req("GET", "https://app.test/missing");
    let post = req("POST", "https://app.test/submit");

    let result = cache
      .network_first("static", &not_found, || async {
        Ok(Response::new(404, "Not Found", "nope"))
      })
      .await
      .unwrap();
    assert_eq!(result.data.status, 404);

    cache
      .network_first("static", &post, || async { Ok(Response::ok("done")) })
      .await
      .unwrap();
    cache.settle().await;

    assert!(cache.storage().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_store_write_does_not_affect_response() {
    let storage = Arc::new(ReadOnlyStorage {
      inner: MemoryStorage::new(),
      rejected: AtomicU32::new(0),
    });
    let cache = CacheLayer::new(Arc::clone(&storage));
    let data = req("GET", "https://app.test/routes.json");
    let asset = req("GET", "https://unpkg.com/leaflet@1.9.4/dist/leaflet.js");

    let result = cache
      .network_first("data", &data, || async { Ok(Response::ok("[1]")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body_text(), "[1]");

    let result = cache
      .cache_first("static", &asset, || async { Ok(Response::ok("L")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body_text(), "L");

    cache.settle().await;
    assert_eq!(storage.rejected.load(Ordering::SeqCst), 2);
    assert!(storage.keys().unwrap().is_empty());

    // Nothing was kept, so the next offline request has no fallback
    let result = cache
      .network_first("data", &data, || async { Err(eyre!("offline")) })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_fallback_searches_only_listed_stores() {
    let storage = Arc::new(MemoryStorage::new());
    let request = req("GET", "https://app.test/about.html");
    storage
      .put("static-v0", &request, &Response::ok("old"))
      .unwrap();
    let cache = CacheLayer::new(Arc::clone(&storage))
      .with_fallback_stores(vec!["static-v1".to_string(), "data-v1".to_string()]);

    let result = cache
      .network_first_or_placeholder("static-v1", &request, || async { Err(eyre!("offline")) })
      .await;
    assert_eq!(result.source, CacheSource::Placeholder);

    storage
      .put("data-v1", &request, &Response::ok("current"))
      .unwrap();
    let result = cache
      .network_first_or_placeholder("static-v1", &request, || async { Err(eyre!("offline")) })
      .await;
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body_text(), "current");
  }
}

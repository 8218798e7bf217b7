//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::{CacheStorage, CachedResponse};
use super::traits::CacheResult;
use crate::request::RequestKey;
use crate::response::StoredResponse;

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the request handler and the network client.
/// Writes always go to the store named at construction (the running
/// version). Lookups try that store first, then every other store.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  store_name: String,
  /// When false, network responses are returned but never stored
  write_back: bool,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer writing into `store_name`.
  pub fn new(storage: Arc<S>, store_name: impl Into<String>) -> Self {
    Self {
      storage,
      store_name: store_name.into(),
      write_back: true,
    }
  }

  /// Enable or disable storing network responses.
  pub fn set_write_back(&mut self, enabled: bool) {
    self.write_back = enabled;
  }

  pub fn store_name(&self) -> &str {
    &self.store_name
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Network-first fetch.
  ///
  /// 1. Fetch from network; any response that arrives is stored and returned
  /// 2. If the fetch itself fails, serve the stored entry (offline mode)
  /// 3. With nothing stored, the result is `None`
  pub async fn network_first<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<Option<CacheResult<StoredResponse>>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse>>,
  {
    match fetcher().await {
      Ok(response) => {
        self.store(key, &response);
        Ok(Some(CacheResult::from_network(response)))
      }
      Err(e) => {
        debug!(request = %key, error = %e, "network failed, falling back to cache");
        let cached = self.lookup(key)?;
        if cached.is_none() {
          warn!(request = %key, "offline with no cached copy");
        }
        Ok(cached.map(|c| CacheResult::offline(c.response, c.cached_at)))
      }
    }
  }

  /// Cache-first fetch.
  ///
  /// 1. Check cache - on a hit, return without touching the network
  /// 2. On a miss, fetch from network; a network failure propagates
  /// 3. Store the response only if it is a same-origin 200
  pub async fn cache_first<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<StoredResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse>>,
  {
    if let Some(cached) = self.lookup(key)? {
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    let response = fetcher().await?;
    if response.is_cacheable_static() {
      self.store(key, &response);
    } else {
      debug!(
        request = %key,
        status = response.status,
        response_type = response.response_type.as_str(),
        "passing through uncacheable response"
      );
    }

    Ok(CacheResult::from_network(response))
  }

  /// Current store first, so a superseded version never shadows a newer entry.
  fn lookup(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    match self.storage.match_in(&self.store_name, key)? {
      Some(cached) => Ok(Some(cached)),
      None => self.storage.match_any(key),
    }
  }

  /// Write-back after a network success. Failure here never affects the caller.
  fn store(&self, key: &RequestKey, response: &StoredResponse) {
    if !self.write_back {
      debug!(request = %key, "write-back disabled, not storing");
      return;
    }
    if let Err(e) = self.storage.put(&self.store_name, key, response) {
      warn!(request = %key, error = %e, "failed to update cache");
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      store_name: self.store_name.clone(),
      write_back: self.write_back,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::response::ResponseType;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};
  use url::Url;

  fn layer() -> CacheLayer<SqliteStorage> {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    CacheLayer::new(storage, "alo-zoghal-v1")
  }

  fn key(path: &str) -> RequestKey {
    let origin = Url::parse("http://localhost:8080").unwrap();
    RequestKey::get(path, &origin).unwrap()
  }

  fn json(body: &str) -> StoredResponse {
    StoredResponse::new(200, body, ResponseType::Basic)
  }

  #[tokio::test]
  async fn test_network_first_stores_and_serves_offline() {
    let layer = layer();
    let ticker = key("/data/ticker.json");

    let fresh = layer
      .network_first(&ticker, || async { Ok(json(r#"{"messages":["a"]}"#)) })
      .await
      .unwrap()
      .unwrap();
    assert_eq!(fresh.source, CacheSource::Network);

    let offline = layer
      .network_first(&ticker, || async { Err(eyre!("offline")) })
      .await
      .unwrap()
      .unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data.text(), r#"{"messages":["a"]}"#);
    assert!(offline.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_network_first_overwrites_previous_entry() {
    let layer = layer();
    let stories = key("/data/stories.json");

    for body in ["[1]", "[1,2]"] {
      layer
        .network_first(&stories, || async move { Ok(json(body)) })
        .await
        .unwrap();
    }

    let cached = layer
      .storage()
      .match_in("alo-zoghal-v1", &stories)
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.text(), "[1,2]");
  }

  #[tokio::test]
  async fn test_network_first_caches_error_status() {
    let layer = layer();
    let missing = key("/data/missing.json");

    let result = layer
      .network_first(&missing, || async {
        Ok(StoredResponse::new(404, "", ResponseType::Basic))
      })
      .await
      .unwrap()
      .unwrap();
    assert_eq!(result.data.status, 404);
    assert!(layer.storage().match_any(&missing).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_network_first_offline_without_entry_is_none() {
    let layer = layer();
    let result = layer
      .network_first(&key("/data/vip-ads.json"), || async { Err(eyre!("dns")) })
      .await
      .unwrap();
    assert!(result.is_none());
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let layer = layer();
    let app = key("/app.js");
    layer
      .storage()
      .put("alo-zoghal-v1", &app, &json("cached"))
      .unwrap();

    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result = layer
      .cache_first(&app, || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(json("network"))
      })
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.text(), "cached");
  }

  #[tokio::test]
  async fn test_lookups_prefer_current_store_over_older_versions() {
    let layer = layer();
    let ticker = key("/data/ticker.json");
    let app = key("/app.js");
    let storage = layer.storage();
    // The superseded store is created first, so it is the oldest
    storage.put("alo-zoghal-v0", &ticker, &json("old")).unwrap();
    storage.put("alo-zoghal-v0", &app, &json("old")).unwrap();
    storage.put("alo-zoghal-v1", &ticker, &json("new")).unwrap();
    storage.put("alo-zoghal-v1", &app, &json("new")).unwrap();

    let offline = layer
      .network_first(&ticker, || async { Err(eyre!("offline")) })
      .await
      .unwrap()
      .unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data.text(), "new");

    let cached = layer
      .cache_first(&app, || async { Err(eyre!("offline")) })
      .await
      .unwrap();
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(cached.data.text(), "new");
  }

  #[tokio::test]
  async fn test_lookups_fall_back_to_older_store() {
    let layer = layer();
    let stories = key("/data/stories.json");
    layer
      .storage()
      .put("alo-zoghal-v0", &stories, &json("[0]"))
      .unwrap();

    let offline = layer
      .network_first(&stories, || async { Err(eyre!("offline")) })
      .await
      .unwrap()
      .unwrap();
    assert_eq!(offline.data.text(), "[0]");
  }

  #[tokio::test]
  async fn test_disabled_write_back_returns_without_storing() {
    let mut layer = layer();
    layer.set_write_back(false);
    let ticker = key("/data/ticker.json");
    let style = key("/admin-style.css");

    let fresh = layer
      .network_first(&ticker, || async { Ok(json("[]")) })
      .await
      .unwrap()
      .unwrap();
    layer
      .cache_first(&style, || async { Ok(json("body{}")) })
      .await
      .unwrap();

    assert_eq!(fresh.source, CacheSource::Network);
    assert!(!layer.storage().has_store("alo-zoghal-v1").unwrap());
    assert!(layer.storage().match_any(&style).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_miss_stores_only_basic_200() {
    let layer = layer();
    let style = key("/admin-style.css");
    let font = key("https://cdn.jsdelivr.net/font.css");
    let gone = key("/gone.html");

    layer
      .cache_first(&style, || async { Ok(json("body{}")) })
      .await
      .unwrap();
    let cors = layer
      .cache_first(&font, || async {
        Ok(StoredResponse::new(200, "@font-face{}", ResponseType::Cors))
      })
      .await
      .unwrap();
    let not_found = layer
      .cache_first(&gone, || async {
        Ok(StoredResponse::new(404, "nope", ResponseType::Basic))
      })
      .await
      .unwrap();

    assert_eq!(cors.data.text(), "@font-face{}");
    assert_eq!(not_found.data.status, 404);
    assert!(layer.storage().match_any(&style).unwrap().is_some());
    assert!(layer.storage().match_any(&font).unwrap().is_none());
    assert!(layer.storage().match_any(&gone).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_cache_first_miss_propagates_network_error() {
    let layer = layer();
    let result = layer
      .cache_first(&key("/uncached.png"), || async { Err(eyre!("offline")) })
      .await;
    assert!(result.is_err());
  }
}

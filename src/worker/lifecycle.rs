//! Store lifecycle: shell seeding on install, version pruning on activate.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::cache::{should_store, CacheStorage, Request, Response};

/// The current deployment's store names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNames {
  /// App shell, third-party assets and generic responses
  pub static_store: String,
  /// Dynamic data files
  pub data_store: String,
}

impl StoreNames {
  /// `<prefix>-<version>` for both stores.
  pub fn versioned(static_prefix: &str, data_prefix: &str, version: &str) -> Self {
    Self {
      static_store: format!("{}-{}", static_prefix, version),
      data_store: format!("{}-{}", data_prefix, version),
    }
  }

  pub fn is_current(&self, name: &str) -> bool {
    name == self.static_store || name == self.data_store
  }
}

/// Outcome of seeding the app shell.
#[derive(Debug, Default)]
pub struct InstallReport {
  pub cached: Vec<Url>,
  pub failed: Vec<(Url, String)>,
}

/// Outcome of pruning stale stores.
#[derive(Debug, Default)]
pub struct ActivateReport {
  pub removed: Vec<String>,
  pub failed: Vec<(String, String)>,
}

/// Creates the current version's stores and evicts the others.
pub struct Lifecycle<S: CacheStorage> {
  storage: Arc<S>,
  names: StoreNames,
  app_shell: Vec<Url>,
}

impl<S: CacheStorage> Lifecycle<S> {
  pub fn new(storage: Arc<S>, names: StoreNames, app_shell: Vec<Url>) -> Self {
    Self {
      storage,
      names,
      app_shell,
    }
  }

  pub fn names(&self) -> &StoreNames {
    &self.names
  }

  /// Whether this version's static store exists, i.e. install already ran.
  pub fn is_installed(&self) -> Result<bool> {
    self.storage.has(&self.names.static_store)
  }

  /// Seed the static store with every app shell URL.
  ///
  /// Best effort: each URL is fetched independently and a failure only skips
  /// that URL. Never fails as a whole.
  pub async fn install<F, Fut>(&self, fetch: F) -> InstallReport
  where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    let store = &self.names.static_store;
    info!(store = %store, files = self.app_shell.len(), "Caching app shell");

    if let Err(e) = self.storage.open(store) {
      warn!(store = %store, error = %e, "Failed to open static store");
    }

    let fetches = self.app_shell.iter().map(|url| {
      let request = Request::get(url.clone());
      let fetched = fetch(request.clone());
      async move { (request, fetched.await) }
    });

    let mut report = InstallReport::default();
    for (request, outcome) in join_all(fetches).await {
      let url = request.url().clone();
      match self.seed(store, &request, outcome) {
        Ok(()) => report.cached.push(url),
        Err(e) => {
          warn!(url = %url, error = %e, "App shell file failed to cache");
          report.failed.push((url, e.to_string()));
        }
      }
    }

    info!(
      cached = report.cached.len(),
      failed = report.failed.len(),
      "App shell cached"
    );
    report
  }

  fn seed(&self, store: &str, request: &Request, outcome: Result<Response>) -> Result<()> {
    let response = outcome?;
    if !should_store(request, &response) {
      return Err(eyre!(
        "Unexpected status {} {}",
        response.status,
        response.status_text
      ));
    }
    self.storage.put(store, request, &response)
  }

  /// Delete every store that is not one of the current version's stores.
  ///
  /// A failed deletion is logged and reported; the remaining stores are
  /// still processed. Only a failure to enumerate stores is an error.
  pub fn activate(&self) -> Result<ActivateReport> {
    let mut report = ActivateReport::default();

    for name in self.storage.keys()? {
      if self.names.is_current(&name) {
        continue;
      }

      info!(store = %name, "Removing old cache");
      match self.storage.delete(&name) {
        Ok(_) => report.removed.push(name),
        Err(e) => {
          warn!(store = %name, error = %e, "Failed to remove old cache");
          report.failed.push((name, e.to_string()));
        }
      }
    }

    Ok(report)
  }
}

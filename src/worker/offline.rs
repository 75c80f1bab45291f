//! Offline worker: routes each request class to its caching strategy.

use color_eyre::Result;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use url::Url;

use super::classify::{Classifier, RequestClass};
use super::lifecycle::{ActivateReport, InstallReport, Lifecycle, StoreNames};
use super::{Clients, ServiceWorker, WorkerSettings};
use crate::cache::{CacheLayer, CacheResult, CacheStorage, Request, Response};
use crate::net::Network;

/// Service worker that keeps an app usable offline.
///
/// | Class             | Store  | Strategy                            |
/// |-------------------|--------|-------------------------------------|
/// | dynamic data      | data   | network-first, store fallback       |
/// | third-party asset | static | cache-first                         |
/// | generic           | static | network-first, store, 503 fallback  |
pub struct OfflineWorker<S: CacheStorage, N: Network> {
  network: Arc<N>,
  cache: CacheLayer<S>,
  classifier: Classifier,
  lifecycle: Lifecycle<S>,
  last_install: Mutex<Option<InstallReport>>,
  last_activate: Mutex<Option<ActivateReport>>,
}

impl<S: CacheStorage + 'static, N: Network> OfflineWorker<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, settings: WorkerSettings) -> Self {
    let classifier = Classifier::new(settings.data_suffixes, settings.third_party.iter());
    let current = vec![
      settings.names.static_store.clone(),
      settings.names.data_store.clone(),
    ];
    let lifecycle = Lifecycle::new(Arc::clone(&storage), settings.names, settings.app_shell);

    Self {
      network,
      cache: CacheLayer::new(storage).with_fallback_stores(current),
      classifier,
      lifecycle,
      last_install: Mutex::new(None),
      last_activate: Mutex::new(None),
    }
  }

  pub fn names(&self) -> &StoreNames {
    self.lifecycle.names()
  }

  pub fn classify(&self, url: &Url) -> RequestClass {
    self.classifier.classify(url)
  }

  /// Seed the app shell. See [`Lifecycle::install`].
  pub async fn install(&self) -> InstallReport {
    self
      .lifecycle
      .install(|request| {
        let network = Arc::clone(&self.network);
        async move { network.fetch(&request).await }
      })
      .await
  }

  /// Prune stale stores. See [`Lifecycle::activate`].
  pub fn activate(&self) -> Result<ActivateReport> {
    self.lifecycle.activate()
  }

  /// Whether this version was installed in this or an earlier run.
  pub fn is_installed(&self) -> Result<bool> {
    self.lifecycle.is_installed()
  }

  /// Report of the most recent install event, if one ran since the last take.
  pub fn take_install_report(&self) -> Option<InstallReport> {
    lock(&self.last_install).take()
  }

  /// Report of the most recent activate event, if one ran since the last take.
  pub fn take_activate_report(&self) -> Option<ActivateReport> {
    lock(&self.last_activate).take()
  }

  /// Wait for outstanding detached store writes.
  pub async fn settle(&self) {
    self.cache.settle().await;
  }
}

impl<S: CacheStorage + 'static, N: Network> ServiceWorker for OfflineWorker<S, N> {
  async fn on_install(&self, clients: &Clients) -> Result<()> {
    let report = self.install().await;
    *lock(&self.last_install) = Some(report);
    clients.skip_waiting();
    Ok(())
  }

  async fn on_activate(&self, clients: &Clients) -> Result<()> {
    let report = self.activate()?;
    if !report.removed.is_empty() || !report.failed.is_empty() {
      info!(
        removed = report.removed.len(),
        failed = report.failed.len(),
        "Old caches pruned"
      );
    }
    *lock(&self.last_activate) = Some(report);
    clients.claim();
    Ok(())
  }

  async fn on_fetch(&self, request: Request) -> Result<CacheResult<Response>> {
    let class = self.classifier.classify(request.url());
    debug!(class = %class, method = request.method(), url = %request.url(), "Intercepted");

    let names = self.lifecycle.names();
    let fetch = || self.network.fetch(&request);

    match class {
      RequestClass::DynamicData => {
        self
          .cache
          .network_first(&names.data_store, &request, fetch)
          .await
      }
      RequestClass::ThirdPartyAsset => {
        self
          .cache
          .cache_first(&names.static_store, &request, fetch)
          .await
      }
      RequestClass::Generic => Ok(
        self
          .cache
          .network_first_or_placeholder(&names.static_store, &request, fetch)
          .await,
      ),
    }
  }
}

fn lock<T>(slot: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  match slot.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

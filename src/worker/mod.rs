//! The interception layer: lifecycle handlers and per-request strategy dispatch.

mod classify;
mod lifecycle;
mod offline;

use color_eyre::Result;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use url::Url;

use crate::cache::{CacheResult, Request, Response};

pub use classify::RequestClass;
pub use lifecycle::{ActivateReport, InstallReport, StoreNames};
pub use offline::OfflineWorker;

/// Handlers a host invokes for lifecycle and fetch events.
///
/// A worker is registered once with a [`crate::host::Host`]; the host owns
/// dispatch and state, the worker owns policy.
pub trait ServiceWorker: Send + Sync {
  /// Prepare the new version. May ask the host to skip waiting.
  fn on_install(&self, clients: &Clients) -> impl Future<Output = Result<()>> + Send;

  /// Take over from the previous version. May ask the host to claim clients.
  fn on_activate(&self, clients: &Clients) -> impl Future<Output = Result<()>> + Send;

  /// Produce exactly one response for an intercepted request, or fail the fetch.
  fn on_fetch(
    &self,
    request: Request,
  ) -> impl Future<Output = Result<CacheResult<Response>>> + Send;
}

/// Signals a worker can send to its host during lifecycle events.
#[derive(Debug, Default)]
pub struct Clients {
  skip_waiting: AtomicBool,
  claimed: AtomicBool,
}

impl Clients {
  /// Activate as soon as installation finishes.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  /// Control already-open clients without waiting for their next navigation.
  pub fn claim(&self) {
    self.claimed.store(true, Ordering::SeqCst);
  }

  pub fn is_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  pub fn is_claimed(&self) -> bool {
    self.claimed.load(Ordering::SeqCst)
  }
}

/// Static configuration of an [`OfflineWorker`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub names: StoreNames,
  /// Absolute app shell URLs, seeded on install
  pub app_shell: Vec<Url>,
  /// CDN URLs whose origin prefixes are served cache-first
  pub third_party: Vec<Url>,
  /// Path suffixes that mark dynamic data
  pub data_suffixes: Vec<String>,
}

//! Host side of the worker contract: registration, state and event dispatch.

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, Request, Response};
use crate::event::{Event, EventOutcome};
use crate::worker::{Clients, ServiceWorker};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Registered, nothing run yet
  Parsed,
  /// Install handler running
  Installing,
  /// Installed, waiting to activate
  Installed,
  /// Activate handler running
  Activating,
  /// Handling fetches
  Activated,
  /// A lifecycle handler failed; the worker is unusable
  Redundant,
}

/// Owns one registered worker and routes events to it.
pub struct Host<W: ServiceWorker> {
  worker: W,
  state: WorkerState,
  clients: Clients,
}

impl<W: ServiceWorker> Host<W> {
  /// Register a fresh worker. It must be installed and activated before it
  /// handles fetches.
  pub fn register(worker: W) -> Self {
    Self {
      worker,
      state: WorkerState::Parsed,
      clients: Clients::default(),
    }
  }

  /// Re-attach a worker whose version went through install (and possibly
  /// activate) in an earlier run.
  pub fn resume(worker: W, state: WorkerState) -> Self {
    Self {
      worker,
      state,
      clients: Clients::default(),
    }
  }

  /// Attach a worker for fetching. An `installed` worker resumes as
  /// activated; otherwise it is registered and run through install, which
  /// activates it when the worker asks to skip waiting.
  pub async fn attach(worker: W, installed: bool) -> Result<Self> {
    if installed {
      return Ok(Self::resume(worker, WorkerState::Activated));
    }

    info!("No installed version found, running install");
    let mut host = Self::register(worker);
    host.install().await?;
    Ok(host)
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  pub fn worker(&self) -> &W {
    &self.worker
  }

  pub async fn dispatch(&mut self, event: Event) -> Result<EventOutcome> {
    match event {
      Event::Install => {
        self.install().await?;
        Ok(EventOutcome::State(self.state))
      }
      Event::Activate => {
        self.activate().await?;
        Ok(EventOutcome::State(self.state))
      }
      Event::Fetch(request) => Ok(EventOutcome::Response(self.fetch(request).await?)),
    }
  }

  /// Run the install handler. When the worker asks to skip waiting, activation
  /// follows immediately.
  pub async fn install(&mut self) -> Result<()> {
    if self.state != WorkerState::Parsed {
      return Err(eyre!("Cannot install a worker in state {:?}", self.state));
    }

    self.state = WorkerState::Installing;
    if let Err(e) = self.worker.on_install(&self.clients).await {
      warn!(error = %e, "Install failed");
      self.state = WorkerState::Redundant;
      return Err(e);
    }
    self.state = WorkerState::Installed;
    info!("Worker installed");

    if self.clients.is_skip_waiting() {
      debug!("Skipping wait, activating now");
      self.activate().await?;
    }
    Ok(())
  }

  /// Run the activate handler.
  pub async fn activate(&mut self) -> Result<()> {
    if self.state != WorkerState::Installed {
      return Err(eyre!("Cannot activate a worker in state {:?}", self.state));
    }

    self.state = WorkerState::Activating;
    if let Err(e) = self.worker.on_activate(&self.clients).await {
      warn!(error = %e, "Activate failed");
      self.state = WorkerState::Redundant;
      return Err(e);
    }
    self.state = WorkerState::Activated;
    info!(claimed = self.clients.is_claimed(), "Worker activated");
    Ok(())
  }

  /// Hand an intercepted request to the active worker.
  pub async fn fetch(&self, request: Request) -> Result<CacheResult<Response>> {
    if self.state != WorkerState::Activated {
      return Err(eyre!(
        "No active worker to handle {} (state {:?})",
        request.url(),
        self.state
      ));
    }
    self.worker.on_fetch(request).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  /// Records calls; behavior switches via flags.
  #[derive(Default)]
  struct RecordingWorker {
    skip_waiting: bool,
    fail_install: bool,
    installs: AtomicU32,
    activations: AtomicU32,
  }

  impl ServiceWorker for RecordingWorker {
    async fn on_install(&self, clients: &Clients) -> Result<()> {
      self.installs.fetch_add(1, Ordering::SeqCst);
      if self.fail_install {
        return Err(eyre!("boom"));
      }
      if self.skip_waiting {
        clients.skip_waiting();
      }
      Ok(())
    }

    async fn on_activate(&self, clients: &Clients) -> Result<()> {
      self.activations.fetch_add(1, Ordering::SeqCst);
      clients.claim();
      Ok(())
    }

    async fn on_fetch(&self, _request: Request) -> Result<CacheResult<Response>> {
      Ok(CacheResult::from_network(Response::ok("recorded")))
    }
  }

  fn request() -> Request {
    Request::parse("GET", "https://app.test/").unwrap()
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_immediately() {
    let mut host = Host::register(RecordingWorker {
      skip_waiting: true,
      ..Default::default()
    });

    let outcome = host.dispatch(Event::Install).await.unwrap();
    assert!(matches!(outcome, EventOutcome::State(WorkerState::Activated)));
    assert_eq!(host.worker().activations.load(Ordering::SeqCst), 1);
    assert!(host.clients().is_claimed());
  }

  #[tokio::test]
  async fn test_without_skip_waiting_stays_installed() {
    let mut host = Host::register(RecordingWorker::default());

    host.dispatch(Event::Install).await.unwrap();
    assert_eq!(host.state(), WorkerState::Installed);
    assert!(host.fetch(request()).await.is_err());

    host.dispatch(Event::Activate).await.unwrap();
    assert_eq!(host.state(), WorkerState::Activated);

    let outcome = host.dispatch(Event::Fetch(request())).await.unwrap();
    match outcome {
      EventOutcome::Response(result) => assert_eq!(result.data.body_text(), "recorded"),
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_failed_install_makes_worker_redundant() {
    let mut host = Host::register(RecordingWorker {
      fail_install: true,
      ..Default::default()
    });

    assert!(host.install().await.is_err());
    assert_eq!(host.state(), WorkerState::Redundant);
    assert!(host.activate().await.is_err());
    assert!(host.install().await.is_err());
    assert_eq!(host.worker().installs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_resume_handles_fetches_without_lifecycle() {
    let host = Host::resume(RecordingWorker::default(), WorkerState::Activated);
    let result = host.fetch(request()).await.unwrap();
    assert_eq!(result.data.status, 200);
    assert_eq!(host.worker().installs.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_attach_installs_when_not_installed() {
    let host = Host::attach(
      RecordingWorker {
        skip_waiting: true,
        ..Default::default()
      },
      false,
    )
    .await
    .unwrap();
    assert_eq!(host.state(), WorkerState::Activated);
    assert_eq!(host.worker().installs.load(Ordering::SeqCst), 1);
    assert_eq!(host.worker().activations.load(Ordering::SeqCst), 1);
    assert!(host.fetch(request()).await.is_ok());

    let host = Host::attach(RecordingWorker::default(), true).await.unwrap();
    assert_eq!(host.state(), WorkerState::Activated);
    assert_eq!(host.worker().installs.load(Ordering::SeqCst), 0);
  }
}

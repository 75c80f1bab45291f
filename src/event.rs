use crate::cache::{CacheResult, Request, Response};
use crate::host::WorkerState;

/// Events the host delivers to its registered worker
#[derive(Debug)]
pub enum Event {
  /// New version is being installed
  Install,
  /// Installed version takes over
  Activate,
  /// Intercepted network request
  Fetch(Request),
}

/// What handling an event produced
#[derive(Debug)]
pub enum EventOutcome {
  /// Lifecycle event finished; the worker is now in this state
  State(WorkerState),
  /// Fetch event answered
  Response(CacheResult<Response>),
}

//! Network double with per-URL scripted outcomes and call counting.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use super::client::Network;
use crate::cache::{Request, Response};

#[derive(Default)]
pub struct ScriptedNetwork {
  routes: Mutex<HashMap<String, Response>>,
  calls: Mutex<Vec<String>>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Respond to `url` with `response` until told otherwise.
  pub fn route(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  /// Make every URL unreachable.
  pub fn go_offline(&self) {
    self.routes.lock().unwrap().clear();
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|u| u.as_str() == url)
      .count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let url = request.url().to_string();
    self.calls.lock().unwrap().push(url.clone());

    let route = self.routes.lock().unwrap().get(&url).cloned();
    route.ok_or_else(|| eyre!("Connection refused: {}", url))
  }
}

//! Core request/response types and cache result metadata.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Body served when neither the network nor any store can answer.
pub const PLACEHOLDER_BODY: &str = "Offline / Resource Unavailable";

/// An intercepted network request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  method: String,
  url: Url,
  headers: Vec<(String, String)>,
}

impl Request {
  /// Create a request with an explicit method. The method is upper-cased.
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.trim().to_ascii_uppercase(),
      url,
      headers: Vec::new(),
    }
  }

  /// Shorthand for a GET request.
  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// Parse a request from a method and an absolute URL string.
  pub fn parse(method: &str, url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::new(method, url))
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn headers(&self) -> &[(String, String)] {
    &self.headers
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// URL used for store identity. Fragments never reach the server, so they
  /// are not part of the identity either.
  pub fn normalized_url(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }

  /// Stable, fixed-length store key for this request (method + normalized URL).
  pub fn cache_key(&self) -> String {
    let input = format!("{} {}", self.method, self.normalized_url());

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response produced by the network, a store, or synthesized locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, status_text: &str, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: status_text.to_string(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// A plain 200 OK response.
  #[allow(dead_code)]
  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, "OK", body)
  }

  /// The 503 response returned when both network and stores come up empty.
  pub fn placeholder() -> Self {
    Self::new(503, "Service Unavailable", PLACEHOLDER_BODY).with_header("Content-Type", "text/plain")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Case-insensitive header lookup (first match).
  #[allow(dead_code)]
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  #[allow(dead_code)]
  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Only successful GETs are persisted. Errors, redirects, partial content and
/// mutating requests pass through uncached.
pub fn should_store(request: &Request, response: &Response) -> bool {
  request.is_get() && response.status == 200
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data served from a store without consulting the network.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Data served from a store because the network failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Synthesized data; nothing real was available.
  pub fn placeholder(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Placeholder,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh response from network
  Network,
  /// Store hit, network never consulted
  Cache,
  /// Network unavailable, serving stored response
  Offline,
  /// Network and stores both failed
  Placeholder,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Placeholder => "placeholder",
    };
    f.write_str(s)
  }
}

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::cache::{Request, Response};

/// Anything that can perform a request against the real network.
///
/// A returned `Err` means the request never produced a response (DNS, refused
/// connection, timeout...). HTTP error statuses are `Ok` responses.
pub trait Network: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// HTTP network client wrapper
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Option<Duration>) -> Result<Self> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = Method::from_bytes(request.method().as_bytes())
      .map_err(|e| eyre!("Invalid HTTP method {}: {}", request.method(), e))?;

    let mut builder = self.client.request(method, request.url().clone());
    for (name, value) in request.headers() {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| eyre!("Invalid header name {}: {}", name, e))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| eyre!("Invalid header value for {}: {}", name, e))?;
      builder = builder.header(name, value);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url(), e))?;

    let status = response.status();
    let headers = header_pairs(response.headers());

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url(), e))?;

    debug!(url = %request.url(), status = status.as_u16(), bytes = body.len(), "Fetched");

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}

/// Every response header as a name/value pair. Values that are not visible
/// ASCII (obs-text) are decoded lossily rather than dropped.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .map(|(name, value)| {
      let value = match value.to_str() {
        Ok(v) => v.to_string(),
        Err(_) => {
          debug!(header = %name, "Non-ASCII header value, decoding lossily");
          String::from_utf8_lossy(value.as_bytes()).into_owned()
        }
      };
      (name.as_str().to_string(), value)
    })
    .collect()
}

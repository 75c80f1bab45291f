//! Request classification: which strategy handles an intercepted request.

use std::collections::HashSet;
use url::Url;

/// Strategy class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Data files (e.g. `*.json`): network-first, store fallback
  DynamicData,
  /// CDN assets: cache-first
  ThirdPartyAsset,
  /// Everything else: network-first, store fallback, then placeholder
  Generic,
}

impl std::fmt::Display for RequestClass {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::DynamicData => "dynamic-data",
      Self::ThirdPartyAsset => "third-party-asset",
      Self::Generic => "generic",
    };
    f.write_str(s)
  }
}

/// Scheme + host (+ non-default port) + first path segment.
///
/// `https://unpkg.com/leaflet@1.9.4/dist/leaflet.js` → `https://unpkg.com/leaflet@1.9.4`.
/// Returns `None` for URLs without a tuple origin (`data:`, `blob:`, ...).
pub fn origin_prefix(url: &Url) -> Option<String> {
  let origin = url.origin();
  if !origin.is_tuple() {
    return None;
  }

  let first_segment = url
    .path_segments()
    .and_then(|mut segments| segments.next())
    .unwrap_or_default();

  Some(format!("{}/{}", origin.ascii_serialization(), first_segment))
}

/// Maps requests to a [`RequestClass`]. First match wins:
/// data suffix, then third-party origin prefix, then generic.
#[derive(Debug, Clone)]
pub struct Classifier {
  data_suffixes: Vec<String>,
  third_party: HashSet<String>,
}

impl Classifier {
  pub fn new<'a>(data_suffixes: Vec<String>, third_party: impl IntoIterator<Item = &'a Url>) -> Self {
    Self {
      data_suffixes,
      third_party: third_party.into_iter().filter_map(origin_prefix).collect(),
    }
  }

  pub fn classify(&self, url: &Url) -> RequestClass {
    let path = url.path();
    if self.data_suffixes.iter().any(|suffix| path.ends_with(suffix.as_str())) {
      return RequestClass::DynamicData;
    }

    if origin_prefix(url).is_some_and(|prefix| self.third_party.contains(&prefix)) {
      return RequestClass::ThirdPartyAsset;
    }

    RequestClass::Generic
  }
}

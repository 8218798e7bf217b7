//! Request descriptors and the data/static classifier.

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use url::Url;

/// Method + absolute URL. The unit of cache lookup; matching is exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: Url,
}

impl RequestKey {
  /// Build a key, resolving relative URLs against `origin`.
  ///
  /// The fragment is dropped since it never reaches the network.
  pub fn new(method: &str, raw_url: &str, origin: &Url) -> Result<Self> {
    let mut url = origin
      .join(raw_url)
      .map_err(|e| eyre!("Invalid request URL {}: {}", raw_url, e))?;
    url.set_fragment(None);

    Ok(Self {
      method: method.to_ascii_uppercase(),
      url,
    })
  }

  pub fn get(raw_url: &str, origin: &Url) -> Result<Self> {
    Self::new("GET", raw_url, origin)
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Only GET requests are ever looked up in or written to a store.
  pub fn is_cacheable_method(&self) -> bool {
    self.method == "GET"
  }

  pub fn is_same_origin(&self, origin: &Url) -> bool {
    self.url.origin() == origin.origin()
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Which strategy serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Network-first, cache fallback
  Data,
  /// Cache-first, network fallback
  Static,
}

/// Classifies requests by a reserved path segment (e.g. `/data/`).
#[derive(Debug, Clone)]
pub struct Classifier {
  data_segment: String,
}

impl Classifier {
  pub fn new(data_segment: impl Into<String>) -> Self {
    Self {
      data_segment: data_segment.into(),
    }
  }

  pub fn classify(&self, request: &RequestKey) -> RequestClass {
    if request.url().path().contains(&self.data_segment) {
      RequestClass::Data
    } else {
      RequestClass::Static
    }
  }
}

//! Stored response model.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

/// How the response relates to the worker's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin response
  Basic,
  /// Cross-origin response
  Cors,
  /// Synthesized network error
  Error,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Error => "error",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "basic" => Ok(Self::Basic),
      "cors" => Ok(Self::Cors),
      "error" => Ok(Self::Error),
      other => Err(eyre!("Unknown response type '{}'", other)),
    }
  }
}

/// A response as held in a cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub status: u16,
  /// Header pairs in received order
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub response_type: ResponseType,
}

impl StoredResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>, response_type: ResponseType) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      response_type,
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_ascii_lowercase(), value.to_string()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// 200-299, like `Response.ok`.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Whether a cache-first miss may be written back: exactly 200 and same-origin.
  pub fn is_cacheable_static(&self) -> bool {
    self.status == 200 && self.response_type == ResponseType::Basic
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cacheable_static_requires_200_basic() {
    assert!(StoredResponse::new(200, "ok", ResponseType::Basic).is_cacheable_static());
    assert!(!StoredResponse::new(200, "ok", ResponseType::Cors).is_cacheable_static());
    assert!(!StoredResponse::new(204, "", ResponseType::Basic).is_cacheable_static());
    assert!(!StoredResponse::new(404, "", ResponseType::Basic).is_cacheable_static());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let resp = StoredResponse::new(200, "{}", ResponseType::Basic)
      .with_header("Content-Type", "application/json");
    assert_eq!(resp.header("content-type"), Some("application/json"));
    assert_eq!(resp.header("CONTENT-TYPE"), Some("application/json"));
    assert_eq!(resp.header("etag"), None);
  }

  #[test]
  fn test_response_type_round_trips_through_storage_name() {
    for ty in [ResponseType::Basic, ResponseType::Cors, ResponseType::Error] {
      assert_eq!(ResponseType::parse(ty.as_str()).unwrap(), ty);
    }
    assert!(ResponseType::parse("opaque").is_err());
  }
}

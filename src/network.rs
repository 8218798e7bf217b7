use color_eyre::{eyre::eyre, Result};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use url::Url;

use crate::request::RequestKey;
use crate::response::{ResponseType, StoredResponse};

const CLIENT_USER_AGENT: &str = concat!("storefront-offline/", env!("CARGO_PKG_VERSION"));

/// HTTP client wrapper.
///
/// A returned `Err` means the fetch itself was rejected (offline, DNS,
/// connection reset). Any status code, including 4xx/5xx, is `Ok`.
#[derive(Clone)]
pub struct NetworkClient {
  client: reqwest::Client,
  origin: Url,
}

impl NetworkClient {
  pub fn new(origin: Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Perform the request described by `key` and buffer the response.
  pub async fn fetch(&self, key: &RequestKey) -> Result<StoredResponse> {
    let method = Method::from_bytes(key.method().as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", key.method(), e))?;

    let response = self
      .client
      .request(method, key.url().clone())
      .header(USER_AGENT, CLIENT_USER_AGENT)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", key, e))?;

    // Redirects may land on another origin
    let response_type = if response.url().origin() == self.origin.origin() {
      ResponseType::Basic
    } else {
      ResponseType::Cors
    };

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", key, e))?;

    Ok(StoredResponse {
      status,
      headers,
      body: body.to_vec(),
      response_type,
    })
  }

  /// POST a JSON body. Returns the response status.
  pub async fn post_json(
    &self,
    endpoint: &Url,
    body: &[u8],
    idempotency_key: Option<&str>,
  ) -> Result<u16> {
    let mut request = self
      .client
      .post(endpoint.clone())
      .header(USER_AGENT, CLIENT_USER_AGENT)
      .header(CONTENT_TYPE, "application/json")
      .body(body.to_vec());

    if let Some(key) = idempotency_key {
      request = request.header("Idempotency-Key", key);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to POST to {}: {}", endpoint, e))?;

    Ok(response.status().as_u16())
  }
}

//! Deferred order delivery.
//!
//! Orders that could not be sent are held in the queue table and replayed on
//! a background sync signal. Delivery is at-least-once: every attempt carries
//! the entry's idempotency key so the endpoint can drop replays.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{QueueStorage, QueuedOrder};
use crate::network::NetworkClient;

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  /// Entries delivered and removed
  pub delivered: usize,
  /// Entries whose attempt failed this pass
  pub failed: usize,
  /// Entries still queued after the pass
  pub remaining: usize,
}

pub struct OrderQueue<S: QueueStorage> {
  storage: Arc<S>,
  endpoint: Url,
  /// Serializes overlapping replays within this process
  replay_lock: Mutex<()>,
  /// Mixed into each idempotency key so identical orders queued in the
  /// same instant still get distinct keys
  enqueue_seq: AtomicU64,
}

impl<S: QueueStorage> OrderQueue<S> {
  pub fn new(storage: Arc<S>, endpoint: Url) -> Self {
    Self {
      storage,
      endpoint,
      replay_lock: Mutex::new(()),
      enqueue_seq: AtomicU64::new(0),
    }
  }

  /// Queue a JSON order payload. Returns the entry's idempotency key.
  pub fn enqueue(&self, payload: &serde_json::Value) -> Result<String> {
    let body =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize order: {}", e))?;
    let seq = self.enqueue_seq.fetch_add(1, Ordering::Relaxed);
    let key = idempotency_key(&body, seq);

    let id = self.storage.enqueue_order(&key, &body)?;
    info!(id, idempotency_key = %key, "order queued for delivery");

    Ok(key)
  }

  pub fn pending(&self) -> Result<Vec<QueuedOrder>> {
    self.storage.queued_orders()
  }

  /// Send every queued order, removing the ones the endpoint accepted.
  ///
  /// Failures are logged and left queued for the next signal.
  pub async fn replay(&self, network: &NetworkClient) -> Result<SyncReport> {
    let _guard = self.replay_lock.lock().await;

    let orders = self.storage.queued_orders()?;
    let mut report = SyncReport::default();
    debug!(count = orders.len(), "replaying queued orders");

    for order in &orders {
      let delivered = match network
        .post_json(&self.endpoint, &order.body, Some(&order.idempotency_key))
        .await
      {
        Ok(status) if (200..300).contains(&status) => true,
        Ok(status) => {
          warn!(id = order.id, status, "order delivery rejected");
          false
        }
        Err(e) => {
          warn!(id = order.id, error = %e, "order delivery failed");
          false
        }
      };

      if delivered {
        self.storage.remove_order(order.id)?;
        report.delivered += 1;
      } else {
        self.storage.record_attempt(order.id)?;
        report.failed += 1;
      }
    }

    report.remaining = self.storage.queued_orders()?.len();
    info!(
      delivered = report.delivered,
      failed = report.failed,
      remaining = report.remaining,
      "order sync finished"
    );

    Ok(report)
  }
}

/// Hex SHA-256 of the body, the queue time and a sequence number.
fn idempotency_key(body: &[u8], seq: u64) -> String {
  let now = Utc::now();
  let mut hasher = Sha256::new();
  hasher.update(body);
  hasher.update(now.timestamp().to_be_bytes());
  hasher.update(now.timestamp_subsec_nanos().to_be_bytes());
  hasher.update(seq.to_be_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use serde_json::json;
  use wiremock::matchers::{body_partial_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  async fn setup(server: &MockServer) -> (OrderQueue<SqliteStorage>, NetworkClient) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let endpoint = Url::parse(&format!("{}/exec", server.uri())).unwrap();
    let network = NetworkClient::new(Url::parse("http://localhost:8080").unwrap()).unwrap();
    (OrderQueue::new(storage, endpoint), network)
  }

  fn order(id: &str) -> serde_json::Value {
    json!({
      "action": "send_order",
      "order": { "orderId": id, "items": [{ "id": "coal", "quantity": 2 }] },
    })
  }

  #[tokio::test]
  async fn test_successful_delivery_removes_entries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/exec"))
      .respond_with(ResponseTemplate::new(200))
      .expect(2)
      .mount(&server)
      .await;

    let (queue, network) = setup(&server).await;
    queue.enqueue(&order("ORD-1")).unwrap();
    queue.enqueue(&order("ORD-2")).unwrap();

    let report = queue.replay(&network).await.unwrap();
    assert_eq!(
      report,
      SyncReport {
        delivered: 2,
        failed: 0,
        remaining: 0
      }
    );
    assert!(queue.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_delivery_stays_queued_and_others_continue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({ "order": { "orderId": "ORD-1" } })))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({ "order": { "orderId": "ORD-2" } })))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;

    let (queue, network) = setup(&server).await;
    queue.enqueue(&order("ORD-1")).unwrap();
    queue.enqueue(&order("ORD-2")).unwrap();

    let report = queue.replay(&network).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    let body: serde_json::Value = serde_json::from_slice(&pending[0].body).unwrap();
    assert_eq!(body["order"]["orderId"], "ORD-1");
  }

  #[tokio::test]
  async fn test_unreachable_endpoint_keeps_everything() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let queue = OrderQueue::new(storage, Url::parse("http://127.0.0.1:9/exec").unwrap());
    let network = NetworkClient::new(Url::parse("http://localhost:8080").unwrap()).unwrap();
    queue.enqueue(&order("ORD-1")).unwrap();

    let report = queue.replay(&network).await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(report.remaining, 1);
  }

  #[tokio::test]
  async fn test_same_payload_gets_distinct_keys() {
    let server = MockServer::start().await;
    let (queue, _network) = setup(&server).await;

    let a = queue.enqueue(&order("ORD-1")).unwrap();
    let b = queue.enqueue(&order("ORD-1")).unwrap();
    assert_ne!(a, b);
    assert_eq!(a.len(), 64);
  }

  #[tokio::test]
  async fn test_key_sequence_is_per_queue() {
    let server = MockServer::start().await;
    let (first, _) = setup(&server).await;
    let (second, _) = setup(&server).await;

    first.enqueue(&order("ORD-1")).unwrap();
    first.enqueue(&order("ORD-2")).unwrap();
    second.enqueue(&order("ORD-3")).unwrap();

    assert_eq!(first.enqueue_seq.load(Ordering::Relaxed), 2);
    assert_eq!(second.enqueue_seq.load(Ordering::Relaxed), 1);
  }
}

//! Push payloads and the notifications built from them.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

use crate::config::NotificationConfig;

/// Incoming push message. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
}

impl PushPayload {
  /// Parse raw push data. Empty data carries no notification.
  pub fn parse(data: &[u8]) -> Result<Option<Self>> {
    if data.is_empty() {
      return Ok(None);
    }
    serde_json::from_slice(data)
      .map(Some)
      .map_err(|e| eyre!("Invalid push payload: {}", e))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
  View,
  Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionButton {
  pub action: NotificationAction,
  pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Page opened when the notification is clicked
  pub url: String,
  pub actions: Vec<ActionButton>,
}

impl Notification {
  pub fn from_payload(payload: PushPayload, defaults: &NotificationConfig) -> Self {
    Self {
      title: payload.title.unwrap_or_else(|| defaults.title.clone()),
      body: payload.body.unwrap_or_else(|| defaults.body.clone()),
      icon: defaults.icon.clone(),
      badge: defaults.badge.clone(),
      vibrate: defaults.vibrate.clone(),
      url: payload.url.unwrap_or_else(|| defaults.url.clone()),
      actions: vec![
        ActionButton {
          action: NotificationAction::View,
          title: "مشاهده".to_string(),
        },
        ActionButton {
          action: NotificationAction::Close,
          title: "بستن".to_string(),
        },
      ],
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_data_yields_no_payload() {
    assert!(PushPayload::parse(b"").unwrap().is_none());
  }

  #[test]
  fn test_missing_fields_fall_back_to_defaults() {
    let payload = PushPayload::parse(br#"{"title":"New order"}"#).unwrap().unwrap();
    let notification = Notification::from_payload(payload, &NotificationConfig::default());

    assert_eq!(notification.title, "New order");
    assert_eq!(notification.body, "سفارش جدید از الو ذغال");
    assert_eq!(notification.url, "/");
    assert_eq!(notification.icon, "/pwa/icons/icon-96x96.png");
    assert_eq!(notification.vibrate, vec![100, 50, 100]);
    assert_eq!(notification.actions.len(), 2);
  }

  #[test]
  fn test_full_payload_overrides_defaults() {
    let payload = PushPayload::parse(
      br#"{"title":"t","body":"b","url":"/index.html#order","extra":1}"#,
    )
    .unwrap()
    .unwrap();
    let notification = Notification::from_payload(payload, &NotificationConfig::default());

    assert_eq!(notification.title, "t");
    assert_eq!(notification.body, "b");
    assert_eq!(notification.url, "/index.html#order");
  }

  #[test]
  fn test_malformed_payload_is_error() {
    assert!(PushPayload::parse(b"not json").is_err());
  }
}

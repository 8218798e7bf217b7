use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

const DEFAULT_MANIFEST: &[&str] = &[
  "/",
  "/index.html",
  "/admin-panel.html",
  "/admin.js",
  "/admin-style.css",
  "/ads-simple.js",
  "/install-manager.js",
  "/app.js",
  // Data files
  "/data/ticker.json",
  "/data/stories.json",
  "/data/vip-ads.json",
  "/data/settings.json",
  // External resources
  "https://cdn.jsdelivr.net/gh/rastikerdar/vazirmatn@v33.003/Vazirmatn-font-face.css",
  "https://raw.githubusercontent.com/aloozoghal-hash/alozoghal/main/8f6dcedf3dc3dbaa82c0df548bd962c9.jpg",
  // Icons
  "/pwa/icons/icon-72x72.png",
  "/pwa/icons/icon-96x96.png",
  "/pwa/icons/icon-128x128.png",
];

const DEFAULT_DELIVERY_ENDPOINT: &str = "https://script.google.com/macros/s/AKfycbyLQjEqmjs5Re2m7nf3lGU_IZQU0ILuFgiJWxrEQ306AgUy1zW090quuwv1QLWVOQyV/exec";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the worker is served from. Same-origin responses are `basic`.
  pub origin: String,
  pub cache: CacheConfig,
  /// URLs fetched into the versioned store at install time
  pub manifest: Vec<String>,
  pub delivery: DeliveryConfig,
  pub notifications: NotificationConfig,
  pub periodic_sync: PeriodicSyncConfig,
  pub capabilities: Capabilities,
  /// SQLite database path (defaults to the user data directory)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub prefix: String,
  /// Bumping this invalidates every older store on the next activation
  pub version: String,
  /// Path segment that marks a request as data (network-first)
  pub data_segment: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
  pub endpoint: String,
  pub sync_tag: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  pub body: String,
  pub url: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeriodicSyncConfig {
  pub tag: String,
  pub min_interval_secs: u64,
}

/// Optional platform features. Missing ones are logged and skipped.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Capabilities {
  pub periodic_sync: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      cache: CacheConfig::default(),
      manifest: DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect(),
      delivery: DeliveryConfig::default(),
      notifications: NotificationConfig::default(),
      periodic_sync: PeriodicSyncConfig::default(),
      capabilities: Capabilities::default(),
      database: None,
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "alo-zoghal".to_string(),
      version: "v1.2".to_string(),
      data_segment: "/data/".to_string(),
    }
  }
}

impl Default for DeliveryConfig {
  fn default() -> Self {
    Self {
      endpoint: DEFAULT_DELIVERY_ENDPOINT.to_string(),
      sync_tag: "sync-orders".to_string(),
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "الو ذغال".to_string(),
      body: "سفارش جدید از الو ذغال".to_string(),
      url: "/".to_string(),
      icon: "/pwa/icons/icon-96x96.png".to_string(),
      badge: "/pwa/icons/icon-72x72.png".to_string(),
      vibrate: vec![100, 50, 100],
    }
  }
}

impl Default for PeriodicSyncConfig {
  fn default() -> Self {
    Self {
      tag: "update-data".to_string(),
      min_interval_secs: 24 * 60 * 60,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storefront-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront-offline/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("storefront-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse a YAML document; unspecified fields keep their defaults.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    Url::parse(&self.delivery.endpoint)
      .map_err(|e| eyre!("Invalid delivery endpoint {}: {}", self.delivery.endpoint, e))?;
    if self.cache.version.is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Name of the store owned by the running version.
  pub fn store_name(&self) -> String {
    format!("{}-{}", self.cache.prefix, self.cache.version)
  }

  /// Database path, defaulting to the user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("storefront-offline").join("cache.db"))
  }
}

//! The worker: owns every component and drives the cache lifecycle.
//!
//! Install populates the versioned store from the manifest, activate purges
//! every other store and claims open clients, and fetches are routed to the
//! network-first or cache-first strategy by URL.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheSource, CacheStorage, SqliteStorage};
use crate::clients::{ClientKind, ClientRegistry};
use crate::config::Config;
use crate::network::NetworkClient;
use crate::push::{Notification, NotificationAction, PushPayload};
use crate::queue::{OrderQueue, SyncReport};
use crate::request::{Classifier, RequestClass, RequestKey};
use crate::response::StoredResponse;

/// Lifecycle of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Populated; skips waiting, so it can activate right away
  Installed,
  Activating,
  Activated,
  /// Install failed; this version never takes over
  Redundant,
}

/// Typed worker events.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(RequestKey),
  /// Background sync signal with its tag
  Sync(String),
  /// Periodic sync signal with its tag
  PeriodicSync(String),
  /// Raw push data
  Push(Vec<u8>),
  NotificationClick {
    notification: Notification,
    action: Option<NotificationAction>,
  },
}

#[derive(Debug)]
pub enum EventOutcome {
  Installed,
  Activated { deleted: Vec<String> },
  Response(Option<CacheResult<StoredResponse>>),
  Synced(Option<SyncReport>),
  Refreshed(Option<RefreshReport>),
  Notification(Option<Notification>),
  Click(ClickOutcome),
}

/// What a notification click did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickOutcome {
  Closed,
  Focused(u64),
  Opened(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicRegistration {
  pub tag: String,
  pub min_interval: Duration,
}

/// Result of refreshing the data files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
  /// Fetched from the network and stored
  pub refreshed: usize,
  /// Network failed; cached copy kept
  pub offline: usize,
  /// Network failed and nothing cached
  pub unavailable: usize,
}

pub struct ServiceWorker {
  config: Config,
  state: WorkerState,
  classifier: Classifier,
  network: NetworkClient,
  cache: CacheLayer<SqliteStorage>,
  queue: OrderQueue<SqliteStorage>,
  clients: ClientRegistry,
  periodic: Option<PeriodicRegistration>,
}

impl ServiceWorker {
  /// Build a worker over an already opened storage.
  pub fn new(config: Config, storage: Arc<SqliteStorage>) -> Result<Self> {
    let origin = config.origin_url()?;
    let endpoint = Url::parse(&config.delivery.endpoint)
      .map_err(|e| eyre!("Invalid delivery endpoint {}: {}", config.delivery.endpoint, e))?;

    let network = NetworkClient::new(origin)?;
    // Responses are only written back once this version has activated
    let mut cache = CacheLayer::new(Arc::clone(&storage), config.store_name());
    cache.set_write_back(false);
    let queue = OrderQueue::new(storage, endpoint);
    let classifier = Classifier::new(config.cache.data_segment.clone());

    Ok(Self {
      config,
      state: WorkerState::Parsed,
      classifier,
      network,
      cache,
      queue,
      clients: ClientRegistry::new(),
      periodic: None,
    })
  }

  /// Open the configured database and build a worker on it.
  pub fn open(config: Config) -> Result<Self> {
    let path = config.database_path()?;
    let storage = SqliteStorage::open(&path)?;
    Self::new(config, Arc::new(storage))
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn store_name(&self) -> &str {
    self.cache.store_name()
  }

  pub fn storage(&self) -> &SqliteStorage {
    self.cache.storage()
  }

  pub fn clients(&self) -> &ClientRegistry {
    &self.clients
  }

  pub fn queue(&self) -> &OrderQueue<SqliteStorage> {
    &self.queue
  }

  pub fn periodic_registration(&self) -> Option<&PeriodicRegistration> {
    self.periodic.as_ref()
  }

  /// Build a request key resolved against the configured origin.
  pub fn request(&self, method: &str, url: &str) -> Result<RequestKey> {
    RequestKey::new(method, url, self.network.origin())
  }

  /// Dispatch one event to its handler.
  pub async fn handle(&mut self, event: WorkerEvent) -> Result<EventOutcome> {
    match event {
      WorkerEvent::Install => {
        self.install().await?;
        Ok(EventOutcome::Installed)
      }
      WorkerEvent::Activate => {
        let deleted = self.activate()?;
        Ok(EventOutcome::Activated { deleted })
      }
      WorkerEvent::Fetch(request) => Ok(EventOutcome::Response(self.handle_fetch(&request).await?)),
      WorkerEvent::Sync(tag) => Ok(EventOutcome::Synced(self.handle_sync(&tag).await)),
      WorkerEvent::PeriodicSync(tag) => {
        if self.periodic.is_none() {
          debug!(tag = %tag, "periodic sync not registered, ignoring");
          return Ok(EventOutcome::Refreshed(None));
        }
        Ok(EventOutcome::Refreshed(self.handle_periodic_sync(&tag).await?))
      }
      WorkerEvent::Push(data) => Ok(EventOutcome::Notification(self.handle_push(&data)?)),
      WorkerEvent::NotificationClick {
        notification,
        action,
      } => Ok(EventOutcome::Click(
        self.handle_notification_click(&notification, action),
      )),
    }
  }

  /// Populate the versioned store with every manifest entry.
  ///
  /// All-or-nothing: one rejected or non-OK fetch fails the install and
  /// nothing is written.
  pub async fn install(&mut self) -> Result<()> {
    if self.state != WorkerState::Parsed {
      return Err(eyre!("Cannot install from state {:?}", self.state));
    }

    self.state = WorkerState::Installing;
    info!(store = self.store_name(), "installing");

    match self.populate().await {
      Ok(count) => {
        info!(store = self.store_name(), count, "app shell cached, skipping waiting");
        self.state = WorkerState::Installed;
        Ok(())
      }
      Err(e) => {
        error!(store = self.store_name(), error = %e, "install failed");
        self.state = WorkerState::Redundant;
        Err(eyre!("Install of {} failed: {}", self.store_name(), e))
      }
    }
  }

  async fn populate(&self) -> Result<usize> {
    let keys = self
      .config
      .manifest
      .iter()
      .map(|url| RequestKey::get(url, self.network.origin()))
      .collect::<Result<Vec<_>>>()?;

    let fetches = keys.into_iter().map(|key| {
      let network = self.network.clone();
      async move {
        let response = network.fetch(&key).await?;
        if !response.is_ok() {
          return Err(eyre!("{} returned status {}", key, response.status));
        }
        Ok::<_, color_eyre::Report>((key, response))
      }
    });

    let entries = try_join_all(fetches).await?;
    self.storage().put_all(self.store_name(), &entries)?;

    Ok(entries.len())
  }

  /// Pick up an install completed by an earlier run.
  ///
  /// Returns true if the current store was completely installed and the
  /// worker is now `Installed`. A store created by stray writes doesn't count.
  pub fn restore(&mut self) -> Result<bool> {
    if self.state == WorkerState::Parsed && self.storage().is_installed(self.store_name())? {
      debug!(store = self.store_name(), "found existing install");
      self.state = WorkerState::Installed;
      return Ok(true);
    }
    Ok(false)
  }

  /// Delete every store but the current one and claim open clients.
  ///
  /// Returns the names of the deleted stores.
  pub fn activate(&mut self) -> Result<Vec<String>> {
    if self.state != WorkerState::Installed {
      return Err(eyre!("Cannot activate from state {:?}", self.state));
    }

    self.state = WorkerState::Activating;
    info!(store = self.store_name(), "activating");

    let mut deleted = Vec::new();
    for name in self.storage().store_names()? {
      if name != self.store_name() {
        info!(store = %name, "deleting old cache");
        self.storage().delete_store(&name)?;
        deleted.push(name);
      }
    }

    let claimed = self.clients.claim(self.cache.store_name());
    info!(claimed, "claimed clients");

    match self.register_periodic_sync() {
      Ok(registration) => {
        info!(tag = %registration.tag, "periodic sync registered");
        self.periodic = Some(registration);
      }
      Err(e) => warn!(error = %e, "periodic sync not supported"),
    }

    self.cache.set_write_back(true);
    self.state = WorkerState::Activated;
    Ok(deleted)
  }

  fn register_periodic_sync(&self) -> Result<PeriodicRegistration> {
    if !self.config.capabilities.periodic_sync {
      return Err(eyre!("periodic background sync is unavailable on this platform"));
    }

    Ok(PeriodicRegistration {
      tag: self.config.periodic_sync.tag.clone(),
      min_interval: Duration::from_secs(self.config.periodic_sync.min_interval_secs),
    })
  }

  /// Serve a request: network-first for data, cache-first for everything else.
  ///
  /// Before activation responses are served but not stored.
  /// `Ok(None)` means the network failed and nothing was cached.
  pub async fn handle_fetch(
    &self,
    request: &RequestKey,
  ) -> Result<Option<CacheResult<StoredResponse>>> {
    let network = self.network.clone();
    let key = request.clone();
    let fetcher = || async move { network.fetch(&key).await };

    if !request.is_cacheable_method() {
      debug!(request = %request, "bypassing cache");
      return fetcher().await.map(|r| Some(CacheResult::from_network(r)));
    }

    match self.classifier.classify(request) {
      RequestClass::Data => self.cache.network_first(request, fetcher).await,
      RequestClass::Static => self.cache.cache_first(request, fetcher).await.map(Some),
    }
  }

  /// Background sync. Only the order tag triggers a replay; errors are logged.
  pub async fn handle_sync(&self, tag: &str) -> Option<SyncReport> {
    if tag != self.config.delivery.sync_tag {
      debug!(tag, "ignoring sync tag");
      return None;
    }

    info!("background sync for orders");
    match self.queue.replay(&self.network).await {
      Ok(report) => Some(report),
      Err(e) => {
        error!(error = %e, "sync error");
        None
      }
    }
  }

  /// Periodic sync: refresh every data file in the manifest.
  ///
  /// The `PeriodicSync` event only reaches this when periodic sync was
  /// registered at activation. Calling it directly refreshes regardless.
  pub async fn handle_periodic_sync(&self, tag: &str) -> Result<Option<RefreshReport>> {
    if tag != self.config.periodic_sync.tag {
      debug!(tag, "ignoring periodic sync tag");
      return Ok(None);
    }

    let mut report = RefreshReport::default();
    for url in &self.config.manifest {
      let request = RequestKey::get(url, self.network.origin())?;
      if self.classifier.classify(&request) != RequestClass::Data {
        continue;
      }

      match self.cache.network_first(&request, || {
        let network = self.network.clone();
        let key = request.clone();
        async move { network.fetch(&key).await }
      })
      .await?
      {
        Some(result) if result.source == CacheSource::Network => {
          report.refreshed += 1
        }
        Some(_) => report.offline += 1,
        None => report.unavailable += 1,
      }
    }

    info!(
      refreshed = report.refreshed,
      offline = report.offline,
      unavailable = report.unavailable,
      "data refresh finished"
    );
    Ok(Some(report))
  }

  /// Build the notification for a push message, if it carries data.
  pub fn handle_push(&self, data: &[u8]) -> Result<Option<Notification>> {
    let payload = match PushPayload::parse(data)? {
      Some(payload) => payload,
      None => return Ok(None),
    };

    let notification = Notification::from_payload(payload, &self.config.notifications);
    debug!(title = %notification.title, "showing notification");
    Ok(Some(notification))
  }

  /// Focus the first window client, or open one at the notification's url.
  pub fn handle_notification_click(
    &self,
    notification: &Notification,
    action: Option<NotificationAction>,
  ) -> ClickOutcome {
    if action == Some(NotificationAction::Close) {
      return ClickOutcome::Closed;
    }

    if let Some(client) = self.clients.match_all(Some(ClientKind::Window)).first() {
      if self.clients.focus(client.id) {
        return ClickOutcome::Focused(client.id);
      }
    }

    let controller = (self.state == WorkerState::Activated).then(|| self.store_name());
    ClickOutcome::Opened(self.clients.open_window(&notification.url, controller))
  }
}

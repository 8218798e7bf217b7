//! Clients (pages) the worker can control.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
  Window,
  Worker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
  pub id: u64,
  pub url: String,
  pub kind: ClientKind,
  /// Store name of the version controlling this client, if any
  pub controller: Option<String>,
  pub focused: bool,
}

#[derive(Debug, Default)]
struct Inner {
  clients: Vec<Client>,
  next_id: u64,
}

/// Registry of connected clients, oldest first.
#[derive(Debug, Default)]
pub struct ClientRegistry {
  inner: Mutex<Inner>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
    let mut inner = match self.inner.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut inner)
  }

  /// Register a client that is not controlled by any version yet.
  pub fn connect(&self, url: &str, kind: ClientKind) -> u64 {
    self.with(|inner| {
      inner.next_id += 1;
      let id = inner.next_id;
      inner.clients.push(Client {
        id,
        url: url.to_string(),
        kind,
        controller: None,
        focused: false,
      });
      id
    })
  }

  /// Take control of every connected client. Returns how many changed hands.
  pub fn claim(&self, store_name: &str) -> usize {
    self.with(|inner| {
      let mut claimed = 0;
      for client in &mut inner.clients {
        if client.controller.as_deref() != Some(store_name) {
          client.controller = Some(store_name.to_string());
          claimed += 1;
        }
      }
      claimed
    })
  }

  /// Snapshot of clients, optionally filtered by kind.
  pub fn match_all(&self, kind: Option<ClientKind>) -> Vec<Client> {
    self.with(|inner| {
      inner
        .clients
        .iter()
        .filter(|c| kind.map_or(true, |k| c.kind == k))
        .cloned()
        .collect()
    })
  }

  /// Focus a window client. Returns false if it isn't a connected window.
  pub fn focus(&self, id: u64) -> bool {
    self.with(|inner| {
      let is_window = inner
        .clients
        .iter()
        .any(|c| c.id == id && c.kind == ClientKind::Window);
      if is_window {
        for client in &mut inner.clients {
          client.focused = client.id == id;
        }
      }
      is_window
    })
  }

  /// Open a new window client at `url`.
  pub fn open_window(&self, url: &str, controller: Option<&str>) -> u64 {
    let id = self.connect(url, ClientKind::Window);
    self.with(|inner| {
      for client in &mut inner.clients {
        client.focused = client.id == id;
        if client.id == id {
          client.controller = controller.map(String::from);
        }
      }
    });
    id
  }
}

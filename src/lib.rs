//! Offline asset and data cache for the storefront.
//!
//! A versioned response store, the install/activate lifecycle that keeps it
//! current, network-first/cache-first fetch strategies, and a deferred
//! delivery queue for orders submitted while offline.

pub mod cache;
pub mod clients;
pub mod config;
pub mod event;
pub mod logging;
pub mod network;
pub mod push;
pub mod queue;
pub mod request;
pub mod response;
pub mod worker;

pub use config::Config;
pub use worker::{ServiceWorker, WorkerEvent, WorkerState};

//! Service registry contract.
//!
//! A registry has two halves: service registration (used by servers) and
//! service discovery (used by clients). Clients additionally subscribe to
//! change events through a [`Watcher`]. The registry is a shared
//! collaborator: clients neither create nor close it, they only subscribe.

use std::collections::HashMap;

use async_trait::async_trait;

use quillrpc_common::metadata::{MetaMap, MetaValue, PROVIDER_DEGRADE_KEY, TAGS_KEY};
use quillrpc_common::{Result, RpcError};

pub mod memory;

pub use memory::MemoryRegistry;

/// A reachable service endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    /// `<network>@<addr>`, unique within an app.
    pub key: String,
    pub network: String,
    pub addr: String,
    pub meta: MetaMap,
}

impl Provider {
    pub fn new(network: impl Into<String>, addr: impl Into<String>) -> Self {
        let network = network.into();
        let addr = addr.into();
        Provider {
            key: provider_key(&network, &addr),
            network,
            addr,
            meta: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Whether the heartbeat loop has flagged this provider as degraded.
    pub fn is_degraded(&self) -> bool {
        self.meta
            .get(PROVIDER_DEGRADE_KEY)
            .and_then(MetaValue::as_bool)
            .unwrap_or(false)
    }

    /// The advertised tag value for `key`, if the provider carries tags.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.meta
            .get(TAGS_KEY)
            .and_then(MetaValue::as_map)
            .and_then(|tags| tags.get(key))
            .and_then(MetaValue::as_str)
    }
}

pub fn provider_key(network: &str, addr: &str) -> String {
    format!("{network}@{addr}")
}

/// Identifies the application a provider set belongs to.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub app_key: String,
}

/// One update of the provider set.
#[derive(Debug, Clone)]
pub struct Event {
    pub app_key: String,
    pub providers: Vec<Provider>,
}

/// A subscription to provider-set changes. `next` blocks until the next
/// event or until the watcher is closed (directly or via
/// [`Registry::unwatch`]), at which point it fails with
/// [`RpcError::WatcherStopped`].
#[async_trait]
pub trait Watcher: Send {
    fn id(&self) -> &str;
    async fn next(&mut self) -> Result<Event>;
    fn close(&self);
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, options: &RegisterOptions, providers: Vec<Provider>);
    async fn unregister(&self, options: &RegisterOptions, providers: Vec<Provider>);
    async fn get_service_list(&self) -> Vec<Provider>;
    async fn watch(&self) -> Box<dyn Watcher>;
    async fn unwatch(&self, watcher_id: &str);
}

/// Static peer-to-peer discovery: a fixed provider list and a watcher that
/// never fires. Useful for tests and deployments without a registry.
#[derive(Default)]
pub struct Peer2Peer {
    providers: Vec<Provider>,
}

impl Peer2Peer {
    pub fn new() -> Self {
        Peer2Peer::default()
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_providers(mut self, providers: Vec<Provider>) -> Self {
        self.providers.extend(providers);
        self
    }
}

#[async_trait]
impl Registry for Peer2Peer {
    async fn register(&self, _options: &RegisterOptions, _providers: Vec<Provider>) {}

    async fn unregister(&self, _options: &RegisterOptions, _providers: Vec<Provider>) {}

    async fn get_service_list(&self) -> Vec<Provider> {
        self.providers.clone()
    }

    async fn watch(&self) -> Box<dyn Watcher> {
        Box::new(InertWatcher::new())
    }

    async fn unwatch(&self, _watcher_id: &str) {}
}

/// A watcher with no event source: `next` pends until `close`.
struct InertWatcher {
    id: String,
    closed: tokio::sync::Notify,
    is_closed: std::sync::atomic::AtomicBool,
}

impl InertWatcher {
    fn new() -> Self {
        InertWatcher {
            id: uuid::Uuid::new_v4().to_string(),
            closed: tokio::sync::Notify::new(),
            is_closed: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Watcher for InertWatcher {
    fn id(&self) -> &str {
        &self.id
    }

    async fn next(&mut self) -> Result<Event> {
        if !self.is_closed.load(std::sync::atomic::Ordering::Acquire) {
            // notify_one stores a permit, so a close racing ahead of this
            // await still wakes us.
            self.closed.notified().await;
        }
        Err(RpcError::WatcherStopped)
    }

    fn close(&self) {
        self.is_closed
            .store(true, std::sync::atomic::Ordering::Release);
        self.closed.notify_one();
    }
}

//! In-memory registry backend.
//!
//! Keeps the provider set in process memory and broadcasts the full
//! current set to every live watcher on each register/unregister. Suited
//! to tests and single-process deployments; production setups put a real
//! key-value store behind the [`Registry`] contract instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::debug;

use quillrpc_common::{Result, RpcError};

use crate::{Event, Provider, RegisterOptions, Registry, Watcher};

const WATCH_CHANNEL_CAPACITY: usize = 16;

#[derive(Default)]
pub struct MemoryRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    providers: Vec<Provider>,
    watchers: HashMap<String, mpsc::Sender<Event>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        MemoryRegistry::default()
    }

    async fn broadcast(&self, app_key: &str) {
        let (event, senders) = {
            let inner = self.inner.read().await;
            let event = Event {
                app_key: app_key.to_string(),
                providers: inner.providers.clone(),
            };
            let senders: Vec<(String, mpsc::Sender<Event>)> = inner
                .watchers
                .iter()
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect();
            (event, senders)
        };

        let mut dead = Vec::new();
        for (id, tx) in senders {
            // A watcher that stopped draining loses intermediate events;
            // each event carries the full set so only the latest matters.
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(watcher = %id, "watch channel full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.write().await;
            for id in dead {
                inner.watchers.remove(&id);
            }
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, options: &RegisterOptions, providers: Vec<Provider>) {
        {
            let mut inner = self.inner.write().await;
            for p in providers {
                if !inner.providers.iter().any(|cp| cp.key == p.key) {
                    inner.providers.push(p);
                }
            }
        }
        self.broadcast(&options.app_key).await;
    }

    async fn unregister(&self, options: &RegisterOptions, providers: Vec<Provider>) {
        {
            let mut inner = self.inner.write().await;
            inner
                .providers
                .retain(|cp| !providers.iter().any(|up| up.key == cp.key));
        }
        self.broadcast(&options.app_key).await;
    }

    async fn get_service_list(&self) -> Vec<Provider> {
        self.inner.read().await.providers.clone()
    }

    async fn watch(&self) -> Box<dyn Watcher> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let id = uuid::Uuid::new_v4().to_string();
        self.inner
            .write()
            .await
            .watchers
            .insert(id.clone(), tx);
        Box::new(MemoryWatcher {
            id,
            rx,
            exit: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    async fn unwatch(&self, watcher_id: &str) {
        self.inner.write().await.watchers.remove(watcher_id);
    }
}

pub struct MemoryWatcher {
    id: String,
    rx: mpsc::Receiver<Event>,
    exit: Notify,
    closed: AtomicBool,
}

#[async_trait]
impl Watcher for MemoryWatcher {
    fn id(&self) -> &str {
        &self.id
    }

    async fn next(&mut self) -> Result<Event> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::WatcherStopped);
        }
        tokio::select! {
            event = self.rx.recv() => event.ok_or(RpcError::WatcherStopped),
            _ = self.exit.notified() => Err(RpcError::WatcherStopped),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.exit.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> RegisterOptions {
        RegisterOptions {
            app_key: "my-app".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let registry = MemoryRegistry::new();
        registry
            .register(&opts(), vec![Provider::new("tcp", "a:1"), Provider::new("tcp", "b:2")])
            .await;
        assert_eq!(registry.get_service_list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_register_deduplicates_by_key() {
        let registry = MemoryRegistry::new();
        registry
            .register(&opts(), vec![Provider::new("tcp", "a:1")])
            .await;
        registry
            .register(&opts(), vec![Provider::new("tcp", "a:1")])
            .await;
        assert_eq!(registry.get_service_list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_only_named_providers() {
        let registry = MemoryRegistry::new();
        registry
            .register(
                &opts(),
                vec![
                    Provider::new("tcp", "a:1"),
                    Provider::new("tcp", "b:2"),
                    Provider::new("tcp", "c:3"),
                ],
            )
            .await;

        registry
            .unregister(&opts(), vec![Provider::new("tcp", "b:2")])
            .await;

        let remaining = registry.get_service_list().await;
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|p| p.key != "tcp@b:2"));
    }

    #[tokio::test]
    async fn test_watcher_sees_full_set_on_register() {
        let registry = MemoryRegistry::new();
        let mut watcher = registry.watch().await;

        registry
            .register(&opts(), vec![Provider::new("tcp", "a:1")])
            .await;
        let event = watcher.next().await.unwrap();
        assert_eq!(event.app_key, "my-app");
        assert_eq!(event.providers.len(), 1);

        registry
            .register(&opts(), vec![Provider::new("tcp", "b:2")])
            .await;
        let event = watcher.next().await.unwrap();
        assert_eq!(event.providers.len(), 2);
    }

    #[tokio::test]
    async fn test_watcher_sees_removal_on_unregister() {
        let registry = MemoryRegistry::new();
        registry
            .register(&opts(), vec![Provider::new("tcp", "a:1"), Provider::new("tcp", "b:2")])
            .await;

        let mut watcher = registry.watch().await;
        registry
            .unregister(&opts(), vec![Provider::new("tcp", "a:1")])
            .await;

        let event = watcher.next().await.unwrap();
        assert_eq!(event.providers.len(), 1);
        assert_eq!(event.providers[0].key, "tcp@b:2");
    }

    #[tokio::test]
    async fn test_unwatch_stops_watcher() {
        let registry = MemoryRegistry::new();
        let mut watcher = registry.watch().await;
        let id = watcher.id().to_string();

        registry.unwatch(&id).await;
        // The sender is gone: the next recv fails once the buffer drains.
        assert!(matches!(watcher.next().await, Err(RpcError::WatcherStopped)));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_next() {
        let registry = MemoryRegistry::new();
        let mut watcher = registry.watch().await;
        watcher.close();
        assert!(matches!(watcher.next().await, Err(RpcError::WatcherStopped)));
    }

    #[tokio::test]
    async fn test_dead_watchers_are_pruned_on_broadcast() {
        let registry = MemoryRegistry::new();
        let watcher = registry.watch().await;
        drop(watcher);

        registry
            .register(&opts(), vec![Provider::new("tcp", "a:1")])
            .await;
        registry
            .register(&opts(), vec![Provider::new("tcp", "b:2")])
            .await;
        assert!(registry.inner.read().await.watchers.is_empty());
    }
}

//! The service-governance client.
//!
//! Wraps a pool of single-provider clients behind registry-driven
//! discovery, selector-based load balancing, per-provider circuit
//! breakers, heartbeat-driven degradation and the configured fail mode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use quillrpc_common::metadata::{MetaValue, PROVIDER_DEGRADE_KEY};
use quillrpc_common::{Context, Result, RpcError};
use quillrpc_registry::{Provider, Watcher};

use crate::breaker::{CircuitBreaker, WindowBreaker};
use crate::client::{PendingReply, RpcClient};
use crate::interceptor::MetaInterceptor;
use crate::options::{FailMode, SgOptions};
use crate::selector::{degrade_filter, tag_filter};

/// Multi-provider client with service governance.
///
/// Owns its pooled per-provider clients (closed on removal); the registry
/// is a shared collaborator the client only subscribes to.
#[derive(Clone)]
pub struct SgClient {
    inner: Arc<SgInner>,
}

struct SgInner {
    options: SgOptions,
    providers: RwLock<Vec<Provider>>,
    clients: DashMap<String, RpcClient>,
    breakers: DashMap<String, Arc<WindowBreaker>>,
    heartbeat_misses: DashMap<String, u32>,
    shutdown: AtomicBool,
    watcher_id: StdMutex<Option<String>>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SgClient {
    pub async fn new(mut options: SgOptions) -> Self {
        // The meta interceptor runs outermost so later interceptors see
        // the resolved deadline and auth.
        options
            .interceptors
            .insert(0, Arc::new(MetaInterceptor));
        if options.client.heartbeat {
            options.select_options.filters.push(degrade_filter());
        }
        if options.tagged && !options.tags.is_empty() {
            options
                .select_options
                .filters
                .push(tag_filter(options.tags.clone()));
        }

        let providers = options.registry.get_service_list().await;
        info!(count = providers.len(), app = %options.app_key, "initial provider list");

        let inner = Arc::new(SgInner {
            providers: RwLock::new(providers),
            clients: DashMap::new(),
            breakers: DashMap::new(),
            heartbeat_misses: DashMap::new(),
            shutdown: AtomicBool::new(false),
            watcher_id: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
            options,
        });

        let watcher = inner.options.registry.watch().await;
        *inner.watcher_id.lock().unwrap() = Some(watcher.id().to_string());
        let watch_inner = inner.clone();
        let watch_task = tokio::spawn(watch_loop(watch_inner, watcher));
        inner.tasks.lock().unwrap().push(watch_task);

        if inner.options.client.heartbeat && !inner.options.client.heartbeat_interval.is_zero() {
            let hb_inner = inner.clone();
            let hb_task = tokio::spawn(heartbeat_loop(hb_inner));
            inner.tasks.lock().unwrap().push(hb_task);
        }

        SgClient { inner }
    }

    /// Submits a request without waiting; fail modes do not apply to `go`.
    pub async fn go<A: Serialize>(
        &self,
        ctx: &Context,
        service_method: &str,
        arg: &A,
    ) -> Result<PendingReply> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(RpcError::Shutdown);
        }
        let provider = self.select_provider(ctx, service_method).await?;
        let client = self.get_client(&provider).await?;
        let call_ctx = self.decorated(ctx);
        client.go(&call_ctx, service_method, arg).await
    }

    /// Calls `Service.Method` under the configured fail mode.
    ///
    /// `R: Default` backs FailSafe, which swallows errors and returns a
    /// zero-valued reply.
    pub async fn call<A: Serialize, R: DeserializeOwned + Default>(
        &self,
        ctx: &Context,
        service_method: &str,
        arg: &A,
    ) -> Result<R> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(RpcError::Shutdown);
        }

        match self.inner.options.fail_mode {
            FailMode::FailFast => self.call_once(ctx, service_method, arg).await,
            FailMode::FailSafe => match self.call_once(ctx, service_method, arg).await {
                Ok(reply) => Ok(reply),
                Err(e) => {
                    debug!(error = %e, "fail-safe call swallowed error");
                    Ok(R::default())
                }
            },
            FailMode::FailRetry => self.call_retry(ctx, service_method, arg).await,
            FailMode::FailOver => self.call_over(ctx, service_method, arg).await,
        }
    }

    async fn call_once<A: Serialize, R: DeserializeOwned>(
        &self,
        ctx: &Context,
        service_method: &str,
        arg: &A,
    ) -> Result<R> {
        let provider = self.select_provider(ctx, service_method).await?;
        let client = self.get_client(&provider).await?;
        let result = self.attempt(ctx, service_method, arg, &client).await;
        self.record_outcome(&provider.key, result.as_ref().err());
        result
    }

    /// Up to `retries` attempts against the same provider, re-dialing when
    /// the pooled client has shut down.
    async fn call_retry<A: Serialize, R: DeserializeOwned>(
        &self,
        ctx: &Context,
        service_method: &str,
        arg: &A,
    ) -> Result<R> {
        let provider = self.select_provider(ctx, service_method).await?;
        let attempts = self.inner.options.retries.max(1);
        let mut last_err = None;

        for _ in 0..attempts {
            let client = match self.get_client(&provider).await {
                Ok(client) => client,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            match self.attempt(ctx, service_method, arg, &client).await {
                Ok(reply) => {
                    self.record_outcome(&provider.key, None);
                    return Ok(reply);
                }
                Err(e) => {
                    self.record_outcome(&provider.key, Some(&e));
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(RpcError::EmptyProviderList))
    }

    /// Up to `retries` attempts, re-selecting every time; attempts may
    /// land on different providers.
    async fn call_over<A: Serialize, R: DeserializeOwned>(
        &self,
        ctx: &Context,
        service_method: &str,
        arg: &A,
    ) -> Result<R> {
        let attempts = self.inner.options.retries.max(1);
        let mut last_err = None;

        for _ in 0..attempts {
            let provider = match self.select_provider(ctx, service_method).await {
                Ok(provider) => provider,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            let client = match self.get_client(&provider).await {
                Ok(client) => client,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };
            match self.attempt(ctx, service_method, arg, &client).await {
                Ok(reply) => {
                    self.record_outcome(&provider.key, None);
                    return Ok(reply);
                }
                Err(e) => {
                    self.record_outcome(&provider.key, Some(&e));
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(RpcError::EmptyProviderList))
    }

    async fn attempt<A: Serialize, R: DeserializeOwned>(
        &self,
        ctx: &Context,
        service_method: &str,
        arg: &A,
        client: &RpcClient,
    ) -> Result<R> {
        let call_ctx = self.decorated(ctx);
        client.call(&call_ctx, service_method, arg).await
    }

    fn decorated(&self, ctx: &Context) -> Context {
        let mut call_ctx = ctx.clone();
        for interceptor in &self.inner.options.interceptors {
            interceptor.before_call(&self.inner.options, &mut call_ctx);
        }
        call_ctx
    }

    async fn select_provider(&self, ctx: &Context, service_method: &str) -> Result<Provider> {
        let providers = self.inner.providers.read().await.clone();
        self.inner.options.selector.next(
            ctx,
            &providers,
            service_method,
            &self.inner.options.select_options,
        )
    }

    /// The pooled client for a provider, created lazily. Refuses with
    /// [`RpcError::BreakerOpen`] while the provider's breaker is open.
    async fn get_client(&self, provider: &Provider) -> Result<RpcClient> {
        let key = &provider.key;

        if let Some(breaker) = self.inner.breakers.get(key) {
            if !breaker.allow_request() {
                return Err(RpcError::BreakerOpen);
            }
        }

        if let Some(existing) = self.inner.clients.get(key) {
            if !existing.is_shutdown() {
                return Ok(existing.clone());
            }
            drop(existing);
            self.remove_client(key);
        }

        let client = RpcClient::connect(
            &provider.network,
            &provider.addr,
            self.inner.options.client.clone(),
        )
        .await?;
        self.inner.clients.insert(key.clone(), client.clone());

        if self.inner.options.breaker_threshold > 0
            && !self.inner.options.breaker_window.is_zero()
        {
            self.inner.breakers.entry(key.clone()).or_insert_with(|| {
                Arc::new(WindowBreaker::new(
                    self.inner.options.breaker_threshold,
                    self.inner.options.breaker_window,
                ))
            });
        }

        Ok(client)
    }

    fn remove_client(&self, key: &str) {
        if let Some((_, client)) = self.inner.clients.remove(key) {
            client.close();
        }
        self.inner.breakers.remove(key);
    }

    /// Feeds the breaker and applies the eviction rule: only transport-
    /// class errors remove the pooled client; service errors and timeouts
    /// leave it in place.
    fn record_outcome(&self, key: &str, error: Option<&RpcError>) {
        match error {
            None => {
                if let Some(breaker) = self.inner.breakers.get(key) {
                    breaker.success();
                }
            }
            Some(e) => {
                if !matches!(e, RpcError::BreakerOpen) {
                    if let Some(breaker) = self.inner.breakers.get(key) {
                        breaker.fail();
                    }
                }
                if e.evicts_connection() {
                    self.remove_client(key);
                }
            }
        }
    }

    /// The current cached provider list.
    pub async fn providers(&self) -> Vec<Provider> {
        self.inner.providers.read().await.clone()
    }

    /// Drains the pool, unsubscribes from the registry and stops the
    /// background loops.
    pub async fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let keys: Vec<String> = self
            .inner
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.remove_client(&key);
        }

        let watcher_id = self.inner.watcher_id.lock().unwrap().take();
        if let Some(id) = watcher_id {
            self.inner.options.registry.unwatch(&id).await;
        }

        for handle in self.inner.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        info!("governance client closed");
    }
}

/// Pulls events off the registry watcher; each event replaces the cached
/// provider list wholesale.
async fn watch_loop(inner: Arc<SgInner>, mut watcher: Box<dyn Watcher>) {
    loop {
        match watcher.next().await {
            Ok(event) => {
                debug!(count = event.providers.len(), app = %event.app_key, "provider list updated");
                *inner.providers.write().await = event.providers;
            }
            Err(e) => {
                if !inner.shutdown.load(Ordering::Acquire) {
                    warn!(error = %e, "watch service error");
                }
                return;
            }
        }
    }
}

/// Pings every pooled client each tick. Successes reset the per-provider
/// miss counter and clear the degrade flag; misses past the threshold set
/// it, and the degrade filter then excludes the provider from selection.
async fn heartbeat_loop(inner: Arc<SgInner>) {
    let interval = inner.options.client.heartbeat_interval;
    let threshold = inner.options.client.heartbeat_degrade_threshold;
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }

        let snapshot: Vec<(String, RpcClient)> = inner
            .clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let probes = snapshot.into_iter().map(|(key, client)| async move {
            let ctx = Context::background().with_timeout(interval);
            let result = client.ping(&ctx).await;
            (key, result)
        });

        for (key, result) in join_all(probes).await {
            match result {
                Ok(()) => {
                    inner.heartbeat_misses.insert(key.clone(), 0);
                    let mut providers = inner.providers.write().await;
                    for provider in providers.iter_mut() {
                        if provider.key == key {
                            provider.meta.remove(PROVIDER_DEGRADE_KEY);
                        }
                    }
                }
                Err(e) => {
                    let misses = {
                        let mut entry = inner.heartbeat_misses.entry(key.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    warn!(provider = %key, misses, error = %e, "heartbeat miss");
                    if misses > threshold {
                        let mut providers = inner.providers.write().await;
                        for provider in providers.iter_mut() {
                            if provider.key == key {
                                provider
                                    .meta
                                    .insert(PROVIDER_DEGRADE_KEY.to_string(), MetaValue::Bool(true));
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ClientOptions;
    use quillrpc_registry::{MemoryRegistry, Peer2Peer, RegisterOptions, Registry};
    use std::time::Duration;

    #[derive(serde::Serialize, serde::Deserialize, Default, Debug, PartialEq)]
    struct Reply {
        c: i64,
    }

    #[derive(serde::Serialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn test_empty_provider_list_surfaces() {
        let sg = SgClient::new(SgOptions::new(Arc::new(Peer2Peer::new()))).await;
        let err = sg
            .call::<_, Reply>(&Context::background(), "Arith.Add", &Args { a: 1, b: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::EmptyProviderList));
        sg.close().await;
    }

    #[tokio::test]
    async fn test_fail_safe_swallows_errors() {
        // No providers at all: FailFast would error, FailSafe returns the
        // zero reply.
        let options = SgOptions::new(Arc::new(Peer2Peer::new()))
            .with_fail_mode(FailMode::FailSafe, 0);
        let sg = SgClient::new(options).await;
        let reply: Reply = sg
            .call(&Context::background(), "Arith.Add", &Args { a: 1, b: 1 })
            .await
            .unwrap();
        assert_eq!(reply, Reply::default());
        sg.close().await;
    }

    #[tokio::test]
    async fn test_watch_replaces_cached_providers() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let opts = RegisterOptions {
            app_key: "app".to_string(),
        };
        registry
            .register(&opts, vec![Provider::new("tcp", "a:1")])
            .await;

        let sg = SgClient::new(SgOptions::new(registry.clone())).await;
        assert_eq!(sg.providers().await.len(), 1);

        registry
            .register(&opts, vec![Provider::new("tcp", "b:2")])
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sg.providers().await.len(), 2);

        registry
            .unregister(&opts, vec![Provider::new("tcp", "a:1")])
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let remaining = sg.providers().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, "tcp@b:2");
        sg.close().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() {
        let sg = SgClient::new(SgOptions::new(Arc::new(Peer2Peer::new()))).await;
        sg.close().await;
        let err = sg
            .call::<_, Reply>(&Context::background(), "Arith.Add", &Args { a: 1, b: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Shutdown));
    }

    #[tokio::test]
    async fn test_unreachable_provider_fails_fast() {
        let registry = Peer2Peer::new().with_provider(Provider::new("tcp", "127.0.0.1:1"));
        let mut options = SgOptions::new(Arc::new(registry));
        options.client = ClientOptions::default().with_dial_timeout(Duration::from_millis(200));
        let sg = SgClient::new(options).await;
        let err = sg
            .call::<_, Reply>(&Context::background(), "Arith.Add", &Args { a: 1, b: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
        sg.close().await;
    }
}

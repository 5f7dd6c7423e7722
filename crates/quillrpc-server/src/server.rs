//! The server runtime: accept loop, per-connection frame pump, dispatch
//! and graceful shutdown.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use quillrpc_common::frame::{encode_message, read_message};
use quillrpc_common::metadata::{tags_meta, MetaValue, SERVICES_KEY, TAGS_KEY};
use quillrpc_common::net::expand_addr;
use quillrpc_common::protocol::MessageType;
use quillrpc_common::{Connection, Context, Listener, Message, Result, RpcError};
use quillrpc_registry::Provider;

use crate::interceptor::{DefaultServerInterceptor, ServerInterceptor, ServerState};
use crate::options::ServerOptions;
use crate::service::{Service, ServiceInfo};

/// Runs on an external SIGTERM before the server closes.
pub type ShutdownHook = Box<dyn Fn() + Send + Sync>;

/// How often the graceful close re-checks the in-flight gauge.
const SHUTDOWN_TICK: Duration = Duration::from_millis(100);

/// The RPC server.
///
/// Services may be registered before or after `serve`; registration is
/// thread-safe. Each accepted connection is served by its own task;
/// within one connection requests are decoded and dispatched in arrival
/// order, one at a time.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    options: ServerOptions,
    interceptors: Vec<Arc<dyn ServerInterceptor>>,
    services: DashMap<String, Arc<Service>>,
    state: ServerState,
    listener: Mutex<Option<Arc<Listener>>>,
    bound: Mutex<Option<BoundAddr>>,
    registered: Mutex<Option<Provider>>,
    hooks: Mutex<Vec<ShutdownHook>>,
    close_notify: Notify,
}

#[derive(Clone)]
struct BoundAddr {
    network: String,
    /// The dialable address advertised to the registry.
    advertised: String,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let mut interceptors: Vec<Arc<dyn ServerInterceptor>> =
            vec![Arc::new(DefaultServerInterceptor)];
        interceptors.extend(options.interceptors.iter().cloned());

        Server {
            inner: Arc::new(ServerInner {
                options,
                interceptors,
                services: DashMap::new(),
                state: ServerState::default(),
                listener: Mutex::new(None),
                bound: Mutex::new(None),
                registered: Mutex::new(None),
                hooks: Mutex::new(Vec::new()),
                close_notify: Notify::new(),
            }),
        }
    }

    /// Registers a service. Fails when a service of the same name already
    /// exists.
    pub fn register(&self, service: Service) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.inner.services.entry(service.name().to_string()) {
            Entry::Occupied(_) => Err(RpcError::Registration(format!(
                "service already defined: {}",
                service.name()
            ))),
            Entry::Vacant(entry) => {
                info!(service = service.name(), "service registered");
                entry.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// The registered services and their method names.
    pub fn services(&self) -> Vec<ServiceInfo> {
        let mut infos: Vec<ServiceInfo> = self
            .inner
            .services
            .iter()
            .map(|entry| ServiceInfo {
                name: entry.key().clone(),
                methods: entry.value().method_names(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn add_shutdown_hook(&self, hook: ShutdownHook) {
        self.inner.hooks.lock().unwrap().push(hook);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.is_shutdown()
    }

    /// Binds the transport. A leading `:port` binds every interface and
    /// advertises the local IPv4. Returns the concrete bound address so
    /// callers using port 0 can learn the port.
    pub async fn bind(&self, network: &str, addr: &str) -> Result<SocketAddr> {
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };
        let listener = Listener::bind(network, &bind_addr).await?;
        let actual = listener.local_addr()?;

        let advertised = if addr.starts_with(':') {
            expand_addr(&format!(":{}", actual.port()))
        } else {
            actual.to_string()
        };

        *self.inner.listener.lock().unwrap() = Some(Arc::new(listener));
        *self.inner.bound.lock().unwrap() = Some(BoundAddr {
            network: network.to_string(),
            advertised,
        });
        Ok(actual)
    }

    /// Convenience: bind then serve.
    pub async fn serve_addr(&self, network: &str, addr: &str) -> Result<()> {
        self.bind(network, addr).await?;
        self.serve().await
    }

    /// Registers the provider with the registry (when configured), then
    /// accepts connections until `close` is called. Accept errors during
    /// shutdown are swallowed; any other accept error terminates the
    /// server.
    pub async fn serve(&self) -> Result<()> {
        if self.inner.state.is_shutdown() {
            return Ok(());
        }
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RpcError::Transport("serve called before bind".to_string()))?;

        self.register_provider().await;
        self.spawn_sigterm_listener();

        for interceptor in &self.inner.interceptors {
            interceptor.on_serve(&self.inner.state);
        }

        let bound = self.inner.bound.lock().unwrap().clone();
        if let Some(bound) = &bound {
            info!(network = %bound.network, addr = %bound.advertised, "server listening");
        }

        loop {
            if self.inner.state.is_shutdown() {
                return Ok(());
            }
            let conn = tokio::select! {
                // notify_one leaves a permit behind, so a close racing a
                // non-awaiting loop is still observed on the next pass.
                _ = self.inner.close_notify.notified() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        if self.inner.state.is_shutdown() {
                            return Ok(());
                        }
                        warn!(error = %e, "accept failed");
                        return Err(e);
                    }
                },
            };

            let inner = self.inner.clone();
            tokio::spawn(async move {
                handle_connection(inner, conn).await;
            });
        }
    }

    /// Graceful shutdown: stop accepting once in-flight requests drain or
    /// the shutdown wait elapses, then drop the listener and unregister.
    pub async fn close(&self) {
        if self.inner.state.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let deadline = Instant::now() + self.inner.options.shutdown_wait;
        let mut tick = tokio::time::interval(SHUTDOWN_TICK);
        loop {
            if self.inner.state.in_flight.load(Ordering::Acquire) <= 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.inner.state.in_flight.load(Ordering::Acquire),
                    "shutdown wait elapsed with requests still in flight"
                );
                break;
            }
            tick.tick().await;
        }

        self.inner.close_notify.notify_one();
        *self.inner.listener.lock().unwrap() = None;

        for interceptor in &self.inner.interceptors {
            interceptor.on_close(&self.inner.state);
        }

        self.unregister_provider().await;
        info!("server closed");
    }

    async fn register_provider(&self) {
        let Some(registry) = self.inner.options.registry.clone() else {
            return;
        };
        let Some(bound) = self.inner.bound.lock().unwrap().clone() else {
            return;
        };

        let mut provider = Provider::new(bound.network.clone(), bound.advertised.clone());
        if !self.inner.options.tags.is_empty() {
            provider
                .meta
                .insert(TAGS_KEY.to_string(), tags_meta(&self.inner.options.tags));
        }
        let services: std::collections::HashMap<String, MetaValue> = self
            .services()
            .into_iter()
            .map(|info| (info.name, MetaValue::Str(info.methods.join(","))))
            .collect();
        provider
            .meta
            .insert(SERVICES_KEY.to_string(), MetaValue::Map(services));

        info!(provider = %provider.key, app = %self.inner.options.register_options.app_key,
              "registering provider");
        registry
            .register(&self.inner.options.register_options, vec![provider.clone()])
            .await;
        *self.inner.registered.lock().unwrap() = Some(provider);
    }

    async fn unregister_provider(&self) {
        let Some(registry) = self.inner.options.registry.clone() else {
            return;
        };
        let Some(provider) = self.inner.registered.lock().unwrap().take() else {
            return;
        };
        info!(provider = %provider.key, "unregistering provider");
        registry
            .unregister(&self.inner.options.register_options, vec![provider])
            .await;
    }

    /// Runs registered shutdown hooks, then closes the server, when the
    /// process receives SIGTERM.
    fn spawn_sigterm_listener(&self) {
        #[cfg(unix)]
        {
            let server = self.clone();
            tokio::spawn(async move {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
                if sigterm.recv().await.is_some() {
                    info!("SIGTERM received, running shutdown hooks");
                    {
                        let hooks = server.inner.hooks.lock().unwrap();
                        for hook in hooks.iter() {
                            hook();
                        }
                    }
                    server.close().await;
                }
            });
        }
    }
}

/// One task per accepted connection: decode a frame, dispatch, write the
/// response, repeat. Requests on one connection never pipeline.
async fn handle_connection(inner: Arc<ServerInner>, mut conn: Connection) {
    let peer = conn.peer_addr();
    debug!(%peer, "connection established");

    loop {
        if inner.state.is_shutdown() {
            break;
        }

        let request = match read_message(conn.stream_mut()).await {
            Ok(msg) => msg,
            Err(e) if e.is_connection_closed() => {
                debug!(%peer, "client closed connection");
                break;
            }
            Err(e) => {
                warn!(%peer, error = %e, "failed to read request");
                break;
            }
        };

        let mut response = request.response_template();
        let mut ctx = Context::background();
        if let Some(deadline) = request.header.deadline() {
            ctx.set_deadline(deadline);
        }

        // before_request top-down; remember how far we got so the matching
        // after_request calls stay paired even on failure.
        let mut ran = 0;
        let mut rejected = None;
        for interceptor in &inner.interceptors {
            match interceptor.before_request(&inner.state, &mut ctx, &request) {
                Ok(()) => ran += 1,
                Err(e) => {
                    rejected = Some(e);
                    break;
                }
            }
        }

        match rejected {
            Some(e) => response.set_error(e.to_string()),
            None => process(&inner, &ctx, &request, &mut response).await,
        }

        for interceptor in inner.interceptors[..ran].iter().rev() {
            interceptor.after_request(&inner.state, &ctx, &mut response);
        }

        if ctx.expired() {
            warn!(%peer, seq = request.header.seq, "deadline passed, giving up response write");
            continue;
        }

        match encode_message(&response) {
            Ok(bytes) => {
                // A failed write does not close the connection; the next
                // read detects EOF if the peer is really gone.
                if let Err(e) = conn.stream_mut().write_all(&bytes).await {
                    warn!(%peer, error = %e, "write response error");
                }
            }
            Err(e) => warn!(%peer, error = %e, "encode response error"),
        }
    }
}

/// Decode → dispatch → encode for one request. Any failure becomes an
/// Error-status response; the connection stays up.
async fn process(inner: &Arc<ServerInner>, ctx: &Context, request: &Message, response: &mut Message) {
    if request.header.message_type == MessageType::Heartbeat {
        return;
    }

    let Some(service) = inner
        .services
        .get(&request.header.service_name)
        .map(|s| s.value().clone())
    else {
        response.set_error("can not find service");
        return;
    };
    let Some(method) = service.method(&request.header.method_name) else {
        response.set_error("can not find method");
        return;
    };

    let codec = request.serializer_or(inner.options.serializer);
    response.header.serialize_type = codec.as_tag();

    match method(ctx.clone(), request.body.clone(), codec).await {
        Ok(body) => {
            response.body = body;
        }
        Err(e) => response.set_error(e.to_string()),
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use quillrpc_common::{CompressType, MetaValue, Serializer, TransportKind};
use quillrpc_registry::Registry;

use crate::interceptor::CallInterceptor;
use crate::selector::{RandomSelector, SelectOptions, Selector};

/// Options for a single-provider client.
#[derive(Clone)]
pub struct ClientOptions {
    pub serializer: Serializer,
    pub compress: CompressType,
    pub transport: TransportKind,
    pub dial_timeout: Duration,
    /// Default per-call timeout when the context carries no deadline.
    /// Zero means no timeout.
    pub request_timeout: Duration,
    pub heartbeat: bool,
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat misses after which the client flags itself
    /// degraded.
    pub heartbeat_degrade_threshold: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            serializer: Serializer::MessagePack,
            compress: CompressType::None,
            transport: TransportKind::Tcp,
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::ZERO,
            heartbeat: false,
            heartbeat_interval: Duration::ZERO,
            heartbeat_degrade_threshold: u32::MAX,
        }
    }
}

impl ClientOptions {
    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, degrade_threshold: u32) -> Self {
        self.heartbeat = true;
        self.heartbeat_interval = interval;
        self.heartbeat_degrade_threshold = degrade_threshold;
        self
    }
}

/// Cluster fault-tolerance policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Surface the first error immediately.
    FailFast,
    /// Retry against a different provider, re-selecting each attempt.
    FailOver,
    /// Retry against the same provider, re-dialing if it shut down.
    FailRetry,
    /// Swallow the error and return success with a zero-valued reply.
    FailSafe,
}

/// Options for the service-governance client.
#[derive(Clone)]
pub struct SgOptions {
    pub app_key: String,
    pub fail_mode: FailMode,
    /// Attempt budget for FailOver/FailRetry. At least one attempt always
    /// runs.
    pub retries: u32,
    pub registry: Arc<dyn Registry>,
    pub selector: Arc<dyn Selector>,
    pub select_options: SelectOptions,
    pub interceptors: Vec<Arc<dyn CallInterceptor>>,
    /// Opaque auth token injected into every call's metadata.
    pub auth: String,
    /// Circuit breaking is enabled when both threshold and window are
    /// non-zero.
    pub breaker_threshold: u64,
    pub breaker_window: Duration,
    /// When tagged, providers must advertise matching tags to be selected.
    pub tagged: bool,
    pub tags: HashMap<String, String>,
    /// User metadata propagated with every call.
    pub meta: HashMap<String, MetaValue>,
    pub client: ClientOptions,
}

impl SgOptions {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        SgOptions {
            app_key: String::new(),
            fail_mode: FailMode::FailFast,
            retries: 0,
            registry,
            selector: Arc::new(RandomSelector),
            select_options: SelectOptions::default(),
            interceptors: Vec::new(),
            auth: String::new(),
            breaker_threshold: 0,
            breaker_window: Duration::ZERO,
            tagged: false,
            tags: HashMap::new(),
            meta: HashMap::new(),
            client: ClientOptions::default(),
        }
    }

    pub fn with_app_key(mut self, app_key: impl Into<String>) -> Self {
        self.app_key = app_key.into();
        self
    }

    pub fn with_fail_mode(mut self, mode: FailMode, retries: u32) -> Self {
        self.fail_mode = mode;
        self.retries = retries;
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = token.into();
        self
    }

    pub fn with_breaker(mut self, threshold: u64, window: Duration) -> Self {
        self.breaker_threshold = threshold;
        self.breaker_window = window;
        self
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tagged = true;
        self.tags = tags;
        self
    }

    pub fn with_client_options(mut self, client: ClientOptions) -> Self {
        self.client = client;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn CallInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use quillrpc_common::{CompressType, Serializer, TransportKind};
use quillrpc_registry::{RegisterOptions, Registry};

use crate::interceptor::ServerInterceptor;

/// Server configuration. Everything is optional except what `Default`
/// provides; a registry is only needed when the server should advertise
/// itself.
#[derive(Clone)]
pub struct ServerOptions {
    pub app_key: String,
    pub registry: Option<Arc<dyn Registry>>,
    pub register_options: RegisterOptions,
    /// Upper bound on how long `close` waits for in-flight requests.
    pub shutdown_wait: Duration,
    /// Advertised as provider meta under the `tags` key.
    pub tags: HashMap<String, String>,
    pub serializer: Serializer,
    pub compress: CompressType,
    pub transport: TransportKind,
    pub interceptors: Vec<Arc<dyn ServerInterceptor>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            app_key: String::new(),
            registry: None,
            register_options: RegisterOptions::default(),
            shutdown_wait: Duration::from_secs(12),
            tags: HashMap::new(),
            serializer: Serializer::MessagePack,
            compress: CompressType::None,
            transport: TransportKind::Tcp,
            interceptors: Vec::new(),
        }
    }
}

impl ServerOptions {
    pub fn with_app_key(mut self, app_key: impl Into<String>) -> Self {
        let app_key = app_key.into();
        self.register_options.app_key = app_key.clone();
        self.app_key = app_key;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_shutdown_wait(mut self, wait: Duration) -> Self {
        self.shutdown_wait = wait;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn ServerInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ServerOptions::default();
        assert_eq!(options.shutdown_wait, Duration::from_secs(12));
        assert_eq!(options.serializer, Serializer::MessagePack);
        assert!(options.registry.is_none());
        assert!(options.interceptors.is_empty());
    }

    #[test]
    fn test_app_key_mirrors_into_register_options() {
        let options = ServerOptions::default().with_app_key("my-app");
        assert_eq!(options.app_key, "my-app");
        assert_eq!(options.register_options.app_key, "my-app");
    }
}

//! Service and method registration.
//!
//! Methods are registered as typed async handlers and erased into a
//! dispatch table keyed by method name: each entry is a thunk that decodes
//! the request body into the handler's argument type, invokes it, and
//! encodes the reply with the same codec. This replaces the runtime method
//! enumeration a reflective language would use.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use quillrpc_common::{Context, Result, RpcError, Serializer};

/// An error returned by a user method. The message travels back to the
/// caller verbatim in the response header.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MethodError(pub String);

impl MethodError {
    pub fn new(msg: impl Into<String>) -> Self {
        MethodError(msg.into())
    }
}

impl From<&str> for MethodError {
    fn from(msg: &str) -> Self {
        MethodError(msg.to_string())
    }
}

impl From<String> for MethodError {
    fn from(msg: String) -> Self {
        MethodError(msg)
    }
}

type ErasedMethod =
    Arc<dyn Fn(Context, Vec<u8>, Serializer) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// A named service: a dispatch table of erased methods.
pub struct Service {
    name: String,
    methods: HashMap<String, ErasedMethod>,
}

impl Service {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn method(&self, name: &str) -> Option<&ErasedMethod> {
        self.methods.get(name)
    }
}

/// Builder collecting typed methods for one service.
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, ErasedMethod>,
}

impl ServiceBuilder {
    /// Registers an async method `(Context, Arg) -> Result<Reply, MethodError>`.
    ///
    /// The argument type must deserialize from, and the reply type
    /// serialize to, every codec the server accepts. Registering the same
    /// method name twice keeps the last registration.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, MethodError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedMethod = Arc::new(move |ctx, body, codec| {
            let handler = handler.clone();
            Box::pin(async move {
                let arg: A = codec
                    .decode(&body)
                    .map_err(|e| RpcError::Codec(format!("decode arg error: {e}")))?;
                match handler(ctx, arg).await {
                    Ok(reply) => codec.encode(&reply),
                    Err(e) => Err(RpcError::Service(e.to_string())),
                }
            })
        });
        self.methods.insert(name.into(), erased);
        self
    }

    /// Finalizes the service. A service exposing zero methods is a
    /// registration error.
    pub fn build(self) -> Result<Service> {
        if self.name.is_empty() {
            return Err(RpcError::Registration("service name is empty".to_string()));
        }
        if self.methods.is_empty() {
            return Err(RpcError::Registration(format!(
                "service {} has no methods of suitable type",
                self.name
            )));
        }
        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// A service name plus its exported method names, as advertised in the
/// provider meta and returned by `Server::services`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    pub methods: Vec<String>,
}

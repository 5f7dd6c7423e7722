//! Server-side request interception.
//!
//! Interceptors are ordered, outermost first. For each request the server
//! runs every `before_request` top-down, dispatches, then runs every
//! `after_request` bottom-up; a `before_request` error short-circuits
//! dispatch into an error response (the `after_request` of interceptors
//! that already ran still fires, keeping paired state balanced).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use quillrpc_common::{Context, Message, RpcError};

/// Shared server state visible to interceptors.
#[derive(Default)]
pub struct ServerState {
    pub(crate) shutdown: AtomicBool,
    pub(crate) in_flight: AtomicI64,
}

impl ServerState {
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }
}

pub trait ServerInterceptor: Send + Sync {
    fn on_serve(&self, _state: &ServerState) {}

    fn before_request(
        &self,
        _state: &ServerState,
        _ctx: &mut Context,
        _request: &Message,
    ) -> Result<(), RpcError> {
        Ok(())
    }

    fn after_request(&self, _state: &ServerState, _ctx: &Context, _response: &mut Message) {}

    fn on_close(&self, _state: &ServerState) {}
}

/// The default interceptor the server installs outermost: lifts the
/// request's metadata into the context and maintains the in-flight gauge
/// graceful shutdown spins on.
pub struct DefaultServerInterceptor;

impl ServerInterceptor for DefaultServerInterceptor {
    fn before_request(
        &self,
        state: &ServerState,
        ctx: &mut Context,
        request: &Message,
    ) -> Result<(), RpcError> {
        for (key, value) in &request.header.meta {
            ctx.set_meta(key.clone(), value.clone());
        }
        state.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn after_request(&self, state: &ServerState, _ctx: &Context, _response: &mut Message) {
        state.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

type AuthCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Token authentication: validates the request's auth metadata with a
/// user-supplied predicate before dispatch.
pub struct AuthInterceptor {
    check: AuthCheck,
}

impl AuthInterceptor {
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        AuthInterceptor {
            check: Arc::new(check),
        }
    }
}

impl ServerInterceptor for AuthInterceptor {
    fn before_request(
        &self,
        _state: &ServerState,
        ctx: &mut Context,
        _request: &Message,
    ) -> Result<(), RpcError> {
        match ctx.auth() {
            Some(token) if (self.check)(token) => Ok(()),
            _ => Err(RpcError::Service("auth failed".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillrpc_common::metadata::MetaValue;
    use quillrpc_common::protocol::{Header, MessageType};
    use quillrpc_common::Serializer;

    fn request_with_meta(key: &str, value: MetaValue) -> Message {
        let mut header = Header::new(1, MessageType::Request, Serializer::MessagePack);
        header.meta.insert(key.to_string(), value);
        Message::new(header)
    }

    #[test]
    fn test_default_interceptor_installs_meta_and_counts() {
        let state = ServerState::default();
        let interceptor = DefaultServerInterceptor;
        let request = request_with_meta("trace", MetaValue::Str("t1".into()));
        let mut ctx = Context::background();

        interceptor
            .before_request(&state, &mut ctx, &request)
            .unwrap();
        assert_eq!(ctx.meta("trace").and_then(MetaValue::as_str), Some("t1"));
        assert_eq!(state.in_flight(), 1);

        let mut response = request.response_template();
        interceptor.after_request(&state, &ctx, &mut response);
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn test_auth_interceptor_accepts_valid_token() {
        let state = ServerState::default();
        let interceptor = AuthInterceptor::new(|token| token == "hunter2");
        let request = request_with_meta(
            quillrpc_common::metadata::AUTH_KEY,
            MetaValue::Str("hunter2".into()),
        );
        let mut ctx = Context::from_header(&request.header);
        assert!(interceptor.before_request(&state, &mut ctx, &request).is_ok());
    }

    #[test]
    fn test_auth_interceptor_rejects_bad_or_missing_token() {
        let state = ServerState::default();
        let interceptor = AuthInterceptor::new(|token| token == "hunter2");

        let request = request_with_meta(
            quillrpc_common::metadata::AUTH_KEY,
            MetaValue::Str("wrong".into()),
        );
        let mut ctx = Context::from_header(&request.header);
        let err = interceptor
            .before_request(&state, &mut ctx, &request)
            .unwrap_err();
        assert_eq!(err.to_string(), "auth failed");

        let request = Message::new(Header::new(2, MessageType::Request, Serializer::MessagePack));
        let mut ctx = Context::from_header(&request.header);
        assert!(interceptor
            .before_request(&state, &mut ctx, &request)
            .is_err());
    }
}

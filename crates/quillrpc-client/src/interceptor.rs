//! Client-side call interception.
//!
//! Interceptors run in order right before a call leaves the governance
//! client, decorating the per-call context. The default chain starts with
//! [`MetaInterceptor`].

use std::time::SystemTime;

use quillrpc_common::metadata::{MetaValue, AUTH_KEY, REQUEST_TIMEOUT_KEY};
use quillrpc_common::Context;

use crate::options::SgOptions;

pub trait CallInterceptor: Send + Sync {
    fn before_call(&self, options: &SgOptions, ctx: &mut Context);
}

/// Resolves the effective timeout and reflects the per-call plumbing into
/// the metadata map: timeout, deadline, auth token and user metadata.
///
/// A deadline already on the context wins over the option default; an
/// auth token already in the context metadata wins over the option token.
pub struct MetaInterceptor;

impl CallInterceptor for MetaInterceptor {
    fn before_call(&self, options: &SgOptions, ctx: &mut Context) {
        let timeout = match ctx.remaining() {
            Some(remaining) => remaining,
            None => options.client.request_timeout,
        };
        if !timeout.is_zero() {
            if ctx.deadline().is_none() {
                ctx.set_deadline(SystemTime::now() + timeout);
            }
            ctx.set_meta(
                REQUEST_TIMEOUT_KEY,
                MetaValue::Uint(timeout.as_millis() as u64),
            );
        }

        if !options.auth.is_empty() && ctx.meta(AUTH_KEY).is_none() {
            ctx.set_meta(AUTH_KEY, MetaValue::Str(options.auth.clone()));
        }

        for (key, value) in &options.meta {
            if ctx.meta(key).is_none() {
                ctx.set_meta(key.clone(), value.clone());
            }
        }

        ctx.reflect_deadline();
    }
}

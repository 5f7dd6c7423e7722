//! quillrpc client runtime.
//!
//! Two layers:
//!
//! - [`RpcClient`]: one connection to one provider, with a pending-call
//!   table, a response demultiplexer and an optional heartbeat loop.
//! - [`SgClient`]: the service-governance client most callers want —
//!   registry discovery, filters and selectors, per-provider circuit
//!   breakers, heartbeat-driven degradation and fail-mode fault
//!   tolerance over a pool of `RpcClient`s.
//!
//! ```no_run
//! use std::sync::Arc;
//! use quillrpc_client::{FailMode, SgClient, SgOptions};
//! use quillrpc_common::Context;
//! use quillrpc_registry::MemoryRegistry;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize)]
//! struct Args { a: i64, b: i64 }
//! #[derive(Deserialize, Default)]
//! struct Reply { c: i64 }
//!
//! # #[tokio::main]
//! # async fn main() -> quillrpc_common::Result<()> {
//! let registry = Arc::new(MemoryRegistry::new());
//! let options = SgOptions::new(registry)
//!     .with_app_key("my-app")
//!     .with_fail_mode(FailMode::FailOver, 3);
//! let client = SgClient::new(options).await;
//! let reply: Reply = client
//!     .call(&Context::background(), "Arith.Add", &Args { a: 7, b: 5 })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod client;
pub mod interceptor;
pub mod options;
pub mod selector;
pub mod sg_client;

pub use breaker::{BreakerState, CircuitBreaker, WindowBreaker};
pub use client::{PendingReply, RpcClient};
pub use interceptor::{CallInterceptor, MetaInterceptor};
pub use options::{ClientOptions, FailMode, SgOptions};
pub use selector::{
    degrade_filter, tag_filter, Filter, HashSelector, PinnedSelector, RandomSelector,
    SelectOptions, Selector,
};
pub use sg_client::SgClient;

//! quillrpc: a service-governance RPC framework.
//!
//! One process calls exported methods on another over a length-prefixed
//! binary protocol, with pluggable serialization, registry-driven service
//! discovery, client-side load balancing and fault tolerance, and
//! server-side request interception.
//!
//! This crate is a facade over the workspace members:
//!
//! - [`common`] — wire protocol, codecs, transport, metadata
//! - [`registry`] — registry contract and the in-memory backend
//! - [`server`] — server runtime
//! - [`client`] — single-provider and service-governance clients

pub use quillrpc_client as client;
pub use quillrpc_common as common;
pub use quillrpc_registry as registry;
pub use quillrpc_server as server;

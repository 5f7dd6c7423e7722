//! quillrpc server runtime.
//!
//! Register services built from typed async handlers, bind a transport,
//! and serve:
//!
//! ```no_run
//! use quillrpc_common::Context;
//! use quillrpc_server::{Server, ServerOptions, Service};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args { a: i64, b: i64 }
//! #[derive(Serialize, Deserialize)]
//! struct Reply { c: i64 }
//!
//! # #[tokio::main]
//! # async fn main() -> quillrpc_common::Result<()> {
//! let server = Server::new(ServerOptions::default());
//! server.register(
//!     Service::builder("Arith")
//!         .method("Add", |_ctx: Context, args: Args| async move {
//!             Ok(Reply { c: args.a + args.b })
//!         })
//!         .build()?,
//! )?;
//! server.serve_addr("tcp", "127.0.0.1:8880").await
//! # }
//! ```

pub mod interceptor;
pub mod options;
pub mod server;
pub mod service;

pub use interceptor::{AuthInterceptor, DefaultServerInterceptor, ServerInterceptor, ServerState};
pub use options::ServerOptions;
pub use server::{Server, ShutdownHook};
pub use service::{MethodError, Service, ServiceBuilder, ServiceInfo};

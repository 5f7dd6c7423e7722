//! Shared fixtures for the integration suites.
#![allow(dead_code)] // each test binary uses a different subset

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use quillrpc::common::Context;
use quillrpc::registry::Registry;
use quillrpc::server::{MethodError, Server, ServerOptions, Service};

#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq)]
pub struct Args {
    pub a: i64,
    pub b: i64,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq)]
pub struct Reply {
    pub c: i64,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct WhoReply {
    pub id: String,
}

pub fn arith_service() -> Service {
    Service::builder("Arith")
        .method("Add", |_ctx: Context, args: Args| async move {
            Ok(Reply { c: args.a + args.b })
        })
        .method("Minus", |_ctx: Context, args: Args| async move {
            Ok(Reply { c: args.a - args.b })
        })
        .method("Divide", |_ctx: Context, args: Args| async move {
            if args.b == 0 {
                return Err(MethodError::from("divided by 0"));
            }
            Ok(Reply { c: args.a / args.b })
        })
        .build()
        .unwrap()
}

/// A service answering with a fixed identity, so tests can observe which
/// server handled a call.
pub fn who_service(id: &str) -> Service {
    let id = id.to_string();
    Service::builder("Who")
        .method("Am", move |_ctx: Context, _args: Args| {
            let id = id.clone();
            async move { Ok(WhoReply { id }) }
        })
        .build()
        .unwrap()
}

pub struct TestServer {
    pub server: Server,
    pub addr: String,
}

/// Boots an Arith server on an ephemeral port. Pass a registry to have it
/// advertise itself, and tags to attach to the advertisement.
pub async fn start_server(
    registry: Option<Arc<dyn Registry>>,
    tags: &[(&str, &str)],
    extra: Vec<Service>,
) -> TestServer {
    let mut options = ServerOptions::default()
        .with_app_key("my-app")
        .with_shutdown_wait(Duration::from_millis(300));
    if let Some(registry) = registry {
        options = options.with_registry(registry);
    }
    for (key, value) in tags {
        options = options.with_tag(*key, *value);
    }

    let server = Server::new(options);
    server.register(arith_service()).unwrap();
    for service in extra {
        server.register(service).unwrap();
    }

    let addr = server.bind("tcp", "127.0.0.1:0").await.unwrap().to_string();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    // Give the accept loop and registration a beat to come up.
    tokio::time::sleep(Duration::from_millis(30)).await;

    TestServer { server, addr }
}

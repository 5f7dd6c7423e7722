//! Single-provider client.
//!
//! Owns one connection. Callers submit requests through `go`/`call`; a
//! background receive loop demultiplexes responses back to their pending
//! calls by sequence number. Responses may arrive in any order.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use quillrpc_common::frame::{encode_message, read_message};
use quillrpc_common::protocol::MessageType;
use quillrpc_common::{
    Connection, Context, DialOptions, Header, Message, Result, RpcError, Serializer,
};

use crate::options::ClientOptions;

struct PendingEntry {
    service_method: String,
    tx: oneshot::Sender<Result<Message>>,
}

/// A submitted request awaiting its response.
pub struct PendingReply {
    seq: u64,
    serializer: Serializer,
    rx: oneshot::Receiver<Result<Message>>,
}

impl PendingReply {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Waits for the raw response message.
    pub async fn message(self) -> Result<Message> {
        match self.rx.await {
            Ok(result) => result,
            // Sender dropped without a response: the client went away.
            Err(_) => Err(RpcError::Shutdown),
        }
    }

    /// Waits for the response and decodes the reply body.
    pub async fn reply<R: DeserializeOwned>(self) -> Result<R> {
        let fallback = self.serializer;
        let msg = self.message().await?;
        let codec = msg.serializer_or(fallback);
        codec.decode(&msg.body)
    }
}

/// A client bound to one provider connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    network: String,
    addr: String,
    options: ClientOptions,
    seq: AtomicU64,
    pending: DashMap<u64, PendingEntry>,
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    shutdown: AtomicBool,
    degraded: AtomicBool,
    heartbeat_misses: AtomicU32,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RpcClient {
    /// Dials the provider and starts the receive loop (and, when enabled,
    /// the heartbeat loop).
    pub async fn connect(network: &str, addr: &str, options: ClientOptions) -> Result<Self> {
        let dial = DialOptions {
            timeout: (!options.dial_timeout.is_zero()).then_some(options.dial_timeout),
        };
        let conn = Connection::dial(network, addr, dial).await?;
        let (read_half, write_half) = conn.into_split();

        let inner = Arc::new(ClientInner {
            network: network.to_string(),
            addr: addr.to_string(),
            options,
            seq: AtomicU64::new(0),
            pending: DashMap::new(),
            writer: Mutex::new(write_half),
            shutdown: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            heartbeat_misses: AtomicU32::new(0),
            tasks: StdMutex::new(Vec::new()),
        });
        let client = RpcClient { inner };

        let recv = tokio::spawn(receive_loop(client.inner.clone(), read_half));
        client.inner.tasks.lock().unwrap().push(recv);

        if client.inner.options.heartbeat && !client.inner.options.heartbeat_interval.is_zero() {
            let hb = tokio::spawn(heartbeat_loop(client.clone()));
            client.inner.tasks.lock().unwrap().push(hb);
        }

        info!(network, addr, "connected");
        Ok(client)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Whether the local heartbeat loop has crossed its miss threshold.
    /// Recovery is driven by the governance client, not locally.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    /// Submits a request without waiting for the response. An empty
    /// `service_method` sends a body-less heartbeat probe.
    pub async fn go<A: Serialize>(
        &self,
        ctx: &Context,
        service_method: &str,
        arg: &A,
    ) -> Result<PendingReply> {
        if self.is_shutdown() {
            return Err(RpcError::Shutdown);
        }

        let seq = self.inner.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let serializer = self.inner.options.serializer;

        let mut header = Header::new(seq, MessageType::Request, serializer);
        header.compress_type = self.inner.options.compress;
        header.meta = ctx.metadata().clone();

        let body = if service_method.is_empty() {
            header.message_type = MessageType::Heartbeat;
            Vec::new()
        } else {
            let (service, method) = service_method.split_once('.').ok_or_else(|| {
                RpcError::Dispatch(format!(
                    "service method {service_method:?} must be Service.Method"
                ))
            })?;
            header.service_name = service.to_string();
            header.method_name = method.to_string();
            serializer.encode(arg)?
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            seq,
            PendingEntry {
                service_method: service_method.to_string(),
                tx,
            },
        );

        let frame = match encode_message(&Message { header, body }) {
            Ok(frame) => frame,
            Err(e) => {
                self.inner.pending.remove(&seq);
                return Err(e);
            }
        };

        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.write_all(&frame).await {
            drop(writer);
            self.inner.pending.remove(&seq);
            warn!(addr = %self.inner.addr, error = %e, "client write error");
            return Err(RpcError::Transport(format!("write: {e}")));
        }

        Ok(PendingReply {
            seq,
            serializer,
            rx,
        })
    }

    /// Submits a request and waits for its reply, racing the context
    /// deadline. A timed-out call is removed from the pending table; its
    /// late response, if any, is dropped silently by the receive loop.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        ctx: &Context,
        service_method: &str,
        arg: &A,
    ) -> Result<R> {
        let pending = self.go(ctx, service_method, arg).await?;
        let seq = pending.seq();

        match ctx.remaining() {
            Some(remaining) => {
                match tokio::time::timeout(remaining, pending.reply::<R>()).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.inner.pending.remove(&seq);
                        Err(RpcError::Timeout(remaining.as_millis() as u64))
                    }
                }
            }
            None => pending.reply::<R>().await,
        }
    }

    /// The body-less liveness probe.
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        let pending = self.go(ctx, "", &()).await?;
        let seq = pending.seq();
        match ctx.remaining() {
            Some(remaining) => match tokio::time::timeout(remaining, pending.message()).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => {
                    self.inner.pending.remove(&seq);
                    Err(RpcError::Timeout(remaining.as_millis() as u64))
                }
            },
            None => pending.message().await.map(|_| ()),
        }
    }

    /// Shuts the client down: background tasks stop and every pending call
    /// fails with [`RpcError::Shutdown`].
    pub fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.inner.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.inner.fail_pending();
        debug!(addr = %self.inner.addr, "client closed");
    }
}

impl ClientInner {
    fn fail_pending(&self) {
        let seqs: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for seq in seqs {
            if let Some((_, entry)) = self.pending.remove(&seq) {
                let _ = entry.tx.send(Err(RpcError::Shutdown));
            }
        }
    }
}

/// Demultiplexes inbound frames onto pending calls. Any decode error ends
/// the loop and fails every pending call with a shutdown error.
async fn receive_loop(inner: Arc<ClientInner>, mut read_half: OwnedReadHalf) {
    loop {
        let msg = match read_message(&mut read_half).await {
            Ok(msg) => msg,
            Err(e) => {
                if e.is_connection_closed() {
                    debug!(addr = %inner.addr, "connection closed by server");
                } else {
                    warn!(addr = %inner.addr, error = %e, "receive loop error, closing client");
                }
                break;
            }
        };

        // Heartbeat-typed frames only drive liveness; they are never
        // correlated against application calls.
        if msg.header.message_type == MessageType::Heartbeat {
            continue;
        }

        let seq = msg.header.seq;
        let Some((_, entry)) = inner.pending.remove(&seq) else {
            // The call was cancelled or timed out; drop the late response.
            continue;
        };

        let have = msg.header.service_method();
        if have != entry.service_method {
            error!(
                addr = %inner.addr,
                have = %have,
                want = %entry.service_method,
                "response service method mismatch"
            );
            let _ = entry.tx.send(Err(RpcError::Framing(format!(
                "service method mismatch: have {have}, want {}",
                entry.service_method
            ))));
            break;
        }

        let result = if !msg.header.error.is_empty() {
            Err(RpcError::Service(msg.header.error.clone()))
        } else {
            Ok(msg)
        };
        let _ = entry.tx.send(result);
    }

    inner.shutdown.store(true, Ordering::Release);
    inner.fail_pending();
}

/// Periodically pings the provider. Misses accumulate; crossing the
/// degrade threshold flips the observable `degraded` flag. Recovery is
/// left to the governance client.
async fn heartbeat_loop(client: RpcClient) {
    let interval = client.inner.options.heartbeat_interval;
    let threshold = client.inner.options.heartbeat_degrade_threshold;
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;
        if client.is_shutdown() {
            return;
        }

        let ctx = Context::background().with_timeout(interval);
        if let Err(e) = client.ping(&ctx).await {
            let misses = client.inner.heartbeat_misses.fetch_add(1, Ordering::AcqRel) + 1;
            warn!(
                network = %client.inner.network,
                addr = %client.inner.addr,
                misses,
                error = %e,
                "failed to heartbeat"
            );
            if misses > threshold {
                client.inner.degraded.store(true, Ordering::Release);
            }
        }
    }
}

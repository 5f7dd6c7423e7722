//! quillrpc common types: wire protocol, codecs, transport and metadata.
//!
//! This crate holds everything both sides of a connection must agree on:
//!
//! - **Protocol**: the framed message model ([`protocol`], [`frame`])
//! - **Codecs**: pluggable body serializers under one-byte tags ([`codec`])
//! - **Transport**: TCP dial/listen/accept ([`transport`])
//! - **Metadata**: the per-call dynamic key/value bag ([`metadata`],
//!   [`context`])
//!
//! # Wire format
//!
//! ```text
//! | magic (2) | version (1) | total len (4, BE) | header len (4, BE) | header | body |
//! ```
//!
//! The header is MessagePack-encoded; the body format is chosen per message
//! by the header's serialize tag.

pub mod codec;
pub mod context;
pub mod error;
pub mod frame;
pub mod metadata;
pub mod net;
pub mod protocol;
pub mod transport;

pub use codec::Serializer;
pub use context::Context;
pub use error::{Result, RpcError};
pub use metadata::{MetaMap, MetaValue};
pub use protocol::{CompressType, Header, Message, MessageType, StatusCode};
pub use transport::{Connection, DialOptions, Listener, TransportKind};

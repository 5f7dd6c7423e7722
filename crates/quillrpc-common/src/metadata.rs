//! Per-call metadata: a string-keyed map of tagged dynamic values that is
//! carried in the request context and reflected into the message header.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// Sequence number assigned to the in-flight request.
pub const REQUEST_SEQ_KEY: &str = "rpc_request_seq";
/// Effective request timeout, in milliseconds.
pub const REQUEST_TIMEOUT_KEY: &str = "rpc_request_timeout";
/// Absolute request deadline.
pub const REQUEST_DEADLINE_KEY: &str = "rpc_request_deadline";
/// Bag of user metadata inside the context.
pub const META_DATA_KEY: &str = "rpc_meta_data";
/// Opaque auth token, validated by a user-supplied predicate on the server.
pub const AUTH_KEY: &str = "rpc_auth";
/// Set on a provider's meta by the heartbeat loop when the provider stops
/// answering; the degrade filter excludes flagged providers.
pub const PROVIDER_DEGRADE_KEY: &str = "rpc_provider_degrade";
/// Read by the pinned selector: the `<network>@<addr>` of the provider the
/// caller wants this request routed to.
pub const PINNED_PROVIDER_KEY: &str = "rpc_pinned_provider";
/// Provider meta key under which a server advertises its tags.
pub const TAGS_KEY: &str = "tags";
/// Provider meta key under which a server advertises its service list.
pub const SERVICES_KEY: &str = "services";

/// A dynamically typed metadata value.
///
/// The variant set is deliberately closed: every supported codec preserves
/// these types across an encode/decode round trip. Callers reading a key
/// must ask for the variant they expect via the `as_*` accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Map(HashMap<String, MetaValue>),
    Time(SystemTime),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetaValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            MetaValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetaValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, MetaValue>> {
        match self {
            MetaValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<SystemTime> {
        match self {
            MetaValue::Time(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Str(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Str(v)
    }
}

impl From<u64> for MetaValue {
    fn from(v: u64) -> Self {
        MetaValue::Uint(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<SystemTime> for MetaValue {
    fn from(v: SystemTime) -> Self {
        MetaValue::Time(v)
    }
}

/// The per-call metadata bag.
pub type MetaMap = HashMap<String, MetaValue>;

/// Builds a `MetaValue::Map` out of plain string tags, the shape servers
/// advertise under [`TAGS_KEY`].
pub fn tags_meta(tags: &HashMap<String, String>) -> MetaValue {
    MetaValue::Map(
        tags.iter()
            .map(|(k, v)| (k.clone(), MetaValue::Str(v.clone())))
            .collect(),
    )
}

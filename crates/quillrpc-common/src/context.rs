//! Per-call context: a deadline plus the [`crate::metadata`] bag.
//!
//! Unlike an ambient context, this is an explicit value constructed per
//! call on the client and rebuilt from the inbound header on the server.

use std::time::{Duration, SystemTime};

use crate::metadata::{MetaMap, MetaValue, AUTH_KEY, REQUEST_DEADLINE_KEY};
use crate::protocol::Header;

#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<SystemTime>,
    metadata: MetaMap,
}

impl Context {
    /// An empty context with no deadline.
    pub fn background() -> Self {
        Context::default()
    }

    pub fn with_deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(SystemTime::now() + timeout)
    }

    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.metadata
            .insert(AUTH_KEY.to_string(), MetaValue::Str(token.into()));
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Rebuilds the server-side context for an inbound request: the
    /// header's metadata map plus any deadline encoded therein.
    pub fn from_header(header: &Header) -> Self {
        Context {
            deadline: header.deadline(),
            metadata: header.meta.clone(),
        }
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: SystemTime) {
        self.deadline = Some(deadline);
    }

    /// Time left until the deadline; `None` when no deadline is set,
    /// `Some(ZERO)` when it has already passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(Duration::ZERO))
    }

    pub fn meta(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self) -> &MetaMap {
        &self.metadata
    }

    pub fn auth(&self) -> Option<&str> {
        self.metadata.get(AUTH_KEY).and_then(MetaValue::as_str)
    }

    /// Copies the deadline into the metadata map so it survives the trip
    /// through the header.
    pub fn reflect_deadline(&mut self) {
        if let Some(deadline) = self.deadline {
            self.metadata
                .insert(REQUEST_DEADLINE_KEY.to_string(), MetaValue::Time(deadline));
        }
    }
}

//! Message model for the wire protocol.
//!
//! A frame on the wire is:
//!
//! ```text
//! | 2B    | 1B      | 4B           | 4B            | header len | total len - 4 - header len |
//! | magic | version | total length | header length | header     | body                       |
//! ```
//!
//! The header is encoded with a fixed, build-time codec (MessagePack); the
//! body is opaque and encoded by whichever serializer the header's
//! `serialize_type` tag names. See [`crate::frame`] for the byte-level
//! encode/decode.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

use crate::codec::Serializer;
use crate::error::{Result, RpcError};
use crate::metadata::{MetaMap, MetaValue, REQUEST_DEADLINE_KEY};

/// First two bytes of every frame.
pub const MAGIC: [u8; 2] = [0xAB, 0xBA];
/// Protocol version byte.
pub const VERSION: u8 = 0x00;

/// Distinguishes requests, responses and liveness probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Heartbeat = 2,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            2 => Some(MessageType::Heartbeat),
            _ => None,
        }
    }

    pub const fn as_tag(self) -> u8 {
        self as u8
    }

    pub fn parse_name(name: &str) -> Result<Self> {
        match name {
            "request" => Ok(MessageType::Request),
            "response" => Ok(MessageType::Response),
            "heartbeat" => Ok(MessageType::Heartbeat),
            other => Err(RpcError::Framing(format!("message type {other} not found"))),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Heartbeat => "heartbeat",
        };
        write!(f, "{name}")
    }
}

/// Body compression. Only the identity scheme is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressType {
    None = 0,
}

impl CompressType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressType::None),
            _ => None,
        }
    }

    pub const fn as_tag(self) -> u8 {
        self as u8
    }

    pub fn parse_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(CompressType::None),
            other => Err(RpcError::Framing(format!("compress type {other} not found"))),
        }
    }
}

impl Default for CompressType {
    fn default() -> Self {
        CompressType::None
    }
}

impl std::fmt::Display for CompressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "none")
    }
}

/// Whether a response carries a reply body or an error string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    Error = 1,
}

impl StatusCode {
    pub fn parse_name(name: &str) -> Result<Self> {
        match name {
            "ok" => Ok(StatusCode::Ok),
            "error" => Ok(StatusCode::Error),
            other => Err(RpcError::Framing(format!("status code {other} not found"))),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::Ok => "ok",
            StatusCode::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Message header.
///
/// `seq` correlates a response with its request within one connection;
/// responses are free to arrive out of request order. `serialize_type` is
/// the raw wire tag rather than a [`Serializer`] so that a receiver can
/// fall back to its own default when it sees a tag it does not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub seq: u64,
    pub message_type: MessageType,
    pub compress_type: CompressType,
    pub serialize_type: u8,
    pub status: StatusCode,
    pub service_name: String,
    pub method_name: String,
    /// Non-empty only on error responses.
    pub error: String,
    pub meta: MetaMap,
}

impl Header {
    pub fn new(seq: u64, message_type: MessageType, serializer: Serializer) -> Self {
        Header {
            seq,
            message_type,
            compress_type: CompressType::None,
            serialize_type: serializer.as_tag(),
            status: StatusCode::Ok,
            service_name: String::new(),
            method_name: String::new(),
            error: String::new(),
            meta: HashMap::new(),
        }
    }

    /// The deadline encoded in the metadata map, if any.
    pub fn deadline(&self) -> Option<SystemTime> {
        self.meta.get(REQUEST_DEADLINE_KEY).and_then(MetaValue::as_time)
    }

    /// `Service.Method` for requests, empty for heartbeats.
    pub fn service_method(&self) -> String {
        if self.service_name.is_empty() && self.method_name.is_empty() {
            String::new()
        } else {
            format!("{}.{}", self.service_name, self.method_name)
        }
    }
}

/// A complete wire unit: header plus opaque body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(header: Header) -> Self {
        Message {
            header,
            body: Vec::new(),
        }
    }

    /// Clones this request's header into a response shell: same `seq`, same
    /// metadata, type flipped to `Response`, empty body.
    pub fn response_template(&self) -> Message {
        let mut header = self.header.clone();
        header.message_type = MessageType::Response;
        Message {
            header,
            body: Vec::new(),
        }
    }

    /// Rewrites a response in place into an error response.
    pub fn set_error(&mut self, err: impl Into<String>) {
        self.header.status = StatusCode::Error;
        self.header.error = err.into();
        self.body.clear();
    }

    /// The serializer named by this message's header tag, or `fallback`
    /// when the tag is unknown.
    pub fn serializer_or(&self, fallback: Serializer) -> Serializer {
        Serializer::from_tag(self.header.serialize_type).unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetaValue;

    #[test]
    fn test_message_type_tags_and_names() {
        for mt in [MessageType::Request, MessageType::Response, MessageType::Heartbeat] {
            assert_eq!(MessageType::from_tag(mt.as_tag()), Some(mt));
            assert_eq!(MessageType::parse_name(&mt.to_string()).unwrap(), mt);
        }
        assert_eq!(MessageType::from_tag(9), None);
        assert!(MessageType::parse_name("push").is_err());
    }

    #[test]
    fn test_response_template_preserves_seq_and_meta() {
        let mut header = Header::new(42, MessageType::Request, Serializer::MessagePack);
        header.service_name = "Arith".to_string();
        header.method_name = "Add".to_string();
        header
            .meta
            .insert("k".to_string(), MetaValue::Str("v".to_string()));
        let request = Message {
            header,
            body: vec![1, 2, 3],
        };

        let response = request.response_template();
        assert_eq!(response.header.seq, 42);
        assert_eq!(response.header.message_type, MessageType::Response);
        assert_eq!(response.header.meta["k"].as_str(), Some("v"));
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_set_error_clears_body() {
        let header = Header::new(1, MessageType::Response, Serializer::Json);
        let mut msg = Message {
            header,
            body: vec![9; 8],
        };
        msg.set_error("can not find service");
        assert_eq!(msg.header.status, StatusCode::Error);
        assert_eq!(msg.header.error, "can not find service");
        assert!(msg.body.is_empty());
    }

    #[test]
    fn test_unknown_serialize_tag_falls_back() {
        let mut header = Header::new(1, MessageType::Request, Serializer::Json);
        header.serialize_type = 0x7f;
        let msg = Message::new(header);
        assert_eq!(msg.serializer_or(Serializer::MessagePack), Serializer::MessagePack);
    }

    #[test]
    fn test_service_method_empty_for_heartbeat() {
        let header = Header::new(3, MessageType::Heartbeat, Serializer::MessagePack);
        assert_eq!(header.service_method(), "");
    }
}

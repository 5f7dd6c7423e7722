//! Pluggable body serialization.
//!
//! Every message body is encoded by one of the serializers below, selected
//! per message by the one-byte tag carried in the header. The registry is
//! closed at build time; both peers must understand a tag to exchange
//! bodies in that format.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// A body serialization format, identified on the wire by a one-byte tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Serializer {
    /// MessagePack via `rmp-serde` (the default)
    MessagePack = 0,
    /// JSON via `serde_json`
    Json = 1,
    /// Postcard compact binary encoding
    Postcard = 2,
}

impl Serializer {
    /// Resolves a wire tag back to a serializer; `None` for unknown tags
    /// (callers fall back to their configured default).
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Serializer::MessagePack),
            1 => Some(Serializer::Json),
            2 => Some(Serializer::Postcard),
            _ => None,
        }
    }

    pub const fn as_tag(self) -> u8 {
        self as u8
    }

    /// Translates a human-readable name to a serializer, the inverse of
    /// `Display`. Used by boundary layers that speak names instead of tags.
    pub fn parse_name(name: &str) -> Result<Self> {
        match name {
            "messagepack" => Ok(Serializer::MessagePack),
            "json" => Ok(Serializer::Json),
            "postcard" => Ok(Serializer::Postcard),
            other => Err(RpcError::Codec(format!("serializer {other} not found"))),
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Serializer::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
            Serializer::Json => Ok(serde_json::to_vec(value)?),
            Serializer::Postcard => Ok(postcard::to_allocvec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Serializer::MessagePack => Ok(rmp_serde::from_slice(data)?),
            Serializer::Json => Ok(serde_json::from_slice(data)?),
            Serializer::Postcard => Ok(postcard::from_bytes(data)?),
        }
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Serializer::MessagePack
    }
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Serializer::MessagePack => "messagepack",
            Serializer::Json => "json",
            Serializer::Postcard => "postcard",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Args {
        a: i32,
        b: i32,
        note: String,
    }

    fn sample() -> Args {
        Args {
            a: 7,
            b: 5,
            note: "add".to_string(),
        }
    }

    #[test]
    fn test_round_trip_every_serializer() {
        for codec in [Serializer::MessagePack, Serializer::Json, Serializer::Postcard] {
            let bytes = codec.encode(&sample()).unwrap();
            let back: Args = codec.decode(&bytes).unwrap();
            assert_eq!(back, sample(), "{codec} round trip");
        }
    }

    #[test]
    fn test_tag_round_trip() {
        for codec in [Serializer::MessagePack, Serializer::Json, Serializer::Postcard] {
            assert_eq!(Serializer::from_tag(codec.as_tag()), Some(codec));
        }
        assert_eq!(Serializer::from_tag(0xff), None);
    }

    #[test]
    fn test_parse_name_round_trip() {
        for codec in [Serializer::MessagePack, Serializer::Json, Serializer::Postcard] {
            assert_eq!(Serializer::parse_name(&codec.to_string()).unwrap(), codec);
        }
        assert!(Serializer::parse_name("gob").is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let garbage = [0x13u8, 0x37, 0x00];
        let res: Result<Args> = Serializer::Json.decode(&garbage);
        assert!(matches!(res, Err(RpcError::Codec(_))));
    }
}

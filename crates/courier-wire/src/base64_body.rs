//! Serde adapter for binary bodies inside JSON documents: `#[serde(with = "base64_body")]`.
//!
//! Message payloads in protocol bodies and recorded calls are opaque bytes;
//! JSON carries them as standard base64.
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};
use std::fmt;

pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&base64::display::Base64Display::new(body, &STANDARD))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    deserializer.deserialize_str(BodyVisitor)
}

struct BodyVisitor;

impl Visitor<'_> for BodyVisitor {
    type Value = Bytes;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a base64-encoded body")
    }

    fn visit_str<E: de::Error>(self, encoded: &str) -> Result<Bytes, E> {
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(|err| E::custom(format_args!("body is not base64: {err}")))
    }
}

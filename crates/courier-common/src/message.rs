// Outbound message model and its validation limits.
use bytes::Bytes;
use std::collections::BTreeMap;

use crate::{Error, Result};

pub const MAX_DATA_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_ATTRIBUTES: usize = 100;
pub const MAX_ATTRIBUTE_KEY_BYTES: usize = 256;
pub const MAX_ATTRIBUTE_VALUE_BYTES: usize = 1024;
pub const MAX_ORDERING_KEY_BYTES: usize = 1024;

/// A message submitted for publishing.
///
/// Attributes live in a `BTreeMap` so the serialized form of a message is
/// deterministic; exact-match replay compares request bytes.
///
/// ```
/// use courier_common::Message;
///
/// let message = Message::new("hello")
///     .with_attribute("source", "docs")
///     .with_ordering_key("user-1");
/// assert!(message.validate().is_ok());
/// assert_eq!(message.ordering_key(), Some("user-1"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub data: Bytes,
    pub attributes: BTreeMap<String, String>,
    pub ordering_key: Option<String>,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    /// The ordering key, treating an empty key as "no key".
    pub fn ordering_key(&self) -> Option<&str> {
        self.ordering_key.as_deref().filter(|key| !key.is_empty())
    }

    /// Approximate size used for batch byte thresholds.
    pub fn encoded_len(&self) -> usize {
        let attributes: usize = self
            .attributes
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum();
        self.data.len() + attributes + self.ordering_key.as_ref().map_or(0, String::len)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data.is_empty() && self.attributes.is_empty() {
            return Err(Error::Validation(
                "message must carry data or at least one attribute".into(),
            ));
        }
        if self.data.len() > MAX_DATA_BYTES {
            return Err(Error::Validation(format!(
                "data is {} bytes (max {MAX_DATA_BYTES})",
                self.data.len()
            )));
        }
        if self.attributes.len() > MAX_ATTRIBUTES {
            return Err(Error::Validation(format!(
                "{} attributes (max {MAX_ATTRIBUTES})",
                self.attributes.len()
            )));
        }
        for (key, value) in &self.attributes {
            if key.is_empty() {
                return Err(Error::Validation("attribute key is empty".into()));
            }
            if key.len() > MAX_ATTRIBUTE_KEY_BYTES {
                return Err(Error::Validation(format!(
                    "attribute key {key:?} is {} bytes (max {MAX_ATTRIBUTE_KEY_BYTES})",
                    key.len()
                )));
            }
            if value.len() > MAX_ATTRIBUTE_VALUE_BYTES {
                return Err(Error::Validation(format!(
                    "attribute {key:?} value is {} bytes (max {MAX_ATTRIBUTE_VALUE_BYTES})",
                    value.len()
                )));
            }
        }
        if let Some(key) = &self.ordering_key
            && key.len() > MAX_ORDERING_KEY_BYTES
        {
            return Err(Error::Validation(format!(
                "ordering key is {} bytes (max {MAX_ORDERING_KEY_BYTES})",
                key.len()
            )));
        }
        Ok(())
    }
}

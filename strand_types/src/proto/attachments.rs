use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single attachment value. Attachments ride alongside the payload and are
/// opaque to the transport.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AttachmentValue {
    Str(String),
    Bytes(Bytes),
}

impl AttachmentValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Str(value) => value.as_bytes(),
            Self::Bytes(value) => value.as_ref(),
        }
    }
}

/// String-keyed attachment map. Ordered so that encoding is deterministic.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Attachments(BTreeMap<String, AttachmentValue>);

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_str<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let _ = self.0.insert(key.into(), AttachmentValue::Str(value.into()));
    }

    pub fn insert_bytes<K: Into<String>, V: Into<Bytes>>(&mut self, key: K, value: V) {
        let _ = self
            .0
            .insert(key.into(), AttachmentValue::Bytes(value.into()));
    }

    pub fn insert(&mut self, key: String, value: AttachmentValue) -> Option<AttachmentValue> {
        self.0.insert(key, value)
    }

    pub fn get(&self, key: &str) -> Option<&AttachmentValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(AttachmentValue::Str(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<AttachmentValue> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttachmentValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

//! Decrypted vault document

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Structured vault content: document metadata plus keyed records
///
/// Unknown fields are kept in `extra` so any JSON document round-trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultDocument {
    /// Document-level metadata (name, timestamps, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,

    #[serde(default)]
    pub content: VaultContent,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Keyed memory and attachment records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultContent {
    #[serde(default)]
    pub memories: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VaultDocument {
    /// Create an empty document with a name
    pub fn new(name: &str) -> Self {
        let mut doc = VaultDocument::default();
        doc.metadata
            .insert("name".to_string(), Value::String(name.to_string()));
        doc
    }

    /// Document name from metadata, if set
    pub fn name(&self) -> Option<&str> {
        self.metadata.get("name").and_then(Value::as_str)
    }

    /// Insert or replace a memory record
    pub fn insert_memory(&mut self, id: impl Into<String>, record: Value) -> Option<Value> {
        self.content.memories.insert(id.into(), record)
    }

    /// Get a memory record
    pub fn memory(&self, id: &str) -> Option<&Value> {
        self.content.memories.get(id)
    }

    /// Remove a memory record
    pub fn remove_memory(&mut self, id: &str) -> Option<Value> {
        self.content.memories.remove(id)
    }

    /// Insert or replace an attachment record
    pub fn insert_attachment(&mut self, id: impl Into<String>, record: Value) -> Option<Value> {
        self.content.attachments.insert(id.into(), record)
    }

    /// Canonical byte encoding (compact JSON)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the canonical encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::CorruptContainer(format!("Invalid document encoding: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_preserves_unknown_fields() {
        let original = json!({
            "metadata": {"name": "Test", "createdAt": 1700000000},
            "content": {
                "memories": {"m1": {"text": "hello"}},
                "tags": ["a", "b"]
            },
            "schemaVersion": 3
        });

        let doc: VaultDocument = serde_json::from_value(original.clone()).unwrap();
        assert_eq!(doc.name(), Some("Test"));
        assert_eq!(doc.extra.get("schemaVersion"), Some(&json!(3)));

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut doc = VaultDocument::new("Journal");
        doc.insert_memory("m1", json!({"text": "hello"}));
        doc.insert_attachment("a1", json!({"mime": "image/png", "blob": "abc"}));

        let parsed = VaultDocument::from_bytes(&doc.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, doc);
        assert_eq!(parsed.memory("m1"), Some(&json!({"text": "hello"})));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        assert!(matches!(
            VaultDocument::from_bytes(b"\x00\x01not json"),
            Err(Error::CorruptContainer(_))
        ));
    }

    #[test]
    fn test_memory_edits() {
        let mut doc = VaultDocument::default();
        assert!(doc.insert_memory("m1", json!(1)).is_none());
        assert_eq!(doc.insert_memory("m1", json!(2)), Some(json!(1)));
        assert_eq!(doc.remove_memory("m1"), Some(json!(2)));
        assert!(doc.memory("m1").is_none());
    }
}

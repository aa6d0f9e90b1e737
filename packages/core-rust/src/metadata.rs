//! Object metadata envelope.
//!
//! Every cached object carries an arbitrary JSON object that the inventory
//! stores verbatim. A handful of keys -- `size`, `priority`, `checksum`,
//! `checksumAlgorithm`, `refcount`, `ediid`, `pdrid` -- are lifted into
//! first-class inventory columns on write; this type provides the typed
//! accessors for them without constraining the rest of the blob.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::checksum::Checksum;

/// Keys lifted into first-class inventory columns.
pub mod keys {
    pub const SIZE: &str = "size";
    pub const PRIORITY: &str = "priority";
    pub const CHECKSUM: &str = "checksum";
    pub const CHECKSUM_ALGORITHM: &str = "checksumAlgorithm";
    pub const REFCOUNT: &str = "refcount";
    pub const EDIID: &str = "ediid";
    pub const PDRID: &str = "pdrid";
}

/// Arbitrary JSON metadata attached to a cached object.
///
/// Serializes as the bare JSON object it wraps, so the blob round-trips
/// through the inventory untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectMetadata(Map<String, Value>);

impl ObjectMetadata {
    /// Creates an empty metadata object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON object from its string form.
    ///
    /// # Errors
    ///
    /// Fails when the input is not valid JSON or not a JSON object.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Renders the blob back to its compact JSON string form.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Whether no keys are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw access to an arbitrary key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Sets an arbitrary key.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Overlays `other` onto this blob; keys in `other` win.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    // --- lifted-key accessors ---

    /// Object size in bytes, when recorded.
    #[must_use]
    pub fn size(&self) -> Option<i64> {
        self.0.get(keys::SIZE).and_then(Value::as_i64)
    }

    pub fn set_size(&mut self, size: i64) {
        self.0.insert(keys::SIZE.to_string(), Value::from(size));
    }

    /// Eviction priority; lower is more important.
    #[must_use]
    pub fn priority(&self) -> Option<i64> {
        self.0.get(keys::PRIORITY).and_then(Value::as_i64)
    }

    pub fn set_priority(&mut self, priority: i64) {
        self.0
            .insert(keys::PRIORITY.to_string(), Value::from(priority));
    }

    /// Recorded checksum hex + algorithm, when both keys are present.
    #[must_use]
    pub fn checksum(&self) -> Option<Checksum> {
        let hex = self.0.get(keys::CHECKSUM)?.as_str()?;
        let algorithm = self.0.get(keys::CHECKSUM_ALGORITHM)?.as_str()?;
        Some(Checksum {
            hex: hex.to_string(),
            algorithm: algorithm.to_string(),
        })
    }

    pub fn set_checksum(&mut self, checksum: &Checksum) {
        self.0.insert(
            keys::CHECKSUM.to_string(),
            Value::from(checksum.hex.clone()),
        );
        self.0.insert(
            keys::CHECKSUM_ALGORITHM.to_string(),
            Value::from(checksum.algorithm.clone()),
        );
    }

    /// Number of outstanding references holding this object in the cache.
    #[must_use]
    pub fn refcount(&self) -> i64 {
        self.0
            .get(keys::REFCOUNT)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn set_refcount(&mut self, refcount: i64) {
        self.0
            .insert(keys::REFCOUNT.to_string(), Value::from(refcount));
    }

    /// Legacy EDI identifier of the owning dataset.
    #[must_use]
    pub fn ediid(&self) -> Option<&str> {
        self.0.get(keys::EDIID).and_then(Value::as_str)
    }

    /// PDR ARK identifier of the owning dataset.
    #[must_use]
    pub fn pdrid(&self) -> Option<&str> {
        self.0.get(keys::PDRID).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for ObjectMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn lifted_keys_read_back() {
        let mut meta = ObjectMetadata::new();
        meta.set_size(1024);
        meta.set_priority(5);
        meta.set_checksum(&Checksum::sha256("abc"));
        meta.set_refcount(2);

        assert_eq!(meta.size(), Some(1024));
        assert_eq!(meta.priority(), Some(5));
        assert_eq!(meta.checksum().unwrap().hex, "abc");
        assert_eq!(meta.refcount(), 2);
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let mut meta = ObjectMetadata::new();
        meta.set("contentType", json!("text/plain"));
        meta.set_size(7);

        let back = ObjectMetadata::from_json(&meta.to_json()).unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.get("contentType"), Some(&json!("text/plain")));
    }

    #[test]
    fn refcount_defaults_to_zero() {
        assert_eq!(ObjectMetadata::new().refcount(), 0);
    }

    #[test]
    fn checksum_requires_both_keys() {
        let mut meta = ObjectMetadata::new();
        meta.set(keys::CHECKSUM, json!("abc"));
        assert_eq!(meta.checksum(), None);

        meta.set(keys::CHECKSUM_ALGORITHM, json!("sha256"));
        assert!(meta.checksum().is_some());
    }

    #[test]
    fn merge_overlays_and_keeps_existing() {
        let mut base = ObjectMetadata::new();
        base.set_size(1);
        base.set("color", json!("blue"));

        let mut update = ObjectMetadata::new();
        update.set_size(2);

        base.merge(&update);
        assert_eq!(base.size(), Some(2));
        assert_eq!(base.get("color"), Some(&json!("blue")));
    }

    #[test]
    fn non_object_json_rejected() {
        assert!(ObjectMetadata::from_json("[1, 2]").is_err());
        assert!(ObjectMetadata::from_json("42").is_err());
    }
}

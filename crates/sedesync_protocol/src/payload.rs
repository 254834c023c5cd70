//! Field snapshots carried by CREATE and UPDATE records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// A single field value.
///
/// Monetary and other decimal amounts travel as `Text` so that no
/// precision is lost between sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Ordered list of values.
    List(Vec<FieldValue>),
}

impl FieldValue {
    fn feed(&self, hasher: &mut Sha256) {
        match self {
            FieldValue::Null => hasher.update([0u8]),
            FieldValue::Bool(b) => hasher.update([1u8, u8::from(*b)]),
            FieldValue::Integer(n) => {
                hasher.update([2u8]);
                hasher.update(n.to_be_bytes());
            }
            FieldValue::Text(s) => {
                hasher.update([3u8]);
                feed_str(hasher, s);
            }
            FieldValue::List(items) => {
                hasher.update([4u8]);
                hasher.update((items.len() as u64).to_be_bytes());
                for item in items {
                    item.feed(hasher);
                }
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Integer(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

pub(crate) fn feed_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

/// The full set of field values of a record at one point in time.
///
/// Fields are kept sorted by name, so two snapshots with the same
/// contents always compare and hash the same.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, FieldValue>);

impl Snapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds a field, builder style.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Sets a field, returning the previous value.
    pub fn insert(
        &mut self,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Option<FieldValue> {
        self.0.insert(field.into(), value.into())
    }

    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    /// Iterates fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the snapshot has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Names of fields whose values differ between the two snapshots,
    /// including fields present on only one side.
    pub fn differing_fields(&self, other: &Snapshot) -> Vec<String> {
        let mut names: Vec<String> = self
            .0
            .iter()
            .filter(|(k, v)| other.0.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        names.extend(
            other
                .0
                .keys()
                .filter(|k| !self.0.contains_key(*k))
                .cloned(),
        );
        names.sort();
        names
    }

    pub(crate) fn feed(&self, hasher: &mut Sha256) {
        hasher.update((self.0.len() as u64).to_be_bytes());
        for (name, value) in &self.0 {
            feed_str(hasher, name);
            value.feed(hasher);
        }
    }
}

impl FromIterator<(String, FieldValue)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, FieldValue>> for Snapshot {
    fn from(map: BTreeMap<String, FieldValue>) -> Self {
        Self(map)
    }
}

/// SHA-256 digest identifying the content of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub(crate) fn from_hasher(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(snapshot: &Snapshot) -> Fingerprint {
        let mut hasher = Sha256::new();
        snapshot.feed(&mut hasher);
        Fingerprint::from_hasher(hasher)
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let a = Snapshot::new().with("name", "Ana").with("age", 41i64);
        let b = Snapshot::new().with("age", 41i64).with("name", "Ana");
        assert_eq!(a, b);
        assert_eq!(digest(&a), digest(&b));
    }

    #[test]
    fn differing_fields_covers_both_sides() {
        let local = Snapshot::new()
            .with("name", "Ana")
            .with("phone", "555-0101")
            .with("notes", "allergic");
        let remote = Snapshot::new()
            .with("name", "Ana")
            .with("phone", "555-0199")
            .with("email", "ana@example.org");

        assert_eq!(
            local.differing_fields(&remote),
            vec!["email".to_string(), "notes".to_string(), "phone".to_string()]
        );
        assert!(local.differing_fields(&local).is_empty());
    }

    #[test]
    fn null_and_missing_hash_differently() {
        let with_null = Snapshot::new().with("phone", FieldValue::Null);
        let empty = Snapshot::new();
        assert_ne!(digest(&with_null), digest(&empty));
    }

    #[test]
    fn json_shape_is_plain() {
        let snapshot = Snapshot::new()
            .with("name", "Ana")
            .with("active", true)
            .with("visits", 3i64)
            .with("tags", FieldValue::List(vec!["a".into(), "b".into()]))
            .with("phone", FieldValue::Null);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(
            json,
            r#"{"active":true,"name":"Ana","phone":null,"tags":["a","b"],"visits":3}"#
        );
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}

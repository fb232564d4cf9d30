//! Session Payload
//!
//! The per-session blob a request handler reads and mutates: an item map, a
//! fixed-object table and the session timeout.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single value stored under a session item key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SessionValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Structured value kept as JSON
    Json(serde_json::Value),
}

impl From<&str> for SessionValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for SessionValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for SessionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for SessionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for SessionValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Vec<u8>> for SessionValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<serde_json::Value> for SessionValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Session item map. Ordering carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionItems {
    entries: BTreeMap<String, SessionValue>,
}

impl SessionItems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&SessionValue> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<SessionValue>) -> Option<SessionValue> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<SessionValue> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SessionValue)> {
        self.entries.iter()
    }
}

impl<K: Into<String>, V: Into<SessionValue>> FromIterator<(K, V)> for SessionItems {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Opaque table of application-scoped fixed objects.
///
/// Tracks whether it has ever been touched: an untouched table is omitted
/// from the encoded payload and comes back as a fresh table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticObjects {
    objects: BTreeMap<String, Vec<u8>>,
    never_accessed: bool,
}

impl StaticObjects {
    /// A fresh table that has never been accessed
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            never_accessed: true,
        }
    }

    /// A table rebuilt from stored contents, already marked as accessed
    pub(crate) fn restored(objects: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            objects,
            never_accessed: false,
        }
    }

    pub fn never_accessed(&self) -> bool {
        self.never_accessed
    }

    /// Mark the table as accessed without changing its contents
    pub fn touch(&mut self) {
        self.never_accessed = false;
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.objects.get(name).map(Vec::as_slice)
    }

    pub fn insert(&mut self, name: impl Into<String>, object: Vec<u8>) -> Option<Vec<u8>> {
        self.touch();
        self.objects.insert(name.into(), object)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        self.touch();
        self.objects.remove(name)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.objects.iter()
    }
}

impl Default for StaticObjects {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete payload of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub items: SessionItems,
    pub static_objects: StaticObjects,
    /// Sliding expiration window in minutes
    pub timeout_minutes: i32,
}

impl SessionPayload {
    /// Empty items and a fresh fixed-object table
    pub fn new(timeout_minutes: i32) -> Self {
        Self {
            items: SessionItems::new(),
            static_objects: StaticObjects::new(),
            timeout_minutes,
        }
    }

    pub fn with_items(items: SessionItems, timeout_minutes: i32) -> Self {
        Self {
            items,
            static_objects: StaticObjects::new(),
            timeout_minutes,
        }
    }
}

/// Per-record flags stored alongside the payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionFlags(i32);

impl ActionFlags {
    pub const NONE: ActionFlags = ActionFlags(0);
    /// The record was created empty and its first reader must initialize it
    pub const INITIALIZE_ITEM: ActionFlags = ActionFlags(1);

    pub const fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> i32 {
        self.0
    }

    pub const fn contains(self, other: ActionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: ActionFlags) -> Self {
        Self(self.0 & !other.0)
    }
}

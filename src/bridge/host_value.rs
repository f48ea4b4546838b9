//! Host-side value model.
//!
//! `HostValue` is the closed set of values the host runtime exchanges with the
//! bridge. Composite values (`HostArray`, `HostObject`) are shared containers
//! with reference identity, so host graphs may contain cycles and shared
//! substructure; the marshaler preserves both.

use super::context::ContextHandle;
use super::registry::ForeignHandle;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::ser::Error as _;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A value living on the host side of the bridge.
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    /// Host `undefined`
    Undefined,
    /// Host `null`
    Null,
    Bool(bool),
    /// Host numbers are always IEEE-754 doubles
    Number(f64),
    String(String),
    /// Binary buffer (copied across the boundary)
    Buffer(Vec<u8>),
    Array(HostArray),
    Object(HostObject),
    /// Proxy for an object owned by the embedded runtime
    Handle(ForeignHandle),
    /// Proxy for an isolated execution context
    Context(ContextHandle),
    /// Host values with no embedded counterpart (functions, dates, symbols)
    Opaque(OpaqueValue),
    /// Failure payload delivered by asynchronous completions
    Error(String),
}

impl HostValue {
    /// Build an array value from its items.
    pub fn array(items: impl IntoIterator<Item = HostValue>) -> Self {
        HostValue::Array(HostArray::from_vec(items.into_iter().collect()))
    }

    /// Build an object value from its entries, keeping their order.
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        let object = HostObject::new();
        for (key, value) in entries {
            object.insert(key, value);
        }
        HostValue::Object(object)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        HostValue::Error(message.into())
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, HostValue::Error(_))
    }

    /// Split a completion payload into success or failure by its shape.
    pub fn into_outcome(self) -> Result<HostValue, String> {
        match self {
            HostValue::Error(message) => Err(message),
            value => Ok(value),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&HostArray> {
        match self {
            HostValue::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            HostValue::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&ForeignHandle> {
        match self {
            HostValue::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, HostValue::Null | HostValue::Undefined)
    }

    /// Short kind name used in argument errors.
    pub fn kind(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Buffer(_) => "buffer",
            HostValue::Array(_) => "array",
            HostValue::Object(_) => "object",
            HostValue::Handle(_) => "handle",
            HostValue::Context(_) => "context",
            HostValue::Opaque(_) => "opaque",
            HostValue::Error(_) => "error",
        }
    }

    /// Text form used when a value has no structured embedded counterpart.
    pub(crate) fn display_text(&self) -> String {
        match self {
            HostValue::Undefined => "undefined".to_string(),
            HostValue::Null => "null".to_string(),
            HostValue::Bool(b) => b.to_string(),
            HostValue::Number(n) => n.to_string(),
            HostValue::String(s) => s.clone(),
            HostValue::Buffer(bytes) => format!("<buffer of {} bytes>", bytes.len()),
            HostValue::Array(_) => "[array]".to_string(),
            HostValue::Object(_) => "[object]".to_string(),
            HostValue::Handle(handle) => handle.display_text().unwrap_or("<foreign>").to_string(),
            HostValue::Context(context) => format!("<context {}>", context.id()),
            HostValue::Opaque(opaque) => opaque.text().to_string(),
            HostValue::Error(message) => message.clone(),
        }
    }

    /// JSON view of the value; fails on cyclic graphs.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Number(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        HostValue::Number(f64::from(value))
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_owned())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(items: Vec<HostValue>) -> Self {
        HostValue::Array(HostArray::from_vec(items))
    }
}

impl From<ForeignHandle> for HostValue {
    fn from(handle: ForeignHandle) -> Self {
        HostValue::Handle(handle)
    }
}

impl From<ContextHandle> for HostValue {
    fn from(context: ContextHandle) -> Self {
        HostValue::Context(context)
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            serde_json::Value::Number(n) => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => HostValue::String(s),
            serde_json::Value::Array(items) => {
                HostValue::array(items.into_iter().map(HostValue::from))
            }
            serde_json::Value::Object(map) => {
                HostValue::object(map.into_iter().map(|(k, v)| (k, HostValue::from(v))))
            }
        }
    }
}

// Manual Serialize implementation: composites refuse cycles, proxies serialize
// as tagged maps.
impl Serialize for HostValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            HostValue::Undefined | HostValue::Null => serializer.serialize_none(),
            HostValue::Bool(b) => serializer.serialize_bool(*b),
            HostValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
            HostValue::String(s) => serializer.serialize_str(s),
            HostValue::Buffer(bytes) => serializer.serialize_bytes(bytes),
            HostValue::Array(array) => array.serialize(serializer),
            HostValue::Object(object) => object.serialize(serializer),
            HostValue::Handle(handle) => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("$handle", handle.identity())?;
                map.serialize_entry("type", handle.type_name())?;
                map.serialize_entry("context", &handle.context_tag().to_string())?;
                map.end()
            }
            HostValue::Context(context) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$context", context.id())?;
                map.end()
            }
            HostValue::Opaque(opaque) => serializer.serialize_str(opaque.text()),
            HostValue::Error(message) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$error", message)?;
                map.end()
            }
        }
    }
}

thread_local! {
    static ACTIVE_VISITS: RefCell<HashSet<(usize, usize)>> = RefCell::new(HashSet::new());
}

const DEBUG_VISIT: usize = usize::MAX;
const SERIALIZE_VISIT: usize = usize::MAX - 1;

/// Marks a composite as being traversed on this thread; `None` means the
/// traversal has come back around a cycle.
struct Visit {
    key: (usize, usize),
}

impl Visit {
    fn enter(key: (usize, usize)) -> Option<Self> {
        let fresh = ACTIVE_VISITS.with(|active| active.borrow_mut().insert(key));
        fresh.then_some(Visit { key })
    }
}

impl Drop for Visit {
    fn drop(&mut self) {
        ACTIVE_VISITS.with(|active| {
            active.borrow_mut().remove(&self.key);
        });
    }
}

/// Shared, ordered list of host values.
#[derive(Clone, Default)]
pub struct HostArray(Arc<RwLock<Vec<HostValue>>>);

impl HostArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<HostValue>) -> Self {
        HostArray(Arc::new(RwLock::new(items)))
    }

    pub fn push(&self, value: HostValue) {
        self.0.write().push(value);
    }

    /// Replace the item at `index`; returns false when out of bounds.
    pub fn set(&self, index: usize, value: HostValue) -> bool {
        match self.0.write().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, index: usize) -> Option<HostValue> {
        self.0.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Snapshot of the current items.
    pub fn to_vec(&self) -> Vec<HostValue> {
        self.0.read().clone()
    }

    /// Whether both arrays are the same container.
    pub fn ptr_eq(&self, other: &HostArray) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for HostArray {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let Some(_visit) = Visit::enter((self.identity(), other.identity())) else {
            return true;
        };
        self.to_vec() == other.to_vec()
    }
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Visit::enter((self.identity(), DEBUG_VISIT)) {
            Some(_visit) => f.debug_list().entries(self.to_vec()).finish(),
            None => f.write_str("[<cycle>]"),
        }
    }
}

impl Serialize for HostArray {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let Some(_visit) = Visit::enter((self.identity(), SERIALIZE_VISIT)) else {
            return Err(S::Error::custom("cannot serialize a cyclic host array"));
        };
        self.to_vec().serialize(serializer)
    }
}

/// Shared string-keyed map of host values, in insertion order.
#[derive(Clone, Default)]
pub struct HostObject(Arc<RwLock<IndexMap<String, HostValue>>>);

impl HostObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, returning the previous value.
    pub fn insert(&self, key: impl Into<String>, value: HostValue) -> Option<HostValue> {
        self.0.write().insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.0.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Snapshot of the current entries.
    pub fn entries(&self) -> Vec<(String, HostValue)> {
        self.0
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let Some(_visit) = Visit::enter((self.identity(), other.identity())) else {
            return true;
        };
        self.entries() == other.entries()
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Visit::enter((self.identity(), DEBUG_VISIT)) {
            Some(_visit) => f.debug_map().entries(self.entries()).finish(),
            None => f.write_str("{<cycle>}"),
        }
    }
}

impl Serialize for HostObject {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let Some(_visit) = Visit::enter((self.identity(), SERIALIZE_VISIT)) else {
            return Err(S::Error::custom("cannot serialize a cyclic host object"));
        };
        let entries = self.entries();
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in &entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A host value the bridge cannot represent structurally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpaqueValue {
    kind: String,
    text: String,
}

impl OpaqueValue {
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Host string form, used as the embedded representation.
    pub fn text(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_host_value_from_json() {
        let value = HostValue::from(json!({"a": [1, 2.5, "x"], "b": null, "c": true}));
        let object = value.as_object().expect("object");
        assert_eq!(object.keys(), vec!["a", "b", "c"]);

        let a = object.get("a").expect("a");
        let items = a.as_array().expect("array").to_vec();
        assert_eq!(
            items,
            vec![
                HostValue::Number(1.0),
                HostValue::Number(2.5),
                HostValue::from("x")
            ]
        );
        assert_eq!(object.get("b"), Some(HostValue::Null));
        assert_eq!(object.get("c"), Some(HostValue::Bool(true)));
    }

    #[test]
    fn test_host_value_to_json() {
        let value = HostValue::object([
            ("n", HostValue::Number(3.0)),
            ("f", HostValue::Number(0.5)),
            ("list", HostValue::array([HostValue::Null, HostValue::from("s")])),
        ]);
        assert_eq!(
            value.to_json().expect("serializable"),
            json!({"n": 3, "f": 0.5, "list": [null, "s"]})
        );
    }

    #[test]
    fn test_cyclic_array_serialization_fails() {
        let array = HostArray::new();
        array.push(HostValue::Number(1.0));
        array.push(HostValue::Array(array.clone()));

        let value = HostValue::Array(array.clone());
        assert!(value.to_json().is_err());

        let rendered = format!("{value:?}");
        assert!(rendered.contains("<cycle>"), "{rendered}");

        // Equality terminates on self-referential graphs.
        assert_eq!(value, HostValue::Array(array));
    }

    #[test]
    fn test_shared_substructure_is_not_a_cycle() {
        let shared = HostValue::array([HostValue::Number(7.0)]);
        let value = HostValue::array([shared.clone(), shared]);
        assert_eq!(value.to_json().expect("serializable"), json!([[7], [7]]));
    }

    #[test]
    fn test_failure_outcome() {
        assert_eq!(
            HostValue::failure("boom").into_outcome(),
            Err("boom".to_string())
        );
        assert_eq!(
            HostValue::Number(1.0).into_outcome(),
            Ok(HostValue::Number(1.0))
        );
    }

    #[test]
    fn test_array_mutation_is_shared() {
        let array = HostArray::new();
        let alias = array.clone();
        alias.push(HostValue::Bool(false));
        assert_eq!(array.len(), 1);
        assert!(array.set(0, HostValue::Bool(true)));
        assert!(!array.set(5, HostValue::Null));
        assert_eq!(alias.get(0), Some(HostValue::Bool(true)));
        assert!(array.ptr_eq(&alias));
    }
}

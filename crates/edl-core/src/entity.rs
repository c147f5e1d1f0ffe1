//! Entity model and its JSON wire form.
//!
//! An entity stream is a JSON array: a `@context` element first, then
//! entities, then (for cursored reads) a `@continuation` element. Entities
//! serialize as `{id, deleted?, refs?, props?}`.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::de::Deserializer;
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// A single entity in the graph.
///
/// An entity with an empty `id` is invalid; the mapper discards such rows.
/// When `deleted` is set, both maps are emptied before emission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(default, rename = "refs", skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, Value>,
    #[serde(default, rename = "props", skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Entity {
    pub fn new() -> Self {
        Entity::default()
    }

    /// Applies the deletion invariant: a deleted entity carries no
    /// properties or references on the wire.
    pub fn strip_if_deleted(&mut self) {
        if self.deleted {
            self.properties.clear();
            self.references.clear();
        }
    }
}

/// Tagged variant for every value the mapper can produce or consume.
///
/// Replaces untyped maps on the data path so mapping code is an exhaustive
/// match. Serializes transparently as plain JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Time(NaiveDateTime),
    /// Raw JSON cell, decoded lazily from JSON/JSONB columns.
    Json(serde_json::Value),
    /// Nested entity produced by an `isEntity` mapping.
    Entity(Box<Entity>),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Textual form used in templates and SQL literals. Times use the
    /// sentinel format, numbers their canonical decimal form.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Time(t) => t.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            Value::Json(v) => v.to_string(),
            Value::Entity(e) => e.id.clone(),
            Value::List(_) => String::new(),
        }
    }

    /// Converts a plain JSON value, flattening integral floats to `Int` the
    /// way database cells are coerced.
    pub fn from_json(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            obj @ serde_json::Value::Object(_) => Value::Json(obj),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Time(t) => {
                serializer.serialize_str(&t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
            Value::Json(v) => v.serialize(serializer),
            Value::Entity(e) => e.serialize(serializer),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(raw))
    }
}

/// The `@context` element leading every entity stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceContext {
    pub id: String,
    pub namespaces: BTreeMap<String, String>,
}

impl NamespaceContext {
    pub fn new() -> Self {
        NamespaceContext {
            id: "@context".to_string(),
            namespaces: BTreeMap::new(),
        }
    }

    /// Context for a dataset: `ns0` is the dataset base URI, `rdf` the
    /// standard syntax namespace used for type references.
    pub fn for_dataset(base_uri: &str) -> Self {
        let mut ctx = NamespaceContext::new();
        ctx.namespaces.insert("ns0".to_string(), base_uri.to_string());
        ctx.namespaces.insert(
            "rdf".to_string(),
            "http://www.w3.org/1999/02/22-rdf-syntax-ns#".to_string(),
        );
        ctx
    }
}

impl Default for NamespaceContext {
    fn default() -> Self {
        NamespaceContext::new()
    }
}

/// The `@continuation` element terminating a cursored read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Continuation {
    pub id: String,
    pub token: String,
}

impl Continuation {
    pub fn new(token: String) -> Self {
        Continuation {
            id: "@continuation".to_string(),
            token,
        }
    }
}

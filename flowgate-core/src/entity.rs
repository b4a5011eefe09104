//! Entity and caller types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A business entity as seen by the engine.
///
/// The engine does not own entity persistence; it reads snapshots of this
/// shape from an [`EntityStore`](crate::store::EntityStore) and writes single
/// fields back through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity kind (e.g. "invoice").
    pub kind: String,

    /// Entity ID, unique within its kind.
    pub id: String,

    /// Field values.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Creates an entity with no fields.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns a field as a string, if it holds one.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Returns true if the field is present and truthy.
    pub fn is(&self, field: &str) -> bool {
        self.fields.get(field).map(is_truthy).unwrap_or(false)
    }

    /// Returns the state key for one of this entity's state fields.
    pub fn state_key(&self, field: impl Into<String>) -> StateKey {
        StateKey::new(self.kind.clone(), self.id.clone(), field)
    }
}

/// The identity on whose behalf a transition is evaluated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Caller {
    /// Caller ID.
    pub id: String,

    /// Arbitrary caller attributes (roles, flags) visible to permissions.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Caller {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Map::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Returns an attribute value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Returns true if the attribute is present and truthy.
    pub fn is(&self, name: &str) -> bool {
        self.attributes.get(name).map(is_truthy).unwrap_or(false)
    }
}

/// Identity of one state field: (entity kind, entity id, field name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub kind: String,
    pub id: String,
    pub field: String,
}

impl StateKey {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.kind, self.id, self.field)
    }
}

/// JSON truthiness: null, false, 0, "" and empty collections are falsy.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_fields() {
        let invoice = Entity::new("invoice", "inv-1")
            .with_field("status", "draft")
            .with_field("is_available", true)
            .with_field("amount", 0);

        assert_eq!(invoice.get_str("status"), Some("draft"));
        assert!(invoice.is("is_available"));
        assert!(!invoice.is("amount"));
        assert!(!invoice.is("missing"));
        assert_eq!(invoice.get("amount"), Some(&json!(0)));
    }

    #[test]
    fn test_caller_attributes() {
        let staff = Caller::new("u-1").with_attribute("is_staff", true);
        assert!(staff.is("is_staff"));
        assert!(!Caller::new("u-2").is("is_staff"));
    }

    #[test]
    fn test_state_key_display() {
        let invoice = Entity::new("invoice", "inv-1");
        assert_eq!(invoice.state_key("status").to_string(), "invoice/inv-1.status");
    }

    #[test]
    fn test_entity_deserialize_without_fields() {
        let entity: Entity = serde_json::from_value(json!({"kind": "lock", "id": "l-1"})).unwrap();
        assert!(entity.fields.is_empty());
    }
}

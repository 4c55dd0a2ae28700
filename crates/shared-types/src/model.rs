//! Building model input types
//!
//! A `BuildingModel` is the unit of validation: an ordered list of typed
//! spatial objects (walls, outlets, ducts, rooms) plus metadata. Models are
//! deserialized from external JSON and treated as immutable for the duration
//! of one validation run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A value in an object's property bag.
///
/// Properties arrive as free-form JSON; the accessors are fallible so a type
/// mismatch surfaces as an explicit error instead of a silent coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<PropertyValue>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertyTypeError {
    #[error("expected a number, found {found}")]
    NotANumber { found: &'static str },
    #[error("expected text, found {found}")]
    NotText { found: &'static str },
    #[error("expected a bool, found {found}")]
    NotABool { found: &'static str },
}

impl PropertyValue {
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Number(_) => "number",
            PropertyValue::Text(_) => "text",
            PropertyValue::List(_) => "list",
        }
    }

    pub fn as_number(&self) -> Result<f64, PropertyTypeError> {
        match self {
            PropertyValue::Number(n) => Ok(*n),
            other => Err(PropertyTypeError::NotANumber { found: other.kind() }),
        }
    }

    pub fn as_text(&self) -> Result<&str, PropertyTypeError> {
        match self {
            PropertyValue::Text(s) => Ok(s),
            other => Err(PropertyTypeError::NotText { found: other.kind() }),
        }
    }

    pub fn as_bool(&self) -> Result<bool, PropertyTypeError> {
        match self {
            PropertyValue::Bool(b) => Ok(*b),
            other => Err(PropertyTypeError::NotABool { found: other.kind() }),
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        PropertyValue::Number(n)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Text(s.to_string())
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

/// Axis-aligned placement of an object: origin corner plus extents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub width: f64,
    pub height: f64,
    pub depth: f64,
}

/// One modeled building element.
///
/// `connections` is unvalidated adjacency by object id: it may reference
/// unknown ids and may contain cycles. Consumers must traverse it with a
/// visited set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildingObject {
    pub object_id: String,
    pub object_type: String,
    #[serde(default)]
    pub properties: HashMap<String, PropertyValue>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub connections: Vec<String>,
}

impl BuildingObject {
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Numeric property lookup; `None` when absent or not a number.
    pub fn number_property(&self, name: &str) -> Option<f64> {
        self.properties.get(name).and_then(|v| v.as_number().ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildingModel {
    pub building_id: String,
    pub building_name: String,
    pub objects: Vec<BuildingObject>,
    #[serde(default)]
    pub metadata: HashMap<String, PropertyValue>,
}

impl BuildingModel {
    pub fn object_by_id(&self, object_id: &str) -> Option<&BuildingObject> {
        self.objects.iter().find(|o| o.object_id == object_id)
    }

    pub fn objects_of_type<'a>(
        &'a self,
        object_type: &'a str,
    ) -> impl Iterator<Item = &'a BuildingObject> {
        self.objects.iter().filter(move |o| o.object_type == object_type)
    }
}

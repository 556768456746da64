//! Events and the attribute encoder.
//!
//! An [`Event`] carries free-form attributes. Before evaluation it is encoded
//! against a model's dictionaries into an [`EncodedEvent`]: field names become
//! dense field ids (case-insensitively), and string values become value ids
//! for fields that carry equality predicates on interned values. Attributes
//! whose field no rule references are dropped during encoding, so predicates
//! on them simply never become eligible.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dictionary::Dictionary;

/// An attribute value as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttributeValue {
    /// Numeric view: ints widen to `f64`, everything else is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// An incoming event to evaluate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub attributes: HashMap<String, AttributeValue>,
}

impl Event {
    pub fn new(event_id: impl Into<String>) -> Self {
        Event {
            event_id: event_id.into(),
            event_type: String::new(),
            attributes: HashMap::new(),
        }
    }

    /// Builder-style attribute insertion, mostly for tests and examples.
    pub fn with_attr(mut self, field: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(field.into(), value);
        self
    }
}

/// An attribute value after dictionary encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Interned string value (fields with equality predicates on interned values).
    StrId(u32),
    /// Raw string, kept when the value is not interned or the field needs raw text.
    Str(String),
}

impl EncodedValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EncodedValue::Int(i) => Some(*i as f64),
            EncodedValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Resolve to text, decoding interned ids through `values`.
    pub fn as_str<'a>(&'a self, values: &'a Dictionary) -> Option<&'a str> {
        match self {
            EncodedValue::Str(s) => Some(s.as_str()),
            EncodedValue::StrId(id) => values.decode(*id),
            _ => None,
        }
    }
}

/// An event after encoding: `field_id → value`.
#[derive(Debug, Clone, Default)]
pub struct EncodedEvent {
    values: HashMap<u32, EncodedValue>,
}

impl EncodedEvent {
    pub fn get(&self, field_id: u32) -> Option<&EncodedValue> {
        self.values.get(&field_id)
    }

    pub fn contains_field(&self, field_id: u32) -> bool {
        self.values.contains_key(&field_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &EncodedValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Encodes events against a model's dictionaries.
///
/// Borrowed from the model via [`crate::EngineModel::encoder`].
pub struct EventEncoder<'a> {
    fields: &'a Dictionary,
    values: &'a Dictionary,
    /// `interned_fields[field_id]` — field carries an equality predicate on an
    /// interned string value, so matching string attributes encode to ids.
    interned_fields: &'a [bool],
}

impl<'a> EventEncoder<'a> {
    pub fn new(fields: &'a Dictionary, values: &'a Dictionary, interned_fields: &'a [bool]) -> Self {
        EventEncoder {
            fields,
            values,
            interned_fields,
        }
    }

    /// Encode an event. Unknown fields are silently dropped.
    pub fn encode(&self, event: &Event) -> EncodedEvent {
        let mut encoded = EncodedEvent {
            values: HashMap::with_capacity(event.attributes.len()),
        };
        for (name, value) in &event.attributes {
            let upper = name.to_uppercase();
            let Some(field_id) = self.fields.lookup(&upper) else {
                continue;
            };
            let encoded_value = match value {
                AttributeValue::Null => EncodedValue::Null,
                AttributeValue::Bool(b) => EncodedValue::Bool(*b),
                AttributeValue::Int(i) => EncodedValue::Int(*i),
                AttributeValue::Float(f) => EncodedValue::Float(*f),
                AttributeValue::Str(s) => {
                    let interned = self
                        .interned_fields
                        .get(field_id as usize)
                        .copied()
                        .unwrap_or(false);
                    match self.values.lookup(s).filter(|_| interned) {
                        Some(id) => EncodedValue::StrId(id),
                        None => EncodedValue::Str(s.clone()),
                    }
                }
            };
            encoded.values.insert(field_id, encoded_value);
        }
        encoded
    }
}

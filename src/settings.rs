//! Settings and per-run configuration overlays.
//!
//! Base settings come from the manager once, at connect time. Each reuse
//! iteration may layer an overlay on top; lookups check the overlay
//! first, and prefer an instance-prefixed name over a bare one.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reference::Reference;

/// A value a setting can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    ListFloat(Vec<f64>),
    ListListFloat(Vec<Vec<f64>>),
}

/// The type a caller may require a setting to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    Bool,
    Int,
    Float,
    String,
    ListFloat,
    ListListFloat,
}

impl ParameterValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Int(_) => "int",
            ParameterValue::Float(_) => "float",
            ParameterValue::String(_) => "string",
            ParameterValue::ListFloat(_) => "list of float",
            ParameterValue::ListListFloat(_) => "list of list of float",
        }
    }

    /// Checks this value against an expected type, applying the one
    /// permitted coercion: an int read as a float widens. Everything
    /// else must match exactly.
    fn coerce(self, expected: ParameterType, name: &Reference) -> Result<ParameterValue> {
        let matches = match (&self, expected) {
            (ParameterValue::Bool(_), ParameterType::Bool) => true,
            (ParameterValue::Int(_), ParameterType::Int) => true,
            (ParameterValue::Float(_), ParameterType::Float) => true,
            (ParameterValue::String(_), ParameterType::String) => true,
            (ParameterValue::ListFloat(_), ParameterType::ListFloat) => true,
            (ParameterValue::ListListFloat(_), ParameterType::ListListFloat) => true,
            (ParameterValue::Int(i), ParameterType::Float) => {
                return Ok(ParameterValue::Float(*i as f64));
            }
            _ => false,
        };
        if matches {
            Ok(self)
        } else {
            Err(Error::TypeMismatch {
                parameter: name.to_string(),
                expected: expected.type_name(),
                actual: self.type_name(),
            })
        }
    }
}

impl ParameterType {
    pub fn type_name(self) -> &'static str {
        match self {
            ParameterType::Bool => "bool",
            ParameterType::Int => "int",
            ParameterType::Float => "float",
            ParameterType::String => "string",
            ParameterType::ListFloat => "list of float",
            ParameterType::ListListFloat => "list of list of float",
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::String(v) => write!(f, "'{}'", v),
            ParameterValue::ListFloat(v) => write!(f, "{:?}", v),
            ParameterValue::ListListFloat(v) => write!(f, "{:?}", v),
        }
    }
}

// Conversion from the JSON document form. Whole numbers become ints,
// anything fractional a float; lists must be uniformly float-shaped.
impl TryFrom<serde_json::Value> for ParameterValue {
    type Error = String;

    fn try_from(value: serde_json::Value) -> std::result::Result<Self, String> {
        use serde_json::Value;

        fn as_float(value: &Value) -> std::result::Result<f64, String> {
            value
                .as_f64()
                .ok_or_else(|| format!("expected a number, got {}", value))
        }

        match value {
            Value::Bool(b) => Ok(ParameterValue::Bool(b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ParameterValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(ParameterValue::Float(f))
                } else {
                    Err(format!("number {} is out of range", n))
                }
            }
            Value::String(s) => Ok(ParameterValue::String(s)),
            Value::Array(items) => {
                if items.iter().all(|v| v.is_number()) {
                    let floats = items
                        .iter()
                        .map(as_float)
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok(ParameterValue::ListFloat(floats))
                } else if items.iter().all(|v| v.is_array()) {
                    let rows = items
                        .iter()
                        .map(|row| {
                            row.as_array()
                                .unwrap_or(&Vec::new())
                                .iter()
                                .map(as_float)
                                .collect::<std::result::Result<Vec<_>, _>>()
                        })
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok(ParameterValue::ListListFloat(rows))
                } else {
                    Err("lists must contain numbers or lists of numbers".to_string())
                }
            }
            other => Err(format!("unsupported value {}", other)),
        }
    }
}

/// A mapping from setting name to value.
///
/// Two configurations are equal iff they hold the same names with equal
/// values. An empty configuration is the neutral overlay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    store: HashMap<Reference, ParameterValue>,
}

impl Configuration {
    pub fn new() -> Self {
        Configuration::default()
    }

    pub fn get(&self, name: &Reference) -> Option<&ParameterValue> {
        self.store.get(name)
    }

    pub fn insert(&mut self, name: Reference, value: ParameterValue) {
        self.store.insert(name, value);
    }

    pub fn contains(&self, name: &Reference) -> bool {
        self.store.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Reference, &ParameterValue)> {
        self.store.iter()
    }

    /// Copies every entry of `other` into this configuration, overwriting
    /// on collision.
    pub fn update(&mut self, other: &Configuration) {
        for (name, value) in &other.store {
            self.store.insert(name.clone(), value.clone());
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> =
            self.store.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        entries.sort();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

/// Base settings plus the per-iteration overlay.
#[derive(Debug, Default)]
pub struct ConfigurationStore {
    pub base: Configuration,
    pub overlay: Configuration,
}

impl ConfigurationStore {
    pub fn new() -> Self {
        ConfigurationStore::default()
    }

    /// Looks up a setting for the given instance.
    ///
    /// The overlay shadows the base, and within each the instance-scoped
    /// name `instance.name` shadows the bare `name`. If `expected` is
    /// given, the value must be of that type; reading an int as a float
    /// is the only permitted widening.
    pub fn get_parameter(
        &self,
        instance: &Reference,
        name: &Reference,
        expected: Option<ParameterType>,
    ) -> Result<ParameterValue> {
        let scoped = instance.concat(name);
        for configuration in [&self.overlay, &self.base] {
            for key in [&scoped, name] {
                if let Some(value) = configuration.get(key) {
                    let value = value.clone();
                    return match expected {
                        Some(t) => value.coerce(t, name),
                        None => Ok(value),
                    };
                }
            }
        }
        Err(Error::NoSuchParameter(name.to_string()))
    }
}

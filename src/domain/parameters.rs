//! Request parameters and the closed schemas that govern them.
//!
//! Plans declare one schema per operation (provisioning, updating, binding).
//! A schema is closed: any key it does not declare is rejected.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// A parameter failed schema validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation error on field \"{field}\": {issue}")]
pub struct ValidationError {
    /// Offending field, dotted for nested objects (`a.b`) and indexed for arrays (`a[2]`)
    pub field: String,

    /// What is wrong with it
    pub issue: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, issue: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            issue: issue.into(),
        }
    }
}

/// Closed schema for a set of input parameters
#[derive(Debug, Clone, Default)]
pub struct InputParametersSchema {
    /// Keys that must be present
    pub required_properties: Vec<String>,

    /// Schema per recognized key
    pub property_schemas: BTreeMap<String, PropertySchema>,
}

impl InputParametersSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper to declare a property
    pub fn with_property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.property_schemas.insert(name.into(), schema);
        self
    }

    /// Builder-style helper to mark a property as required
    pub fn with_required(mut self, name: impl Into<String>) -> Self {
        self.required_properties.push(name.into());
        self
    }

    pub fn declares(&self, name: &str) -> bool {
        self.property_schemas.contains_key(name)
    }

    /// Validate a parameter map against this schema.
    ///
    /// Keys are checked in sorted order and the first problem found is returned.
    pub fn validate(&self, params: &Map<String, Value>) -> Result<(), ValidationError> {
        self.validate_at("", params)
    }

    fn validate_at(&self, prefix: &str, params: &Map<String, Value>) -> Result<(), ValidationError> {
        let mut keys: Vec<&String> = params.keys().collect();
        keys.sort();

        for key in keys {
            let field = join_field(prefix, key);
            let schema = self
                .property_schemas
                .get(key)
                .ok_or_else(|| ValidationError::new(&field, "field is not recognized"))?;
            schema.validate(&field, &params[key.as_str()])?;
        }

        for required in &self.required_properties {
            if !params.contains_key(required) {
                return Err(ValidationError::new(
                    join_field(prefix, required),
                    "field is required",
                ));
            }
        }

        Ok(())
    }

    /// Render as a JSON Schema object for the catalog
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .property_schemas
            .iter()
            .map(|(name, schema)| (name.clone(), schema.to_json_schema()))
            .collect();

        let mut out = json!({
            "$schema": "http://json-schema.org/draft-04/schema#",
            "type": "object",
            "properties": properties,
            "additionalProperties": false,
        });
        if !self.required_properties.is_empty() {
            out["required"] = json!(self.required_properties);
        }
        out
    }

    fn default_for(&self, key: &str) -> Option<Value> {
        self.property_schemas.get(key)?.typed_default()
    }
}

fn join_field(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Type and constraints for a single parameter
#[derive(Debug, Clone)]
pub enum PropertySchema {
    String(StringPropertySchema),
    Integer(IntegerPropertySchema),
    Float(FloatPropertySchema),
    Boolean(BooleanPropertySchema),
    Array(ArrayPropertySchema),
    Object(ObjectPropertySchema),
}

#[derive(Debug, Clone, Default)]
pub struct StringPropertySchema {
    pub description: Option<String>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub allowed_values: Vec<String>,
    /// Compiled once, when the schema is built
    pub allowed_pattern: Option<Regex>,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IntegerPropertySchema {
    pub description: Option<String>,
    pub min_value: Option<i64>,
    pub max_value: Option<i64>,
    pub allowed_values: Vec<i64>,
    pub default_value: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct FloatPropertySchema {
    pub description: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub allowed_values: Vec<f64>,
    pub default_value: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct BooleanPropertySchema {
    pub description: Option<String>,
    pub default_value: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ArrayPropertySchema {
    pub description: Option<String>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub item_schema: Box<PropertySchema>,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectPropertySchema {
    pub description: Option<String>,
    pub properties: InputParametersSchema,
}

impl PropertySchema {
    /// An unconstrained string
    pub fn string() -> Self {
        Self::String(StringPropertySchema::default())
    }

    /// An unconstrained integer
    pub fn integer() -> Self {
        Self::Integer(IntegerPropertySchema::default())
    }

    pub fn boolean() -> Self {
        Self::Boolean(BooleanPropertySchema::default())
    }

    fn typed_default(&self) -> Option<Value> {
        match self {
            Self::String(s) => s.default_value.clone().map(Value::from),
            Self::Integer(s) => s.default_value.map(Value::from),
            Self::Float(s) => s.default_value.map(Value::from),
            Self::Boolean(s) => s.default_value.map(Value::from),
            Self::Array(_) | Self::Object(_) => None,
        }
    }

    fn validate(&self, field: &str, value: &Value) -> Result<(), ValidationError> {
        match self {
            Self::String(s) => s.validate(field, value),
            Self::Integer(s) => s.validate(field, value),
            Self::Float(s) => s.validate(field, value),
            Self::Boolean(_) => {
                if value.is_boolean() {
                    Ok(())
                } else {
                    Err(ValidationError::new(field, "field value must be a boolean"))
                }
            }
            Self::Array(s) => s.validate(field, value),
            Self::Object(s) => {
                let map = value
                    .as_object()
                    .ok_or_else(|| ValidationError::new(field, "field value must be an object"))?;
                s.properties.validate_at(field, map)
            }
        }
    }

    fn to_json_schema(&self) -> Value {
        let mut out = match self {
            Self::String(s) => {
                let mut v = json!({ "type": "string" });
                if let Some(min) = s.min_length {
                    v["minLength"] = json!(min);
                }
                if let Some(max) = s.max_length {
                    v["maxLength"] = json!(max);
                }
                if !s.allowed_values.is_empty() {
                    v["enum"] = json!(s.allowed_values);
                }
                if let Some(pattern) = &s.allowed_pattern {
                    v["pattern"] = json!(pattern.as_str());
                }
                v
            }
            Self::Integer(s) => {
                let mut v = json!({ "type": "integer" });
                if let Some(min) = s.min_value {
                    v["minimum"] = json!(min);
                }
                if let Some(max) = s.max_value {
                    v["maximum"] = json!(max);
                }
                if !s.allowed_values.is_empty() {
                    v["enum"] = json!(s.allowed_values);
                }
                v
            }
            Self::Float(s) => {
                let mut v = json!({ "type": "number" });
                if let Some(min) = s.min_value {
                    v["minimum"] = json!(min);
                }
                if let Some(max) = s.max_value {
                    v["maximum"] = json!(max);
                }
                if !s.allowed_values.is_empty() {
                    v["enum"] = json!(s.allowed_values);
                }
                v
            }
            Self::Boolean(_) => json!({ "type": "boolean" }),
            Self::Array(s) => {
                let mut v = json!({
                    "type": "array",
                    "items": s.item_schema.to_json_schema(),
                });
                if let Some(min) = s.min_items {
                    v["minItems"] = json!(min);
                }
                if let Some(max) = s.max_items {
                    v["maxItems"] = json!(max);
                }
                v
            }
            Self::Object(s) => {
                let mut v = s.properties.to_json_schema();
                if let Some(obj) = v.as_object_mut() {
                    obj.remove("$schema");
                }
                v
            }
        };

        let description = match self {
            Self::String(s) => s.description.as_ref(),
            Self::Integer(s) => s.description.as_ref(),
            Self::Float(s) => s.description.as_ref(),
            Self::Boolean(s) => s.description.as_ref(),
            Self::Array(s) => s.description.as_ref(),
            Self::Object(s) => s.description.as_ref(),
        };
        if let Some(description) = description {
            out["description"] = json!(description);
        }
        if let Some(default) = self.typed_default() {
            out["default"] = default;
        }
        out
    }
}

impl StringPropertySchema {
    fn validate(&self, field: &str, value: &Value) -> Result<(), ValidationError> {
        let s = value
            .as_str()
            .ok_or_else(|| ValidationError::new(field, "field value must be a string"))?;
        let len = s.chars().count();

        if let Some(min) = self.min_length {
            if len < min {
                return Err(ValidationError::new(
                    field,
                    format!("field length must be at least {}", min),
                ));
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                return Err(ValidationError::new(
                    field,
                    format!("field length must not exceed {}", max),
                ));
            }
        }
        if !self.allowed_values.is_empty() && !self.allowed_values.iter().any(|v| v == s) {
            return Err(ValidationError::new(
                field,
                format!("field value must be one of: {}", self.allowed_values.join(", ")),
            ));
        }
        if let Some(pattern) = &self.allowed_pattern {
            if !pattern.is_match(s) {
                return Err(ValidationError::new(
                    field,
                    format!("field value must match pattern {}", pattern.as_str()),
                ));
            }
        }
        Ok(())
    }
}

impl IntegerPropertySchema {
    fn validate(&self, field: &str, value: &Value) -> Result<(), ValidationError> {
        let n = as_integer(value)
            .ok_or_else(|| ValidationError::new(field, "field value must be an integer"))?;

        if let Some(min) = self.min_value {
            if n < min {
                return Err(ValidationError::new(
                    field,
                    format!("field value must be at least {}", min),
                ));
            }
        }
        if let Some(max) = self.max_value {
            if n > max {
                return Err(ValidationError::new(
                    field,
                    format!("field value must not exceed {}", max),
                ));
            }
        }
        if !self.allowed_values.is_empty() && !self.allowed_values.contains(&n) {
            let allowed: Vec<String> = self.allowed_values.iter().map(|v| v.to_string()).collect();
            return Err(ValidationError::new(
                field,
                format!("field value must be one of: {}", allowed.join(", ")),
            ));
        }
        Ok(())
    }
}

impl FloatPropertySchema {
    fn validate(&self, field: &str, value: &Value) -> Result<(), ValidationError> {
        let n = value
            .as_f64()
            .ok_or_else(|| ValidationError::new(field, "field value must be a number"))?;

        if let Some(min) = self.min_value {
            if n < min {
                return Err(ValidationError::new(
                    field,
                    format!("field value must be at least {}", min),
                ));
            }
        }
        if let Some(max) = self.max_value {
            if n > max {
                return Err(ValidationError::new(
                    field,
                    format!("field value must not exceed {}", max),
                ));
            }
        }
        if !self.allowed_values.is_empty() && !self.allowed_values.contains(&n) {
            let allowed: Vec<String> = self.allowed_values.iter().map(|v| v.to_string()).collect();
            return Err(ValidationError::new(
                field,
                format!("field value must be one of: {}", allowed.join(", ")),
            ));
        }
        Ok(())
    }
}

impl ArrayPropertySchema {
    fn validate(&self, field: &str, value: &Value) -> Result<(), ValidationError> {
        let items = value
            .as_array()
            .ok_or_else(|| ValidationError::new(field, "field value must be an array"))?;

        if let Some(min) = self.min_items {
            if items.len() < min {
                return Err(ValidationError::new(
                    field,
                    format!("array must contain at least {} items", min),
                ));
            }
        }
        if let Some(max) = self.max_items {
            if items.len() > max {
                return Err(ValidationError::new(
                    field,
                    format!("array must not contain more than {} items", max),
                ));
            }
        }
        for (i, item) in items.iter().enumerate() {
            self.item_schema.validate(&format!("{}[{}]", field, i), item)?;
        }
        Ok(())
    }
}

/// JSON numbers with no fractional part count as integers
fn as_integer(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// Parameter values plus the schema used to interpret them.
///
/// Only `data` is persisted. The schema is attached at read time from the
/// plan, which is why equality ignores it.
#[derive(Clone, Default)]
pub struct Parameters {
    pub schema: Option<Arc<InputParametersSchema>>,
    pub data: Map<String, Value>,
}

impl Parameters {
    pub fn new(schema: Option<Arc<InputParametersSchema>>, data: Map<String, Value>) -> Self {
        Self { schema, data }
    }

    /// Parameters without a schema
    pub fn from_data(data: Map<String, Value>) -> Self {
        Self { schema: None, data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Attach a schema, keeping the data
    pub fn with_schema(mut self, schema: Arc<InputParametersSchema>) -> Self {
        self.schema = Some(schema);
        self
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.data.get(key) {
            return Some(value.clone());
        }
        self.schema.as_ref()?.default_for(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.lookup(key)?.as_str().map(str::to_string)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        as_integer(&self.lookup(key)?)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.lookup(key)?.as_f64()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.lookup(key)?.as_bool()
    }

    pub fn get_array(&self, key: &str) -> Option<Vec<Value>> {
        match self.lookup(key)? {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn get_object(&self, key: &str) -> Option<Map<String, Value>> {
        match self.lookup(key)? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

impl PartialEq for Parameters {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl fmt::Debug for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameters")
            .field("data", &self.data)
            .field("has_schema", &self.schema.is_some())
            .finish()
    }
}

impl Serialize for Parameters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Parameters {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let data = Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
        Ok(Self::from_data(data))
    }
}

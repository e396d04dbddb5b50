//! Driver configuration schemas.
//!
//! Each driver declares the fields it accepts. Validation checks every field
//! and returns every violation, never stopping at the first.

use super::DriverConfig;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Custom field validator. `Err` carries the message reported to the operator.
pub type FieldValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Declared type of a configuration field. Values are never coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    /// Integer in 1..=65535.
    Port,
    Bool,
    /// JSON array or object.
    Array,
}

impl FieldType {
    fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Port => "port",
            FieldType::Bool => "bool",
            FieldType::Array => "array",
        }
    }

    fn check(self, field: &str, value: &Value) -> Result<(), String> {
        let ok = match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Port => {
                return match value.as_u64() {
                    Some(port) if (1..=65535).contains(&port) => Ok(()),
                    Some(port) => Err(format!("{field} must be a port between 1 and 65535, got {port}")),
                    None => Err(format!("{field} must be a port between 1 and 65535")),
                };
            }
            FieldType::Bool => value.is_boolean(),
            FieldType::Array => value.is_array() || value.is_object(),
        };

        if ok {
            Ok(())
        } else {
            Err(format!("{field} must be of type {}", self.as_str()))
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of one configuration field.
#[derive(Clone)]
pub struct FieldSpec {
    pub required: bool,
    pub field_type: FieldType,
    pub description: Option<String>,
    pub default: Option<Value>,
    validator: Option<FieldValidator>,
}

impl FieldSpec {
    /// A field that must be present and non-empty.
    pub fn required(field_type: FieldType) -> Self {
        Self {
            required: true,
            field_type,
            description: None,
            default: None,
            validator: None,
        }
    }

    /// A field that may be omitted.
    pub fn optional(field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(field_type)
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn validator(
        mut self,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    fn validate(&self, field: &str, value: Option<&Value>, errors: &mut Vec<String>) {
        let value = match value {
            Some(v) if !is_empty(v) => v,
            _ => {
                if self.required {
                    errors.push(format!("{field} is required"));
                }
                return;
            }
        };

        if let Err(e) = self.field_type.check(field, value) {
            errors.push(e);
            return;
        }

        if let Some(validator) = &self.validator {
            if let Err(message) = validator(value) {
                errors.push(format!("{field}: {message}"));
            }
        }
    }
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("required", &self.required)
            .field("field_type", &self.field_type)
            .field("description", &self.description)
            .field("default", &self.default)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Set of field declarations for one driver.
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field declaration.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validates a configuration map, collecting every violation.
    ///
    /// Keys not declared in the schema are ignored.
    pub fn validate(&self, config: &DriverConfig) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        for (name, spec) in &self.fields {
            spec.validate(name, config.get(name), &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Describes the schema as JSON for operators.
    pub fn describe(&self) -> Value {
        let fields: Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    json!({
                        "required": spec.required,
                        "type": spec.field_type.as_str(),
                        "description": spec.description,
                        "default": spec.default,
                    }),
                )
            })
            .collect();
        Value::Object(fields)
    }
}

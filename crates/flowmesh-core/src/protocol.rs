//! Protocol specifications: named, versioned collections of JSON-RPC
//! methods with declarative parameter schemas (spec.md §3 "ProtocolSpec").

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Declarative parameter type, gating request validation at the registry
/// boundary (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    /// Whether `value` is of this declared type. `Integer` additionally
    /// requires the JSON number to have no fractional part.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Number => value.is_number(),
            ParameterType::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Array => value.is_array(),
            ParameterType::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Integer => "integer",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        };
        write!(f, "{s}")
    }
}

/// One parameter's schema entry within a `MethodSpec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Declarative constraints checked after type matching: `min`/`max`
    /// for numeric types, `min_length`/`max_length` for strings/arrays,
    /// `enum_values` for a closed set of allowed values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default: None,
            min: None,
            max: None,
            min_length: None,
            max_length: None,
            enum_values: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        if !self.param_type.matches(value) {
            return Err(SchemaError::TypeMismatch {
                field: self.name.clone(),
                expected: self.param_type,
            });
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(SchemaError::OutOfRange {
                        field: self.name.clone(),
                    });
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(SchemaError::OutOfRange {
                        field: self.name.clone(),
                    });
                }
            }
        }
        let length = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(a) => Some(a.len()),
            _ => None,
        };
        if let Some(len) = length {
            if let Some(min_length) = self.min_length {
                if len < min_length {
                    return Err(SchemaError::OutOfRange {
                        field: self.name.clone(),
                    });
                }
            }
            if let Some(max_length) = self.max_length {
                if len > max_length {
                    return Err(SchemaError::OutOfRange {
                        field: self.name.clone(),
                    });
                }
            }
        }
        if !self.enum_values.is_empty() && !self.enum_values.contains(value) {
            return Err(SchemaError::NotInEnum {
                field: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// An example request/response pair, carried for documentation only (not
/// enforced at validation time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodExample {
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// One RPC method within a protocol, with its declarative params/returns
/// schemas (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    #[serde(default)]
    pub params_schema: Vec<ParameterSpec>,
    #[serde(default)]
    pub returns_schema: Vec<ParameterSpec>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<MethodExample>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params_schema: Vec::new(),
            returns_schema: Vec::new(),
            description: String::new(),
            examples: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: ParameterSpec) -> Self {
        self.params_schema.push(param);
        self
    }

    /// Validate `params` (an object) against `params_schema`, applying
    /// declared defaults and rejecting unknown/missing/malformed fields
    /// (spec.md §4.3: "reject with `INVALID_PARAMS`").
    pub fn validate_params(&self, params: &Value) -> Result<Value, SchemaError> {
        let obj = params.as_object().ok_or(SchemaError::NotAnObject)?;
        let known: std::collections::HashSet<&str> =
            self.params_schema.iter().map(|p| p.name.as_str()).collect();
        for key in obj.keys() {
            if !known.contains(key.as_str()) {
                return Err(SchemaError::UnknownField { field: key.clone() });
            }
        }

        let mut resolved = serde_json::Map::new();
        for spec in &self.params_schema {
            match obj.get(&spec.name) {
                Some(value) => {
                    spec.validate(value)?;
                    resolved.insert(spec.name.clone(), value.clone());
                }
                None => {
                    if let Some(default) = &spec.default {
                        resolved.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        return Err(SchemaError::MissingRequired {
                            field: spec.name.clone(),
                        });
                    }
                }
            }
        }
        Ok(Value::Object(resolved))
    }
}

/// A named, versioned protocol (`name/vN`), e.g. `llm/v1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    pub protocol_id: String,
    #[serde(default)]
    pub description: String,
    pub methods: HashMap<String, MethodSpec>,
}

impl ProtocolSpec {
    pub fn new(protocol_id: impl Into<String>) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            description: String::new(),
            methods: HashMap::new(),
        }
    }

    pub fn with_method(mut self, method: MethodSpec) -> Self {
        self.methods.insert(method.name.clone(), method);
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }

    /// A `name/vN` protocol id must have a non-empty name and a `vN`
    /// version suffix.
    pub fn is_well_formed_id(protocol_id: &str) -> bool {
        match protocol_id.rsplit_once('/') {
            Some((name, version)) => {
                !name.is_empty()
                    && version.starts_with('v')
                    && version.len() > 1
                    && version[1..].chars().all(|c| c.is_ascii_digit())
            }
            None => false,
        }
    }
}

/// Errors raised validating a protocol spec or an outbound call against it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("protocol id '{0}' is not of the form name/vN")]
    MalformedProtocolId(String),
    #[error("params must be a JSON object")]
    NotAnObject,
    #[error("missing required field '{field}'")]
    MissingRequired { field: String },
    #[error("unknown field '{field}'")]
    UnknownField { field: String },
    #[error("field '{field}' does not match expected type {expected}")]
    TypeMismatch { field: String, expected: ParameterType },
    #[error("field '{field}' is out of range")]
    OutOfRange { field: String },
    #[error("field '{field}' is not one of the allowed values")]
    NotInEnum { field: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_method() -> MethodSpec {
        MethodSpec::new("add")
            .with_param(ParameterSpec::new("a", ParameterType::Number).required())
            .with_param(ParameterSpec::new("b", ParameterType::Number).required())
    }

    #[test]
    fn well_formed_protocol_id() {
        assert!(ProtocolSpec::is_well_formed_id("math/v1"));
        assert!(ProtocolSpec::is_well_formed_id("llm/v2"));
        assert!(!ProtocolSpec::is_well_formed_id("math"));
        assert!(!ProtocolSpec::is_well_formed_id("math/1"));
        assert!(!ProtocolSpec::is_well_formed_id("/v1"));
    }

    #[test]
    fn validates_required_fields() {
        let method = add_method();
        assert!(method.validate_params(&json!({"a": 1, "b": 2})).is_ok());
        let err = method.validate_params(&json!({"a": 1})).unwrap_err();
        assert!(matches!(err, SchemaError::MissingRequired { .. }));
    }

    #[test]
    fn rejects_unknown_fields() {
        let method = add_method();
        let err = method
            .validate_params(&json!({"a": 1, "b": 2, "c": 3}))
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownField { .. }));
    }

    #[test]
    fn rejects_type_mismatch() {
        let method = add_method();
        let err = method
            .validate_params(&json!({"a": "not-a-number", "b": 2}))
            .unwrap_err();
        assert!(matches!(err, SchemaError::TypeMismatch { .. }));
    }

    #[test]
    fn applies_default_when_field_absent() {
        let method = MethodSpec::new("greet").with_param(
            ParameterSpec::new("greeting", ParameterType::String).with_default(json!("hello")),
        );
        let resolved = method.validate_params(&json!({})).unwrap();
        assert_eq!(resolved["greeting"], json!("hello"));
    }

    #[test]
    fn enum_constraint_rejects_out_of_set_value() {
        let mut spec = ParameterSpec::new("level", ParameterType::String);
        spec.enum_values = vec![json!("low"), json!("high")];
        let method = MethodSpec::new("set_level").with_param(spec);
        assert!(method.validate_params(&json!({"level": "low"})).is_ok());
        assert!(matches!(
            method.validate_params(&json!({"level": "medium"})).unwrap_err(),
            SchemaError::NotInEnum { .. }
        ));
    }
}

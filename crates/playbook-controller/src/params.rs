//! Workflow parameter derivation
//!
//! Parameters are derived from a resource in a fixed order: `namespace`
//! first, then each schema field in declaration order. Fields the schema
//! does not list are ignored. Derivation either yields every required
//! parameter or fails without side effects.

use std::fmt;
use std::str::FromStr;

use kube::api::DynamicObject;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::executor::Parameter;

/// Key of the always-present namespace parameter
pub const NAMESPACE_PARAMETER: &str = "namespace";

/// JSON type a spec field must have
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// JSON string, passed through verbatim
    String,
    /// JSON integer (floats are rejected)
    Integer,
    /// JSON boolean, rendered as `true`/`false`
    Boolean,
}

impl FieldKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }

    fn render(&self, value: &Value) -> Option<String> {
        match (self, value) {
            (Self::String, Value::String(s)) => Some(s.clone()),
            (Self::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Some(n.to_string()),
            (Self::Boolean, Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One spec field that becomes a workflow parameter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    /// Key under `spec` and name of the resulting parameter
    pub key: String,
    /// Expected JSON type
    pub kind: FieldKind,
    /// Whether derivation fails when the field is absent
    pub required: bool,
}

impl FieldSpec {
    /// A field that must be present
    pub fn required(key: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            key: key.into(),
            kind,
            required: true,
        }
    }

    /// A field that is passed through only when present
    pub fn optional(key: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            key: key.into(),
            kind,
            required: false,
        }
    }
}

/// Error parsing a `key:type[?]` field declaration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldSpecParseError {
    /// The declaration has no `:type` part or an empty key
    #[error("invalid field declaration {0:?}: expected key:type with an optional trailing ?")]
    Malformed(String),

    /// The type is not one of string, integer, boolean
    #[error("unknown field type {0:?}: expected string, integer or boolean")]
    UnknownKind(String),
}

impl FromStr for FieldKind {
    type Err = FieldSpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "str" => Ok(Self::String),
            "integer" | "int" => Ok(Self::Integer),
            "boolean" | "bool" => Ok(Self::Boolean),
            _ => Err(FieldSpecParseError::UnknownKind(s.to_string())),
        }
    }
}

/// Parses `size:integer` (required) or `tier:string?` (optional)
impl FromStr for FieldSpec {
    type Err = FieldSpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, kind) = s
            .split_once(':')
            .ok_or_else(|| FieldSpecParseError::Malformed(s.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(FieldSpecParseError::Malformed(s.to_string()));
        }
        let kind = kind.trim();
        let (kind, required) = match kind.strip_suffix('?') {
            Some(kind) => (kind, false),
            None => (kind, true),
        };
        Ok(Self {
            key: key.to_string(),
            kind: kind.parse()?,
            required,
        })
    }
}

/// Why parameters could not be derived from a resource
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DerivationError {
    /// A required field is absent
    #[error("missing required field {field}")]
    MissingField {
        /// Path of the missing field
        field: String,
    },

    /// A field is present with the wrong JSON type
    #[error("field {field} must be {expected}, found {found}")]
    WrongType {
        /// Path of the offending field
        field: String,
        /// Type the schema asks for
        expected: FieldKind,
        /// Type actually found
        found: &'static str,
    },

    /// `spec` exists but is not an object
    #[error("spec must be an object, found {found}")]
    InvalidSpec {
        /// Type actually found
        found: &'static str,
    },
}

/// Ordered list of spec fields turned into workflow parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterSchema {
    fields: Vec<FieldSpec>,
}

impl Default for ParameterSchema {
    /// A single required integer `size`
    fn default() -> Self {
        Self::new(vec![FieldSpec::required("size", FieldKind::Integer)])
    }
}

impl ParameterSchema {
    /// Schema with the given fields, in parameter order
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Declared fields in parameter order
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Derive the ordered parameter list for `resource`.
    ///
    /// `namespace` comes from `spec.namespace` when that is a string and
    /// falls back to the resource's own namespace.
    pub fn derive(&self, resource: &DynamicObject) -> Result<Vec<Parameter>, DerivationError> {
        let empty = Map::new();
        let spec = match resource.data.get("spec") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(spec)) => spec,
            Some(other) => {
                return Err(DerivationError::InvalidSpec {
                    found: json_type(other),
                })
            }
        };

        let mut parameters = Vec::with_capacity(self.fields.len() + 1);
        parameters.push(Parameter::new(
            NAMESPACE_PARAMETER,
            derive_namespace(spec, resource)?,
        ));

        for field in &self.fields {
            if field.key == NAMESPACE_PARAMETER {
                continue;
            }
            let value = match spec.get(&field.key) {
                None | Some(Value::Null) if field.required => {
                    return Err(DerivationError::MissingField {
                        field: spec_path(&field.key),
                    })
                }
                None | Some(Value::Null) => continue,
                Some(value) => value,
            };
            let rendered = field
                .kind
                .render(value)
                .ok_or_else(|| DerivationError::WrongType {
                    field: spec_path(&field.key),
                    expected: field.kind,
                    found: json_type(value),
                })?;
            parameters.push(Parameter::new(field.key.clone(), rendered));
        }

        Ok(parameters)
    }
}

fn derive_namespace(
    spec: &Map<String, Value>,
    resource: &DynamicObject,
) -> Result<String, DerivationError> {
    match spec.get(NAMESPACE_PARAMETER) {
        Some(Value::String(namespace)) if !namespace.is_empty() => Ok(namespace.clone()),
        Some(Value::String(_)) | None | Some(Value::Null) => resource
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| DerivationError::MissingField {
                field: "metadata.namespace".to_string(),
            }),
        Some(other) => Err(DerivationError::WrongType {
            field: spec_path(NAMESPACE_PARAMETER),
            expected: FieldKind::String,
            found: json_type(other),
        }),
    }
}

fn spec_path(key: &str) -> String {
    format!("spec.{key}")
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "non-integer number",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//! The typed value model produced by compilation and consumed by the expression engine.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

/// Scalar is a terminal SimpleSchema type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scalar {
    /// A UTF-8 string.
    String,
    /// A 64-bit integer.
    Integer,
    /// A double-precision float; integers coerce into it.
    Number,
    /// A boolean.
    Boolean,
}

impl Scalar {
    pub(crate) fn parse(s: &str) -> Option<Scalar> {
        Some(match s {
            "string" => Scalar::String,
            "integer" => Scalar::Integer,
            "number" => Scalar::Number,
            "boolean" | "bool" => Scalar::Boolean,
            _ => return None,
        })
    }

    /// As_str is the canonical DSL spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scalar::String => "string",
            Scalar::Integer => "integer",
            Scalar::Number => "number",
            Scalar::Boolean => "boolean",
        }
    }
}

/// Type is the recursive SimpleSchema type.
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    /// A terminal scalar.
    Scalar(Scalar),
    /// A struct with named fields.
    Object(BTreeMap<String, FieldSpec>),
    /// A struct with named fields that also admits unknown members as [`Type::Any`].
    ///
    /// Used for Kubernetes resource types whose full schema is not known statically: the
    /// well-known parts carry real types, everything else stays unconstrained.
    OpenObject(BTreeMap<String, FieldSpec>),
    /// A homogeneous array.
    Array(Box<Type>),
    /// A map from a key type to a value type.
    Map(Box<Type>, Box<Type>),
    /// An unconstrained value; member access into it yields `Any` again.
    Any,
}

impl Type {
    /// Field reports the type of a named member, if this type supports member access.
    ///
    /// `Object` requires the field to exist, `Map` yields its value type for any key, and
    /// `Any` stays `Any`. Scalars and arrays have no members.
    pub fn field(&self, name: &str) -> Option<&Type> {
        match self {
            Type::Object(fields) => fields.get(name).map(|f| &f.ty),
            Type::OpenObject(fields) => {
                Some(fields.get(name).map(|f| &f.ty).unwrap_or(&Type::Any))
            }
            Type::Map(_, v) => Some(v),
            Type::Any => Some(&Type::Any),
            _ => None,
        }
    }

    /// Element reports the element type for indexing, if this type is indexable.
    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Array(el) => Some(el),
            Type::Map(_, v) => Some(v),
            Type::Any => Some(&Type::Any),
            _ => None,
        }
    }

    /// Is_numeric reports whether arithmetic applies.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Scalar(Scalar::Integer | Scalar::Number) | Type::Any)
    }

    /// Admits reports whether `value` inhabits this type.
    pub fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (Type::Any, _) => true,
            (Type::Scalar(Scalar::String), Value::String(_)) => true,
            (Type::Scalar(Scalar::Boolean), Value::Bool(_)) => true,
            (Type::Scalar(Scalar::Integer), Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Type::Scalar(Scalar::Number), Value::Number(_)) => true,
            (Type::Array(el), Value::Array(items)) => items.iter().all(|v| el.admits(v)),
            (Type::Map(_, vt), Value::Object(map)) => map.values().all(|v| vt.admits(v)),
            (Type::Object(fields), Value::Object(map)) => map.iter().all(|(k, v)| {
                fields.get(k).map(|f| f.ty.admits(v)).unwrap_or(false)
            }),
            (Type::OpenObject(fields), Value::Object(map)) => map.iter().all(|(k, v)| {
                fields.get(k).map(|f| f.ty.admits(v)).unwrap_or(true)
            }),
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(s) => f.write_str(s.as_str()),
            Type::Object(_) | Type::OpenObject(_) => f.write_str("object"),
            Type::Array(el) => write!(f, "[{el}]"),
            Type::Map(k, v) => write!(f, "map[{k}]{v}"),
            Type::Any => f.write_str("any"),
        }
    }
}

/// FieldSpec is one field of an `Object`: its type plus the attributes attached in the DSL.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldSpec {
    /// The field's type.
    pub ty: Type,
    /// Whether the field must be present.
    pub required: bool,
    /// Default inserted when the field is absent.
    pub default: Option<Value>,
    /// Human-readable description, projected into the OpenAPI schema.
    pub description: Option<String>,
    /// Closed set of admissible values.
    pub enum_values: Vec<Value>,
    /// Numeric lower bound.
    pub minimum: Option<f64>,
    /// Numeric upper bound.
    pub maximum: Option<f64>,
    /// Regex pattern for strings.
    pub pattern: Option<String>,
    /// Minimum string length.
    pub min_length: Option<i64>,
    /// Maximum string length.
    pub max_length: Option<i64>,
    /// Expression-level validation rules scoped to this field.
    pub validations: Vec<Validation>,
}

impl FieldSpec {
    /// Plain wraps a bare type with no attributes.
    pub fn plain(ty: Type) -> FieldSpec {
        FieldSpec { ty, ..FieldSpec::default() }
    }
}

impl Default for Type {
    fn default() -> Self {
        Type::Any
    }
}

/// Validation is one CEL rule attached to a field or to the schema root.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Validation {
    /// The rule, evaluated with `self` bound to the value under validation.
    pub expression: String,
    /// Message reported on failure.
    #[serde(default)]
    pub message: String,
}

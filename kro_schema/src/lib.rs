#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Kro_schema compiles the SimpleSchema DSL into a typed value model and an OpenAPI v3 schema
//! suitable for embedding in a CRD.
//!
//! A SimpleSchema document is a JSON tree whose leaves are *atom strings* of the form
//! `baseType ( '|' attribute )*`, e.g. `integer | default=3 | minimum=1`. Nested objects
//! declare sub-structs, `[T]` declares arrays, `map[K]V` declares maps, and names declared in
//! the `types` section may be used wherever a base type is expected.

mod defaults;
mod openapi;
mod parse;
mod types;

pub use defaults::{apply_defaults, defaults_for};
pub use openapi::{to_openapi, to_openapi_with_validations};
pub use parse::{compile, status_fields, StatusField};
pub use types::{FieldSpec, Scalar, Type, Validation};

/// Error is everything that can go wrong while compiling a SimpleSchema document.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// UnknownType indicates a base type that is neither built-in nor declared in `types`.
    #[error("unknown type {0:?} at {1}")]
    UnknownType(String, String),
    /// RecursiveType indicates a named type that (transitively) contains itself.
    #[error("named type {0:?} is self-referential")]
    RecursiveType(String),
    /// MalformedAtom indicates an atom string that does not scan.
    #[error("malformed type atom {0:?} at {1}")]
    MalformedAtom(String, String),
    /// MalformedAttribute indicates an unknown or unparsable `key=value` attribute.
    #[error("malformed attribute {0:?} at {1}")]
    MalformedAttribute(String, String),
    /// WrongDefaultType indicates a `default=` literal that does not inhabit the field's type.
    #[error("default value {value} does not match type {ty} at {at}")]
    WrongDefaultType {
        /// The offending literal, rendered as JSON.
        value: serde_json::Value,
        /// The declared type.
        ty: String,
        /// Path of the field.
        at: String,
    },
    /// DuplicateType indicates a `types` entry shadowing a built-in base type.
    #[error("named type {0:?} shadows a built-in type")]
    DuplicateType(String),
    /// MalformedValidation indicates a `validation=` attribute that is not a list of
    /// `{expression, message}` objects.
    #[error("malformed validation at {0}")]
    MalformedValidation(String),
    /// UnexpectedValue indicates a schema node that is neither an object nor an atom string.
    #[error("expected an object or a type atom at {0}")]
    UnexpectedValue(String),
    /// StatusLeaf indicates a status leaf that is not a string expression.
    #[error("status leaf at {0} must be a ${{...}} expression string")]
    StatusLeaf(String),
}

/// Result typedef for schema compilation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

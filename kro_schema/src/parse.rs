//! Parsing of SimpleSchema documents into the [`Type`] model.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::{Error, FieldSpec, Result, Scalar, Type, Validation};

/// Compile parses the `spec` tree of a schema, resolving named types from `types`.
///
/// The result is always a [`Type::Object`]; an empty spec compiles to an empty object.
pub fn compile(spec: &Map<String, Value>, types: &Map<String, Value>) -> Result<Type> {
    for name in types.keys() {
        if Scalar::parse(name).is_some() || name == "map" || name == "any" {
            return Err(Error::DuplicateType(name.clone()));
        }
    }
    let mut stack = Vec::new();
    Ok(parse_object(spec, types, &mut stack, "spec")?.ty)
}

fn parse_object(
    tree: &Map<String, Value>,
    types: &Map<String, Value>,
    stack: &mut Vec<String>,
    path: &str,
) -> Result<FieldSpec> {
    let mut fields = BTreeMap::new();
    for (name, value) in tree {
        let at = format!("{path}.{name}");
        fields.insert(name.clone(), parse_value(value, types, stack, &at)?);
    }
    Ok(FieldSpec::plain(Type::Object(fields)))
}

fn parse_value(
    value: &Value,
    types: &Map<String, Value>,
    stack: &mut Vec<String>,
    path: &str,
) -> Result<FieldSpec> {
    match value {
        Value::Object(tree) => parse_object(tree, types, stack, path),
        Value::String(atom) => parse_atom(atom, types, stack, path),
        // An array literal declares a homogeneous array by its single element.
        Value::Array(items) if items.len() == 1 => {
            let el = parse_value(&items[0], types, stack, &format!("{path}[]"))?;
            Ok(FieldSpec::plain(Type::Array(Box::new(el.ty))))
        }
        _ => Err(Error::UnexpectedValue(path.to_string())),
    }
}

fn parse_atom(
    atom: &str,
    types: &Map<String, Value>,
    stack: &mut Vec<String>,
    path: &str,
) -> Result<FieldSpec> {
    let mut parts = split_atom(atom);
    if parts.is_empty() {
        return Err(Error::MalformedAtom(atom.to_string(), path.to_string()));
    }
    let base = parts.remove(0);
    let ty = parse_base(base.trim(), types, stack, path)?;
    let mut spec = FieldSpec::plain(ty);
    for part in parts {
        apply_attribute(&mut spec, part.trim(), path)?;
    }
    if let Some(default) = &spec.default {
        if !spec.ty.admits(default) {
            return Err(Error::WrongDefaultType {
                value: default.clone(),
                ty: spec.ty.to_string(),
                at: path.to_string(),
            });
        }
    }
    Ok(spec)
}

fn parse_base(
    base: &str,
    types: &Map<String, Value>,
    stack: &mut Vec<String>,
    path: &str,
) -> Result<Type> {
    if base == "any" {
        return Ok(Type::Any);
    }
    if let Some(s) = Scalar::parse(base) {
        return Ok(Type::Scalar(s));
    }
    if let Some(inner) = base.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return Ok(Type::Array(Box::new(parse_base(inner.trim(), types, stack, path)?)));
    }
    if let Some(rest) = base.strip_prefix("map[") {
        let close = rest
            .find(']')
            .ok_or_else(|| Error::MalformedAtom(base.to_string(), path.to_string()))?;
        let key = parse_base(rest[..close].trim(), types, stack, path)?;
        let value = parse_base(rest[close.saturating_add(1)..].trim(), types, stack, path)?;
        return Ok(Type::Map(Box::new(key), Box::new(value)));
    }
    resolve_named(base, types, stack, path)
}

fn resolve_named(
    name: &str,
    types: &Map<String, Value>,
    stack: &mut Vec<String>,
    path: &str,
) -> Result<Type> {
    if !name.chars().next().map(char::is_alphabetic).unwrap_or(false) {
        return Err(Error::MalformedAtom(name.to_string(), path.to_string()));
    }
    if stack.iter().any(|n| n == name) {
        return Err(Error::RecursiveType(name.to_string()));
    }
    let decl = types
        .get(name)
        .ok_or_else(|| Error::UnknownType(name.to_string(), path.to_string()))?;
    stack.push(name.to_string());
    let spec = parse_value(decl, types, stack, &format!("types.{name}"))?;
    stack.pop();
    Ok(spec.ty)
}

/// Split an atom on `|` at nesting depth zero, honoring quoted strings.
fn split_atom(atom: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0usize;
    for (i, c) in atom.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '[' | '{' if !in_string => depth = depth.saturating_add(1),
            ']' | '}' if !in_string => depth = depth.saturating_sub(1),
            '|' if !in_string && depth == 0 => {
                parts.push(&atom[start..i]);
                start = i.saturating_add(1);
            }
            _ => {}
        }
    }
    parts.push(&atom[start..]);
    parts
}

fn apply_attribute(spec: &mut FieldSpec, attr: &str, path: &str) -> Result<()> {
    let malformed = || Error::MalformedAttribute(attr.to_string(), path.to_string());
    let (key, raw) = attr.split_once('=').ok_or_else(malformed)?;
    // JSON literal with a bare-word fallback, so `default=nginx` reads as "nginx".
    let value = serde_json::from_str::<Value>(raw.trim())
        .unwrap_or_else(|_| Value::String(raw.trim().to_string()));
    match key.trim() {
        "required" => spec.required = value.as_bool().ok_or_else(malformed)?,
        "default" => spec.default = Some(value),
        "description" => {
            spec.description = Some(value.as_str().ok_or_else(malformed)?.to_string())
        }
        "enum" => {
            spec.enum_values = value.as_array().cloned().ok_or_else(malformed)?;
        }
        "minimum" => spec.minimum = Some(value.as_f64().ok_or_else(malformed)?),
        "maximum" => spec.maximum = Some(value.as_f64().ok_or_else(malformed)?),
        "pattern" => spec.pattern = Some(value.as_str().ok_or_else(malformed)?.to_string()),
        "minLength" => spec.min_length = Some(value.as_i64().ok_or_else(malformed)?),
        "maxLength" => spec.max_length = Some(value.as_i64().ok_or_else(malformed)?),
        "validation" => {
            spec.validations = serde_json::from_value::<Vec<Validation>>(value)
                .map_err(|_| Error::MalformedValidation(path.to_string()))?;
        }
        _ => return Err(malformed()),
    }
    Ok(())
}

/// StatusField is one declared status leaf: where it lives and its raw expression source.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusField {
    /// Path of the leaf below `.status`.
    pub path: Vec<String>,
    /// The raw `${...}` source.
    pub expression: String,
}

/// Status_fields flattens a `status` tree into its expression leaves.
///
/// Leaves must be strings; their types are not declared here but inferred later, once the
/// resource output types are known.
pub fn status_fields(status: &Map<String, Value>) -> Result<Vec<StatusField>> {
    let mut out = Vec::new();
    let mut prefix = Vec::new();
    walk_status(status, &mut prefix, &mut out)?;
    Ok(out)
}

fn walk_status(
    tree: &Map<String, Value>,
    prefix: &mut Vec<String>,
    out: &mut Vec<StatusField>,
) -> Result<()> {
    for (name, value) in tree {
        prefix.push(name.clone());
        match value {
            Value::Object(sub) => walk_status(sub, prefix, out)?,
            Value::String(src) => out.push(StatusField {
                path: prefix.clone(),
                expression: src.clone(),
            }),
            _ => return Err(Error::StatusLeaf(prefix.join("."))),
        }
        prefix.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn field<'a>(ty: &'a Type, name: &str) -> &'a FieldSpec {
        match ty {
            Type::Object(fields) => &fields[name],
            _ => panic!("not an object type"),
        }
    }

    #[test]
    fn scalars_and_attributes() {
        let spec = obj(json!({
            "name": "string | required=true",
            "image": "string | default=nginx | description=\"container image\"",
            "replicas": "integer | default=3 | minimum=1 | maximum=100",
            "debug": "boolean | default=false",
        }));
        let ty = compile(&spec, &Map::new()).unwrap();

        let name = field(&ty, "name");
        assert_eq!(name.ty, Type::Scalar(Scalar::String));
        assert!(name.required);

        let image = field(&ty, "image");
        assert_eq!(image.default, Some(json!("nginx")));
        assert_eq!(image.description.as_deref(), Some("container image"));

        let replicas = field(&ty, "replicas");
        assert_eq!(replicas.default, Some(json!(3)));
        assert_eq!(replicas.minimum, Some(1.0));
        assert_eq!(replicas.maximum, Some(100.0));
    }

    #[test]
    fn nested_objects_arrays_and_maps() {
        let spec = obj(json!({
            "ingress": {
                "enabled": "boolean | default=false",
                "hosts": "[string]",
            },
            "env": "map[string]string",
            "ports": ["integer"],
        }));
        let ty = compile(&spec, &Map::new()).unwrap();

        let ingress = field(&ty, "ingress");
        assert_eq!(
            field(&ingress.ty, "hosts").ty,
            Type::Array(Box::new(Type::Scalar(Scalar::String)))
        );
        assert_eq!(
            field(&ty, "env").ty,
            Type::Map(
                Box::new(Type::Scalar(Scalar::String)),
                Box::new(Type::Scalar(Scalar::String))
            )
        );
        assert_eq!(
            field(&ty, "ports").ty,
            Type::Array(Box::new(Type::Scalar(Scalar::Integer)))
        );
    }

    #[test]
    fn named_types_resolve() {
        let types = obj(json!({
            "Endpoint": {
                "host": "string | required=true",
                "port": "integer | default=80",
            },
        }));
        let spec = obj(json!({"backend": "Endpoint", "mirrors": "[Endpoint]"}));
        let ty = compile(&spec, &types).unwrap();
        let backend = field(&ty, "backend");
        assert!(matches!(backend.ty, Type::Object(_)));
        assert_eq!(field(&backend.ty, "port").default, Some(json!(80)));
    }

    #[test]
    fn recursive_named_type_is_rejected() {
        let types = obj(json!({"Node": {"next": "Node"}}));
        let spec = obj(json!({"head": "Node"}));
        let err = compile(&spec, &types).unwrap_err();
        assert!(matches!(err, Error::RecursiveType(name) if name == "Node"));
    }

    #[test]
    fn unknown_base_type() {
        let spec = obj(json!({"x": "strnig"}));
        let err = compile(&spec, &Map::new()).unwrap_err();
        assert!(matches!(err, Error::UnknownType(name, _) if name == "strnig"));
    }

    #[test]
    fn default_of_wrong_type() {
        let spec = obj(json!({"replicas": "integer | default=three"}));
        let err = compile(&spec, &Map::new()).unwrap_err();
        assert!(matches!(err, Error::WrongDefaultType { .. }));
    }

    #[test]
    fn validation_attribute() {
        let spec = obj(json!({
            "image": r#"string | validation=[{"expression": "self != ''", "message": "image must not be empty"}]"#,
        }));
        let ty = compile(&spec, &Map::new()).unwrap();
        let image = field(&ty, "image");
        assert_eq!(image.validations.len(), 1);
        assert_eq!(image.validations[0].expression, "self != ''");
    }

    #[test]
    fn pipe_inside_quotes_does_not_split() {
        let spec = obj(json!({"sep": r#"string | default="a|b""#}));
        let ty = compile(&spec, &Map::new()).unwrap();
        assert_eq!(field(&ty, "sep").default, Some(json!("a|b")));
    }

    #[test]
    fn status_leaves() {
        let status = obj(json!({
            "availableReplicas": "${deployment.status.availableReplicas}",
            "service": {"endpoint": "${service.metadata.name}"},
        }));
        let fields = status_fields(&status).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].path, vec!["availableReplicas"]);
        assert_eq!(fields[1].path, vec!["service", "endpoint"]);

        let bad = obj(json!({"count": 3}));
        assert!(matches!(status_fields(&bad), Err(Error::StatusLeaf(_))));
    }
}

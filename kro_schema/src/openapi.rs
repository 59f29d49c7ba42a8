//! Projection of the [`Type`] model into OpenAPI v3 for CRD embedding.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSON, JSONSchemaProps, JSONSchemaPropsOrArray, JSONSchemaPropsOrBool, ValidationRule,
};

use crate::{FieldSpec, Scalar, Type, Validation};

/// To_openapi renders a bare type with no attached attributes.
pub fn to_openapi(ty: &Type) -> JSONSchemaProps {
    props(&FieldSpec::plain(ty.clone()))
}

/// To_openapi_with_validations renders a type and attaches rules at the schema root.
///
/// This is how the schema-level `validation[]` entries become
/// `x-kubernetes-validations` on the instance spec.
pub fn to_openapi_with_validations(ty: &Type, rules: &[Validation]) -> JSONSchemaProps {
    let mut out = to_openapi(ty);
    if !rules.is_empty() {
        out.x_kubernetes_validations
            .get_or_insert_default()
            .extend(rules.iter().map(to_rule));
    }
    out
}

fn to_rule(v: &Validation) -> ValidationRule {
    ValidationRule {
        rule: v.expression.clone(),
        message: (!v.message.is_empty()).then(|| v.message.clone()),
        ..Default::default()
    }
}

fn props(spec: &FieldSpec) -> JSONSchemaProps {
    let mut out = match &spec.ty {
        Type::Scalar(s) => JSONSchemaProps {
            type_: Some(scalar_name(*s).to_string()),
            ..Default::default()
        },
        Type::Object(fields) => {
            let mut properties = BTreeMap::new();
            let mut required = Vec::new();
            for (name, field) in fields {
                if field.required {
                    required.push(name.clone());
                }
                properties.insert(name.clone(), props(field));
            }
            JSONSchemaProps {
                type_: Some("object".to_string()),
                properties: (!properties.is_empty()).then_some(properties),
                required: (!required.is_empty()).then_some(required),
                ..Default::default()
            }
        }
        Type::OpenObject(fields) => {
            let mut properties = BTreeMap::new();
            for (name, field) in fields {
                properties.insert(name.clone(), props(field));
            }
            JSONSchemaProps {
                type_: Some("object".to_string()),
                properties: (!properties.is_empty()).then_some(properties),
                x_kubernetes_preserve_unknown_fields: Some(true),
                ..Default::default()
            }
        }
        Type::Array(el) => JSONSchemaProps {
            type_: Some("array".to_string()),
            items: Some(JSONSchemaPropsOrArray::Schema(Box::new(to_openapi(el)))),
            ..Default::default()
        },
        Type::Map(_, value) => JSONSchemaProps {
            type_: Some("object".to_string()),
            additional_properties: Some(JSONSchemaPropsOrBool::Schema(Box::new(to_openapi(
                value,
            )))),
            ..Default::default()
        },
        Type::Any => JSONSchemaProps {
            x_kubernetes_preserve_unknown_fields: Some(true),
            ..Default::default()
        },
    };

    out.description = spec.description.clone();
    out.default = spec.default.clone().map(JSON);
    if !spec.enum_values.is_empty() {
        out.enum_ = Some(spec.enum_values.iter().cloned().map(JSON).collect());
    }
    out.minimum = spec.minimum;
    out.maximum = spec.maximum;
    out.pattern = spec.pattern.clone();
    out.min_length = spec.min_length;
    out.max_length = spec.max_length;
    if !spec.validations.is_empty() {
        out.x_kubernetes_validations = Some(spec.validations.iter().map(to_rule).collect());
    }

    out
}

fn scalar_name(s: Scalar) -> &'static str {
    match s {
        Scalar::String => "string",
        Scalar::Integer => "integer",
        Scalar::Number => "number",
        Scalar::Boolean => "boolean",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn openapi_shape() {
        let spec = obj(json!({
            "name": "string | required=true",
            "replicas": "integer | default=3 | minimum=1",
            "labels": "map[string]string",
            "hosts": "[string]",
        }));
        let ty = compile(&spec, &serde_json::Map::new()).unwrap();
        let schema = to_openapi(&ty);

        let rendered = serde_json::to_value(&schema).unwrap();
        assert_eq!(
            rendered,
            json!({
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": {"type": "string"},
                    "replicas": {"type": "integer", "default": 3, "minimum": 1.0},
                    "labels": {
                        "type": "object",
                        "additionalProperties": {"type": "string"},
                    },
                    "hosts": {
                        "type": "array",
                        "items": {"type": "string"},
                    },
                },
            })
        );
    }

    #[test]
    fn validations_attach() {
        let spec = obj(json!({"image": "string"}));
        let ty = compile(&spec, &serde_json::Map::new()).unwrap();
        let schema = to_openapi_with_validations(
            &ty,
            &[Validation {
                expression: "self.image != 'latest'".into(),
                message: "pin the image".into(),
            }],
        );
        let rules = schema.x_kubernetes_validations.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule, "self.image != 'latest'");
        assert_eq!(rules[0].message.as_deref(), Some("pin the image"));
    }
}

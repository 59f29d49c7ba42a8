//! The defaulting pass applied to instance specs before reconciliation.

use serde_json::Value;

use crate::{FieldSpec, Type};

/// Apply_defaults fills absent fields of `value` from the defaults declared in `ty`.
///
/// The pass is idempotent: applying it to an already-defaulted value changes nothing.
pub fn apply_defaults(ty: &Type, value: &mut Value) {
    let Type::Object(fields) = ty else { return };
    let Value::Object(map) = value else { return };
    for (name, field) in fields {
        match map.get_mut(name) {
            Some(present) => apply_defaults(&field.ty, present),
            None => {
                if let Some(v) = defaults_for(field) {
                    map.insert(name.clone(), v);
                }
            }
        }
    }
}

/// Defaults_for materializes the default value of a single field, if it has one.
///
/// An object field without its own `default=` still yields a value when any nested field
/// defaults, so `{ingress: {enabled: bool | default=false}}` defaults to
/// `{ingress: {enabled: false}}`.
pub fn defaults_for(field: &FieldSpec) -> Option<Value> {
    if let Some(v) = &field.default {
        return Some(v.clone());
    }
    if let Type::Object(fields) = &field.ty {
        let mut map = serde_json::Map::new();
        for (name, sub) in fields {
            if let Some(v) = defaults_for(sub) {
                map.insert(name.clone(), v);
            }
        }
        if !map.is_empty() {
            return Some(Value::Object(map));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;
    use serde_json::json;

    fn ty(spec: serde_json::Value) -> Type {
        let serde_json::Value::Object(map) = spec else { panic!("not an object") };
        compile(&map, &serde_json::Map::new()).unwrap()
    }

    #[test]
    fn fills_missing_fields() {
        let ty = ty(json!({
            "name": "string | required=true",
            "image": "string | default=nginx",
            "replicas": "integer | default=3",
            "ingress": {"enabled": "boolean | default=false"},
        }));
        let mut value = json!({"name": "web"});
        apply_defaults(&ty, &mut value);
        assert_eq!(
            value,
            json!({
                "name": "web",
                "image": "nginx",
                "replicas": 3,
                "ingress": {"enabled": false},
            })
        );
    }

    #[test]
    fn does_not_clobber_present_fields() {
        let ty = ty(json!({
            "image": "string | default=nginx",
            "ingress": {"enabled": "boolean | default=false"},
        }));
        let mut value = json!({"image": "httpd", "ingress": {"enabled": true}});
        apply_defaults(&ty, &mut value);
        assert_eq!(value, json!({"image": "httpd", "ingress": {"enabled": true}}));
    }

    #[test]
    fn idempotent() {
        let ty = ty(json!({"replicas": "integer | default=3"}));
        let mut once = json!({});
        apply_defaults(&ty, &mut once);
        let mut twice = once.clone();
        apply_defaults(&ty, &mut twice);
        assert_eq!(once, twice);
    }
}

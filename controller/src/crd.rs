//! Crd synthesizes a CustomResourceDefinition from a compiled definition plan.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion, CustomResourceSubresources,
    CustomResourceValidation, JSONSchemaProps,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use api::v1alpha1::ResourceGraphDefinition;

use crate::{OWNED_BY_LABEL, registry::Plan};

/// Plural_of derives the resource plural the way the API machinery conventions do for the
/// common cases.
pub fn plural_of(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem.ends_with(|c: char| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u')) {
            format!("{lower}s")
        } else {
            format!("{stem}ies")
        }
    } else {
        format!("{lower}s")
    }
}

/// Synthesize builds the CRD for a plan, owned by the definition that produced it.
pub fn synthesize(rgd: &ResourceGraphDefinition, plan: &Plan) -> CustomResourceDefinition {
    use kube::ResourceExt;

    let schema = &rgd.spec.schema;
    let plural = plural_of(&plan.gvk.kind);
    let name = format!("{plural}.{}", plan.gvk.group);

    let mut columns: Vec<CustomResourceColumnDefinition> =
        schema.additional_printer_columns.clone();
    if !columns.iter().any(|c| c.name == "State") {
        columns.push(CustomResourceColumnDefinition {
            name: "State".into(),
            type_: "string".into(),
            json_path: ".status.state".into(),
            ..Default::default()
        });
    }

    let validations: Vec<kro_schema::Validation> = schema
        .validation
        .iter()
        .map(|v| kro_schema::Validation {
            expression: v.expression.clone(),
            message: v.message.clone(),
        })
        .collect();
    let spec_schema = kro_schema::to_openapi_with_validations(&plan.spec_type, &validations);
    let status_schema = status_schema(&plan.analysis.status_type);

    let mut properties = BTreeMap::new();
    properties.insert("spec".to_string(), spec_schema);
    properties.insert("status".to_string(), status_schema);
    let root = JSONSchemaProps {
        type_: Some("object".to_string()),
        description: Some(format!(
            "{} is synthesized from the {:?} ResourceGraphDefinition.",
            plan.gvk.kind,
            rgd.name_any(),
        )),
        properties: Some(properties),
        ..Default::default()
    };

    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(BTreeMap::from([(
                OWNED_BY_LABEL.clone(),
                rgd.name_any(),
            )])),
            owner_references: rgd.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: plan.gvk.group.clone(),
            names: CustomResourceDefinitionNames {
                categories: Some(vec!["kro".into()]),
                kind: plan.gvk.kind.clone(),
                list_kind: Some(format!("{}List", plan.gvk.kind)),
                plural,
                singular: Some(plan.gvk.kind.to_ascii_lowercase()),
                ..Default::default()
            },
            scope: "Namespaced".into(),
            versions: vec![CustomResourceDefinitionVersion {
                name: plan.gvk.version.clone(),
                served: true,
                storage: true,
                additional_printer_columns: Some(columns),
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(root),
                }),
                subresources: Some(CustomResourceSubresources {
                    status: Some(Default::default()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}

/// The status schema is the inferred projection shape plus the machinery kro always writes.
fn status_schema(status_type: &kro_schema::Type) -> JSONSchemaProps {
    let mut out = kro_schema::to_openapi(status_type);
    let properties = out.properties.get_or_insert_default();
    properties.insert(
        "state".to_string(),
        JSONSchemaProps {
            type_: Some("string".to_string()),
            ..Default::default()
        },
    );
    properties.insert(
        "observedGeneration".to_string(),
        JSONSchemaProps {
            type_: Some("integer".to_string()),
            format: Some("int64".to_string()),
            ..Default::default()
        },
    );
    properties.insert(
        "conditions".to_string(),
        JSONSchemaProps {
            type_: Some("array".to_string()),
            items: Some(
                k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaPropsOrArray::Schema(
                    Box::new(JSONSchemaProps {
                        type_: Some("object".to_string()),
                        x_kubernetes_preserve_unknown_fields: Some(true),
                        ..Default::default()
                    }),
                ),
            ),
            ..Default::default()
        },
    );
    properties.insert(
        "resources".to_string(),
        JSONSchemaProps {
            type_: Some("array".to_string()),
            items: Some(
                k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaPropsOrArray::Schema(
                    Box::new(JSONSchemaProps {
                        type_: Some("object".to_string()),
                        x_kubernetes_preserve_unknown_fields: Some(true),
                        ..Default::default()
                    }),
                ),
            ),
            ..Default::default()
        },
    );
    // Projection is best-effort per field, so the subresource stays open.
    out.x_kubernetes_preserve_unknown_fields = Some(true);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn plurals() {
        assert_eq!(plural_of("WebApplication"), "webapplications");
        assert_eq!(plural_of("Ingress"), "ingresses");
        assert_eq!(plural_of("Policy"), "policies");
        assert_eq!(plural_of("Gateway"), "gateways");
    }

    #[test]
    fn synthesized_crd_shape() {
        let rgd = testing::rgd::web_application();
        let plan = testing::plan_for(&rgd);
        let crd = synthesize(&rgd, &plan);

        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("webapplications.kro.run")
        );
        assert_eq!(
            crd.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(OWNED_BY_LABEL.as_str()))
                .map(String::as_str),
            Some("web-application")
        );
        assert_eq!(crd.spec.group, "kro.run");
        assert_eq!(crd.spec.scope, "Namespaced");

        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(version.served && version.storage);
        assert!(
            version
                .subresources
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .is_some(),
            "status subresource is always enabled"
        );
        let columns = version.additional_printer_columns.as_ref().unwrap();
        assert!(columns.iter().any(|c| c.name == "State"));

        let root = version
            .schema
            .as_ref()
            .and_then(|s| s.open_api_v3_schema.as_ref())
            .unwrap();
        let spec_props = &root.properties.as_ref().unwrap()["spec"];
        assert!(spec_props.properties.as_ref().unwrap().contains_key("replicas"));
        let status_props = &root.properties.as_ref().unwrap()["status"];
        assert!(
            status_props
                .properties
                .as_ref()
                .unwrap()
                .contains_key("availableReplicas")
        );
        assert!(status_props.properties.as_ref().unwrap().contains_key("state"));
    }
}

//! Module `v1alpha1` implements the v1alpha1 kro CRD API.
use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceColumnDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta;
use kube::{CustomResource, KubeSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// VERSION is the kubernetes API group's version.
pub static VERSION: &str = "v1alpha1";

/// ID_PATTERN is the pattern every resource id must match.
pub static ID_PATTERN: &str = "^[a-z][a-zA-Z0-9]*$";

/// ResourceGraphDefinitionSpec describes the desired state of a ResourceGraphDefinition.
///
/// The schema section declares the user-facing API that will be synthesized into a CRD; the
/// resources section is the graph of templated objects reconciled for every instance of that
/// API.
#[derive(KubeSchema, Clone, CustomResource, Debug, Default, Deserialize, PartialEq, Serialize)]
#[kube(
    group = "kro.run",
    version = "v1alpha1",
    kind = "ResourceGraphDefinition",
    status = "ResourceGraphDefinitionStatus",
    shortname = "rgd",
    category = "kro",
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionSpec {
    /// Schema declares the synthesized API: kind, version, and the SimpleSchema trees for the
    /// spec and status of instances.
    pub schema: SchemaDefinition,
    /// Resources is the graph of objects managed for each instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceDefinition>,
    /// Default_service_accounts maps an instance namespace to the ServiceAccount the controller
    /// impersonates when reconciling instances in that namespace. The key `"*"` is the
    /// fallback for namespaces not listed.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default_service_accounts: BTreeMap<String, String>,
}

/// SchemaDefinition is the SimpleSchema description of a synthesized API.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, KubeSchema)]
#[serde(rename_all = "camelCase")]
#[x_kube(validation = (
    "self.kind == oldSelf.kind && self.apiVersion == oldSelf.apiVersion && self.group == oldSelf.group",
    r#""kind", "apiVersion" and "group" are immutable"#
))]
pub struct SchemaDefinition {
    /// Kind of the synthesized API.
    #[schemars(length(max = 63, min = 1), regex(pattern = r#"^[A-Z][a-zA-Z0-9]*$"#))]
    pub kind: String,
    /// Api_version of the synthesized API, e.g. `v1alpha1`.
    #[schemars(length(max = 63, min = 1))]
    pub api_version: String,
    /// Group of the synthesized API.
    #[serde(default = "default_group")]
    pub group: String,
    /// Spec is the SimpleSchema tree for the instance spec.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    #[schemars(schema_with = "schema::arbitrary_object")]
    pub spec: serde_json::Map<String, Value>,
    /// Status is the SimpleSchema tree for the instance status. Every leaf is an expression.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    #[schemars(schema_with = "schema::arbitrary_object")]
    pub status: serde_json::Map<String, Value>,
    /// Types holds named type declarations usable from the spec tree.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    #[schemars(schema_with = "schema::arbitrary_object")]
    pub types: serde_json::Map<String, Value>,
    /// Validation is a set of expression-level rules applied to the whole instance spec.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<SchemaValidation>,
    /// Additional_printer_columns are passed through to the synthesized CRD.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "schema::printer_columns")]
    pub additional_printer_columns: Vec<CustomResourceColumnDefinition>,
}

fn default_group() -> String {
    super::GROUP.to_string()
}

/// SchemaValidation is one CEL rule with its user-facing failure message.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, KubeSchema)]
#[serde(rename_all = "camelCase")]
#[x_kube(validation = ("self.expression != ''", r#""expression" must be populated"#))]
pub struct SchemaValidation {
    /// The expression, evaluated with `self` bound to the instance spec.
    pub expression: String,
    /// Message reported when the expression evaluates to false.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// ResourceDefinition is one node of the resource graph.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, KubeSchema)]
#[serde(rename_all = "camelCase")]
#[x_kube(validation = (
    "has(self.template) != has(self.externalRef)",
    r#"exactly one of "template" or "externalRef" must be provided"#
))]
pub struct ResourceDefinition {
    /// Id names this node; other nodes reference it by this name in expressions.
    #[schemars(regex(pattern = r#"^[a-z][a-zA-Z0-9]*$"#))]
    pub id: String,
    /// Template is a partially-rendered Kubernetes manifest with expression placeholders.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "schema::optional_arbitrary_object")]
    pub template: Option<serde_json::Map<String, Value>>,
    /// External_ref points to a pre-existing object that is read, never written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,
    /// Ready_when expressions must all hold for the node to count as Ready.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_when: Vec<String>,
    /// Include_when expressions gate whether the node is materialized at all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_when: Vec<String>,
}

impl ResourceDefinition {
    /// Kind_of reports the manifest kind of this node, if it can be determined statically.
    pub fn kind_of(&self) -> Option<&str> {
        if let Some(r) = &self.external_ref {
            return Some(&r.kind);
        }
        self.template
            .as_ref()
            .and_then(|t| t.get("kind"))
            .and_then(Value::as_str)
    }
}

/// ExternalRef identifies an object outside the graph by GVK, name and optional namespace.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, KubeSchema)]
#[serde(rename_all = "camelCase")]
#[x_kube(validation = (
    "self.apiVersion != '' && self.kind != '' && self.name != ''",
    r#""apiVersion", "kind" and "name" must be populated"#
))]
pub struct ExternalRef {
    /// Api_version of the referent.
    pub api_version: String,
    /// Kind of the referent.
    pub kind: String,
    /// Name of the referent.
    pub name: String,
    /// Namespace of the referent; defaults to the instance namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// ResourceGraphDefinitionStatus describes the observed state of a ResourceGraphDefinition.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionStatus {
    /// State reports whether the graph is registered and serving instances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<GraphState>,
    /// Topological_order is the order nodes are applied in; deletion runs it in reverse.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topological_order: Vec<String>,
    /// Resources reports the dependency set computed for each node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceInformation>,
    /// Conditions reports k8s-style conditions for the analysis and registration machinery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "schema::conditions")]
    pub conditions: Vec<meta::v1::Condition>,
}

impl ResourceGraphDefinitionStatus {
    /// Add_condition adds a Condition, ensuring the list is deduplicated.
    pub fn add_condition(&mut self, cnd: meta::v1::Condition) {
        let mut found = false;
        let mut out: Vec<meta::v1::Condition> = self
            .conditions
            .iter()
            .map(|c| {
                if c.type_ == cnd.type_ {
                    found = true;
                    &cnd
                } else {
                    c
                }
            })
            .cloned()
            .collect();
        if !found {
            out.push(cnd);
        }
        out.sort_unstable_by_key(|c| c.type_.clone());
        self.conditions = out;
    }
}

/// GraphState is the lifecycle state of a ResourceGraphDefinition.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, JsonSchema, strum::Display,
)]
pub enum GraphState {
    /// Active means the CRD is registered and a dynamic controller is running.
    Active,
    /// Inactive means the definition failed validation, analysis or registration.
    #[default]
    Inactive,
}

/// ResourceInformation reports the per-node dependency set.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInformation {
    /// Id of the node.
    pub id: String,
    /// Dependencies is the set of node ids this node reads from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl std::fmt::Display for ResourceGraphDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "ResourceGraphDefinition({})",
            self.metadata.uid.as_deref().unwrap_or("<>"),
        ))
    }
}

mod schema {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceColumnDefinition;
    use k8s_openapi::apimachinery::pkg::apis::meta;
    use schemars::{Schema, generate::SchemaGenerator, json_schema};
    use serde_json::json;

    pub fn conditions(generator: &mut SchemaGenerator) -> Schema {
        let mut schema = generator.subschema_for::<Vec<meta::v1::Condition>>();

        schema
            .ensure_object()
            .entry("x-kubernetes-list-type")
            .or_insert_with(|| json!("map"));
        schema
            .ensure_object()
            .entry("x-kubernetes-list-map-keys")
            .or_insert_with(|| json!(["type"]));

        schema
    }

    pub fn arbitrary_object(_generator: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true,
        })
    }

    pub fn optional_arbitrary_object(generator: &mut SchemaGenerator) -> Schema {
        arbitrary_object(generator)
    }

    pub fn printer_columns(generator: &mut SchemaGenerator) -> Schema {
        generator.subschema_for::<Vec<CustomResourceColumnDefinition>>()
    }
}

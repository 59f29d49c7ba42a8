//! Resolution of Kubernetes resource types for cross-resource type-checking.

use std::collections::BTreeMap;

use kro_schema::{FieldSpec, Scalar, Type};
use kube::core::GroupVersionKind;

use crate::Result;

/// SchemaResolver reports the type a resource of some GVK emits into the expression
/// environment.
///
/// The controller substitutes a discovery-backed implementation; analysis itself only needs
/// *some* typing for each referent.
pub trait SchemaResolver {
    /// Resolve the emitted type for `gvk`.
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<Type>;
}

/// SkeletonResolver types the parts shared by every Kubernetes object (`apiVersion`, `kind`,
/// the well-known members of `metadata`) and leaves the remainder open.
///
/// Member access into the open remainder types as `Any`, so expressions over `spec`/`status`
/// check loosely without the cluster's own OpenAPI documents.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkeletonResolver;

impl SchemaResolver for SkeletonResolver {
    fn resolve(&self, _gvk: &GroupVersionKind) -> Result<Type> {
        Ok(skeleton())
    }
}

fn string() -> FieldSpec {
    FieldSpec::plain(Type::Scalar(Scalar::String))
}

fn string_map() -> FieldSpec {
    FieldSpec::plain(Type::Map(
        Box::new(Type::Scalar(Scalar::String)),
        Box::new(Type::Scalar(Scalar::String)),
    ))
}

/// Skeleton is the common shape of every Kubernetes object.
pub fn skeleton() -> Type {
    let mut metadata = BTreeMap::new();
    metadata.insert("name".to_string(), string());
    metadata.insert("generateName".to_string(), string());
    metadata.insert("namespace".to_string(), string());
    metadata.insert("uid".to_string(), string());
    metadata.insert("resourceVersion".to_string(), string());
    metadata.insert(
        "generation".to_string(),
        FieldSpec::plain(Type::Scalar(Scalar::Integer)),
    );
    metadata.insert("creationTimestamp".to_string(), string());
    metadata.insert("deletionTimestamp".to_string(), string());
    metadata.insert("labels".to_string(), string_map());
    metadata.insert("annotations".to_string(), string_map());
    metadata.insert(
        "finalizers".to_string(),
        FieldSpec::plain(Type::Array(Box::new(Type::Scalar(Scalar::String)))),
    );
    metadata.insert(
        "ownerReferences".to_string(),
        FieldSpec::plain(Type::Array(Box::new(Type::Any))),
    );

    let mut fields = BTreeMap::new();
    fields.insert("apiVersion".to_string(), string());
    fields.insert("kind".to_string(), string());
    fields.insert(
        "metadata".to_string(),
        FieldSpec::plain(Type::OpenObject(metadata)),
    );
    Type::OpenObject(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skeleton_is_open_where_it_matters() {
        let ty = skeleton();
        assert_eq!(
            ty.field("metadata").and_then(|m| m.field("name")),
            Some(&Type::Scalar(Scalar::String))
        );
        // Unknown top-level members stay unconstrained.
        assert_eq!(ty.field("status"), Some(&Type::Any));
        assert_eq!(
            ty.field("status").and_then(|s| s.field("availableReplicas")),
            Some(&Type::Any)
        );
    }
}

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Kro_graph analyzes the resource templates of a ResourceGraphDefinition.
//!
//! Analysis walks every template, compiles the embedded expressions, type-checks each
//! reference against the typing environment, derives the dependency graph, rejects cycles,
//! and fixes a deterministic topological order. The result is cached on the definition and
//! drives every instance reconcile until the resources change.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use petgraph::graphmap::DiGraphMap;
use serde_json::Value;
use tracing::debug;

use api::v1alpha1::{ExternalRef, ResourceDefinition};
use kro_expr::{Expression, Fragment, TypeEnv, check_fragments};
use kro_schema::{FieldSpec, StatusField, Type};
use kube::core::{GroupVersion, GroupVersionKind};

mod resolver;
pub use resolver::{SchemaResolver, SkeletonResolver, skeleton};

/// SCHEMA_ROOT is the reserved top-level name bound to the instance spec.
pub const SCHEMA_ROOT: &str = "schema";

/// Error is everything analysis can reject.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// BadId indicates a resource id that does not match `[a-z][a-zA-Z0-9]*` or collides
    /// with a reserved name.
    #[error("invalid resource id {0:?}")]
    BadId(String),
    /// DuplicateId indicates two resources sharing an id.
    #[error("duplicate resource id {0:?}")]
    DuplicateId(String),
    /// BadPayload indicates a resource without exactly one of template/externalRef.
    #[error("resource {0:?} must have exactly one of template or externalRef")]
    BadPayload(String),
    /// BadTemplate indicates a template without a usable apiVersion/kind.
    #[error("template for {0:?}: {1}")]
    BadTemplate(String, String),
    /// UnknownResource indicates a reference to a root that is neither `schema` nor a node.
    #[error("unknown resource {root:?} referenced from {at}")]
    UnknownResource {
        /// The unresolvable root name.
        root: String,
        /// Where the reference appears.
        at: String,
    },
    /// Cycle indicates a dependency cycle, named smallest-first.
    #[error("cycle {0}")]
    Cycle(String),
    /// Expression wraps a parse or type failure with its location.
    #[error("in {at}: {source}")]
    Expression {
        /// Where the expression appears.
        at: String,
        /// The underlying failure.
        #[source]
        source: kro_expr::Error,
    },
    /// BadStatus indicates a status leaf that is not a single whole-string expression.
    #[error("status field {0} must be a single ${{...}} expression")]
    BadStatus(String),
    /// Schema propagates SimpleSchema failures from status shaping.
    #[error("schema error: {0}")]
    Schema(#[from] kro_schema::Error),
}

/// Result typedef for analysis.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// NodeKind discriminates managed templates from read-only external references.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// A managed manifest, applied with the instance as owner.
    Template,
    /// A pre-existing object, read and never written.
    ExternalRef,
}

/// PathSegment locates a value inside a template tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PathSegment {
    /// An object member.
    Key(String),
    /// An array element.
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, ".{k}"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

fn path_display(id: &str, path: &[PathSegment]) -> String {
    let mut out = id.to_string();
    for seg in path {
        out.push_str(&seg.to_string());
    }
    out
}

/// ExpressionSite is one fully-validated template location containing placeholders.
#[derive(Debug)]
pub struct ExpressionSite {
    /// Where in the template the string lives.
    pub path: Vec<PathSegment>,
    /// The scanned fragments, ready for evaluation.
    pub fragments: Vec<Fragment>,
    /// The statically-inferred result type.
    pub expected: Type,
}

/// NodeAnalysis is everything the reconciler needs to know about one node.
#[derive(Debug)]
pub struct NodeAnalysis {
    /// The node id.
    pub id: String,
    /// Template or ExternalRef.
    pub kind: NodeKind,
    /// The GVK the node materializes or reads.
    pub gvk: GroupVersionKind,
    /// The external reference, for [`NodeKind::ExternalRef`] nodes.
    pub external: Option<ExternalRef>,
    /// The raw template tree, for [`NodeKind::Template`] nodes.
    pub template: Option<serde_json::Map<String, Value>>,
    /// Ids of the other nodes this node reads from.
    pub dependencies: BTreeSet<String>,
    /// Validated expression sites inside the template.
    pub sites: Vec<ExpressionSite>,
    /// Compiled readiness predicates.
    pub ready_when: Vec<Expression>,
    /// Compiled inclusion predicates.
    pub include_when: Vec<Expression>,
    /// The type this node binds into the environment once materialized.
    pub emitted: Type,
}

/// StatusSite is one declared status field with its compiled expression.
#[derive(Debug)]
pub struct StatusSite {
    /// Path of the field below `.status`.
    pub path: Vec<String>,
    /// The compiled expression.
    pub expression: Expression,
    /// The inferred field type.
    pub ty: Type,
}

/// Analysis is the cached output of a successful run.
#[derive(Debug)]
pub struct Analysis {
    /// The deterministic topological order over node ids.
    pub order: Vec<String>,
    /// Per-node analysis, keyed by id.
    pub nodes: BTreeMap<String, NodeAnalysis>,
    /// The typing environment (schema plus every node's emitted type).
    pub env: TypeEnv,
    /// Compiled status projection sites.
    pub status: Vec<StatusSite>,
    /// The inferred shape of the instance status, for CRD embedding.
    pub status_type: Type,
}

/// Analyze validates the resource set and computes the dependency graph.
pub fn analyze(
    resources: &[ResourceDefinition],
    spec_type: &Type,
    status_tree: &serde_json::Map<String, Value>,
    resolver: &dyn SchemaResolver,
) -> Result<Analysis> {
    let mut nodes: BTreeMap<String, NodeAnalysis> = BTreeMap::new();
    for r in resources {
        validate_id(&r.id)?;
        if nodes.contains_key(&r.id) {
            return Err(Error::DuplicateId(r.id.clone()));
        }
        let node = match (&r.template, &r.external_ref) {
            (Some(t), None) => {
                let gvk = template_gvk(&r.id, t)?;
                NodeAnalysis {
                    id: r.id.clone(),
                    kind: NodeKind::Template,
                    emitted: resolver.resolve(&gvk)?,
                    gvk,
                    external: None,
                    template: Some(t.clone()),
                    dependencies: BTreeSet::new(),
                    sites: Vec::new(),
                    ready_when: Vec::new(),
                    include_when: Vec::new(),
                }
            }
            (None, Some(e)) => {
                let gvk = external_gvk(&r.id, e)?;
                NodeAnalysis {
                    id: r.id.clone(),
                    kind: NodeKind::ExternalRef,
                    emitted: resolver.resolve(&gvk)?,
                    gvk,
                    external: Some(e.clone()),
                    template: None,
                    dependencies: BTreeSet::new(),
                    sites: Vec::new(),
                    ready_when: Vec::new(),
                    include_when: Vec::new(),
                }
            }
            _ => return Err(Error::BadPayload(r.id.clone())),
        };
        nodes.insert(r.id.clone(), node);
    }

    let mut env = TypeEnv::new();
    env.bind(SCHEMA_ROOT, spec_type.clone());
    for (id, node) in &nodes {
        env.bind(id, node.emitted.clone());
    }

    for r in resources {
        let Some(node) = nodes.get_mut(&r.id) else { continue };
        if let Some(template) = &r.template {
            let mut path = Vec::new();
            collect_sites(&r.id, template, &mut path, &env, &mut node.sites, &mut node.dependencies)?;
        }
        for (list, exprs) in [("readyWhen", &r.ready_when), ("includeWhen", &r.include_when)] {
            for (i, src) in exprs.iter().enumerate() {
                let at = format!("{}.{list}[{i}]", r.id);
                let expr = parse_at(&at, src)?;
                check_references(&r.id, &at, &expr, &env, true, &mut node.dependencies)?;
                let ty = expr
                    .check(&env)
                    .map_err(|source| Error::Expression { at: at.clone(), source })?;
                if !matches!(ty, Type::Scalar(kro_schema::Scalar::Boolean) | Type::Any) {
                    return Err(Error::Expression {
                        at,
                        source: kro_expr::Error::Type(format!("expected boolean, found {ty}")),
                    });
                }
                if list == "readyWhen" {
                    node.ready_when.push(expr);
                } else {
                    node.include_when.push(expr);
                }
            }
        }
    }

    detect_cycles(&nodes)?;
    let order = topo_order(&nodes);
    debug!(?order, "computed topological order");

    let status = status_sites(status_tree, &nodes, &env)?;
    let status_type = status_type_of(&status);

    Ok(Analysis {
        order,
        nodes,
        env,
        status,
        status_type,
    })
}

fn validate_id(id: &str) -> Result<()> {
    let mut chars = id.chars();
    let head_ok = chars.next().map(|c| c.is_ascii_lowercase()).unwrap_or(false);
    if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric()) || id == SCHEMA_ROOT {
        return Err(Error::BadId(id.to_string()));
    }
    Ok(())
}

fn template_gvk(id: &str, template: &serde_json::Map<String, Value>) -> Result<GroupVersionKind> {
    let field = |name: &str| -> Result<&str> {
        let v = template
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadTemplate(id.to_string(), format!("missing {name:?}")))?;
        if kro_expr::has_placeholders(v) {
            return Err(Error::BadTemplate(
                id.to_string(),
                format!("{name:?} must not be templated"),
            ));
        }
        Ok(v)
    };
    let api_version = field("apiVersion")?;
    let kind = field("kind")?;
    let gv: GroupVersion = api_version
        .parse()
        .map_err(|_| Error::BadTemplate(id.to_string(), format!("bad apiVersion {api_version:?}")))?;
    Ok(gv.with_kind(kind))
}

fn external_gvk(id: &str, external: &ExternalRef) -> Result<GroupVersionKind> {
    let gv: GroupVersion = external.api_version.parse().map_err(|_| {
        Error::BadTemplate(
            id.to_string(),
            format!("bad apiVersion {:?}", external.api_version),
        )
    })?;
    Ok(gv.with_kind(&external.kind))
}

/// Consume a fragment list that is exactly one whole-string expression.
fn into_whole(fragments: Vec<Fragment>) -> Option<Expression> {
    let mut it = fragments.into_iter();
    match (it.next(), it.next()) {
        (Some(Fragment::Expr(e)), None) => Some(e),
        _ => None,
    }
}

fn parse_at(at: &str, src: &str) -> Result<Expression> {
    let fragments = kro_expr::scan(src).map_err(|source| Error::Expression {
        at: at.to_string(),
        source,
    })?;
    if let Some(e) = into_whole(fragments) {
        return Ok(e);
    }
    // A bare expression without the ${} wrapper is accepted in predicate lists.
    Expression::parse(src).map_err(|source| Error::Expression {
        at: at.to_string(),
        source,
    })
}

fn collect_sites(
    id: &str,
    template: &serde_json::Map<String, Value>,
    path: &mut Vec<PathSegment>,
    env: &TypeEnv,
    sites: &mut Vec<ExpressionSite>,
    dependencies: &mut BTreeSet<String>,
) -> Result<()> {
    for (key, value) in template {
        path.push(PathSegment::Key(key.clone()));
        collect_value(id, value, path, env, sites, dependencies)?;
        path.pop();
    }
    Ok(())
}

fn collect_value(
    id: &str,
    value: &Value,
    path: &mut Vec<PathSegment>,
    env: &TypeEnv,
    sites: &mut Vec<ExpressionSite>,
    dependencies: &mut BTreeSet<String>,
) -> Result<()> {
    match value {
        Value::Object(map) => collect_sites(id, map, path, env, sites, dependencies)?,
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                path.push(PathSegment::Index(i));
                collect_value(id, item, path, env, sites, dependencies)?;
                path.pop();
            }
        }
        Value::String(s) if kro_expr::has_placeholders(s) => {
            let at = path_display(id, path);
            let fragments = kro_expr::scan(s).map_err(|source| Error::Expression {
                at: at.clone(),
                source,
            })?;
            for fragment in &fragments {
                if let Fragment::Expr(e) = fragment {
                    check_references(id, &at, e, env, false, dependencies)?;
                }
            }
            let expected = check_fragments(&fragments, env)
                .map_err(|source| Error::Expression { at, source })?;
            sites.push(ExpressionSite {
                path: path.clone(),
                fragments,
                expected,
            });
        }
        _ => {}
    }
    Ok(())
}

fn check_references(
    id: &str,
    at: &str,
    expr: &Expression,
    env: &TypeEnv,
    allow_self: bool,
    dependencies: &mut BTreeSet<String>,
) -> Result<()> {
    for reference in expr.references() {
        if reference.root == id {
            if !allow_self {
                return Err(Error::Cycle(format!("{id} -> {id}")));
            }
        } else if reference.root != SCHEMA_ROOT {
            if env.root(&reference.root).is_none() {
                return Err(Error::UnknownResource {
                    root: reference.root.clone(),
                    at: at.to_string(),
                });
            }
            dependencies.insert(reference.root.clone());
        }
        env.resolve(reference).map_err(|source| Error::Expression {
            at: at.to_string(),
            source,
        })?;
    }
    Ok(())
}

fn detect_cycles(nodes: &BTreeMap<String, NodeAnalysis>) -> Result<()> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for id in nodes.keys() {
        graph.add_node(id.as_str());
    }
    for (id, node) in nodes {
        for dep in &node.dependencies {
            graph.add_edge(dep.as_str(), id.as_str(), ());
        }
    }
    for scc in petgraph::algo::tarjan_scc(&graph) {
        if scc.len() > 1 {
            return Err(Error::Cycle(name_cycle(&graph, &scc)));
        }
    }
    Ok(())
}

/// Name the shortest cycle inside a strongly-connected component. Ties break toward the
/// smallest starting id, so re-analysis reports an identical cycle.
fn name_cycle(graph: &DiGraphMap<&str, ()>, scc: &[&str]) -> String {
    let members: BTreeSet<&str> = scc.iter().copied().collect();
    let mut best: Option<Vec<&str>> = None;
    for &start in &members {
        if let Some(cycle) = shortest_cycle_through(graph, &members, start) {
            if best.as_ref().map(|b| cycle.len() < b.len()).unwrap_or(true) {
                best = Some(cycle);
            }
        }
    }
    best.unwrap_or_default().join(" -> ")
}

/// BFS from `start` back to itself, restricted to the component. Pops happen in distance
/// order and neighbors expand in id order, so the first edge found back to `start` closes a
/// shortest cycle through it, deterministically.
fn shortest_cycle_through<'g>(
    graph: &DiGraphMap<&'g str, ()>,
    members: &BTreeSet<&'g str>,
    start: &'g str,
) -> Option<Vec<&'g str>> {
    let mut prev: BTreeMap<&str, &str> = BTreeMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(cur) = queue.pop_front() {
        let next_hops: BTreeSet<&str> = graph
            .neighbors(cur)
            .filter(|n| members.contains(n))
            .collect();
        for next in next_hops {
            if next == start {
                let mut tail = Vec::new();
                let mut hop = cur;
                while hop != start {
                    tail.push(hop);
                    match prev.get(hop) {
                        Some(p) => hop = p,
                        None => break,
                    }
                }
                tail.reverse();
                let mut path = vec![start];
                path.extend(tail);
                path.push(start);
                return Some(path);
            }
            if !prev.contains_key(next) {
                prev.insert(next, cur);
                queue.push_back(next);
            }
        }
    }
    None
}

/// A Kahn walk with the ready set iterated in lexicographic id order, so re-analysis of an
/// unchanged definition reports an identical order.
fn topo_order(nodes: &BTreeMap<String, NodeAnalysis>) -> Vec<String> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = nodes
        .iter()
        .map(|(id, n)| {
            (
                id.as_str(),
                n.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while !remaining.is_empty() {
        let Some(next) = remaining
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
        else {
            // Unreachable after cycle detection; bail rather than loop.
            break;
        };
        remaining.remove(next);
        for deps in remaining.values_mut() {
            deps.remove(next);
        }
        order.push(next.to_string());
    }
    order
}

fn status_sites(
    status_tree: &serde_json::Map<String, Value>,
    nodes: &BTreeMap<String, NodeAnalysis>,
    env: &TypeEnv,
) -> Result<Vec<StatusSite>> {
    let mut out = Vec::new();
    for StatusField { path, expression } in kro_schema::status_fields(status_tree)? {
        let at = format!("status.{}", path.join("."));
        let fragments = kro_expr::scan(&expression).map_err(|source| Error::Expression {
            at: at.clone(),
            source,
        })?;
        let Some(expr) = into_whole(fragments) else {
            return Err(Error::BadStatus(at));
        };
        for reference in expr.references() {
            if reference.root != SCHEMA_ROOT && !nodes.contains_key(&reference.root) {
                return Err(Error::UnknownResource {
                    root: reference.root.clone(),
                    at: at.clone(),
                });
            }
        }
        let ty = expr
            .check(env)
            .map_err(|source| Error::Expression { at: at.clone(), source })?;
        out.push(StatusSite {
            path,
            expression: expr,
            ty,
        });
    }
    Ok(out)
}

fn status_type_of(sites: &[StatusSite]) -> Type {
    fn insert(fields: &mut BTreeMap<String, FieldSpec>, path: &[String], ty: &Type) {
        match path {
            [] => {}
            [leaf] => {
                fields.insert(leaf.clone(), FieldSpec::plain(ty.clone()));
            }
            [head, rest @ ..] => {
                let entry = fields
                    .entry(head.clone())
                    .or_insert_with(|| FieldSpec::plain(Type::Object(BTreeMap::new())));
                if let Type::Object(sub) = &mut entry.ty {
                    insert(sub, rest, ty);
                }
            }
        }
    }
    let mut fields = BTreeMap::new();
    for site in sites {
        insert(&mut fields, &site.path, &site.ty);
    }
    Type::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resources(v: Value) -> Vec<ResourceDefinition> {
        serde_json::from_value(v).unwrap()
    }

    fn spec_type(v: Value) -> Type {
        let Value::Object(map) = v else { panic!("not an object") };
        kro_schema::compile(&map, &serde_json::Map::new()).unwrap()
    }

    fn web_resources() -> Vec<ResourceDefinition> {
        resources(json!([
            {
                "id": "service",
                "template": {
                    "apiVersion": "v1",
                    "kind": "Service",
                    "metadata": {"name": "${schema.name}"},
                    "spec": {"selector": {"app": "${deployment.metadata.name}"}},
                },
            },
            {
                "id": "deployment",
                "template": {
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": {"name": "${schema.name}"},
                    "spec": {
                        "replicas": "${schema.replicas}",
                        "template": {"spec": {"containers": [
                            {"name": "main", "image": "${schema.image}"},
                        ]}},
                    },
                },
            },
        ]))
    }

    fn web_spec() -> Type {
        spec_type(json!({
            "name": "string | required=true",
            "image": "string | default=nginx",
            "replicas": "integer | default=3",
        }))
    }

    #[test]
    fn linear_graph_orders_dependencies_first() {
        let analysis = analyze(
            &web_resources(),
            &web_spec(),
            &serde_json::Map::new(),
            &SkeletonResolver,
        )
        .unwrap();
        assert_eq!(analysis.order, vec!["deployment", "service"]);
        assert_eq!(
            analysis.nodes["service"].dependencies,
            BTreeSet::from(["deployment".to_string()])
        );
        assert!(analysis.nodes["deployment"].dependencies.is_empty());
        assert_eq!(analysis.nodes["deployment"].gvk.kind, "Deployment");
        assert_eq!(analysis.nodes["deployment"].sites.len(), 3);
    }

    #[test]
    fn order_breaks_ties_lexicographically() {
        let rs = resources(json!([
            {"id": "zebra", "template": {"apiVersion": "v1", "kind": "ConfigMap"}},
            {"id": "alpha", "template": {"apiVersion": "v1", "kind": "ConfigMap"}},
            {"id": "mid", "template": {"apiVersion": "v1", "kind": "ConfigMap"}},
        ]));
        let analysis = analyze(
            &rs,
            &spec_type(json!({})),
            &serde_json::Map::new(),
            &SkeletonResolver,
        )
        .unwrap();
        assert_eq!(analysis.order, vec!["alpha", "mid", "zebra"]);
    }

    #[test]
    fn self_reference_is_a_length_one_cycle() {
        let rs = resources(json!([{
            "id": "a",
            "template": {
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "${a.metadata.name}"},
            },
        }]));
        let err = analyze(
            &rs,
            &spec_type(json!({})),
            &serde_json::Map::new(),
            &SkeletonResolver,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cycle(c) if c == "a -> a"));
    }

    #[test]
    fn two_cycle_is_named() {
        let rs = resources(json!([
            {
                "id": "a",
                "template": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "${b.metadata.name}"},
                },
            },
            {
                "id": "b",
                "template": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "${a.metadata.name}"},
                },
            },
        ]));
        let err = analyze(
            &rs,
            &spec_type(json!({})),
            &serde_json::Map::new(),
            &SkeletonResolver,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cycle(c) if c == "a -> b -> a"));
    }

    #[test]
    fn shortest_cycle_wins_over_longer_ones() {
        // One component holding both a -> b -> z -> a and the shorter a -> c -> a; the
        // error must name the two-cycle. (An edge x -> y means y's template reads x.)
        let rs = resources(json!([
            {
                "id": "a",
                "template": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "${z.metadata.name}"},
                    "data": {"peer": "${c.metadata.name}"},
                },
            },
            {
                "id": "b",
                "template": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "${a.metadata.name}"},
                },
            },
            {
                "id": "z",
                "template": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "${b.metadata.name}"},
                },
            },
            {
                "id": "c",
                "template": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "${a.metadata.name}"},
                },
            },
        ]));
        let err = analyze(
            &rs,
            &spec_type(json!({})),
            &serde_json::Map::new(),
            &SkeletonResolver,
        )
        .unwrap_err();
        assert!(matches!(&err, Error::Cycle(c) if c == "a -> c -> a"), "got {err:?}");
    }

    #[test]
    fn unknown_reference_root() {
        let rs = resources(json!([{
            "id": "a",
            "template": {
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "${missing.metadata.name}"},
            },
        }]));
        let err = analyze(
            &rs,
            &spec_type(json!({})),
            &serde_json::Map::new(),
            &SkeletonResolver,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownResource { root, .. } if root == "missing"));
    }

    #[test]
    fn schema_reference_must_type_check() {
        let rs = resources(json!([{
            "id": "a",
            "template": {
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "${schema.nmae}"},
            },
        }]));
        let err = analyze(
            &rs,
            &spec_type(json!({"name": "string"})),
            &serde_json::Map::new(),
            &SkeletonResolver,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Expression { .. }), "got {err:?}");
    }

    #[test]
    fn predicates_add_edges_and_must_be_boolean() {
        let rs = resources(json!([
            {
                "id": "config",
                "template": {"apiVersion": "v1", "kind": "ConfigMap"},
            },
            {
                "id": "app",
                "template": {"apiVersion": "apps/v1", "kind": "Deployment"},
                "includeWhen": ["${config.metadata.name == 'on'}"],
                "readyWhen": ["${app.status.readyReplicas == schema.replicas}"],
            },
        ]));
        let analysis = analyze(
            &rs,
            &spec_type(json!({"replicas": "integer | default=1"})),
            &serde_json::Map::new(),
            &SkeletonResolver,
        )
        .unwrap();
        // includeWhen introduces the edge; the readyWhen self-reference does not.
        assert_eq!(
            analysis.nodes["app"].dependencies,
            BTreeSet::from(["config".to_string()])
        );
        assert_eq!(analysis.order, vec!["config", "app"]);

        let bad = resources(json!([{
            "id": "app",
            "template": {"apiVersion": "apps/v1", "kind": "Deployment"},
            "readyWhen": ["${schema.name}"],
        }]));
        let err = analyze(
            &bad,
            &spec_type(json!({"name": "string"})),
            &serde_json::Map::new(),
            &SkeletonResolver,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Expression { .. }));
    }

    #[test]
    fn external_refs_participate_in_ordering() {
        let rs = resources(json!([
            {
                "id": "project",
                "externalRef": {
                    "apiVersion": "core.example/v1",
                    "kind": "Project",
                    "name": "default-project",
                },
            },
            {
                "id": "ns",
                "template": {
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": {"name": "${project.spec.defaultNamespace}"},
                },
            },
        ]));
        let analysis = analyze(
            &rs,
            &spec_type(json!({})),
            &serde_json::Map::new(),
            &SkeletonResolver,
        )
        .unwrap();
        assert_eq!(analysis.order, vec!["project", "ns"]);
        assert_eq!(analysis.nodes["project"].kind, NodeKind::ExternalRef);
    }

    #[test]
    fn status_inference() {
        let rs = web_resources();
        let status = json!({
            "availableReplicas": "${deployment.status.availableReplicas}",
            "serviceName": "${service.metadata.name}",
        });
        let Value::Object(status) = status else { unreachable!() };
        let analysis = analyze(&rs, &web_spec(), &status, &SkeletonResolver).unwrap();
        assert_eq!(analysis.status.len(), 2);
        let by_path: BTreeMap<String, &Type> = analysis
            .status
            .iter()
            .map(|s| (s.path.join("."), &s.ty))
            .collect();
        assert_eq!(by_path["availableReplicas"], &Type::Any);
        assert_eq!(
            by_path["serviceName"],
            &Type::Scalar(kro_schema::Scalar::String)
        );
        assert_eq!(
            analysis.status_type.field("serviceName"),
            Some(&Type::Scalar(kro_schema::Scalar::String))
        );
    }

    #[test]
    fn status_must_be_whole_expressions() {
        let rs = web_resources();
        let status = json!({"name": "prefix-${service.metadata.name}"});
        let Value::Object(status) = status else { unreachable!() };
        let err = analyze(&rs, &web_spec(), &status, &SkeletonResolver).unwrap_err();
        assert!(matches!(err, Error::BadStatus(_)));
    }

    #[test]
    fn duplicate_and_invalid_ids() {
        let dup = resources(json!([
            {"id": "a", "template": {"apiVersion": "v1", "kind": "ConfigMap"}},
            {"id": "a", "template": {"apiVersion": "v1", "kind": "Secret"}},
        ]));
        assert!(matches!(
            analyze(&dup, &spec_type(json!({})), &serde_json::Map::new(), &SkeletonResolver),
            Err(Error::DuplicateId(_))
        ));

        let bad = resources(json!([
            {"id": "Bad", "template": {"apiVersion": "v1", "kind": "ConfigMap"}},
        ]));
        assert!(matches!(
            analyze(&bad, &spec_type(json!({})), &serde_json::Map::new(), &SkeletonResolver),
            Err(Error::BadId(_))
        ));
    }

    #[test]
    fn payload_must_be_exactly_one() {
        let none = resources(json!([{"id": "a"}]));
        assert!(matches!(
            analyze(&none, &spec_type(json!({})), &serde_json::Map::new(), &SkeletonResolver),
            Err(Error::BadPayload(_))
        ));
    }
}

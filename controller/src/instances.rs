//! Instances holds the dynamic controller reconciling instances of a synthesized API.
//!
//! One controller runs per Active definition. Each reconcile walks the cached topological
//! order: inclusion predicates gate nodes, templates render against the live environment and
//! are server-side applied with the instance as owner, external references are read and never
//! written, readiness predicates gate progress, and the declared status fields are projected
//! back onto the instance.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use kube::{
    Resource, ResourceExt,
    api::{Api, DeleteParams, DynamicObject, Patch},
    core::{ApiResource, GroupVersionKind},
    discovery::{ApiCapabilities, Scope, pinned_kind},
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller, Error as CtrlErr},
        finalizer::{Event as Finalizer, finalizer},
        watcher,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use kro_expr::Bindings;
use kro_graph::{NodeAnalysis, NodeKind, SCHEMA_ROOT};
use kro_schema::apply_defaults;

use crate::registry::{Plan, PlanSlot};
use crate::{
    APPLY_PARAMS, Error, INSTANCE_FINALIZER, INSTANCE_LABEL, NODE_ID_LABEL, PATCH_PARAMS, Result,
    Settings, accounts::Impersonator, metrics, now, render::render,
};

/// Deps is what a dynamic controller borrows from the process.
#[derive(Clone)]
pub struct Deps {
    /// The controller's own client.
    pub client: kube::Client,
    /// Process tunables.
    pub settings: Settings,
    /// Impersonated client factory.
    pub accounts: Arc<Impersonator>,
}

struct DynamicCtx {
    client: kube::Client,
    settings: Settings,
    accounts: Arc<Impersonator>,
    plan: PlanSlot,
    retries: Mutex<HashMap<String, u32>>,
    discovery: Mutex<HashMap<String, (ApiResource, ApiCapabilities)>>,
}

impl DynamicCtx {
    fn plan(&self) -> Arc<Plan> {
        self.plan.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn bump_retries(&self, key: &str) -> u32 {
        let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        let n = retries.entry(key.to_string()).or_insert(0);
        *n = n.saturating_add(1);
        *n
    }

    fn clear_retries(&self, key: &str) {
        let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        retries.remove(key);
    }

    /// Resolve the ApiResource and scope for a GVK, caching discovery results.
    async fn api_for(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities)> {
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        {
            let discovery = self.discovery.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = discovery.get(&key) {
                return Ok(hit.clone());
            }
        }
        let found = pinned_kind(&self.client, gvk).await?;
        let mut discovery = self.discovery.lock().unwrap_or_else(|e| e.into_inner());
        discovery.insert(key, found.clone());
        Ok(found)
    }
}

fn backoff(n: u32) -> Duration {
    Duration::from_secs(1u64 << n.min(8))
}

/// Run is the dynamic controller main loop; the registry spawns one per Active definition.
pub async fn run(deps: Deps, plan: PlanSlot, cancel: CancellationToken) {
    let settings = deps.settings.clone();
    let ctx = Arc::new(DynamicCtx {
        client: deps.client.clone(),
        settings: settings.clone(),
        accounts: deps.accounts,
        plan,
        retries: Mutex::new(HashMap::new()),
        discovery: Mutex::new(HashMap::new()),
    });
    let (api_resource, gvk) = {
        let plan = ctx.plan();
        (plan.api_resource.clone(), plan.gvk.clone())
    };

    let api: Api<DynamicObject> = Api::all_with(deps.client, &api_resource);
    let resync = IntervalStream::new(tokio::time::interval(settings.resync_period)).map(|_| ());
    let ctl = Controller::new_with(api, watcher::Config::default(), api_resource)
        .with_config(
            ControllerConfig::default().concurrency(settings.dynamic_concurrent_reconciles),
        )
        .reconcile_all_on(resync)
        .graceful_shutdown_on(cancel.cancelled_owned());

    info!(?gvk, "starting instance controller");
    ctl.run(reconcile, error_policy, ctx)
        .for_each(|ret| {
            if let Err(err) = ret {
                match err {
                    CtrlErr::ObjectNotFound(objref) => error!(%objref, "object not found"),
                    CtrlErr::ReconcilerFailed(error, objref) => {
                        error!(%objref, %error, "reconcile error")
                    }
                    CtrlErr::QueueError(error) => error!(%error, "queue error"),
                    CtrlErr::RunnerError(error) => error!(%error, "runner error"),
                };
            }
            futures::future::ready(())
        })
        .await;
    debug!(?gvk, "instance controller finished");
}

fn error_policy(obj: Arc<DynamicObject>, err: &Error, ctx: Arc<DynamicCtx>) -> Action {
    metrics::failure("instance");
    let key = retry_key(&obj);
    error!(
        error = err.to_string(),
        instance = key,
        "instance reconcile error"
    );
    let n = ctx.bump_retries(&key);
    if n > ctx.settings.queue_max_retries {
        warn!(instance = key, retries = n, "retry limit reached, parking");
        Action::await_change()
    } else {
        Action::requeue(backoff(n))
    }
}

fn retry_key(obj: &DynamicObject) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

#[instrument(skip(obj, ctx), fields(
    instance = %retry_key(&obj),
    generation = obj.metadata.generation,
))]
async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<DynamicCtx>) -> Result<Action> {
    metrics::reconcile("instance");
    let plan = ctx.plan();
    let ns = obj.namespace().unwrap_or_default();
    let api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), &ns, &plan.api_resource);

    finalizer(&api, INSTANCE_FINALIZER, obj, |event| async {
        match event {
            Finalizer::Apply(obj) => apply_one(obj, &plan, &ctx).await,
            Finalizer::Cleanup(obj) => cleanup_one(obj, &plan, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// NodeState is one node's position in the reconcile walk.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum::Display)]
enum NodeState {
    /// Not yet materialized; prerequisites or live data are missing.
    Pending,
    /// Applied but its readiness predicates do not hold yet.
    Created,
    /// Materialized and ready.
    Ready,
    /// Gated off by includeWhen, directly or through a prerequisite.
    Skipped,
    /// Failed in a way retrying will not fix.
    Failed,
}

/// NodeRecord is the per-node reconciliation state persisted on the instance status.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeRecord {
    id: String,
    state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    observed_ref: Option<ObservedRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

/// ObservedRef locates the live object a node materialized or read.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ObservedRef {
    api_version: String,
    kind: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
}

#[instrument(skip_all)]
async fn apply_one(obj: Arc<DynamicObject>, plan: &Plan, ctx: &DynamicCtx) -> Result<Action> {
    let ns = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let key = retry_key(&obj);

    let mut spec = obj
        .data
        .get("spec")
        .cloned()
        .unwrap_or_else(|| json!({}));
    apply_defaults(&plan.spec_type, &mut spec);

    if let Some(message) = violated_validation(plan, &spec) {
        warn!(instance = key, message, "instance failed validation");
        let status = json!({
            "state": "Degraded",
            "observedGeneration": obj.metadata.generation,
            "conditions": [
                condition("Ready", false, "ValidationFailed", &message, &obj),
                condition("Degraded", true, "ValidationFailed", &message, &obj),
            ],
        });
        patch_status(ctx, plan, &ns, &name, status).await?;
        return Ok(Action::await_change());
    }

    let mut env = Bindings::new();
    env.bind(SCHEMA_ROOT, spec);

    let client = ctx
        .accounts
        .client_for(&plan.service_accounts, &ns, &ctx.client)?;

    let mut records: Vec<NodeRecord> = Vec::new();
    let mut states: BTreeMap<String, NodeState> = BTreeMap::new();
    for id in &plan.analysis.order {
        let Some(node) = plan.analysis.nodes.get(id) else {
            continue;
        };
        let record = step_node(node, &obj, &ns, &client, ctx, &mut env, &states).await?;
        trace!(node = id, state = %record.state, "visited node");
        states.insert(id.clone(), record.state);
        records.push(record);
    }

    // Project declared status fields; a field that cannot evaluate yet is omitted, not
    // zeroed.
    let mut status = serde_json::Map::new();
    for site in &plan.analysis.status {
        match site.expression.eval(&env) {
            Ok(value) => insert_status(&mut status, &site.path, value),
            Err(err) => trace!(
                field = site.path.join("."),
                error = %err,
                "status field not yet evaluable"
            ),
        }
    }

    let summary = summarize(&records);
    let mut exhausted = false;
    let action = match summary {
        Summary::Ready => {
            ctx.clear_retries(&key);
            Action::requeue(ctx.settings.resync_period)
        }
        Summary::Failed => Action::await_change(),
        Summary::Progressing => {
            let n = ctx.bump_retries(&key);
            if n > ctx.settings.queue_max_retries {
                warn!(instance = key, retries = n, "retry limit reached, parking");
                exhausted = true;
                Action::await_change()
            } else {
                metrics::requeue("instance");
                Action::requeue(backoff(n))
            }
        }
    };

    status.insert("state".into(), json!(state_name(summary, exhausted)));
    status.insert("observedGeneration".into(), json!(obj.metadata.generation));
    status.insert(
        "conditions".into(),
        conditions_for(&records, summary, exhausted, &obj),
    );
    status.insert("resources".into(), serde_json::to_value(&records)?);
    patch_status(ctx, plan, &ns, &name, Value::Object(status)).await?;

    Ok(action)
}

fn violated_validation(plan: &Plan, spec: &Value) -> Option<String> {
    let mut bindings = Bindings::new();
    bindings.bind("self", spec.clone());
    for v in &plan.validations {
        let ok = matches!(v.expression.eval(&bindings), Ok(Value::Bool(true)));
        if !ok {
            return Some(if v.message.is_empty() {
                format!("validation {:?} failed", v.expression.source())
            } else {
                v.message.clone()
            });
        }
    }
    None
}

/// Step_node materializes or reads one node, in topological order.
async fn step_node(
    node: &NodeAnalysis,
    obj: &DynamicObject,
    instance_ns: &str,
    client: &kube::Client,
    ctx: &DynamicCtx,
    env: &mut Bindings,
    states: &BTreeMap<String, NodeState>,
) -> Result<NodeRecord> {
    let record = |state: NodeState, observed: Option<ObservedRef>, err: Option<String>| NodeRecord {
        id: node.id.clone(),
        state,
        observed_ref: observed,
        last_error: err,
    };

    // A prerequisite that was gated off gates this node off too; one that is not Ready means
    // this node is not visited this pass.
    for dep in &node.dependencies {
        match states.get(dep) {
            Some(NodeState::Skipped) => {
                return Ok(record(NodeState::Skipped, None, None));
            }
            Some(NodeState::Ready) => {}
            _ => {
                return Ok(record(
                    NodeState::Pending,
                    None,
                    Some(format!("waiting for {dep:?}")),
                ));
            }
        }
    }

    for expr in &node.include_when {
        match expr.eval(env) {
            Ok(Value::Bool(true)) => {}
            Ok(_) => return Ok(record(NodeState::Skipped, None, None)),
            Err(err) => {
                return Ok(record(NodeState::Pending, None, Some(err.to_string())));
            }
        }
    }

    let (ar, caps) = ctx.api_for(&node.gvk).await?;

    match node.kind {
        NodeKind::ExternalRef => {
            let Some(external) = &node.external else {
                return Ok(record(
                    NodeState::Failed,
                    None,
                    Some("external reference payload missing".into()),
                ));
            };
            let target_ns = external
                .namespace
                .clone()
                .unwrap_or_else(|| instance_ns.to_string());
            let api = scoped_api(client.clone(), &ar, &caps, &target_ns);
            let observed = ObservedRef {
                api_version: external.api_version.clone(),
                kind: external.kind.clone(),
                name: external.name.clone(),
                namespace: (caps.scope == Scope::Namespaced).then(|| target_ns.clone()),
            };
            match api.get_opt(&external.name).await? {
                Some(found) => {
                    let doc = serde_json::to_value(&found)?;
                    env.bind(&node.id, doc.clone());
                    if ready(node, &doc, env) {
                        Ok(record(NodeState::Ready, Some(observed), None))
                    } else {
                        Ok(record(NodeState::Created, Some(observed), None))
                    }
                }
                None => Ok(record(
                    NodeState::Pending,
                    None,
                    Some(format!(
                        "{} {:?} not found",
                        external.kind, external.name
                    )),
                )),
            }
        }
        NodeKind::Template => {
            let mut manifest = match render(node, env) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Ok(record(
                        NodeState::Failed,
                        None,
                        Some("template did not render to an object".into()),
                    ));
                }
                // Unresolvable live data; try again once prerequisites have moved.
                Err(err) => {
                    return Ok(record(NodeState::Pending, None, Some(err.to_string())));
                }
            };
            let target_ns = prepare_metadata(&mut manifest, obj, instance_ns, node, &caps);
            let Some(object_name) = manifest
                .get("metadata")
                .and_then(|m| m.get("name"))
                .and_then(Value::as_str)
                .map(String::from)
            else {
                return Ok(record(
                    NodeState::Failed,
                    None,
                    Some("rendered manifest has no metadata.name".into()),
                ));
            };

            let api = scoped_api(client.clone(), &ar, &caps, &target_ns);
            let applied = api
                .patch(
                    &object_name,
                    &APPLY_PARAMS,
                    &Patch::Apply(&Value::Object(manifest)),
                )
                .await?;
            let doc = serde_json::to_value(&applied)?;
            env.bind(&node.id, doc.clone());

            let observed = ObservedRef {
                api_version: node.gvk.api_version(),
                kind: node.gvk.kind.clone(),
                name: object_name,
                namespace: (caps.scope == Scope::Namespaced).then(|| target_ns.clone()),
            };
            if ready(node, &doc, env) {
                Ok(record(NodeState::Ready, Some(observed), None))
            } else {
                Ok(record(NodeState::Created, Some(observed), None))
            }
        }
    }
}

/// Prepare_metadata stamps namespace, labels and the owner reference onto a rendered
/// manifest, reporting the namespace the object will live in.
fn prepare_metadata(
    manifest: &mut serde_json::Map<String, Value>,
    obj: &DynamicObject,
    instance_ns: &str,
    node: &NodeAnalysis,
    caps: &ApiCapabilities,
) -> String {
    let metadata = manifest
        .entry("metadata")
        .or_insert_with(|| json!({}));
    let Value::Object(metadata) = metadata else {
        return instance_ns.to_string();
    };

    let mut target_ns = instance_ns.to_string();
    if caps.scope == Scope::Namespaced {
        match metadata.get("namespace").and_then(Value::as_str) {
            Some(ns) => target_ns = ns.to_string(),
            None => {
                metadata.insert("namespace".into(), json!(instance_ns));
            }
        }
    } else {
        metadata.remove("namespace");
    }

    let labels = metadata.entry("labels").or_insert_with(|| json!({}));
    if let Value::Object(labels) = labels {
        labels.insert(NODE_ID_LABEL.clone(), json!(node.id));
        labels.insert(
            INSTANCE_LABEL.clone(),
            json!(obj.uid().unwrap_or_default()),
        );
    }

    // The instance owns what it materializes; owner references cannot cross namespaces or
    // scopes, so those objects are tracked through the recorded refs instead.
    if caps.scope == Scope::Namespaced && target_ns == instance_ns {
        metadata.insert(
            "ownerReferences".into(),
            json!([{
                "apiVersion": obj.types.as_ref().map(|t| t.api_version.clone()).unwrap_or_default(),
                "kind": obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default(),
                "name": obj.name_any(),
                "uid": obj.uid().unwrap_or_default(),
                "controller": true,
                "blockOwnerDeletion": true,
            }]),
        );
    }

    target_ns
}

fn scoped_api(
    client: kube::Client,
    ar: &ApiResource,
    caps: &ApiCapabilities,
    namespace: &str,
) -> Api<DynamicObject> {
    if caps.scope == Scope::Namespaced {
        Api::namespaced_with(client, namespace, ar)
    } else {
        Api::all_with(client, ar)
    }
}

/// Ready evaluates the node's readiness predicates against the read-back object, falling
/// back to the well-known conditions when none are declared.
fn ready(node: &NodeAnalysis, doc: &Value, env: &Bindings) -> bool {
    if node.ready_when.is_empty() {
        return default_ready(doc);
    }
    node.ready_when
        .iter()
        .all(|e| matches!(e.eval(env), Ok(Value::Bool(true))))
}

/// Default readiness: a `Ready` or `Available` condition must be `"True"` when one exists;
/// bare existence suffices otherwise.
fn default_ready(doc: &Value) -> bool {
    let Some(Value::Array(conditions)) = doc.pointer("/status/conditions") else {
        return true;
    };
    let mut relevant = conditions.iter().filter(|c| {
        matches!(
            c.get("type").and_then(Value::as_str),
            Some("Ready") | Some("Available")
        )
    });
    let mut any = false;
    let mut ok = false;
    for c in relevant.by_ref() {
        any = true;
        if c.get("status").and_then(Value::as_str) == Some("True") {
            ok = true;
        }
    }
    !any || ok
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Summary {
    Ready,
    Progressing,
    Failed,
}

fn summarize(records: &[NodeRecord]) -> Summary {
    if records.iter().any(|r| r.state == NodeState::Failed) {
        return Summary::Failed;
    }
    if records
        .iter()
        .all(|r| matches!(r.state, NodeState::Ready | NodeState::Skipped))
    {
        return Summary::Ready;
    }
    Summary::Progressing
}

fn state_name(summary: Summary, exhausted: bool) -> &'static str {
    match summary {
        Summary::Ready => "Ready",
        Summary::Failed => "Degraded",
        Summary::Progressing if exhausted => "Degraded",
        Summary::Progressing => "InProgress",
    }
}

fn conditions_for(
    records: &[NodeRecord],
    summary: Summary,
    exhausted: bool,
    obj: &DynamicObject,
) -> Value {
    let offender = |state: NodeState| {
        records
            .iter()
            .find(|r| r.state == state)
            .map(|r| {
                let detail = r.last_error.clone().unwrap_or_default();
                if detail.is_empty() {
                    format!("node {:?} is {}", r.id, r.state)
                } else {
                    format!("node {:?}: {detail}", r.id)
                }
            })
            .unwrap_or_default()
    };

    let (ready, reason, message) = match summary {
        Summary::Ready => (true, "AllResourcesReady".to_string(), String::new()),
        Summary::Failed => (
            false,
            "NodeFailed".to_string(),
            offender(NodeState::Failed),
        ),
        Summary::Progressing => {
            let m = records
                .iter()
                .find(|r| matches!(r.state, NodeState::Pending | NodeState::Created))
                .map(|r| {
                    let detail = r.last_error.clone().unwrap_or_default();
                    if detail.is_empty() {
                        format!("node {:?} is {}", r.id, r.state)
                    } else {
                        format!("node {:?}: {detail}", r.id)
                    }
                })
                .unwrap_or_default();
            (
                false,
                if exhausted {
                    "RetryLimitExceeded".to_string()
                } else {
                    "ResourcesProgressing".to_string()
                },
                m,
            )
        }
    };

    let progressing = summary == Summary::Progressing && !exhausted;
    let degraded = summary == Summary::Failed || exhausted;

    json!([
        condition("Ready", ready, &reason, &message, obj),
        condition(
            "Progressing",
            progressing,
            if progressing { "ResourcesProgressing" } else { "Idle" },
            &message,
            obj,
        ),
        condition(
            "Degraded",
            degraded,
            if degraded { reason.as_str() } else { "AllResourcesHealthy" },
            &message,
            obj,
        ),
    ])
}

fn condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    obj: &DynamicObject,
) -> Value {
    json!({
        "type": type_,
        "status": if status { "True" } else { "False" },
        "reason": reason,
        "message": message,
        "lastTransitionTime": now(),
        "observedGeneration": obj.metadata.generation,
    })
}

fn insert_status(status: &mut serde_json::Map<String, Value>, path: &[String], value: Value) {
    match path {
        [] => {}
        [leaf] => {
            status.insert(leaf.clone(), value);
        }
        [head, rest @ ..] => {
            let entry = status.entry(head.clone()).or_insert_with(|| json!({}));
            if let Value::Object(map) = entry {
                insert_status(map, rest, value);
            }
        }
    }
}

async fn patch_status(
    ctx: &DynamicCtx,
    plan: &Plan,
    ns: &str,
    name: &str,
    status: Value,
) -> Result<()> {
    let api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), ns, &plan.api_resource);
    api.patch_status(name, &PATCH_PARAMS, &Patch::Merge(json!({"status": status})))
        .await?;
    Ok(())
}

/// Cleanup walks the topological order in reverse, deleting each materialized template
/// object and waiting for it to disappear before touching its dependencies. External
/// references are left untouched.
#[instrument(skip_all)]
async fn cleanup_one(obj: Arc<DynamicObject>, plan: &Plan, ctx: &DynamicCtx) -> Result<Action> {
    let ns = obj.namespace().unwrap_or_default();
    let records: Vec<NodeRecord> = obj
        .data
        .pointer("/status/resources")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let client = ctx
        .accounts
        .client_for(&plan.service_accounts, &ns, &ctx.client)?;

    for id in plan.analysis.order.iter().rev() {
        let Some(node) = plan.analysis.nodes.get(id) else {
            continue;
        };
        if node.kind != NodeKind::Template {
            continue;
        }
        let Some(observed) = records
            .iter()
            .find(|r| &r.id == id)
            .and_then(|r| r.observed_ref.as_ref())
        else {
            continue;
        };
        let (ar, caps) = ctx.api_for(&node.gvk).await?;
        let target_ns = observed.namespace.clone().unwrap_or_else(|| ns.clone());
        let api = scoped_api(client.clone(), &ar, &caps, &target_ns);
        match api.get_opt(&observed.name).await? {
            Some(existing) => {
                if existing.meta().deletion_timestamp.is_none() {
                    debug!(node = id, name = observed.name, "deleting owned object");
                    let _ = api.delete(&observed.name, &DeleteParams::default()).await?;
                }
                // Wait for this wave to disappear before its dependencies go.
                return Ok(Action::requeue(Duration::from_secs(2)));
            }
            None => continue,
        }
    }
    info!(instance = retry_key(&obj), "all owned objects gone");
    ctx.clear_retries(&retry_key(&obj));
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_readiness_rules() {
        // No status at all: existence suffices.
        assert!(default_ready(&json!({"metadata": {"name": "x"}})));
        // Irrelevant conditions: existence suffices.
        assert!(default_ready(
            &json!({"status": {"conditions": [{"type": "Synced", "status": "False"}]}})
        ));
        // A Ready condition gates.
        assert!(default_ready(
            &json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}})
        ));
        assert!(!default_ready(
            &json!({"status": {"conditions": [{"type": "Ready", "status": "False"}]}})
        ));
        assert!(default_ready(
            &json!({"status": {"conditions": [{"type": "Available", "status": "True"}]}})
        ));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(30), Duration::from_secs(256));
    }

    #[test]
    fn summary_rules() {
        let rec = |id: &str, state: NodeState| NodeRecord {
            id: id.into(),
            state,
            observed_ref: None,
            last_error: None,
        };
        assert_eq!(
            summarize(&[rec("a", NodeState::Ready), rec("b", NodeState::Skipped)]),
            Summary::Ready
        );
        assert_eq!(
            summarize(&[rec("a", NodeState::Ready), rec("b", NodeState::Pending)]),
            Summary::Progressing
        );
        assert_eq!(summarize(&[rec("a", NodeState::Failed)]), Summary::Failed);
    }

    #[test]
    fn status_insertion_nests() {
        let mut status = serde_json::Map::new();
        insert_status(
            &mut status,
            &["service".into(), "endpoint".into()],
            json!("web"),
        );
        insert_status(&mut status, &["availableReplicas".into()], json!(3));
        assert_eq!(
            Value::Object(status),
            json!({"service": {"endpoint": "web"}, "availableReplicas": 3})
        );
    }
}

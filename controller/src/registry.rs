//! Registry owns the set of running dynamic controllers, one per Active definition.
//!
//! The registry mutex guards only lookup, insert and remove; it is never held across an API
//! call. Plan refreshes swap an `Arc` under the controller without restarting it, as long as
//! the synthesized GVK is unchanged.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use kube::core::{ApiResource, GroupVersionKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kro_expr::Expression;
use kro_graph::Analysis;
use kro_schema::Type;

use crate::instances;

/// CompiledValidation is one schema-level rule, parsed once at plan build time.
pub struct CompiledValidation {
    /// The compiled rule; evaluated with `self` bound to the instance spec.
    pub expression: Expression,
    /// Message surfaced on violation.
    pub message: String,
}

/// Plan is everything a dynamic controller needs to reconcile instances: the cached analysis
/// plus the compiled schema machinery. Instances always reconcile against the plan most
/// recently published for their definition.
pub struct Plan {
    /// Name of the owning ResourceGraphDefinition.
    pub rgd_name: String,
    /// The synthesized GVK.
    pub gvk: GroupVersionKind,
    /// The ApiResource for the synthesized GVK.
    pub api_resource: ApiResource,
    /// The compiled instance spec type.
    pub spec_type: Type,
    /// The cached graph analysis.
    pub analysis: Analysis,
    /// Schema-level validation rules re-applied at reconcile time.
    pub validations: Vec<CompiledValidation>,
    /// Namespace to ServiceAccount impersonation map.
    pub service_accounts: BTreeMap<String, String>,
}

/// PlanSlot is the refreshable plan shared with a running controller.
pub type PlanSlot = Arc<RwLock<Arc<Plan>>>;

struct Running {
    gvk: GroupVersionKind,
    plan: PlanSlot,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry maps definition names to their running dynamic controllers.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<HashMap<String, Running>>,
}

impl Registry {
    /// New creates an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Plan reports the current plan for a definition, if its controller is running.
    pub fn plan(&self, name: &str) -> Option<Arc<Plan>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(name).map(|r| {
            r.plan
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        })
    }

    /// Is_running reports whether a controller exists for the definition.
    pub fn is_running(&self, name: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.contains_key(name)
    }

    /// Ensure starts a dynamic controller for the plan, or refreshes the plan of the one
    /// already running. A GVK change tears the old controller down first.
    pub fn ensure(&self, deps: instances::Deps, plan: Plan) {
        let name = plan.rgd_name.clone();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(&name) {
            Some(running) if running.gvk == plan.gvk => {
                debug!(rgd = name, "refreshing plan");
                let mut slot = running.plan.write().unwrap_or_else(|e| e.into_inner());
                *slot = Arc::new(plan);
                return;
            }
            Some(_) => {
                warn!(rgd = name, "synthesized GVK changed, restarting controller");
                if let Some(old) = inner.remove(&name) {
                    old.cancel.cancel();
                }
            }
            None => {}
        }
        info!(rgd = name, gvk = ?plan.gvk, "starting dynamic controller");
        let gvk = plan.gvk.clone();
        let slot: PlanSlot = Arc::new(RwLock::new(Arc::new(plan)));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(instances::run(deps, slot.clone(), cancel.clone()));
        inner.insert(
            name,
            Running {
                gvk,
                plan: slot,
                cancel,
                handle,
            },
        );
    }

    /// Stop tears down the controller for a definition and awaits its drain.
    pub async fn stop(&self, name: &str) {
        let running = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.remove(name)
        };
        if let Some(running) = running {
            info!(rgd = name, "stopping dynamic controller");
            running.cancel.cancel();
            if let Err(err) = running.handle.await {
                warn!(rgd = name, %err, "dynamic controller exited abnormally");
            }
        }
    }

    /// Shutdown cancels every controller and awaits them all.
    pub async fn shutdown(&self) {
        let all: Vec<Running> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.drain().map(|(_, r)| r).collect()
        };
        for running in &all {
            running.cancel.cancel();
        }
        for running in all {
            let _ = running.handle.await;
        }
    }
}

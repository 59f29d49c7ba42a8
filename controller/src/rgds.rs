//! Rgds holds the controller for the "ResourceGraphDefinition" CRD.
//!
//! A definition moves through validation, schema compilation, graph analysis, CRD synthesis
//! and registration; success publishes `state: Active` plus the topological order, and a
//! dynamic controller for the synthesized GVK starts (or refreshes its plan). Any terminal
//! failure publishes `state: Inactive` and leaves a previously-running controller on its
//! last-good plan.

use std::sync::{Arc, LazyLock};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{DeleteParams, DynamicObject},
    core::{ApiResource, GroupVersionKind},
    runtime::{
        controller::{Config as ControllerConfig, Error as CtrlErr},
        finalizer::{Event as Finalizer, finalizer},
    },
};
use serde_json::json;
use tokio::{
    signal::unix::{SignalKind, signal},
    time::Duration,
};
use tokio_stream::wrappers::SignalStream;

use crate::{
    OWNED_BY_LABEL, RGD_FINALIZER, crd, instances, metrics, prelude::*,
    registry::{CompiledValidation, Plan},
};
use api::v1alpha1::{
    GraphState, ResourceGraphDefinition, ResourceGraphDefinitionStatus, ResourceInformation,
};
use kro_expr::{Expression, TypeEnv};
use kro_graph::SkeletonResolver;
use kro_schema::{Scalar, Type};

static SELF_GVK: LazyLock<GroupVersionKind> = LazyLock::new(|| GroupVersionKind {
    group: ResourceGraphDefinition::group(&()).to_string(),
    version: ResourceGraphDefinition::version(&()).to_string(),
    kind: ResourceGraphDefinition::kind(&()).to_string(),
});

static DEFAULT_REQUEUE: LazyLock<Action> =
    LazyLock::new(|| Action::requeue(Duration::from_secs(60 * 60)));

/// Controller is the ResourceGraphDefinition controller.
///
/// An error is returned if any setup fails.
#[instrument(skip_all)]
pub fn controller(cancel: CancellationToken, ctx: Arc<Context>) -> Result<ControllerFuture> {
    let client = ctx.client.clone();
    let ctlcfg = watcher::Config::default();
    let root: Api<ResourceGraphDefinition> = Api::all(client.clone());
    let sig = SignalStream::new(signal(SignalKind::user_defined1())?);
    let concurrency = ctx.settings.rgd_concurrent_reconciles;

    Ok(async move {
        if let Err(e) = root.list(&ListParams::default().limit(1)).await {
            error!("CRD ({SELF_GVK:?}) is not queryable ({e:?}); is the CRD installed?");
            return Err(Error::MissingName("ResourceGraphDefinition CRD"));
        }

        let ctl = Controller::new(root, ctlcfg.clone())
            .owns(
                Api::<CustomResourceDefinition>::all(client.clone()),
                ctlcfg.clone(),
            )
            .with_config(ControllerConfig::default().concurrency(concurrency))
            .reconcile_all_on(sig)
            .graceful_shutdown_on(cancel.cancelled_owned());
        info!("starting resourcegraphdefinition controller");

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
        debug!("resourcegraphdefinition controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(obj: Arc<ResourceGraphDefinition>, err: &Error, _ctx: Arc<Context>) -> Action {
    metrics::failure("rgd");
    error!(
        error = err.to_string(),
        obj.metadata.name, obj.metadata.uid, "reconcile error"
    );
    Action::requeue(Duration::from_secs(5))
}

#[instrument(skip(ctx, rgd), fields(
    kind = ResourceGraphDefinition::kind(&()).as_ref(),
    name = rgd.name_any(),
    generation = rgd.metadata.generation,
))]
async fn reconcile(rgd: Arc<ResourceGraphDefinition>, ctx: Arc<Context>) -> Result<Action> {
    metrics::reconcile("rgd");
    let api: Api<ResourceGraphDefinition> = Api::all(ctx.client.clone());

    info!(r#"reconciling ResourceGraphDefinition "{}""#, rgd.name_any());
    finalizer(&api, RGD_FINALIZER, rgd, |event| async {
        match event {
            Finalizer::Apply(rgd) => reconcile_one(rgd, ctx.clone()).await,
            Finalizer::Cleanup(rgd) => cleanup_one(rgd, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

#[instrument(skip(ctx, rgd))]
async fn reconcile_one(
    rgd: Arc<ResourceGraphDefinition>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let name = rgd.name_any();
    let oref = rgd.object_ref(&());

    let plan = match build_plan(&rgd) {
        Ok(plan) => plan,
        Err(err) => return deactivate(rgd, ctx, err).await,
    };

    let crd_doc = crd::synthesize(&rgd, &plan);
    let crd_name = crd_doc.metadata.name.clone().unwrap_or_default();
    let crds: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
    if let Some(existing) = crds.get_opt(&crd_name).await? {
        let owner = existing
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(OWNED_BY_LABEL.as_str()))
            .cloned();
        if owner.as_deref() != Some(name.as_str()) {
            let err = Error::Conflict(format!(
                "CRD {crd_name:?} is already owned by {}",
                owner.as_deref().unwrap_or("<unmanaged>"),
            ));
            return deactivate(rgd, ctx, err).await;
        }
    }
    match crds
        .patch(&crd_name, &PATCH_PARAMS, &Patch::Apply(&crd_doc))
        .await
    {
        Ok(_) => debug!(crd = crd_name, "applied synthesized CRD"),
        Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 422 => {
            return deactivate(rgd, ctx, Error::Registration(ae.message)).await;
        }
        Err(err) => return Err(err.into()),
    }

    let order = plan.analysis.order.clone();
    let resources: Vec<ResourceInformation> = plan
        .analysis
        .nodes
        .values()
        .map(|n| ResourceInformation {
            id: n.id.clone(),
            dependencies: n.dependencies.iter().cloned().collect(),
        })
        .collect();

    let was_running = ctx.registry.is_running(&name);
    ctx.registry.ensure(
        instances::Deps {
            client: ctx.client.clone(),
            settings: ctx.settings.clone(),
            accounts: ctx.accounts.clone(),
        },
        plan,
    );

    let was_active = rgd
        .status
        .as_ref()
        .and_then(|s| s.state)
        .map(|s| s == GraphState::Active)
        .unwrap_or(false);
    let mut status = rgd.status.clone().unwrap_or_default();
    status.state = Some(GraphState::Active);
    status.topological_order = order;
    status.resources = resources;
    status.add_condition(Condition {
        type_: crate::kro_condition("Ready"),
        status: "True".into(),
        reason: "Active".into(),
        message: "definition analyzed and registered".into(),
        observed_generation: rgd.metadata.generation,
        last_transition_time: crate::now(),
    });
    publish_status(&ctx, &name, status).await?;

    if !was_running || !was_active {
        ctx.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "Activated".into(),
                    note: Some(format!("serving instances of kind {:?}", rgd.spec.schema.kind)),
                    action: "Reconcile".into(),
                    secondary: None,
                },
                &oref,
            )
            .await
            .map_err(Error::Kube)?;
    }

    Ok(DEFAULT_REQUEUE.clone())
}

/// Deactivate publishes `state: Inactive` with the terminal error and stops reconciling
/// until the spec changes. A running dynamic controller is left on its last-good plan.
#[instrument(skip(ctx, rgd, err))]
async fn deactivate(
    rgd: Arc<ResourceGraphDefinition>,
    ctx: Arc<Context>,
    err: Error,
) -> Result<Action> {
    let name = rgd.name_any();
    let reason = classify(&err);
    warn!(rgd = name, error = %err, reason, "definition rejected");

    let mut status = rgd.status.clone().unwrap_or_default();
    status.state = Some(GraphState::Inactive);
    status.add_condition(Condition {
        type_: crate::kro_condition("Ready"),
        status: "False".into(),
        reason: reason.into(),
        message: err.to_string(),
        observed_generation: rgd.metadata.generation,
        last_transition_time: crate::now(),
    });
    publish_status(&ctx, &name, status).await?;

    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Warning,
                reason: reason.into(),
                note: Some(err.to_string()),
                action: "Reconcile".into(),
                secondary: None,
            },
            &rgd.object_ref(&()),
        )
        .await
        .map_err(Error::Kube)?;

    Ok(Action::await_change())
}

/// Classify maps an error onto the condition/event reason taxonomy.
fn classify(err: &Error) -> &'static str {
    match err {
        Error::Schema(_) => "SchemaError",
        Error::Expression(_) => "ExpressionError",
        Error::Graph(kro_graph::Error::Expression { .. }) => "ExpressionError",
        Error::Graph(_) => "GraphError",
        Error::Conflict(_) | Error::Registration(_) => "RegistrationError",
        _ => "ReconcileError",
    }
}

async fn publish_status(
    ctx: &Context,
    name: &str,
    status: ResourceGraphDefinitionStatus,
) -> Result<()> {
    let api: Api<ResourceGraphDefinition> = Api::all(ctx.client.clone());
    let patch = Patch::Apply(json!({
        "apiVersion": ResourceGraphDefinition::api_version(&()),
        "kind": ResourceGraphDefinition::kind(&()),
        "status": status,
    }));
    api.patch_status(name, &PATCH_PARAMS, &patch).await?;
    Ok(())
}

/// Build_plan runs validation, schema compilation and graph analysis for a definition.
pub(crate) fn build_plan(rgd: &ResourceGraphDefinition) -> Result<Plan> {
    let schema = &rgd.spec.schema;
    if schema.kind.is_empty() {
        return Err(Error::MissingName("schema.kind"));
    }
    if schema.api_version.is_empty() {
        return Err(Error::MissingName("schema.apiVersion"));
    }

    let spec_type = kro_schema::compile(&schema.spec, &schema.types)?;
    let analysis = kro_graph::analyze(
        &rgd.spec.resources,
        &spec_type,
        &schema.status,
        &SkeletonResolver,
    )?;

    let mut self_env = TypeEnv::new();
    self_env.bind("self", spec_type.clone());
    let mut validations = Vec::new();
    for v in &schema.validation {
        let expression = Expression::parse(&v.expression)?;
        let ty = expression.check(&self_env)?;
        if !matches!(ty, Type::Scalar(Scalar::Boolean) | Type::Any) {
            return Err(Error::Expression(kro_expr::Error::Type(format!(
                "validation {:?} must be boolean, found {ty}",
                v.expression,
            ))));
        }
        validations.push(CompiledValidation {
            expression,
            message: v.message.clone(),
        });
    }

    let gvk = GroupVersionKind::gvk(&schema.group, &schema.api_version, &schema.kind);
    let plural = crd::plural_of(&schema.kind);
    let api_resource = ApiResource::from_gvk_with_plural(&gvk, &plural);
    Ok(Plan {
        rgd_name: rgd.name_any(),
        gvk,
        api_resource,
        spec_type,
        analysis,
        validations,
        service_accounts: rgd.spec.default_service_accounts.clone(),
    })
}

#[instrument(skip(ctx, rgd))]
async fn cleanup_one(rgd: Arc<ResourceGraphDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let name = rgd.name_any();
    let oref = rgd.object_ref(&());
    let schema = &rgd.spec.schema;
    let plural = crd::plural_of(&schema.kind);
    let crd_name = format!("{plural}.{}", schema.group);

    if !ctx.settings.allow_crd_deletion {
        let gvk = GroupVersionKind::gvk(&schema.group, &schema.api_version, &schema.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, &plural);
        let api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &ar);
        // A failing list means the CRD is already unservable; nothing left to protect.
        if let Ok(list) = api.list(&ListParams::default().limit(1)).await {
            if !list.items.is_empty() {
                ctx.recorder
                    .publish(
                        &Event {
                            type_: EventType::Warning,
                            reason: "DeletionBlocked".into(),
                            note: Some(format!(
                                "live instances of {:?} exist and allow-crd-deletion is off",
                                schema.kind,
                            )),
                            action: "Delete".into(),
                            secondary: None,
                        },
                        &oref,
                    )
                    .await
                    .map_err(Error::Kube)?;
                return Err(Error::DeletionBlocked(format!(
                    "live instances of {:?} exist",
                    schema.kind,
                )));
            }
        }
    }

    ctx.registry.stop(&name).await;

    let crds: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
    match crds.delete(&crd_name, &DeleteParams::default()).await {
        Ok(_) => info!(crd = crd_name, "deleted synthesized CRD"),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(err) => return Err(err.into()),
    }

    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "Unregistered".into(),
                note: Some(format!("removed CRD {crd_name:?}")),
                action: "Delete".into(),
                secondary: None,
            },
            &oref,
        )
        .await
        .map_err(Error::Kube)?;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, *};

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn rgds_without_finalizer_gets_a_finalizer() {
        let (testctx, fakeserver) = Context::rgd_tests();
        let r = rgd::web_application();
        let mocksrv = fakeserver.run(Scenario::FinalizerCreation(r.clone()));
        reconcile(Arc::new(r), testctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn cyclic_rgd_goes_inactive() {
        let (testctx, fakeserver) = Context::rgd_tests();
        let r = rgd::finalized(rgd::cyclic());
        let mocksrv = fakeserver.run(Scenario::Deactivation(r.clone(), "GraphError"));
        reconcile(Arc::new(r), testctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn unparsable_schema_goes_inactive() {
        let (testctx, fakeserver) = Context::rgd_tests();
        let mut r = rgd::finalized(rgd::web_application());
        r.spec.schema.spec.insert(
            "bad".to_string(),
            serde_json::Value::String("strnig".into()),
        );
        let mocksrv = fakeserver.run(Scenario::Deactivation(r.clone(), "SchemaError"));
        reconcile(Arc::new(r), testctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[self::test]
    fn build_plan_produces_topological_order() {
        let r = rgd::web_application();
        let plan = build_plan(&r).expect("plan");
        assert_eq!(plan.analysis.order, vec!["deployment", "service"]);
        assert_eq!(plan.gvk.kind, "WebApplication");
        assert_eq!(plan.api_resource.plural, "webapplications");
    }

    #[self::test]
    fn build_plan_rejects_cycles() {
        let err = build_plan(&rgd::cyclic()).unwrap_err();
        assert_eq!(classify(&err), "GraphError");
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[self::test]
    fn validations_compile_and_must_be_boolean() {
        let mut r = rgd::web_application();
        r.spec.schema.validation = vec![api::v1alpha1::SchemaValidation {
            expression: "self.replicas".into(),
            message: "".into(),
        }];
        let err = build_plan(&r).unwrap_err();
        assert_eq!(classify(&err), "ExpressionError");
    }

    #[self::test]
    fn plan_for_uses_testing_fixture() {
        // The fixture is shared with the CRD synthesis tests; keep it building.
        let _ = testing::plan_for(&rgd::web_application());
    }
}

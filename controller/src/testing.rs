//! Extras that only show up during tests.
#![allow(missing_docs)]
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use kube::{
    Resource, ResourceExt,
    client::{Body, Client},
    runtime::events::Recorder,
};
use serde_json::{Value, json};

use super::*;
use api::v1alpha1::ResourceGraphDefinition;

pub use test_log::test;

impl Context {
    pub fn rgd_tests() -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let mock_recorder = Recorder::new(mock_client.clone(), REPORTER.clone());
        let ctx = Self {
            client: mock_client,
            recorder: mock_recorder,
            settings: Settings::default(),
            registry: registry::Registry::new(),
            accounts: Arc::new(accounts::Impersonator::new(kube::Config::new(
                "http://localhost:8001".parse().expect("static url"),
            ))),
        };
        (Arc::new(ctx), ApiServerVerifier::new(handle))
    }
}

pub mod rgd {
    use kube::{Resource, ResourceExt};

    use super::ResourceGraphDefinition;

    /// A two-node linear definition: a Deployment feeding a Service.
    pub fn web_application() -> ResourceGraphDefinition {
        let spec = serde_json::from_value(serde_json::json!({
            "schema": {
                "kind": "WebApplication",
                "apiVersion": "v1alpha1",
                "group": "kro.run",
                "spec": {
                    "name": "string | required=true",
                    "image": "string | default=nginx",
                    "replicas": "integer | default=3",
                },
                "status": {
                    "availableReplicas": "${deployment.status.availableReplicas}",
                },
            },
            "resources": [
                {
                    "id": "deployment",
                    "template": {
                        "apiVersion": "apps/v1",
                        "kind": "Deployment",
                        "metadata": {"name": "${schema.name}"},
                        "spec": {
                            "replicas": "${schema.replicas}",
                            "selector": {"matchLabels": {"app": "${schema.name}"}},
                            "template": {
                                "metadata": {"labels": {"app": "${schema.name}"}},
                                "spec": {"containers": [
                                    {"name": "main", "image": "${schema.image}"},
                                ]},
                            },
                        },
                    },
                },
                {
                    "id": "service",
                    "template": {
                        "apiVersion": "v1",
                        "kind": "Service",
                        "metadata": {"name": "${schema.name}"},
                        "spec": {
                            "selector": {"app": "${deployment.metadata.name}"},
                            "ports": [{"port": 80}],
                        },
                    },
                },
            ],
        }))
        .expect("static fixture");
        let mut r = ResourceGraphDefinition::new("web-application", spec);
        r.meta_mut().uid = Some("42".into());
        r
    }

    /// Two nodes referencing each other.
    pub fn cyclic() -> ResourceGraphDefinition {
        let spec = serde_json::from_value(serde_json::json!({
            "schema": {"kind": "Cycle", "apiVersion": "v1alpha1"},
            "resources": [
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
            ],
        }))
        .expect("static fixture");
        let mut r = ResourceGraphDefinition::new("cycle", spec);
        r.meta_mut().uid = Some("43".into());
        r
    }

    pub fn finalized(mut r: ResourceGraphDefinition) -> ResourceGraphDefinition {
        r.finalizers_mut().push(crate::RGD_FINALIZER.into());
        r
    }
}

/// Plan_for builds the plan for a fixture, for tests that exercise CRD synthesis.
pub fn plan_for(rgd: &ResourceGraphDefinition) -> crate::registry::Plan {
    crate::rgds::build_plan(rgd).expect("fixture plans compile")
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

pub struct ApiServerVerifier {
    handle: ApiServerHandle,
}

/// Scenarios we want to test for.
pub enum Scenario {
    /// The first reconcile of a fresh object only installs the finalizer.
    FinalizerCreation(ResourceGraphDefinition),
    /// A rejected definition patches status to Inactive and publishes a warning Event with
    /// the given reason.
    Deactivation(ResourceGraphDefinition, &'static str),
}

impl ApiServerVerifier {
    fn new(handle: ApiServerHandle) -> Self {
        Self { handle }
    }

    /// Tests only get to run specific scenarios that have matching handlers.
    ///
    /// NB: If the controller is making more calls than the scenario handles, the reconciler
    /// sees a `KubeError(Service(Closed(())))`. Await the returned handle (with a timeout)
    /// to ensure every expected call was made.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::FinalizerCreation(r) => self.handle_finalizer_creation(r).await,
                Scenario::Deactivation(r, reason) => {
                    self.handle_status_patch(r.clone(), "Inactive")
                        .await
                        .unwrap()
                        .handle_event(reason)
                        .await
                }
            }
            .expect("scenario completed without errors");
        })
    }

    async fn next_request(&mut self) -> (Request<Body>, tower_test::mock::SendResponse<Response<Body>>) {
        self.handle.next_request().await.expect("service not called")
    }

    async fn handle_finalizer_creation(mut self, r: ResourceGraphDefinition) -> Result<Self> {
        let (request, send) = self.next_request().await;
        // We expect a json patch to the specified document adding our finalizer.
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/kro.run/v1alpha1/resourcegraphdefinitions/{}?",
                r.name_any()
            )
        );
        let expected_patch = json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": vec![crate::RGD_FINALIZER] }
        ]);
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let runtime_patch: Value =
            serde_json::from_slice(&req_body).expect("valid document from runtime");
        assert_json_diff::assert_json_include!(actual: runtime_patch, expected: expected_patch);

        let r = rgd::finalized(r);
        let response = serde_json::to_vec(&r).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());

        Ok(self)
    }

    async fn handle_status_patch(
        mut self,
        mut r: ResourceGraphDefinition,
        expect_state: &str,
    ) -> Result<Self> {
        let (request, send) = self.next_request().await;
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/kro.run/v1alpha1/resourcegraphdefinitions/{}/status?&fieldManager={}&fieldValidation=Strict",
                r.name_any(),
                crate::CONTROLLER_NAME,
            ),
            "unexpected path",
        );

        let req_body = request.into_body().collect_bytes().await.unwrap();
        let body: Value = serde_json::from_slice(&req_body).expect("patch_status object is json");
        let status = body.get("status").expect("status object");
        assert_eq!(
            status.get("state").and_then(Value::as_str),
            Some(expect_state),
            "unexpected state in {status}"
        );

        r.status = serde_json::from_value(status.clone()).ok();
        let response = serde_json::to_vec(&r).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());

        Ok(self)
    }

    /// Tests that the next request is an Event with the expected reason, echoing it back.
    async fn handle_event(mut self, reason: &str) -> Result<Self> {
        let (request, send) = self.next_request().await;
        let uri = request.uri().to_string();
        assert!(
            matches!(*request.method(), http::Method::POST | http::Method::PATCH),
            "unexpected method"
        );
        assert!(
            uri.starts_with("/apis/events.k8s.io/v1/namespaces/default/events"),
            "unexpected path {uri}"
        );

        let req_body = request.into_body().collect_bytes().await.unwrap();
        let event: Value = serde_json::from_slice(&req_body).expect("event object is json");
        assert_eq!(
            event.get("reason").and_then(Value::as_str),
            Some(reason),
            "unexpected reason in {event}"
        );

        let response = serde_json::to_vec(&event).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());

        Ok(self)
    }
}

#[allow(dead_code)]
fn not_found<R: Resource<DynamicType = ()>, S: ToString>(name: S) -> Response<Body> {
    let err = json!({
        "code": 404,
        "status": "Failure",
        "reason": "NotFound",
        "details": {
            "group": R::group(&()),
            "kind": R::kind(&()),
            "name": name.to_string(),
        },
    });
    let response = serde_json::to_vec(&err).unwrap();
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from(response))
        .unwrap()
}

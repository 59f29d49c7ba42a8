#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Controller implements common functionality for the kro controller binary and the
//! controllers themselves: the ResourceGraphDefinition reconciler and the dynamic
//! per-definition instance reconcilers.

use std::{env, pin::Pin, sync::LazyLock, time::Duration};

use futures::Future;
use kube::runtime::events;

/// Prelude is the common types for the controllers.
pub(crate) mod prelude {
    pub use std::{collections::BTreeMap, sync::Arc};

    pub use futures::prelude::*;
    pub use k8s_openapi::{
        apimachinery::pkg::apis::meta::{self, v1::Condition},
        jiff::Timestamp,
    };
    pub use kube::{
        self, Resource, ResourceExt,
        api::{Api, ListParams, Patch, PatchParams},
        runtime::{
            controller::{Action, Controller},
            events::{Event, EventType},
            watcher,
        },
    };
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use api::v1alpha1;

    pub use super::{APPLY_PARAMS, CONTROLLER_NAME, PATCH_PARAMS};
    pub use super::{Context, ControllerFuture, Error, Result, Settings};
    pub use super::{kro_condition, kro_label, now};
}

pub mod accounts;
pub mod crd;
pub mod instances;
pub mod registry;
pub mod render;
pub mod rgds;

pub mod metrics;

#[cfg(test)]
pub(crate) mod testing;

/// Error is the controller-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// TracingConfig indicates the error came from the tracing setup.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates the error came from installing the tracing subscriber.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Kube is a generic error from the `kube` crate.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig indicates the process was unable to find a kubeconfig.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    /// Finalizer wraps an error from the finalizer helper.
    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
    /// Io indicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON indicates a JSON serialization failed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// AddrParse indicates the provided string failed to parse into an address.
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    /// Tokio indicates an error starting tasks.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),

    /// Schema indicates the SimpleSchema section failed to compile.
    #[error("schema error: {0}")]
    Schema(#[from] kro_schema::Error),
    /// Expression indicates an expression failed to parse or type-check.
    #[error("expression error: {0}")]
    Expression(#[from] kro_expr::Error),
    /// Graph indicates resource analysis failed.
    #[error("graph error: {0}")]
    Graph(#[from] kro_graph::Error),
    /// Conflict indicates another definition already serves the requested GVK.
    #[error("registration conflict: {0}")]
    Conflict(String),
    /// Registration indicates the CRD could not be created or updated.
    #[error("registration error: {0}")]
    Registration(String),
    /// DeletionBlocked indicates teardown was refused while instances exist.
    #[error("deletion blocked: {0}")]
    DeletionBlocked(String),
    /// PermissionDenied indicates no service account is configured for a namespace.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// MissingName indicates a name was needed and not provided.
    #[error("missing name for kubernetes object: {0}")]
    MissingName(&'static str),
    /// Reconcile is a per-node failure surfaced on the instance.
    #[error("reconcile error: {0}")]
    Reconcile(String),
    /// Other is a catch-all error.
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result typedef for controllers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Settings carries the tunables of the process; see the `run` subcommand for the flags.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Whether deleting a definition may delete its CRD while instances exist.
    pub allow_crd_deletion: bool,
    /// Sustained client-side request rate, per second.
    pub client_qps: u32,
    /// Request burst allowance.
    pub client_burst: u32,
    /// Whether to run leader election. Currently inert.
    pub enable_leader_election: bool,
    /// Worker count for the definition controller.
    pub rgd_concurrent_reconciles: u16,
    /// Worker count for each dynamic controller.
    pub dynamic_concurrent_reconciles: u16,
    /// Period between full re-walks of every instance.
    pub resync_period: Duration,
    /// Retries before an instance is marked degraded and parked.
    pub queue_max_retries: u32,
    /// Grace period for queue drain at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            allow_crd_deletion: false,
            client_qps: 100,
            client_burst: 150,
            enable_leader_election: false,
            rgd_concurrent_reconciles: 1,
            dynamic_concurrent_reconciles: 1,
            resync_period: Duration::from_secs(36000),
            queue_max_retries: 20,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// Context is common context for the controllers.
pub struct Context {
    /// Client is a k8s client. This should only ever be `clone()`'d out of the Context.
    pub client: kube::Client,
    /// Recorder publishes Kubernetes Events.
    pub recorder: events::Recorder,
    /// Settings are the process tunables.
    pub settings: Settings,
    /// Registry owns the running dynamic controllers.
    pub registry: registry::Registry,
    /// Accounts builds impersonated clients for instance reconciliation.
    pub accounts: std::sync::Arc<accounts::Impersonator>,
}

impl Context {
    /// New assembles a Context from the shared client and the config it was built from.
    ///
    /// The config is kept so per-namespace impersonated clients can be derived from the same
    /// connection settings.
    pub fn new(client: kube::Client, base_config: kube::Config, settings: Settings) -> Context {
        Context {
            recorder: events::Recorder::new(client.clone(), REPORTER.clone()),
            registry: registry::Registry::new(),
            accounts: std::sync::Arc::new(accounts::Impersonator::new(base_config)),
            client,
            settings,
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}

/// ControllerFuture is the type the controller constructors should return.
pub type ControllerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

pub(crate) static REPORTER: LazyLock<events::Reporter> = LazyLock::new(|| events::Reporter {
    controller: CONTROLLER_NAME.to_string(),
    instance: env::var("CONTROLLER_POD_NAME").ok(),
});

/// Condition is like [keyify], but does not force lower-case.
fn condition<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c,
        })
        .for_each(|c| out.push(c));
    out
}

/// Keyify sanitizes the key for use in k8s metadata.
fn keyify<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c.to_ascii_lowercase(),
        })
        .for_each(|c| out.push(c));
    out
}

/// Kro_condition returns the provided argument as a name in the kro controller's space,
/// suitable for use as a condition type.
pub fn kro_condition<S: AsRef<str>>(s: S) -> String {
    condition("kro.run/", s)
}

/// Kro_label returns the provided argument as a name in the kro controller's space, suitable
/// for use as an annotation or label.
pub fn kro_label<S: AsRef<str>>(s: S) -> String {
    keyify("kro.run/", s)
}

/// Now is the current time as a Kubernetes timestamp.
pub fn now() -> k8s_openapi::apimachinery::pkg::apis::meta::v1::Time {
    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(k8s_openapi::jiff::Timestamp::now())
}

/// OWNED_BY_LABEL marks a synthesized CRD with the definition that owns it.
pub static OWNED_BY_LABEL: LazyLock<String> = LazyLock::new(|| kro_label("owned-by"));
/// NODE_ID_LABEL marks an applied object with the graph node that produced it.
pub static NODE_ID_LABEL: LazyLock<String> = LazyLock::new(|| kro_label("node-id"));
/// INSTANCE_LABEL marks an applied object with the uid of the owning instance.
pub static INSTANCE_LABEL: LazyLock<String> = LazyLock::new(|| kro_label("instance-uid"));

/// PATCH_PARAMS is default patch parameters.
pub static PATCH_PARAMS: LazyLock<kube::api::PatchParams> =
    LazyLock::new(|| kube::api::PatchParams::apply(CONTROLLER_NAME));
/// APPLY_PARAMS is patch parameters for applying graph resources, taking ownership of
/// conflicting fields.
pub static APPLY_PARAMS: LazyLock<kube::api::PatchParams> =
    LazyLock::new(|| kube::api::PatchParams::apply(CONTROLLER_NAME).force());

/// CONTROLLER_NAME is the name the controller uses whenever it needs a human-readable name.
pub const CONTROLLER_NAME: &str = "kro-controller";

/// RGD_FINALIZER guards teardown of definitions.
pub static RGD_FINALIZER: &str = "resourcegraphdefinitions.kro.run";
/// INSTANCE_FINALIZER guards teardown of instances of synthesized APIs.
pub static INSTANCE_FINALIZER: &str = "instances.kro.run";

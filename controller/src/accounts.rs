//! Accounts builds the impersonated API clients used for per-instance resource access.
//!
//! Every API call made on behalf of an instance goes through a client impersonating the
//! ServiceAccount configured for the instance's namespace, which bounds the blast radius of
//! one definition to what its accounts may touch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use kube::client::ClientBuilder;
use tracing::debug;

use crate::{Error, Result};

/// Impersonator caches one client per impersonated ServiceAccount.
pub struct Impersonator {
    base: kube::Config,
    cache: Mutex<HashMap<String, kube::Client>>,
}

impl Impersonator {
    /// New creates an impersonator deriving clients from `base`.
    pub fn new(base: kube::Config) -> Impersonator {
        Impersonator {
            base,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Client_for reports the client to use for instances in `namespace`.
    ///
    /// An empty account map means no impersonation was configured and the controller's own
    /// identity (`fallback`) is used. A populated map with neither the namespace nor the
    /// `"*"` wildcard is a permission error, not a fall-through.
    pub fn client_for(
        &self,
        accounts: &BTreeMap<String, String>,
        namespace: &str,
        fallback: &kube::Client,
    ) -> Result<kube::Client> {
        if accounts.is_empty() {
            return Ok(fallback.clone());
        }
        let account = accounts
            .get(namespace)
            .or_else(|| accounts.get("*"))
            .ok_or_else(|| {
                Error::PermissionDenied(format!(
                    "no default service account for namespace {namespace:?}"
                ))
            })?;
        let user = format!("system:serviceaccount:{namespace}:{account}");

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = cache.get(&user) {
            return Ok(client.clone());
        }
        debug!(%user, "building impersonated client");
        let mut config = self.base.clone();
        config.auth_info.impersonate = Some(user.clone());
        let client = ClientBuilder::try_from(config)?.build();
        cache.insert(user, client.clone());
        Ok(client)
    }
}

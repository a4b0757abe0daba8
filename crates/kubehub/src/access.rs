//! Access prober: one self access review per required verb.

#![forbid(unsafe_code)]

use metrics::counter;
use tracing::{debug, warn};

use orka_core::{AccessReview, ApiResourceInfo, PermissionResult, Result, Verb};

use crate::SharedClient;

pub struct AccessProber {
    client: SharedClient,
}

impl AccessProber {
    pub fn new(client: SharedClient) -> Self { Self { client } }

    /// Probe get, list and watch separately. A failed review counts as "not allowed".
    ///
    /// Watches are opened scope-wide, so reviews are never narrowed to a namespace.
    pub async fn probe(&self, resource: &ApiResourceInfo) -> PermissionResult {
        let mut result = PermissionResult::default();
        for verb in Verb::REQUIRED {
            let review = AccessReview {
                group: resource.gvk.group.clone(),
                version: resource.gvk.version.clone(),
                resource: resource.plural.clone(),
                verb,
                namespace: None,
            };
            let allowed = match self.client.self_access(&review).await {
                Ok(allowed) => allowed,
                Err(e) => {
                    warn!(resource = %resource.plural, verb = %verb, error = %e, "access review failed");
                    false
                }
            };
            counter!("cache_permission_probes_total", 1u64, "verb" => verb.as_str());
            result.set(verb, allowed);
        }
        debug!(resource = %resource.plural, access = %result, "access probed");
        result
    }

    /// Probe and fail with `AccessDenied` unless every verb is granted.
    pub async fn check(&self, resource: &ApiResourceInfo) -> Result<PermissionResult> {
        let result = self.probe(resource).await;
        result.ensure(&resource.plural)?;
        Ok(result)
    }
}

//! Reports whether the Deployments of the reconciled instance are ready.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    ResourceExt,
    core::{GroupVersionKind, dynamic::ParseDynamicObjectError},
};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::{
    actions::Action,
    client,
    conditions::{ConditionOptions, types},
    errors::ActionError,
    metadata::labels,
    types::{PlatformObject, ReconciliationRequest},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve the Deployment API resource"))]
    ResolveResource { source: client::Error },

    #[snafu(display("failed to list Deployments matching {selector:?}"))]
    ListDeployments {
        source: client::Error,
        selector: String,
    },

    #[snafu(display("failed to parse Deployment {name:?}"))]
    ParseDeployment {
        source: ParseDynamicObjectError,
        name: String,
    },
}

/// Marks [`types::DEPLOYMENTS_AVAILABLE`] True once every Deployment in the
/// applications namespace matching the selector has all replicas ready.
///
/// The selector defaults to the part-of label carrying the lowercased kind of
/// the instance. Finding no Deployment at all counts as not ready.
#[derive(Debug, Default)]
pub struct DeploymentsAvailableAction {
    selector: Option<(String, String)>,
}

impl DeploymentsAvailableAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selector_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selector = Some((key.into(), value.into()));
        self
    }

    fn selector<T: PlatformObject>(&self) -> String {
        match &self.selector {
            Some((key, value)) => format!("{key}={value}"),
            None => format!("{}={}", labels::PLATFORM_PART_OF, T::kind(&()).to_lowercase()),
        }
    }

    /// Returns the number of ready and of all matching Deployments.
    async fn count<T: PlatformObject>(
        &self,
        rr: &ReconciliationRequest<T>,
    ) -> Result<(usize, usize), Error> {
        let (resource, _) = rr
            .client
            .resolve(&GroupVersionKind::gvk("apps", "v1", "Deployment"))
            .await
            .context(ResolveResourceSnafu)?;

        let selector = self.selector::<T>();
        let objects = rr
            .client
            .list(
                &resource,
                Some(rr.cluster_config.applications_namespace.as_str()),
                Some(selector.as_str()),
            )
            .await
            .context(ListDeploymentsSnafu { selector: &selector })?;

        let total = objects.len();
        let mut ready = 0;
        for object in objects {
            let name = object.name_any();
            let deployment: Deployment = object
                .try_parse()
                .context(ParseDeploymentSnafu { name })?;
            if is_ready(&deployment) {
                ready += 1;
            }
        }

        Ok((ready, total))
    }
}

fn is_ready(deployment: &Deployment) -> bool {
    deployment.status.as_ref().is_none_or(|status| {
        status.ready_replicas.unwrap_or_default() == status.replicas.unwrap_or_default()
    })
}

#[async_trait]
impl<T: PlatformObject> Action<T> for DeploymentsAvailableAction {
    fn name(&self) -> &str {
        "deployments-available"
    }

    async fn run(&self, rr: &mut ReconciliationRequest<T>) -> Result<(), ActionError> {
        let (ready, total) = self.count(rr).await.map_err(ActionError::retryable)?;
        debug!(ready, total, "counted ready deployments");

        let options = ConditionOptions::new()
            .message(format!("{ready}/{total} deployments ready"))
            .observed_generation(rr.instance.generation());
        if total > 0 && ready == total {
            rr.conditions.mark_true(types::DEPLOYMENTS_AVAILABLE, options);
        } else {
            rr.conditions.mark_false(
                types::DEPLOYMENTS_AVAILABLE,
                options.reason(types::REASON_DEPLOYMENTS_NOT_READY),
            );
        }

        Ok(())
    }
}

//! Drives the reconciliation of a single platform resource type.
//!
//! A [`Reconciler`] fetches the instance, maintains the platform finalizer,
//! runs the action [`Pipeline`] and writes phase and conditions back to the
//! instance status. [`reconcile`] and [`error_policy`] plug it into a
//! [`kube::runtime::Controller`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use educe::Educe;
use kube::{
    ResourceExt,
    core::{ApiResource, DynamicObject},
    runtime::controller::Action,
};
use serde_json::json;
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::{
    actions::Pipeline,
    client::{self, ClusterClient},
    conditions::{ConditionOptions, Manager, types},
    errors::{ActionError, BoxError},
    logging::ReconcilerError,
    metadata::PLATFORM_FINALIZER,
    release::Release,
    types::{ClusterConfigSource, PlatformObject, ReconciliationRequest},
};

/// Delay before the first retry of a failed reconciliation.
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Upper bound of the retry delay.
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

#[derive(Debug, EnumDiscriminants, Snafu)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get {kind} {name:?}"))]
    GetInstance {
        source: client::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to deserialize {kind} {name:?}"))]
    DeserializeInstance {
        source: serde_json::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to load the cluster configuration"))]
    LoadClusterConfig { source: BoxError },

    #[snafu(display("failed to update the finalizers of {name:?}"))]
    UpdateFinalizers { source: client::Error, name: String },

    #[snafu(display("failed to finalize {name:?}"))]
    Finalize { source: ActionError, name: String },

    #[snafu(display("provisioning failed"))]
    Provision { source: ActionError },

    #[snafu(display("failed to serialize the status of {name:?}"))]
    SerializeStatus {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to update the status of {name:?}"))]
    UpdateStatus { source: client::Error, name: String },
}

impl Error {
    /// True if the pipeline asked to stop instead of being retried.
    pub fn is_stop(&self) -> bool {
        match self {
            Self::Provision { source } | Self::Finalize { source, .. } => source.is_stop(),
            _ => false,
        }
    }
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// Reconciles instances of `T` with a fixed action pipeline.
#[derive(Educe)]
#[educe(Debug)]
pub struct Reconciler<T> {
    name: String,
    #[educe(Debug(ignore))]
    client: Arc<dyn ClusterClient>,
    #[educe(Debug(ignore))]
    cluster_config: Arc<dyn ClusterConfigSource>,
    release: Release,
    dependents: Vec<String>,
    pipeline: Pipeline<T>,
    finalizer: Option<Pipeline<T>>,
    #[educe(Debug(ignore))]
    failures: Mutex<HashMap<String, u32>>,
}

impl<T: PlatformObject> Reconciler<T> {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ClusterClient>,
        cluster_config: Arc<dyn ClusterConfigSource>,
        release: Release,
        pipeline: Pipeline<T>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            cluster_config,
            release,
            dependents: Vec::new(),
            pipeline,
            finalizer: None,
            failures: Mutex::default(),
        }
    }

    /// Adds conditions the `Ready` condition depends on, next to
    /// `ProvisioningSucceeded`.
    pub fn with_dependents(mut self, dependents: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependents.extend(dependents.into_iter().map(Into::into));
        self
    }

    /// Actions run when an instance is deleted. Registering them makes the
    /// reconciler add the platform finalizer to every instance.
    pub fn with_finalizer(mut self, pipeline: Pipeline<T>) -> Self {
        self.finalizer = Some(pipeline);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs one reconciliation of the instance `name`.
    ///
    /// Instances which no longer exist are ignored. Successful runs wait for
    /// the next change, failed runs return the error so that
    /// [`Self::error_policy`] can decide about the retry.
    pub async fn reconcile(&self, name: &str, namespace: Option<&str>) -> Result<Action, Error> {
        let resource = ApiResource::erase::<T>(&());
        let Some(object) = self
            .client
            .get(&resource, namespace, name)
            .await
            .context(GetInstanceSnafu {
                kind: &resource.kind,
                name,
            })?
        else {
            debug!(reconciler = %self.name, name, "instance is gone");
            self.forget(namespace, name);
            return Ok(Action::await_change());
        };
        let instance: T = from_dynamic(&object).context(DeserializeInstanceSnafu {
            kind: &resource.kind,
            name,
        })?;

        if instance.meta().deletion_timestamp.is_some() {
            self.delete(&resource, instance).await?;
        } else {
            self.apply(&resource, instance).await?;
        }

        self.forget(namespace, name);
        Ok(Action::await_change())
    }

    /// Picks the next [`Action`] after a failed reconciliation.
    ///
    /// Stopped pipelines wait for the next change of the instance. Other
    /// failures are retried after an exponential backoff which starts at
    /// [`BACKOFF_BASE`] and is capped at [`BACKOFF_MAX`].
    pub fn error_policy(&self, name: &str, namespace: Option<&str>, error: &Error) -> Action {
        if error.is_stop() {
            return Action::await_change();
        }

        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(object_key(namespace, name)).or_default();
        *count = count.saturating_add(1);
        let delay = backoff(*count);
        warn!(
            reconciler = %self.name,
            name,
            failures = *count,
            retry_in = ?delay,
            error = error as &dyn std::error::Error,
            "reconciliation failed"
        );
        Action::requeue(delay)
    }

    fn forget(&self, namespace: Option<&str>, name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&object_key(namespace, name));
    }

    async fn request(&self, instance: T) -> Result<ReconciliationRequest<T>, BoxError> {
        let cluster_config = self.cluster_config.cluster_config().await?;
        let conditions = Manager::new(
            PlatformObject::conditions(&instance),
            types::READY,
            std::iter::once(types::PROVISIONING_SUCCEEDED.to_owned())
                .chain(self.dependents.iter().cloned()),
        );
        Ok(ReconciliationRequest::new(
            self.client.clone(),
            instance,
            Arc::new(cluster_config),
            self.release.clone(),
            conditions,
        ))
    }

    async fn delete(&self, resource: &ApiResource, instance: T) -> Result<(), Error> {
        let name = instance.name_any();
        if !instance.finalizers().iter().any(|f| f == PLATFORM_FINALIZER) {
            return Ok(());
        }

        if let Some(finalizer) = &self.finalizer {
            let mut rr = self.request(instance.clone()).await.context(LoadClusterConfigSnafu)?;
            match finalizer.run(&mut rr).await {
                Ok(()) => {}
                Err(err) if err.is_stop() => {
                    info!(reconciler = %self.name, %name, reason = %err.cause_message(), "finalization stopped");
                }
                Err(source) => return Err(Error::Finalize { source, name }),
            }
        }

        let finalizers: Vec<&String> = instance
            .finalizers()
            .iter()
            .filter(|f| *f != PLATFORM_FINALIZER)
            .collect();
        self.update_finalizers(resource, &instance, &finalizers).await?;
        info!(reconciler = %self.name, %name, "instance finalized");
        Ok(())
    }

    async fn update_finalizers(
        &self,
        resource: &ApiResource,
        instance: &T,
        finalizers: &[&String],
    ) -> Result<(), Error> {
        let name = instance.name_any();
        self.client
            .merge_patch(
                resource,
                instance.meta().namespace.as_deref(),
                &name,
                &json!({"metadata": {"finalizers": finalizers}}),
            )
            .await
            .context(UpdateFinalizersSnafu { name })?;
        Ok(())
    }

    async fn apply(&self, resource: &ApiResource, instance: T) -> Result<(), Error> {
        let name = instance.name_any();
        let generation = PlatformObject::generation(&instance);

        if self.finalizer.is_some()
            && !instance.finalizers().iter().any(|f| f == PLATFORM_FINALIZER)
        {
            let finalizer = PLATFORM_FINALIZER.to_owned();
            let finalizers: Vec<&String> =
                instance.finalizers().iter().chain([&finalizer]).collect();
            self.update_finalizers(resource, &instance, &finalizers).await?;
        }

        let (mut instance, mut conditions, provisioned) = match self.request(instance.clone()).await {
            Ok(mut rr) => {
                rr.conditions.reset();
                let result = self.pipeline.run(&mut rr).await;
                (rr.instance, rr.conditions, result)
            }
            Err(err) => {
                let conditions = Manager::new(
                    PlatformObject::conditions(&instance),
                    types::READY,
                    [types::PROVISIONING_SUCCEEDED],
                );
                let err = Error::LoadClusterConfig { source: err };
                (instance, conditions, Err(ActionError::retryable(err)))
            }
        };

        let options = ConditionOptions::new();
        match &provisioned {
            Ok(()) => conditions.mark_true(
                types::PROVISIONING_SUCCEEDED,
                options.observed_generation(generation),
            ),
            Err(err) if err.is_stop() => conditions.mark_false(
                types::PROVISIONING_SUCCEEDED,
                options
                    .reason(types::REASON_STOPPED)
                    .message(err.cause_message())
                    .observed_generation(generation),
            ),
            Err(err) => conditions.mark_false(
                types::PROVISIONING_SUCCEEDED,
                options.error(err.cause()).observed_generation(generation),
            ),
        }
        conditions.recompute_happiness("");
        conditions.sort();

        let happy = conditions.is_happy();
        let status = instance.status_mut();
        if happy {
            status.phase = Some(types::PHASE_READY.to_owned());
            status.observed_generation = Some(generation);
        } else {
            status.phase = Some(types::PHASE_NOT_READY.to_owned());
        }
        status.conditions = conditions.into_conditions();

        let status = serde_json::to_value(&*status).context(SerializeStatusSnafu { name: &name })?;
        match self
            .client
            .patch_status(resource, instance.meta().namespace.as_deref(), &name, &status)
            .await
        {
            Err(err) if err.is_not_found() => {
                debug!(reconciler = %self.name, %name, "instance deleted before its status was updated");
            }
            result => result.context(UpdateStatusSnafu { name: &name })?,
        }

        provisioned.context(ProvisionSnafu)
    }
}

/// The reconcile function of a [`kube::runtime::Controller`] driven by `reconciler`.
pub async fn reconcile<T: PlatformObject>(
    instance: Arc<T>,
    reconciler: Arc<Reconciler<T>>,
) -> Result<Action, Error> {
    reconciler
        .reconcile(&instance.name_any(), instance.meta().namespace.as_deref())
        .await
}

/// The error policy of a [`kube::runtime::Controller`] driven by `reconciler`.
pub fn error_policy<T: PlatformObject>(
    instance: Arc<T>,
    error: &Error,
    reconciler: Arc<Reconciler<T>>,
) -> Action {
    reconciler.error_policy(&instance.name_any(), instance.meta().namespace.as_deref(), error)
}

fn backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1 << exponent).min(BACKOFF_MAX)
}

fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) => format!("{namespace}/{name}"),
        None => name.to_owned(),
    }
}

fn from_dynamic<T: PlatformObject>(object: &DynamicObject) -> serde_json::Result<T> {
    serde_json::from_value(serde_json::to_value(object)?)
}

//! Features: named bundles of manifests applied and removed as a unit.
//!
//! A [`Feature`] is gated by preconditions which must hold before anything is
//! rendered, and by postconditions which must hold once its manifests are
//! applied. Every applied object is owned by the feature's [`FeatureTracker`],
//! so removing the tracker with foreground propagation removes the feature.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use educe::Educe;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    ResourceExt,
    core::{ApiResource, DynamicObject},
};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, info};

use crate::{
    client::{self, ClusterClient, DeletePropagation, Scope, object_gvk},
    errors::{BoxError, MultiError, full_message},
    feature::{
        manifest::Manifest,
        tracker::{FeatureTracker, FeatureTrackerStatus, Reason, Source},
    },
    metadata::{self, annotations},
};

pub mod conditions;
pub mod handler;
pub mod manifest;
pub mod tracker;

pub use handler::{FeaturesAction, FeaturesHandler};

/// Template data key always holding the namespace the feature is applied to.
pub const TARGET_NAMESPACE_KEY: &str = "TargetNamespace";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("feature {feature:?} has no client to talk to the cluster"))]
    MissingClient { feature: String },

    #[snafu(display("feature {feature:?} has no target namespace"))]
    MissingTargetNamespace { feature: String },

    #[snafu(display("failed to evaluate whether feature {feature:?} is enabled"))]
    EvaluateEnabled { source: BoxError, feature: String },

    #[snafu(display("preconditions of feature {feature:?} are not met"))]
    PreConditions { source: MultiError, feature: String },

    #[snafu(display("failed to load template data {key:?} of feature {feature:?}"))]
    LoadTemplateData {
        source: BoxError,
        feature: String,
        key: String,
    },

    #[snafu(display("failed to create resources of feature {feature:?}"))]
    ResourceCreation { source: BoxError, feature: String },

    #[snafu(display("failed to process manifest {manifest:?}"))]
    ProcessManifest {
        source: manifest::Error,
        manifest: String,
    },

    #[snafu(display("object {name:?} of manifest {manifest:?} has no apiVersion or kind"))]
    MissingType { manifest: String, name: String },

    #[snafu(display("failed to resolve the API resource of {kind}"))]
    ResolveResource { source: client::Error, kind: String },

    #[snafu(display("failed to look up {kind} {name:?}"))]
    GetObject {
        source: client::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to apply {kind} {name:?}"))]
    ApplyObject {
        source: client::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to serialize patch for {kind} {name:?}"))]
    SerializePatch {
        source: serde_json::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to patch {kind} {name:?}"))]
    PatchObject {
        source: client::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("postconditions of feature {feature:?} are not met"))]
    PostConditions { source: MultiError, feature: String },

    #[snafu(display("failed to clean up feature {feature:?}"))]
    Cleanup { source: MultiError, feature: String },

    #[snafu(display("failed to convert FeatureTracker {name:?}"))]
    ConvertTracker {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to apply FeatureTracker {name:?}"))]
    ApplyTracker { source: client::Error, name: String },

    #[snafu(display("FeatureTracker {name:?} was applied without a UID"))]
    MissingTrackerUid { name: String },

    #[snafu(display("failed to update the status of FeatureTracker {name:?}"))]
    UpdateTrackerStatus { source: client::Error, name: String },

    #[snafu(display("failed to delete FeatureTracker {name:?}"))]
    DeleteTracker { source: client::Error, name: String },
}

impl Error {
    /// The step of the apply protocol which failed.
    pub fn reason(&self) -> Reason {
        match self {
            Self::PreConditions { .. } => Reason::PreConditions,
            Self::LoadTemplateData { .. } => Reason::LoadTemplateData,
            Self::ResourceCreation { .. } => Reason::ResourceCreation,
            Self::ProcessManifest { .. }
            | Self::MissingType { .. }
            | Self::ResolveResource { .. }
            | Self::GetObject { .. }
            | Self::ApplyObject { .. }
            | Self::SerializePatch { .. }
            | Self::PatchObject { .. } => Reason::ApplyManifests,
            Self::PostConditions { .. } => Reason::PostConditions,
            _ => Reason::FailedApplying,
        }
    }
}

/// A step run against a feature: a pre- or postcondition, a resource
/// creator or a cleanup hook.
#[async_trait]
pub trait FeatureAction: Send + Sync {
    async fn run(&self, feature: &Feature) -> Result<(), BoxError>;
}

#[async_trait]
impl<F> FeatureAction for F
where
    F: Fn(&Feature) -> Result<(), BoxError> + Send + Sync,
{
    async fn run(&self, feature: &Feature) -> Result<(), BoxError> {
        self(feature)
    }
}

/// Computes the value of one template variable.
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn load(&self, feature: &Feature) -> Result<Value, BoxError>;
}

#[async_trait]
impl<F> DataProvider for F
where
    F: Fn(&Feature) -> Result<Value, BoxError> + Send + Sync,
{
    async fn load(&self, feature: &Feature) -> Result<Value, BoxError> {
        self(feature)
    }
}

type EnabledPredicate = Box<dyn Fn(&Feature) -> Result<bool, BoxError> + Send + Sync>;

#[derive(Educe)]
#[educe(Debug)]
pub struct Feature {
    name: String,
    source: Source,
    target_namespace: String,
    app_namespace: String,
    managed: bool,
    owner: Option<OwnerReference>,
    manifests: Vec<Manifest>,

    #[educe(Debug(ignore))]
    client: Arc<dyn ClusterClient>,
    #[educe(Debug(ignore))]
    data_providers: Vec<(String, Box<dyn DataProvider>)>,
    #[educe(Debug(ignore))]
    enabled: Option<EnabledPredicate>,
    #[educe(Debug(ignore))]
    resources: Vec<Box<dyn FeatureAction>>,
    #[educe(Debug(ignore))]
    preconditions: Vec<Box<dyn FeatureAction>>,
    #[educe(Debug(ignore))]
    postconditions: Vec<Box<dyn FeatureAction>>,
    #[educe(Debug(ignore))]
    cleanups: Vec<Box<dyn FeatureAction>>,
}

impl Feature {
    pub fn define(name: impl Into<String>) -> FeatureBuilder {
        FeatureBuilder {
            name: name.into(),
            source: Source::default(),
            target_namespace: None,
            app_namespace: None,
            managed: false,
            owner: None,
            client: None,
            manifests: Vec::new(),
            data_providers: Vec::new(),
            enabled: None,
            resources: Vec::new(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            cleanups: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn target_namespace(&self) -> &str {
        &self.target_namespace
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn client(&self) -> &dyn ClusterClient {
        self.client.as_ref()
    }

    pub fn tracker_name(&self) -> String {
        FeatureTracker::name_for(&self.app_namespace, &self.name)
    }

    pub fn is_enabled(&self) -> Result<bool, Error> {
        match &self.enabled {
            Some(enabled) => enabled(self).context(EvaluateEnabledSnafu {
                feature: &self.name,
            }),
            None => Ok(true),
        }
    }

    /// Applies the feature, or cleans it up if it is disabled.
    ///
    /// The outcome is reported in the status of the feature's tracker.
    pub async fn apply(&self) -> Result<(), Error> {
        if !self.is_enabled()? {
            debug!(feature = %self.name, "feature is disabled, cleaning up");
            return self.cleanup().await;
        }

        let (tracker, previous) = self.ensure_tracker().await?;
        let progressing = FeatureTrackerStatus::progressing(&self.name, previous.as_ref());
        self.update_tracker_status(&progressing).await?;

        let result = self.apply_feature(&tracker).await;
        let status = match &result {
            Ok(()) => {
                info!(feature = %self.name, "feature applied");
                FeatureTrackerStatus::ready(&self.name, &progressing)
            }
            Err(err) => FeatureTrackerStatus::failed(
                &self.name,
                &progressing,
                err.reason(),
                &full_message(err),
            ),
        };
        let reported = self.update_tracker_status(&status).await;

        result?;
        reported
    }

    /// Runs the cleanup hooks and removes the tracker, together with every
    /// object it owns.
    pub async fn cleanup(&self) -> Result<(), Error> {
        let errors = self.run_all(&self.cleanups).await;
        let removed = self.remove_tracker().await;

        MultiError::from_errors(errors).context(CleanupSnafu {
            feature: &self.name,
        })?;
        removed
    }

    async fn apply_feature(&self, tracker: &OwnerReference) -> Result<(), Error> {
        let errors = self.run_all(&self.preconditions).await;
        MultiError::from_errors(errors).context(PreConditionsSnafu {
            feature: &self.name,
        })?;

        let mut data = BTreeMap::from([(
            TARGET_NAMESPACE_KEY.to_owned(),
            Value::String(self.target_namespace.clone()),
        )]);
        for (key, provider) in &self.data_providers {
            let value = provider
                .load(self)
                .await
                .context(LoadTemplateDataSnafu {
                    feature: &self.name,
                    key,
                })?;
            data.insert(key.clone(), value);
        }

        for create in &self.resources {
            create.run(self).await.context(ResourceCreationSnafu {
                feature: &self.name,
            })?;
        }

        for manifest in &self.manifests {
            self.apply_manifest(manifest, &data, tracker).await?;
        }

        let errors = self.run_all(&self.postconditions).await;
        MultiError::from_errors(errors).context(PostConditionsSnafu {
            feature: &self.name,
        })
    }

    async fn run_all(&self, actions: &[Box<dyn FeatureAction>]) -> Vec<BoxError> {
        let mut errors = Vec::new();
        for action in actions {
            if let Err(err) = action.run(self).await {
                errors.push(err);
            }
        }
        errors
    }

    async fn apply_manifest(
        &self,
        manifest: &Manifest,
        data: &BTreeMap<String, Value>,
        tracker: &OwnerReference,
    ) -> Result<(), Error> {
        let objects = manifest.process(data).context(ProcessManifestSnafu {
            manifest: manifest.name(),
        })?;

        for mut object in objects {
            let name = object.name_any();
            let gvk = object_gvk(&object).context(MissingTypeSnafu {
                manifest: manifest.name(),
                name: &name,
            })?;
            let (resource, scope) =
                self.client
                    .resolve(&gvk)
                    .await
                    .context(ResolveResourceSnafu { kind: &gvk.kind })?;

            match scope {
                Scope::Namespaced if object.metadata.namespace.is_none() => {
                    object.metadata.namespace = Some(self.target_namespace.clone());
                }
                Scope::Namespaced => {}
                Scope::Cluster => object.metadata.namespace = None,
            }

            if manifest.is_patch() {
                self.patch(&resource, &object).await?;
            } else {
                self.create_or_update(&resource, object, tracker).await?;
            }
        }
        Ok(())
    }

    async fn patch(&self, resource: &ApiResource, object: &DynamicObject) -> Result<(), Error> {
        let name = object.name_any();
        let patch = serde_json::to_value(object).context(SerializePatchSnafu {
            kind: &resource.kind,
            name: &name,
        })?;

        debug!(feature = %self.name, k8s.object.kind = %resource.kind, k8s.object.name = %name, "patching object");
        self.client
            .merge_patch(resource, object.namespace().as_deref(), &name, &patch)
            .await
            .context(PatchObjectSnafu {
                kind: &resource.kind,
                name: &name,
            })?;
        Ok(())
    }

    /// Objects marked as unmanaged are never touched. Unless the feature is
    /// managed, existing objects are only updated if they are marked as managed.
    async fn create_or_update(
        &self,
        resource: &ApiResource,
        mut object: DynamicObject,
        tracker: &OwnerReference,
    ) -> Result<(), Error> {
        let name = object.name_any();
        let namespace = object.namespace();

        let existing = self
            .client
            .get(resource, namespace.as_deref(), &name)
            .await
            .context(GetObjectSnafu {
                kind: &resource.kind,
                name: &name,
            })?;
        if let Some(existing) = existing {
            let marker = metadata::annotation(&existing.metadata, annotations::MANAGED_BY_ODH_OPERATOR);
            if marker == Some("false") || (!self.managed && marker != Some("true")) {
                debug!(
                    feature = %self.name,
                    k8s.object.kind = %resource.kind,
                    k8s.object.name = %name,
                    "object exists and is not managed, skipping"
                );
                return Ok(());
            }
        }

        if self.managed {
            metadata::set_annotation(
                &mut object.metadata,
                annotations::MANAGED_BY_ODH_OPERATOR,
                "true",
            );
        }
        let references = object.owner_references_mut();
        references.retain(|reference| reference.uid != tracker.uid);
        references.push(tracker.clone());

        self.client
            .apply(resource, &object)
            .await
            .context(ApplyObjectSnafu {
                kind: &resource.kind,
                name: &name,
            })?;
        Ok(())
    }

    /// Creates or updates the tracker, returning a reference to it and its
    /// status before this call.
    async fn ensure_tracker(&self) -> Result<(OwnerReference, Option<FeatureTrackerStatus>), Error> {
        let resource = FeatureTracker::api_resource();
        let name = self.tracker_name();

        let tracker = FeatureTracker::for_feature(
            &self.name,
            self.source.clone(),
            &self.app_namespace,
            self.owner.clone(),
        );
        let object = tracker
            .to_dynamic()
            .context(ConvertTrackerSnafu { name: &name })?;
        let applied = self
            .client
            .apply(&resource, &object)
            .await
            .context(ApplyTrackerSnafu { name: &name })?;

        let applied =
            FeatureTracker::from_dynamic(&applied).context(ConvertTrackerSnafu { name: &name })?;
        let owner = applied
            .to_owner_reference()
            .context(MissingTrackerUidSnafu { name: &name })?;
        Ok((owner, applied.status))
    }

    async fn update_tracker_status(&self, status: &FeatureTrackerStatus) -> Result<(), Error> {
        let name = self.tracker_name();
        let status = serde_json::to_value(status).context(ConvertTrackerSnafu { name: &name })?;

        self.client
            .patch_status(&FeatureTracker::api_resource(), None, &name, &status)
            .await
            .context(UpdateTrackerStatusSnafu { name })
    }

    async fn remove_tracker(&self) -> Result<(), Error> {
        let name = self.tracker_name();
        match self
            .client
            .delete(
                &FeatureTracker::api_resource(),
                None,
                &name,
                DeletePropagation::Foreground,
            )
            .await
        {
            Err(err) if err.is_not_found() => Ok(()),
            result => result.context(DeleteTrackerSnafu { name }),
        }
    }
}

/// Builds a [`Feature`], see [`Feature::define`].
pub struct FeatureBuilder {
    name: String,
    source: Source,
    target_namespace: Option<String>,
    app_namespace: Option<String>,
    managed: bool,
    owner: Option<OwnerReference>,
    client: Option<Arc<dyn ClusterClient>>,
    manifests: Vec<Manifest>,
    data_providers: Vec<(String, Box<dyn DataProvider>)>,
    enabled: Option<EnabledPredicate>,
    resources: Vec<Box<dyn FeatureAction>>,
    preconditions: Vec<Box<dyn FeatureAction>>,
    postconditions: Vec<Box<dyn FeatureAction>>,
    cleanups: Vec<Box<dyn FeatureAction>>,
}

impl FeatureBuilder {
    pub fn source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    pub fn target_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.target_namespace = Some(namespace.into());
        self
    }

    /// The namespace the tracker name is derived from. Defaults to the target
    /// namespace.
    pub fn app_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.app_namespace = Some(namespace.into());
        self
    }

    pub fn manifests(mut self, manifests: impl IntoIterator<Item = Manifest>) -> Self {
        self.manifests.extend(manifests);
        self
    }

    /// Makes the value computed by `provider` available to templates as `key`.
    pub fn with_data(mut self, key: impl Into<String>, provider: impl DataProvider + 'static) -> Self {
        self.data_providers.push((key.into(), Box::new(provider)));
        self
    }

    pub fn enabled_when(
        mut self,
        enabled: impl Fn(&Feature) -> Result<bool, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.enabled = Some(Box::new(enabled));
        self
    }

    pub fn with_resources(mut self, create: impl FeatureAction + 'static) -> Self {
        self.resources.push(Box::new(create));
        self
    }

    /// Adds a check which must pass before anything is applied. All
    /// preconditions run, their errors are reported together.
    pub fn pre_conditions(mut self, check: impl FeatureAction + 'static) -> Self {
        self.preconditions.push(Box::new(check));
        self
    }

    /// Adds a check run once all manifests are applied.
    pub fn post_conditions(mut self, check: impl FeatureAction + 'static) -> Self {
        self.postconditions.push(Box::new(check));
        self
    }

    /// Adds a hook run before the tracker is removed.
    pub fn on_delete(mut self, cleanup: impl FeatureAction + 'static) -> Self {
        self.cleanups.push(Box::new(cleanup));
        self
    }

    /// Applied objects are marked as managed and always overwritten.
    pub fn managed(mut self) -> Self {
        self.managed = true;
        self
    }

    /// The owner of the tracker, usually the reconciled instance.
    pub fn owned_by(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn using_client(mut self, client: Arc<dyn ClusterClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn create(self) -> Result<Feature, Error> {
        let client = self.client.context(MissingClientSnafu {
            feature: &self.name,
        })?;
        let target_namespace = self
            .target_namespace
            .filter(|namespace| !namespace.is_empty())
            .context(MissingTargetNamespaceSnafu {
                feature: &self.name,
            })?;
        let app_namespace = self
            .app_namespace
            .unwrap_or_else(|| target_namespace.clone());
        ensure!(!app_namespace.is_empty(), MissingTargetNamespaceSnafu {
            feature: &self.name
        });

        Ok(Feature {
            name: self.name,
            source: self.source,
            target_namespace,
            app_namespace,
            managed: self.managed,
            owner: self.owner,
            manifests: self.manifests,
            client,
            data_providers: self.data_providers,
            enabled: self.enabled,
            resources: self.resources,
            preconditions: self.preconditions,
            postconditions: self.postconditions,
            cleanups: self.cleanups,
        })
    }
}

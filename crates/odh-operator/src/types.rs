//! The data shared by all actions of a single reconciliation.

use std::{fmt::Display, ops::ControlFlow, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use kube::{Resource, ResourceExt, core::DynamicObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

use crate::{
    client::ClusterClient,
    conditions::{Condition, HasStatusCondition, Manager},
    errors::BoxError,
    release::Release,
};

/// Status shared by all platform resources.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// The `.metadata.generation` last reconciled successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HasStatusCondition for PlatformStatus {
    fn conditions(&self) -> Vec<Condition> {
        self.conditions.clone()
    }

    fn set_conditions(&mut self, conditions: Vec<Condition>) {
        self.conditions = conditions;
    }
}

/// Developer overrides of the manifests a component is deployed from.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevFlags {
    #[serde(default)]
    pub manifests: Vec<ManifestsConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestsConfig {
    /// Location of a tarball containing the manifests.
    pub uri: String,

    #[serde(default)]
    pub context_dir: String,

    #[serde(default)]
    pub source_path: String,
}

/// The capabilities every reconciled custom resource provides.
///
/// Generation, UID and name come from the object metadata, the remaining
/// accessors have to be implemented per resource type.
pub trait PlatformObject:
    Resource<DynamicType = ()> + Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn status(&self) -> Option<&PlatformStatus>;

    fn status_mut(&mut self) -> &mut PlatformStatus;

    fn dev_flags(&self) -> Option<&DevFlags> {
        None
    }

    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or_default()
    }

    fn conditions(&self) -> Vec<Condition> {
        self.status()
            .map(|status| status.conditions.clone())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMeshControlPlane {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub metrics_collection: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMeshConfig {
    pub management_state: String,
    pub control_plane: ServiceMeshControlPlane,
}

impl ServiceMeshConfig {
    pub fn is_managed(&self) -> bool {
        self.management_state == "Managed"
    }
}

/// Cluster wide settings, read-only for the duration of a reconciliation.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub applications_namespace: String,

    #[serde(default)]
    pub service_mesh: Option<ServiceMeshConfig>,
}

/// Provides the [`ClusterConfig`] at the start of every reconciliation.
#[async_trait]
pub trait ClusterConfigSource: Send + Sync {
    async fn cluster_config(&self) -> Result<ClusterConfig, BoxError>;
}

#[async_trait]
impl ClusterConfigSource for ClusterConfig {
    async fn cluster_config(&self) -> Result<ClusterConfig, BoxError> {
        Ok(self.clone())
    }
}

/// A kustomize style manifest location consumed by the renderer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ManifestInfo {
    pub path: String,
    pub context_dir: String,
    pub source_path: String,
}

impl Display for ManifestInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path: PathBuf = [&self.path, &self.context_dir, &self.source_path]
            .into_iter()
            .filter(|segment| !segment.is_empty())
            .collect();
        write!(f, "{}", path.display())
    }
}

/// A template consumed by the renderer, with metadata added to every object
/// it renders.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TemplateInfo {
    pub path: String,
    pub labels: std::collections::BTreeMap<String, String>,
    pub annotations: std::collections::BTreeMap<String, String>,
}

/// Everything a single reconciliation of `T` works on.
///
/// Created per watch event and dropped once the pipeline finished.
pub struct ReconciliationRequest<T> {
    pub client: Arc<dyn ClusterClient>,
    pub instance: T,
    pub cluster_config: Arc<ClusterConfig>,
    pub release: Release,
    pub manifests: Vec<ManifestInfo>,
    pub templates: Vec<TemplateInfo>,

    /// The rendered desired state, in apply order.
    pub resources: Vec<DynamicObject>,
    pub conditions: Manager,

    /// Set by the renderer once [`Self::resources`] hold a full render.
    /// Garbage collection is skipped otherwise.
    pub generated: bool,
}

impl<T: PlatformObject> ReconciliationRequest<T> {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        instance: T,
        cluster_config: Arc<ClusterConfig>,
        release: Release,
        conditions: Manager,
    ) -> Self {
        Self {
            client,
            instance,
            cluster_config,
            release,
            manifests: Vec::new(),
            templates: Vec::new(),
            resources: Vec::new(),
            conditions,
            generated: false,
        }
    }

    pub fn add_resources(&mut self, resources: impl IntoIterator<Item = DynamicObject>) {
        self.resources.extend(resources);
    }

    /// Calls `f` on every resource in order until it returns
    /// [`ControlFlow::Break`] or an error.
    pub fn for_each_resource<E>(
        &mut self,
        mut f: impl FnMut(&mut DynamicObject) -> Result<ControlFlow<()>, E>,
    ) -> Result<(), E> {
        for resource in &mut self.resources {
            if f(resource)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Removes the resources matching `predicate`, returning how many were removed.
    pub fn remove_resources(&mut self, mut predicate: impl FnMut(&DynamicObject) -> bool) -> usize {
        let before = self.resources.len();
        self.resources.retain(|resource| !predicate(resource));
        before - self.resources.len()
    }

    /// A digest of the inputs of the render, usable as a cache key.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.instance.uid().unwrap_or_default());
        hasher.update(self.instance.generation().to_le_bytes());
        hasher.update(self.release.name.to_string());
        hasher.update(self.release.version.to_string());

        for manifest in &self.manifests {
            hasher.update(manifest.to_string());
        }
        for template in &self.templates {
            hasher.update(&template.path);
        }

        format!("{:x}", hasher.finalize())
    }
}

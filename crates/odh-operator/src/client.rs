//! Access to the Kubernetes API.
//!
//! Everything that talks to the cluster goes through the [`ClusterClient`]
//! trait. [`Client`] implements it on top of a [`kube::Client`]; tests use an
//! in-memory implementation instead.

use async_trait::async_trait;
use k8s_openapi::{
    api::authorization::v1::{ResourceRule, SelfSubjectRulesReview, SelfSubjectRulesReviewSpec},
    apimachinery::pkg::apis::meta::v1::APIResourceList,
};
use kube::{
    Api,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery,
    error::DiscoveryError,
};
use snafu::{IntoError, OptionExt, ResultExt, Snafu};
use tracing::warn;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{kind} {name:?} not found"))]
    NotFound { kind: String, name: String },

    #[snafu(display("access to {kind} is forbidden: {message}"))]
    Forbidden { kind: String, message: String },

    #[snafu(display("method not allowed on {kind}"))]
    MethodNotAllowed { kind: String },

    #[snafu(display("{kind} {name:?} already exists"))]
    AlreadyExists { kind: String, name: String },

    #[snafu(display("conflict while writing {kind} {name:?}: {message}"))]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    #[snafu(display("failed to {verb} {kind} {name:?}"))]
    Request {
        source: kube::Error,
        verb: &'static str,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to retrieve the API resources supported by the server"))]
    Discovery { source: kube::Error },

    #[snafu(display("failed to resolve the API resource of {gvk}"))]
    ResolveResource { source: kube::Error, gvk: String },

    #[snafu(display(
        "failed to create a SelfSubjectRulesReview in namespace {namespace:?}"
    ))]
    CreateRulesReview {
        source: kube::Error,
        namespace: String,
    },

    #[snafu(display("rules review in namespace {namespace:?} failed: {message}"))]
    RulesEvaluation { namespace: String, message: String },

    #[snafu(display("object of kind {kind} has no name"))]
    MissingName { kind: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }

    pub fn is_method_not_allowed(&self) -> bool {
        matches!(self, Self::MethodNotAllowed { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Classifies a failed type lookup. An unknown group version or kind is
    /// reported as [`Error::NotFound`] with an empty name.
    fn from_discovery(source: kube::Error, gvk: &GroupVersionKind) -> Self {
        let missing = match &source {
            kube::Error::Api(status) => status.code == 404,
            kube::Error::Discovery(err) => matches!(
                err,
                DiscoveryError::MissingKind(_)
                    | DiscoveryError::MissingResource(_)
                    | DiscoveryError::MissingApiGroup(_)
            ),
            _ => false,
        };
        if missing {
            return Self::NotFound {
                kind: gvk.kind.clone(),
                name: String::new(),
            };
        }
        ResolveResourceSnafu {
            gvk: format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind),
        }
        .into_error(source)
    }

    /// Maps well-known API status codes onto dedicated variants.
    fn from_kube(source: kube::Error, verb: &'static str, kind: &str, name: &str) -> Self {
        let kind = kind.to_owned();
        let name = name.to_owned();
        match &source {
            kube::Error::Api(status) if status.code == 404 => Self::NotFound { kind, name },
            kube::Error::Api(status) if status.code == 403 => Self::Forbidden {
                kind,
                message: status.message.clone(),
            },
            kube::Error::Api(status) if status.code == 405 => Self::MethodNotAllowed { kind },
            kube::Error::Api(status) if status.reason == "AlreadyExists" => {
                Self::AlreadyExists { kind, name }
            }
            kube::Error::Api(status) if status.code == 409 => Self::Conflict {
                kind,
                name,
                message: status.message.clone(),
            },
            _ => Self::Request {
                source,
                verb,
                kind,
                name,
            },
        }
    }
}

/// Whether objects of a type live in a namespace or at cluster level.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Scope {
    Namespaced,
    Cluster,
}

impl From<discovery::Scope> for Scope {
    fn from(scope: discovery::Scope) -> Self {
        match scope {
            discovery::Scope::Namespaced => Self::Namespaced,
            discovery::Scope::Cluster => Self::Cluster,
        }
    }
}

/// How dependents of a deleted object are handled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "PascalCase")]
pub enum DeletePropagation {
    /// Dependents are deleted before the owner disappears.
    #[default]
    Foreground,
    /// The owner disappears immediately, dependents are deleted afterwards.
    Background,
    /// Dependents are left behind.
    Orphan,
}

impl From<DeletePropagation> for PropagationPolicy {
    fn from(value: DeletePropagation) -> Self {
        match value {
            DeletePropagation::Foreground => Self::Foreground,
            DeletePropagation::Background => Self::Background,
            DeletePropagation::Orphan => Self::Orphan,
        }
    }
}

/// The Kubernetes API operations the reconciliation machinery relies on.
///
/// Objects are handled untyped as [`DynamicObject`]s, addressed by their
/// [`ApiResource`].
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Returns the preferred version of every API group served by the cluster.
    ///
    /// Groups whose discovery fails (usually aggregated APIs of third parties)
    /// are left out instead of failing the whole call.
    async fn server_preferred_resources(&self) -> Result<Vec<APIResourceList>>;

    /// Returns the resource rules granted to the current service account in
    /// `namespace`.
    async fn self_subject_rules(&self, namespace: &str) -> Result<Vec<ResourceRule>>;

    /// Looks up the [`ApiResource`] and [`Scope`] serving `gvk`.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, Scope)>;

    /// Lists objects in `namespace`, or across all namespaces if `None`.
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Creates or updates `object` with a forced server-side apply.
    async fn apply(&self, resource: &ApiResource, object: &DynamicObject)
    -> Result<DynamicObject>;

    /// Applies a JSON merge patch to the main resource.
    async fn merge_patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject>;

    /// Replaces the `.status` of an object through the status subresource.
    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<()>;

    /// Deletes an object. Returns [`Error::NotFound`] if it does not exist.
    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        propagation: DeletePropagation,
    ) -> Result<()>;
}

/// A [`kube::Client`] which applies objects with a fixed field manager.
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
    field_manager: String,
}

impl Client {
    pub fn new(client: kube::Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    pub fn as_kube_client(&self) -> kube::Client {
        self.client.clone()
    }

    pub fn field_manager(&self) -> &str {
        &self.field_manager
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait]
impl ClusterClient for Client {
    async fn server_preferred_resources(&self) -> Result<Vec<APIResourceList>> {
        let mut lists = Vec::new();

        let core = self
            .client
            .list_core_api_versions()
            .await
            .context(DiscoverySnafu)?;
        if let Some(version) = core.versions.first() {
            let list = self
                .client
                .list_core_api_resources(version)
                .await
                .context(DiscoverySnafu)?;
            lists.push(list);
        }

        let groups = self.client.list_api_groups().await.context(DiscoverySnafu)?;
        for group in groups.groups {
            let Some(preferred) = group
                .preferred_version
                .as_ref()
                .or_else(|| group.versions.first())
            else {
                continue;
            };

            match self
                .client
                .list_api_group_resources(&preferred.group_version)
                .await
            {
                Ok(list) => lists.push(list),
                Err(err) => warn!(
                    k8s.group_version = %preferred.group_version,
                    error = &err as &dyn std::error::Error,
                    "skipping API group which failed discovery"
                ),
            }
        }

        Ok(lists)
    }

    async fn self_subject_rules(&self, namespace: &str) -> Result<Vec<ResourceRule>> {
        let review = SelfSubjectRulesReview {
            spec: SelfSubjectRulesReviewSpec {
                namespace: Some(namespace.to_owned()),
            },
            ..SelfSubjectRulesReview::default()
        };

        let review = Api::<SelfSubjectRulesReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await
            .context(CreateRulesReviewSnafu { namespace })?;

        let status = review.status.unwrap_or_default();
        if let Some(message) = status.evaluation_error.filter(|e| !e.is_empty()) {
            return RulesEvaluationSnafu { namespace, message }.fail();
        }

        Ok(status.resource_rules)
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, Scope)> {
        let (resource, capabilities) = discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|source| Error::from_discovery(source, gvk))?;

        Ok((resource, capabilities.scope.into()))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }

        self.api(resource, namespace)
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|err| Error::from_kube(err, "list", &resource.kind, ""))
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.api(resource, namespace)
            .get_opt(name)
            .await
            .map_err(|err| Error::from_kube(err, "get", &resource.kind, name))
    }

    async fn apply(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object.metadata.name.as_deref().context(MissingNameSnafu {
            kind: &resource.kind,
        })?;

        let mut object = object.clone();
        object.types.get_or_insert_with(|| TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        // managedFields must not be part of an apply patch
        object.metadata.managed_fields = None;

        let params = PatchParams::apply(&self.field_manager).force();
        self.api(resource, object.metadata.namespace.as_deref())
            .patch(name, &params, &Patch::Apply(&object))
            .await
            .map_err(|err| Error::from_kube(err, "apply", &resource.kind, name))
    }

    async fn merge_patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        self.api(resource, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|err| Error::from_kube(err, "patch", &resource.kind, name))
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api(resource, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|err| Error::from_kube(err, "patch status of", &resource.kind, name))
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        propagation: DeletePropagation,
    ) -> Result<()> {
        let params = DeleteParams {
            propagation_policy: Some(propagation.into()),
            ..DeleteParams::default()
        };

        self.api(resource, namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|err| Error::from_kube(err, "delete", &resource.kind, name))
    }
}

/// The [`GroupVersionKind`] of an untyped object, if it carries type information.
pub fn object_gvk(object: &DynamicObject) -> Option<GroupVersionKind> {
    let types = object.types.as_ref()?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Some(GroupVersionKind::gvk(group, version, &types.kind))
}

//! An in-memory [`ClusterClient`] for tests.
//!
//! It keeps objects in a map keyed by API group, kind, namespace and name, and
//! mimics the parts of API server behavior the reconciliation code depends on:
//! label selectors, finalizers, deletion timestamps and cascading deletion of
//! owned objects.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use jiff::Timestamp;
use k8s_openapi::{
    api::authorization::v1::ResourceRule,
    apimachinery::pkg::apis::meta::v1::{APIResource, APIResourceList, OwnerReference, Time},
};
use kube::{
    CustomResource, ResourceExt,
    core::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta},
};
use schemars::JsonSchema;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    client::{ClusterClient, DeletePropagation, Error, Result, Scope},
    conditions::{Manager, types},
    release::{Platform, Release},
    types::{ClusterConfig, DevFlags, PlatformObject, PlatformStatus, ReconciliationRequest},
};

const ALL_VERBS: [&str; 8] = [
    "create",
    "delete",
    "deletecollection",
    "get",
    "list",
    "patch",
    "update",
    "watch",
];

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct Key {
    group: String,
    kind: String,
    namespace: Option<String>,
    name: String,
}

#[derive(Default)]
struct State {
    catalog: Vec<APIResourceList>,
    rules: Vec<ResourceRule>,
    objects: BTreeMap<Key, DynamicObject>,
    list_failures: HashMap<String, Failure>,
    delete_failures: HashMap<String, Failure>,
    next_uid: u64,
}

impl State {
    fn assign_uid(&mut self, object: &mut DynamicObject) {
        if object.metadata.uid.is_none() {
            self.next_uid += 1;
            object.metadata.uid = Some(format!("uid-{}", self.next_uid));
        }
    }

    /// Removes the object and, unless orphaned, everything owned by it.
    fn remove(&mut self, key: &Key, propagation: DeletePropagation) {
        let Some(removed) = self.objects.remove(key) else {
            return;
        };
        if propagation == DeletePropagation::Orphan {
            return;
        }

        let Some(uid) = removed.metadata.uid else {
            return;
        };
        let dependents: Vec<Key> = self
            .objects
            .iter()
            .filter(|(_, obj)| {
                obj.owner_references()
                    .iter()
                    .any(|owner| owner.uid == uid)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for dependent in dependents {
            self.delete(&dependent, propagation);
        }
    }

    fn delete(&mut self, key: &Key, propagation: DeletePropagation) {
        let Some(object) = self.objects.get_mut(key) else {
            return;
        };

        if object.finalizers().is_empty() {
            self.remove(key, propagation);
        } else if object.metadata.deletion_timestamp.is_none() {
            object.metadata.deletion_timestamp = Some(Time(Timestamp::now()));
        }
    }
}

/// API errors [`FakeCluster`] can answer requests with.
#[derive(Clone, Copy, Debug)]
pub enum Failure {
    Forbidden,
    MethodNotAllowed,
    NotFound,
    Conflict,
}

impl Failure {
    fn error(self, kind: &str, name: &str) -> Error {
        let kind = kind.to_owned();
        let name = name.to_owned();
        match self {
            Self::Forbidden => Error::Forbidden {
                kind,
                message: "access denied".to_owned(),
            },
            Self::MethodNotAllowed => Error::MethodNotAllowed { kind },
            Self::NotFound => Error::NotFound { kind, name },
            Self::Conflict => Error::Conflict {
                kind,
                name,
                message: "the object has been modified".to_owned(),
            },
        }
    }
}

pub struct FakeCluster {
    state: Mutex<State>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// A cluster serving a handful of common types, with a service account
    /// allowed to do anything.
    pub fn new() -> Self {
        let catalog = vec![
            resource_list(
                "v1",
                &[
                    ("configmaps", "ConfigMap", true),
                    ("secrets", "Secret", true),
                    ("namespaces", "Namespace", false),
                    ("pods", "Pod", true),
                ],
            ),
            resource_list("apps/v1", &[("deployments", "Deployment", true)]),
            resource_list(
                "rbac.authorization.k8s.io/v1",
                &[
                    ("clusterroles", "ClusterRole", false),
                    ("roles", "Role", true),
                ],
            ),
            resource_list("coordination.k8s.io/v1", &[("leases", "Lease", true)]),
            resource_list(
                "apiextensions.k8s.io/v1",
                &[(
                    "customresourcedefinitions",
                    "CustomResourceDefinition",
                    false,
                )],
            ),
            resource_list(
                "features.opendatahub.io/v1",
                &[("featuretrackers", "FeatureTracker", false)],
            ),
            resource_list(
                "components.platform.opendatahub.io/v1alpha1",
                &[("dashboards", "Dashboard", false)],
            ),
        ];

        let rules = vec![ResourceRule {
            verbs: vec!["*".to_owned()],
            api_groups: Some(vec!["*".to_owned()]),
            resources: Some(vec!["*".to_owned()]),
            resource_names: None,
        }];

        Self {
            state: Mutex::new(State {
                catalog,
                rules,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake cluster state is poisoned")
    }

    pub fn set_rules(&self, rules: Vec<ResourceRule>) {
        self.state().rules = rules;
    }

    /// Makes list calls for `kind` fail with Forbidden.
    pub fn forbid_listing(&self, kind: &str) {
        self.fail_listing(kind, Failure::Forbidden);
    }

    pub fn fail_listing(&self, kind: &str, failure: Failure) {
        self.state().list_failures.insert(kind.to_owned(), failure);
    }

    /// Makes delete calls for `kind` fail, leaving the objects in place.
    pub fn fail_deleting(&self, kind: &str, failure: Failure) {
        self.state().delete_failures.insert(kind.to_owned(), failure);
    }

    /// Stores `object` as is, assigning a UID if it has none.
    pub fn insert(&self, mut object: DynamicObject) -> DynamicObject {
        let mut state = self.state();
        state.assign_uid(&mut object);
        state.objects.insert(object_key(&object), object.clone());
        object
    }

    pub fn find(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        self.state()
            .objects
            .iter()
            .find(|(key, _)| {
                key.kind == kind && key.namespace.as_deref() == namespace && key.name == name
            })
            .map(|(_, obj)| obj.clone())
    }

    pub fn contains(&self, kind: &str, namespace: Option<&str>, name: &str) -> bool {
        self.find(kind, namespace, name).is_some()
    }

    pub fn objects_of_kind(&self, kind: &str) -> Vec<DynamicObject> {
        self.state()
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(_, obj)| obj.clone())
            .collect()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn server_preferred_resources(&self) -> Result<Vec<APIResourceList>> {
        Ok(self.state().catalog.clone())
    }

    async fn self_subject_rules(&self, _namespace: &str) -> Result<Vec<ResourceRule>> {
        Ok(self.state().rules.clone())
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, Scope)> {
        let api_version = if gvk.group.is_empty() {
            gvk.version.clone()
        } else {
            format!("{}/{}", gvk.group, gvk.version)
        };

        let state = self.state();
        state
            .catalog
            .iter()
            .filter(|list| list.group_version == api_version)
            .flat_map(|list| list.resources.iter())
            .find(|res| res.kind == gvk.kind)
            .map(|res| {
                let scope = if res.namespaced {
                    Scope::Namespaced
                } else {
                    Scope::Cluster
                };
                (ApiResource::from_gvk_with_plural(gvk, &res.name), scope)
            })
            .ok_or_else(|| Error::NotFound {
                kind: gvk.kind.clone(),
                name: String::new(),
            })
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.state();
        if let Some(failure) = state.list_failures.get(&resource.kind) {
            return Err(failure.error(&resource.kind, ""));
        }

        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.group == resource.group && key.kind == resource.kind)
            .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
            .filter(|(_, obj)| label_selector.is_none_or(|s| selector_matches(s, obj.labels())))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let key = resource_key(resource, namespace, name);
        Ok(self.state().objects.get(&key).cloned())
    }

    async fn apply(&self, resource: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let mut object = object.clone();
        object.types.get_or_insert_with(|| TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
        let name = object.metadata.name.clone().ok_or_else(|| Error::MissingName {
            kind: resource.kind.clone(),
        })?;
        let key = resource_key(resource, object.metadata.namespace.as_deref(), &name);

        let mut state = self.state();
        match state.objects.get(&key) {
            Some(existing) => {
                object.metadata.uid = existing.metadata.uid.clone();
                object.metadata.generation = existing.metadata.generation;
                object.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
                if object.metadata.finalizers.is_none() {
                    object.metadata.finalizers = existing.metadata.finalizers.clone();
                }
                if object.data.get("status").is_none() {
                    if let Some(status) = existing.data.get("status") {
                        object.data["status"] = status.clone();
                    }
                }
            }
            None => {
                state.assign_uid(&mut object);
                object.metadata.generation.get_or_insert(1);
            }
        }

        state.objects.insert(key, object.clone());
        Ok(object)
    }

    async fn merge_patch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let key = resource_key(resource, namespace, name);
        let mut state = self.state();
        let existing = state.objects.get(&key).ok_or_else(|| Error::NotFound {
            kind: resource.kind.clone(),
            name: name.to_owned(),
        })?;

        let mut value = serde_json::to_value(existing).expect("objects serialize to JSON");
        merge(&mut value, patch);
        let patched: DynamicObject =
            serde_json::from_value(value).expect("patched object deserializes");

        if patched.metadata.deletion_timestamp.is_some() && patched.finalizers().is_empty() {
            state.objects.insert(key.clone(), patched.clone());
            state.remove(&key, DeletePropagation::Background);
        } else {
            state.objects.insert(key, patched.clone());
        }
        Ok(patched)
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> Result<()> {
        let key = resource_key(resource, namespace, name);
        let mut state = self.state();
        let object = state.objects.get_mut(&key).ok_or_else(|| Error::NotFound {
            kind: resource.kind.clone(),
            name: name.to_owned(),
        })?;

        match object.data.get_mut("status") {
            Some(current) => merge(current, status),
            None => object.data["status"] = status.clone(),
        }
        Ok(())
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        propagation: DeletePropagation,
    ) -> Result<()> {
        let key = resource_key(resource, namespace, name);
        let mut state = self.state();
        if let Some(failure) = state.delete_failures.get(&resource.kind) {
            return Err(failure.error(&resource.kind, name));
        }
        if !state.objects.contains_key(&key) {
            return Err(Error::NotFound {
                kind: resource.kind.clone(),
                name: name.to_owned(),
            });
        }

        state.delete(&key, propagation);
        Ok(())
    }
}

/// Builder style helpers for test objects.
pub trait TestObject: Sized {
    fn with_labels<'a>(self, labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self;
    fn with_annotations<'a>(
        self,
        annotations: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self;
    fn with_generation(self, generation: i64) -> Self;
    fn with_uid(self, uid: &str) -> Self;
    fn with_finalizer(self, finalizer: &str) -> Self;
    fn owned_by(self, owner: &DynamicObject) -> Self;
    /// Marks the object as being deleted, kept alive by a finalizer.
    fn terminating(self) -> Self;
}

impl TestObject for DynamicObject {
    fn with_labels<'a>(mut self, labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let target = self.labels_mut();
        for (key, value) in labels {
            target.insert(key.to_owned(), value.to_owned());
        }
        self
    }

    fn with_annotations<'a>(
        mut self,
        annotations: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let target = self.annotations_mut();
        for (key, value) in annotations {
            target.insert(key.to_owned(), value.to_owned());
        }
        self
    }

    fn with_generation(mut self, generation: i64) -> Self {
        self.metadata.generation = Some(generation);
        self
    }

    fn with_uid(mut self, uid: &str) -> Self {
        self.metadata.uid = Some(uid.to_owned());
        self
    }

    fn with_finalizer(mut self, finalizer: &str) -> Self {
        self.finalizers_mut().push(finalizer.to_owned());
        self
    }

    fn owned_by(mut self, owner: &DynamicObject) -> Self {
        let types = owner.types.clone().unwrap_or_default();
        self.owner_references_mut().push(OwnerReference {
            api_version: types.api_version,
            kind: types.kind,
            name: owner.name_any(),
            uid: owner.uid().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        });
        self
    }

    fn terminating(mut self) -> Self {
        self.metadata.deletion_timestamp = Some(Time(Timestamp::now()));
        self.with_finalizer("test.opendatahub.io/keep")
    }
}

pub fn object(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_owned(),
            kind: kind.to_owned(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: namespace.map(str::to_owned),
            ..ObjectMeta::default()
        },
        data: Value::Object(serde_json::Map::new()),
    }
}

pub fn config_map(namespace: &str, name: &str) -> DynamicObject {
    object("v1", "ConfigMap", Some(namespace), name)
}

fn resource_list(group_version: &str, resources: &[(&str, &str, bool)]) -> APIResourceList {
    APIResourceList {
        group_version: group_version.to_owned(),
        resources: resources
            .iter()
            .map(|(name, kind, namespaced)| APIResource {
                name: (*name).to_owned(),
                kind: (*kind).to_owned(),
                namespaced: *namespaced,
                verbs: ALL_VERBS.map(str::to_owned).to_vec(),
                ..APIResource::default()
            })
            .collect(),
    }
}

fn object_key(object: &DynamicObject) -> Key {
    let types = object.types.clone().unwrap_or_default();
    let group = types
        .api_version
        .split_once('/')
        .map(|(group, _)| group.to_owned())
        .unwrap_or_default();

    Key {
        group,
        kind: types.kind,
        namespace: object.metadata.namespace.clone(),
        name: object.name_any(),
    }
}

fn resource_key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> Key {
    Key {
        group: resource.group.clone(),
        kind: resource.kind.clone(),
        namespace: namespace.map(str::to_owned),
        name: name.to_owned(),
    }
}

/// Supports the `key=value`, `key!=value` and `key` forms of label selectors.
fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((key, value)) = term.split_once("!=") {
                labels.get(key.trim()).map(String::as_str) != Some(value.trim())
            } else if let Some((key, value)) = term.split_once('=') {
                let value = value.trim_start_matches('=');
                labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

/// JSON merge patch as of RFC 7386.
fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// A cluster scoped platform resource used as reconciled instance in tests.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "components.platform.opendatahub.io",
    version = "v1alpha1",
    kind = "Dashboard",
    status = "PlatformStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_flags: Option<DevFlags>,
}

impl PlatformObject for Dashboard {
    fn status(&self) -> Option<&PlatformStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut PlatformStatus {
        self.status.get_or_insert_with(PlatformStatus::default)
    }

    fn dev_flags(&self) -> Option<&DevFlags> {
        self.spec.dev_flags.as_ref()
    }
}

pub const DASHBOARD_NAME: &str = "default-dashboard";
pub const DASHBOARD_UID: &str = "dashboard-uid";
pub const APPLICATIONS_NAMESPACE: &str = "opendatahub";

pub fn dashboard(generation: i64) -> Dashboard {
    let mut instance = Dashboard::new(DASHBOARD_NAME, DashboardSpec::default());
    instance.metadata.uid = Some(DASHBOARD_UID.to_owned());
    instance.metadata.generation = Some(generation);
    instance
}

/// The owner reference pointing at the instance created by [`dashboard`].
pub fn dashboard_owner() -> OwnerReference {
    OwnerReference {
        api_version: "components.platform.opendatahub.io/v1alpha1".to_owned(),
        kind: "Dashboard".to_owned(),
        name: DASHBOARD_NAME.to_owned(),
        uid: DASHBOARD_UID.to_owned(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn release() -> Release {
    Release::new(Platform::OpenDataHub, Version::new(2, 30, 0))
}

pub fn request(instance: Dashboard, cluster: Arc<FakeCluster>) -> ReconciliationRequest<Dashboard> {
    let conditions = Manager::new(
        PlatformObject::conditions(&instance),
        types::READY,
        [types::PROVISIONING_SUCCEEDED],
    );
    ReconciliationRequest::new(
        cluster,
        instance,
        Arc::new(ClusterConfig {
            applications_namespace: APPLICATIONS_NAMESPACE.to_owned(),
            service_mesh: None,
        }),
        release(),
        conditions,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors() {
        let labels: BTreeMap<String, String> =
            [("foo".to_owned(), "bar".to_owned())].into_iter().collect();

        assert!(selector_matches("foo=bar", &labels));
        assert!(selector_matches("foo==bar", &labels));
        assert!(selector_matches("foo", &labels));
        assert!(!selector_matches("foo!=bar", &labels));
        assert!(!selector_matches("foo=bar,baz", &labels));
    }

    #[tokio::test]
    async fn foreground_deletion_cascades_to_owned_objects() {
        let cluster = FakeCluster::new();
        let owner = cluster.insert(object(
            "features.opendatahub.io/v1",
            "FeatureTracker",
            None,
            "tracker",
        ));
        cluster.insert(config_map("default", "owned").owned_by(&owner));
        cluster.insert(config_map("default", "unrelated"));

        let (resource, _) = cluster
            .resolve(&GroupVersionKind::gvk(
                "features.opendatahub.io",
                "v1",
                "FeatureTracker",
            ))
            .await
            .unwrap();
        cluster
            .delete(&resource, None, "tracker", DeletePropagation::Foreground)
            .await
            .unwrap();

        assert!(!cluster.contains("FeatureTracker", None, "tracker"));
        assert!(!cluster.contains("ConfigMap", Some("default"), "owned"));
        assert!(cluster.contains("ConfigMap", Some("default"), "unrelated"));
    }
}

//! Deletes objects left behind by previous renders of the reconciled instance.
//!
//! Every object the operator deploys is stamped with the release and the
//! instance generation it was rendered for (see [`crate::actions::deploy`]).
//! After a successful render and deploy, objects carrying an outdated stamp are
//! not part of the desired state anymore and get collected.

use std::{
    collections::BTreeMap,
    num::ParseIntError,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use educe::Educe;
use kube::{
    ResourceExt,
    core::{DynamicObject, GroupVersionKind},
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::{
    actions::Action,
    client::DeletePropagation,
    errors::{ActionError, BoxError},
    gc::{self, Engine, Resource, RunOptions},
    metadata::{self, annotations, labels},
    release::Release,
    types::{PlatformObject, ReconciliationRequest},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("annotation {key:?} of {kind} {name:?} is not a valid generation"))]
    ParseGeneration {
        source: ParseIntError,
        key: &'static str,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to refresh the garbage collector"))]
    RefreshEngine { source: gc::Error },

    #[snafu(display("failed to run the garbage collector"))]
    RunEngine { source: gc::Error },
}

/// The stamp objects of the current render carry.
#[derive(Clone, Debug, PartialEq)]
pub struct CurrentState {
    pub release: Release,
    pub generation: i64,
    pub uid: Option<String>,
}

pub type TypePredicate = Arc<dyn Fn(&Resource) -> Result<bool, BoxError> + Send + Sync>;
pub type ObjectPredicate =
    Arc<dyn Fn(&CurrentState, &DynamicObject) -> Result<bool, BoxError> + Send + Sync>;

/// Whether `object` was rendered for another release or another generation of
/// the instance than `current`.
///
/// Objects lacking the platform version, platform type or generation
/// annotations are never considered stale. The instance UID is only compared
/// if the object carries it.
pub fn is_stale(current: &CurrentState, object: &DynamicObject) -> Result<bool, Error> {
    let meta = &object.metadata;

    let (Some(version), Some(platform)) = (
        metadata::annotation(meta, annotations::PLATFORM_VERSION),
        metadata::annotation(meta, annotations::PLATFORM_TYPE),
    ) else {
        return Ok(false);
    };

    let generation = [
        annotations::INSTANCE_GENERATION,
        annotations::COMPONENT_GENERATION,
    ]
    .into_iter()
    .find_map(|key| metadata::annotation(meta, key).map(|value| (key, value)));
    let Some((generation_key, generation)) = generation else {
        return Ok(false);
    };

    if version != current.release.version.to_string()
        || platform != current.release.name.to_string()
    {
        return Ok(true);
    }

    if let Some(uid) = metadata::annotation(meta, annotations::INSTANCE_UID) {
        if Some(uid) != current.uid.as_deref() {
            return Ok(true);
        }
    }

    let generation: i64 = generation.parse().with_context(|_| ParseGenerationSnafu {
        key: generation_key,
        kind: object
            .types
            .as_ref()
            .map(|types| types.kind.clone())
            .unwrap_or_default(),
        name: object.name_any(),
    })?;

    Ok(generation != current.generation)
}

fn default_object_predicate(
    current: &CurrentState,
    object: &DynamicObject,
) -> Result<bool, BoxError> {
    is_stale(current, object).map_err(Into::into)
}

/// Whether one of the owner references of `object` points at `kind` in `group`.
fn is_owned_by_type(object: &DynamicObject, group: &str, kind: &str) -> bool {
    object.owner_references().iter().any(|owner| {
        let owner_group = owner
            .api_version
            .split_once('/')
            .map(|(group, _)| group)
            .unwrap_or_default();
        owner.kind == kind && owner_group == group
    })
}

/// Garbage collection as a pipeline step, see the [module docs](self).
///
/// The action only runs once the request holds a complete render. It counts
/// the collection cycles it ran and the objects it deleted over its lifetime.
#[derive(Educe)]
#[educe(Debug)]
pub struct GcAction {
    engine: Arc<Engine>,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    unremovables: Vec<GroupVersionKind>,
    only_owned: bool,
    propagation: Option<DeletePropagation>,

    #[educe(Debug(ignore))]
    type_predicate: Option<TypePredicate>,

    #[educe(Debug(ignore))]
    object_predicate: ObjectPredicate,

    cycles_total: AtomicU64,
    deleted_total: AtomicU64,
}

impl GcAction {
    pub fn builder() -> GcActionBuilder {
        GcActionBuilder::default()
    }

    /// Number of collection cycles run.
    pub fn cycles_total(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    /// Number of objects deleted over all cycles.
    pub fn deleted_total(&self) -> u64 {
        self.deleted_total.load(Ordering::Relaxed)
    }

    fn selector(&self, owner_kind: &str) -> String {
        if self.labels.is_empty() {
            return format!("{}={}", labels::PLATFORM_PART_OF, owner_kind.to_lowercase());
        }

        self.labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn run_options(
        &self,
        owner_group: String,
        owner_kind: String,
        current: CurrentState,
    ) -> RunOptions {
        let mut builder = RunOptions::builder().selector(self.selector(&owner_kind));
        if let Some(propagation) = self.propagation {
            builder = builder.propagation(propagation);
        }

        let unremovables = self.unremovables.clone();
        let type_predicate = self.type_predicate.clone();
        builder = builder.type_predicate(move |resource| {
            let unremovable = unremovables
                .iter()
                .any(|gvk| gvk.group == resource.group() && gvk.kind == resource.kind());
            if unremovable {
                return Ok(false);
            }
            match &type_predicate {
                Some(predicate) => predicate(resource),
                None => Ok(true),
            }
        });

        let only_owned = self.only_owned;
        let object_predicate = self.object_predicate.clone();
        builder
            .object_predicate(move |object| {
                if metadata::is_unmanaged(&object.metadata) {
                    return Ok(false);
                }
                if only_owned && !is_owned_by_type(object, &owner_group, &owner_kind) {
                    return Ok(false);
                }
                object_predicate(&current, object)
            })
            .build()
    }
}

#[async_trait]
impl<T: PlatformObject> Action<T> for GcAction {
    fn name(&self) -> &str {
        "gc"
    }

    async fn run(&self, rr: &mut ReconciliationRequest<T>) -> Result<(), ActionError> {
        // never collect against a partial render
        if !rr.generated {
            debug!("resources were not generated, skipping garbage collection");
            return Ok(());
        }

        self.cycles_total.fetch_add(1, Ordering::Relaxed);

        let namespace = self
            .namespace
            .clone()
            .unwrap_or_else(|| rr.cluster_config.applications_namespace.clone());
        self.engine
            .refresh(rr.client.as_ref(), &namespace)
            .await
            .context(RefreshEngineSnafu)
            .map_err(ActionError::retryable)?;

        let current = CurrentState {
            release: rr.release.clone(),
            generation: rr.instance.generation(),
            uid: rr.instance.uid(),
        };
        let options = self.run_options(
            T::group(&()).into_owned(),
            T::kind(&()).into_owned(),
            current,
        );

        let deleted = self
            .engine
            .run(rr.client.as_ref(), &options)
            .await
            .context(RunEngineSnafu)
            .map_err(ActionError::retryable)?;

        if deleted > 0 {
            info!(
                k8s.object.name = %rr.instance.name_any(),
                gc.deleted = deleted,
                "garbage collection finished"
            );
            self.deleted_total.fetch_add(deleted as u64, Ordering::Relaxed);
        }

        Ok(())
    }
}

pub struct GcActionBuilder {
    engine: Option<Arc<Engine>>,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    unremovables: Vec<GroupVersionKind>,
    only_owned: bool,
    propagation: Option<DeletePropagation>,
    type_predicate: Option<TypePredicate>,
    object_predicate: Option<ObjectPredicate>,
}

impl Default for GcActionBuilder {
    fn default() -> Self {
        Self {
            engine: None,
            namespace: None,
            labels: BTreeMap::new(),
            unremovables: vec![
                GroupVersionKind::gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
                GroupVersionKind::gvk("coordination.k8s.io", "v1", "Lease"),
            ],
            only_owned: true,
            propagation: None,
            type_predicate: None,
            object_predicate: None,
        }
    }
}

impl GcActionBuilder {
    /// The engine shared with other controllers. A private one is created if
    /// none is given.
    pub fn with_engine(mut self, engine: Arc<Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// The namespace the resource rules of the operator are reviewed in.
    /// Defaults to the applications namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Adds a label the collected objects must carry. Replaces the default
    /// `part-of` selector.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds types whose objects are never deleted, in addition to
    /// CustomResourceDefinitions and Leases.
    pub fn with_unremovables(mut self, gvks: impl IntoIterator<Item = GroupVersionKind>) -> Self {
        self.unremovables.extend(gvks);
        self
    }

    pub fn with_type_predicate(
        mut self,
        predicate: impl Fn(&Resource) -> Result<bool, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.type_predicate = Some(Arc::new(predicate));
        self
    }

    /// Replaces the default staleness check of [`is_stale`].
    pub fn with_object_predicate(
        mut self,
        predicate: impl Fn(&CurrentState, &DynamicObject) -> Result<bool, BoxError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.object_predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether only objects owned by an object of the reconciled kind are
    /// collected. Enabled by default.
    pub fn with_only_collect_owned(mut self, only_owned: bool) -> Self {
        self.only_owned = only_owned;
        self
    }

    pub fn with_propagation_policy(mut self, propagation: DeletePropagation) -> Self {
        self.propagation = Some(propagation);
        self
    }

    pub fn build(self) -> GcAction {
        GcAction {
            engine: self.engine.unwrap_or_default(),
            namespace: self.namespace,
            labels: self.labels,
            unremovables: self.unremovables,
            only_owned: self.only_owned,
            propagation: self.propagation,
            type_predicate: self.type_predicate,
            object_predicate: self
                .object_predicate
                .unwrap_or_else(|| Arc::new(default_object_predicate)),
            cycles_total: AtomicU64::new(0),
            deleted_total: AtomicU64::new(0),
        }
    }
}

//! Garbage collection of objects which are no longer part of the desired state.
//!
//! The [`Engine`] keeps a catalog of API types the operator may delete, built
//! from API discovery and the operator's own RBAC rules by [`Engine::refresh`].
//! [`Engine::run`] lists objects of every cataloged type matching a label
//! selector and deletes the ones accepted by the configured predicates.

use std::sync::Arc;

use educe::Educe;
use kube::{ResourceExt, core::DynamicObject};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::{
    client::{self, ClusterClient, DeletePropagation},
    errors::BoxError,
};

pub mod resources;
pub mod rules;

pub use resources::{Resource, ResourceStore};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to discover API resources"))]
    DiscoverResources { source: client::Error },

    #[snafu(display("failed to retrieve resource rules in namespace {namespace:?}"))]
    RetrieveResourceRules {
        source: client::Error,
        namespace: String,
    },

    #[snafu(display("cannot determine if resource {resource} can be deleted"))]
    EvaluateTypePredicate { source: BoxError, resource: String },

    #[snafu(display("cannot list child resources {resource}"))]
    ListResources {
        source: client::Error,
        resource: String,
    },

    #[snafu(display(
        "cannot determine if object {name:?} in namespace {namespace:?} can be deleted"
    ))]
    EvaluateObjectPredicate {
        source: BoxError,
        name: String,
        namespace: String,
    },

    #[snafu(display(
        "cannot delete resource {resource}, namespace: {namespace:?}, name: {name:?}"
    ))]
    DeleteResource {
        source: client::Error,
        resource: String,
        namespace: String,
        name: String,
    },
}

pub type TypePredicate = Arc<dyn Fn(&Resource) -> Result<bool, BoxError> + Send + Sync>;
pub type ObjectPredicate = Arc<dyn Fn(&DynamicObject) -> Result<bool, BoxError> + Send + Sync>;

/// Configuration of a single [`Engine::run`], created via [`RunOptions::builder`].
#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct RunOptions {
    selector: Option<String>,
    propagation: Option<DeletePropagation>,

    #[educe(Debug(ignore))]
    type_predicate: TypePredicate,

    #[educe(Debug(ignore))]
    object_predicate: ObjectPredicate,
}

impl RunOptions {
    pub fn builder() -> RunOptionsBuilder {
        RunOptionsBuilder::default()
    }

    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    /// Overrides the propagation policy of the engine.
    pub fn propagation(&self) -> Option<DeletePropagation> {
        self.propagation
    }
}

/// Builds [`RunOptions`].
///
/// Without further configuration every type is accepted and no object is,
/// so nothing gets deleted.
#[derive(Default)]
pub struct RunOptionsBuilder {
    selector: Option<String>,
    propagation: Option<DeletePropagation>,
    type_predicate: Option<TypePredicate>,
    object_predicate: Option<ObjectPredicate>,
}

impl RunOptionsBuilder {
    /// Only objects matching the label selector are considered.
    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn propagation(mut self, propagation: DeletePropagation) -> Self {
        self.propagation = Some(propagation);
        self
    }

    pub fn type_predicate(
        mut self,
        predicate: impl Fn(&Resource) -> Result<bool, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.type_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn object_predicate(
        mut self,
        predicate: impl Fn(&DynamicObject) -> Result<bool, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.object_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> RunOptions {
        RunOptions {
            selector: self.selector,
            propagation: self.propagation,
            type_predicate: self.type_predicate.unwrap_or_else(|| Arc::new(|_| Ok(true))),
            object_predicate: self
                .object_predicate
                .unwrap_or_else(|| Arc::new(|_| Ok(false))),
        }
    }
}

/// Collects leftovers of previous reconciliations.
///
/// One engine is created at startup and shared by all controllers, its catalog
/// being the only state kept between runs.
#[derive(Debug, Default)]
pub struct Engine {
    resources: ResourceStore,
    propagation: DeletePropagation,
}

impl Engine {
    pub fn new(propagation: DeletePropagation) -> Self {
        Self {
            resources: ResourceStore::default(),
            propagation,
        }
    }

    pub fn propagation(&self) -> DeletePropagation {
        self.propagation
    }

    /// Snapshot of the currently cataloged types.
    pub fn resources(&self) -> Arc<Vec<Resource>> {
        self.resources.get()
    }

    /// Rebuilds the catalog from API discovery and the resource rules granted
    /// to the operator in `namespace`.
    pub async fn refresh(&self, client: &dyn ClusterClient, namespace: &str) -> Result<()> {
        debug!("computing deletable types");

        // Discovery of groups served by broken aggregated APIs is skipped by the client
        let lists = client
            .server_preferred_resources()
            .await
            .context(DiscoverResourcesSnafu)?;

        let rules = client
            .self_subject_rules(namespace)
            .await
            .context(RetrieveResourceRulesSnafu { namespace })?;

        let resources = rules::compute_deletable_resources(&lists, &rules);
        self.resources.set(resources);

        debug!(count = self.resources.len(), "deletable types computed");
        Ok(())
    }

    /// Deletes every object accepted by `options` and returns how many were
    /// deleted.
    ///
    /// Types are processed one after another in catalog order. Types which can
    /// not be listed anymore are skipped, objects already being deleted are left
    /// alone and objects which vanished in the meantime count as deleted.
    pub async fn run(&self, client: &dyn ClusterClient, options: &RunOptions) -> Result<usize> {
        let resources = self.resources.get();
        let mut deleted = 0;

        if let Some(selector) = options.selector() {
            debug!(gc.selector = selector, "running garbage collection");
        }

        for resource in resources.iter() {
            let accepted = (options.type_predicate)(resource)
                .with_context(|_| EvaluateTypePredicateSnafu {
                    resource: resource.to_string(),
                })?;
            if !accepted {
                continue;
            }

            let items = match client
                .list(&resource.api_resource(), None, options.selector())
                .await
            {
                Ok(items) => items,
                Err(err)
                    if err.is_forbidden() || err.is_method_not_allowed() || err.is_not_found() =>
                {
                    debug!(
                        k8s.resource = %resource,
                        error = &err as &dyn std::error::Error,
                        "cannot list resource"
                    );
                    continue;
                }
                Err(err) => {
                    return Err(err).context(ListResourcesSnafu {
                        resource: resource.to_string(),
                    });
                }
            };

            for item in &items {
                let accepted = (options.object_predicate)(item).with_context(|_| {
                    EvaluateObjectPredicateSnafu {
                        name: item.name_any(),
                        namespace: item.namespace().unwrap_or_default(),
                    }
                })?;
                if !accepted || item.metadata.deletion_timestamp.is_some() {
                    continue;
                }

                let propagation = options.propagation().unwrap_or(self.propagation);
                self.delete(client, resource, item, propagation).await?;
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    async fn delete(
        &self,
        client: &dyn ClusterClient,
        resource: &Resource,
        object: &DynamicObject,
        propagation: DeletePropagation,
    ) -> Result<()> {
        let name = object.name_any();
        let namespace = object.namespace();

        info!(
            k8s.resource = %resource,
            k8s.object.namespace = namespace.as_deref().unwrap_or_default(),
            k8s.object.name = %name,
            "deleting leftover object"
        );

        match client
            .delete(
                &resource.api_resource(),
                namespace.as_deref(),
                &name,
                propagation,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err).context(DeleteResourceSnafu {
                resource: resource.to_string(),
                namespace: namespace.unwrap_or_default(),
                name,
            }),
        }
    }
}

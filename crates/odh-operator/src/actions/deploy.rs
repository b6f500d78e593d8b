//! Applies the rendered resources, stamped with the release and instance they
//! belong to.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{ResourceExt, core::DynamicObject};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, trace};

use crate::{
    actions::Action,
    client::{self, Scope, object_gvk},
    errors::ActionError,
    metadata::{self, annotations, labels},
    types::{PlatformObject, ReconciliationRequest},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("resource {name:?} has no apiVersion or kind"))]
    MissingType { name: String },

    #[snafu(display("instance {name:?} has no UID to own resources"))]
    MissingOwnerUid { name: String },

    #[snafu(display("failed to resolve the API resource of {kind} {name:?}"))]
    ResolveResource {
        source: client::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to look up the deployed {kind} {name:?}"))]
    GetResource {
        source: client::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to apply {kind} {name:?}"))]
    ApplyResource {
        source: client::Error,
        kind: String,
        name: String,
    },
}

/// Stamps `object` with the release, the instance and its generation.
///
/// The part-of label is only added if the object doesn't carry one yet.
pub fn stamp<T: PlatformObject>(rr: &ReconciliationRequest<T>, object: &mut DynamicObject) {
    let meta = &mut object.metadata;
    let instance = &rr.instance;

    metadata::set_annotation(
        meta,
        annotations::INSTANCE_GENERATION,
        instance.generation().to_string(),
    );
    metadata::set_annotation(meta, annotations::INSTANCE_NAME, instance.name_any());
    metadata::set_annotation(
        meta,
        annotations::INSTANCE_UID,
        instance.uid().unwrap_or_default(),
    );
    metadata::set_annotation(meta, annotations::PLATFORM_TYPE, rr.release.name.to_string());
    metadata::set_annotation(
        meta,
        annotations::PLATFORM_VERSION,
        rr.release.version.to_string(),
    );

    if metadata::label(meta, labels::PLATFORM_PART_OF).is_none() {
        metadata::set_label(meta, labels::PLATFORM_PART_OF, T::kind(&()).to_lowercase());
    }
}

fn set_controller(object: &mut DynamicObject, owner: OwnerReference) {
    let references = object.owner_references_mut();
    references.retain(|reference| reference.uid != owner.uid && reference.controller != Some(true));
    references.push(owner);
}

/// Server side applies all resources of the request in order.
///
/// Resources whose deployed copy is annotated with
/// `opendatahub.io/managed: "false"` are left untouched.
#[derive(Debug, Default)]
pub struct DeployAction {}

impl DeployAction {
    pub fn new() -> Self {
        Self::default()
    }

    async fn deploy<T: PlatformObject>(
        &self,
        rr: &ReconciliationRequest<T>,
        owner: &OwnerReference,
        object: &DynamicObject,
    ) -> Result<Option<DynamicObject>, Error> {
        let name = object.name_any();
        let gvk = object_gvk(object).context(MissingTypeSnafu { name: &name })?;

        let (resource, scope) = rr
            .client
            .resolve(&gvk)
            .await
            .with_context(|_| ResolveResourceSnafu {
                kind: &gvk.kind,
                name: &name,
            })?;

        let mut object = object.clone();
        match scope {
            Scope::Namespaced if object.metadata.namespace.is_none() => {
                object.metadata.namespace = Some(rr.cluster_config.applications_namespace.clone());
            }
            Scope::Namespaced => {}
            Scope::Cluster => object.metadata.namespace = None,
        }
        let namespace = object.metadata.namespace.clone();

        let deployed = rr
            .client
            .get(&resource, namespace.as_deref(), &name)
            .await
            .with_context(|_| GetResourceSnafu {
                kind: &gvk.kind,
                name: &name,
            })?;
        if deployed.is_some_and(|deployed| metadata::is_unmanaged(&deployed.metadata)) {
            debug!(
                k8s.object.kind = %gvk.kind,
                k8s.object.name = %name,
                "resource is not managed by the operator, skipping"
            );
            return Ok(None);
        }

        stamp(rr, &mut object);
        set_controller(&mut object, owner.clone());

        trace!(k8s.object.kind = %gvk.kind, k8s.object.name = %name, "applying resource");
        let applied = rr
            .client
            .apply(&resource, &object)
            .await
            .with_context(|_| ApplyResourceSnafu {
                kind: &gvk.kind,
                name: &name,
            })?;

        Ok(Some(applied))
    }
}

#[async_trait]
impl<T: PlatformObject> Action<T> for DeployAction {
    fn name(&self) -> &str {
        "deploy"
    }

    async fn run(&self, rr: &mut ReconciliationRequest<T>) -> Result<(), ActionError> {
        let owner = rr
            .instance
            .controller_owner_ref(&())
            .context(MissingOwnerUidSnafu {
                name: rr.instance.name_any(),
            })
            .map_err(ActionError::stop)?;

        for index in 0..rr.resources.len() {
            let deployed = self
                .deploy(rr, &owner, &rr.resources[index])
                .await
                .map_err(|err| match err {
                    Error::MissingType { .. } => ActionError::stop(err),
                    _ => ActionError::retryable(err),
                })?;

            if let Some(deployed) = deployed {
                rr.resources[index] = deployed;
            }
        }

        Ok(())
    }
}

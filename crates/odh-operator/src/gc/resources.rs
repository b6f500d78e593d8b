use std::{fmt::Display, sync::Arc};

use arc_swap::ArcSwap;
use kube::core::{ApiResource, GroupVersionKind};

use crate::client::Scope;

/// An API type the operator is allowed to delete objects of.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Resource {
    group: String,
    version: String,
    kind: String,
    plural: String,
    scope: Scope,
}

impl Resource {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
        scope: Scope,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            scope,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn plural(&self) -> &str {
        &self.plural
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk(), &self.plural)
    }
}

impl Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{group}/{version}, Kind={kind}",
            group = self.group,
            version = self.version,
            kind = self.kind
        )
    }
}

/// The catalog of deletable API types.
///
/// Readers get a snapshot which stays valid while the catalog is replaced by a
/// concurrent refresh.
#[derive(Debug, Default)]
pub struct ResourceStore {
    items: ArcSwap<Vec<Resource>>,
}

impl ResourceStore {
    pub fn get(&self) -> Arc<Vec<Resource>> {
        self.items.load_full()
    }

    pub fn set(&self, items: Vec<Resource>) {
        self.items.store(Arc::new(items));
    }

    pub fn len(&self) -> usize {
        self.items.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.load().is_empty()
    }
}

//! Well-known annotation, label and finalizer keys stamped onto managed objects.
//!
//! The annotation keys form the staleness fingerprint the garbage collector
//! relies on, so their values must never change.

use std::collections::BTreeMap;

use const_format::concatcp;
use kube::core::ObjectMeta;

/// The platform specific key prefix.
const PLATFORM_KEY_PREFIX: &str = "platform.opendatahub.io/";

/// The component specific key prefix, used by older releases.
const COMPONENTS_KEY_PREFIX: &str = "components.platform.opendatahub.io/";

pub mod annotations {
    use super::*;

    /// The version of the operator release which produced the object, e.g. `2.19.0`.
    pub const PLATFORM_VERSION: &str = concatcp!(PLATFORM_KEY_PREFIX, "version");

    /// The platform flavour which produced the object, e.g. `OpenDataHub`.
    pub const PLATFORM_TYPE: &str = concatcp!(PLATFORM_KEY_PREFIX, "type");

    /// The `.metadata.generation` of the owning instance at the time the object
    /// was rendered.
    pub const INSTANCE_GENERATION: &str = concatcp!(PLATFORM_KEY_PREFIX, "instance.generation");

    /// The name of the owning instance.
    pub const INSTANCE_NAME: &str = concatcp!(PLATFORM_KEY_PREFIX, "instance.name");

    /// The UID of the owning instance.
    pub const INSTANCE_UID: &str = concatcp!(PLATFORM_KEY_PREFIX, "instance.uid");

    /// Generation key written by component controllers of older releases. It is
    /// accepted wherever [`INSTANCE_GENERATION`] is.
    pub const COMPONENT_GENERATION: &str = concatcp!(COMPONENTS_KEY_PREFIX, "component-generation");

    /// Set to `false` to opt an object out of any further management,
    /// including garbage collection.
    pub const MANAGED_BY_ODH_OPERATOR: &str = "opendatahub.io/managed";
}

pub mod labels {
    use super::*;

    /// Lowercased kind of the instance an object is part of, e.g. `dashboard`.
    pub const PLATFORM_PART_OF: &str = concatcp!(PLATFORM_KEY_PREFIX, "part-of");
}

/// Finalizer added to instances which have finalizer actions registered.
pub const PLATFORM_FINALIZER: &str = concatcp!(PLATFORM_KEY_PREFIX, "finalizer");

/// Returns the value of annotation `key`, if set.
pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Returns the value of label `key`, if set.
pub fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

pub fn set_annotation(meta: &mut ObjectMeta, key: impl Into<String>, value: impl Into<String>) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.into(), value.into());
}

pub fn set_label(meta: &mut ObjectMeta, key: impl Into<String>, value: impl Into<String>) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.into(), value.into());
}

/// Whether the object was explicitly marked as not managed by the operator.
pub fn is_unmanaged(meta: &ObjectMeta) -> bool {
    annotation(meta, annotations::MANAGED_BY_ODH_OPERATOR) == Some("false")
}

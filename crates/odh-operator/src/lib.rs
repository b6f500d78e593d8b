//! Building blocks of the Open Data Hub operator.
//!
//! - [`reconciler`] drives a [`actions::Pipeline`] of actions for every
//!   instance of a platform resource and reports the outcome as conditions.
//! - [`gc`] deletes objects which a newer reconciliation no longer produced,
//!   limited to the types the operator is allowed to list and delete.
//! - [`feature`] applies named groups of manifests tracked by `FeatureTracker`
//!   objects.
//! - [`metadata`] holds the annotation contract linking those pieces.

pub mod actions;
pub mod cli;
pub mod client;
pub mod conditions;
pub mod errors;
pub mod feature;
pub mod gc;
pub mod logging;
pub mod metadata;
pub mod reconciler;
pub mod release;
pub mod types;

#[cfg(test)]
mod testing;

// External re-exports
pub use k8s_openapi;
pub use kube;
pub use schemars;

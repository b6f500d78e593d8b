//! Reconcile actions and the pipeline running them.
//!
//! An [`Action`] is one step of a reconciliation: it reads and mutates the
//! [`ReconciliationRequest`], reports its progress through the condition
//! manager and returns an [`ActionError`] if the remaining steps must not run.

use async_trait::async_trait;

use crate::{
    errors::ActionError,
    types::{PlatformObject, ReconciliationRequest},
};

pub mod deploy;
pub mod deployments;
pub mod gc;
pub mod pipeline;

pub use deploy::DeployAction;
pub use deployments::DeploymentsAvailableAction;
pub use gc::GcAction;
pub use pipeline::{Pipeline, PipelineBuilder};

#[async_trait]
pub trait Action<T>: Send + Sync {
    /// Used in logs and error messages.
    fn name(&self) -> &str;

    async fn run(&self, rr: &mut ReconciliationRequest<T>) -> Result<(), ActionError>;
}

/// An [`Action`] backed by a synchronous function.
pub struct FnAction<F> {
    name: String,
    f: F,
}

impl<F> FnAction<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<T, F> Action<T> for FnAction<F>
where
    T: PlatformObject,
    F: Fn(&mut ReconciliationRequest<T>) -> Result<(), ActionError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, rr: &mut ReconciliationRequest<T>) -> Result<(), ActionError> {
        (self.f)(rr)
    }
}

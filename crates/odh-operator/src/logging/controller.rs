//! Logging of controller results.

use std::error::Error;

use kube::{
    Resource,
    core::DynamicObject,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
    },
};

use crate::{client::Client, logging::k8s_events::publish_reconcile_failure};

/// Classifies the errors a reconciler returns, so failures can be reported as
/// events on the failed instance.
pub trait ReconcilerError: Error {
    /// Short PascalCase name of the failure, used as the event reason.
    ///
    /// Usually the variant name, via [`strum::EnumDiscriminants`] and
    /// [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;

    /// The object the failure is about, if that is not the reconciled instance
    /// itself. A degraded FeatureTracker is one example.
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }
}

/// Logs one item of the result stream of a [`kube::runtime::Controller`].
///
/// Failed reconciliations are additionally recorded as a Warning event on the
/// instance.
pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    client: &Client,
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: std::error::Error,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "reconciled object"
            );
        }
        Err(err) => {
            tracing::error!(
                controller.name = controller_name,
                error = err as &dyn std::error::Error,
                "failed to reconcile object",
            );
            publish_reconcile_failure(client, controller_name, err);
        }
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::{
    actions::Action,
    client::ClusterClient,
    conditions::ConditionOptions,
    errors::{ActionError, BoxError, MultiError},
    feature::{
        Error, Feature, FeatureBuilder,
        tracker::{Source, SourceType},
    },
    types::{PlatformObject, ReconciliationRequest},
};

/// The features defined by one source, applied and deleted together.
pub struct FeaturesHandler {
    client: Arc<dyn ClusterClient>,
    source: Source,
    app_namespace: String,
    owner: Option<OwnerReference>,
    features: Vec<Feature>,
}

impl FeaturesHandler {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        source: Source,
        app_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            source,
            app_namespace: app_namespace.into(),
            owner: None,
            features: Vec::new(),
        }
    }

    /// Makes `owner` the owner of all feature trackers.
    pub fn owned_by(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Creates the feature, filling in the client, source, owner and
    /// namespaces it doesn't set itself.
    pub fn add(&mut self, builder: FeatureBuilder) -> Result<(), Error> {
        let feature = builder.inherit(self).create()?;
        self.features.push(feature);
        Ok(())
    }

    /// Applies all features in the order they were added.
    ///
    /// A failing feature doesn't keep the remaining ones from being applied,
    /// all errors are returned together.
    pub async fn apply(&self) -> Result<(), MultiError> {
        let mut errors: Vec<BoxError> = Vec::new();
        for feature in &self.features {
            if let Err(err) = feature.apply().await {
                warn!(
                    feature = feature.name(),
                    source = %self.source.name,
                    error = &err as &dyn std::error::Error,
                    "failed to apply feature"
                );
                errors.push(err.into());
            }
        }
        MultiError::from_errors(errors)
    }

    /// Cleans up all features in reverse order.
    pub async fn delete(&self) -> Result<(), MultiError> {
        let mut errors: Vec<BoxError> = Vec::new();
        for feature in self.features.iter().rev() {
            if let Err(err) = feature.cleanup().await {
                errors.push(err.into());
            }
        }
        MultiError::from_errors(errors)
    }
}

impl FeatureBuilder {
    fn inherit(mut self, handler: &FeaturesHandler) -> Self {
        if self.source == Source::default() {
            self.source = handler.source.clone();
        }
        if self.target_namespace.is_none() {
            self.target_namespace = Some(handler.app_namespace.clone());
        }
        if self.app_namespace.is_none() {
            self.app_namespace = Some(handler.app_namespace.clone());
        }
        if self.owner.is_none() {
            self.owner = handler.owner.clone();
        }
        if self.client.is_none() {
            self.client = Some(handler.client.clone());
        }
        self
    }
}

type Register<T> = Box<
    dyn Fn(&ReconciliationRequest<T>, &mut FeaturesHandler) -> Result<(), Error> + Send + Sync,
>;

/// An [`Action`] applying the features registered by a function for every
/// reconciliation of an instance.
///
/// Invalid feature definitions stop the reconciliation, failures while
/// applying are retried.
pub struct FeaturesAction<T> {
    name: String,
    source_type: SourceType,
    condition: Option<String>,
    register: Register<T>,
}

impl<T: PlatformObject> FeaturesAction<T> {
    pub fn new(
        name: impl Into<String>,
        register: impl Fn(&ReconciliationRequest<T>, &mut FeaturesHandler) -> Result<(), Error>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            source_type: SourceType::Component,
            condition: None,
            register: Box::new(register),
        }
    }

    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    /// Reports the outcome in the condition `type_` of the instance.
    pub fn with_condition(mut self, type_: impl Into<String>) -> Self {
        self.condition = Some(type_.into());
        self
    }
}

#[async_trait]
impl<T: PlatformObject> Action<T> for FeaturesAction<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, rr: &mut ReconciliationRequest<T>) -> Result<(), ActionError> {
        let mut handler = FeaturesHandler::new(
            rr.client.clone(),
            Source::new(self.source_type, rr.instance.name_any()),
            &rr.cluster_config.applications_namespace,
        );
        if let Some(owner) = rr.instance.controller_owner_ref(&()) {
            handler = handler.owned_by(owner);
        }
        (self.register)(rr, &mut handler).map_err(ActionError::stop)?;

        let result = handler.apply().await;
        if let Some(condition) = &self.condition {
            match &result {
                Ok(()) => rr.conditions.mark_true(condition, ConditionOptions::new()),
                Err(err) => rr
                    .conditions
                    .mark_false(condition, ConditionOptions::new().error(err)),
            }
        }
        result.map_err(ActionError::retryable)?;

        info!(
            action = %self.name,
            features = handler.features().len(),
            "features applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        conditions::{ConditionStatus, types},
        feature::{manifest::Manifest, tracker::FeatureTrackerStatus},
        testing::{APPLICATIONS_NAMESPACE, DASHBOARD_UID, Dashboard, FakeCluster, dashboard, request},
    };

    type Journal = Arc<Mutex<Vec<String>>>;

    fn recorded(journal: &Journal, name: &str) -> FeatureBuilder {
        let journal = journal.clone();
        Feature::define(name).on_delete(move |feature: &Feature| -> Result<(), BoxError> {
            journal.lock().unwrap().push(feature.name().to_owned());
            Ok(())
        })
    }

    fn config_map_manifest(name: &str) -> Manifest {
        Manifest::new(
            format!("{name}.yaml"),
            format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n"),
        )
    }

    fn handler(cluster: &Arc<FakeCluster>) -> FeaturesHandler {
        FeaturesHandler::new(
            cluster.clone(),
            Source::new(SourceType::Dsci, "default-dsci"),
            APPLICATIONS_NAMESPACE,
        )
    }

    #[tokio::test]
    async fn features_inherit_the_handler_settings() {
        let cluster = Arc::new(FakeCluster::new());
        let mut handler = handler(&cluster);
        handler
            .add(Feature::define("mesh-shared-configmap").manifests([config_map_manifest("mesh")]))
            .unwrap();
        handler
            .add(
                Feature::define("auth-namespace")
                    .target_namespace("opendatahub-auth-provider")
                    .manifests([config_map_manifest("auth")]),
            )
            .unwrap();

        handler.apply().await.unwrap();

        assert!(cluster.contains("ConfigMap", Some(APPLICATIONS_NAMESPACE), "mesh"));
        assert!(cluster.contains("ConfigMap", Some("opendatahub-auth-provider"), "auth"));
        let tracker = cluster
            .find("FeatureTracker", None, "opendatahub-auth-namespace")
            .unwrap();
        assert_eq!(tracker.data["spec"]["source"]["name"], "default-dsci");
    }

    #[tokio::test]
    async fn failing_features_do_not_block_the_others() {
        let cluster = Arc::new(FakeCluster::new());
        let mut handler = handler(&cluster);
        handler
            .add(Feature::define("broken").pre_conditions(
                |_: &Feature| -> Result<(), BoxError> { Err("crd is missing".into()) },
            ))
            .unwrap();
        handler
            .add(Feature::define("working").manifests([config_map_manifest("working")]))
            .unwrap();

        let err = handler.apply().await.unwrap_err();

        assert_eq!(err.errors().len(), 1);
        let failed = err.errors()[0].downcast_ref::<Error>().unwrap();
        assert!(matches!(failed, Error::PreConditions { feature, .. } if feature == "broken"));
        assert!(cluster.contains("ConfigMap", Some(APPLICATIONS_NAMESPACE), "working"));
    }

    #[tokio::test]
    async fn delete_runs_in_reverse_order() {
        let cluster = Arc::new(FakeCluster::new());
        let journal = Journal::default();
        let mut handler = handler(&cluster);
        for name in ["first", "second", "third"] {
            handler.add(recorded(&journal, name)).unwrap();
        }

        handler.apply().await.unwrap();
        assert_eq!(cluster.objects_of_kind("FeatureTracker").len(), 3);

        handler.delete().await.unwrap();

        assert_eq!(*journal.lock().unwrap(), vec!["third", "second", "first"]);
        assert!(cluster.objects_of_kind("FeatureTracker").is_empty());
    }

    #[tokio::test]
    async fn action_applies_features_owned_by_the_instance() {
        let cluster = Arc::new(FakeCluster::new());
        let mut rr = request(dashboard(1), cluster.clone());
        let action = FeaturesAction::<Dashboard>::new("service-mesh", |rr, handler| {
            let name = format!("{}-mesh-member", rr.instance.name_any());
            handler.add(Feature::define(name).manifests([config_map_manifest("member")]))
        })
        .with_condition(types::CAPABILITY_SERVICE_MESH);

        action.run(&mut rr).await.unwrap();

        let tracker = cluster
            .find(
                "FeatureTracker",
                None,
                "opendatahub-default-dashboard-mesh-member",
            )
            .unwrap();
        assert_eq!(tracker.owner_references()[0].uid, DASHBOARD_UID);
        assert_eq!(tracker.data["spec"]["source"]["type"], "Component");
        assert_eq!(
            rr.conditions
                .condition(types::CAPABILITY_SERVICE_MESH)
                .unwrap()
                .status,
            ConditionStatus::True
        );
    }

    #[tokio::test]
    async fn action_failures_are_retried_and_reported() {
        let cluster = Arc::new(FakeCluster::new());
        let mut rr = request(dashboard(1), cluster.clone());
        let action = FeaturesAction::<Dashboard>::new("service-mesh", |_, handler| {
            handler.add(Feature::define("mesh-member").post_conditions(
                |_: &Feature| -> Result<(), BoxError> { Err("pods are not ready".into()) },
            ))
        })
        .with_condition(types::CAPABILITY_SERVICE_MESH);

        let err = action.run(&mut rr).await.unwrap_err();

        assert!(!err.is_stop());
        let condition = rr
            .conditions
            .condition(types::CAPABILITY_SERVICE_MESH)
            .unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert!(condition.message.as_deref().unwrap().contains("pods are not ready"));

        let tracker = cluster
            .find("FeatureTracker", None, "opendatahub-mesh-member")
            .unwrap();
        let status: FeatureTrackerStatus =
            serde_json::from_value(tracker.data["status"].clone()).unwrap();
        assert_eq!(
            status.condition(types::DEGRADED).unwrap().reason.as_deref(),
            Some("PostConditions")
        );
    }

    #[tokio::test]
    async fn invalid_definitions_stop_the_reconciliation() {
        let cluster = Arc::new(FakeCluster::new());
        let mut rr = request(dashboard(1), cluster);
        let action = FeaturesAction::<Dashboard>::new("service-mesh", |_, handler| {
            handler.add(Feature::define("nowhere").target_namespace(""))
        });

        let err = action.run(&mut rr).await.unwrap_err();

        assert!(err.is_stop());
    }
}

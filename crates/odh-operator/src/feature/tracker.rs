//! The `FeatureTracker` custom resource.
//!
//! Every applied feature is represented by a cluster scoped tracker owning all
//! objects the feature created, so that deleting the tracker removes them.

use jiff::Timestamp;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::{
    CustomResource, Resource, ResourceExt,
    core::{ApiResource, DynamicObject},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::conditions::{Condition, ConditionStatus, HasStatusCondition, types};

#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "features.opendatahub.io",
    version = "v1",
    kind = "FeatureTracker",
    status = "FeatureTrackerStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct FeatureTrackerSpec {
    pub source: Source,
    pub app_namespace: String,
}

/// What defined a feature.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct Source {
    #[serde(rename = "type")]
    pub type_: SourceType,
    pub name: String,
}

impl Source {
    pub fn new(type_: SourceType, name: impl Into<String>) -> Self {
        Self {
            type_,
            name: name.into(),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum SourceType {
    Component,
    #[serde(rename = "DSCI")]
    #[strum(serialize = "DSCI")]
    Dsci,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureTrackerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl HasStatusCondition for FeatureTrackerStatus {
    fn conditions(&self) -> Vec<Condition> {
        self.conditions.clone()
    }

    fn set_conditions(&mut self, conditions: Vec<Condition>) {
        self.conditions = conditions;
    }
}

/// The step a feature was in when its status was last reported.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Reason {
    FeatureCreated,
    PreConditions,
    LoadTemplateData,
    ResourceCreation,
    ApplyManifests,
    PostConditions,
    /// Failures outside of any particular step.
    FailedApplying,
}

impl FeatureTracker {
    /// Trackers are cluster scoped, the applications namespace keeps the names
    /// of features of different installations apart.
    pub fn name_for(app_namespace: &str, feature: &str) -> String {
        format!("{app_namespace}-{feature}")
    }

    pub fn for_feature(
        feature: &str,
        source: Source,
        app_namespace: &str,
        owner: Option<OwnerReference>,
    ) -> Self {
        let mut tracker = Self::new(
            &Self::name_for(app_namespace, feature),
            FeatureTrackerSpec {
                source,
                app_namespace: app_namespace.to_owned(),
            },
        );
        if let Some(owner) = owner {
            tracker.owner_references_mut().push(owner);
        }
        tracker
    }

    pub fn api_resource() -> ApiResource {
        ApiResource::erase::<Self>(&())
    }

    pub fn to_dynamic(&self) -> serde_json::Result<DynamicObject> {
        serde_json::from_value(serde_json::to_value(self)?)
    }

    pub fn from_dynamic(object: &DynamicObject) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::to_value(object)?)
    }

    /// A reference making the tracker the (non controlling) owner of an object.
    pub fn to_owner_reference(&self) -> Option<OwnerReference> {
        Some(OwnerReference {
            api_version: Self::api_version(&()).into_owned(),
            kind: Self::kind(&()).into_owned(),
            name: self.name_any(),
            uid: self.uid()?,
            ..OwnerReference::default()
        })
    }
}

impl FeatureTrackerStatus {
    pub fn progressing(feature: &str, previous: Option<&Self>) -> Self {
        let mut status = previous.cloned().unwrap_or_default();
        status.phase = Some(types::PHASE_PROGRESSING.to_owned());
        upsert(
            &mut status.conditions,
            condition(
                types::PROGRESSING,
                ConditionStatus::True,
                Reason::FeatureCreated,
                format!("Applying feature [{feature}]"),
            ),
        );
        status
    }

    pub fn ready(feature: &str, previous: &Self) -> Self {
        let mut status = previous.clone();
        status.phase = Some(types::PHASE_READY.to_owned());
        let message = format!("Applied feature [{feature}] successfully");
        for (type_, value) in [
            (types::AVAILABLE, ConditionStatus::True),
            (types::PROGRESSING, ConditionStatus::False),
            (types::DEGRADED, ConditionStatus::False),
        ] {
            upsert(
                &mut status.conditions,
                condition(type_, value, Reason::FeatureCreated, message.clone()),
            );
        }
        status
    }

    pub fn failed(feature: &str, previous: &Self, reason: Reason, error: &str) -> Self {
        let mut status = previous.clone();
        status.phase = Some(types::PHASE_ERROR.to_owned());
        let message = format!("Failed applying [{feature}]: {error}");
        for (type_, value) in [
            (types::AVAILABLE, ConditionStatus::False),
            (types::PROGRESSING, ConditionStatus::False),
            (types::DEGRADED, ConditionStatus::True),
        ] {
            upsert(
                &mut status.conditions,
                condition(type_, value, reason, message.clone()),
            );
        }
        status
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

fn condition(type_: &str, status: ConditionStatus, reason: Reason, message: String) -> Condition {
    Condition {
        reason: Some(reason.to_string()),
        message: Some(message),
        ..Condition::new(type_, status)
    }
}

/// Replaces the condition of the same type, keeping its transition time if
/// the status didn't change.
fn upsert(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter().position(|c| c.type_ == condition.type_) {
        Some(index) => {
            let current = &conditions[index];
            condition.last_transition_time = if current.status == condition.status {
                current.last_transition_time.clone()
            } else {
                Some(Time(Timestamp::now()))
            };
            conditions[index] = condition;
        }
        None => {
            condition.last_transition_time = Some(Time(Timestamp::now()));
            conditions.push(condition);
        }
    }
}

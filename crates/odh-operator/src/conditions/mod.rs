//! Tracks the status conditions of a single resource.
//!
//! A [`Manager`] owns one "happy" condition (usually `Ready`) whose status is
//! derived from a set of dependent conditions. Actions mark dependents while
//! they run, and the happy condition follows the worst of them.

use std::{cmp::Ordering, collections::HashMap, error::Error};

use jiff::Timestamp;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::errors::full_message;

pub mod types;

/// A **data structure** that exposes the conditions of its status.
/// Should usually be implemented on the status of a `CustomResource`.
pub trait HasStatusCondition {
    fn conditions(&self) -> Vec<Condition>;
    fn set_conditions(&mut self, conditions: Vec<Condition>);
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of the condition, e.g. `Ready`.
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition, one of True, False, Unknown.
    pub status: ConditionStatus,

    /// The `.metadata.generation` the condition was set based upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the condition transitioned from one status to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    /// Last time the condition was checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<Time>,

    /// The reason for the condition's last transition, in `PascalCase`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// A human readable message indicating details about the transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// How much a non-True status of this condition affects the happy condition.
    #[serde(default, skip_serializing_if = "Severity::is_error")]
    pub severity: Severity,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            type_: type_.into(),
            status,
            ..Self::default()
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Only conditions with [`Severity::Error`] are taken into account when
/// computing the happy condition.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Info,
}

impl Severity {
    #[allow(clippy::trivially_copy_pass_by_ref)]
    fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

/// Optional details applied to a condition when marking it.
#[derive(Clone, Debug, Default)]
pub struct ConditionOptions {
    reason: Option<String>,
    message: Option<String>,
    observed_generation: Option<i64>,
    severity: Option<Severity>,
}

impl ConditionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Marks the condition as failed because of `err`: severity Error, reason
    /// `Error` and the full error chain as message.
    pub fn error(self, err: &(dyn Error + 'static)) -> Self {
        self.severity(Severity::Error)
            .reason(types::REASON_ERROR)
            .message(full_message(err))
    }

    fn apply(self, condition: &mut Condition) {
        condition.reason = self.reason;
        condition.message = self.message;
        condition.observed_generation = self.observed_generation;
        if let Some(severity) = self.severity {
            condition.severity = severity;
        }
    }
}

/// Owns the conditions of one resource and keeps the happy condition in sync
/// with its dependents.
#[derive(Clone, Debug)]
pub struct Manager {
    happy: String,
    dependents: Vec<String>,
    conditions: Vec<Condition>,
}

impl Manager {
    /// Creates a manager over `conditions`, usually the ones currently stored on
    /// the resource status.
    ///
    /// Dependents equal to `happy` or listed twice are ignored. Missing
    /// conditions are initialized: the happy condition as Unknown, dependents as
    /// True if the happy condition already is, otherwise as Unknown.
    pub fn new(
        conditions: Vec<Condition>,
        happy: impl Into<String>,
        dependents: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let happy = happy.into();
        let mut deps: Vec<String> = Vec::new();
        for dependent in dependents.into_iter().map(Into::into) {
            if dependent != happy && !deps.contains(&dependent) {
                deps.push(dependent);
            }
        }

        let mut manager = Self {
            happy,
            dependents: deps,
            conditions,
        };
        manager.initialize_conditions();
        manager
    }

    fn initialize_conditions(&mut self) {
        let happy_status = match self.top_level_condition() {
            Some(happy) => happy.status,
            None => {
                self.set_condition(Condition::new(self.happy.clone(), ConditionStatus::Unknown));
                ConditionStatus::Unknown
            }
        };

        let status = if happy_status == ConditionStatus::True {
            ConditionStatus::True
        } else {
            ConditionStatus::Unknown
        };

        for dependent in self.dependents.clone() {
            if self.condition(&dependent).is_none() {
                self.set_condition(Condition::new(dependent, status));
            }
        }
    }

    pub fn happy_type(&self) -> &str {
        &self.happy
    }

    pub fn is_happy(&self) -> bool {
        self.top_level_condition().is_some_and(Condition::is_true)
    }

    pub fn top_level_condition(&self) -> Option<&Condition> {
        self.condition(&self.happy)
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn into_conditions(self) -> Vec<Condition> {
        self.conditions
    }

    /// Stores `condition` and recomputes the happy condition if anything changed.
    ///
    /// The transition time is only bumped when the status changes.
    pub fn set_condition(&mut self, condition: Condition) {
        if !self.store(condition.clone()) {
            return;
        }

        self.recompute_happiness(&condition.type_);
    }

    /// Removes the condition of the given type, if present.
    pub fn clear_condition(&mut self, type_: &str) {
        let before = self.conditions.len();
        self.conditions.retain(|c| c.type_ != type_);

        if self.conditions.len() != before {
            self.recompute_happiness(type_);
        }
    }

    pub fn mark(&mut self, type_: &str, status: ConditionStatus, options: ConditionOptions) {
        let mut condition = Condition::new(type_, status);
        options.apply(&mut condition);
        self.set_condition(condition);
    }

    pub fn mark_true(&mut self, type_: &str, options: ConditionOptions) {
        self.mark(type_, ConditionStatus::True, options);
    }

    pub fn mark_false(&mut self, type_: &str, options: ConditionOptions) {
        self.mark(type_, ConditionStatus::False, options);
    }

    pub fn mark_unknown(&mut self, type_: &str, options: ConditionOptions) {
        self.mark(type_, ConditionStatus::Unknown, options);
    }

    /// Copies status, reason, message and severity of `from` into the condition
    /// of the given type.
    pub fn mark_from(&mut self, type_: &str, from: &Condition) {
        self.set_condition(Condition {
            type_: type_.to_owned(),
            status: from.status,
            reason: from.reason.clone(),
            message: from.message.clone(),
            severity: from.severity,
            ..Condition::default()
        });
    }

    /// Derives the happy condition from the dependents.
    ///
    /// `changed` is the type of the condition that triggered the computation. If
    /// no dependent is unhappy the happy condition becomes True, unless the
    /// trigger was the happy condition itself.
    pub fn recompute_happiness(&mut self, changed: &str) {
        if let Some(unhappy) = self.find_unhappy_dependent() {
            self.set_condition(Condition {
                type_: self.happy.clone(),
                status: unhappy.status,
                reason: unhappy.reason,
                message: unhappy.message,
                ..Condition::default()
            });
        } else if changed != self.happy {
            self.set_condition(Condition::new(self.happy.clone(), ConditionStatus::True));
        }
    }

    /// Sorts the conditions: happy first, then dependents in declaration order,
    /// then everything else alphabetically.
    pub fn sort(&mut self) {
        let dependents = self.dependents.len();
        let mut priorities: HashMap<&str, usize> = self
            .dependents
            .iter()
            .enumerate()
            .map(|(i, d)| (d.as_str(), dependents - i))
            .collect();
        priorities.insert(self.happy.as_str(), dependents + 1);

        let mut conditions = std::mem::take(&mut self.conditions);
        conditions.sort_by(|a, b| {
            let pa = priorities.get(a.type_.as_str()).copied().unwrap_or_default();
            let pb = priorities.get(b.type_.as_str()).copied().unwrap_or_default();
            pb.cmp(&pa).then_with(|| a.type_.cmp(&b.type_))
        });
        self.conditions = conditions;
    }

    /// Drops every condition which is neither the happy condition nor a
    /// dependent, so conditions set by earlier releases get cleaned up.
    pub fn reset(&mut self) {
        let happy = &self.happy;
        let dependents = &self.dependents;
        self.conditions
            .retain(|c| &c.type_ == happy || dependents.contains(&c.type_));
        self.initialize_conditions();
    }

    /// Returns true if the stored conditions changed.
    fn store(&mut self, mut condition: Condition) -> bool {
        let now = Time(Timestamp::now());

        let Some(index) = self
            .conditions
            .iter()
            .position(|c| c.type_ == condition.type_)
        else {
            if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(now);
            }
            self.conditions.push(condition);
            return true;
        };
        let existing = &mut self.conditions[index];

        let mut changed = false;
        if existing.status != condition.status {
            existing.status = condition.status;
            existing.last_transition_time = Some(condition.last_transition_time.unwrap_or(now));
            changed = true;
        }
        if existing.reason != condition.reason {
            existing.reason = condition.reason;
            changed = true;
        }
        if existing.message != condition.message {
            existing.message = condition.message;
            changed = true;
        }
        if existing.observed_generation != condition.observed_generation {
            existing.observed_generation = condition.observed_generation;
            changed = true;
        }
        if existing.severity != condition.severity {
            existing.severity = condition.severity;
            changed = true;
        }

        changed
    }

    /// Picks the most recently transitioned Error severity dependent that is
    /// False, or failing that Unknown. Without declared dependents every
    /// condition except the happy one counts.
    fn find_unhappy_dependent(&self) -> Option<Condition> {
        let mut candidates: Vec<&Condition> = self
            .conditions
            .iter()
            .filter(|c| {
                if self.dependents.is_empty() {
                    c.type_ != self.happy
                } else {
                    self.dependents.contains(&c.type_)
                }
            })
            .filter(|c| c.severity == Severity::Error)
            .collect();

        candidates.sort_by(|a, b| compare_transition_desc(a, b));

        candidates
            .iter()
            .find(|c| c.status == ConditionStatus::False)
            .or_else(|| {
                candidates
                    .iter()
                    .find(|c| c.status == ConditionStatus::Unknown)
            })
            .map(|c| (*c).clone())
    }
}

fn compare_transition_desc(a: &Condition, b: &Condition) -> Ordering {
    let a = a.last_transition_time.as_ref().map(|t| t.0);
    let b = b.last_transition_time.as_ref().map(|t| t.0);
    b.cmp(&a)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const READY: &str = "Ready";
    const DEPENDENCY_1: &str = "Dependency1";
    const DEPENDENCY_2: &str = "Dependency2";

    fn types(manager: &Manager) -> Vec<&str> {
        manager.conditions().iter().map(|c| c.type_.as_str()).collect()
    }

    #[test]
    fn initializes_missing_conditions() {
        let manager = Manager::new(Vec::new(), READY, [DEPENDENCY_1, DEPENDENCY_2]);

        assert_eq!(manager.conditions().len(), 3);
        assert_eq!(
            manager.top_level_condition().unwrap().status,
            ConditionStatus::Unknown
        );
        assert!(manager.condition(DEPENDENCY_1).is_some());
        assert!(manager.condition(DEPENDENCY_2).is_some());
    }

    #[test]
    fn ignores_duplicate_dependents() {
        let manager = Manager::new(Vec::new(), READY, [DEPENDENCY_1, READY, DEPENDENCY_1]);
        assert_eq!(types(&manager), vec![READY, DEPENDENCY_1]);
    }

    #[test]
    fn dependents_start_true_when_already_happy() {
        let manager = Manager::new(
            vec![Condition::new(READY, ConditionStatus::True)],
            READY,
            [DEPENDENCY_1],
        );

        assert!(manager.condition(DEPENDENCY_1).unwrap().is_true());
        assert!(manager.is_happy());
    }

    #[test]
    fn happy_once_all_dependents_are_true() {
        let mut manager = Manager::new(Vec::new(), READY, [DEPENDENCY_1, DEPENDENCY_2]);
        assert!(!manager.is_happy());

        manager.mark_false(DEPENDENCY_1, ConditionOptions::new());
        manager.mark_false(DEPENDENCY_2, ConditionOptions::new());
        assert!(!manager.is_happy());

        manager.mark_true(DEPENDENCY_1, ConditionOptions::new());
        assert!(!manager.is_happy());

        manager.mark_true(DEPENDENCY_2, ConditionOptions::new());
        assert!(manager.is_happy());
    }

    #[test]
    fn without_dependents_every_condition_counts() {
        let mut manager = Manager::new(
            vec![
                Condition::new(DEPENDENCY_1, ConditionStatus::Unknown),
                Condition::new(DEPENDENCY_2, ConditionStatus::Unknown),
            ],
            READY,
            Vec::<String>::new(),
        );
        assert!(!manager.is_happy());

        manager.mark_false(DEPENDENCY_1, ConditionOptions::new());
        assert!(!manager.is_happy());

        manager.mark_true(DEPENDENCY_1, ConditionOptions::new());
        assert!(!manager.is_happy());

        manager.mark_false(DEPENDENCY_2, ConditionOptions::new());
        assert!(!manager.is_happy());

        manager.mark_true(DEPENDENCY_2, ConditionOptions::new());
        assert!(manager.is_happy());
    }

    #[test]
    fn happy_condition_mirrors_unhappy_dependent() {
        let mut manager = Manager::new(Vec::new(), READY, [DEPENDENCY_1, DEPENDENCY_2]);

        manager.mark_true(DEPENDENCY_1, ConditionOptions::new());
        manager.mark_false(
            DEPENDENCY_2,
            ConditionOptions::new()
                .reason("ServiceMeshNotConfigured")
                .message("service mesh is not configured")
                .severity(Severity::Error),
        );

        let happy = manager.top_level_condition().unwrap();
        assert_eq!(happy.status, ConditionStatus::False);
        assert_eq!(happy.reason.as_deref(), Some("ServiceMeshNotConfigured"));
        assert_eq!(
            happy.message.as_deref(),
            Some("service mesh is not configured")
        );

        manager.mark_true(DEPENDENCY_2, ConditionOptions::new());
        assert!(manager.is_happy());
    }

    #[rstest]
    #[case::warning(Severity::Warning)]
    #[case::info(Severity::Info)]
    fn non_error_severities_do_not_affect_happiness(#[case] severity: Severity) {
        let mut manager = Manager::new(Vec::new(), READY, [DEPENDENCY_1]);

        manager.mark_false(DEPENDENCY_1, ConditionOptions::new().severity(severity));
        assert!(manager.is_happy());
    }

    #[test]
    fn false_wins_over_unknown() {
        let mut manager = Manager::new(Vec::new(), READY, [DEPENDENCY_1, DEPENDENCY_2]);

        manager.mark_false(DEPENDENCY_1, ConditionOptions::new().reason("Broken"));
        manager.mark_unknown(DEPENDENCY_2, ConditionOptions::new().reason("Pending"));

        let happy = manager.top_level_condition().unwrap();
        assert_eq!(happy.status, ConditionStatus::False);
        assert_eq!(happy.reason.as_deref(), Some("Broken"));
    }

    #[test]
    fn set_and_clear_condition() {
        let mut manager = Manager::new(Vec::new(), READY, [DEPENDENCY_1]);

        manager.mark_true(DEPENDENCY_1, ConditionOptions::new());
        assert!(manager.condition(DEPENDENCY_1).unwrap().is_true());

        manager.clear_condition(DEPENDENCY_1);
        assert!(manager.condition(DEPENDENCY_1).is_none());
    }

    #[test]
    fn transition_time_is_kept_when_status_is_unchanged() {
        let mut manager = Manager::new(Vec::new(), READY, [DEPENDENCY_1]);
        manager.mark_true(DEPENDENCY_1, ConditionOptions::new());
        let first = manager
            .condition(DEPENDENCY_1)
            .unwrap()
            .last_transition_time
            .clone();

        manager.mark_true(DEPENDENCY_1, ConditionOptions::new().message("still fine"));
        let condition = manager.condition(DEPENDENCY_1).unwrap();

        assert_eq!(condition.last_transition_time, first);
        assert_eq!(condition.message.as_deref(), Some("still fine"));
    }

    #[test]
    fn error_option_uses_full_chain() {
        let mut manager = Manager::new(Vec::new(), READY, [DEPENDENCY_1]);
        let err = crate::errors::ActionError::retryable("api server unavailable");

        manager.mark_false(DEPENDENCY_1, ConditionOptions::new().error(&err));

        let condition = manager.condition(DEPENDENCY_1).unwrap();
        assert_eq!(condition.reason.as_deref(), Some(types::REASON_ERROR));
        assert_eq!(
            condition.message.as_deref(),
            Some("reconciliation action failed: api server unavailable")
        );
    }

    #[test]
    fn sort_puts_happy_and_dependents_first() {
        let mut manager = Manager::new(Vec::new(), "Z", ["A", "C"]);
        manager.mark_true("B", ConditionOptions::new());
        manager.mark_true("D", ConditionOptions::new());
        manager.mark_true("E", ConditionOptions::new());

        manager.sort();

        assert_eq!(types(&manager), vec!["Z", "A", "C", "B", "D", "E"]);
    }

    #[test]
    fn reset_drops_foreign_conditions() {
        let mut manager = Manager::new(
            vec![Condition::new("Legacy", ConditionStatus::False)],
            READY,
            [DEPENDENCY_1],
        );

        manager.reset();

        assert!(manager.condition("Legacy").is_none());
        assert!(manager.condition(READY).is_some());
        assert!(manager.condition(DEPENDENCY_1).is_some());
    }

    #[test]
    fn serializes_in_kubernetes_layout() {
        let condition = Condition {
            reason: Some("Error".to_owned()),
            observed_generation: Some(3),
            ..Condition::new(READY, ConditionStatus::False)
        };

        let value = serde_json::to_value(&condition).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "type": "Ready",
                "status": "False",
                "observedGeneration": 3,
                "reason": "Error",
            })
        );
    }
}

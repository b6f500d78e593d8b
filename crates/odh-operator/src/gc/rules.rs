//! Matching discovered API types against RBAC resource rules.

use std::collections::HashSet;

use k8s_openapi::{
    api::authorization::v1::ResourceRule,
    apimachinery::pkg::apis::meta::v1::{APIResource, APIResourceList},
};

use crate::{client::Scope, gc::resources::Resource};

pub const DELETE_VERB: &str = "delete";
pub const ANY_VERB: &str = "*";
pub const ANY_RESOURCE: &str = "*";

/// Whether `rule` covers the API group and resource name of `resource`.
///
/// Verbs are not taken into account.
pub fn matches_rule(group: &str, resource: &APIResource, rule: &ResourceRule) -> bool {
    let groups = rule.api_groups.as_deref().unwrap_or_default();
    if !groups.iter().any(|g| g == ANY_RESOURCE || g == group) {
        return false;
    }

    let resources = rule.resources.as_deref().unwrap_or_default();
    resources
        .iter()
        .any(|r| r == ANY_RESOURCE || r == &resource.name)
}

/// Whether `rule` grants the delete verb.
pub fn grants_delete(rule: &ResourceRule) -> bool {
    rule.verbs.iter().any(|v| v == DELETE_VERB || v == ANY_VERB)
}

fn supports_delete(resource: &APIResource) -> bool {
    resource.verbs.iter().any(|v| v == DELETE_VERB)
}

fn is_deletable(group: &str, resource: &APIResource, rules: &[ResourceRule]) -> bool {
    rules
        .iter()
        .any(|rule| grants_delete(rule) && matches_rule(group, resource, rule))
}

/// Splits `group/version`, or a bare `version` of the core group.
fn parse_group_version(group_version: &str) -> (&str, &str) {
    group_version.split_once('/').unwrap_or(("", group_version))
}

/// Computes the API types which advertise the delete verb and which `rules`
/// allow deleting.
///
/// The result is de-duplicated and sorted by its string form.
pub fn compute_deletable_resources(
    lists: &[APIResourceList],
    rules: &[ResourceRule],
) -> Vec<Resource> {
    let mut deletable = HashSet::new();

    for list in lists {
        let (group, version) = parse_group_version(&list.group_version);

        for api_resource in &list.resources {
            // subresources like pods/log can't be deleted on their own
            if api_resource.name.contains('/') || !supports_delete(api_resource) {
                continue;
            }

            let rule_group = api_resource
                .group
                .as_deref()
                .filter(|g| !g.is_empty())
                .unwrap_or(group);
            if !is_deletable(rule_group, api_resource, rules) {
                continue;
            }

            let scope = if api_resource.namespaced {
                Scope::Namespaced
            } else {
                Scope::Cluster
            };
            deletable.insert(Resource::new(
                group,
                version,
                &api_resource.kind,
                &api_resource.name,
                scope,
            ));
        }
    }

    let mut resources: Vec<Resource> = deletable.into_iter().collect();
    resources.sort_by_key(ToString::to_string);
    resources
}

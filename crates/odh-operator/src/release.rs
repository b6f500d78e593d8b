//! Identity of the operator release producing a reconciliation.

use std::fmt::Display;

use semver::Version;
use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString};

/// The platform flavour the operator is built for.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    EnumString,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    StrumDisplay,
    clap::ValueEnum,
)]
pub enum Platform {
    #[default]
    #[strum(serialize = "Open Data Hub")]
    #[serde(rename = "Open Data Hub")]
    #[value(name = "OpenDataHub")]
    OpenDataHub,

    #[strum(serialize = "OpenShift AI Self-Managed")]
    #[serde(rename = "OpenShift AI Self-Managed")]
    #[value(name = "SelfManagedRhoai")]
    SelfManagedRhoai,

    #[strum(serialize = "OpenShift AI Cloud Service")]
    #[serde(rename = "OpenShift AI Cloud Service")]
    #[value(name = "ManagedRhoai")]
    ManagedRhoai,
}

/// The release stamped onto every object the operator creates.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Release {
    pub name: Platform,
    pub version: Version,
}

impl Release {
    pub fn new(name: Platform, version: Version) -> Self {
        Self { name, version }
    }
}

impl Default for Release {
    fn default() -> Self {
        Self {
            name: Platform::default(),
            version: Version::new(0, 0, 0),
        }
    }
}

impl Display for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::odh("Open Data Hub", Platform::OpenDataHub)]
    #[case::self_managed("OpenShift AI Self-Managed", Platform::SelfManagedRhoai)]
    #[case::managed("OpenShift AI Cloud Service", Platform::ManagedRhoai)]
    fn platform_annotation_values(#[case] input: &str, #[case] expected: Platform) {
        assert_eq!(Platform::from_str(input).unwrap(), expected);
        assert_eq!(expected.to_string(), input);
        assert_eq!(serde_json::to_value(expected).unwrap(), input);
    }

    #[test]
    fn release_display() {
        let release = Release::new(Platform::OpenDataHub, Version::new(2, 19, 0));
        assert_eq!(release.to_string(), "Open Data Hub 2.19.0");
    }

    #[test]
    fn release_serializes_version_as_string() {
        let release = Release::new(Platform::SelfManagedRhoai, Version::new(2, 19, 1));

        let value = serde_json::to_value(&release).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"name": "OpenShift AI Self-Managed", "version": "2.19.1"})
        );
        assert_eq!(serde_json::from_value::<Release>(value).unwrap(), release);
    }
}

//! Manifests applied by a feature.
//!
//! Manifests whose path contains `.tmpl` are rendered as templates against the
//! feature data first; manifests whose path contains `.patch` are merged into
//! existing objects instead of being applied.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use kube::core::DynamicObject;
use minijinja::{Environment, UndefinedBehavior};
use serde::Deserialize;
use serde_json::Value;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read manifest {path:?}"))]
    ReadManifest {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to render template {name:?}"))]
    RenderTemplate {
        source: minijinja::Error,
        name: String,
    },

    #[snafu(display("manifest {name:?} is not valid YAML"))]
    ParseYaml {
        source: serde_yaml::Error,
        name: String,
    },

    #[snafu(display("document {index} of manifest {name:?} is not a Kubernetes object"))]
    ParseObject {
        source: serde_yaml::Error,
        name: String,
        index: usize,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Manifest {
    name: String,
    content: String,
}

impl Manifest {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).context(ReadManifestSnafu { path })?;
        Ok(Self::new(path.display().to_string(), content))
    }

    /// Loads every file below `dir`, ordered by path.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Self>, Error> {
        let mut paths = Vec::new();
        collect_files(dir.as_ref(), &mut paths)?;
        paths.sort();
        paths.iter().map(Self::from_path).collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_template(&self) -> bool {
        self.name.contains(".tmpl")
    }

    pub fn is_patch(&self) -> bool {
        self.name.contains(".patch")
    }

    /// Renders the manifest if it is a template and splits it into objects.
    ///
    /// Empty documents are skipped. Templates referencing data which is not
    /// part of `data` fail to render.
    pub fn process(&self, data: &BTreeMap<String, Value>) -> Result<Vec<DynamicObject>, Error> {
        let rendered;
        let content = if self.is_template() {
            rendered = render(&self.content, data).context(RenderTemplateSnafu { name: &self.name })?;
            &rendered
        } else {
            &self.content
        };

        let mut objects = Vec::new();
        for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
            let value = serde_yaml::Value::deserialize(document)
                .context(ParseYamlSnafu { name: &self.name })?;
            if value.is_null() {
                continue;
            }
            let object = serde_yaml::from_value(value).context(ParseObjectSnafu {
                name: &self.name,
                index,
            })?;
            objects.push(object);
        }
        Ok(objects)
    }
}

fn collect_files(dir: &Path, paths: &mut Vec<PathBuf>) -> Result<(), Error> {
    let entries = fs::read_dir(dir).context(ReadManifestSnafu { path: dir })?;
    for entry in entries {
        let path = entry.context(ReadManifestSnafu { path: dir })?.path();
        if path.is_dir() {
            collect_files(&path, paths)?;
        } else {
            paths.push(path);
        }
    }
    Ok(())
}

fn render(source: &str, data: &BTreeMap<String, Value>) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_filter("replace_char", replace_char);
    env.render_str(source, data)
}

/// `{{ value | replace_char("-", "_") }}`
fn replace_char(value: String, from: String, to: String) -> String {
    value.replace(&from, &to)
}

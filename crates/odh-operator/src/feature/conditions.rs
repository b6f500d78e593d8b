//! Stock pre- and postconditions, and the polling they are built on.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};

use crate::{
    client::{self, ClusterClient},
    errors::BoxError,
    feature::{Feature, FeatureAction},
};

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("gave up waiting for {what} after {timeout:?}"))]
    Timeout { what: String, timeout: Duration },

    #[snafu(display("failed checking whether {what}"))]
    Check { source: BoxError, what: String },

    #[snafu(display("CustomResourceDefinition {name:?} is not installed"))]
    CrdNotInstalled { name: String },

    #[snafu(display("failed to look up CustomResourceDefinition {name:?}"))]
    GetCrd { source: client::Error, name: String },

    #[snafu(display("failed to create namespace {name:?}"))]
    CreateNamespace { source: client::Error, name: String },
}

/// Calls `check` every [`POLL_INTERVAL`] until it returns `true`.
///
/// The first check happens after one interval. Errors returned by `check`
/// end the polling immediately.
pub async fn poll_until<F, Fut>(what: &str, timeout: Duration, mut check: F) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, BoxError>>,
{
    let polling = async {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if check().await.context(CheckSnafu { what })? {
                return Ok::<_, Error>(());
            }
            debug!(what, "condition not met yet");
        }
    };

    tokio::time::timeout(timeout, polling)
        .await
        .unwrap_or_else(|_| TimeoutSnafu { what, timeout }.fail())
}

fn core_v1(kind: &str) -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", kind)
}

async fn resolve(client: &dyn ClusterClient, gvk: &GroupVersionKind) -> Result<ApiResource, BoxError> {
    Ok(client.resolve(gvk).await?.0)
}

/// A pod counts as ready unless its `Ready` condition is anything but `True`.
fn is_pod_ready(pod: &DynamicObject) -> bool {
    let conditions = pod.data["status"]["conditions"].as_array();
    !conditions.into_iter().flatten().any(|condition| {
        condition["type"] == "Ready" && condition["status"] != "True"
    })
}

/// Waits until all pods matching `selector` in `namespace` are ready.
#[derive(Clone, Debug)]
pub struct WaitForPodsReady {
    namespace: String,
    selector: Option<String>,
    timeout: Duration,
}

pub fn wait_for_pods_ready(namespace: impl Into<String>, selector: Option<&str>) -> WaitForPodsReady {
    WaitForPodsReady {
        namespace: namespace.into(),
        selector: selector.map(str::to_owned),
        timeout: POLL_TIMEOUT,
    }
}

impl WaitForPodsReady {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl FeatureAction for WaitForPodsReady {
    async fn run(&self, feature: &Feature) -> Result<(), BoxError> {
        let client = feature.client();
        let pods = resolve(client, &core_v1("Pod")).await?;
        info!(
            feature = feature.name(),
            namespace = %self.namespace,
            "waiting for pods to become ready"
        );

        let what = format!("pods in namespace {:?} are ready", self.namespace);
        poll_until(&what, self.timeout, || async {
            let items = client
                .list(&pods, Some(self.namespace.as_str()), self.selector.as_deref())
                .await?;
            let ready = items.iter().filter(|pod| is_pod_ready(pod)).count();
            Ok::<_, BoxError>(ready == items.len())
        })
        .await?;
        Ok(())
    }
}

/// Waits until at least one object of `gvk` exists in `namespace`.
#[derive(Clone, Debug)]
pub struct WaitForResourceToBeCreated {
    gvk: GroupVersionKind,
    namespace: String,
    timeout: Duration,
}

pub fn wait_for_resource_to_be_created(
    gvk: GroupVersionKind,
    namespace: impl Into<String>,
) -> WaitForResourceToBeCreated {
    WaitForResourceToBeCreated {
        gvk,
        namespace: namespace.into(),
        timeout: POLL_TIMEOUT,
    }
}

impl WaitForResourceToBeCreated {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl FeatureAction for WaitForResourceToBeCreated {
    async fn run(&self, feature: &Feature) -> Result<(), BoxError> {
        let client = feature.client();
        let what = format!("{} exists in namespace {:?}", self.gvk.kind, self.namespace);

        poll_until(&what, self.timeout, || async {
            // The type itself may only show up once its operator is installed
            let resource = match client.resolve(&self.gvk).await {
                Ok((resource, _)) => resource,
                Err(err) if err.is_not_found() => return Ok(false),
                Err(err) => return Err(err.into()),
            };
            let items = client
                .list(&resource, Some(self.namespace.as_str()), None)
                .await?;
            Ok::<_, BoxError>(!items.is_empty())
        })
        .await?;
        Ok(())
    }
}

/// Fails unless the CustomResourceDefinition `name` (`<plural>.<group>`) exists.
#[derive(Clone, Debug)]
pub struct EnsureCrdInstalled {
    name: String,
}

pub fn ensure_crd_installed(name: impl Into<String>) -> EnsureCrdInstalled {
    EnsureCrdInstalled { name: name.into() }
}

#[async_trait]
impl FeatureAction for EnsureCrdInstalled {
    async fn run(&self, feature: &Feature) -> Result<(), BoxError> {
        let client = feature.client();
        let crds = resolve(
            client,
            &GroupVersionKind::gvk("apiextensions.k8s.io", "v1", "CustomResourceDefinition"),
        )
        .await?;

        match client
            .get(&crds, None, &self.name)
            .await
            .context(GetCrdSnafu { name: &self.name })?
        {
            Some(_) => Ok(()),
            None => Err(CrdNotInstalledSnafu { name: &self.name }.build().into()),
        }
    }
}

/// Creates the namespace `name` unless it exists already.
#[derive(Clone, Debug)]
pub struct CreateNamespace {
    name: String,
}

pub fn create_namespace(name: impl Into<String>) -> CreateNamespace {
    CreateNamespace { name: name.into() }
}

#[async_trait]
impl FeatureAction for CreateNamespace {
    async fn run(&self, feature: &Feature) -> Result<(), BoxError> {
        let client = feature.client();
        let namespaces = resolve(client, &core_v1("Namespace")).await?;
        if client.get(&namespaces, None, &self.name).await?.is_some() {
            return Ok(());
        }

        let namespace = DynamicObject::new(&self.name, &namespaces);
        client
            .apply(&namespaces, &namespace)
            .await
            .context(CreateNamespaceSnafu { name: &self.name })?;
        Ok(())
    }
}

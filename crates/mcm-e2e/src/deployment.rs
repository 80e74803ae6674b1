//! In-cluster controllers: image override of the machine-controller-manager
//! deployment and its restoration at teardown

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info};

use mcm_e2e_common::retry::retry_on_conflict;

use crate::error::{Error, Result};

/// Deployment running both controllers in a seed namespace
pub const MCM_DEPLOYMENT: &str = "machine-controller-manager";
pub const MCM_CONTAINER: &str = "machine-controller-manager";
pub const MC_CONTAINER: &str = "machine-controller";
pub const MCM_IMAGE_REPOSITORY: &str = "eu.gcr.io/gardener-project/gardener/machine-controller-manager";
pub const MC_IMAGE_REPOSITORY: &str =
    "eu.gcr.io/gardener-project/gardener/machine-controller-manager-provider-aws";

/// Image tags to roll out for the two controller containers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageOverride {
    pub mcm_tag: Option<String>,
    pub mc_tag: Option<String>,
}

impl ImageOverride {
    pub fn is_empty(&self) -> bool {
        self.mcm_tag.is_none() && self.mc_tag.is_none()
    }

    /// Rewrite the images of the matching containers; returns whether
    /// anything changed
    fn apply(&self, deployment: &mut Deployment) -> bool {
        let Some(pod) = deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
        else {
            return false;
        };

        let mut changed = false;
        for container in &mut pod.containers {
            let image = match container.name.as_str() {
                MCM_CONTAINER => self.mcm_tag.as_ref().map(|t| format!("{MCM_IMAGE_REPOSITORY}:{t}")),
                MC_CONTAINER => self.mc_tag.as_ref().map(|t| format!("{MC_IMAGE_REPOSITORY}:{t}")),
                _ => None,
            };
            if let Some(image) = image {
                if container.image.as_deref() != Some(image.as_str()) {
                    debug!(container = %container.name, image = %image, "Overriding image");
                    container.image = Some(image);
                    changed = true;
                }
            }
        }
        changed
    }
}

/// The controller deployment of one seed namespace.
///
/// The spec seen before the first override is kept so [`restore`](Self::restore)
/// can put it back.
pub struct ControllerDeployment {
    api: Api<Deployment>,
    namespace: String,
    original: Option<Deployment>,
}

impl ControllerDeployment {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            original: None,
        }
    }

    pub async fn override_images(&mut self, images: &ImageOverride) -> Result<()> {
        if images.is_empty() {
            return Ok(());
        }

        let api = &self.api;
        let resource = format!("Deployment/{MCM_DEPLOYMENT}");
        let original = retry_on_conflict(&resource, || async move {
            let mut current = api.get(MCM_DEPLOYMENT).await?;
            let before = current.clone();
            if images.apply(&mut current) {
                api.replace(MCM_DEPLOYMENT, &PostParams::default(), &current)
                    .await?;
            }
            Ok::<_, mcm_e2e_common::Error>(before)
        })
        .await?;

        if self.original.is_none() {
            self.original = Some(original);
        }
        info!(
            namespace = %self.namespace,
            mcm_tag = ?images.mcm_tag,
            mc_tag = ?images.mc_tag,
            "Overrode controller images"
        );
        Ok(())
    }

    /// Put back the spec seen before the first override. No-op if nothing
    /// was overridden.
    pub async fn restore(&mut self) -> Result<()> {
        let Some(original) = self.original.take() else {
            return Ok(());
        };
        let spec = original
            .spec
            .ok_or_else(|| Error::assertion("original controller deployment had no spec"))?;

        let api = &self.api;
        let spec = &spec;
        let resource = format!("Deployment/{MCM_DEPLOYMENT}");
        retry_on_conflict(&resource, || async move {
            let mut current = api.get(MCM_DEPLOYMENT).await?;
            current.spec = Some(spec.clone());
            api.replace(MCM_DEPLOYMENT, &PostParams::default(), &current)
                .await?;
            Ok::<_, mcm_e2e_common::Error>(())
        })
        .await?;

        info!(namespace = %self.namespace, "Restored controller deployment");
        Ok(())
    }
}

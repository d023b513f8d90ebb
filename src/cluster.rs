use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use tracing::{debug, info};

/// Read access to the workloads the installer inspects.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str) -> anyhow::Result<Deployment>;
}

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> anyhow::Result<Deployment> {
        debug!("Fetching deployment {} in namespace {}", name, namespace);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = deployments.get(name).await?;
        Ok(deployment)
    }
}

pub async fn create_client() -> anyhow::Result<Client> {
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Image of the first container in the deployment's pod template.
pub fn first_container_image(deployment: &Deployment) -> anyhow::Result<&str> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod_spec| pod_spec.containers.first())
        .and_then(|container| container.image.as_deref())
        .with_context(|| {
            format!(
                "Deployment {} has no container image",
                deployment.metadata.name.as_deref().unwrap_or("<unnamed>")
            )
        })
}

/// A deployment whose pod template runs one container per image.
#[cfg(test)]
pub(crate) fn deployment_with_images(images: &[&str]) -> Deployment {
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use kube::api::ObjectMeta;

    Deployment {
        metadata: ObjectMeta {
            name: Some("tiller-deploy".to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: images
                        .iter()
                        .map(|image| Container {
                            name: "tiller".to_string(),
                            image: Some(image.to_string()),
                            ..Container::default()
                        })
                        .collect(),
                    ..PodSpec::default()
                }),
                ..PodTemplateSpec::default()
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_container_image() {
        let deployment = deployment_with_images(&["tiller:1.0.0", "sidecar:3.0.0"]);
        assert_eq!(first_container_image(&deployment).unwrap(), "tiller:1.0.0");
    }

    #[test]
    fn test_first_container_image_missing() {
        let deployment = deployment_with_images(&[]);
        let err = first_container_image(&deployment).unwrap_err();
        assert_eq!(err.to_string(), "Deployment tiller-deploy has no container image");
    }
}

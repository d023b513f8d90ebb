use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

pub static TILLER_NAMESPACE: &str = "kube-system";
pub static TILLER_SERVICE_ACCOUNT: &str = "tiller";
pub static TILLER_DEPLOYMENT_NAME: &str = "tiller-deploy";

static TILLER_CONTAINER_NAME: &str = "tiller";
static TILLER_FIELD_MANAGER: &str = "tiller-installer";
static TILLER_APPLIED_AT_ANNOTATION: &str = "tiller-installer/appliedAt";
const TILLER_GRPC_PORT: i32 = 44134;
const TILLER_HTTP_PORT: i32 = 44135;

/// Parameters of a Tiller install or upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub namespace: String,
    pub image_spec: String,
    pub service_account: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Release {
    pub name: String,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub chart: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReleaseList {
    #[serde(default)]
    releases: Vec<Release>,
}

#[derive(Debug, Error)]
pub enum HelmError {
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Operations against Tiller and the releases it manages.
#[async_trait]
pub trait HelmClient: Send + Sync {
    /// Creates Tiller. Fails with [`HelmError::AlreadyExists`] when a Tiller
    /// deployment is already present.
    async fn install(&self, options: &InstallOptions) -> Result<(), HelmError>;
    async fn upgrade(&self, options: &InstallOptions) -> Result<(), HelmError>;
    async fn list_releases(&self) -> anyhow::Result<Vec<Release>>;
}

/// Installs Tiller through the Kubernetes API and talks to it through the helm CLI.
pub struct TillerClient {
    client: Client,
    helm_binary: String,
    tiller_namespace: String,
}

impl TillerClient {
    pub fn new(client: Client, helm_binary: impl Into<String>) -> Self {
        Self {
            client,
            helm_binary: helm_binary.into(),
            tiller_namespace: TILLER_NAMESPACE.to_string(),
        }
    }

    async fn ensure_service(&self, namespace: &str) -> Result<(), HelmError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match services
            .create(&PostParams::default(), &tiller_service(namespace))
            .await
        {
            Ok(_) => {
                info!("Created service {} in namespace {}", TILLER_DEPLOYMENT_NAME, namespace);
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.reason == "AlreadyExists" => {
                debug!("Service {} already exists", TILLER_DEPLOYMENT_NAME);
                Ok(())
            }
            Err(e) => Err(HelmError::Other(anyhow::Error::new(e).context(format!(
                "Failed to create service {}",
                TILLER_DEPLOYMENT_NAME
            )))),
        }
    }
}

#[async_trait]
impl HelmClient for TillerClient {
    async fn install(&self, options: &InstallOptions) -> Result<(), HelmError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &options.namespace);
        let deployment = tiller_deployment(options);

        debug!("Creating deployment {:?}", deployment);
        match deployments.create(&PostParams::default(), &deployment).await {
            Ok(_) => info!(
                "Created deployment {} with image {}",
                TILLER_DEPLOYMENT_NAME, options.image_spec
            ),
            Err(kube::Error::Api(response)) if response.reason == "AlreadyExists" => {
                return Err(HelmError::AlreadyExists(format!(
                    "deployment {}/{}",
                    options.namespace, TILLER_DEPLOYMENT_NAME
                )));
            }
            Err(e) => {
                return Err(HelmError::Other(anyhow::Error::new(e).context(format!(
                    "Failed to create deployment {}",
                    TILLER_DEPLOYMENT_NAME
                ))));
            }
        }

        self.ensure_service(&options.namespace).await
    }

    async fn upgrade(&self, options: &InstallOptions) -> Result<(), HelmError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &options.namespace);
        let patch = upgrade_patch(options);

        debug!("Patching deployment {} with patch {}", TILLER_DEPLOYMENT_NAME, patch);
        deployments
            .patch(
                TILLER_DEPLOYMENT_NAME,
                &PatchParams::apply(TILLER_FIELD_MANAGER),
                &Patch::Strategic(&patch),
            )
            .await
            .with_context(|| format!("Failed to patch deployment {}", TILLER_DEPLOYMENT_NAME))?;
        info!(
            "Patched deployment {} to image {}",
            TILLER_DEPLOYMENT_NAME, options.image_spec
        );

        self.ensure_service(&options.namespace).await
    }

    async fn list_releases(&self) -> anyhow::Result<Vec<Release>> {
        let args = [
            "list",
            "--tiller-namespace",
            self.tiller_namespace.as_str(),
            "--output",
            "json",
        ];
        debug!("Running {} {:?}", self.helm_binary, args);

        let output = Command::new(&self.helm_binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.helm_binary))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} list exited with {}: {}",
                self.helm_binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_release_list(&output.stdout)
    }
}

/// Parses `helm list --output json`. Helm prints nothing when there are no releases.
fn parse_release_list(stdout: &[u8]) -> anyhow::Result<Vec<Release>> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let list: ReleaseList =
        serde_json::from_slice(stdout).context("Failed to parse helm list output")?;
    Ok(list.releases)
}

fn tiller_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "helm".to_string()),
        ("name".to_string(), "tiller".to_string()),
    ])
}

fn http_probe(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(TILLER_HTTP_PORT),
            ..HTTPGetAction::default()
        }),
        initial_delay_seconds: Some(1),
        timeout_seconds: Some(1),
        ..Probe::default()
    }
}

fn tiller_deployment(options: &InstallOptions) -> Deployment {
    let labels = tiller_labels();
    Deployment {
        metadata: ObjectMeta {
            name: Some(TILLER_DEPLOYMENT_NAME.to_string()),
            namespace: Some(options.namespace.clone()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        TILLER_APPLIED_AT_ANNOTATION.to_string(),
                        Utc::now().to_rfc3339(),
                    )])),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(options.service_account.clone()),
                    automount_service_account_token: Some(true),
                    containers: vec![Container {
                        name: TILLER_CONTAINER_NAME.to_string(),
                        image: Some(options.image_spec.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        ports: Some(vec![
                            ContainerPort {
                                name: Some("tiller".to_string()),
                                container_port: TILLER_GRPC_PORT,
                                ..ContainerPort::default()
                            },
                            ContainerPort {
                                name: Some("http".to_string()),
                                container_port: TILLER_HTTP_PORT,
                                ..ContainerPort::default()
                            },
                        ]),
                        env: Some(vec![
                            EnvVar {
                                name: "TILLER_NAMESPACE".to_string(),
                                value: Some(options.namespace.clone()),
                                ..EnvVar::default()
                            },
                            EnvVar {
                                name: "TILLER_HISTORY_MAX".to_string(),
                                value: Some("0".to_string()),
                                ..EnvVar::default()
                            },
                        ]),
                        liveness_probe: Some(http_probe("/liveness")),
                        readiness_probe: Some(http_probe("/readiness")),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

fn tiller_service(namespace: &str) -> Service {
    let labels = tiller_labels();
    Service {
        metadata: ObjectMeta {
            name: Some(TILLER_DEPLOYMENT_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("tiller".to_string()),
                port: TILLER_GRPC_PORT,
                target_port: Some(IntOrString::String("tiller".to_string())),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Strategic merge patch that swaps the Tiller image and service account while
/// leaving the rest of the pod template untouched.
fn upgrade_patch(options: &InstallOptions) -> serde_json::Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        TILLER_APPLIED_AT_ANNOTATION: Utc::now().to_rfc3339(),
                    }
                },
                "spec": {
                    "serviceAccountName": options.service_account,
                    "containers": [{
                        "name": TILLER_CONTAINER_NAME,
                        "image": options.image_spec,
                    }]
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> InstallOptions {
        InstallOptions {
            namespace: TILLER_NAMESPACE.to_string(),
            image_spec: "gcr.io/kubernetes-helm/tiller:v2.16.12".to_string(),
            service_account: TILLER_SERVICE_ACCOUNT.to_string(),
        }
    }

    #[test]
    fn test_parse_release_list() {
        let stdout = br#"{"Next":"","Releases":[{"Name":"redis","Revision":3,"Updated":"Mon Oct 12 10:00:00 2026","Status":"DEPLOYED","Chart":"redis-10.5.7","AppVersion":"5.0.7","Namespace":"default"}]}"#;
        let releases = parse_release_list(stdout).unwrap();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].name, "redis");
        assert_eq!(releases[0].revision, 3);
        assert_eq!(releases[0].status, "DEPLOYED");
    }

    #[test]
    fn test_parse_empty_release_list() {
        assert!(parse_release_list(b"").unwrap().is_empty());
        assert!(parse_release_list(b"\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_invalid_release_list() {
        assert!(parse_release_list(b"Error: could not find tiller").is_err());
    }

    #[test]
    fn test_tiller_deployment() {
        let deployment = tiller_deployment(&options());
        assert_eq!(deployment.metadata.name.as_deref(), Some(TILLER_DEPLOYMENT_NAME));
        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod_spec.service_account_name.as_deref(), Some("tiller"));
        assert_eq!(
            pod_spec.containers[0].image.as_deref(),
            Some("gcr.io/kubernetes-helm/tiller:v2.16.12")
        );
        let env = pod_spec.containers[0].env.as_ref().unwrap();
        assert_eq!(env[0].name, "TILLER_NAMESPACE");
        assert_eq!(env[0].value.as_deref(), Some("kube-system"));
    }

    #[test]
    fn test_tiller_service_targets_grpc_port() {
        let service = tiller_service(TILLER_NAMESPACE);
        let port = &service.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 44134);
        assert_eq!(port.target_port, Some(IntOrString::String("tiller".to_string())));
    }

    #[test]
    fn test_upgrade_patch() {
        let patch = upgrade_patch(&options());
        let container = &patch["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["name"], "tiller");
        assert_eq!(container["image"], "gcr.io/kubernetes-helm/tiller:v2.16.12");
        assert_eq!(patch["spec"]["template"]["spec"]["serviceAccountName"], "tiller");
    }
}

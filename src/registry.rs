use crate::config::RegistryConfig;
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LocalObjectReference, Namespace, Secret, ServiceAccount};
use kube::api::{ObjectMeta, Patch, PatchParams};
use kube::{Api, Client};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::info;

pub static REGISTRY_SECRET_NAME: &str = "registry-secret";
static REGISTRY_FIELD_MANAGER: &str = "tiller-installer";

/// Makes a private registry usable by a service account.
#[async_trait]
pub trait RegistrySetup: Send + Sync {
    /// Idempotently provisions pull credentials for `registry_config`.
    async fn setup(&self, registry_config: &RegistryConfig) -> anyhow::Result<()>;
}

/// Provisions the namespace, a docker-registry pull secret and a service account
/// referencing that secret, all through server-side apply.
pub struct PrivateRegistrySetup {
    client: Client,
    namespace: String,
    service_account: String,
}

impl PrivateRegistrySetup {
    pub fn new(client: Client, namespace: &str, service_account: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            service_account: service_account.to_string(),
        }
    }

    async fn apply<K>(&self, api: &Api<K>, name: &str, resource: &K) -> anyhow::Result<()>
    where
        K: Clone + Debug + Serialize + DeserializeOwned,
    {
        api.patch(
            name,
            &PatchParams::apply(REGISTRY_FIELD_MANAGER).force(),
            &Patch::Apply(resource),
        )
        .await
        .with_context(|| format!("Failed to apply {}", name))?;
        Ok(())
    }
}

#[async_trait]
impl RegistrySetup for PrivateRegistrySetup {
    async fn setup(&self, registry_config: &RegistryConfig) -> anyhow::Result<()> {
        info!(
            "Setting up private registry {} for service account {}/{}",
            registry_config.server, self.namespace, self.service_account
        );

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        self.apply(&namespaces, &self.namespace, &namespace).await?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = registry_secret(&self.namespace, registry_config)?;
        self.apply(&secrets, REGISTRY_SECRET_NAME, &secret).await?;

        let service_accounts: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), &self.namespace);
        let service_account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(self.service_account.clone()),
                namespace: Some(self.namespace.clone()),
                ..ObjectMeta::default()
            },
            image_pull_secrets: Some(vec![LocalObjectReference {
                name: REGISTRY_SECRET_NAME.to_string(),
            }]),
            ..ServiceAccount::default()
        };
        self.apply(&service_accounts, &self.service_account, &service_account)
            .await?;

        info!("Private registry {} is set up", registry_config.server);
        Ok(())
    }
}

/// `.dockerconfigjson` content for the registry. The kubelet accepts plain
/// `username`/`password` entries, so no `auth` field is precomputed.
fn docker_config_json(registry_config: &RegistryConfig) -> anyhow::Result<String> {
    let config = json!({
        "auths": {
            registry_config.server.as_str(): {
                "username": registry_config.username,
                "password": registry_config.password.expose_secret(),
                "email": registry_config.email,
            }
        }
    });
    serde_json::to_string(&config).context("Failed to serialize docker config")
}

fn registry_secret(namespace: &str, registry_config: &RegistryConfig) -> anyhow::Result<Secret> {
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(REGISTRY_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        string_data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            docker_config_json(registry_config)?,
        )])),
        ..Secret::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_string::SecretString;

    fn registry_config() -> RegistryConfig {
        RegistryConfig {
            server: "registry.example.com".to_string(),
            username: "deployer".to_string(),
            password: SecretString::new("hunter2"),
            email: "deployer@example.com".to_string(),
        }
    }

    #[test]
    fn test_docker_config_json() {
        let config: serde_json::Value =
            serde_json::from_str(&docker_config_json(&registry_config()).unwrap()).unwrap();
        let entry = &config["auths"]["registry.example.com"];
        assert_eq!(entry["username"], "deployer");
        assert_eq!(entry["password"], "hunter2");
        assert_eq!(entry["email"], "deployer@example.com");
    }

    #[test]
    fn test_registry_secret() {
        let secret = registry_secret("kube-system", &registry_config()).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some(REGISTRY_SECRET_NAME));
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));
        assert!(secret.string_data.unwrap().contains_key(".dockerconfigjson"));
    }
}

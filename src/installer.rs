use crate::cluster::{Cluster, first_container_image};
use crate::config::RegistryConfig;
use crate::helm::{
    HelmClient, HelmError, InstallOptions, TILLER_DEPLOYMENT_NAME, TILLER_NAMESPACE,
    TILLER_SERVICE_ACCOUNT,
};
use crate::image_reference::ImageReference;
use crate::registry::RegistrySetup;
use crate::version::is_newer_version;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);
const POLL_SLICES: u32 = 10;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    RegistrySetup(anyhow::Error),
    #[error("error installing tiller")]
    Install(#[source] anyhow::Error),
    #[error(transparent)]
    DeploymentFetch(anyhow::Error),
    #[error("error upgrading tiller")]
    Upgrade(#[source] anyhow::Error),
    #[error("tiller didn't become healthy within {max_wait:?}")]
    NotHealthy { max_wait: Duration },
}

/// Where an install run currently stands. Failures leave the machine through `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Absent,
    Upgrading,
    Polling,
    Healthy,
}

/// What to do with a Tiller deployment that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The deployment already runs the resolved image.
    UpToDate,
    /// The resolved image is strictly newer.
    Upgrade,
    /// The deployment runs a newer or equal version. Never downgraded.
    KeepExisting,
}

pub fn decide(existing_image: &str, resolved_image: &str) -> Decision {
    if existing_image == resolved_image {
        Decision::UpToDate
    } else if is_newer_version(existing_image, resolved_image) {
        Decision::Upgrade
    } else {
        Decision::KeepExisting
    }
}

/// Installs Tiller, upgrades it when the deployed version is older, and waits
/// for it to answer.
///
/// `install` is idempotent and meant to be called on every reconciliation tick.
/// Concurrent calls are not coordinated with each other.
pub struct Installer<C, H, R> {
    tiller_tag: String,
    registry_config: RwLock<RegistryConfig>,
    max_wait_nanos: AtomicU64,
    cluster: C,
    helm: H,
    registry_setup: R,
}

impl<C, H, R> Installer<C, H, R>
where
    C: Cluster,
    H: HelmClient,
    R: RegistrySetup,
{
    pub fn new(
        tiller_tag: impl Into<String>,
        registry_config: RegistryConfig,
        cluster: C,
        helm: H,
        registry_setup: R,
    ) -> Self {
        Self {
            tiller_tag: tiller_tag.into(),
            registry_config: RwLock::new(registry_config),
            max_wait_nanos: AtomicU64::new(DEFAULT_MAX_WAIT.as_nanos() as u64),
            cluster,
            helm,
            registry_setup,
        }
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_nanos(self.max_wait_nanos.load(Ordering::Relaxed))
    }

    /// Changes the health deadline of every later `install` call.
    pub fn set_max_wait(&self, max_wait: Duration) {
        let nanos = u64::try_from(max_wait.as_nanos()).unwrap_or(u64::MAX);
        self.max_wait_nanos.store(nanos, Ordering::Relaxed);
    }

    /// Replaces the registry configuration. Takes effect on the next `install` call.
    pub fn set_registry_config(&self, registry_config: RegistryConfig) {
        let mut current = self
            .registry_config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = registry_config;
    }

    fn registry_config(&self) -> RegistryConfig {
        self.registry_config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn install(&self) -> Result<(), InstallError> {
        debug!("Installing helm with Tiller version {}", self.tiller_tag);
        let options = self.resolve_options().await?;

        let mut phase = Phase::Absent;
        loop {
            debug!("Tiller install phase {:?}", phase);
            phase = match phase {
                Phase::Absent => self.install_or_decide(&options).await?,
                Phase::Upgrading => {
                    info!("Upgrading Tiller to {}", options.image_spec);
                    self.helm
                        .upgrade(&options)
                        .await
                        .map_err(|e| InstallError::Upgrade(e.into()))?;
                    Phase::Polling
                }
                Phase::Polling => {
                    self.wait_until_healthy().await?;
                    Phase::Healthy
                }
                Phase::Healthy => return Ok(()),
            };
        }
    }

    /// Resolves the image to deploy, provisioning registry credentials first
    /// when a private registry is configured.
    async fn resolve_options(&self) -> Result<InstallOptions, InstallError> {
        let registry_config = self.registry_config();
        if registry_config.has_registry_config() {
            self.registry_setup
                .setup(&registry_config)
                .await
                .map_err(InstallError::RegistrySetup)?;
        }

        let image = ImageReference::resolve_tiller(&self.tiller_tag, &registry_config);
        Ok(InstallOptions {
            namespace: TILLER_NAMESPACE.to_string(),
            image_spec: image.to_string(),
            service_account: TILLER_SERVICE_ACCOUNT.to_string(),
        })
    }

    async fn install_or_decide(&self, options: &InstallOptions) -> Result<Phase, InstallError> {
        match self.helm.install(options).await {
            Ok(()) => {
                info!("Installed Tiller with image {}", options.image_spec);
                return Ok(Phase::Polling);
            }
            Err(HelmError::AlreadyExists(what)) => {
                debug!("Tiller install skipped, {} already exists", what);
            }
            Err(HelmError::Other(e)) => return Err(InstallError::Install(e)),
        }

        let deployment = self
            .cluster
            .get_deployment(TILLER_NAMESPACE, TILLER_DEPLOYMENT_NAME)
            .await
            .map_err(InstallError::DeploymentFetch)?;
        let existing_image =
            first_container_image(&deployment).map_err(InstallError::DeploymentFetch)?;

        let decision = decide(existing_image, &options.image_spec);
        info!(
            "Tiller is deployed with image {}, resolved image is {}: {:?}",
            existing_image, options.image_spec, decision
        );
        Ok(match decision {
            Decision::Upgrade => Phase::Upgrading,
            Decision::UpToDate | Decision::KeepExisting => Phase::Polling,
        })
    }

    async fn healthy(&self) -> bool {
        match self.helm.list_releases().await {
            Ok(releases) => {
                debug!("Tiller answered with {} releases", releases.len());
                true
            }
            Err(e) => {
                debug!("Tiller is not healthy yet: {:#}", e);
                false
            }
        }
    }

    /// Polls in ten equal slices of the max wait. Gives up once the accumulated
    /// wait reaches the max wait, so a dead Tiller is checked once up front and
    /// once after every slice.
    async fn wait_until_healthy(&self) -> Result<(), InstallError> {
        let max_wait = self.max_wait();
        // a budget under ten nanoseconds must still make progress
        let slice = (max_wait / POLL_SLICES).max(Duration::from_nanos(1));
        let mut waited = Duration::ZERO;

        info!("Waiting for tiller to become healthy");
        loop {
            if self.healthy().await {
                info!("Tiller is healthy");
                return Ok(());
            }
            if waited >= max_wait {
                return Err(InstallError::NotHealthy { max_wait });
            }
            waited += slice;
            tokio::time::sleep(slice).await;
        }
    }
}

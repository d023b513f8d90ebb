use crate::cluster::KubeCluster;
use crate::helm::{TILLER_NAMESPACE, TILLER_SERVICE_ACCOUNT, TillerClient};
use crate::installer::Installer;
use crate::registry::PrivateRegistrySetup;
use crate::webserver::Readiness;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod cluster;
mod config;
mod helm;
mod image_reference;
mod installer;
mod registry;
mod secret_string;
mod version;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type TillerInstaller = Installer<KubeCluster, TillerClient, PrivateRegistrySetup>;

/// Re-reads the config file so registry and max wait changes apply on the
/// next tick. The Tiller tag stays fixed for the lifetime of the process.
fn reload_config(installer: &TillerInstaller, config_path: &str) {
    match config::load_config(config_path) {
        Ok(config) => {
            installer.set_registry_config(config.registry);
            installer.set_max_wait(Duration::from_secs(config.tiller.max_wait_seconds));
        }
        Err(e) => warn!("Keeping previous configuration, reload failed: {:?}", e),
    }
}

async fn reconcile(installer: &TillerInstaller, readiness: &Readiness) {
    match installer.install().await {
        Ok(()) => {
            info!("Tiller is installed and healthy");
            readiness.set(true);
        }
        Err(e) => {
            error!("Error reconciling Tiller: {:?}", anyhow::Error::new(e));
            readiness.set(false);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting tiller-installer {}", env!("CARGO_PKG_VERSION"));

    let config_path =
        env::var("CONFIG_PATH").unwrap_or_else(|_| config::DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;

    let client = cluster::create_client().await?;
    let installer: Arc<TillerInstaller> = Arc::new(Installer::new(
        config.tiller.tag.clone(),
        config.registry.clone(),
        KubeCluster::new(client.clone()),
        TillerClient::new(client.clone(), config.tiller.helm_binary.clone()),
        PrivateRegistrySetup::new(client, TILLER_NAMESPACE, TILLER_SERVICE_ACCOUNT),
    ));
    installer.set_max_wait(Duration::from_secs(config.tiller.max_wait_seconds));

    let readiness = Readiness::default();
    reconcile(&installer, &readiness).await;

    info!("Reconciling Tiller at cron schedule {}", config.schedule);
    let mut scheduler = JobScheduler::new().await?;
    let job = {
        let installer = installer.clone();
        let readiness = readiness.clone();
        let config_path = config_path.clone();
        Job::new_async(config.schedule.as_str(), move |_uuid, _l| {
            let installer = installer.clone();
            let readiness = readiness.clone();
            let config_path = config_path.clone();
            Box::pin(async move {
                reload_config(&installer, &config_path);
                reconcile(&installer, &readiness).await;
            })
        })?
    };
    scheduler.add(job).await?;
    scheduler.start().await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {:?}", e);
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let app = webserver::create_app(readiness);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    scheduler.shutdown().await?;
    Ok(())
}

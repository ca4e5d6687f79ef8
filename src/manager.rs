use crate::{
    cloud_provider,
    config::{
        CostManagerConfiguration, POD_SAFE_TO_EVICT_ANNOTATOR_CONTROLLER_NAME,
        SPOT_MIGRATOR_CONTROLLER_NAME,
    },
    pod_safe_to_evict_annotator,
    spot_migrator::SpotMigrator,
    Error, Metrics, Result,
};
use chrono::{DateTime, Utc};
use futures::{future, future::BoxFuture, FutureExt};
use kube::client::Client;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the controllers
    pub(crate) diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Initialize the enabled controllers and run them until shutdown
pub async fn run(state: State, config: CostManagerConfiguration) -> Result<()> {
    let client = Client::try_default().await.map_err(Error::KubeError)?;
    let metrics = Metrics::default().register(&state.registry).unwrap();

    // Cancelled on SIGINT/SIGTERM; every blocking loop selects against it so that
    // in-flight work stops at the next suspension point
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let mut controllers: Vec<BoxFuture<'static, Result<()>>> = Vec::new();

    if is_controller_enabled(&config, SPOT_MIGRATOR_CONTROLLER_NAME) {
        let cloud_provider = cloud_provider::new_cloud_provider(&config.cloud_provider.name)?;
        let spot_migrator = SpotMigrator {
            client: client.clone(),
            cloud_provider,
            config: config.spot_migrator.clone(),
            metrics: metrics.clone(),
            diagnostics: state.diagnostics.clone(),
            local_node_name: std::env::var("NODE_NAME").ok(),
        };
        controllers.push(spot_migrator.start(shutdown.clone()).boxed());
    }

    if is_controller_enabled(&config, POD_SAFE_TO_EVICT_ANNOTATOR_CONTROLLER_NAME) {
        controllers.push(
            pod_safe_to_evict_annotator::run(
                client.clone(),
                config.pod_safe_to_evict_annotator.clone(),
                metrics.clone(),
                state.diagnostics.clone(),
            )
            .boxed(),
        );
    }

    if controllers.is_empty() {
        warn!("No controllers are enabled");
    }

    info!("Starting controllers");
    future::try_join_all(controllers).await?;
    Ok(())
}

fn is_controller_enabled(config: &CostManagerConfiguration, controller_name: &str) -> bool {
    config.controllers.iter().any(|name| name == controller_name)
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("Failed to register SIGTERM handler: {err}");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Configuration Error: {0}")]
    ConfigurationError(String),

    #[error("Schedule Error: {0}")]
    ScheduleError(String),

    #[error("Node Selection Error: {0}")]
    NodeSelectionError(String),

    #[error("Drain Error: {0}")]
    DrainError(String),

    #[error("Watch Error: {0}")]
    WatchError(String),

    #[error("Invalid Label Selector: {0}")]
    InvalidLabelSelector(String),

    #[error("Cloud Provider Error: {0}")]
    CloudProviderError(String),

    #[error("HTTP Error: {0}")]
    HttpError(#[source] reqwest::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}

/// Controller manager wiring and state shared with the web server
pub mod manager;
pub use manager::{Diagnostics, State};

/// Spot migration control loop
pub mod spot_migrator;

/// Pod safe-to-evict annotation reconciler
pub mod pod_safe_to_evict_annotator;

/// Cloud provider adapters
pub mod cloud_provider;

/// Shared cluster API helpers
pub mod kubernetes;

/// Configuration loading and validation
pub mod config;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub mod fixtures;

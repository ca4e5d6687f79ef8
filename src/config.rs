use crate::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SPOT_MIGRATOR_CONTROLLER_NAME: &str = "spot-migrator";
pub const POD_SAFE_TO_EVICT_ANNOTATOR_CONTROLLER_NAME: &str = "pod-safe-to-evict-annotator";

/// All controllers that can be enabled through the `controllers` list; controllers
/// are disabled by default
pub const ALL_CONTROLLER_NAMES: [&str; 2] = [
    SPOT_MIGRATOR_CONTROLLER_NAME,
    POD_SAFE_TO_EVICT_ANNOTATOR_CONTROLLER_NAME,
];

const API_VERSION: &str = "cost-manager.io/v1alpha1";
const KIND: &str = "CostManagerConfiguration";

/// Top-level configuration document. Decoding is strict: unknown fields and an
/// unexpected apiVersion or kind are rejected.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CostManagerConfiguration {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controllers: Vec<String>,
    #[serde(default)]
    pub cloud_provider: CloudProviderConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_migrator: Option<SpotMigratorConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_safe_to_evict_annotator: Option<PodSafeToEvictAnnotatorConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CloudProviderConfig {
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SpotMigratorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_schedule: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PodSafeToEvictAnnotatorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

/// Reads, decodes and validates the configuration file
pub fn load(config_file_path: impl AsRef<Path>) -> Result<CostManagerConfiguration> {
    let config_file_path = config_file_path.as_ref();
    if config_file_path.as_os_str().is_empty() {
        return Err(Error::ConfigurationError(
            "configuration file not specified".to_string(),
        ));
    }

    let config_data = std::fs::read_to_string(config_file_path).map_err(|err| {
        Error::ConfigurationError(format!("failed to read configuration file: {err}"))
    })?;

    let config = decode(&config_data)?;
    validate(&config)?;

    Ok(config)
}

fn decode(config_data: &str) -> Result<CostManagerConfiguration> {
    let config: CostManagerConfiguration = serde_yaml::from_str(config_data).map_err(|err| {
        Error::ConfigurationError(format!("failed to decode configuration: {err}"))
    })?;
    if config.api_version != API_VERSION {
        return Err(Error::ConfigurationError(format!(
            "unknown API version: {}",
            config.api_version
        )));
    }
    if config.kind != KIND {
        return Err(Error::ConfigurationError(format!(
            "unknown kind: {}",
            config.kind
        )));
    }
    Ok(config)
}

fn validate(config: &CostManagerConfiguration) -> Result<()> {
    for controller_name in &config.controllers {
        if !ALL_CONTROLLER_NAMES.contains(&controller_name.as_str()) {
            return Err(Error::ConfigurationError(format!(
                "unknown controller: {controller_name}"
            )));
        }
    }
    Ok(())
}

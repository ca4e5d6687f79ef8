use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::RwLock;

const COMPUTE_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

// Instance credentials served by the GCE metadata server:
// https://cloud.google.com/compute/docs/access/authenticate-workloads
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

// Refresh access tokens a minute before they expire
const TOKEN_EXPIRY_MARGIN_SECONDS: i64 = 60;

const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Minimal client for the GCP compute API, authenticating with access tokens from
/// the GCE metadata server
pub struct ComputeClient {
    http: reqwest::Client,
    token: RwLock<Option<CachedToken>>,
}

struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    pub self_link: String,
    #[serde(default)]
    pub metadata: Option<InstanceMetadata>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetadata {
    #[serde(default)]
    pub items: Option<Vec<MetadataItem>>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MetadataItem {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    pub name: String,
    #[serde(default)]
    pub size: i64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupList {
    #[serde(default)]
    pub items: Vec<InstanceGroup>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupInstances {
    #[serde(default)]
    pub items: Vec<InstanceReference>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InstanceReference {
    pub instance: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupManager {
    #[serde(default)]
    pub status: Option<InstanceGroupManagerStatus>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupManagerStatus {
    #[serde(default)]
    pub is_stable: bool,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<OperationError>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorDetail>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OperationErrorDetail {
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize, Debug, Default)]
struct ApiErrorBody {
    #[serde(default)]
    error: ApiErrorDetail,
}

#[derive(Deserialize, Debug, Default)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorReason>,
}

#[derive(Deserialize, Debug, Default)]
struct ApiErrorReason {
    #[serde(default)]
    reason: String,
}

fn api_error(status: reqwest::StatusCode, body: ApiErrorBody) -> Error {
    Error::CloudProviderError(format!(
        "compute API request failed with status {status}: {}",
        body.error.message
    ))
}

impl ComputeClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(Error::HttpError)?;
        Ok(Self {
            http,
            token: RwLock::new(None),
        })
    }

    async fn access_token(&self) -> Result<String> {
        {
            let token = self.token.read().await;
            if let Some(token) = token.as_ref() {
                if token.expires_at > Utc::now() {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(Error::HttpError)?
            .error_for_status()
            .map_err(Error::HttpError)?;
        let access_token: AccessToken = response.json().await.map_err(Error::HttpError)?;

        let expires_at = Utc::now()
            + chrono::Duration::seconds(access_token.expires_in - TOKEN_EXPIRY_MARGIN_SECONDS);
        *self.token.write().await = Some(CachedToken {
            access_token: access_token.access_token.clone(),
            expires_at,
        });
        Ok(access_token.access_token)
    }

    /// GET a compute resource, returning None if it does not exist
    async fn get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(Error::HttpError)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.json::<ApiErrorBody>().await.unwrap_or_default();
            return Err(api_error(status, body));
        }
        Ok(Some(response.json().await.map_err(Error::HttpError)?))
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&token)
            .json(body)
            .send()
            .await
            .map_err(Error::HttpError)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.json::<ApiErrorBody>().await.unwrap_or_default();
            return Err(api_error(status, body));
        }
        response.json().await.map_err(Error::HttpError)
    }

    pub async fn get_instance(
        &self,
        project: &str,
        zone: &str,
        instance_name: &str,
    ) -> Result<Option<Instance>> {
        let url =
            format!("{COMPUTE_BASE_URL}/projects/{project}/zones/{zone}/instances/{instance_name}");
        self.get(&url).await
    }

    pub async fn list_instance_groups(
        &self,
        project: &str,
        zone: &str,
        page_token: Option<&str>,
    ) -> Result<InstanceGroupList> {
        let mut url = format!("{COMPUTE_BASE_URL}/projects/{project}/zones/{zone}/instanceGroups");
        if let Some(page_token) = page_token {
            url = format!("{url}?pageToken={page_token}");
        }
        self.get(&url).await?.ok_or_else(|| {
            Error::CloudProviderError(format!(
                "failed to list instance groups in {project}/{zone}"
            ))
        })
    }

    pub async fn list_instance_group_instances(
        &self,
        project: &str,
        zone: &str,
        instance_group: &str,
    ) -> Result<InstanceGroupInstances> {
        let url = format!(
            "{COMPUTE_BASE_URL}/projects/{project}/zones/{zone}/instanceGroups/{instance_group}/listInstances"
        );
        self.post(&url, &json!({})).await
    }

    /// Removes the instance from the instance group, returning None if it was not a
    /// member (already removed)
    pub async fn remove_instance_from_group(
        &self,
        project: &str,
        zone: &str,
        instance_group: &str,
        instance_self_link: &str,
    ) -> Result<Option<Operation>> {
        let url = format!(
            "{COMPUTE_BASE_URL}/projects/{project}/zones/{zone}/instanceGroups/{instance_group}/removeInstances"
        );
        let body = json!({
            "instances": [
                { "instance": instance_self_link },
            ],
        });
        let token = self.access_token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(Error::HttpError)?;
        if response.status().is_success() {
            return Ok(Some(response.json().await.map_err(Error::HttpError)?));
        }
        let status = response.status();
        let error_body = response.json::<ApiErrorBody>().await.unwrap_or_default();
        if status == reqwest::StatusCode::BAD_REQUEST
            && error_body.error.errors.len() == 1
            && error_body.error.errors[0].reason == "memberNotFound"
        {
            return Ok(None);
        }
        Err(api_error(status, error_body))
    }

    pub async fn get_instance_group_manager(
        &self,
        project: &str,
        zone: &str,
        instance_group_manager: &str,
    ) -> Result<InstanceGroupManager> {
        let url = format!(
            "{COMPUTE_BASE_URL}/projects/{project}/zones/{zone}/instanceGroupManagers/{instance_group_manager}"
        );
        self.get(&url).await?.ok_or_else(|| {
            Error::CloudProviderError(format!(
                "managed instance group {instance_group_manager} not found in {project}/{zone}"
            ))
        })
    }

    /// Deletes the instance from its managed instance group. Validation errors for
    /// instances that are already gone are skipped so the call is idempotent.
    pub async fn delete_managed_instance(
        &self,
        project: &str,
        zone: &str,
        instance_group_manager: &str,
        instance_self_link: &str,
    ) -> Result<Operation> {
        let url = format!(
            "{COMPUTE_BASE_URL}/projects/{project}/zones/{zone}/instanceGroupManagers/{instance_group_manager}/deleteInstances"
        );
        let body = json!({
            "instances": [instance_self_link],
            "skipInstancesOnValidationError": true,
        });
        self.post(&url, &body).await
    }

    /// Polls the zonal operation until it is done, failing if it reports errors
    pub async fn wait_for_zonal_operation(
        &self,
        project: &str,
        zone: &str,
        operation_name: &str,
    ) -> Result<()> {
        let url = format!(
            "{COMPUTE_BASE_URL}/projects/{project}/zones/{zone}/operations/{operation_name}"
        );
        loop {
            let operation: Operation = self.get(&url).await?.ok_or_else(|| {
                Error::CloudProviderError(format!("compute operation {operation_name} not found"))
            })?;
            if operation.status == "DONE" {
                if let Some(error) = operation.error {
                    let messages = error
                        .errors
                        .iter()
                        .map(|error| error.message.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    return Err(Error::CloudProviderError(format!(
                        "compute operation failed with errors: {messages}"
                    )));
                }
                return Ok(());
            }
            tokio::time::sleep(OPERATION_POLL_INTERVAL).await;
        }
    }

    /// Polls until the managed instance group reports a stable status
    pub async fn wait_for_managed_instance_group_stability(
        &self,
        project: &str,
        zone: &str,
        instance_group_manager: &str,
    ) -> Result<()> {
        loop {
            let manager = self
                .get_instance_group_manager(project, zone, instance_group_manager)
                .await?;
            if manager.status.unwrap_or_default().is_stable {
                return Ok(());
            }
            tokio::time::sleep(OPERATION_POLL_INTERVAL).await;
        }
    }
}

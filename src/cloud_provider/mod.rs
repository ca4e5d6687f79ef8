use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;

pub mod fake;
pub mod gcp;

pub const FAKE_CLOUD_PROVIDER_NAME: &str = "fake";
pub const GCP_CLOUD_PROVIDER_NAME: &str = "gcp";

/// Operations for interacting with a cloud provider
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Determines whether the underlying instance of the Node is a spot instance
    async fn is_spot_instance(&self, node: &Node) -> Result<bool>;

    /// Drains connections from external load balancers to the Node and then deletes
    /// the underlying instance. Implementations can assume that Pods have already
    /// been drained from the Node and that it carries the
    /// ToBeDeletedByClusterAutoscaler taint to fail kube-proxy health checks as
    /// described in KEP-3836:
    /// https://github.com/kubernetes/enhancements/tree/27ef0d9a740ae5058472aac4763483f0e7218c0e/keps/sig-network/3836-kube-proxy-improved-ingress-connectivity-reliability
    /// Deleting an instance that is already gone succeeds.
    async fn delete_instance(&self, node: &Node) -> Result<()>;
}

/// Returns a new cloud provider by name
pub fn new_cloud_provider(cloud_provider_name: &str) -> Result<Arc<dyn CloudProvider>> {
    match cloud_provider_name {
        FAKE_CLOUD_PROVIDER_NAME => Ok(Arc::new(fake::CloudProvider::default())),
        GCP_CLOUD_PROVIDER_NAME => Ok(Arc::new(gcp::CloudProvider::new()?)),
        _ => Err(Error::ConfigurationError(format!(
            "unknown cloud provider: {cloud_provider_name}"
        ))),
    }
}

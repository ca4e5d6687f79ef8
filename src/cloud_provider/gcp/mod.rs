mod compute;

use crate::{Error, Result};
use async_trait::async_trait;
use compute::{ComputeClient, Instance};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::time::Duration;
use tracing::*;

// https://cloud.google.com/kubernetes-engine/docs/concepts/spot-vms#scheduling-workloads
const SPOT_VM_LABEL_KEY: &str = "cloud.google.com/gke-spot";
// https://cloud.google.com/kubernetes-engine/docs/how-to/preemptible-vms#use_nodeselector_to_schedule_pods_on_preemptible_vms
const PREEMPTIBLE_VM_LABEL_KEY: &str = "cloud.google.com/gke-preemptible";
const VM_LABEL_VALUE: &str = "true";

// https://kubernetes.io/docs/reference/labels-annotations-taints/#topologykubernetesiozone
const TOPOLOGY_ZONE_LABEL_KEY: &str = "topology.kubernetes.io/zone";

// Provider IDs of GKE Nodes have the form gce://{project}/{zone}/{instance}:
// https://github.com/kubernetes-sigs/cluster-api-provider-gcp/blob/173d8a201d251cb78a76bf47ec613d0d10b3f2f7/cloud/providerid/providerid.go#L88
const PROVIDER_ID_PREFIX: &str = "gce://";

// After kube-proxy starts failing its health check GCP load balancers should mark the
// instance as unhealthy within 24 seconds but we wait for slightly longer to give
// in-flight connections time to complete before we delete the underlying instance:
// https://github.com/kubernetes/ingress-gce/blob/2a08b1e4111a21c71455bbb2bcca13349bb6f4c0/pkg/healthchecksl4/healthchecksl4.go#L48
const CONNECTION_DRAINING_PERIOD: Duration = Duration::from_secs(30);
const CONNECTION_DRAINING_INTERVAL: Duration = Duration::from_secs(5);

// Instance groups managed by the GCP Cloud Controller Manager:
// https://github.com/kubernetes/cloud-provider-gcp/blob/398b1a191aa49b7c67ed5e4677400b73243904e2/providers/gce/gce_loadbalancer_naming.go#L35-L43
const CLOUD_CONTROLLER_INSTANCE_GROUP_PREFIX: &str = "k8s-ig--";

/// GCP implementation of the cloud provider operations for GKE clusters
pub struct CloudProvider {
    compute: ComputeClient,
}

impl CloudProvider {
    pub fn new() -> Result<Self> {
        Ok(Self {
            compute: ComputeClient::new()?,
        })
    }
}

#[async_trait]
impl super::CloudProvider for CloudProvider {
    async fn is_spot_instance(&self, node: &Node) -> Result<bool> {
        Ok(is_spot_node(node))
    }

    /// Retrieves the underlying compute instance of the Node, drains any connections
    /// from GCP load balancers and then deletes it from its managed instance group
    async fn delete_instance(&self, node: &Node) -> Result<()> {
        let (project, zone, instance_name) = instance_details(node)?;

        // The instance may already be gone if a previous migration was interrupted
        let Some(instance) = self
            .compute
            .get_instance(&project, &zone, &instance_name)
            .await?
        else {
            info!("Instance {instance_name} already deleted");
            return Ok(());
        };

        self.drain_load_balancer_connections(&project, &zone, &instance)
            .await?;

        let instance_group_manager = managed_instance_group_from_instance(&instance)?;
        let operation = self
            .compute
            .delete_managed_instance(&project, &zone, &instance_group_manager, &instance.self_link)
            .await?;
        self.compute
            .wait_for_zonal_operation(&project, &zone, &operation.name)
            .await?;
        self.compute
            .wait_for_managed_instance_group_stability(&project, &zone, &instance_group_manager)
            .await?;

        Ok(())
    }
}

impl CloudProvider {
    /// Removes the instance from instance groups managed by the GCP Cloud Controller
    /// Manager to trigger connection draining:
    /// https://cloud.google.com/load-balancing/docs/enabling-connection-draining
    /// Removal is re-attempted over the draining window in case the Cloud Controller
    /// Manager adds the instance back while processing an old list of Nodes.
    async fn drain_load_balancer_connections(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<()> {
        let mut page_token: Option<String> = None;
        loop {
            let instance_groups = self
                .compute
                .list_instance_groups(project, zone, page_token.as_deref())
                .await?;
            for instance_group in &instance_groups.items {
                if !instance_group
                    .name
                    .starts_with(CLOUD_CONTROLLER_INSTANCE_GROUP_PREFIX)
                {
                    continue;
                }
                if instance_group.size == 0 {
                    continue;
                }
                let members = self
                    .compute
                    .list_instance_group_instances(project, zone, &instance_group.name)
                    .await?;
                if !members
                    .items
                    .iter()
                    .any(|member| member.instance == instance.self_link)
                {
                    continue;
                }

                info!(
                    "Draining connections to instance {} through instance group {}",
                    instance.name, instance_group.name
                );
                let draining_deadline = std::time::Instant::now() + CONNECTION_DRAINING_PERIOD;
                self.remove_instance(project, zone, &instance_group.name, &instance.self_link)
                    .await?;
                while let Some(remaining) =
                    draining_deadline.checked_duration_since(std::time::Instant::now())
                {
                    tokio::time::sleep(remaining.min(CONNECTION_DRAINING_INTERVAL)).await;
                    self.remove_instance(project, zone, &instance_group.name, &instance.self_link)
                        .await?;
                }
            }
            match instance_groups.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(())
    }

    async fn remove_instance(
        &self,
        project: &str,
        zone: &str,
        instance_group: &str,
        instance_self_link: &str,
    ) -> Result<()> {
        // memberNotFound means the instance has already been removed
        if let Some(operation) = self
            .compute
            .remove_instance_from_group(project, zone, instance_group, instance_self_link)
            .await?
        {
            self.compute
                .wait_for_zonal_operation(project, zone, &operation.name)
                .await?;
        }
        Ok(())
    }
}

fn is_spot_node(node: &Node) -> bool {
    let labels = node.labels();
    labels.get(SPOT_VM_LABEL_KEY).map(String::as_str) == Some(VM_LABEL_VALUE)
        || labels.get(PREEMPTIBLE_VM_LABEL_KEY).map(String::as_str) == Some(VM_LABEL_VALUE)
}

/// Parses a provider ID of the form gce://{project}/{zone}/{instance}
fn parse_provider_id(provider_id: &str) -> Result<(String, String, String)> {
    let Some(path) = provider_id.strip_prefix(PROVIDER_ID_PREFIX) else {
        return Err(Error::CloudProviderError(format!(
            "provider ID does not have the expected prefix: {provider_id}"
        )));
    };
    let tokens: Vec<&str> = path.split('/').collect();
    if tokens.len() != 3 {
        return Err(Error::CloudProviderError(format!(
            "provider ID is not in the expected format: {provider_id}"
        )));
    }
    Ok((
        tokens[0].to_string(),
        tokens[1].to_string(),
        tokens[2].to_string(),
    ))
}

/// Extracts instance coordinates from the Node. Validating the provider ID details
/// against the Node should not be necessary but provides an extra level of assurance
/// that we are retrieving the expected instance.
fn instance_details(node: &Node) -> Result<(String, String, String)> {
    let node_name = node.name_any();
    let provider_id = node
        .spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_deref())
        .ok_or_else(|| {
            Error::CloudProviderError(format!("Node {node_name} has no provider ID"))
        })?;
    let (project, zone, instance_name) = parse_provider_id(provider_id)?;
    if instance_name != node_name {
        return Err(Error::CloudProviderError(format!(
            "provider ID instance name \"{instance_name}\" does not match with Node name \"{node_name}\""
        )));
    }
    let node_zone = node.labels().get(TOPOLOGY_ZONE_LABEL_KEY).ok_or_else(|| {
        Error::CloudProviderError(format!("failed to determine zone for Node {node_name}"))
    })?;
    if &zone != node_zone {
        return Err(Error::CloudProviderError(format!(
            "provider ID zone \"{zone}\" does not match with Node zone \"{node_zone}\""
        )));
    }
    Ok((project, zone, instance_name))
}

/// Determines the managed instance group that created the instance from its
/// `created-by` metadata:
/// https://cloud.google.com/compute/docs/instance-groups/getting-info-about-migs#checking_if_a_vm_instance_is_part_of_a_mig
fn managed_instance_group_from_instance(instance: &Instance) -> Result<String> {
    if let Some(metadata) = &instance.metadata {
        for item in metadata.items.iter().flatten() {
            if item.key != "created-by" {
                continue;
            }
            let Some(value) = &item.value else {
                continue;
            };
            let tokens: Vec<&str> = value.split('/').collect();
            if tokens.len() > 2 && tokens[tokens.len() - 2] == "instanceGroupManagers" {
                return Ok(tokens[tokens.len() - 1].to_string());
            }
        }
    }
    Err(Error::CloudProviderError(format!(
        "failed to determine managed instance group for instance {}",
        instance.name
    )))
}

use crate::{Error, Result};
use futures::stream::{self, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::{Api, EvictParams, ListParams},
    client::Client,
    ResourceExt,
};
use std::time::Duration;
use tracing::*;

// We match our Node drain timeout with GKE:
// https://cloud.google.com/kubernetes-engine/docs/concepts/node-pools#drain
const NODE_DRAIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

// Evictions blocked by a disruption budget are retried on the same fixed interval
// that kubectl drain waits between eviction attempts
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

// Bounded eviction concurrency keeps the request rate to the API server reasonable
const CONCURRENT_EVICTIONS: usize = 5;

/// Cordons the Node and then evicts its Pods, waiting until they are deleted. Pods
/// owned by a DaemonSet and static mirror Pods are left in place. Fails if the drain
/// has not completed within an hour.
pub async fn drain_node(client: &Client, node: &Node) -> Result<()> {
    let node_name = node.name_any();
    let nodes: Api<Node> = Api::all(client.clone());
    nodes.cordon(&node_name).await.map_err(Error::KubeError)?;

    tokio::time::timeout(NODE_DRAIN_TIMEOUT, evict_pods(client, &node_name))
        .await
        .map_err(|_| Error::DrainError(format!("timed out draining Node {node_name}")))?
}

async fn evict_pods(client: &Client, node_name: &str) -> Result<()> {
    let pods: Api<Pod> = Api::all(client.clone());
    let pod_list = pods
        .list(&ListParams::default().fields(&format!("spec.nodeName={node_name}")))
        .await
        .map_err(Error::KubeError)?;
    let target_pods: Vec<Pod> = pod_list
        .items
        .into_iter()
        .filter(|pod| is_eviction_target(pod))
        .collect();

    stream::iter(target_pods.into_iter().map(Ok))
        .try_for_each_concurrent(CONCURRENT_EVICTIONS, |pod| {
            let client = client.clone();
            async move {
                evict_pod(&client, &pod).await?;
                wait_for_pod_to_be_deleted(&client, &pod).await
            }
        })
        .await
}

/// Returns true if the Pod should be evicted as part of a drain. DaemonSet Pods are
/// skipped because the DaemonSet controller does not respect cordons; static mirror
/// Pods are skipped because they cannot be controlled through the API server.
fn is_eviction_target(pod: &Pod) -> bool {
    let owned_by_daemon_set = pod
        .owner_references()
        .iter()
        .any(|reference| reference.controller == Some(true) && reference.kind == "DaemonSet");
    if owned_by_daemon_set {
        return false;
    }
    if pod.annotations().contains_key("kubernetes.io/config.mirror") {
        return false;
    }
    true
}

async fn evict_pod(client: &Client, pod: &Pod) -> Result<()> {
    let name = pod.name_any();
    let pods = namespaced_pod_api(client, pod);
    loop {
        match pods.evict(&name, &EvictParams::default()).await {
            Ok(_) => {
                debug!("Evicted Pod {name}");
                return Ok(());
            }
            // 429 means an unsatisfied disruption budget and 500 usually means
            // overlapping budgets; both can resolve so we keep trying
            Err(kube::Error::Api(err)) if err.code == 429 || err.code == 500 => {
                debug!("Eviction of Pod {name} blocked: {}", err.message);
                tokio::time::sleep(EVICTION_RETRY_INTERVAL).await;
            }
            // The Pod is already gone
            Err(kube::Error::Api(err)) if err.code == 404 => return Ok(()),
            Err(err) => return Err(Error::KubeError(err)),
        }
    }
}

async fn wait_for_pod_to_be_deleted(client: &Client, pod: &Pod) -> Result<()> {
    let name = pod.name_any();
    let pods = namespaced_pod_api(client, pod);
    loop {
        match pods.get_opt(&name).await.map_err(Error::KubeError)? {
            // Compare UIDs in case the Pod was recreated with the same name
            Some(current) if current.uid() == pod.uid() => {
                tokio::time::sleep(DELETION_CHECK_INTERVAL).await;
            }
            _ => return Ok(()),
        }
    }
}

fn namespaced_pod_api(client: &Client, pod: &Pod) -> Api<Pod> {
    match pod.namespace() {
        Some(namespace) => Api::namespaced(client.clone(), &namespace),
        None => Api::default_namespaced(client.clone()),
    }
}

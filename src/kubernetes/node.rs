use crate::{Error, Result};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, Taint};
use kube::{
    api::{Api, ListParams, PostParams, WatchEvent, WatchParams},
    client::Client,
    ResourceExt,
};
use tracing::*;

// https://github.com/kubernetes/autoscaler/blob/5bf33b23f2bcf5f9c8ccaf99d445e25366ee7f40/cluster-autoscaler/utils/taints/taints.go#L39-L42
pub const TO_BE_DELETED_TAINT: &str = "ToBeDeletedByClusterAutoscaler";
pub const DELETION_CANDIDATE_TAINT: &str = "DeletionCandidateOfClusterAutoscaler";

const UPDATE_CONFLICT_RETRIES: usize = 5;

/// Returns true if the Node carries a taint with the given key and effect
pub fn has_taint(node: &Node, key: &str, effect: &str) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .is_some_and(|taints| {
            taints
                .iter()
                .any(|taint| taint.key == key && taint.effect == effect)
        })
}

/// Adds the ToBeDeletedByClusterAutoscaler taint to the Node to tell kube-proxy to
/// start failing its health check and subsequently load balancer health checks,
/// depending on provider:
/// https://github.com/kubernetes/enhancements/tree/27ef0d9a740ae5058472aac4763483f0e7218c0e/keps/sig-network/3836-kube-proxy-improved-ingress-connectivity-reliability
pub async fn add_to_be_deleted_taint(client: &Client, node_name: &str) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    let mut attempt = 0;
    loop {
        let mut node = nodes.get(node_name).await.map_err(Error::KubeError)?;
        let taints = node
            .spec
            .get_or_insert_with(Default::default)
            .taints
            .get_or_insert_with(Vec::new);
        if taints.iter().any(|taint| taint.key == TO_BE_DELETED_TAINT) {
            return Ok(());
        }
        // https://github.com/kubernetes/autoscaler/blob/5bf33b23f2bcf5f9c8ccaf99d445e25366ee7f40/cluster-autoscaler/utils/taints/taints.go#L166-L174
        taints.push(Taint {
            key: TO_BE_DELETED_TAINT.to_string(),
            value: Some(Utc::now().timestamp().to_string()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        });
        match nodes.replace(node_name, &PostParams::default(), &node).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 && attempt < UPDATE_CONFLICT_RETRIES => {
                attempt += 1;
                debug!("Conflict adding taint to Node {node_name}, retrying");
            }
            Err(err) => return Err(Error::KubeError(err)),
        }
    }
}

/// Waits for the Node object to be deleted from the API server. The Node object is
/// expected to be removed by the node controller once the backing instance is gone:
/// https://kubernetes.io/docs/concepts/architecture/cloud-controller/#node-controller
pub async fn wait_for_node_to_be_deleted(client: &Client, node_name: &str) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    loop {
        let node_list = nodes
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        if !node_list.items.iter().any(|node| node.name_any() == node_name) {
            return Ok(());
        }
        let resource_version = node_list.metadata.resource_version.unwrap_or_default();

        let watch_params = WatchParams::default().fields(&format!("metadata.name={node_name}"));
        let mut stream = nodes
            .watch(&watch_params, &resource_version)
            .await
            .map_err(Error::KubeError)?
            .boxed();
        while let Some(event) = stream.try_next().await.map_err(Error::KubeError)? {
            match event {
                WatchEvent::Deleted(node) if node.name_any() == node_name => return Ok(()),
                WatchEvent::Error(err) => return Err(Error::WatchError(err.message)),
                _ => {}
            }
        }
        // The watch expired without seeing the deletion; list and watch again
    }
}

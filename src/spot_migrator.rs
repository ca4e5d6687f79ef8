use crate::{
    cloud_provider::CloudProvider,
    config::SpotMigratorConfig,
    kubernetes::{drain, node},
    manager::Diagnostics,
    Error, Metrics, Result,
};
use chrono::Utc;
use cron::Schedule;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    ResourceExt,
};
use serde_json::json;
use std::{str::FromStr, sync::Arc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::*;

// Running spot migration hourly is a reasonable tradeoff between cluster stability
// and reactivity to spot availability. The schedule fires on the hour rather than
// relative to process start so that migration still has a good chance of running
// even if the process is being restarted regularly.
const DEFAULT_MIGRATION_SCHEDULE: &str = "@hourly";

// https://kubernetes.io/docs/reference/labels-annotations-taints/#node-role-kubernetes-io-control-plane
const CONTROL_PLANE_NODE_ROLE_LABEL_KEY: &str = "node-role.kubernetes.io/control-plane";

/// Label added to Nodes just before draining so that an interrupted migration can be
/// identified and resumed after a restart
pub const NODE_SELECTED_FOR_DELETION_LABEL_KEY: &str = "cost-manager.io/selected-for-deletion";

/// spot-migrator periodically drains on-demand Nodes in an attempt to migrate
/// workloads to spot Nodes; this works because draining Nodes will eventually trigger
/// cluster scale up and the cluster autoscaler attempts to scale up the least
/// expensive node pool, taking into account the reduced cost of spot Nodes:
/// https://github.com/kubernetes/autoscaler/blob/600cda52cf764a1f08b06fc8cc29b1ef95f13c76/cluster-autoscaler/proposals/pricing.md
pub struct SpotMigrator {
    pub client: Client,
    pub cloud_provider: Arc<dyn CloudProvider>,
    pub config: Option<SpotMigratorConfig>,
    pub metrics: Metrics,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Name of the Node this process is scheduled on, if known; used to avoid
    /// draining ourself while other candidates remain
    pub local_node_name: Option<String>,
}

impl SpotMigrator {
    /// Runs spot migration until the shutdown token is cancelled. Only unrecoverable
    /// initialisation failures return an error; operational failures increment the
    /// failure metric and the loop continues at the next schedule time.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let migration_schedule = self
            .config
            .as_ref()
            .and_then(|config| config.migration_schedule.as_deref())
            .unwrap_or(DEFAULT_MIGRATION_SCHEDULE);
        let migration_schedule = parse_migration_schedule(migration_schedule)?;

        // If spot-migrator drains itself then any ongoing migration operation is
        // cancelled. To mitigate this we first drain and delete any Nodes that have
        // previously been selected for deletion. We do not run a full migration here
        // because otherwise we could get stuck in a continuous loop of draining and
        // deleting the Node that spot-migrator is running on.
        let on_demand_nodes = self.list_on_demand_nodes().await?;
        for on_demand_node in &on_demand_nodes {
            if is_selected_for_deletion(on_demand_node) {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    result = self.drain_and_delete_node(on_demand_node) => result?,
                }
            }
        }

        loop {
            let now = Utc::now();
            let Some(next_schedule_time) = migration_schedule.after(&now).next() else {
                return Err(Error::ScheduleError(format!(
                    "migration schedule has no upcoming times after {now}"
                )));
            };
            let sleep_duration = (next_schedule_time - now).to_std().unwrap_or_default();
            info!(
                "Waiting {}s before next spot migration",
                sleep_duration.as_secs()
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(sleep_duration) => {}
            }

            if let Err(err) = self.run_migration(&shutdown).await {
                // We do not return the error to make sure the other controllers
                // continue to run; Prometheus metrics alert us to failures
                error!("Failed to run spot migration: {err}");
                self.metrics.spot_migrator_operation_failure_total.inc();
            }
        }
    }

    /// Runs a single migration round, draining and deleting on-demand Nodes until
    /// either none remain or the cloud provider supplies a new on-demand Node
    async fn run_migration(&self, shutdown: &CancellationToken) -> Result<()> {
        self.diagnostics.write().await.last_event = Utc::now();
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            // List on-demand Nodes before draining
            let before_drain_nodes = self.list_on_demand_nodes().await?;

            // If there are no on-demand Nodes then we are done; all workloads are
            // already running on spot Nodes
            if before_drain_nodes.is_empty() {
                self.metrics.spot_migrator_operation_success_total.inc();
                return Ok(());
            }

            let on_demand_node = select_node_for_deletion(
                before_drain_nodes.clone(),
                self.local_node_name.as_deref(),
            )?;

            // Label the Node just before draining; if we happen to drain ourself this
            // allows the Node to be identified again after rescheduling
            self.add_selected_for_deletion_label(&on_demand_node.name_any())
                .await?;

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                result = self.drain_and_delete_node(&on_demand_node) => result?,
            }

            // List on-demand Nodes after draining
            let after_drain_nodes = self.list_on_demand_nodes().await?;

            // If any on-demand Nodes were created while draining then we assume that
            // there are no more spot VMs available and that spot migration is complete
            if node_created(&before_drain_nodes, &after_drain_nodes) {
                info!("Spot migration complete");
                return Ok(());
            }
        }
    }

    /// Lists all Nodes that are not backed by a spot instance, ignoring control
    /// plane Nodes to make sure that we never drain them
    async fn list_on_demand_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_list = nodes
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        let mut on_demand_nodes = Vec::new();
        for node in node_list {
            if is_control_plane_node(&node) {
                continue;
            }
            if !self.cloud_provider.is_spot_instance(&node).await? {
                on_demand_nodes.push(node);
            }
        }
        Ok(on_demand_nodes)
    }

    /// Drains the Node and deletes the underlying instance
    async fn drain_and_delete_node(&self, node: &Node) -> Result<()> {
        let node_name = node.name_any();

        info!("Draining Node {node_name}");
        drain::drain_node(&self.client, node).await?;
        info!("Drained Node {node_name} successfully");

        info!("Adding taint {}", node::TO_BE_DELETED_TAINT);
        node::add_to_be_deleted_taint(&self.client, &node_name).await?;
        info!("Taint {} added successfully", node::TO_BE_DELETED_TAINT);

        info!("Deleting instance backing Node {node_name}");
        self.cloud_provider.delete_instance(node).await?;
        info!("Instance deleted successfully");

        info!("Waiting for Node {node_name} to be deleted");
        node::wait_for_node_to_be_deleted(&self.client, &node_name).await?;
        info!("Node {node_name} deleted");

        self.metrics.spot_migrator_operation_success_total.inc();

        Ok(())
    }

    async fn add_selected_for_deletion_label(&self, node_name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": {
                "labels": {
                    NODE_SELECTED_FOR_DELETION_LABEL_KEY: "true",
                }
            }
        });
        nodes
            .patch(node_name, &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

fn is_control_plane_node(node: &Node) -> bool {
    node.labels().contains_key(CONTROL_PLANE_NODE_ROLE_LABEL_KEY)
}

pub fn is_selected_for_deletion(node: &Node) -> bool {
    node.labels()
        .get(NODE_SELECTED_FOR_DELETION_LABEL_KEY)
        .map(String::as_str)
        == Some("true")
}

/// Parses a standard 5-field cron expression (or an @hourly-style shorthand) into a
/// schedule whose upcoming times are anchored to wall-clock boundaries rather than
/// the current time
fn parse_migration_schedule(migration_schedule: &str) -> Result<Schedule> {
    let migration_schedule = migration_schedule.trim();
    // The cron crate expects a leading seconds field
    let normalized = match migration_schedule {
        "@hourly" => "0 0 * * * *".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@weekly" => "0 0 0 * * Sun".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        expression if expression.split_whitespace().count() == 5 => format!("0 {expression}"),
        expression => expression.to_string(),
    };
    Schedule::from_str(&normalized).map_err(|err| {
        Error::ScheduleError(format!(
            "failed to parse migration schedule \"{migration_schedule}\": {err}"
        ))
    })
}

/// Attempts to find the best Node to delete using the following algorithm:
/// 1. If there are any Nodes that have previously been selected for deletion then return the oldest
/// 2. Otherwise if there are any unschedulable Nodes then return the oldest
/// 3. Otherwise if there are any Nodes about to be deleted by the cluster autoscaler then return the oldest
/// 4. Otherwise if there are any Nodes marked as deletion candidates by the cluster autoscaler then return the oldest
/// 5. Otherwise if there are any Nodes that are not running this process then return the oldest
/// 6. Otherwise return the oldest Node
fn select_node_for_deletion(mut nodes: Vec<Node>, local_node_name: Option<&str>) -> Result<Node> {
    // There should always be at least 1 Node to select from
    if nodes.is_empty() {
        return Err(Error::NodeSelectionError(
            "failed to select Node from empty list".to_string(),
        ));
    }

    // Sort the Nodes in the order in which they were created; the sort is stable so
    // equal creation times keep their list order
    nodes.sort_by_key(|node| node.creation_timestamp().map(|time| time.0));

    // If any Nodes have previously been selected for deletion then return the first
    // one; all such Nodes should have already been drained and deleted when
    // spot-migrator started up
    if let Some(node) = nodes.iter().find(|node| is_selected_for_deletion(node)) {
        return Ok(node.clone());
    }

    // If any Nodes are unschedulable then return the first one; this reduces the
    // chance of having more than one unschedulable Node at any one time
    if let Some(node) = nodes.iter().find(|node| {
        node.spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false)
    }) {
        return Ok(node.clone());
    }

    // If any Nodes are about to be deleted by the cluster autoscaler then return the
    // first one; this reduces the chance of draining more than one Node at a time
    if let Some(node) = nodes
        .iter()
        .find(|node| node::has_taint(node, node::TO_BE_DELETED_TAINT, "NoSchedule"))
    {
        return Ok(node.clone());
    }

    // If any Nodes are candidates for deletion by the cluster autoscaler then return
    // the first one; this reduces the chance of draining more than one Node at a time
    if let Some(node) = nodes
        .iter()
        .find(|node| node::has_taint(node, node::DELETION_CANDIDATE_TAINT, "PreferNoSchedule"))
    {
        return Ok(node.clone());
    }

    // If any Nodes are not running spot-migrator then return the first one; draining
    // ourself would cancel the in-flight migration operation. There is a small
    // possibility that the Node spot-migrator is running on is the only on-demand
    // Node remaining that could be drained to trigger the addition of a new spot Node
    // but this seems like the lesser evil compared to potentially repeatedly
    // cancelling migration operations.
    if let Some(local_node_name) = local_node_name {
        if let Some(node) = nodes.iter().find(|node| node.name_any() != local_node_name) {
            return Ok(node.clone());
        }
    }

    Ok(nodes.remove(0))
}

/// Compares the list of Nodes before and after draining to determine whether any
/// Nodes were created in the meantime. UIDs are compared to detect a Node object
/// that was recreated with the same name.
fn node_created(before_nodes: &[Node], after_nodes: &[Node]) -> bool {
    after_nodes.iter().any(|after_node| {
        !before_nodes
            .iter()
            .any(|before_node| before_node.uid() == after_node.uid())
    })
}

#[cfg(test)]
mod test {
    use super::{
        node_created, parse_migration_schedule, select_node_for_deletion,
        NODE_SELECTED_FOR_DELETION_LABEL_KEY,
    };
    use crate::kubernetes::node::{DELETION_CANDIDATE_TAINT, TO_BE_DELETED_TAINT};
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::core::v1::{Node, NodeSpec, Taint};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn node_with_uid(uid: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn node_created_at(name: &str, created_hours: i64) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                creation_timestamp: Some(Time(
                    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                        + chrono::Duration::hours(created_hours),
                )),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn with_label(mut node: Node, key: &str, value: &str) -> Node {
        node.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        node
    }

    fn with_taint(mut node: Node, key: &str, effect: &str) -> Node {
        node.spec
            .get_or_insert_with(NodeSpec::default)
            .taints
            .get_or_insert_with(Vec::new)
            .push(Taint {
                key: key.to_string(),
                effect: effect.to_string(),
                ..Default::default()
            });
        node
    }

    fn unschedulable(mut node: Node) -> Node {
        node.spec.get_or_insert_with(NodeSpec::default).unschedulable = Some(true);
        node
    }

    #[test]
    fn node_created_is_false_on_no_change() {
        let nodes = vec![node_with_uid("1")];
        assert!(!node_created(&nodes, &nodes));
    }

    #[test]
    fn node_created_is_false_on_node_removed() {
        let before_nodes = vec![node_with_uid("1"), node_with_uid("2")];
        let after_nodes = vec![node_with_uid("1")];
        assert!(!node_created(&before_nodes, &after_nodes));
    }

    #[test]
    fn node_created_is_true_on_node_create() {
        let before_nodes = vec![node_with_uid("1")];
        let after_nodes = vec![node_with_uid("1"), node_with_uid("2")];
        assert!(node_created(&before_nodes, &after_nodes));
    }

    #[test]
    fn select_errors_on_empty_list() {
        assert!(select_node_for_deletion(vec![], None).is_err());
    }

    #[test]
    fn select_prefers_oldest() {
        let nodes = vec![
            node_created_at("secondoldest", 2),
            node_created_at("oldest", 1),
            node_created_at("thirdoldest", 3),
        ];
        let node = select_node_for_deletion(nodes, None).unwrap();
        assert_eq!(node.metadata.name.as_deref(), Some("oldest"));
    }

    #[test]
    fn select_returns_single_candidate_regardless_of_markers() {
        let nodes = vec![with_label(
            node_created_at("only", 1),
            NODE_SELECTED_FOR_DELETION_LABEL_KEY,
            "true",
        )];
        let node = select_node_for_deletion(nodes, Some("only")).unwrap();
        assert_eq!(node.metadata.name.as_deref(), Some("only"));
    }

    #[test]
    fn select_prefers_nodes_selected_for_deletion() {
        let nodes = vec![
            node_created_at("oldest", 1),
            with_label(
                node_created_at("marked", 2),
                NODE_SELECTED_FOR_DELETION_LABEL_KEY,
                "true",
            ),
        ];
        let node = select_node_for_deletion(nodes, None).unwrap();
        assert_eq!(node.metadata.name.as_deref(), Some("marked"));
    }

    #[test]
    fn select_prefers_unschedulable_nodes() {
        let nodes = vec![
            node_created_at("oldest", 1),
            unschedulable(node_created_at("cordoned", 2)),
        ];
        let node = select_node_for_deletion(nodes, None).unwrap();
        assert_eq!(node.metadata.name.as_deref(), Some("cordoned"));
    }

    #[test]
    fn select_prefers_nodes_marked_no_schedule_by_cluster_autoscaler() {
        let nodes = vec![
            node_created_at("oldest", 1),
            with_taint(
                node_created_at("tainted", 2),
                TO_BE_DELETED_TAINT,
                "NoSchedule",
            ),
        ];
        let node = select_node_for_deletion(nodes, None).unwrap();
        assert_eq!(node.metadata.name.as_deref(), Some("tainted"));
    }

    #[test]
    fn select_prefers_nodes_marked_prefer_no_schedule_by_cluster_autoscaler() {
        let nodes = vec![
            node_created_at("oldest", 1),
            with_taint(
                node_created_at("candidate", 2),
                DELETION_CANDIDATE_TAINT,
                "PreferNoSchedule",
            ),
        ];
        let node = select_node_for_deletion(nodes, None).unwrap();
        assert_eq!(node.metadata.name.as_deref(), Some("candidate"));
    }

    #[test]
    fn select_does_not_prefer_local_node() {
        let nodes = vec![
            node_created_at("secondoldest", 2),
            node_created_at("oldest", 1),
            node_created_at("thirdoldest", 3),
        ];
        let node = select_node_for_deletion(nodes, Some("oldest")).unwrap();
        assert_eq!(node.metadata.name.as_deref(), Some("secondoldest"));
    }

    #[test]
    fn select_falls_back_to_oldest_without_local_node_name() {
        let nodes = vec![node_created_at("secondoldest", 2), node_created_at("oldest", 1)];
        let node = select_node_for_deletion(nodes, None).unwrap();
        assert_eq!(node.metadata.name.as_deref(), Some("oldest"));
    }

    #[test]
    fn select_breaks_creation_time_ties_by_list_order() {
        let nodes = vec![
            node_created_at("first", 1),
            node_created_at("second", 1),
            node_created_at("third", 1),
        ];
        let node = select_node_for_deletion(nodes, None).unwrap();
        assert_eq!(node.metadata.name.as_deref(), Some("first"));
    }

    #[test]
    fn parses_default_migration_schedule() {
        let schedule = parse_migration_schedule("@hourly").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let next = schedule.after(&now).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn parses_five_field_migration_schedule() {
        let schedule = parse_migration_schedule("*/10 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 31, 0).unwrap();
        let next = schedule.after(&now).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 10, 40, 0).unwrap());
    }

    #[test]
    fn rejects_invalid_migration_schedule() {
        assert!(parse_migration_schedule("every hour").is_err());
    }

    #[test]
    fn schedule_times_are_anchored_to_wall_clock_boundaries() {
        // A schedule computed relative to the current time would starve under
        // frequent restarts; upcoming times must not move with the query time
        let schedule = parse_migration_schedule("@hourly").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let slightly_later = now + chrono::Duration::seconds(1);
        assert_eq!(
            schedule.after(&now).next(),
            schedule.after(&slightly_later).next()
        );
    }
}

use crate::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

pub const SPOT_INSTANCE_LABEL_KEY: &str = "is-spot-instance";
pub const SPOT_INSTANCE_LABEL_VALUE: &str = "true";

/// Fake cloud provider for testing; classifies Nodes by a single label and does not
/// touch any instances
#[derive(Default)]
pub struct CloudProvider {}

#[async_trait]
impl super::CloudProvider for CloudProvider {
    async fn is_spot_instance(&self, node: &Node) -> Result<bool> {
        Ok(node.labels().get(SPOT_INSTANCE_LABEL_KEY).map(String::as_str)
            == Some(SPOT_INSTANCE_LABEL_VALUE))
    }

    async fn delete_instance(&self, _node: &Node) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{CloudProvider, SPOT_INSTANCE_LABEL_KEY};
    use crate::cloud_provider::CloudProvider as _;
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn labelled_node(value: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                labels: Some(
                    [(SPOT_INSTANCE_LABEL_KEY.to_string(), value.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn classifies_spot_nodes_by_label() {
        let cloud_provider = CloudProvider::default();
        assert!(cloud_provider
            .is_spot_instance(&labelled_node("true"))
            .await
            .unwrap());
        assert!(!cloud_provider
            .is_spot_instance(&labelled_node("false"))
            .await
            .unwrap());
        assert!(!cloud_provider
            .is_spot_instance(&Node::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_instance_is_a_noop() {
        let cloud_provider = CloudProvider::default();
        assert!(cloud_provider
            .delete_instance(&Node::default())
            .await
            .is_ok());
    }
}

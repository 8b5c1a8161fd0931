//! Batch cordoning of scheduler nodes
//!
//! Marks nodes unschedulable so no new workloads land on instances that are
//! about to be terminated. Existing pods are not evicted.

use std::collections::BTreeMap;

use tracing::info;

use crate::kube::OrchestratorBackend;
use crate::{Error, Result};

/// Node label carrying the cloud instance id
pub const LABEL_INSTANCE_ID: &str = "instance-id";

/// Cordon every node whose `instance-id` label matches one of the given ids.
///
/// Node resolution errors abort immediately. Per-node update failures are
/// collected; any failure makes the whole batch report a cordon error naming
/// each node, after every node has been attempted.
pub async fn cordon_nodes<K>(kube: &K, instance_ids: &[String]) -> Result<()>
where
    K: OrchestratorBackend + ?Sized,
{
    info!(instances = ?instance_ids, "Fetching kubernetes nodes to cordon");

    let mut to_cordon = Vec::new();
    for id in instance_ids {
        let labels = BTreeMap::from([(LABEL_INSTANCE_ID.to_string(), id.clone())]);
        let nodes = kube.get_nodes_by_label(&labels).await.map_err(|e| {
            Error::operational(format!("failed to resolve node for instance {id}: {e}"))
        })?;
        to_cordon.extend(nodes);
    }

    let mut failures: BTreeMap<String, String> = BTreeMap::new();
    for mut node in to_cordon {
        let name = node.metadata.name.clone().unwrap_or_default();
        info!(node = %name, "Cordoning kubernetes node");

        node.spec.get_or_insert_with(Default::default).unschedulable = Some(true);

        match kube.update_node(&node).await {
            Ok(updated) => {
                let unschedulable = updated
                    .spec
                    .as_ref()
                    .and_then(|s| s.unschedulable)
                    .unwrap_or(false);
                if !unschedulable {
                    failures.insert(name, "failed for unknown reason".to_string());
                }
            }
            Err(e) => {
                failures.insert(name, e.to_string());
            }
        }
    }

    if !failures.is_empty() {
        let detail = failures
            .iter()
            .map(|(node, error)| format!("{node}: {error}"))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(Error::cordon(format!("failed to cordon nodes: {detail}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::MockOrchestratorBackend;
    use k8s_openapi::api::core::v1::{Node, NodeSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn cordoned(name: &str) -> Node {
        let mut n = node(name);
        n.spec = Some(NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        });
        n
    }

    #[tokio::test]
    async fn cordons_every_resolved_node() {
        let mut kube = MockOrchestratorBackend::new();
        kube.expect_get_nodes_by_label()
            .withf(|labels| labels.get(LABEL_INSTANCE_ID).is_some())
            .returning(|labels| {
                let id = labels.get(LABEL_INSTANCE_ID).unwrap().clone();
                Ok(vec![node(&format!("node-{id}"))])
            });
        kube.expect_update_node()
            .withf(|n| {
                n.spec
                    .as_ref()
                    .and_then(|s| s.unschedulable)
                    .unwrap_or(false)
            })
            .times(2)
            .returning(|n| Ok(cordoned(n.metadata.name.as_deref().unwrap())));

        let ids = vec!["i-1".to_string(), "i-2".to_string()];
        cordon_nodes(&kube, &ids).await.unwrap();
    }

    #[tokio::test]
    async fn collects_per_node_failures() {
        let mut kube = MockOrchestratorBackend::new();
        kube.expect_get_nodes_by_label().returning(|labels| {
            let id = labels.get(LABEL_INSTANCE_ID).unwrap().clone();
            Ok(vec![node(&format!("node-{id}"))])
        });
        // node-i-1 fails outright; node-i-2 is attempted anyway and comes
        // back without the flag set.
        kube.expect_update_node()
            .times(2)
            .returning(|n| match n.metadata.name.as_deref() {
                Some("node-i-1") => Err(Error::operational("update refused")),
                _ => Ok(node(n.metadata.name.as_deref().unwrap())),
            });

        let ids = vec!["i-1".to_string(), "i-2".to_string()];
        let err = cordon_nodes(&kube, &ids).await.unwrap_err();

        assert!(matches!(err, Error::Cordon(_)));
        let message = err.to_string();
        assert!(message.contains("node-i-1: operational error: update refused"));
        assert!(message.contains("node-i-2: failed for unknown reason"));
    }

    #[tokio::test]
    async fn resolution_failure_aborts() {
        let mut kube = MockOrchestratorBackend::new();
        kube.expect_get_nodes_by_label()
            .returning(|_| Err(Error::operational("api unavailable")));
        // update_node has no expectation: calling it would panic.

        let ids = vec!["i-1".to_string()];
        let err = cordon_nodes(&kube, &ids).await.unwrap_err();
        assert!(matches!(err, Error::Operational(_)));
    }

    #[tokio::test]
    async fn no_matching_nodes_is_success() {
        let mut kube = MockOrchestratorBackend::new();
        kube.expect_get_nodes_by_label().returning(|_| Ok(vec![]));

        let ids = vec!["i-1".to_string()];
        cordon_nodes(&kube, &ids).await.unwrap();
    }
}

//! Access to the control and target clusters

use std::path::Path;

use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::api::{Api, ListParams};
use kube::config::Kubeconfig;
use kube::Client;
use tracing::{debug, info, warn};

use mcm_e2e_common::kube_utils::{client_from_kubeconfig, current_context_cluster, is_node_ready};

use crate::error::{Error, Result};

/// A cluster reached through one kubeconfig file
#[derive(Clone)]
pub struct Cluster {
    client: Client,
    name: Option<String>,
}

impl Cluster {
    /// Build a client for `kubeconfig` and remember the cluster name of its
    /// current context
    pub async fn connect(kubeconfig: &Path) -> Result<Self> {
        let doc = Kubeconfig::read_from(kubeconfig).map_err(|e| {
            Error::config(format!(
                "failed to read kubeconfig {}: {e}",
                kubeconfig.display()
            ))
        })?;
        let name = current_context_cluster(&doc);
        let client = client_from_kubeconfig(kubeconfig).await?;

        debug!(kubeconfig = %kubeconfig.display(), cluster = ?name, "Connected");
        Ok(Self { client, name })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Cluster of the kubeconfig's current context
    pub fn cluster_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&ListParams::default()).await?.items)
    }

    /// List nodes once to prove the API server is reachable
    pub async fn probe_nodes(&self) -> Result<usize> {
        let count = self.list_nodes().await?.len();
        info!(cluster = ?self.name, nodes = count, "Cluster is reachable");
        Ok(count)
    }

    pub async fn node_count(&self) -> Result<u32> {
        Ok(self.list_nodes().await?.len() as u32)
    }

    pub async fn ready_node_count(&self) -> Result<u32> {
        Ok(count_ready(&self.list_nodes().await?))
    }

    /// Whether this cluster hosts the control plane of `target`.
    ///
    /// A seed has a namespace named after each cluster it hosts.
    pub async fn is_seed_of(&self, target: &Cluster) -> Result<bool> {
        let Some(target_name) = target.cluster_name() else {
            return Ok(false);
        };
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.get_opt(target_name).await? {
            Some(_) => {
                info!(target = %target_name, "Control cluster is the seed of the target");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Node count for the convergence poller; `None` if the query failed
    pub async fn sample_nodes(&self) -> Option<u32> {
        self.node_count()
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to count nodes"))
            .ok()
    }

    /// Ready node count for the convergence poller; `None` if the query failed
    pub async fn sample_ready_nodes(&self) -> Option<u32> {
        self.ready_node_count()
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to count ready nodes"))
            .ok()
    }
}

fn count_ready(nodes: &[Node]) -> u32 {
    nodes.iter().filter(|n| is_node_ready(n)).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};

    fn node(ready: Option<&str>) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: ready.map(|status| {
                    vec![NodeCondition {
                        type_: "Ready".to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn only_nodes_with_ready_true_count() {
        let nodes = vec![
            node(Some("True")),
            node(Some("False")),
            node(Some("Unknown")),
            node(None),
            node(Some("True")),
        ];
        assert_eq!(count_ready(&nodes), 2);
    }

    #[test]
    fn no_nodes_means_none_ready() {
        assert_eq!(count_ready(&[]), 0);
    }
}

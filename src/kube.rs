//! Kubernetes scheduler backend
//!
//! The roller's view of the orchestrator: list nodes by label, write a
//! modified node back, and scale a named deployment. The real
//! implementation wraps a kube-rs client; tests substitute mocks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Config};
use secrecy::SecretString;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Capability set the roller needs from the Kubernetes API.
///
/// Implementations must be safe for concurrent use.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OrchestratorBackend: Send + Sync {
    /// Nodes whose labels match every given label
    async fn get_nodes_by_label(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>>;

    /// Write a modified node; returns the server-accepted result
    async fn update_node(&self, node: &Node) -> Result<Node>;

    /// Set a deployment's replica count; returns once the API has accepted
    /// the change
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;
}

/// Real [`OrchestratorBackend`] backed by a kube-rs client
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    /// Wrap an existing kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect to the given API server with basic auth
    pub async fn connect(server: &str, username: &str, password: &str) -> Result<Self> {
        let url: http::Uri = server
            .parse()
            .map_err(|e| Error::config(format!("invalid kubernetes server {server}: {e}")))?;

        let mut config = Config::new(url);
        config.auth_info.username = Some(username.to_string());
        config.auth_info.password = Some(SecretString::from(password.to_string()));

        let client = Client::try_from(config)?;
        Ok(Self { client })
    }
}

/// Render a label map as a Kubernetes label selector
fn selector_from_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Merge patch setting a deployment's replica count
fn replicas_patch(replicas: i32) -> serde_json::Value {
    serde_json::json!({ "spec": { "replicas": replicas } })
}

#[async_trait]
impl OrchestratorBackend for KubeBackend {
    async fn get_nodes_by_label(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&selector_from_labels(labels));
        let nodes = api.list(&params).await?;
        Ok(nodes.items)
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let name = node
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::operational("node has no name"))?;

        let api: Api<Node> = Api::all(self.client.clone());
        let updated = api.replace(name, &PostParams::default(), node).await?;
        Ok(updated)
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        debug!(
            deployment = %name,
            namespace = %namespace,
            replicas,
            "Scaling deployment"
        );

        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&replicas_patch(replicas)),
        )
        .await?;
        Ok(())
    }
}

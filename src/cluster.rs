//! Warehouse topology.
//!
//! The number of sinks per shard equals the cluster's slice count, so the
//! bulk load gets one file per slice from every shard.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_redshift::Client;
use aws_sdk_redshift::error::DisplayErrorContext;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::debug;

use crate::error::{
    ClusterError, ClusterNotFoundSnafu, ConfigError, MissingAttributeSnafu, TopologySnafu,
    UnknownNodeTypeSnafu,
};

/// Slices per node for every node type the loader knows about.
pub fn slices_per_node(node_type: &str) -> Result<usize, ConfigError> {
    let slices = match node_type {
        "dw1.xlarge" | "dw2.large" | "dc1.large" | "dc2.large" | "ds2.xlarge" | "ra3.xlplus" => 2,
        "ra3.4xlarge" => 4,
        "dw1.8xlarge" | "dc1.8xlarge" | "dc2.8xlarge" | "ds2.8xlarge" | "ra3.16xlarge" => 16,
        "dw2.8xlarge" => 32,
        _ => return UnknownNodeTypeSnafu { node_type }.fail(),
    };
    Ok(slices)
}

/// Node type and count of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub node_type: String,
    pub number_of_nodes: usize,
}

impl ClusterTopology {
    pub fn slice_count(&self) -> Result<usize, ConfigError> {
        Ok(slices_per_node(&self.node_type)? * self.number_of_nodes.max(1))
    }
}

/// Source of cluster topology.
#[async_trait]
pub trait ClusterMetadata: Send + Sync {
    async fn topology(&self) -> Result<ClusterTopology, ClusterError>;

    async fn slice_count(&self) -> Result<usize, ClusterError> {
        self.topology()
            .await?
            .slice_count()
            .context(TopologySnafu)
    }
}

/// Topology fixed in configuration.
#[derive(Debug, Clone)]
pub struct StaticClusterMetadata(pub ClusterTopology);

#[async_trait]
impl ClusterMetadata for StaticClusterMetadata {
    async fn topology(&self) -> Result<ClusterTopology, ClusterError> {
        Ok(self.0.clone())
    }
}

/// Topology described through the Redshift API.
pub struct RedshiftClusterMetadata {
    client: Client,
    cluster: String,
}

impl RedshiftClusterMetadata {
    pub fn new(client: Client, cluster: impl Into<String>) -> Self {
        Self {
            client,
            cluster: cluster.into(),
        }
    }

    pub async fn connect(cluster: impl Into<String>, region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config), cluster)
    }
}

#[async_trait]
impl ClusterMetadata for RedshiftClusterMetadata {
    async fn topology(&self) -> Result<ClusterTopology, ClusterError> {
        let output = self
            .client
            .describe_clusters()
            .cluster_identifier(&self.cluster)
            .send()
            .await
            .map_err(|e| ClusterError::Describe {
                cluster: self.cluster.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let cluster = output.clusters().first().context(ClusterNotFoundSnafu {
            cluster: &self.cluster,
        })?;
        let node_type = cluster.node_type().context(MissingAttributeSnafu {
            cluster: &self.cluster,
            field: "NodeType",
        })?;
        let number_of_nodes = cluster.number_of_nodes().context(MissingAttributeSnafu {
            cluster: &self.cluster,
            field: "NumberOfNodes",
        })?;

        debug!(cluster = %self.cluster, node_type, number_of_nodes, "Described cluster");
        Ok(ClusterTopology {
            node_type: node_type.to_string(),
            number_of_nodes: number_of_nodes.max(0) as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(node_type: &str, nodes: usize) -> ClusterTopology {
        ClusterTopology {
            node_type: node_type.into(),
            number_of_nodes: nodes,
        }
    }

    #[test]
    fn test_slice_factors() {
        assert_eq!(slices_per_node("dc2.large").unwrap(), 2);
        assert_eq!(slices_per_node("ra3.4xlarge").unwrap(), 4);
        assert_eq!(slices_per_node("ds2.8xlarge").unwrap(), 16);
        assert_eq!(slices_per_node("dw2.8xlarge").unwrap(), 32);
    }

    #[test]
    fn test_unknown_node_type_is_fatal() {
        assert!(matches!(
            slices_per_node("m5.large"),
            Err(ConfigError::UnknownNodeType { .. })
        ));
    }

    #[test]
    fn test_slice_count_multiplies_nodes() {
        assert_eq!(topology("dc2.large", 4).slice_count().unwrap(), 8);
        assert_eq!(topology("ra3.16xlarge", 2).slice_count().unwrap(), 32);
    }

    #[tokio::test]
    async fn test_static_metadata() {
        let metadata = StaticClusterMetadata(topology("dc1.8xlarge", 3));
        assert_eq!(metadata.slice_count().await.unwrap(), 48);

        let metadata = StaticClusterMetadata(topology("x1.huge", 3));
        assert!(matches!(
            metadata.slice_count().await,
            Err(ClusterError::Topology { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_uses_configured_region() {
        let metadata = RedshiftClusterMetadata::connect("analytics", Some("us-west-2".into())).await;
        let region = metadata.client.config().region().map(|r| r.as_ref().to_string());
        assert_eq!(region.as_deref(), Some("us-west-2"));
        assert_eq!(metadata.cluster, "analytics");
    }
}

//! Decoding and summarizing a deployment document read from disk.

use std::collections::BTreeSet;

use mongodb_operator::om::deployment::{self, Deployment, ResourceKind};
use serde_json::Value;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("document is neither JSON nor YAML"))]
    Parse { source: serde_yaml::Error },

    #[snafu(display("failed to decode the deployment"))]
    Decode { source: deployment::Error },

    #[snafu(display("failed to encode the deployment"))]
    Encode { source: deployment::Error },

    #[snafu(display("failed to determine the minimum MongoDB version"))]
    MinimumVersion { source: deployment::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub struct Inspection {
    /// The document as it would be written back by the operator.
    pub document: Value,
    pub summary: Summary,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Summary {
    pub version: i64,
    pub processes: usize,
    pub replica_sets: usize,
    pub sharded_clusters: Vec<ClusterSummary>,
    pub minimum_major_version: u64,
    pub all_processes_tls_enabled: bool,

    /// Hosts with a monitoring or backup agent but no process.
    pub orphaned_agent_hosts: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ClusterSummary {
    pub name: String,
    pub shards: usize,
    pub processes: usize,
    pub draining: Vec<String>,
}

/// Parses `bytes` as JSON or YAML (JSON documents are valid YAML) and decodes the deployment.
pub fn inspect(bytes: &[u8]) -> Result<Inspection> {
    let value: Value = serde_yaml::from_slice(bytes).context(ParseSnafu)?;
    let deployment = Deployment::from_value(value).context(DecodeSnafu)?;

    let summary = Summary::new(&deployment)?;
    let document = deployment.to_value().context(EncodeSnafu)?;
    Ok(Inspection { document, summary })
}

impl Summary {
    fn new(deployment: &Deployment) -> Result<Self> {
        let sharded_clusters = deployment
            .sharding
            .iter()
            .map(|cluster| ClusterSummary {
                name: cluster.name.clone(),
                shards: cluster.shards.len(),
                processes: deployment
                    .process_names(ResourceKind::ShardedCluster, &cluster.name)
                    .len(),
                draining: cluster.draining.clone(),
            })
            .collect();

        let process_hosts: BTreeSet<&str> = deployment
            .processes
            .iter()
            .map(|process| process.hostname.as_str())
            .collect();
        let orphaned_agent_hosts = deployment
            .monitoring_versions
            .iter()
            .chain(&deployment.backup_versions)
            .map(|agent| agent.hostname.as_str())
            .filter(|hostname| !process_hosts.contains(hostname))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(ToOwned::to_owned)
            .collect();

        Ok(Self {
            version: deployment.version(),
            processes: deployment.processes.len(),
            replica_sets: deployment.replica_sets.len(),
            sharded_clusters,
            minimum_major_version: deployment
                .minimum_major_version()
                .context(MinimumVersionSnafu)?,
            all_processes_tls_enabled: deployment.all_processes_are_tls_enabled(),
            orphaned_agent_hosts,
        })
    }

    pub fn log(&self) {
        tracing::info!(
            version = self.version,
            processes = self.processes,
            replica_sets = self.replica_sets,
            sharded_clusters = self.sharded_clusters.len(),
            minimum_major_version = self.minimum_major_version,
            tls = self.all_processes_tls_enabled,
            "decoded deployment"
        );
        for cluster in &self.sharded_clusters {
            tracing::info!(
                sharded_cluster = %cluster.name,
                shards = cluster.shards,
                processes = cluster.processes,
                "sharded cluster"
            );
            if !cluster.draining.is_empty() {
                tracing::warn!(
                    sharded_cluster = %cluster.name,
                    draining = ?cluster.draining,
                    "shards are draining, their replica sets stay until removal is finalized"
                );
            }
        }
        if !self.orphaned_agent_hosts.is_empty() {
            tracing::warn!(
                hosts = ?self.orphaned_agent_hosts,
                "monitoring or backup agents are configured on hosts without a process"
            );
        }
    }
}

use snafu::ensure;

use super::{Deployment, MongosProcessTypeMismatchSnafu, Result};
use crate::om::{
    process::{Process, ProcessType},
    replica_set::ReplicaSetWithProcesses,
    sharded_cluster::ShardedCluster,
};

/// The desired state of a sharded cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardedClusterMerge {
    pub name: String,
    pub mongos_processes: Vec<Process>,
    pub config_server: ReplicaSetWithProcesses,
    pub shards: Vec<ReplicaSetWithProcesses>,

    /// Removed shards are only deleted when this is set. It must only be set once the caller
    /// has confirmed that all chunks were migrated off the shards listed in `draining`.
    pub finalizing: bool,
}

impl Deployment {
    /// Merges a sharded cluster: mongos processes, config server, shards and the cluster
    /// descriptor.
    ///
    /// Shards that are no longer part of the cluster are removed in two phases. Without
    /// `finalizing` they are only added to the `draining` list and `true` (removal pending) is
    /// returned. With `finalizing` the draining list is cleared and the replica sets are deleted
    /// together with their processes.
    #[tracing::instrument(
        skip_all,
        fields(sharded_cluster = %desired.name, finalizing = desired.finalizing)
    )]
    pub fn merge_sharded_cluster(&mut self, desired: ShardedClusterMerge) -> Result<bool> {
        let ShardedClusterMerge {
            name,
            mongos_processes,
            mut config_server,
            shards,
            finalizing,
        } = desired;

        for process in &mongos_processes {
            ensure!(
                process.process_type == ProcessType::Mongos,
                MongosProcessTypeMismatchSnafu {
                    process: &process.name,
                    process_type: process.process_type,
                }
            );
        }

        self.merge_mongos_processes(&name, mongos_processes);

        config_server.set_config_server_role();
        let config_server_name = config_server.name().to_owned();
        self.merge_replica_set(config_server);

        let shard_names: Vec<String> = shards
            .iter()
            .map(|shard| shard.name().to_owned())
            .collect();
        for shard in shards {
            self.merge_replica_set(shard);
        }

        let desired_cluster = ShardedCluster::new(
            &name,
            config_server_name,
            shard_names.iter().map(String::as_str),
        );
        match self.sharded_cluster_mut(&name) {
            Some(existing) => existing.merge_from(&desired_cluster),
            None => {
                self.sharding.push(desired_cluster);
                return Ok(false);
            }
        }

        Ok(self.handle_shards_removal(&name, finalizing))
    }

    /// Names of the mongos processes belonging to the sharded cluster `cluster`.
    pub fn mongos_process_names(&self, cluster: &str) -> Vec<String> {
        self.processes
            .iter()
            .filter(|process| {
                process.process_type == ProcessType::Mongos
                    && process.cluster.as_deref() == Some(cluster)
            })
            .map(|process| process.name.clone())
            .collect()
    }

    fn merge_mongos_processes(&mut self, cluster: &str, desired: Vec<Process>) {
        let stale: Vec<String> = self
            .mongos_process_names(cluster)
            .into_iter()
            .filter(|name| !desired.iter().any(|process| &process.name == name))
            .collect();
        if !stale.is_empty() {
            tracing::info!(?stale, "removing mongos processes");
            self.remove_processes(&stale);
        }

        let existing = self.mongos_process_names(cluster);
        if !existing.is_empty() && existing.len() < desired.len() {
            self.clone_into_new_positions(&existing, &desired);
        }

        for mut process in desired {
            process.cluster = Some(cluster.to_owned());
            self.merge_standalone(process);
        }
    }

    fn handle_shards_removal(&mut self, name: &str, finalizing: bool) -> bool {
        let removed = self.replica_sets_removed_from_sharded_cluster(name);

        if finalizing {
            if let Some(cluster) = self.sharded_cluster_mut(name) {
                cluster.remove_draining();
            }
            if !removed.is_empty() {
                tracing::info!(?removed, "deleting drained shards");
                self.remove_replica_sets(&removed);
            }
            return false;
        }

        if removed.is_empty() {
            return false;
        }

        tracing::info!(?removed, "shards were removed, waiting for them to drain");
        if let Some(cluster) = self.sharded_cluster_mut(name) {
            cluster.add_to_draining(&removed);
        }
        true
    }
}

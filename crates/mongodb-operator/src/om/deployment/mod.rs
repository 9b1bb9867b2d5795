//! The deployment document: the externally owned configuration all automation agents of a
//! project poll and actuate.
//!
//! [`Deployment`] is a typed view over that document. Everything this crate manages has a typed
//! field, everything else ends up in one of the `extra` maps and is written back untouched.
//! All merge operations mutate the in-memory document only, see
//! [`crate::om::client::Client::read_update_deployment`] for the round trip to Ops Manager.

use mongodb_shared::document::{get_path, rename_key};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::Display;

use crate::om::{
    process::{self, ClusterAuthMode, Process},
    replica_set::{ReplicaSet, ReplicaSetWithProcesses},
    sharded_cluster::{ShardedCluster, shard_name_pattern},
};

mod agents;
mod sharding;
#[cfg(test)]
mod tests;

pub use agents::{AgentVersion, BACKUP_AGENT_DEFAULT_VERSION, MONITORING_AGENT_DEFAULT_VERSION};
pub use sharding::ShardedClusterMerge;

pub const AUTH_KEY: &str = "auth";
pub const TLS_KEY: &str = "ssl";
pub const LDAP_KEY: &str = "ldap";

pub const CA_FILE_PATH: &str = "/mongodb-automation/ca.pem";
pub const OPTIONAL_CLIENT_CERTIFICATES: &str = "OPTIONAL";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode deployment document"))]
    Decode { source: serde_json::Error },

    #[snafu(display("failed to encode deployment document"))]
    Encode { source: serde_json::Error },

    #[snafu(display("expected {path:?} in the deployment document to be {expected}"))]
    UnexpectedShape { path: String, expected: String },

    #[snafu(display("all mongos processes must have processType=\"mongos\", but {process:?} is a {process_type}"))]
    MongosProcessTypeMismatch {
        process: String,
        process_type: process::ProcessType,
    },

    #[snafu(display("process {name:?} does not exist"))]
    ProcessNotFound { name: String },

    #[snafu(display("replica set {name:?} does not exist"))]
    ReplicaSetNotFound { name: String },

    #[snafu(display("sharded cluster {name:?} does not exist"))]
    ShardedClusterNotFound { name: String },

    #[snafu(display("process {member:?} is not a member of replica set {replica_set:?}"))]
    MemberNotFound { replica_set: String, member: String },

    #[snafu(display("failed to read the version of process {process:?}"))]
    ProcessVersion {
        source: process::Error,
        process: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// The kinds of topologies a set of processes can form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ResourceKind {
    Standalone,
    ReplicaSet,
    ShardedCluster,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    #[serde(default)]
    pub processes: Vec<Process>,

    #[serde(default)]
    pub replica_sets: Vec<ReplicaSet>,

    #[serde(default)]
    pub sharding: Vec<ShardedCluster>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub monitoring_versions: Vec<AgentVersion>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_versions: Vec<AgentVersion>,

    /// `auth`, `ssl`, `ldap`, the revision counter (`version`) and all the rest.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Deployment {
    fn default() -> Self {
        Self::new()
    }
}

impl Deployment {
    /// Creates an empty deployment carrying the sections the agents expect to exist.
    pub fn new() -> Self {
        let mut extra = Map::new();
        extra.insert(AUTH_KEY.to_owned(), json!({}));
        extra.insert(
            TLS_KEY.to_owned(),
            json!({
                "clientCertificateMode": OPTIONAL_CLIENT_CERTIFICATES,
                "CAFilePath": CA_FILE_PATH,
            }),
        );

        Self {
            processes: Vec::new(),
            replica_sets: Vec::new(),
            sharding: Vec::new(),
            monitoring_versions: Vec::new(),
            backup_versions: Vec::new(),
            extra,
        }
    }

    /// Decodes a raw document, renaming `tls` sections to `ssl` on the way.
    pub fn from_value(mut value: Value) -> Result<Self> {
        let document = value
            .as_object_mut()
            .context(UnexpectedShapeSnafu {
                path: "",
                expected: "an object",
            })?;
        rename_key(document, "tls", TLS_KEY);

        if let Some(processes) = document.get_mut("processes") {
            let processes = processes.as_array_mut().context(UnexpectedShapeSnafu {
                path: "processes",
                expected: "an array",
            })?;
            for net in processes.iter_mut().filter_map(|process| {
                process
                    .pointer_mut("/args2_6/net")
                    .and_then(Value::as_object_mut)
            }) {
                rename_key(net, "tls", "ssl");
            }
        }

        serde_json::from_value(value).context(DecodeSnafu)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value = serde_json::from_slice(bytes).context(DecodeSnafu)?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).context(EncodeSnafu)
    }

    /// The revision counter maintained by Ops Manager, `-1` if there is none.
    pub fn version(&self) -> i64 {
        self.extra
            .get("version")
            .and_then(Value::as_i64)
            .unwrap_or(-1)
    }

    /// Returns the untyped top-level section `key`, e.g. [`AUTH_KEY`].
    pub fn section(&self, key: &str) -> Option<&Map<String, Value>> {
        self.extra.get(key).and_then(Value::as_object)
    }

    pub fn set_section(&mut self, key: &str, section: Map<String, Value>) {
        self.extra.insert(key.to_owned(), Value::Object(section));
    }

    pub fn process(&self, name: &str) -> Option<&Process> {
        self.processes.iter().find(|process| process.name == name)
    }

    pub fn process_mut(&mut self, name: &str) -> Option<&mut Process> {
        self.processes.iter_mut().find(|process| process.name == name)
    }

    pub fn replica_set(&self, name: &str) -> Option<&ReplicaSet> {
        self.replica_sets.iter().find(|rs| rs.id == name)
    }

    pub fn replica_set_mut(&mut self, name: &str) -> Option<&mut ReplicaSet> {
        self.replica_sets.iter_mut().find(|rs| rs.id == name)
    }

    pub fn sharded_cluster(&self, name: &str) -> Option<&ShardedCluster> {
        self.sharding.iter().find(|cluster| cluster.name == name)
    }

    pub fn sharded_cluster_mut(&mut self, name: &str) -> Option<&mut ShardedCluster> {
        self.sharding.iter_mut().find(|cluster| cluster.name == name)
    }

    /// Merges a standalone process: an existing process with the same name only receives the
    /// operator-owned fields of `desired`, otherwise `desired` is added.
    pub fn merge_standalone(&mut self, desired: Process) {
        match self.process_mut(&desired.name) {
            Some(existing) => existing.merge_from(&desired),
            None => {
                tracing::debug!(process.name = %desired.name, "adding process");
                self.processes.push(desired);
            }
        }
    }

    /// Merges a replica set and its processes.
    ///
    /// When the replica set grows, new members are cloned from an existing member first, so that
    /// they inherit its externally owned settings. Members that are no longer desired are removed
    /// together with their processes and agent entries.
    #[tracing::instrument(skip_all, fields(replica_set = %desired.name()))]
    pub fn merge_replica_set(&mut self, desired: ReplicaSetWithProcesses) {
        let ReplicaSetWithProcesses {
            replica_set: desired_rs,
            processes,
        } = desired;

        if let Some(existing) = self.replica_set(&desired_rs.id) {
            if processes.len() > existing.members.len() {
                let members: Vec<String> = existing.member_names().map(ToOwned::to_owned).collect();
                self.clone_into_new_positions(&members, &processes);
            }
        }

        for process in processes {
            self.merge_standalone(process);
        }

        let removed = match self.replica_set_mut(&desired_rs.id) {
            Some(existing) => {
                let removed = existing.merge_from(&desired_rs);
                existing.limit_voting_members();
                removed
            }
            None => {
                let mut desired_rs = desired_rs;
                desired_rs.limit_voting_members();
                self.replica_sets.push(desired_rs);
                Vec::new()
            }
        };

        if !removed.is_empty() {
            tracing::info!(?removed, "removing processes that left the replica set");
            self.remove_processes(&removed);
        }
    }

    /// Adds clones of the first process of `desired` that is one of `existing` for every desired
    /// process that doesn't exist yet.
    fn clone_into_new_positions(&mut self, existing: &[String], desired: &[Process]) {
        let Some(sample) = desired
            .iter()
            .filter(|process| existing.contains(&process.name))
            .find_map(|process| self.process(&process.name))
            .cloned()
        else {
            return;
        };

        for process in desired {
            if self.process(&process.name).is_none() {
                tracing::debug!(
                    process.name = %process.name,
                    sample = %sample.name,
                    "cloning existing process into new position"
                );
                self.processes.push(sample.clone_as(&process.name));
            }
        }
    }

    /// Removes the processes and the agent entries referencing them.
    pub(crate) fn remove_processes(&mut self, names: &[String]) {
        self.remove_monitoring_and_backup(names);
        self.processes
            .retain(|process| !names.contains(&process.name));
    }

    /// Removes replica sets together with the processes of their members.
    pub(crate) fn remove_replica_sets(&mut self, names: &[String]) {
        let members: Vec<String> = self
            .replica_sets
            .iter()
            .filter(|rs| names.contains(&rs.id))
            .flat_map(ReplicaSet::member_names)
            .map(ToOwned::to_owned)
            .collect();

        self.remove_processes(&members);
        self.replica_sets.retain(|rs| !names.contains(&rs.id));
    }

    pub fn remove_replica_set_by_name(&mut self, name: &str) -> Result<()> {
        self.replica_set(name)
            .context(ReplicaSetNotFoundSnafu { name })?;
        self.remove_replica_sets(&[name.to_owned()]);
        Ok(())
    }

    pub fn remove_process_by_name(&mut self, name: &str) -> Result<()> {
        self.process(name).context(ProcessNotFoundSnafu { name })?;
        self.remove_processes(&[name.to_owned()]);
        Ok(())
    }

    /// Removes a sharded cluster, its config server and shard replica sets and its mongos
    /// processes.
    pub fn remove_sharded_cluster_by_name(&mut self, name: &str) -> Result<()> {
        let cluster = self
            .sharded_cluster(name)
            .context(ShardedClusterNotFoundSnafu { name })?
            .clone();

        self.sharding.retain(|cluster| cluster.name != name);

        let mut replica_sets = vec![cluster.config_server_replica_set.clone()];
        replica_sets.extend(cluster.shard_replica_sets().map(ToOwned::to_owned));
        replica_sets.extend(cluster.draining.iter().cloned());
        self.remove_replica_sets(&replica_sets);

        let mongos = self.mongos_process_names(name);
        self.remove_processes(&mongos);
        Ok(())
    }

    /// Makes `members` of the replica set non-voting, e.g. before scaling them down.
    pub fn mark_rs_members_unvoted(&mut self, replica_set: &str, members: &[String]) -> Result<()> {
        let rs = self
            .replica_set_mut(replica_set)
            .context(ReplicaSetNotFoundSnafu { name: replica_set })?;

        for member in members {
            rs.member_mut(member)
                .context(MemberNotFoundSnafu {
                    replica_set,
                    member,
                })?
                .demote();
        }
        Ok(())
    }

    pub fn disable_processes(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            self.process_mut(name)
                .context(ProcessNotFoundSnafu { name })?
                .disabled = Some(true);
        }
        Ok(())
    }

    /// Configures how the given processes authenticate to each other. Unknown names are skipped.
    pub fn configure_internal_cluster_authentication(
        &mut self,
        names: &[String],
        mode: Option<ClusterAuthMode>,
        cluster_file: Option<&str>,
    ) {
        for process in self
            .processes
            .iter_mut()
            .filter(|process| names.contains(&process.name))
        {
            process.configure_cluster_auth_mode(mode, cluster_file);
        }
    }

    /// The smallest major version across all processes, `0` if there are none.
    pub fn minimum_major_version(&self) -> Result<u64> {
        let mut minimum: Option<u64> = None;
        for process in &self.processes {
            let major = process.major_version().context(ProcessVersionSnafu {
                process: &process.name,
            })?;
            minimum = Some(minimum.map_or(major, |minimum| minimum.min(major)));
        }
        Ok(minimum.unwrap_or_default())
    }

    pub fn all_processes_are_tls_enabled(&self) -> bool {
        self.processes.iter().all(Process::is_tls_enabled)
    }

    pub fn all_process_names(&self) -> Vec<String> {
        self.processes
            .iter()
            .map(|process| process.name.clone())
            .collect()
    }

    /// Names of all processes that make up the resource `name` of the given kind.
    pub fn process_names(&self, kind: ResourceKind, name: &str) -> Vec<String> {
        match kind {
            ResourceKind::Standalone => self
                .process(name)
                .map(|process| vec![process.name.clone()])
                .unwrap_or_default(),
            ResourceKind::ReplicaSet => self.replica_set_member_names(name),
            ResourceKind::ShardedCluster => {
                let Some(cluster) = self.sharded_cluster(name) else {
                    return Vec::new();
                };
                let mut names = self.mongos_process_names(name);
                names.extend(self.replica_set_member_names(&cluster.config_server_replica_set));
                for shard in cluster.shard_replica_sets() {
                    names.extend(self.replica_set_member_names(shard));
                }
                names
            }
        }
    }

    /// Counts the processes that don't belong to the resource `name`.
    ///
    /// Processes of shards that are still draining belong to the sharded cluster.
    pub fn number_of_excess_processes(&self, name: &str) -> usize {
        let mut owned = self.process_names(ResourceKind::ShardedCluster, name);
        if owned.is_empty() {
            owned = self.process_names(ResourceKind::ReplicaSet, name);
        }
        if owned.is_empty() {
            owned = self.process_names(ResourceKind::Standalone, name);
        }
        for replica_set in self.replica_sets_removed_from_sharded_cluster(name) {
            owned.extend(self.replica_set_member_names(&replica_set));
        }

        self.processes.len().saturating_sub(owned.len())
    }

    fn replica_set_member_names(&self, name: &str) -> Vec<String> {
        self.replica_set(name)
            .map(|rs| rs.member_names().map(ToOwned::to_owned).collect())
            .unwrap_or_default()
    }

    /// Replica sets following the shard naming scheme of the cluster that the cluster doesn't
    /// reference anymore.
    pub fn replica_sets_removed_from_sharded_cluster(&self, name: &str) -> Vec<String> {
        let Some(cluster) = self.sharded_cluster(name) else {
            return Vec::new();
        };
        let pattern = shard_name_pattern(name);

        self.replica_sets
            .iter()
            .map(|rs| rs.id.as_str())
            .filter(|rs| pattern.is_match(rs) && !cluster.references(rs))
            .map(ToOwned::to_owned)
            .collect()
    }

    /// Whether the TLS section requires client certificates, i.e. the agents need them too.
    pub fn client_certificates_required(&self) -> bool {
        self.section(TLS_KEY)
            .and_then(|tls| get_path(tls, &["clientCertificateMode"]))
            .and_then(Value::as_str)
            == Some("REQUIRE")
    }
}

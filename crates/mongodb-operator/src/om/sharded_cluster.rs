use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardedCluster {
    pub name: String,

    #[serde(rename = "configServerReplica")]
    pub config_server_replica_set: String,

    #[serde(default)]
    pub shards: Vec<Shard>,

    /// Shards that were removed from the cluster, but whose data is still being migrated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub draining: Vec<String>,

    /// `collections`, `tags`, `managedSharding` and whatever else the UI maintains.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    #[serde(rename = "_id")]
    pub id: String,

    /// Name of the replica set backing the shard.
    pub rs: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ShardedCluster {
    pub fn new<'a>(
        name: impl Into<String>,
        config_server_replica_set: impl Into<String>,
        shard_replica_sets: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let shards = shard_replica_sets
            .into_iter()
            .map(|rs| Shard {
                id: rs.to_owned(),
                rs: rs.to_owned(),
                extra: Map::new(),
            })
            .collect();

        Self {
            name: name.into(),
            config_server_replica_set: config_server_replica_set.into(),
            shards,
            draining: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn shard_replica_sets(&self) -> impl Iterator<Item = &str> {
        self.shards.iter().map(|shard| shard.rs.as_str())
    }

    /// Whether `replica_set` is referenced by this cluster, as shard or as config server.
    pub fn references(&self, replica_set: &str) -> bool {
        self.config_server_replica_set == replica_set
            || self.shard_replica_sets().any(|rs| rs == replica_set)
    }

    /// Merges name, config server and shard list of `desired` into this cluster.
    ///
    /// Shards are matched by `_id` and keep their unmanaged settings (such as zone tags). The
    /// draining list is left alone.
    pub fn merge_from(&mut self, desired: &Self) {
        self.name.clone_from(&desired.name);
        self.config_server_replica_set
            .clone_from(&desired.config_server_replica_set);

        let mut existing: IndexMap<String, Shard> = std::mem::take(&mut self.shards)
            .into_iter()
            .map(|shard| (shard.id.clone(), shard))
            .collect();

        let mut merged: Vec<_> = desired
            .shards
            .iter()
            .map(|desired_shard| match existing.shift_remove(&desired_shard.id) {
                Some(mut shard) => {
                    shard.rs.clone_from(&desired_shard.rs);
                    shard
                }
                None => desired_shard.clone(),
            })
            .collect();
        merged.sort_by(|a, b| a.id.cmp(&b.id));
        self.shards = merged;
    }

    pub fn add_to_draining(&mut self, replica_sets: &[String]) {
        for replica_set in replica_sets {
            if !self.draining.contains(replica_set) {
                self.draining.push(replica_set.clone());
            }
        }
    }

    pub fn remove_draining(&mut self) {
        self.draining.clear();
    }

    /// Matches the replica set names this cluster generates for its shards, `<cluster>-<index>`.
    pub fn shard_name_pattern(&self) -> Regex {
        shard_name_pattern(&self.name)
    }
}

pub(crate) fn shard_name_pattern(cluster_name: &str) -> Regex {
    Regex::new(&format!("^{}-[0-9]+$", regex::escape(cluster_name)))
        .expect("failed to compile shard name regex")
}
